pub mod config;
pub mod error;
pub mod http;
pub mod records;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use crate::http::{BodyFraming, RequestHeader, ResponseHeader};
pub use records::{RecordValue, RecordsStore};
