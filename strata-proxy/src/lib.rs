pub mod background;
pub mod connection;
pub mod metrics;
pub mod resolver;
pub mod server_session;
pub mod session;
pub mod sm;
pub mod transform;
pub mod tunnel;
pub mod txn;
pub mod vc_table;
pub mod worker;

pub use session::ClientSession;
pub use sm::HttpSM;
pub use txn::{ConnectResult, HookInvocation, OriginConnector, ProcessCtx, TxnCtx};
pub use vc_table::{VcEntry, VcRole, VcTable};
