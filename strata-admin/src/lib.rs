pub mod handlers;
pub mod rpc;
pub mod server;

pub use handlers::{AdminState, build_dispatcher};
pub use rpc::{RpcDispatcher, RpcError, codes};
