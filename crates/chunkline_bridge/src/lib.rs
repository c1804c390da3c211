mod http;
mod in_process;

pub use http::{BridgeError, HttpTransport};
pub use in_process::InProcessTransport;
