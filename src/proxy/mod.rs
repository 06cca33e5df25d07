//! Request admission, upstream dispatch and streaming relay

pub mod dispatch;
pub mod handler;
pub mod relay;
pub mod request;
pub mod response;
mod server;

pub use handler::ProxyHandler;
pub use request::ProxyParams;
pub use response::{error_response, BoxError, ProxyBody};
pub use server::ProxyServer;
