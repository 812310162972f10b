//! Transport boundary: driver management, supervision, inbound pipeline.

mod handler;
mod manager;
mod subprocess;

pub use handler::InboundHandler;
pub use manager::{ControlState, GatewayHandle, GatewayManager, MessageHandler, SendError};
pub use subprocess::SubprocessGateway;
