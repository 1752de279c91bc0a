//! Connection layer: transport seam, reconnect schedule, shared lifecycle

mod backoff;
mod manager;
mod transport;

pub use backoff::Backoff;
pub use manager::{ConnectionListener, ConnectionManager, Consumer};
pub use transport::{
    Connector, FrameSink, FrameStream, Transport, WireMessage, WsConnector, INTENTIONAL_CLOSE_CODE,
};
