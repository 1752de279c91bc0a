//! Transport seam between the connection manager and the network
//!
//! The manager only sees a sink of [`WireMessage`]s and a stream of inbound
//! text frames. [`WsConnector`] provides them over tokio-tungstenite; tests
//! substitute an in-memory connector.

use std::pin::Pin;

use costlink_common::{Error, Result};
use futures::future::{self, BoxFuture};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Close code sent when the last consumer detaches (normal closure)
pub const INTENTIONAL_CLOSE_CODE: u16 = 1000;

/// Outbound transport message
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Close { code: u16, reason: String },
}

/// Outbound half of an open transport
pub type FrameSink = Pin<Box<dyn Sink<WireMessage, Error = Error> + Send>>;

/// Inbound half of an open transport; ends when the peer closes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// An open bidirectional transport
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens transports to an endpoint
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport>>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect(&self, url: &str) -> BoxFuture<'static, Result<Transport>> {
        let url = url.to_string();
        async move {
            let (ws_stream, _response) = connect_async(url.as_str())
                .await
                .map_err(|e| Error::Transport(format!("connect {}: {}", url, e)))?;
            let (write, read) = ws_stream.split();

            let sink = write
                .sink_map_err(|e| Error::Transport(e.to_string()))
                .with(|message: WireMessage| future::ready(Ok::<_, Error>(into_ws_message(message))));

            let stream = read.filter_map(|item| {
                future::ready(match item {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    // tungstenite answers pings itself; close frames end the stream
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Peer sent close frame");
                        None
                    }
                    Ok(Message::Binary(bytes)) => {
                        debug!(len = bytes.len(), "Ignoring binary frame");
                        None
                    }
                    Err(e) => Some(Err(Error::Transport(e.to_string()))),
                })
            });

            Ok(Transport {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }
}

fn into_ws_message(message: WireMessage) -> Message {
    match message {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}
