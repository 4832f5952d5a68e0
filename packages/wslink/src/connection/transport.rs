//! Transport Seam
//!
//! The manager never touches a socket library directly. It asks a
//! [`Transport`] for a [`Socket`], which is a frame sink plus a frame stream.

use async_trait::async_trait;
use futures_util::future;
use futures_util::sink::Sink;
use futures_util::stream::{BoxStream, Stream};
use futures_util::{SinkExt, StreamExt};
use std::pin::Pin;
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace};

use crate::connection::protocol::{CloseInfo, Inbound, Outbound};

/// Transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection could not be established
    #[error("Connection error: {0}")]
    Connect(String),

    /// Protocol error reported by the WebSocket library
    #[error("Protocol error: {0}")]
    Protocol(#[from] tungstenite::Error),

    /// The connection attempt did not finish in time
    #[error("Connection timed out")]
    Timeout,

    /// The socket is gone
    #[error("Connection closed")]
    Closed,
}

/// Outgoing half of a socket
pub type FrameSink = Pin<Box<dyn Sink<Outbound, Error = TransportError> + Send>>;

/// Incoming half of a socket
pub type FrameStream = BoxStream<'static, Result<Inbound, TransportError>>;

/// An established connection, split into its two directions
pub struct Socket {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Socket {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Outbound, Error = TransportError> + Send + 'static,
        St: Stream<Item = Result<Inbound, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        }
    }
}

/// Opens sockets on behalf of the connection manager
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a connection to `address`. Resolves once the handshake is done.
    async fn open(&self, address: &str) -> Result<Socket, TransportError>;
}

/// WebSocket transport backed by tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn open(&self, address: &str) -> Result<Socket, TransportError> {
        let (ws_stream, response) = connect_async(address).await?;
        debug!(status = %response.status(), "WebSocket handshake completed");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(TransportError::from)
            .with(|frame: Outbound| future::ready(Ok::<_, TransportError>(to_message(frame))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(message) => from_message(message).map(Ok),
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

        Ok(Socket::new(sink, stream))
    }
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Close(info) => Message::Close(Some(CloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

/// Map a library message to an inbound frame. Control frames are handled by
/// tungstenite itself and yield `None`.
fn from_message(message: Message) -> Option<Inbound> {
    match message {
        Message::Text(text) => Some(Inbound::Text(text)),
        Message::Binary(data) => Some(Inbound::Binary(data)),
        Message::Close(frame) => Some(Inbound::Close(frame.map(|frame| CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        }))),
        Message::Ping(_) | Message::Pong(_) => {
            trace!("Control frame handled by transport");
            None
        }
        Message::Frame(_) => None,
    }
}
