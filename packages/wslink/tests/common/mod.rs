//! Scripted in-memory transport for driving the connection manager in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{sink, stream};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use wslink::{Inbound, Outbound, Socket, Transport, TransportError};

/// How long a test waits for an expected event
pub const WAIT: Duration = Duration::from_secs(2);

/// The far end of one `open()` call
pub struct Peer {
    pub address: String,
    accept: Option<oneshot::Sender<Result<(), TransportError>>>,
    pub inbound: mpsc::UnboundedSender<Result<Inbound, TransportError>>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl Peer {
    /// Complete the handshake
    pub fn accept(&mut self) {
        if let Some(accept) = self.accept.take() {
            let _ = accept.send(Ok(()));
        }
    }

    /// Fail the handshake
    pub fn reject(&mut self, error: TransportError) {
        if let Some(accept) = self.accept.take() {
            let _ = accept.send(Err(error));
        }
    }

    pub fn text(&self, text: &str) {
        self.inbound
            .send(Ok(Inbound::Text(text.to_string())))
            .expect("connection task gone");
    }

    pub fn binary(&self, data: &[u8]) {
        self.inbound
            .send(Ok(Inbound::Binary(data.to_vec())))
            .expect("connection task gone");
    }

    /// Drop the peer's sending side; the client sees the stream end
    pub fn hang_up(&mut self) {
        let (closed, _) = mpsc::unbounded_channel();
        self.inbound = closed;
    }

    /// Next frame the client sent, `None` once the client side is gone
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        within(self.outbound.recv()).await
    }
}

/// Transport that hands every connection attempt to the test as a [`Peer`]
pub struct ScriptedTransport {
    peers: mpsc::UnboundedSender<Peer>,
}

impl ScriptedTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, address: &str) -> Result<Socket, TransportError> {
        let (accept_tx, accept_rx) = oneshot::channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        self.peers
            .send(Peer {
                address: address.to_string(),
                accept: Some(accept_tx),
                inbound: inbound_tx,
                outbound: outbound_rx,
            })
            .map_err(|_| TransportError::Connect("test dropped the peer queue".to_string()))?;

        accept_rx
            .await
            .map_err(|_| TransportError::Connect("peer dropped".to_string()))??;

        let frames = stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        let sent = sink::unfold(outbound_tx, |tx, frame: Outbound| async move {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });

        Ok(Socket::new(sent, frames))
    }
}

/// Await `future`, failing the test if it takes longer than [`WAIT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting for event")
}
