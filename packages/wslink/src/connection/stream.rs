//! Subscriber Streams
//!
//! Receivers handed out by the connection manager. Each one ends (`None`)
//! once the manager is disposed.

use futures_util::stream::{self, Stream};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::connection::state::ConnectionState;

/// Current-value stream of connection states.
///
/// The first item is the state at subscription time, followed by every
/// later change.
#[derive(Debug)]
pub struct StatusStream {
    pending: Option<ConnectionState>,
    rx: Option<broadcast::Receiver<ConnectionState>>,
}

impl StatusStream {
    pub(crate) fn new(current: ConnectionState, rx: broadcast::Receiver<ConnectionState>) -> Self {
        Self {
            pending: Some(current),
            rx: Some(rx),
        }
    }

    pub(crate) fn completed() -> Self {
        Self {
            pending: None,
            rx: None,
        }
    }

    /// Wait for the next state. `None` once the manager is disposed.
    pub async fn next(&mut self) -> Option<ConnectionState> {
        if let Some(state) = self.pending.take() {
            return Some(state);
        }
        next_value(&mut self.rx, "status").await
    }

    /// Take the next state if one is already available
    pub fn try_next(&mut self) -> Option<ConnectionState> {
        if let Some(state) = self.pending.take() {
            return Some(state);
        }
        try_next_value(&mut self.rx, "status")
    }

    /// Adapt into a `futures` stream
    pub fn into_stream(self) -> impl Stream<Item = ConnectionState> + Send + Unpin {
        Box::pin(stream::unfold(self, |mut this| async move {
            this.next().await.map(|state| (state, this))
        }))
    }
}

/// Multicast stream of inbound messages. No replay of values published
/// before the subscription.
#[derive(Debug)]
pub struct MessageStream<T> {
    rx: Option<broadcast::Receiver<T>>,
    kind: &'static str,
}

impl<T: Clone + Send + 'static> MessageStream<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>, kind: &'static str) -> Self {
        Self { rx: Some(rx), kind }
    }

    pub(crate) fn completed(kind: &'static str) -> Self {
        Self { rx: None, kind }
    }

    /// Wait for the next message. `None` once the manager is disposed.
    pub async fn next(&mut self) -> Option<T> {
        next_value(&mut self.rx, self.kind).await
    }

    /// Take the next message if one is already available
    pub fn try_next(&mut self) -> Option<T> {
        try_next_value(&mut self.rx, self.kind)
    }

    /// Adapt into a `futures` stream
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + Unpin {
        Box::pin(stream::unfold(self, |mut this| async move {
            this.next().await.map(|message| (message, this))
        }))
    }
}

async fn next_value<T: Clone>(slot: &mut Option<broadcast::Receiver<T>>, kind: &str) -> Option<T> {
    let rx = slot.as_mut()?;
    loop {
        match rx.recv().await {
            Ok(value) => return Some(value),
            Err(RecvError::Lagged(skipped)) => {
                warn!(stream = kind, skipped, "Subscriber lagged behind, messages skipped");
            }
            Err(RecvError::Closed) => {
                *slot = None;
                return None;
            }
        }
    }
}

fn try_next_value<T: Clone>(slot: &mut Option<broadcast::Receiver<T>>, kind: &str) -> Option<T> {
    let rx = slot.as_mut()?;
    loop {
        match rx.try_recv() {
            Ok(value) => return Some(value),
            Err(TryRecvError::Lagged(skipped)) => {
                warn!(stream = kind, skipped, "Subscriber lagged behind, messages skipped");
            }
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => {
                *slot = None;
                return None;
            }
        }
    }
}
