//! Connection Manager
//!
//! Owns at most one live socket, publishes its lifecycle on the status
//! stream and fans inbound frames out to the raw and decoded streams.
//!
//! Socket events from the per-connection task are funnelled through
//! [`Shared::on_event`]; all state lives behind one lock.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::connection::codec::{self, DecodeMode};
use crate::connection::protocol::{CloseInfo, Inbound, Outbound, Payload};
use crate::connection::state::{ConnectionState, StateMachine, StateTransition};
use crate::connection::stream::{MessageStream, StatusStream};
use crate::connection::transport::{
    FrameStream, Socket, Transport, TransportError, TungsteniteTransport,
};

/// Tunables for a [`ConnectionManager`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Upper bound for establishing a connection
    pub connect_timeout: Duration,
    /// How long to wait for the peer to finish the closing handshake
    pub close_timeout: Duration,
    /// Reason sent with the normal-closure frame
    pub close_reason: String,
    /// Buffer size of each broadcast stream
    pub channel_capacity: usize,
    /// How inbound text is decoded
    pub decode_mode: DecodeMode,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            close_reason: "Client closing".to_string(),
            channel_capacity: 256,
            decode_mode: DecodeMode::default(),
        }
    }
}

/// Events reported by a connection task
#[derive(Debug)]
enum SocketEvent {
    Opened,
    Frame(String),
    Error(TransportError),
    Closed(Option<CloseInfo>),
}

/// Publishing side of the three streams. Dropped on disposal.
struct Channels {
    status: broadcast::Sender<ConnectionState>,
    raw: broadcast::Sender<String>,
    decoded: broadcast::Sender<Value>,
}

/// The live socket as seen from the manager
struct ConnectionHandle {
    id: Uuid,
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

struct Inner {
    machine: StateMachine,
    handle: Option<ConnectionHandle>,
    generation: u64,
    channels: Option<Channels>,
    /// Tasks still finishing a closing handshake
    closing: Vec<JoinHandle<()>>,
}

impl Inner {
    fn set_state(&mut self, to: ConnectionState, reason: &str) {
        if self.machine.transition_to(to, reason) {
            if let Some(channels) = &self.channels {
                let _ = channels.status.send(to);
            }
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| handle.generation == generation)
    }

    /// Drop the current handle and move to `Closed`.
    ///
    /// An open socket gets a normal-closure frame; a pending one is abandoned.
    fn release(&mut self, close_reason: &str, reason: &str) {
        if let Some(handle) = self.handle.take() {
            if self.machine.current() == ConnectionState::Open {
                let frame = Outbound::Close(CloseInfo::normal(close_reason));
                if handle.outbound.send(frame).is_err() {
                    debug!(connection_id = %handle.id, "Connection task already stopped");
                }
                self.closing.retain(|task| !task.is_finished());
                self.closing.push(handle.task);
            } else {
                debug!(connection_id = %handle.id, "Abandoning pending connection");
                handle.task.abort();
            }
        }
        self.set_state(ConnectionState::Closed, reason);
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    options: ManagerOptions,
    inner: Mutex<Inner>,
    dropped_sends: AtomicU64,
}

impl Shared {
    /// Single entry point for everything a connection task reports
    fn on_event(&self, generation: u64, event: SocketEvent) {
        match event {
            SocketEvent::Opened => {
                let mut inner = self.inner.lock();
                if inner.is_live(generation) {
                    inner.set_state(ConnectionState::Open, "Connection established");
                }
            }
            SocketEvent::Frame(text) => {
                let decoded = codec::decode(&text, self.options.decode_mode);
                let inner = self.inner.lock();
                if !inner.is_live(generation) {
                    debug!("Dropping frame from released connection");
                    return;
                }
                if let Some(channels) = &inner.channels {
                    let _ = channels.raw.send(text);
                    if let Some(value) = decoded {
                        let _ = channels.decoded.send(value);
                    }
                }
            }
            SocketEvent::Error(e) => {
                error!(error = %e, "WebSocket error");
            }
            SocketEvent::Closed(frame) => {
                let mut inner = self.inner.lock();
                if inner.is_live(generation) {
                    inner.handle = None;
                    let reason = match &frame {
                        Some(info) => format!("Closed by peer ({}: {})", info.code, info.reason),
                        None => "Connection closed".to_string(),
                    };
                    inner.set_state(ConnectionState::Closed, &reason);
                }
            }
        }
    }
}

/// Single-connection WebSocket manager.
///
/// Cheap to clone; all clones share one connection and one set of streams.
/// Construct it once at startup, pass it to whoever needs it and call
/// [`ConnectionManager::dispose`] once at shutdown.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Manager over the tungstenite transport with default options
    pub fn new() -> Self {
        ConnectionManagerBuilder::new(Arc::new(TungsteniteTransport)).build()
    }

    /// Start building a manager over a custom transport
    pub fn builder(transport: Arc<dyn Transport>) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::new(transport)
    }

    /// Open a connection to `address`, replacing any existing one.
    ///
    /// Must be called from within a Tokio runtime; otherwise the call is
    /// logged and ignored.
    pub fn connect(&self, address: &str) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(address, error = %e, "No async runtime available, cannot connect");
                return;
            }
        };

        let mut inner = self.shared.inner.lock();
        if inner.channels.is_none() {
            warn!(address, "Connection manager disposed, ignoring connect");
            return;
        }

        inner.release(&self.shared.options.close_reason, "Superseded by new connection");

        inner.generation += 1;
        let generation = inner.generation;
        let id = Uuid::new_v4();
        inner.set_state(ConnectionState::Connecting, "Initiating connection");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let span = info_span!("connection", connection_id = %id, address);
        let task = runtime.spawn(
            run_connection(
                self.shared.clone(),
                generation,
                address.to_string(),
                outbound_rx,
            )
            .instrument(span),
        );

        inner.handle = Some(ConnectionHandle {
            id,
            generation,
            outbound: outbound_tx,
            task,
        });
    }

    /// Transmit a payload if the connection is open; otherwise log and drop it.
    pub fn send(&self, payload: impl Into<Payload>) {
        let payload = payload.into();
        let inner = self.shared.inner.lock();

        let state = inner.machine.current();
        let handle = match &inner.handle {
            Some(handle) if state == ConnectionState::Open => handle,
            _ => {
                self.shared.dropped_sends.fetch_add(1, Ordering::Relaxed);
                warn!(state = %state, payload = %payload, "WebSocket not open, message dropped");
                return;
            }
        };

        let text = match payload.into_text() {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Failed to serialize payload");
                return;
            }
        };

        if handle.outbound.send(Outbound::Text(text)).is_err() {
            warn!(connection_id = %handle.id, "Connection task stopped, message not sent");
        }
    }

    /// Serialize `value` and send it as a structured payload
    pub fn send_json<T: Serialize>(&self, value: &T) {
        match Payload::structured(value) {
            Ok(payload) => self.send(payload),
            Err(e) => error!(error = %e, "Failed to serialize payload"),
        }
    }

    /// Close the current connection. The state becomes `Closed` immediately.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock();
        inner.release(&self.shared.options.close_reason, "Closed by client");
    }

    /// Close the connection and complete every stream. Idempotent.
    pub fn dispose(&self) {
        let mut inner = self.shared.inner.lock();
        if inner.channels.is_none() {
            debug!("Connection manager already disposed");
            return;
        }
        inner.release(&self.shared.options.close_reason, "Manager disposed");
        inner.channels = None;
        info!("Connection manager disposed");
    }

    /// Dispose, then wait until released sockets finish their closing
    /// handshake. Use before the runtime goes away.
    pub async fn shutdown(&self) {
        self.dispose();
        let closing = std::mem::take(&mut self.shared.inner.lock().closing);
        for task in closing {
            if let Err(e) = task.await {
                debug!(error = %e, "Connection task did not finish cleanly");
            }
        }
    }

    /// Subscribe to state changes, starting with the current state
    pub fn status(&self) -> StatusStream {
        let inner = self.shared.inner.lock();
        match &inner.channels {
            Some(channels) => StatusStream::new(inner.machine.current(), channels.status.subscribe()),
            None => StatusStream::completed(),
        }
    }

    /// Subscribe to every inbound frame as text
    pub fn raw_messages(&self) -> MessageStream<String> {
        let inner = self.shared.inner.lock();
        match &inner.channels {
            Some(channels) => MessageStream::new(channels.raw.subscribe(), "raw"),
            None => MessageStream::completed("raw"),
        }
    }

    /// Subscribe to inbound frames that decoded to a structured value
    pub fn decoded_messages(&self) -> MessageStream<Value> {
        let inner = self.shared.inner.lock();
        match &inner.channels {
            Some(channels) => MessageStream::new(channels.decoded.subscribe(), "decoded"),
            None => MessageStream::completed("decoded"),
        }
    }

    /// Get the current state
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().machine.current()
    }

    /// Check if sends are currently permitted
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Check if [`ConnectionManager::dispose`] has run
    pub fn is_disposed(&self) -> bool {
        self.shared.inner.lock().channels.is_none()
    }

    /// Get recent state transitions, newest first
    pub fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        self.shared.inner.lock().machine.recent_transitions(count)
    }

    /// Number of connects since the connection was last open
    pub fn connection_attempts(&self) -> u32 {
        self.shared.inner.lock().machine.connection_attempts()
    }

    /// Number of sends dropped because the connection was not open
    pub fn dropped_sends(&self) -> u64 {
        self.shared.dropped_sends.load(Ordering::Relaxed)
    }

    /// Options this manager was built with
    pub fn options(&self) -> &ManagerOptions {
        &self.shared.options
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive one socket from handshake to teardown
async fn run_connection(
    shared: Arc<Shared>,
    generation: u64,
    address: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    info!("Connecting");

    let opened = timeout(shared.options.connect_timeout, shared.transport.open(&address)).await;
    let Socket {
        mut sink,
        mut stream,
    } = match opened {
        Ok(Ok(socket)) => socket,
        Ok(Err(e)) => {
            shared.on_event(generation, SocketEvent::Error(e));
            shared.on_event(generation, SocketEvent::Closed(None));
            return;
        }
        Err(_) => {
            shared.on_event(generation, SocketEvent::Error(TransportError::Timeout));
            shared.on_event(generation, SocketEvent::Closed(None));
            return;
        }
    };

    info!("WebSocket connection established");
    shared.on_event(generation, SocketEvent::Opened);

    let peer_close = loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Inbound::Close(info))) => {
                        info!(?info, "Received close frame");
                        break info;
                    }
                    Some(Ok(frame)) => {
                        if let Some(text) = frame.into_text() {
                            shared.on_event(generation, SocketEvent::Frame(text));
                        }
                    }
                    Some(Err(e)) => {
                        shared.on_event(generation, SocketEvent::Error(e));
                        break None;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        break None;
                    }
                }
            }

            command = outbound.recv() => {
                match command {
                    Some(Outbound::Text(text)) => {
                        debug!(bytes = text.len(), "Sending message");
                        if let Err(e) = sink.send(Outbound::Text(text)).await {
                            shared.on_event(generation, SocketEvent::Error(e));
                            break None;
                        }
                    }
                    Some(Outbound::Close(info)) => {
                        info!(code = info.code, reason = %info.reason, "Sending close frame");
                        if let Err(e) = sink.send(Outbound::Close(info)).await {
                            debug!(error = %e, "Close frame not delivered");
                        } else {
                            finish_closing(&mut stream, shared.options.close_timeout).await;
                        }
                        break None;
                    }
                    None => {
                        debug!("Connection handle released");
                        break None;
                    }
                }
            }
        }
    };

    if timeout(shared.options.close_timeout, sink.close()).await.is_err() {
        debug!("Timed out flushing socket on shutdown");
    }
    shared.on_event(generation, SocketEvent::Closed(peer_close));
}

/// Read until the peer acknowledges the close or `limit` elapses
async fn finish_closing(stream: &mut FrameStream, limit: Duration) {
    let drained = timeout(limit, async {
        while let Some(Ok(frame)) = stream.next().await {
            if matches!(frame, Inbound::Close(_)) {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!(timeout_ms = limit.as_millis() as u64, "Peer did not complete closing handshake");
    }
}

/// Builder for ConnectionManager
pub struct ConnectionManagerBuilder {
    transport: Arc<dyn Transport>,
    options: ManagerOptions,
}

impl ConnectionManagerBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            options: ManagerOptions::default(),
        }
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.options.close_timeout = timeout;
        self
    }

    pub fn close_reason(mut self, reason: impl Into<String>) -> Self {
        self.options.close_reason = reason.into();
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.options.channel_capacity = capacity.max(1);
        self
    }

    pub fn decode_mode(mut self, mode: DecodeMode) -> Self {
        self.options.decode_mode = mode;
        self
    }

    pub fn build(self) -> ConnectionManager {
        let capacity = self.options.channel_capacity.max(1);
        let (status, _) = broadcast::channel(capacity);
        let (raw, _) = broadcast::channel(capacity);
        let (decoded, _) = broadcast::channel(capacity);

        ConnectionManager {
            shared: Arc::new(Shared {
                transport: self.transport,
                options: self.options,
                inner: Mutex::new(Inner {
                    machine: StateMachine::new(),
                    handle: None,
                    generation: 0,
                    channels: Some(Channels {
                        status,
                        raw,
                        decoded,
                    }),
                    closing: Vec::new(),
                }),
                dropped_sends: AtomicU64::new(0),
            }),
        }
    }
}
