//! wslink Library
//!
//! This crate provides a single-connection WebSocket manager that publishes
//! its lifecycle as a status stream and fans inbound frames out as raw text
//! and decoded JSON values.

pub mod cli;
pub mod connection;

// Re-exports for convenience
pub use cli::config::Config;
pub use connection::codec::{decode, DecodeMode};
pub use connection::manager::{ConnectionManager, ConnectionManagerBuilder, ManagerOptions};
pub use connection::protocol::{CloseInfo, Inbound, Outbound, Payload};
pub use connection::state::{ConnectionState, StateTransition};
pub use connection::stream::{MessageStream, StatusStream};
pub use connection::transport::{Socket, Transport, TransportError, TungsteniteTransport};
