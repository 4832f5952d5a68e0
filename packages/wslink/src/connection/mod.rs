//! Connection module
//!
//! This module owns the single WebSocket connection: its state machine,
//! the transport seam, frame decoding and the subscriber streams.

pub mod codec;
pub mod manager;
pub mod protocol;
pub mod state;
pub mod stream;
pub mod transport;
