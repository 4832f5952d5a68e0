//! Connection State Machine
//!
//! Provides the connection state enum and the bookkeeping that validates
//! transitions and keeps a short history of them.

use chrono::{DateTime, Utc};

/// Maximum number of transitions kept in the history
const MAX_TRANSITIONS: usize = 100;

/// Represents the possible states of the managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No live connection; sends are refused
    Closed,
    /// A connection handle exists but the handshake has not completed
    Connecting,
    /// The connection is established and sends are permitted
    Open,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Open => write!(f, "OPEN"),
        }
    }
}

/// State transition information
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Current state plus transition history.
///
/// Not synchronized on its own; the manager keeps it behind its lock.
#[derive(Debug)]
pub(crate) struct StateMachine {
    current: ConnectionState,
    connection_attempts: u32,
    transitions: Vec<StateTransition>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        Self {
            current: ConnectionState::Closed,
            connection_attempts: 0,
            transitions: Vec::new(),
        }
    }

    pub(crate) fn current(&self) -> ConnectionState {
        self.current
    }

    pub(crate) fn connection_attempts(&self) -> u32 {
        self.connection_attempts
    }

    /// Move to `to`. Returns `true` only when the state actually changed.
    pub(crate) fn transition_to(&mut self, to: ConnectionState, reason: &str) -> bool {
        let from = self.current;
        if from == to || !is_valid_transition(from, to) {
            return false;
        }

        self.current = to;
        match to {
            ConnectionState::Connecting => self.connection_attempts += 1,
            ConnectionState::Open => self.connection_attempts = 0,
            ConnectionState::Closed => {}
        }

        self.transitions.push(StateTransition {
            from,
            to,
            timestamp: Utc::now(),
            reason: Some(reason.to_string()),
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            self.transitions.remove(0);
        }

        tracing::info!(
            from = %from,
            to = %to,
            attempts = self.connection_attempts,
            reason,
            "Connection state transition"
        );

        true
    }

    /// Most recent transitions, newest first
    pub(crate) fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        self.transitions.iter().rev().take(count).cloned().collect()
    }
}

/// Check if a state transition is one of the allowed edges
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    matches!(
        (from, to),
        (ConnectionState::Closed, ConnectionState::Connecting)
            | (ConnectionState::Connecting, ConnectionState::Open)
            | (ConnectionState::Connecting, ConnectionState::Closed)
            | (ConnectionState::Open, ConnectionState::Closed)
    )
}
