//! Connection lifecycle: DISCONNECTED -> WAITING -> CONNECTED and back.
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::StatusListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Waiting,
    Connected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Waiting)
                | (Waiting, Connected)
                | (Connected, Waiting)
                | (Waiting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Waiting => "WAITING",
            ConnectionState::Connected => "CONNECTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Invalid connection transition {from} -> {to}")]
    InvalidTransition { from: ConnectionState, to: ConnectionState },
}

/// Holds the connection state and notifies the listener on every effective change.
pub struct ConnectionStateMachine {
    tx: watch::Sender<ConnectionState>,
    listener: Mutex<Option<Arc<dyn StatusListener>>>,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, listener: Mutex::new(None) }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn StatusListener>>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    /// Move to `next`. Returns `Ok(false)` for a same-state no-op.
    pub fn transition(&self, next: ConnectionState) -> Result<bool, StateError> {
        let mut outcome = Ok(false);
        self.tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                outcome = Err(StateError::InvalidTransition { from: *state, to: next });
                return false;
            }
            log::info!("Connection state {} -> {}", state, next);
            *state = next;
            outcome = Ok(true);
            true
        });

        if let Ok(true) = outcome {
            let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(listener) = listener {
                listener.on_status(next);
            }
        }
        outcome
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
