//! Maps transport status codes to a recovery action.
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::transport::GattStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Benign,
    Permission,
    Transient,
    Fatal,
}

impl ErrorClass {
    pub fn classify(status: GattStatus) -> Self {
        match status.0 {
            0 => ErrorClass::Benign,
            2 | 3 | 5 | 13 | 15 => ErrorClass::Permission,
            8 | 133 => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Proceed,
    /// Fail the current exchange, keep the link.
    SurfaceError,
    Reconnect,
    Close,
}

const NO_CHOICE: u8 = 0;
const CHOSE_OFF: u8 = 1;
const CHOSE_ON: u8 = 2;

/// Reconnect intent plus the single-attempt guard.
///
/// A caller's explicit choice outlives individual connections; the
/// configured default only applies while no choice was made.
#[derive(Debug, Default)]
pub struct RetryIntent {
    enabled: AtomicBool,
    choice: AtomicU8,
    reconnecting: AtomicBool,
}

impl RetryIntent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current-link intent only. The next [`seed`](Self::seed) overrides it.
    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Record the caller's choice and apply it right away.
    pub fn choose(&self, enabled: bool) {
        self.choice.store(if enabled { CHOSE_ON } else { CHOSE_OFF }, Ordering::SeqCst);
        self.set(enabled);
    }

    /// The caller's explicit choice, if any.
    pub fn chosen(&self) -> Option<bool> {
        match self.choice.load(Ordering::SeqCst) {
            CHOSE_ON => Some(true),
            CHOSE_OFF => Some(false),
            _ => None,
        }
    }

    /// Arm intent for a new connection: the caller's choice, else `default`.
    pub fn seed(&self, default: bool) {
        self.set(self.chosen().unwrap_or(default));
        self.finish_attempt();
    }

    pub fn is_set(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// The reconnect attempt finished, one way or the other.
    pub fn finish_attempt(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Decide what to do about a non-success status. A transient error only
    /// reconnects when intent is set and no attempt is already in flight.
    pub fn decide(&self, status: GattStatus) -> Recovery {
        match ErrorClass::classify(status) {
            ErrorClass::Benign => Recovery::Proceed,
            ErrorClass::Permission => Recovery::SurfaceError,
            ErrorClass::Transient => {
                if !self.is_set() {
                    return Recovery::Close;
                }
                match self.reconnecting.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst) {
                    Ok(_) => Recovery::Reconnect,
                    Err(_) => {
                        self.finish_attempt();
                        Recovery::Close
                    }
                }
            }
            ErrorClass::Fatal => Recovery::Close,
        }
    }
}
