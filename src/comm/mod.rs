pub mod bridge;
pub mod classifier;
pub mod firmware;
pub mod manager;
pub mod queue;
pub mod session;
pub mod state;

pub use classifier::{ErrorClass, Recovery, RetryIntent};
pub use firmware::FirmwareReport;
pub use manager::{DeviceComm, DeviceCommBuilder, DeviceInfo};
pub use queue::OperationQueue;
pub use session::{DataPacket, SessionInfo};
pub use state::{ConnectionState, StateError};

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Already connected to {0}")]
    AlreadyConnected(String),

    #[error("Connection to {0} not established in time")]
    ConnectTimeout(String),

    #[error("Connection to {0} failed")]
    ConnectFailed(String),

    #[error("{operation} timed out after {elapsed_ms} ms")]
    Timeout { operation: &'static str, elapsed_ms: u64 },

    /// A firmware transfer failed part way; `bytes` had already gone through.
    #[error("{operation} aborted after {blocks} blocks ({bytes} bytes): {source}")]
    FirmwareAborted {
        operation: &'static str,
        bytes: u64,
        blocks: usize,
        source: Box<CommError>,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not supported by {family}: {operation}")]
    Unsupported { family: &'static str, operation: &'static str },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommError>;

/// Receives every effective connection state change.
pub trait StatusListener: Send + Sync {
    fn on_status(&self, state: ConnectionState);
}

impl<F> StatusListener for F
where
    F: Fn(ConnectionState) + Send + Sync,
{
    fn on_status(&self, state: ConnectionState) {
        self(state)
    }
}

/// Receives measurement packets as they are decoded.
pub trait DataListener: Send + Sync {
    fn on_packet(&self, packet: &DataPacket);
}

impl<F> DataListener for F
where
    F: Fn(&DataPacket) + Send + Sync,
{
    fn on_packet(&self, packet: &DataPacket) {
        self(packet)
    }
}
