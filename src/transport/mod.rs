pub mod mock;
pub mod serial;

pub use mock::SimulatedDevice;
pub use serial::{FrameSplitter, SerialPortInfo, SerialTransport};

use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Status code reported by the radio stack alongside every completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    pub const READ_NOT_PERMITTED: GattStatus = GattStatus(2);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(3);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(5);
    pub const REQUEST_NOT_SUPPORTED: GattStatus = GattStatus(6);
    pub const CONNECTION_TIMEOUT: GattStatus = GattStatus(8);
    pub const INVALID_ATTRIBUTE_LENGTH: GattStatus = GattStatus(13);
    pub const INSUFFICIENT_ENCRYPTION: GattStatus = GattStatus(15);
    pub const LINK_LOSS: GattStatus = GattStatus(133);
    pub const FAILURE: GattStatus = GattStatus(257);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single transport-level operation. Carries only the data needed to run it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect { target: String },
    Disconnect,
    CharacteristicRead { service: Uuid, characteristic: Uuid },
    CharacteristicWrite { service: Uuid, characteristic: Uuid, payload: Vec<u8> },
    EnableNotify { service: Uuid, characteristic: Uuid, enable: bool },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Connect { .. } => "connect",
            Operation::Disconnect => "disconnect",
            Operation::CharacteristicRead { .. } => "characteristic read",
            Operation::CharacteristicWrite { .. } => "characteristic write",
            Operation::EnableNotify { .. } => "enable notify",
        }
    }
}

/// Completion and notification callbacks delivered by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionChanged { status: GattStatus, connected: bool },
    ServicesDiscovered { status: GattStatus },
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
    CharacteristicRead { status: GattStatus, characteristic: Uuid, value: Vec<u8> },
    CharacteristicWritten { status: GattStatus, characteristic: Uuid },
    DescriptorWritten { status: GattStatus, characteristic: Uuid },
    MtuChanged { status: GattStatus, mtu: u16 },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport not connected")]
    NotConnected,

    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(Uuid),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// An event-driven link to one remote instrument.
///
/// Every method only *starts* an operation: `Ok` means the request was
/// accepted, and the outcome arrives later as a [`TransportEvent`] on the
/// channel handed out when the transport was created. An `Err` means the
/// operation never started and no completion will follow.
#[async_trait::async_trait]
pub trait GattTransport: Send + Sync {
    async fn connect(&self, target: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        payload: &[u8],
    ) -> Result<()>;

    async fn enable_notify(&self, service: Uuid, characteristic: Uuid, enable: bool) -> Result<()>;

    /// Release the underlying link immediately, without a completion event.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_constants() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(!GattStatus::LINK_LOSS.is_success());
        assert_eq!(GattStatus::LINK_LOSS.to_string(), "133");
    }

    #[test]
    fn test_operation_names() {
        let op = Operation::Connect { target: "00:11:22:33:44:55".to_string() };
        assert_eq!(op.name(), "connect");
        assert_eq!(Operation::Disconnect.name(), "disconnect");
    }
}
