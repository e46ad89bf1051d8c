//! Host-side communication layer for DistoX-BLE and SAP5 cave-survey instruments.
//!
//! A [`DeviceComm`] owns one link to one instrument. It serialises transport
//! operations through a FIFO queue, tracks the connection state, decodes the
//! instrument's packets and turns command/response exchanges into plain
//! `async` calls.
pub mod comm;
pub mod config;
pub mod protocol;
pub mod transport;

pub use comm::{
    CommError, ConnectionState, DataListener, DataPacket, DeviceComm, DeviceCommBuilder, DeviceInfo,
    FirmwareReport, SessionInfo, StatusListener,
};
pub use config::CommConfig;
pub use protocol::{DeviceCommand, DeviceFamily, PacketType, ShotData};
pub use transport::{GattStatus, GattTransport, SerialTransport, SimulatedDevice, TransportEvent};
