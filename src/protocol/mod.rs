pub mod frame;
pub mod sap;
pub mod shot;
pub mod xble;

pub use sap::SapDecoder;
pub use shot::ShotData;
pub use xble::{FirmwareTransferState, XbleDecoder};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Instrument memory map.
pub const COEFF_ADDRESS: u16 = 0x8010;
pub const COEFF_LEN: usize = 52;
pub const STATUS_ADDRESS: u16 = 0xc044;
/// Set in the status word while the instrument is in calibration mode.
pub const CALIB_MODE_BIT: u8 = 0x08;
pub const FIRMWARE_ADDRESS: u16 = 0xe000;
pub const HARDWARE_ADDRESS: u16 = 0xe004;
/// Firmware images start at this flash block.
pub const FIRST_FIRMWARE_BLOCK: u8 = 8;

/// Classification of one decoded notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketType {
    #[default]
    None,
    MeasureData,
    VectorData,
    MemoryReply,
    FirmwareBlockHalf1,
    FirmwareBlockHalf2,
    FirmwareChecksum,
    Signature,
    Error,
}

impl PacketType {
    /// Measurement stream packets, as opposed to command replies.
    pub fn is_data(&self) -> bool {
        matches!(self, PacketType::MeasureData | PacketType::VectorData)
    }

    /// First or second half of a firmware block: never a completed exchange.
    pub fn is_firmware_half(&self) -> bool {
        matches!(self, PacketType::FirmwareBlockHalf1 | PacketType::FirmwareBlockHalf2)
    }
}

/// The most recent decoded packet. Each decode overwrites it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingReply {
    pub packet_type: PacketType,
    pub address: Option<u16>,
    pub payload: Vec<u8>,
}

impl PendingReply {
    pub fn error() -> Self {
        Self { packet_type: PacketType::Error, address: None, payload: Vec::new() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Truncated frame: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Frame payload too long: {0} bytes")]
    FrameTooLong(usize),

    #[error("Invalid transfer length: {0} (allowed 0..=124)")]
    InvalidLength(usize),

    #[error("Unknown packet marker: {0:#04x}")]
    UnknownMarker(u8),

    #[error("Invalid firmware half index: {0}")]
    InvalidHalfIndex(u8),

    #[error("Firmware block {block} out of sequence (pending {pending:?})")]
    BlockSequence { block: u8, pending: Option<u8> },

    #[error("Checksum mismatch on block {block}: computed {computed:#06x}, reported {reported:#06x}")]
    ChecksumMismatch { block: u8, computed: u16, reported: u16 },

    #[error("Unexpected reply: expected {expected:?}, got {got:?}")]
    UnexpectedReply { expected: PacketType, got: PacketType },

    #[error("Reply address {got:#06x} does not match request {expected:#06x}")]
    AddressMismatch { expected: u16, got: u16 },

    #[error("Reply length {got} does not match request {expected}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Write echo mismatch at {0:#06x}")]
    EchoMismatch(u16),

    #[error("Not supported by this device family: {0}")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Per-family packet decoder. One instance lives in each connection session.
pub trait PacketDecoder: Send + Sync {
    fn family(&self) -> DeviceFamily;

    /// Classify a raw notification and overwrite the pending reply.
    fn decode(&mut self, raw: &[u8]) -> PacketType;

    fn reply(&self) -> &PendingReply;

    fn frame_command(&self, payload: &[u8], add_header: bool) -> Result<Vec<u8>> {
        if add_header {
            frame::wrap(payload)
        } else {
            Ok(payload.to_vec())
        }
    }

    /// Seed the transfer state with a block the host is about to upload.
    fn prime_block(&mut self, _block: u8, _data: &[u8]) -> Result<()> {
        Err(ProtocolError::Unsupported("firmware transfer"))
    }

    /// Bytes the host must write back after a data packet, if any.
    fn ack_frame(&self, _raw: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Service and characteristic identifiers of one device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub read: Uuid,
    pub write: Uuid,
}

const XBLE_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
const XBLE_READ: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
const XBLE_WRITE: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);
const SAP_SERVICE: Uuid = Uuid::from_u128(0x137c4435_8a64_4bcb_93f1_3792c6bdc965);
const SAP_READ: Uuid = Uuid::from_u128(0xe3ff7408_7e41_4f5b_a4d0_1b4b5e2b5b61);
const SAP_WRITE: Uuid = Uuid::from_u128(0x713b9e7b_3f3c_4d0a_9e8b_4d2a6c7f1e21);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    XBle,
    Sap,
}

impl DeviceFamily {
    pub fn profile(&self) -> GattProfile {
        match self {
            DeviceFamily::XBle => GattProfile { service: XBLE_SERVICE, read: XBLE_READ, write: XBLE_WRITE },
            DeviceFamily::Sap => GattProfile { service: SAP_SERVICE, read: SAP_READ, write: SAP_WRITE },
        }
    }

    pub fn decoder(&self) -> Box<dyn PacketDecoder> {
        match self {
            DeviceFamily::XBle => Box::new(XbleDecoder::new()),
            DeviceFamily::Sap => Box::new(SapDecoder::new()),
        }
    }

    /// Memory access and firmware transfer are DistoX-BLE only.
    pub fn supports_memory(&self) -> bool {
        matches!(self, DeviceFamily::XBle)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceFamily::XBle => "DistoX-BLE",
            DeviceFamily::Sap => "SAP5",
        }
    }
}

/// One-byte instrument commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceCommand {
    CalibOff,
    CalibOn,
    SilentOn,
    SilentOff,
    DeviceOff,
    LaserOn,
    LaserOff,
    Measure,
}

impl DeviceCommand {
    pub fn code(&self) -> u8 {
        match self {
            DeviceCommand::CalibOff => 0x30,
            DeviceCommand::CalibOn => 0x31,
            DeviceCommand::SilentOn => 0x32,
            DeviceCommand::SilentOff => 0x33,
            DeviceCommand::DeviceOff => 0x34,
            DeviceCommand::LaserOn => 0x36,
            DeviceCommand::LaserOff => 0x37,
            DeviceCommand::Measure => 0x38,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x30 => DeviceCommand::CalibOff,
            0x31 => DeviceCommand::CalibOn,
            0x32 => DeviceCommand::SilentOn,
            0x33 => DeviceCommand::SilentOff,
            0x34 => DeviceCommand::DeviceOff,
            0x36 => DeviceCommand::LaserOn,
            0x37 => DeviceCommand::LaserOff,
            0x38 => DeviceCommand::Measure,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_profiles_are_distinct() {
        let xble = DeviceFamily::XBle.profile();
        let sap = DeviceFamily::Sap.profile();
        assert_ne!(xble.service, sap.service);
        assert_ne!(xble.read, xble.write);
        assert_eq!(DeviceFamily::Sap.decoder().family(), DeviceFamily::Sap);
    }

    #[test]
    fn test_command_codes() {
        for code in 0x30..=0x38u8 {
            if let Some(cmd) = DeviceCommand::from_code(code) {
                assert_eq!(cmd.code(), code);
            }
        }
        assert_eq!(DeviceCommand::from_code(0x35), None);
        assert_eq!(DeviceCommand::LaserOn.code(), 0x36);
    }

    #[test]
    fn test_packet_type_groups() {
        assert!(PacketType::MeasureData.is_data());
        assert!(!PacketType::MemoryReply.is_data());
        assert!(PacketType::FirmwareBlockHalf1.is_firmware_half());
        assert!(!PacketType::FirmwareChecksum.is_firmware_half());
    }
}
