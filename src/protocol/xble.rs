//! DistoX-BLE decoder and the firmware block accumulator.
use super::frame::{
    self, CMD_READ_BLOCK, CMD_READ_MEMORY, CMD_READ_MEMORY_N, CMD_SIGNATURE, CMD_WRITE_BLOCK,
    CMD_WRITE_MEMORY, CMD_WRITE_MEMORY_N, FIRMWARE_BLOCK_SIZE, FIRMWARE_HALF_SIZE,
};
use super::{DeviceFamily, PacketDecoder, PacketType, PendingReply, ProtocolError, Result};

const DATA_PACKET_LEN: usize = 8;

/// Accumulates one 256-byte firmware block and its computed checksum.
#[derive(Debug, Default)]
pub struct FirmwareTransferState {
    block: Option<u8>,
    data: Vec<u8>,
    checksum: Option<u16>,
}

impl FirmwareTransferState {
    pub fn new() -> Self {
        Self::default()
    }

    /// First half: drops whatever was pending and starts a new block.
    pub fn begin(&mut self, block: u8, half: &[u8]) {
        self.block = Some(block);
        self.data.clear();
        self.data.extend_from_slice(half);
        self.checksum = None;
    }

    pub fn complete(&mut self, block: u8, half: &[u8]) -> Result<u16> {
        if self.block != Some(block) || self.data.len() != FIRMWARE_HALF_SIZE {
            let pending = self.block;
            self.reset();
            return Err(ProtocolError::BlockSequence { block, pending });
        }
        self.data.extend_from_slice(half);
        let checksum = frame::block_checksum(&self.data);
        self.checksum = Some(checksum);
        Ok(checksum)
    }

    /// Load a whole block the host is about to send.
    pub fn prime(&mut self, block: u8, data: &[u8]) -> Result<u16> {
        if data.len() != FIRMWARE_BLOCK_SIZE {
            return Err(ProtocolError::InvalidLength(data.len()));
        }
        self.block = Some(block);
        self.data.clear();
        self.data.extend_from_slice(data);
        let checksum = frame::block_checksum(&self.data);
        self.checksum = Some(checksum);
        Ok(checksum)
    }

    /// Compare the device-reported checksum with the computed one, byte for
    /// byte. The state is consumed either way.
    pub fn verify(&mut self, block: u8, reported: [u8; 2]) -> Result<Vec<u8>> {
        let pending = self.block;
        let computed = self.checksum.take();
        let data = std::mem::take(&mut self.data);
        self.block = None;

        let computed = match computed {
            Some(c) if pending == Some(block) => c,
            _ => return Err(ProtocolError::BlockSequence { block, pending }),
        };
        if computed.to_le_bytes() != reported {
            return Err(ProtocolError::ChecksumMismatch {
                block,
                computed,
                reported: u16::from_le_bytes(reported),
            });
        }
        Ok(data)
    }

    pub fn reset(&mut self) {
        self.block = None;
        self.data.clear();
        self.checksum = None;
    }

    pub fn is_idle(&self) -> bool {
        self.block.is_none()
    }

    pub fn checksum(&self) -> Option<u16> {
        self.checksum
    }
}

#[derive(Debug, Default)]
pub struct XbleDecoder {
    reply: PendingReply,
    transfer: FirmwareTransferState,
}

impl XbleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfer(&self) -> &FirmwareTransferState {
        &self.transfer
    }

    fn classify(&mut self, raw: &[u8]) -> Result<PendingReply> {
        let body = frame::unwrap(raw)?;
        let marker = *body.first().ok_or(ProtocolError::Truncated { needed: 1, got: 0 })?;

        let reply = match marker {
            CMD_READ_MEMORY | CMD_WRITE_MEMORY => {
                require(body, 7)?;
                PendingReply {
                    packet_type: PacketType::MemoryReply,
                    address: Some(address(body)),
                    payload: body[3..7].to_vec(),
                }
            }
            CMD_READ_MEMORY_N | CMD_WRITE_MEMORY_N => {
                require(body, 4)?;
                let len = body[3] as usize;
                require(body, 4 + len)?;
                PendingReply {
                    packet_type: PacketType::MemoryReply,
                    address: Some(address(body)),
                    payload: body[4..4 + len].to_vec(),
                }
            }
            CMD_READ_BLOCK => {
                require(body, 3 + FIRMWARE_HALF_SIZE)?;
                let (block, index) = (body[1], body[2]);
                let half = &body[3..3 + FIRMWARE_HALF_SIZE];
                let packet_type = match index {
                    0 => {
                        self.transfer.begin(block, half);
                        PacketType::FirmwareBlockHalf1
                    }
                    1 => {
                        self.transfer.complete(block, half)?;
                        PacketType::FirmwareBlockHalf2
                    }
                    other => return Err(ProtocolError::InvalidHalfIndex(other)),
                };
                PendingReply { packet_type, address: Some(block as u16), payload: Vec::new() }
            }
            CMD_WRITE_BLOCK => {
                require(body, 4)?;
                let block = body[1];
                let data = self.transfer.verify(block, [body[2], body[3]])?;
                PendingReply {
                    packet_type: PacketType::FirmwareChecksum,
                    address: Some(block as u16),
                    payload: data,
                }
            }
            CMD_SIGNATURE => PendingReply {
                packet_type: PacketType::Signature,
                address: None,
                payload: body[1..].to_vec(),
            },
            _ if body.len() == DATA_PACKET_LEN => {
                let packet_type = match marker & 0x3f {
                    0x01 => PacketType::MeasureData,
                    0x04 => PacketType::VectorData,
                    _ => return Err(ProtocolError::UnknownMarker(marker)),
                };
                PendingReply { packet_type, address: None, payload: body.to_vec() }
            }
            _ => return Err(ProtocolError::UnknownMarker(marker)),
        };
        Ok(reply)
    }
}

fn require(body: &[u8], needed: usize) -> Result<()> {
    if body.len() < needed {
        return Err(ProtocolError::Truncated { needed, got: body.len() });
    }
    Ok(())
}

fn address(body: &[u8]) -> u16 {
    u16::from_le_bytes([body[1], body[2]])
}

impl PacketDecoder for XbleDecoder {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::XBle
    }

    fn decode(&mut self, raw: &[u8]) -> PacketType {
        self.reply = match self.classify(raw) {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("XBLE decode failed ({} bytes): {}", raw.len(), e);
                PendingReply::error()
            }
        };
        self.reply.packet_type
    }

    fn reply(&self) -> &PendingReply {
        &self.reply
    }

    fn prime_block(&mut self, block: u8, data: &[u8]) -> Result<()> {
        self.transfer.prime(block, data).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(seed: u8) -> [u8; FIRMWARE_BLOCK_SIZE] {
        let mut block = [0u8; FIRMWARE_BLOCK_SIZE];
        for (i, b) in block.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(7).wrapping_add(seed);
        }
        block
    }

    #[test]
    fn test_memory_reply_framed_and_unframed() {
        let mut decoder = XbleDecoder::new();
        let raw = frame::memory_reply(CMD_READ_MEMORY, 0xe000, &[1, 2, 3, 4]);
        assert_eq!(decoder.decode(&raw), PacketType::MemoryReply);
        assert_eq!(decoder.reply().address, Some(0xe000));
        assert_eq!(decoder.reply().payload, vec![1, 2, 3, 4]);

        let framed = frame::wrap(&frame::memory_reply(CMD_READ_MEMORY_N, 0x8010, &[9; 52])).unwrap();
        assert_eq!(decoder.decode(&framed), PacketType::MemoryReply);
        assert_eq!(decoder.reply().payload.len(), 52);
    }

    #[test]
    fn test_truncated_memory_reply_is_error() {
        let mut decoder = XbleDecoder::new();
        assert_eq!(decoder.decode(&[CMD_READ_MEMORY_N, 0x10, 0x80, 10, 1, 2]), PacketType::Error);
        assert_eq!(decoder.decode(&[]), PacketType::Error);
    }

    #[test]
    fn test_firmware_block_round_trip() {
        let mut decoder = XbleDecoder::new();
        let block = sample_block(3);
        let [first, second] = frame::block_half_frames(12, &block);

        assert_eq!(decoder.decode(&first), PacketType::FirmwareBlockHalf1);
        assert_eq!(decoder.decode(&second), PacketType::FirmwareBlockHalf2);
        let checksum = frame::checksum_frame(12, frame::block_checksum(&block));
        assert_eq!(decoder.decode(&checksum), PacketType::FirmwareChecksum);
        assert_eq!(decoder.reply().payload, block.to_vec());
        assert!(decoder.transfer().is_idle());
    }

    #[test]
    fn test_any_flipped_byte_fails_validation() {
        let block = sample_block(11);
        let reported = frame::block_checksum(&block);
        for i in [0usize, 127, 128, 255] {
            let mut corrupted = block;
            corrupted[i] ^= 0x01;
            let mut decoder = XbleDecoder::new();
            let [first, second] = frame::block_half_frames(8, &corrupted);
            decoder.decode(&first);
            decoder.decode(&second);
            assert_eq!(decoder.decode(&frame::checksum_frame(8, reported)), PacketType::Error);
        }
    }

    #[test]
    fn test_second_half_without_first_is_error() {
        let mut decoder = XbleDecoder::new();
        let [_, second] = frame::block_half_frames(8, &sample_block(0));
        assert_eq!(decoder.decode(&second), PacketType::Error);
    }

    #[test]
    fn test_primed_block_validates_upload_checksum() {
        let mut decoder = XbleDecoder::new();
        let block = sample_block(5);
        decoder.prime_block(9, &block).unwrap();
        let reply = frame::checksum_frame(9, frame::block_checksum(&block));
        assert_eq!(decoder.decode(&reply), PacketType::FirmwareChecksum);

        decoder.prime_block(10, &block).unwrap();
        let wrong = frame::checksum_frame(10, frame::block_checksum(&block).wrapping_add(1));
        assert_eq!(decoder.decode(&wrong), PacketType::Error);
    }

    #[test]
    fn test_data_packets_by_marker() {
        let mut decoder = XbleDecoder::new();
        assert_eq!(decoder.decode(&[0x81, 0, 0, 0, 0, 0, 0, 0]), PacketType::MeasureData);
        assert_eq!(decoder.decode(&[0x44, 0, 0, 0, 0, 0, 0, 0]), PacketType::VectorData);
        assert_eq!(decoder.decode(&[0x02, 0, 0, 0, 0, 0, 0, 0]), PacketType::Error);
        assert_eq!(decoder.decode(&[0x01, 0, 0]), PacketType::Error);
    }

    #[test]
    fn test_signature() {
        let mut decoder = XbleDecoder::new();
        assert_eq!(decoder.decode(&[CMD_SIGNATURE, 0xaa, 0xbb]), PacketType::Signature);
        assert_eq!(decoder.reply().payload, vec![0xaa, 0xbb]);
    }
}
