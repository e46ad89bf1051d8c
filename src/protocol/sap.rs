//! SAP5 decoder: raw 8-byte data packets, each one acknowledged.
use super::{DeviceFamily, PacketDecoder, PacketType, PendingReply, Result};

const PACKET_LEN: usize = 8;
const ACK_BASE: u8 = 0x55;

#[derive(Debug, Default)]
pub struct SapDecoder {
    reply: PendingReply,
}

impl SapDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PacketDecoder for SapDecoder {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Sap
    }

    fn decode(&mut self, raw: &[u8]) -> PacketType {
        let packet_type = match raw.first() {
            Some(marker) if raw.len() == PACKET_LEN => match marker & 0x3f {
                0x01 => PacketType::MeasureData,
                0x04 => PacketType::VectorData,
                _ => PacketType::Error,
            },
            _ => PacketType::Error,
        };
        if packet_type == PacketType::Error {
            log::warn!("SAP packet rejected: {:02x?}", raw);
            self.reply = PendingReply::error();
        } else {
            self.reply = PendingReply { packet_type, address: None, payload: raw.to_vec() };
        }
        packet_type
    }

    fn reply(&self) -> &PendingReply {
        &self.reply
    }

    // SAP commands are never framed.
    fn frame_command(&self, payload: &[u8], _add_header: bool) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn ack_frame(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let marker = raw.first()?;
        (raw.len() == PACKET_LEN).then(|| vec![(marker & 0x80) | ACK_BASE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_and_ack() {
        let mut decoder = SapDecoder::new();
        let packet = [0x81, 0x10, 0x27, 0, 0x40, 0, 0, 0];
        assert_eq!(decoder.decode(&packet), PacketType::MeasureData);
        assert_eq!(decoder.ack_frame(&packet), Some(vec![0xd5]));
        assert_eq!(decoder.ack_frame(&[0x04, 0, 0, 0, 0, 0, 0, 0]), Some(vec![0x55]));
    }

    #[test]
    fn test_rejects_wrong_length_and_marker() {
        let mut decoder = SapDecoder::new();
        assert_eq!(decoder.decode(&[0x01, 0, 0]), PacketType::Error);
        assert_eq!(decoder.decode(&[0x03, 0, 0, 0, 0, 0, 0, 0]), PacketType::Error);
        assert_eq!(decoder.ack_frame(&[0x01]), None);
    }

    #[test]
    fn test_commands_stay_unframed() {
        let decoder = SapDecoder::new();
        assert_eq!(decoder.frame_command(&[0x36], true).unwrap(), vec![0x36]);
    }
}
