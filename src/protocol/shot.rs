use serde::{Deserialize, Serialize};

/// One survey shot decoded from a MEASURE_DATA packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShotData {
    /// Metres.
    pub distance: f64,
    /// Degrees, 0..360.
    pub bearing: f64,
    /// Degrees, -90..90.
    pub clino: f64,
    /// Degrees.
    pub roll: f64,
}

impl ShotData {
    pub fn from_packet(packet: &[u8]) -> Option<Self> {
        if packet.len() < 8 || packet[0] & 0x3f != 0x01 {
            return None;
        }
        let d = (((packet[0] & 0x40) as u32) << 10) | ((packet[2] as u32) << 8) | packet[1] as u32;
        let b = u16::from_le_bytes([packet[3], packet[4]]) as f64;
        let c = u16::from_le_bytes([packet[5], packet[6]]) as u32;
        let r = packet[7] as f64;

        // Long-range readings switch to centimetre resolution above 100 m.
        let distance = if d < 100_000 {
            d as f64 / 1000.0
        } else {
            100.0 + (d - 100_000) as f64 / 100.0
        };
        let clino = if c >= 32768 {
            (65536 - c) as f64 * (-90.0 / 16384.0)
        } else {
            c as f64 * 90.0 / 16384.0
        };

        Some(Self {
            distance,
            bearing: b * 180.0 / 32768.0,
            clino,
            roll: r * 180.0 / 128.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_scaling() {
        // 12.345 m, bearing 90, clino 45, roll 90
        let d = 12345u32;
        let packet = [0x01, d as u8, (d >> 8) as u8, 0x00, 0x40, 0x00, 0x20, 64];
        let shot = ShotData::from_packet(&packet).unwrap();
        assert!((shot.distance - 12.345).abs() < 1e-9);
        assert!((shot.bearing - 90.0).abs() < 1e-9);
        assert!((shot.clino - 45.0).abs() < 1e-9);
        assert!((shot.roll - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_negative_clino_and_long_range() {
        // high distance bit set: d = 0x10000 + 0x86a0 = 100000 -> 100 m
        let packet = [0x41, 0xa0, 0x86, 0, 0, 0x00, 0xe0, 0];
        let shot = ShotData::from_packet(&packet).unwrap();
        assert!((shot.distance - 100.0).abs() < 1e-9);
        assert!((shot.clino + 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_vector_packets() {
        assert!(ShotData::from_packet(&[0x04, 0, 0, 0, 0, 0, 0, 0]).is_none());
        assert!(ShotData::from_packet(&[0x01, 0, 0]).is_none());
    }
}
