//! Command encoders, transport framing and firmware-block helpers.
//!
//! All multi-byte addresses are little-endian and occupy the two bytes that
//! follow the command byte.

use super::ProtocolError;

pub const CMD_READ_MEMORY: u8 = 0x38;
pub const CMD_WRITE_MEMORY: u8 = 0x39;
pub const CMD_READ_BLOCK: u8 = 0x3a;
pub const CMD_WRITE_BLOCK: u8 = 0x3b;
pub const CMD_SIGNATURE: u8 = 0x3c;
pub const CMD_READ_MEMORY_N: u8 = 0x3d;
pub const CMD_WRITE_MEMORY_N: u8 = 0x3e;

/// Largest payload a single memory read/write may carry.
pub const MAX_TRANSFER_LEN: usize = 124;
pub const FIRMWARE_BLOCK_SIZE: usize = 256;
pub const FIRMWARE_HALF_SIZE: usize = 128;

const FRAME_PREFIX: &[u8; 5] = b"data:";
const FRAME_TRAILER: &[u8; 2] = b"\r\n";

/// Wrap a payload as `"data:" + len + payload + "\r\n"`.
pub fn wrap(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = u8::try_from(payload.len())
        .map_err(|_| ProtocolError::FrameTooLong(payload.len()))?;
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(FRAME_PREFIX);
    frame.push(len);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(FRAME_TRAILER);
    Ok(frame)
}

/// Strip the optional `"data:"` framing. Unframed input is returned as is.
pub fn unwrap(raw: &[u8]) -> Result<&[u8], ProtocolError> {
    if !raw.starts_with(FRAME_PREFIX) {
        return Ok(raw);
    }
    let len = *raw
        .get(FRAME_PREFIX.len())
        .ok_or(ProtocolError::Truncated { needed: 6, got: raw.len() })? as usize;
    let start = FRAME_PREFIX.len() + 1;
    raw.get(start..start + len)
        .ok_or(ProtocolError::Truncated { needed: start + len, got: raw.len() })
}

/// Length of a complete framed packet at the start of `buf`, if one is there.
pub fn framed_len(buf: &[u8]) -> Option<usize> {
    if buf.len() <= FRAME_PREFIX.len() || !buf.starts_with(FRAME_PREFIX) {
        return None;
    }
    let total = FRAME_PREFIX.len() + 1 + buf[FRAME_PREFIX.len()] as usize + FRAME_TRAILER.len();
    (buf.len() >= total).then_some(total)
}

pub fn split_address(addr: u16) -> [u8; 2] {
    addr.to_le_bytes()
}

fn check_len(len: usize) -> Result<u8, ProtocolError> {
    if len > MAX_TRANSFER_LEN {
        return Err(ProtocolError::InvalidLength(len));
    }
    Ok(len as u8)
}

pub fn read_memory_command(addr: u16) -> [u8; 3] {
    let [lo, hi] = split_address(addr);
    [CMD_READ_MEMORY, lo, hi]
}

pub fn read_memory_n_command(addr: u16, len: usize) -> Result<[u8; 4], ProtocolError> {
    let n = check_len(len)?;
    let [lo, hi] = split_address(addr);
    Ok([CMD_READ_MEMORY_N, lo, hi, n])
}

pub fn write_memory_command(addr: u16, data: &[u8; 4]) -> [u8; 7] {
    let [lo, hi] = split_address(addr);
    [CMD_WRITE_MEMORY, lo, hi, data[0], data[1], data[2], data[3]]
}

pub fn write_memory_n_command(addr: u16, data: &[u8], len: usize) -> Result<Vec<u8>, ProtocolError> {
    let n = check_len(len)?;
    if data.len() < len {
        return Err(ProtocolError::InvalidLength(data.len()));
    }
    let [lo, hi] = split_address(addr);
    let mut cmd = Vec::with_capacity(len + 4);
    cmd.extend_from_slice(&[CMD_WRITE_MEMORY_N, lo, hi, n]);
    cmd.extend_from_slice(&data[..len]);
    Ok(cmd)
}

pub fn read_block_command(block: u8) -> [u8; 3] {
    [CMD_READ_BLOCK, block, 0]
}

/// The two 131-byte sub-frames that upload one firmware block.
pub fn write_block_commands(block: u8, data: &[u8; FIRMWARE_BLOCK_SIZE]) -> [Vec<u8>; 2] {
    let half = |index: u8| {
        let offset = index as usize * FIRMWARE_HALF_SIZE;
        let mut frame = Vec::with_capacity(FIRMWARE_HALF_SIZE + 3);
        frame.extend_from_slice(&[CMD_WRITE_BLOCK, block, index]);
        frame.extend_from_slice(&data[offset..offset + FIRMWARE_HALF_SIZE]);
        frame
    };
    [half(0), half(1)]
}

/// Unsigned byte sum of a block, truncated to 16 bits.
pub fn block_checksum(block: &[u8]) -> u16 {
    block.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

// Instrument-side encoders. The simulated device and the tests speak these.

pub fn memory_reply(command: u8, addr: u16, data: &[u8]) -> Vec<u8> {
    let [lo, hi] = split_address(addr);
    let mut reply = vec![command, lo, hi];
    if matches!(command, CMD_READ_MEMORY_N | CMD_WRITE_MEMORY_N) {
        reply.push(data.len() as u8);
    }
    reply.extend_from_slice(data);
    reply
}

pub fn block_half_frames(block: u8, data: &[u8; FIRMWARE_BLOCK_SIZE]) -> [Vec<u8>; 2] {
    let [mut first, mut second] = write_block_commands(block, data);
    first[0] = CMD_READ_BLOCK;
    second[0] = CMD_READ_BLOCK;
    [first, second]
}

pub fn checksum_frame(block: u8, checksum: u16) -> Vec<u8> {
    let [lo, hi] = checksum.to_le_bytes();
    vec![CMD_WRITE_BLOCK, block, lo, hi]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_layout() {
        let frame = wrap(&[0x38, 0x10, 0x80]).unwrap();
        assert_eq!(frame, b"data:\x03\x38\x10\x80\r\n".to_vec());
        assert_eq!(framed_len(&frame), Some(frame.len()));
        assert_eq!(unwrap(&frame).unwrap(), &[0x38, 0x10, 0x80]);
    }

    #[test]
    fn test_unwrap_passthrough_and_truncation() {
        assert_eq!(unwrap(&[0x01, 0x02]).unwrap(), &[0x01, 0x02]);
        assert!(matches!(unwrap(b"data:\x05\x01"), Err(ProtocolError::Truncated { .. })));
        assert_eq!(framed_len(b"data:\x05\x01"), None);
    }

    #[test]
    fn test_address_is_little_endian() {
        assert_eq!(read_memory_command(0x8010), [0x38, 0x10, 0x80]);
        assert_eq!(read_memory_n_command(0xc044, 52).unwrap(), [0x3d, 0x44, 0xc0, 52]);
    }

    #[test]
    fn test_length_bounds() {
        assert!(read_memory_n_command(0, 124).is_ok());
        assert!(matches!(read_memory_n_command(0, 125), Err(ProtocolError::InvalidLength(125))));
        assert!(write_memory_n_command(0, &[1, 2, 3], 4).is_err());
        let cmd = write_memory_n_command(0x0102, &[9, 8, 7, 6, 5], 3).unwrap();
        assert_eq!(cmd, vec![0x3e, 0x02, 0x01, 3, 9, 8, 7]);
    }

    #[test]
    fn test_write_block_sub_frames() {
        let mut block = [0u8; FIRMWARE_BLOCK_SIZE];
        block[127] = 0xaa;
        block[128] = 0xbb;
        let [first, second] = write_block_commands(9, &block);
        assert_eq!(first.len(), 131);
        assert_eq!(second.len(), 131);
        assert_eq!(&first[..3], &[0x3b, 9, 0]);
        assert_eq!(&second[..3], &[0x3b, 9, 1]);
        assert_eq!(first[130], 0xaa);
        assert_eq!(second[3], 0xbb);
    }

    #[test]
    fn test_block_checksum_is_byte_sum() {
        assert_eq!(block_checksum(&[0xff; FIRMWARE_BLOCK_SIZE]), 0xff * 256);
        assert_eq!(block_checksum(&[1, 2, 3]), 6);
    }
}
