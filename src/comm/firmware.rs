//! Firmware image transfer, one 256-byte flash block at a time.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{CommError, DeviceComm, Result};
use crate::protocol::frame::{self, FIRMWARE_BLOCK_SIZE};
use crate::protocol::{PacketType, PendingReply, ProtocolError, FIRST_FIRMWARE_BLOCK};

/// Outcome of a dump or upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub blocks: usize,
    pub first_block: u8,
    /// Hex SHA-256 of the bytes written to (dump) or read from (upload) the file.
    pub sha256: String,
}

fn check_block(block: u8, reply: &PendingReply) -> Result<()> {
    match reply.address {
        Some(got) if got == block as u16 => Ok(()),
        got => Err(ProtocolError::AddressMismatch { expected: block as u16, got: got.unwrap_or_default() }.into()),
    }
}

/// Blocks and bytes moved so far, plus the running image digest.
#[derive(Default)]
struct Progress {
    bytes: u64,
    blocks: usize,
    hasher: Sha256,
}

impl Progress {
    fn record(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
        self.blocks += 1;
    }

    fn finish(self, operation: &str, path: &Path) -> FirmwareReport {
        let sha256 = hex::encode(self.hasher.finalize());
        log::info!("{} complete: {} blocks, {} bytes, sha256 {}", operation, self.blocks, self.bytes, sha256);
        FirmwareReport {
            path: path.to_path_buf(),
            bytes: self.bytes,
            blocks: self.blocks,
            first_block: FIRST_FIRMWARE_BLOCK,
            sha256,
        }
    }

    fn abort(&self, operation: &'static str, source: CommError) -> CommError {
        log::error!("{} aborted after {} blocks ({} bytes): {}", operation, self.blocks, self.bytes, source);
        CommError::FirmwareAborted { operation, bytes: self.bytes, blocks: self.blocks, source: Box::new(source) }
    }
}

/// Fill `buf` from `file`. Returns how many bytes were read; short only at EOF.
async fn read_block(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl DeviceComm {
    /// Read the firmware image into `path`. Stops after the first erased
    /// (all `0xFF`) block, which is still written. A failure part way
    /// reports the blocks already saved through [`CommError::FirmwareAborted`].
    pub async fn dump_firmware(&self, address: &str, path: impl AsRef<Path>) -> Result<FirmwareReport> {
        self.require_memory_family("dump firmware")?;
        let path = path.as_ref();
        let mut file = File::create(path).await?;
        self.ensure_connected(address).await?;

        log::info!("Dumping firmware to {}", path.display());
        let mut progress = Progress::default();
        let result = self.dump_blocks(&mut file, &mut progress).await;
        self.disconnect().await?;
        match result {
            Ok(()) => Ok(progress.finish("Firmware dump", path)),
            Err(e) => Err(progress.abort("dump firmware", e)),
        }
    }

    async fn dump_blocks(&self, file: &mut File, progress: &mut Progress) -> Result<()> {
        for block in FIRST_FIRMWARE_BLOCK..=u8::MAX {
            let reply = self
                .exchange(
                    &[&frame::read_block_command(block)[..]],
                    PacketType::FirmwareChecksum,
                    self.config().firmware_timeout(),
                    "read firmware block",
                )
                .await?;
            check_block(block, &reply)?;

            file.write_all(&reply.payload).await?;
            progress.record(&reply.payload);
            log::debug!("Firmware block {} read", block);

            if reply.payload.iter().all(|b| *b == 0xff) {
                break;
            }
        }
        file.flush().await?;
        Ok(())
    }

    /// Write the image at `path` to flash starting at block 8. The last
    /// partial block is padded with `0xFF`; a checksum mismatch aborts with
    /// the count of blocks the device had already confirmed.
    pub async fn upload_firmware(&self, address: &str, path: impl AsRef<Path>) -> Result<FirmwareReport> {
        self.require_memory_family("upload firmware")?;
        let path = path.as_ref();
        let mut file = File::open(path).await?;
        self.ensure_connected(address).await?;

        log::info!("Uploading firmware from {}", path.display());
        let mut progress = Progress::default();
        let result = self.upload_blocks(&mut file, &mut progress).await;
        self.disconnect().await?;
        match result {
            Ok(()) => Ok(progress.finish("Firmware upload", path)),
            Err(e) => Err(progress.abort("upload firmware", e)),
        }
    }

    async fn upload_blocks(&self, file: &mut File, progress: &mut Progress) -> Result<()> {
        for block in FIRST_FIRMWARE_BLOCK..=u8::MAX {
            let mut data = [0xffu8; FIRMWARE_BLOCK_SIZE];
            let n = read_block(file, &mut data).await?;
            if n == 0 {
                break;
            }

            self.prime_block(block, &data)?;
            let [first, second] = frame::write_block_commands(block, &data);
            let reply = self
                .exchange(
                    &[first.as_slice(), second.as_slice()],
                    PacketType::FirmwareChecksum,
                    self.config().firmware_timeout(),
                    "write firmware block",
                )
                .await?;
            check_block(block, &reply)?;
            progress.record(&data[..n]);
            log::debug!("Firmware block {} written", block);

            if n < FIRMWARE_BLOCK_SIZE {
                break;
            }
        }
        Ok(())
    }
}
