//! Turns the asynchronous arrival of a decoded packet into an awaitable reply.
//!
//! The reply slot is a `watch` channel: a single value, last write wins, no
//! buffering. A caller resets the slot, subscribes, sends its command and
//! then waits on [`await_reply`] until a matching packet shows up or the
//! deadline passes.
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use super::{CommError, Result};
use crate::protocol::{PacketType, PendingReply, ProtocolError};

pub type ReplyReceiver = watch::Receiver<Option<PendingReply>>;

#[derive(Debug)]
pub struct ReplySlot {
    tx: watch::Sender<Option<PendingReply>>,
}

impl ReplySlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, reply: PendingReply) {
        self.tx.send_replace(Some(reply));
    }

    /// Empty the slot and return a receiver that has already seen the empty value.
    pub fn reset(&self) -> ReplyReceiver {
        self.tx.send_replace(None);
        self.tx.subscribe()
    }

    /// Receiver positioned at the current value; only later publishes wake it.
    pub fn subscribe(&self) -> ReplyReceiver {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<PendingReply> {
        self.tx.borrow().clone()
    }
}

impl Default for ReplySlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until a reply of type `expected` is published or `deadline` passes.
///
/// Firmware block halves keep the wait going; any other type fails the
/// exchange. A closed slot means the session went away.
pub async fn await_reply(
    rx: &mut ReplyReceiver,
    expected: PacketType,
    deadline: Instant,
    operation: &'static str,
) -> Result<PendingReply> {
    let started = Instant::now();
    loop {
        match timeout_at(deadline, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                log::warn!("{}: session closed while waiting for {:?}", operation, expected);
                return Err(CommError::NotConnected);
            }
            Err(_) => {
                // A reply may have landed right at the deadline.
                if rx.has_changed().unwrap_or(false) {
                    if let Some(reply) = rx.borrow_and_update().clone() {
                        if reply.packet_type == expected {
                            return Ok(reply);
                        }
                    }
                }
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                log::warn!("{}: no {:?} reply after {} ms", operation, expected, elapsed_ms);
                return Err(CommError::Timeout { operation, elapsed_ms });
            }
        }

        let Some(reply) = rx.borrow_and_update().clone() else {
            continue;
        };
        if reply.packet_type == expected {
            log::debug!("{}: reply after {} ms", operation, started.elapsed().as_millis());
            return Ok(reply);
        }
        if reply.packet_type.is_firmware_half() {
            continue;
        }
        log::warn!("{}: expected {:?}, got {:?}", operation, expected, reply.packet_type);
        return Err(ProtocolError::UnexpectedReply { expected, got: reply.packet_type }.into());
    }
}

/// Wait for the next data packet, giving up after `timeout` of silence.
pub async fn await_data(rx: &mut ReplyReceiver, timeout: Duration) -> Option<PacketType> {
    match tokio::time::timeout(timeout, rx.changed()).await {
        Ok(Ok(())) => rx.borrow_and_update().as_ref().map(|r| r.packet_type),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(packet_type: PacketType) -> PendingReply {
        PendingReply { packet_type, address: Some(0x8010), payload: vec![1, 2, 3, 4] }
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_reply_wakes_waiter() {
        let slot = std::sync::Arc::new(ReplySlot::new());
        let mut rx = slot.reset();
        let publisher = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            publisher.publish(reply(PacketType::MemoryReply));
        });
        let deadline = Instant::now() + Duration::from_millis(2000);
        let got = await_reply(&mut rx, PacketType::MemoryReply, deadline, "read memory").await.unwrap();
        assert_eq!(got.payload, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_reply() {
        let slot = ReplySlot::new();
        let mut rx = slot.reset();
        let deadline = Instant::now() + Duration::from_millis(2000);
        let err = await_reply(&mut rx, PacketType::MemoryReply, deadline, "read memory").await;
        match err {
            Err(CommError::Timeout { elapsed_ms, .. }) => assert!((2000..2100).contains(&elapsed_ms)),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_halves_keep_waiting() {
        let slot = std::sync::Arc::new(ReplySlot::new());
        let mut rx = slot.reset();
        let publisher = slot.clone();
        tokio::spawn(async move {
            publisher.publish(reply(PacketType::FirmwareBlockHalf2));
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(reply(PacketType::FirmwareChecksum));
        });
        let deadline = Instant::now() + Duration::from_millis(5000);
        let got = await_reply(&mut rx, PacketType::FirmwareChecksum, deadline, "read block").await;
        assert!(got.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_type_fails() {
        let slot = ReplySlot::new();
        let mut rx = slot.reset();
        slot.publish(PendingReply::error());
        let deadline = Instant::now() + Duration::from_millis(2000);
        let err = await_reply(&mut rx, PacketType::MemoryReply, deadline, "read memory").await;
        assert!(matches!(err, Err(CommError::Protocol(ProtocolError::UnexpectedReply { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_slot_reports_not_connected() {
        let slot = ReplySlot::new();
        let mut rx = slot.reset();
        drop(slot);
        let deadline = Instant::now() + Duration::from_millis(2000);
        let err = await_reply(&mut rx, PacketType::MemoryReply, deadline, "read memory").await;
        assert!(matches!(err, Err(CommError::NotConnected)));
    }
}
