//! Per-connection context: decoder state, packet counter and reply slot.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::bridge::ReplySlot;
use super::{ConnectionState, DataListener};
use crate::protocol::{self, DeviceFamily, GattProfile, PacketDecoder, PacketType, PendingReply, ShotData};

/// One decoded measurement packet, as handed to a [`DataListener`].
#[derive(Debug, Clone, PartialEq)]
pub struct DataPacket {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    pub shot: Option<ShotData>,
    /// 1-based position in this session's data stream.
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub target: String,
    pub family: DeviceFamily,
    pub state: ConnectionState,
    pub connected_at: DateTime<Utc>,
    pub packets: usize,
}

pub(crate) enum SessionMessage {
    Packet(Vec<u8>),
    Quit,
}

pub struct Session {
    pub id: Uuid,
    pub target: String,
    pub family: DeviceFamily,
    pub profile: GattProfile,
    pub connected_at: DateTime<Utc>,
    pub replies: ReplySlot,
    decoder: Mutex<Box<dyn PacketDecoder>>,
    packets: AtomicUsize,
    listener: Mutex<Option<Arc<dyn DataListener>>>,
    inbox: mpsc::UnboundedSender<SessionMessage>,
}

impl Session {
    pub(crate) fn new(
        target: &str,
        family: DeviceFamily,
        listener: Option<Arc<dyn DataListener>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionMessage>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            target: target.to_string(),
            family,
            profile: family.profile(),
            connected_at: Utc::now(),
            replies: ReplySlot::new(),
            decoder: Mutex::new(family.decoder()),
            packets: AtomicUsize::new(0),
            listener: Mutex::new(listener),
            inbox,
        });
        log::info!("Session {} created for {} ({})", session.id, target, family.name());
        (session, rx)
    }

    fn decoder(&self) -> MutexGuard<'_, Box<dyn PacketDecoder>> {
        self.decoder.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Hand a raw notification to the consumer task.
    pub fn push(&self, raw: Vec<u8>) {
        let _ = self.inbox.send(SessionMessage::Packet(raw));
    }

    pub fn shutdown(&self) {
        let _ = self.inbox.send(SessionMessage::Quit);
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn DataListener>>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    pub fn listener(&self) -> Option<Arc<dyn DataListener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn packet_count(&self) -> usize {
        self.packets.load(Ordering::SeqCst)
    }

    pub fn reset_packet_count(&self) {
        self.packets.store(0, Ordering::SeqCst);
    }

    pub fn frame_command(&self, payload: &[u8], add_header: bool) -> protocol::Result<Vec<u8>> {
        self.decoder().frame_command(payload, add_header)
    }

    pub fn prime_block(&self, block: u8, data: &[u8]) -> protocol::Result<()> {
        self.decoder().prime_block(block, data)
    }

    /// Surface a failed exchange to whoever is waiting on the reply slot.
    pub fn fail_pending(&self) {
        self.replies.publish(PendingReply::error());
    }

    /// Decode one notification, count and dispatch data packets, publish the
    /// reply. Returns the acknowledgement to write back, if the family wants one.
    pub fn handle_packet(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let (reply, ack) = {
            let mut decoder = self.decoder();
            let packet_type = decoder.decode(raw);
            let ack = if packet_type.is_data() { decoder.ack_frame(raw) } else { None };
            (decoder.reply().clone(), ack)
        };

        if reply.packet_type.is_data() {
            let index = self.packets.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(listener) = self.listener() {
                listener.on_packet(&DataPacket {
                    packet_type: reply.packet_type,
                    shot: ShotData::from_packet(&reply.payload),
                    payload: reply.payload.clone(),
                    index,
                });
            }
        }

        // The first half of a firmware block never completes an exchange.
        if !matches!(reply.packet_type, PacketType::None | PacketType::FirmwareBlockHalf1) {
            self.replies.publish(reply);
        }
        ack
    }

    pub fn info(&self, state: ConnectionState) -> SessionInfo {
        SessionInfo {
            id: self.id,
            target: self.target.clone(),
            family: self.family,
            state,
            connected_at: self.connected_at,
            packets: self.packet_count(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::debug!("Session {} for {} dropped", self.id, self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame;

    #[test]
    fn test_data_packets_are_counted_and_dispatched() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn DataListener> = Arc::new(move |packet: &DataPacket| {
            sink.lock().unwrap().push((packet.index, packet.shot.is_some()));
        });
        let (session, _rx) = Session::new("sim", DeviceFamily::XBle, Some(listener));

        session.handle_packet(&[0x01, 0x10, 0x27, 0, 0, 0, 0, 0]);
        session.handle_packet(&[0x04, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(session.packet_count(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, true), (2, false)]);
        assert_eq!(session.replies.latest().map(|r| r.packet_type), Some(PacketType::VectorData));
    }

    #[test]
    fn test_first_half_is_not_published() {
        let (session, _rx) = Session::new("sim", DeviceFamily::XBle, None);
        let [first, _] = frame::block_half_frames(8, &[0u8; frame::FIRMWARE_BLOCK_SIZE]);
        session.handle_packet(&first);
        assert_eq!(session.replies.latest(), None);
    }

    #[test]
    fn test_sap_packets_produce_ack() {
        let (session, _rx) = Session::new("sim", DeviceFamily::Sap, None);
        assert_eq!(session.handle_packet(&[0x81, 0, 0, 0, 0, 0, 0, 0]), Some(vec![0xd5]));
        assert_eq!(session.handle_packet(&[0x02, 0, 0, 0, 0, 0, 0, 0]), None);
    }
}
