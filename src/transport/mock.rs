//! Scripted in-process instrument for tests and demos.
//!
//! Speaks the DistoX-BLE wire protocol (or SAP5 data packets) on top of the
//! [`GattTransport`] contract: every accepted call completes later through the
//! event channel, optionally after a simulated latency.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    EventReceiver, EventSender, GattStatus, GattTransport, Operation, Result, TransportError, TransportEvent,
};
use crate::protocol::frame::{self, FIRMWARE_BLOCK_SIZE, FIRMWARE_HALF_SIZE};
use crate::protocol::{DeviceCommand, DeviceFamily, GattProfile, CALIB_MODE_BIT, STATUS_ADDRESS};

#[derive(Debug, Default)]
struct DeviceModel {
    connected: bool,
    notify_enabled: bool,
    memory: HashMap<u16, u8>,
    flash: BTreeMap<u8, [u8; FIRMWARE_BLOCK_SIZE]>,
    upload_half: Option<(u8, Vec<u8>)>,
    signature: Vec<u8>,
    stream: VecDeque<Vec<u8>>,
    shots: VecDeque<Vec<u8>>,
    stream_interval: Duration,
    faults: VecDeque<GattStatus>,
    refuse_next: bool,
    unreachable: bool,
    silent: bool,
    corrupt_from: Option<u8>,
    in_flight: bool,
    violations: usize,
    operations: Vec<Operation>,
    commands: Vec<u8>,
    acks: Vec<u8>,
}

#[derive(Clone)]
pub struct SimulatedDevice {
    family: DeviceFamily,
    profile: GattProfile,
    latency: Duration,
    events: EventSender,
    model: Arc<Mutex<DeviceModel>>,
}

impl SimulatedDevice {
    pub fn new(family: DeviceFamily) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let device = Self {
            family,
            profile: family.profile(),
            latency: Duration::ZERO,
            events,
            model: Arc::new(Mutex::new(DeviceModel::default())),
        };
        (device, rx)
    }

    /// Delay every completion by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn model(&self) -> MutexGuard<'_, DeviceModel> {
        self.model.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_memory(&self, addr: u16, data: &[u8]) {
        let mut model = self.model();
        for (i, b) in data.iter().enumerate() {
            model.memory.insert(addr.wrapping_add(i as u16), *b);
        }
    }

    pub fn memory(&self, addr: u16, len: usize) -> Vec<u8> {
        let model = self.model();
        read_memory(&model, addr, len)
    }

    /// Store a flash block. Blocks never written read back as all `0xFF`.
    pub fn set_flash_block(&self, block: u8, data: [u8; FIRMWARE_BLOCK_SIZE]) {
        self.model().flash.insert(block, data);
    }

    pub fn flash_block(&self, block: u8) -> [u8; FIRMWARE_BLOCK_SIZE] {
        self.model().flash.get(&block).copied().unwrap_or([0xff; FIRMWARE_BLOCK_SIZE])
    }

    pub fn set_signature(&self, signature: &[u8]) {
        self.model().signature = signature.to_vec();
    }

    /// Packets pushed to the host once notifications are enabled.
    pub fn queue_stream<I>(&self, packets: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.model().stream.extend(packets);
    }

    /// Packets released one per measure command (or characteristic read).
    pub fn queue_shots<I>(&self, packets: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.model().shots.extend(packets);
    }

    pub fn set_stream_interval(&self, interval: Duration) {
        self.model().stream_interval = interval;
    }

    /// The next completion reports `status` instead of success.
    pub fn push_fault(&self, status: GattStatus) {
        self.model().faults.push_back(status);
    }

    /// The next transport call is refused synchronously.
    pub fn refuse_next(&self) {
        self.model().refuse_next = true;
    }

    /// Connect attempts are accepted but never complete.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.model().unreachable = unreachable;
    }

    /// Writes are acknowledged but never answered.
    pub fn set_silent(&self, silent: bool) {
        self.model().silent = silent;
    }

    pub fn set_corrupt_checksums(&self, corrupt: bool) {
        self.model().corrupt_from = corrupt.then_some(0);
    }

    /// Corrupt checksum replies for `block` and every block after it.
    pub fn corrupt_checksums_from(&self, block: u8) {
        self.model().corrupt_from = Some(block);
    }

    /// Unsolicited disconnect, as if the radio link dropped.
    pub fn drop_link(&self, status: GattStatus) {
        {
            let mut model = self.model();
            model.connected = false;
            model.notify_enabled = false;
        }
        let _ = self.events.send(TransportEvent::ConnectionChanged { status, connected: false });
    }

    /// Send one notification right away.
    pub fn notify(&self, value: Vec<u8>) {
        let _ = self.events.send(TransportEvent::CharacteristicChanged {
            characteristic: self.profile.read,
            value,
        });
    }

    pub fn is_connected(&self) -> bool {
        self.model().connected
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.model().operations.clone()
    }

    /// Calls that arrived while a previous one had not completed yet.
    pub fn violations(&self) -> usize {
        self.model().violations
    }

    pub fn commands(&self) -> Vec<u8> {
        self.model().commands.clone()
    }

    pub fn acks(&self) -> Vec<u8> {
        self.model().acks.clone()
    }

    fn begin(&self, op: Operation) -> Result<Option<GattStatus>> {
        let mut model = self.model();
        if std::mem::take(&mut model.refuse_next) {
            log::debug!("Simulated device refused {}", op.name());
            return Err(TransportError::ConnectionFailed(format!("{} refused", op.name())));
        }
        if !model.connected && !matches!(op, Operation::Connect { .. }) {
            return Err(TransportError::NotConnected);
        }
        if model.in_flight {
            model.violations += 1;
            log::warn!("Simulated device: {} started while another operation is outstanding", op.name());
        }
        model.in_flight = true;
        model.operations.push(op);
        Ok(model.faults.pop_front())
    }

    /// Deliver completions and any follow-up notifications after the latency.
    fn complete(&self, completions: Vec<TransportEvent>, replies: Vec<Vec<u8>>, interval: Duration) {
        let characteristic = self.profile.read;
        if self.latency.is_zero() && interval.is_zero() {
            self.model().in_flight = false;
            for event in completions {
                let _ = self.events.send(event);
            }
            for value in replies {
                let _ = self.events.send(TransportEvent::CharacteristicChanged { characteristic, value });
            }
            return;
        }

        let events = self.events.clone();
        let model = self.model.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            model.lock().unwrap_or_else(|e| e.into_inner()).in_flight = false;
            for event in completions {
                let _ = events.send(event);
            }
            for value in replies {
                tokio::time::sleep(interval).await;
                let _ = events.send(TransportEvent::CharacteristicChanged { characteristic, value });
            }
        });
    }

    fn handle_write(&self, payload: &[u8]) -> Vec<Vec<u8>> {
        let framed = payload.starts_with(b"data:");
        let body = match frame::unwrap(payload) {
            Ok(body) => body.to_vec(),
            Err(e) => {
                log::warn!("Simulated device got a bad frame: {}", e);
                return Vec::new();
            }
        };
        let mut model = self.model();
        let replies = match self.family {
            DeviceFamily::XBle => xble_reply(&mut model, &body),
            DeviceFamily::Sap => {
                if body.len() == 1 && body[0] & 0x7f == 0x55 {
                    model.acks.push(body[0]);
                } else if let Some(code) = body.first() {
                    model.commands.push(*code);
                }
                Vec::new()
            }
        };
        if model.silent {
            return Vec::new();
        }
        if framed {
            replies.into_iter().filter_map(|r| frame::wrap(&r).ok()).collect()
        } else {
            replies
        }
    }
}

fn read_memory(model: &DeviceModel, addr: u16, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| model.memory.get(&addr.wrapping_add(i as u16)).copied().unwrap_or(0))
        .collect()
}

fn write_memory(model: &mut DeviceModel, addr: u16, data: &[u8]) {
    for (i, b) in data.iter().enumerate() {
        model.memory.insert(addr.wrapping_add(i as u16), *b);
    }
}

fn checksum_reply(model: &DeviceModel, block: u8, data: &[u8]) -> Vec<u8> {
    let mut checksum = frame::block_checksum(data);
    if model.corrupt_from.is_some_and(|first| block >= first) {
        checksum = checksum.wrapping_add(1);
    }
    frame::checksum_frame(block, checksum)
}

fn xble_reply(model: &mut DeviceModel, body: &[u8]) -> Vec<Vec<u8>> {
    let Some(&cmd) = body.first() else {
        return Vec::new();
    };
    let addr = || u16::from_le_bytes([body[1], body[2]]);

    match (cmd, body.len()) {
        (frame::CMD_READ_MEMORY, 3) => {
            vec![frame::memory_reply(cmd, addr(), &read_memory(model, addr(), 4))]
        }
        (frame::CMD_READ_MEMORY_N, 4) => {
            let len = body[3] as usize;
            vec![frame::memory_reply(cmd, addr(), &read_memory(model, addr(), len))]
        }
        (frame::CMD_WRITE_MEMORY, 7) => {
            write_memory(model, addr(), &body[3..7]);
            vec![frame::memory_reply(cmd, addr(), &read_memory(model, addr(), 4))]
        }
        (frame::CMD_WRITE_MEMORY_N, n) if n >= 4 && n == 4 + body[3] as usize => {
            let len = body[3] as usize;
            write_memory(model, addr(), &body[4..]);
            vec![frame::memory_reply(cmd, addr(), &read_memory(model, addr(), len))]
        }
        (frame::CMD_READ_BLOCK, 3) => {
            let block = body[1];
            let data = model.flash.get(&block).copied().unwrap_or([0xff; FIRMWARE_BLOCK_SIZE]);
            let [first, second] = frame::block_half_frames(block, &data);
            vec![first, second, checksum_reply(model, block, &data)]
        }
        (frame::CMD_WRITE_BLOCK, n) if n == 3 + FIRMWARE_HALF_SIZE => {
            let (block, index) = (body[1], body[2]);
            let half = body[3..].to_vec();
            match (index, model.upload_half.take()) {
                (0, _) => {
                    model.upload_half = Some((block, half));
                    Vec::new()
                }
                (1, Some((pending, mut data))) if pending == block => {
                    data.extend_from_slice(&half);
                    let mut stored = [0u8; FIRMWARE_BLOCK_SIZE];
                    stored.copy_from_slice(&data);
                    model.flash.insert(block, stored);
                    vec![checksum_reply(model, block, &data)]
                }
                _ => Vec::new(),
            }
        }
        (frame::CMD_SIGNATURE, 1) => {
            let mut reply = vec![frame::CMD_SIGNATURE];
            reply.extend_from_slice(&model.signature);
            vec![reply]
        }
        (code, 1) => {
            model.commands.push(code);
            let status = model.memory.entry(STATUS_ADDRESS).or_insert(0);
            match DeviceCommand::from_code(code) {
                Some(DeviceCommand::CalibOn) => *status |= CALIB_MODE_BIT,
                Some(DeviceCommand::CalibOff) => *status &= !CALIB_MODE_BIT,
                _ => {}
            }
            // A measure trigger releases the next queued shot.
            if code == DeviceCommand::Measure.code() {
                model.shots.pop_front().into_iter().collect()
            } else {
                Vec::new()
            }
        }
        _ => {
            log::warn!("Simulated device ignored command {:02x?}", body);
            Vec::new()
        }
    }
}

#[async_trait::async_trait]
impl GattTransport for SimulatedDevice {
    async fn connect(&self, target: &str) -> Result<()> {
        let fault = self.begin(Operation::Connect { target: target.to_string() })?;
        if self.model().unreachable {
            return Ok(());
        }
        let completions = match fault {
            Some(status) => vec![TransportEvent::ConnectionChanged { status, connected: false }],
            None => {
                self.model().connected = true;
                vec![
                    TransportEvent::ConnectionChanged { status: GattStatus::SUCCESS, connected: true },
                    TransportEvent::ServicesDiscovered { status: GattStatus::SUCCESS },
                ]
            }
        };
        self.complete(completions, Vec::new(), Duration::ZERO);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let fault = self.begin(Operation::Disconnect)?;
        {
            let mut model = self.model();
            model.connected = false;
            model.notify_enabled = false;
        }
        let status = fault.unwrap_or(GattStatus::SUCCESS);
        self.complete(vec![TransportEvent::ConnectionChanged { status, connected: false }], Vec::new(), Duration::ZERO);
        Ok(())
    }

    async fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let fault = self.begin(Operation::CharacteristicRead { service, characteristic })?;
        let value = self.model().shots.pop_front().unwrap_or_default();
        let status = fault.unwrap_or(GattStatus::SUCCESS);
        self.complete(
            vec![TransportEvent::CharacteristicRead { status, characteristic, value }],
            Vec::new(),
            Duration::ZERO,
        );
        Ok(())
    }

    async fn write_characteristic(&self, service: Uuid, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        if characteristic != self.profile.write {
            return Err(TransportError::UnknownCharacteristic(characteristic));
        }
        let fault = self.begin(Operation::CharacteristicWrite {
            service,
            characteristic,
            payload: payload.to_vec(),
        })?;
        let (status, replies) = match fault {
            Some(status) => (status, Vec::new()),
            None => (GattStatus::SUCCESS, self.handle_write(payload)),
        };
        self.complete(vec![TransportEvent::CharacteristicWritten { status, characteristic }], replies, Duration::ZERO);
        Ok(())
    }

    async fn enable_notify(&self, service: Uuid, characteristic: Uuid, enable: bool) -> Result<()> {
        let fault = self.begin(Operation::EnableNotify { service, characteristic, enable })?;
        let status = fault.unwrap_or(GattStatus::SUCCESS);
        let (stream, interval) = {
            let mut model = self.model();
            model.notify_enabled = enable && status.is_success();
            if model.notify_enabled {
                (model.stream.drain(..).collect(), model.stream_interval)
            } else {
                (Vec::new(), Duration::ZERO)
            }
        };
        self.complete(vec![TransportEvent::DescriptorWritten { status, characteristic }], stream, interval);
        Ok(())
    }

    async fn close(&self) {
        let mut model = self.model();
        model.connected = false;
        model.notify_enabled = false;
        model.in_flight = false;
        model.upload_half = None;
    }
}
