use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

use super::bridge;
use super::classifier::{Recovery, RetryIntent};
use super::queue::OperationQueue;
use super::session::{Session, SessionInfo, SessionMessage};
use super::state::{ConnectionState, ConnectionStateMachine};
use super::{CommError, DataListener, Result, StatusListener};
use crate::config::CommConfig;
use crate::protocol::{
    frame, DeviceCommand, DeviceFamily, GattProfile, PacketType, PendingReply, ProtocolError, CALIB_MODE_BIT,
    COEFF_ADDRESS, COEFF_LEN, FIRMWARE_ADDRESS, HARDWARE_ADDRESS, STATUS_ADDRESS,
};
use crate::transport::{self, EventReceiver, GattStatus, GattTransport, Operation, TransportEvent};

/// Firmware and hardware identification words.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub firmware: [u8; 4],
    pub hardware: [u8; 4],
}

impl DeviceInfo {
    pub fn firmware_hex(&self) -> String {
        hex::encode(self.firmware)
    }

    pub fn hardware_hex(&self) -> String {
        hex::encode(self.hardware)
    }
}

pub struct DeviceCommBuilder {
    transport: Arc<dyn GattTransport>,
    events: EventReceiver,
    family: DeviceFamily,
    config: CommConfig,
    status_listener: Option<Arc<dyn StatusListener>>,
}

impl DeviceCommBuilder {
    pub fn new(transport: Arc<dyn GattTransport>, events: EventReceiver) -> Self {
        Self {
            transport,
            events,
            family: DeviceFamily::XBle,
            config: CommConfig::default(),
            status_listener: None,
        }
    }

    pub fn family(mut self, family: DeviceFamily) -> Self {
        self.family = family;
        self
    }

    pub fn config(mut self, config: CommConfig) -> Self {
        self.config = config;
        self
    }

    pub fn status_listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.status_listener = Some(listener);
        self
    }

    /// Spawn the event dispatcher. Must be called inside a tokio runtime.
    pub fn build(self) -> DeviceComm {
        let state = ConnectionStateMachine::new();
        state.set_listener(self.status_listener);
        let inner = Arc::new(CommInner {
            transport: self.transport,
            family: self.family,
            profile: self.family.profile(),
            config: self.config,
            queue: Mutex::new(OperationQueue::new()),
            idle: Notify::new(),
            state,
            intent: RetryIntent::new(),
            session: Mutex::new(None),
            target: Mutex::new(None),
            closing: AtomicBool::new(false),
        });
        let dispatcher = tokio::spawn(dispatch(inner.clone(), self.events));
        DeviceComm { inner, dispatcher }
    }
}

struct CommInner {
    transport: Arc<dyn GattTransport>,
    family: DeviceFamily,
    profile: GattProfile,
    config: CommConfig,
    queue: Mutex<OperationQueue>,
    idle: Notify,
    state: ConnectionStateMachine,
    intent: RetryIntent,
    session: Mutex<Option<Arc<Session>>>,
    target: Mutex<Option<String>>,
    closing: AtomicBool,
}

fn write_op(profile: &GattProfile, payload: Vec<u8>) -> Operation {
    Operation::CharacteristicWrite { service: profile.service, characteristic: profile.write, payload }
}

impl CommInner {
    fn queue(&self) -> MutexGuard<'_, OperationQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session_slot(&self) -> MutexGuard<'_, Option<Arc<Session>>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session_slot().clone()
    }

    fn target(&self) -> Option<String> {
        self.target.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn enqueue(&self, op: Operation) -> usize {
        log::debug!("Enqueue {}", op.name());
        self.queue().enqueue(op)
    }

    fn complete_current(&self) {
        let idle = {
            let mut queue = self.queue();
            queue.complete();
            queue.is_idle()
        };
        if idle {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.idle.notified();
            if self.queue().is_idle() {
                return true;
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.queue().is_idle();
            }
        }
    }

    /// Start the head of the queue unless an operation is already outstanding.
    async fn advance(&self) {
        loop {
            let Some(op) = self.queue().next() else {
                return;
            };
            match self.execute(&op).await {
                Ok(()) => return,
                Err(e) => {
                    log::warn!("{} refused by transport: {}", op.name(), e);
                    self.complete_current();
                    if matches!(op, Operation::Connect { .. } | Operation::Disconnect) {
                        self.teardown(true).await;
                        return;
                    }
                }
            }
        }
    }

    async fn execute(&self, op: &Operation) -> transport::Result<()> {
        log::debug!("Starting {}", op.name());
        match op {
            Operation::Connect { target } => self.transport.connect(target).await,
            Operation::Disconnect => self.transport.disconnect().await,
            Operation::CharacteristicRead { service, characteristic } => {
                self.transport.read_characteristic(*service, *characteristic).await
            }
            Operation::CharacteristicWrite { service, characteristic, payload } => {
                self.transport.write_characteristic(*service, *characteristic, payload).await
            }
            Operation::EnableNotify { service, characteristic, enable } => {
                self.transport.enable_notify(*service, *characteristic, *enable).await
            }
        }
    }

    fn open_session(self: &Arc<Self>, target: &str, listener: Option<Arc<dyn DataListener>>) -> Arc<Session> {
        let (session, rx) = Session::new(target, self.family, listener);
        tokio::spawn(consume(Arc::downgrade(self), session.clone(), rx));
        if let Some(old) = self.session_slot().replace(session.clone()) {
            old.shutdown();
        }
        session
    }

    /// Drop the session and every queued operation, then report DISCONNECTED.
    async fn teardown(&self, close_transport: bool) {
        if close_transport {
            self.transport.close().await;
        }
        self.queue().reset();
        self.idle.notify_waiters();
        if let Some(session) = self.session_slot().take() {
            session.shutdown();
        }
        self.intent.finish_attempt();
        if let Err(e) = self.state.transition(ConnectionState::Disconnected) {
            log::warn!("{}", e);
        }
    }

    async fn reconnect(self: &Arc<Self>) {
        let Some(target) = self.target() else {
            self.teardown(true).await;
            return;
        };
        let listener = self.session().and_then(|s| s.listener());
        self.transport.close().await;
        self.queue().reset();
        if let Err(e) = self.state.transition(ConnectionState::Waiting) {
            log::warn!("{}", e);
        }
        self.open_session(&target, listener);
        self.enqueue(Operation::Connect { target });
        self.advance().await;
    }

    async fn handle_failure(self: &Arc<Self>, operation: &'static str, status: GattStatus) {
        let name = self.queue().current().map(|op| op.name()).unwrap_or(operation);
        match self.intent.decide(status) {
            Recovery::Proceed => {
                self.complete_current();
                self.advance().await;
            }
            Recovery::SurfaceError => {
                log::error!("{} failed with status {}: access refused", name, status);
                if let Some(session) = self.session() {
                    session.fail_pending();
                }
                self.complete_current();
                self.advance().await;
            }
            Recovery::Reconnect => {
                log::warn!("{} failed with status {}: reconnecting once", name, status);
                self.reconnect().await;
            }
            Recovery::Close => {
                log::error!("{} failed with status {}: closing link", name, status);
                self.teardown(true).await;
            }
        }
    }

    async fn complete_with(self: &Arc<Self>, operation: &'static str, status: GattStatus) {
        if !status.is_success() {
            return self.handle_failure(operation, status).await;
        }
        self.complete_current();
        self.advance().await;
    }

    async fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionChanged { status, connected } => {
                if !status.is_success() {
                    return self.handle_failure("connection", status).await;
                }
                if connected {
                    log::info!("Link up, waiting for services");
                    self.complete_current();
                    self.advance().await;
                } else {
                    if self.closing.load(Ordering::SeqCst) {
                        log::info!("Link closed");
                    } else {
                        log::warn!("Link lost");
                    }
                    self.teardown(false).await;
                }
            }
            TransportEvent::ServicesDiscovered { status } => {
                if !status.is_success() {
                    return self.handle_failure("service discovery", status).await;
                }
                self.intent.finish_attempt();
                self.enqueue(Operation::EnableNotify {
                    service: self.profile.service,
                    characteristic: self.profile.read,
                    enable: true,
                });
                if let Err(e) = self.state.transition(ConnectionState::Connected) {
                    log::warn!("{}", e);
                }
                self.advance().await;
            }
            TransportEvent::DescriptorWritten { status, .. } => self.complete_with("enable notify", status).await,
            TransportEvent::CharacteristicWritten { status, .. } => {
                self.complete_with("characteristic write", status).await
            }
            TransportEvent::CharacteristicRead { status, value, .. } => {
                if status.is_success() && !value.is_empty() {
                    if let Some(session) = self.session() {
                        session.push(value);
                    }
                }
                self.complete_with("characteristic read", status).await
            }
            TransportEvent::CharacteristicChanged { characteristic, value } => {
                if characteristic != self.profile.read {
                    log::debug!("Ignoring notification from {}", characteristic);
                    return;
                }
                match self.session() {
                    Some(session) => session.push(value),
                    None => log::debug!("Notification without a session dropped"),
                }
            }
            TransportEvent::MtuChanged { status, mtu } => {
                log::debug!("MTU changed to {} (status {})", mtu, status);
            }
        }
    }
}

/// Callback context: applies transport completions in arrival order.
async fn dispatch(inner: Arc<CommInner>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        inner.handle_event(event).await;
    }
    log::debug!("Transport event channel closed");
}

/// Per-session consumer: decodes notifications off the callback context.
async fn consume(inner: Weak<CommInner>, session: Arc<Session>, mut rx: mpsc::UnboundedReceiver<SessionMessage>) {
    while let Some(message) = rx.recv().await {
        let raw = match message {
            SessionMessage::Packet(raw) => raw,
            SessionMessage::Quit => break,
        };
        if let Some(ack) = session.handle_packet(&raw) {
            let Some(inner) = inner.upgrade() else { break };
            inner.enqueue(write_op(&session.profile, ack));
            inner.advance().await;
        }
    }
    log::debug!("Session {} consumer stopped", session.id);
}

/// Communication front end for one instrument.
///
/// Command/response calls suspend the caller until the matching reply is
/// decoded or the configured timeout expires. Only one caller should issue
/// such calls at a time: the reply slot is shared.
pub struct DeviceComm {
    inner: Arc<CommInner>,
    dispatcher: JoinHandle<()>,
}

impl DeviceComm {
    pub fn builder(transport: Arc<dyn GattTransport>, events: EventReceiver) -> DeviceCommBuilder {
        DeviceCommBuilder::new(transport, events)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn set_status_listener(&self, listener: Option<Arc<dyn StatusListener>>) {
        self.inner.state.set_listener(listener);
    }

    /// Overrides `reconnect_on_transient` for this and every later connection.
    pub fn set_reconnect_intent(&self, enabled: bool) {
        self.inner.intent.choose(enabled);
    }

    pub fn config(&self) -> &CommConfig {
        &self.inner.config
    }

    pub fn family(&self) -> DeviceFamily {
        self.inner.family
    }

    /// Operations waiting behind the outstanding one.
    pub fn queue_len(&self) -> usize {
        self.inner.queue().len()
    }

    pub fn has_outstanding(&self) -> bool {
        self.inner.queue().is_busy()
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.inner.session().map(|s| s.info(self.state()))
    }

    pub(super) fn connected_session(&self) -> Result<Arc<Session>> {
        match self.inner.session() {
            Some(session) if self.is_connected() => Ok(session),
            _ => Err(CommError::NotConnected),
        }
    }

    pub(super) fn require_memory_family(&self, operation: &'static str) -> Result<()> {
        if self.inner.family.supports_memory() {
            Ok(())
        } else {
            Err(CommError::Unsupported { family: self.inner.family.name(), operation })
        }
    }

    /// Start connecting to `address`. Returns once the connect is queued.
    pub async fn connect(&self, address: &str, listener: Option<Arc<dyn DataListener>>) -> Result<()> {
        let inner = &self.inner;
        if let Some(session) = inner.session() {
            if session.target != address {
                return Err(CommError::AlreadyConnected(session.target.clone()));
            }
            if listener.is_some() {
                session.set_listener(listener);
            }
            return Ok(());
        }

        log::info!("Connecting to {} ({})", address, inner.family.name());
        inner.state.transition(ConnectionState::Waiting)?;
        inner.intent.seed(inner.config.reconnect_on_transient);
        *inner.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(address.to_string());
        inner.open_session(address, listener);
        inner.enqueue(Operation::Connect { target: address.to_string() });
        inner.advance().await;
        Ok(())
    }

    /// User-initiated close: WAITING, then DISCONNECTED once the link confirms
    /// (or after the disconnect timeout, by force).
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.intent.set(false);
        if inner.session().is_none() && self.state() == ConnectionState::Disconnected {
            return Ok(());
        }

        inner.closing.store(true, Ordering::SeqCst);
        let mut rx = inner.state.subscribe();
        if let Err(e) = inner.state.transition(ConnectionState::Waiting) {
            log::debug!("{}", e);
        }
        let dropped = inner.queue().clear();
        if dropped > 0 {
            log::info!("Discarded {} queued operations", dropped);
        }
        inner.enqueue(Operation::Disconnect);
        inner.advance().await;

        let confirmed = matches!(
            timeout(inner.config.disconnect_timeout(), rx.wait_for(|s| *s == ConnectionState::Disconnected)).await,
            Ok(Ok(_))
        );
        if !confirmed {
            log::warn!("Disconnect not confirmed, closing link");
            inner.teardown(true).await;
        }
        inner.closing.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Connect on demand and wait until CONNECTED. Returns `true` when an
    /// existing connection was reused.
    pub async fn ensure_connected(&self, address: &str) -> Result<bool> {
        match self.inner.session() {
            Some(session) if session.target != address => {
                return Err(CommError::AlreadyConnected(session.target.clone()));
            }
            Some(_) if self.is_connected() => return Ok(true),
            Some(_) => {}
            None => self.connect(address, None).await?,
        }

        let mut rx = self.inner.state.subscribe();
        let settled = match timeout(
            self.inner.config.connect_timeout(),
            rx.wait_for(|s| *s != ConnectionState::Waiting),
        )
        .await
        {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        };

        match settled {
            Some(ConnectionState::Connected) => Ok(false),
            Some(_) => Err(CommError::ConnectFailed(address.to_string())),
            None => {
                log::warn!(
                    "Connection to {} not established within {} ms",
                    address,
                    self.inner.config.connect_timeout_ms
                );
                self.inner.teardown(true).await;
                Err(CommError::ConnectTimeout(address.to_string()))
            }
        }
    }

    /// Fire-and-forget one-byte command. Nothing is queued when not connected.
    pub async fn send_command(&self, code: u8) -> Result<()> {
        if code == 0 {
            return Err(CommError::InvalidArgument("command code 0".into()));
        }
        let session = self.connected_session()?;
        let payload = session.frame_command(&[code], self.inner.config.frame_commands)?;
        log::info!("Sending command {:#04x}", code);
        self.inner.enqueue(write_op(&session.profile, payload));
        drop(session);
        self.inner.advance().await;
        Ok(())
    }

    /// Ask the transport to read the data characteristic; the value is
    /// decoded like a notification.
    pub async fn request_read(&self) -> Result<()> {
        let session = self.connected_session()?;
        self.inner.enqueue(Operation::CharacteristicRead {
            service: session.profile.service,
            characteristic: session.profile.read,
        });
        drop(session);
        self.inner.advance().await;
        Ok(())
    }

    /// Write `commands` in order and wait for a reply of type `expected`.
    pub(super) async fn exchange(
        &self,
        commands: &[&[u8]],
        expected: PacketType,
        wait: Duration,
        operation: &'static str,
    ) -> Result<PendingReply> {
        self.require_memory_family(operation)?;
        let (mut rx, ops) = {
            let session = self.connected_session()?;
            let mut ops = Vec::with_capacity(commands.len());
            for command in commands {
                let payload = session.frame_command(command, self.inner.config.frame_commands)?;
                ops.push(write_op(&session.profile, payload));
            }
            (session.replies.reset(), ops)
        };

        let deadline = Instant::now() + wait;
        for op in ops {
            self.inner.enqueue(op);
        }
        self.inner.advance().await;
        bridge::await_reply(&mut rx, expected, deadline, operation).await
    }

    pub(super) fn prime_block(&self, block: u8, data: &[u8]) -> Result<()> {
        self.connected_session()?.prime_block(block, data)?;
        Ok(())
    }

    pub async fn read_memory(&self, addr: u16) -> Result<[u8; 4]> {
        log::debug!("Read memory {:#06x}", addr);
        let reply = self
            .exchange(
                &[&frame::read_memory_command(addr)[..]],
                PacketType::MemoryReply,
                self.inner.config.memory_timeout(),
                "read memory",
            )
            .await?;
        check_address(addr, &reply)?;
        let got = reply.payload.len();
        reply
            .payload
            .get(..4)
            .and_then(|p| <[u8; 4]>::try_from(p).ok())
            .ok_or(CommError::Protocol(ProtocolError::LengthMismatch { expected: 4, got }))
    }

    pub async fn read_memory_n(&self, addr: u16, len: usize) -> Result<Vec<u8>> {
        log::debug!("Read memory {:#06x} len {}", addr, len);
        let command = frame::read_memory_n_command(addr, len)?;
        let reply = self
            .exchange(&[&command[..]], PacketType::MemoryReply, self.inner.config.memory_timeout(), "read memory")
            .await?;
        check_address(addr, &reply)?;
        if reply.payload.len() != len {
            return Err(ProtocolError::LengthMismatch { expected: len, got: reply.payload.len() }.into());
        }
        Ok(reply.payload)
    }

    /// Write four bytes. Succeeds only if the device echoes them back unchanged.
    pub async fn write_memory(&self, addr: u16, data: &[u8; 4]) -> Result<()> {
        log::debug!("Write memory {:#06x}", addr);
        let reply = self
            .exchange(
                &[&frame::write_memory_command(addr, data)[..]],
                PacketType::MemoryReply,
                self.inner.config.memory_timeout(),
                "write memory",
            )
            .await?;
        check_address(addr, &reply)?;
        if reply.payload != data {
            return Err(ProtocolError::EchoMismatch(addr).into());
        }
        Ok(())
    }

    pub async fn write_memory_n(&self, addr: u16, data: &[u8], len: usize) -> Result<()> {
        log::debug!("Write memory {:#06x} len {}", addr, len);
        let command = frame::write_memory_n_command(addr, data, len)?;
        let reply = self
            .exchange(&[&command[..]], PacketType::MemoryReply, self.inner.config.memory_timeout(), "write memory")
            .await?;
        check_address(addr, &reply)?;
        if reply.payload != data[..len] {
            return Err(ProtocolError::EchoMismatch(addr).into());
        }
        Ok(())
    }

    pub async fn read_device_info(&self) -> Result<DeviceInfo> {
        let firmware = self.read_memory(FIRMWARE_ADDRESS).await?;
        let hardware = self.read_memory(HARDWARE_ADDRESS).await?;
        log::info!("Device firmware {} hardware {}", hex::encode(firmware), hex::encode(hardware));
        Ok(DeviceInfo { firmware, hardware })
    }

    pub async fn read_firmware_signature(&self, address: &str) -> Result<Vec<u8>> {
        self.require_memory_family("read firmware signature")?;
        self.ensure_connected(address).await?;
        let result = self
            .exchange(
                &[&[frame::CMD_SIGNATURE][..]],
                PacketType::Signature,
                self.inner.config.firmware_timeout(),
                "read firmware signature",
            )
            .await;
        self.disconnect().await?;
        Ok(result?.payload)
    }

    /// Read the 52 calibration coefficient bytes, then disconnect.
    pub async fn read_coeff(&self, address: &str) -> Result<Vec<u8>> {
        self.require_memory_family("read coefficients")?;
        self.ensure_connected(address).await?;
        let result = self.read_memory_n(COEFF_ADDRESS, COEFF_LEN).await;
        self.disconnect().await?;
        result
    }

    pub async fn write_coeff(&self, address: &str, coeff: &[u8]) -> Result<()> {
        self.require_memory_family("write coefficients")?;
        if coeff.len() < COEFF_LEN {
            return Err(CommError::InvalidArgument(format!(
                "{} coefficient bytes, expected {}",
                coeff.len(),
                COEFF_LEN
            )));
        }
        self.ensure_connected(address).await?;
        let result = self.write_memory_n(COEFF_ADDRESS, coeff, COEFF_LEN).await;
        self.disconnect().await?;
        result
    }

    /// Flip calibration mode based on the status word. Returns the new mode.
    pub async fn toggle_calib_mode(&self, address: &str) -> Result<bool> {
        self.require_memory_family("toggle calibration mode")?;
        self.ensure_connected(address).await?;
        let status = match self.read_memory_n(STATUS_ADDRESS, 4).await {
            Ok(status) => status,
            Err(e) => {
                self.disconnect().await?;
                return Err(e);
            }
        };
        let turn_on = status[0] & CALIB_MODE_BIT == 0;
        let command = if turn_on { DeviceCommand::CalibOn } else { DeviceCommand::CalibOff };
        let sent = self.send_command(command.code()).await;
        self.inner.wait_idle(self.inner.config.memory_timeout()).await;
        self.disconnect().await?;
        sent.map(|_| turn_on)
    }

    /// Send a laser/measure command. With `close` set, wait for up to
    /// `to_read` data packets and then disconnect; otherwise return right
    /// after the command is queued. Returns how many packets arrived.
    pub async fn laser_command(
        &self,
        address: &str,
        command: DeviceCommand,
        to_read: usize,
        close: bool,
    ) -> Result<usize> {
        self.ensure_connected(address).await?;
        let (id, session, mut rx) = self.watch_session()?;
        let start = session.upgrade().map(|s| s.packet_count()).unwrap_or_default();

        self.send_command(command.code()).await?;
        if !close {
            let seen = session.upgrade().map(|s| s.packet_count().saturating_sub(start)).unwrap_or_default();
            return Ok(seen.min(to_read));
        }

        let wait = self.inner.config.download_packet_timeout();
        let mut received = 0;
        loop {
            if let Some(s) = session.upgrade() {
                received = s.packet_count().saturating_sub(start);
            }
            if received >= to_read || !self.session_is(id) {
                break;
            }
            if bridge::await_data(&mut rx, wait).await.is_none() {
                if let Some(s) = session.upgrade() {
                    received = s.packet_count().saturating_sub(start);
                }
                break;
            }
        }

        self.inner.wait_idle(self.inner.config.memory_timeout()).await;
        self.disconnect().await?;
        Ok(received.min(to_read))
    }

    /// Batch download: collect data packets until the stream stops, then
    /// disconnect. Each record is a data packet plus a vector packet.
    pub async fn download_data(&self, address: &str, listener: Option<Arc<dyn DataListener>>) -> Result<usize> {
        log::info!("Batch download from {}", address);
        match self.inner.session() {
            Some(session) if session.target == address => {
                if listener.is_some() {
                    session.set_listener(listener);
                }
                session.reset_packet_count();
            }
            Some(session) => return Err(CommError::AlreadyConnected(session.target.clone())),
            None => self.connect(address, listener).await?,
        }
        self.ensure_connected(address).await?;

        let (id, session, mut rx) = self.watch_session()?;
        tokio::time::sleep(self.inner.config.download_settle()).await;

        let wait = self.inner.config.download_packet_timeout();
        let mut packets = 0;
        loop {
            let next = bridge::await_data(&mut rx, wait).await;
            if let Some(s) = session.upgrade() {
                packets = s.packet_count();
            }
            if !self.session_is(id) {
                log::warn!("Download interrupted: session {} replaced", id);
                break;
            }
            match next {
                Some(packet_type) if packet_type.is_data() => continue,
                Some(packet_type) => {
                    log::info!("Download stopped by {:?} packet", packet_type);
                    break;
                }
                None => {
                    log::info!("Download stream idle");
                    break;
                }
            }
        }

        self.disconnect().await?;
        log::info!("Downloaded {} packets", packets);
        Ok(packets / 2)
    }

    /// Handle on the current session that does not keep it alive, so a
    /// reconnect closes the returned reply receiver.
    fn watch_session(&self) -> Result<(Uuid, Weak<Session>, bridge::ReplyReceiver)> {
        let session = self.connected_session()?;
        Ok((session.id, Arc::downgrade(&session), session.replies.subscribe()))
    }

    fn session_is(&self, id: Uuid) -> bool {
        self.inner.session().is_some_and(|s| s.id == id)
    }
}

fn check_address(expected: u16, reply: &PendingReply) -> Result<()> {
    match reply.address {
        Some(got) if got == expected => Ok(()),
        got => Err(ProtocolError::AddressMismatch { expected, got: got.unwrap_or_default() }.into()),
    }
}

impl Drop for DeviceComm {
    fn drop(&mut self) {
        self.dispatcher.abort();
        if let Some(session) = self.inner.session_slot().take() {
            session.shutdown();
        }
    }
}
