//! Serial successor link: the same operation/event contract over a byte stream.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use uuid::Uuid;

use super::{EventReceiver, EventSender, GattStatus, GattTransport, Result, TransportError, TransportEvent};
use crate::config::CommConfig;
use crate::protocol::{frame, DeviceFamily};

pub const DEFAULT_BAUD_RATE: u32 = 115200;
const OPEN_TIMEOUT: Duration = Duration::from_millis(1000);
const MAX_PARTIAL: usize = 8192;
const KEEP_ON_TRIM: usize = 4096;
const SAP_PACKET_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// Splits an incoming byte stream into packets.
///
/// Framed packets (`"data:" len payload "\r\n"`) are returned whole, framing
/// included. When `raw_len` is set, unframed input is cut into fixed-size
/// packets instead.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    partial: Vec<u8>,
    raw_len: Option<usize>,
    trims: usize,
}

impl FrameSplitter {
    pub fn new(raw_len: Option<usize>) -> Self {
        Self { partial: Vec::new(), raw_len, trims: 0 }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.partial.extend_from_slice(chunk);
        let mut packets = Vec::new();

        loop {
            if let Some(len) = frame::framed_len(&self.partial) {
                packets.push(self.partial.drain(..len).collect());
                continue;
            }
            if self.partial.starts_with(b"data:") {
                break;
            }
            if let Some(pos) = find_prefix(&self.partial) {
                if pos > 0 {
                    if let Some(n) = self.raw_len.filter(|n| pos >= *n) {
                        packets.push(self.partial.drain(..n).collect());
                    } else {
                        log::debug!("Discarding {} bytes before frame header", pos);
                        self.partial.drain(..pos);
                    }
                    continue;
                }
            }
            match self.raw_len {
                Some(n) if self.partial.len() >= n && !could_be_header(&self.partial) => {
                    packets.push(self.partial.drain(..n).collect());
                }
                _ => break,
            }
        }

        if self.partial.len() > MAX_PARTIAL {
            let cut = self.partial.len() - KEEP_ON_TRIM;
            self.partial.drain(..cut);
            self.trims += 1;
            log::warn!("Serial partial buffer trimmed ({} trims so far)", self.trims);
        }
        packets
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    pub fn trims(&self) -> usize {
        self.trims
    }
}

fn find_prefix(buf: &[u8]) -> Option<usize> {
    buf.windows(5).position(|w| w == b"data:")
}

// A short tail that may still grow into "data:".
fn could_be_header(buf: &[u8]) -> bool {
    buf.len() < 5 && b"data:".starts_with(buf)
}

struct SerialLink {
    port_name: String,
    writer: WriteHalf<SerialStream>,
    reader: JoinHandle<()>,
}

pub struct SerialTransport {
    baud_rate: u32,
    notify_characteristic: Uuid,
    raw_packet_len: Option<usize>,
    events: EventSender,
    link: Mutex<Option<SerialLink>>,
}

impl SerialTransport {
    /// Create a transport and the event channel its completions arrive on.
    pub fn new(baud_rate: u32, notify_characteristic: Uuid) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Self {
            baud_rate,
            notify_characteristic,
            raw_packet_len: None,
            events,
            link: Mutex::new(None),
        };
        (transport, rx)
    }

    /// Accept unframed fixed-size packets too (SAP-style data stream).
    pub fn with_raw_packets(mut self, len: usize) -> Self {
        self.raw_packet_len = Some(len);
        self
    }

    /// Transport set up for `family`: configured baud rate, the family's data
    /// characteristic, and fixed 8-byte packets for SAP5.
    pub fn for_family(config: &CommConfig, family: DeviceFamily) -> (Self, EventReceiver) {
        let (transport, rx) = Self::new(config.serial_baud_rate, family.profile().read);
        match family {
            DeviceFamily::Sap => (transport.with_raw_packets(SAP_PACKET_LEN), rx),
            DeviceFamily::XBle => (transport, rx),
        }
    }

    /// List every serial port the OS reports, with USB identity when known.
    pub fn discover_ports() -> Result<Vec<SerialPortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => SerialPortInfo {
                    port_name: port.port_name,
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    serial_number: usb.serial_number,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                },
                _ => SerialPortInfo {
                    port_name: port.port_name,
                    vid: None,
                    pid: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect())
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    async fn drop_link(&self) -> bool {
        match self.link.lock().await.take() {
            Some(link) => {
                link.reader.abort();
                log::info!("Closed serial link on {}", link.port_name);
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl GattTransport for SerialTransport {
    async fn connect(&self, target: &str) -> Result<()> {
        self.drop_link().await;

        let stream = tokio_serial::new(target, self.baud_rate)
            .timeout(OPEN_TIMEOUT)
            .open_native_async()
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", target, e)))?;
        let (reader, writer) = tokio::io::split(stream);
        let reader = tokio::spawn(reader_task(
            reader,
            self.events.clone(),
            self.notify_characteristic,
            FrameSplitter::new(self.raw_packet_len),
        ));

        *self.link.lock().await = Some(SerialLink { port_name: target.to_string(), writer, reader });
        log::info!("Opened serial link on {} at {} baud", target, self.baud_rate);

        self.emit(TransportEvent::ConnectionChanged { status: GattStatus::SUCCESS, connected: true });
        self.emit(TransportEvent::ServicesDiscovered { status: GattStatus::SUCCESS });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.drop_link().await {
            return Err(TransportError::NotConnected);
        }
        self.emit(TransportEvent::ConnectionChanged { status: GattStatus::SUCCESS, connected: false });
        Ok(())
    }

    async fn read_characteristic(&self, _service: Uuid, _characteristic: Uuid) -> Result<()> {
        Err(TransportError::Unsupported("characteristic read over serial"))
    }

    async fn write_characteristic(&self, _service: Uuid, characteristic: Uuid, payload: &[u8]) -> Result<()> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(TransportError::NotConnected)?;
        link.writer.write_all(payload).await?;
        link.writer.flush().await?;
        drop(guard);

        self.emit(TransportEvent::CharacteristicWritten { status: GattStatus::SUCCESS, characteristic });
        Ok(())
    }

    async fn enable_notify(&self, _service: Uuid, characteristic: Uuid, _enable: bool) -> Result<()> {
        if !self.is_connected().await {
            return Err(TransportError::NotConnected);
        }
        self.emit(TransportEvent::DescriptorWritten { status: GattStatus::SUCCESS, characteristic });
        Ok(())
    }

    async fn close(&self) {
        self.drop_link().await;
    }
}

async fn reader_task(
    mut reader: ReadHalf<SerialStream>,
    events: EventSender,
    characteristic: Uuid,
    mut splitter: FrameSplitter,
) {
    let mut buf = [0u8; 512];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::warn!("Serial link reached end of stream");
                break;
            }
            Ok(n) => {
                for value in splitter.push(&buf[..n]) {
                    if events.send(TransportEvent::CharacteristicChanged { characteristic, value }).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                log::warn!("Serial read error: {}", e);
                break;
            }
        }
    }
    let _ = events.send(TransportEvent::ConnectionChanged { status: GattStatus::LINK_LOSS, connected: false });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splitter_handles_fragmented_frames() {
        let mut splitter = FrameSplitter::new(None);
        assert!(splitter.push(b"da").is_empty());
        assert!(splitter.push(b"ta:\x03\x38\x10").is_empty());
        let packets = splitter.push(b"\x80\r\ndata:\x01\x3c\r\n");
        assert_eq!(packets, vec![b"data:\x03\x38\x10\x80\r\n".to_vec(), b"data:\x01\x3c\r\n".to_vec()]);
        assert_eq!(splitter.pending(), 0);
    }

    #[test]
    fn test_splitter_discards_noise_before_header() {
        let mut splitter = FrameSplitter::new(None);
        let packets = splitter.push(b"xx\r\ndata:\x01\x3c\r\n");
        assert_eq!(packets, vec![b"data:\x01\x3c\r\n".to_vec()]);
    }

    #[test]
    fn test_splitter_raw_packets() {
        let mut splitter = FrameSplitter::new(Some(8));
        let packets = splitter.push(&[1, 2, 3, 4, 5, 6, 7, 8, 0x81, 2]);
        assert_eq!(packets, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
        assert_eq!(splitter.pending(), 2);
    }

    #[test]
    fn test_splitter_trims_oversized_partial() {
        let mut splitter = FrameSplitter::new(None);
        assert!(splitter.push(&vec![0u8; MAX_PARTIAL + 1]).is_empty());
        assert_eq!(splitter.trims(), 1);
        assert_eq!(splitter.pending(), KEEP_ON_TRIM);
    }

    #[test]
    fn test_for_family_uses_config() {
        let config = CommConfig { serial_baud_rate: 9600, ..CommConfig::default() };
        let (sap, _rx) = SerialTransport::for_family(&config, DeviceFamily::Sap);
        assert_eq!(sap.baud_rate, 9600);
        assert_eq!(sap.raw_packet_len, Some(8));
        assert_eq!(sap.notify_characteristic, DeviceFamily::Sap.profile().read);

        let (xble, _rx) = SerialTransport::for_family(&config, DeviceFamily::XBle);
        assert_eq!(xble.raw_packet_len, None);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let (transport, _rx) = SerialTransport::new(DEFAULT_BAUD_RATE, Uuid::nil());
        let err = transport.write_characteristic(Uuid::nil(), Uuid::nil(), &[0x3c]).await;
        assert!(matches!(err, Err(TransportError::NotConnected)));
        assert!(matches!(
            transport.read_characteristic(Uuid::nil(), Uuid::nil()).await,
            Err(TransportError::Unsupported(_))
        ));
    }
}
