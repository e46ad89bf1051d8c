use std::sync::Arc;
use std::time::Duration;

use xble_comm::protocol::{frame, ProtocolError, COEFF_ADDRESS, COEFF_LEN, STATUS_ADDRESS};
use xble_comm::{CommError, ConnectionState, DeviceComm, DeviceFamily, GattStatus, SimulatedDevice};

async fn connected(device: &SimulatedDevice, events: xble_comm::transport::EventReceiver) -> DeviceComm {
    let comm = DeviceComm::builder(Arc::new(device.clone()), events).build();
    comm.ensure_connected("sim").await.unwrap();
    comm
}

#[tokio::test(start_paused = true)]
async fn test_write_memory_checks_echo() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    let comm = connected(&device, events).await;

    comm.write_memory(0x8010, &[1, 2, 3, 4]).await.unwrap();
    assert_eq!(device.memory(0x8010, 4), vec![1, 2, 3, 4]);
    assert_eq!(comm.read_memory(0x8010).await.unwrap(), [1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_write_memory_echo_mismatch_fails() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    let comm = connected(&device, events).await;
    device.set_silent(true);

    let responder = device.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        responder.notify(frame::memory_reply(frame::CMD_WRITE_MEMORY, 0x8010, &[9, 9, 9, 9]));
    });

    let result = comm.write_memory(0x8010, &[1, 2, 3, 4]).await;
    assert!(matches!(result, Err(CommError::Protocol(ProtocolError::EchoMismatch(0x8010)))));
}

#[tokio::test(start_paused = true)]
async fn test_reply_for_other_address_fails() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    let comm = connected(&device, events).await;
    device.set_silent(true);

    let responder = device.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        responder.notify(frame::memory_reply(frame::CMD_READ_MEMORY, 0x9000, &[0, 0, 0, 0]));
    });

    let result = comm.read_memory(0x8010).await;
    assert!(matches!(result, Err(CommError::Protocol(ProtocolError::AddressMismatch { .. }))));
}

#[tokio::test(start_paused = true)]
async fn test_read_memory_n_times_out_and_clears_marker() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    let comm = connected(&device, events).await;
    device.set_silent(true);

    let started = tokio::time::Instant::now();
    let result = comm.read_memory_n(0x8010, 52).await;
    assert!(matches!(result, Err(CommError::Timeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert!(!comm.has_outstanding());
    assert!(comm.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_transfer_length_is_bounded() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    let comm = connected(&device, events).await;

    let result = comm.read_memory_n(0x8010, 125).await;
    assert!(matches!(result, Err(CommError::Protocol(ProtocolError::InvalidLength(125)))));
    let data = vec![7u8; 124];
    comm.write_memory_n(0x8100, &data, 124).await.unwrap();
    assert_eq!(comm.read_memory_n(0x8100, 124).await.unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn test_permission_error_fails_exchange_but_keeps_link() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    let comm = connected(&device, events).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    device.push_fault(GattStatus::WRITE_NOT_PERMITTED);
    let result = comm.write_memory(0x8010, &[1, 2, 3, 4]).await;
    assert!(matches!(result, Err(CommError::Protocol(ProtocolError::UnexpectedReply { .. }))));
    assert!(comm.is_connected());

    comm.write_memory(0x8010, &[1, 2, 3, 4]).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_coefficients_round_trip() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    let coeff: Vec<u8> = (0..COEFF_LEN as u8).collect();
    device.set_memory(COEFF_ADDRESS, &coeff);
    let comm = DeviceComm::builder(Arc::new(device.clone()), events).build();

    assert_eq!(comm.read_coeff("sim").await.unwrap(), coeff);
    assert_eq!(comm.state(), ConnectionState::Disconnected);

    let updated: Vec<u8> = coeff.iter().map(|b| b.wrapping_mul(3)).collect();
    comm.write_coeff("sim", &updated).await.unwrap();
    assert_eq!(device.memory(COEFF_ADDRESS, COEFF_LEN), updated);

    assert!(matches!(comm.write_coeff("sim", &updated[..10]).await, Err(CommError::InvalidArgument(_))));
}

#[tokio::test(start_paused = true)]
async fn test_toggle_calib_mode_follows_status_bit() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    let comm = DeviceComm::builder(Arc::new(device.clone()), events).build();

    assert!(comm.toggle_calib_mode("sim").await.unwrap());
    assert_eq!(device.commands(), vec![0x31]);
    assert!(!comm.toggle_calib_mode("sim").await.unwrap());
    assert_eq!(device.commands(), vec![0x31, 0x30]);
    assert_eq!(device.memory(STATUS_ADDRESS, 1), vec![0]);
    assert_eq!(comm.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_device_info_and_signature() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    device.set_memory(0xe000, &[0x02, 0x05, 0x00, 0x00]);
    device.set_memory(0xe004, &[0x41, 0x00, 0x00, 0x00]);
    device.set_signature(&[0xde, 0xad, 0xbe, 0xef]);
    let comm = connected(&device, events).await;

    let info = comm.read_device_info().await.unwrap();
    assert_eq!(info.firmware_hex(), "02050000");
    assert_eq!(info.hardware, [0x41, 0, 0, 0]);

    assert_eq!(comm.read_firmware_signature("sim").await.unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(comm.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_unframed_commands() {
    let (device, events) = SimulatedDevice::new(DeviceFamily::XBle);
    device.set_memory(0x8010, &[5, 6, 7, 8]);
    let config = xble_comm::CommConfig { frame_commands: false, ..Default::default() };
    let comm = DeviceComm::builder(Arc::new(device.clone()), events).config(config).build();
    comm.ensure_connected("sim").await.unwrap();

    assert_eq!(comm.read_memory(0x8010).await.unwrap(), [5, 6, 7, 8]);
    let writes: Vec<_> = device
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            xble_comm::transport::Operation::CharacteristicWrite { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(writes, vec![vec![0x38, 0x10, 0x80]]);
}
