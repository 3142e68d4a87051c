use softbus::header::TLM_HEADER_LEN;
use softbus::*;
use std::sync::Arc;

fn setup() -> (SoftwareBus, Arc<TaskRegistry>, AppId) {
    let config = BusConfig::default();
    let registry = Arc::new(TaskRegistry::new());
    let app = registry.register_app("ZC_APP").unwrap();
    registry.bind_current_thread(app).unwrap();
    let events = Arc::new(RecordingEventSink::new());
    let services = BusServices::new(registry.clone(), &config).with_events(events);
    (SoftwareBus::new(config, services).unwrap(), registry, app)
}

/// Fill `buffer` in place with a telemetry packet for `msg_id`.
fn fill(bus: &SoftwareBus, buffer: &mut ZeroCopyBuffer, msg_id: MsgId, payload: &[u8]) {
    let packet = CcsdsHeader::new()
        .build_telemetry(msg_id, 7, 0, payload)
        .unwrap();
    bus.write_zero_copy(buffer, |bytes| bytes[..packet.len()].copy_from_slice(&packet))
        .unwrap();
}

#[test]
fn test_zero_copy_transmit_delivers_same_buffer() {
    let (bus, _registry, _app) = setup();
    let p1 = bus.create_pipe(4, "ZC1").unwrap();
    let p2 = bus.create_pipe(4, "ZC2").unwrap();
    bus.subscribe(MsgId::new(0x400), p1).unwrap();
    bus.subscribe(MsgId::new(0x400), p2).unwrap();

    // room to spare; the header length decides the delivered size
    let mut buffer = bus.allocate_message_buffer(128).unwrap();
    assert_eq!(buffer.size(), 128);
    fill(&bus, &mut buffer, MsgId::new(0x400), b"in place");
    let handle = buffer.handle();

    let report = bus.transmit_buffer(buffer, true).unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(bus.pool_stats().buffers_in_use, 1);

    let first = bus.receive_buffer(p1, Timeout::Poll).unwrap().message().unwrap();
    let second = bus.receive_buffer(p2, Timeout::Poll).unwrap().message().unwrap();
    assert_eq!(first.buffer, handle);
    assert_eq!(second.buffer, handle);
    assert_eq!(first.size, TLM_HEADER_LEN + 8);

    let bytes = bus.copy_message(first.buffer).unwrap();
    assert_eq!(&bytes[TLM_HEADER_LEN..], b"in place");
    assert_eq!(bus.header().sequence_count(&bytes).unwrap(), 1);
}

#[test]
fn test_zero_copy_without_subscribers_returns_buffer() {
    let (bus, _registry, _app) = setup();
    let free_before = bus.free_pool_bytes();
    let mut buffer = bus.allocate_message_buffer(64).unwrap();
    fill(&bus, &mut buffer, MsgId::new(0x401), b"nobody");

    let report = bus.transmit_buffer(buffer, false).unwrap();
    assert!(report.no_subscribers);
    assert_eq!(bus.free_pool_bytes(), free_before);
}

#[test]
fn test_release_returns_memory() {
    let (bus, _registry, _app) = setup();
    let free_before = bus.free_pool_bytes();
    let buffer = bus.allocate_message_buffer(2000).unwrap();
    assert!(bus.free_pool_bytes() < free_before);

    bus.release_message_buffer(buffer).unwrap();
    assert_eq!(bus.free_pool_bytes(), free_before);
    assert_eq!(bus.pool_stats().buffers_in_use, 0);
}

#[test]
fn test_buffer_stale_after_cleanup() {
    let (bus, _registry, app) = setup();
    let mut buffer = bus.allocate_message_buffer(64).unwrap();
    let report = bus.cleanup_app(app);
    assert_eq!(report.buffers_released, 1);

    assert!(matches!(
        bus.write_zero_copy(&mut buffer, |bytes| bytes.fill(1)),
        Err(BusError::BufferInvalid(_))
    ));
    assert!(matches!(
        bus.transmit_buffer(buffer, false),
        Err(BusError::BufferInvalid(_))
    ));
    assert_eq!(bus.counters().msg_send_error_counter, 1);
}

#[test]
fn test_oversize_allocation_rejected() {
    let (bus, _registry, _app) = setup();
    let max = bus.config().max_msg_size;
    assert!(matches!(
        bus.allocate_message_buffer(max + 1),
        Err(BusError::MsgTooBig { .. })
    ));
    assert!(bus.allocate_message_buffer(max).is_ok());
}

#[test]
fn test_allocation_needs_registered_caller() {
    let (bus, registry, _app) = setup();
    registry.unbind_current_thread();
    assert!(matches!(
        bus.allocate_message_buffer(16),
        Err(BusError::Identity(_))
    ));
}

#[test]
fn test_header_claiming_more_than_buffer_is_rejected() {
    let (bus, _registry, _app) = setup();
    let pipe = bus.create_pipe(4, "SHORT").unwrap();
    bus.subscribe(MsgId::new(0x402), pipe).unwrap();

    let mut buffer = bus.allocate_message_buffer(16).unwrap();
    let packet = CcsdsHeader::new()
        .build_telemetry(MsgId::new(0x402), 0, 0, &[0u8; 32])
        .unwrap();
    bus.write_zero_copy(&mut buffer, |bytes| bytes.copy_from_slice(&packet[..16]))
        .unwrap();

    assert!(matches!(
        bus.transmit_buffer(buffer, false),
        Err(BusError::BadArgument(_))
    ));
    assert_eq!(bus.pool_stats().buffers_in_use, 0);
    assert!(!bus.receive_buffer(pipe, Timeout::Poll).unwrap().is_message());
}
