use softbus::*;
use std::sync::Arc;

fn setup() -> (SoftwareBus, Arc<TaskRegistry>, Arc<RecordingEventSink>) {
    let config = BusConfig::default();
    let registry = Arc::new(TaskRegistry::new());
    let app = registry.register_app("LIFECYCLE").unwrap();
    registry.bind_current_thread(app).unwrap();
    let events = Arc::new(RecordingEventSink::new());
    let services = BusServices::new(registry.clone(), &config).with_events(events.clone());
    (SoftwareBus::new(config, services).unwrap(), registry, events)
}

fn tlm(msg_id: u32, payload: &[u8]) -> Vec<u8> {
    CcsdsHeader::new()
        .build_telemetry(MsgId::new(msg_id), 0, 0, payload)
        .unwrap()
}

#[test]
fn test_stale_pipe_id_rejected_after_slot_reuse() {
    let (bus, _registry, _events) = setup();
    let first = bus.create_pipe(4, "FIRST").unwrap();
    bus.delete_pipe(first).unwrap();

    let second = bus.create_pipe(4, "SECOND").unwrap();
    assert_ne!(first, second);

    assert!(matches!(
        bus.subscribe(MsgId::new(0x40), first),
        Err(BusError::InvalidPipe(_))
    ));
    assert!(matches!(bus.get_pipe_opts(first), Err(BusError::InvalidPipe(_))));
    assert!(matches!(bus.delete_pipe(first), Err(BusError::InvalidPipe(_))));
    assert_eq!(bus.get_pipe_name(second).unwrap().as_str(), "SECOND");
}

#[test]
fn test_deleted_name_can_be_reused() {
    let (bus, _registry, _events) = setup();
    let pipe = bus.create_pipe(2, "REUSED").unwrap();
    assert_eq!(bus.get_pipe_id_by_name("REUSED").unwrap(), pipe);

    bus.delete_pipe(pipe).unwrap();
    assert!(bus.get_pipe_id_by_name("REUSED").is_err());
    assert_eq!(bus.counters().get_pipe_id_by_name_error_counter, 1);

    let again = bus.create_pipe(2, "REUSED").unwrap();
    assert_eq!(bus.get_pipe_id_by_name("REUSED").unwrap(), again);
}

#[test]
fn test_delete_drains_queue_and_subscriptions() {
    let (bus, _registry, events) = setup();
    let free_before = bus.free_pool_bytes();

    let pipe = bus.create_pipe(8, "DRAIN").unwrap();
    bus.subscribe(MsgId::new(0x50), pipe).unwrap();
    bus.subscribe(MsgId::new(0x51), pipe).unwrap();
    bus.transmit_msg(&tlm(0x50, b"a"), false).unwrap();
    bus.transmit_msg(&tlm(0x51, b"b"), false).unwrap();
    bus.transmit_msg(&tlm(0x50, b"c"), false).unwrap();

    // one read leaves a lookahead buffer held by the pipe
    assert!(bus.receive_buffer(pipe, Timeout::Poll).unwrap().is_message());
    assert_eq!(bus.pool_stats().buffers_in_use, 3);

    bus.delete_pipe(pipe).unwrap();
    assert_eq!(bus.pool_stats().buffers_in_use, 0);
    assert_eq!(bus.free_pool_bytes(), free_before);
    assert_eq!(bus.stats().subscriptions_in_use, 0);
    assert!(events.contains(event_ids::PIPE_DELETED));

    // routes outlive their destinations
    let report = bus.transmit_msg(&tlm(0x50, b"d"), false).unwrap();
    assert!(report.no_subscribers);
}

#[test]
fn test_stats_track_pipes_and_depths() {
    let (bus, _registry, _events) = setup();
    let a = bus.create_pipe(3, "A").unwrap();
    let b = bus.create_pipe(5, "B").unwrap();
    bus.subscribe(MsgId::new(0x60), a).unwrap();
    bus.transmit_msg(&tlm(0x60, b"1"), false).unwrap();
    bus.transmit_msg(&tlm(0x60, b"2"), false).unwrap();
    bus.receive_buffer(a, Timeout::Poll).unwrap();

    let stats = bus.stats();
    assert_eq!(stats.pipes_in_use, 2);
    assert_eq!(stats.peak_pipes_in_use, 2);
    let depth_a = stats.pipe_depth_stats.iter().find(|d| d.pipe_id == a).unwrap();
    assert_eq!(
        (depth_a.max_queue_depth, depth_a.current_queue_depth, depth_a.peak_queue_depth),
        (3, 1, 2)
    );
    let depth_b = stats.pipe_depth_stats.iter().find(|d| d.pipe_id == b).unwrap();
    assert_eq!(depth_b.peak_queue_depth, 0);

    bus.delete_pipe(b).unwrap();
    let stats = bus.stats();
    assert_eq!(stats.pipes_in_use, 1);
    assert_eq!(stats.peak_pipes_in_use, 2);
}

#[test]
fn test_cleanup_app_reclaims_everything() {
    let (bus, registry, _events) = setup();
    let free_before = bus.free_pool_bytes();

    let doomed = registry.register_app("DOOMED").unwrap();
    registry.bind_current_thread(doomed).unwrap();
    let p1 = bus.create_pipe(4, "DOOMED_1").unwrap();
    let p2 = bus.create_pipe(4, "DOOMED_2").unwrap();
    bus.subscribe(MsgId::new(0x70), p1).unwrap();
    bus.subscribe(MsgId::new(0x70), p2).unwrap();
    bus.transmit_msg(&tlm(0x70, b"queued"), false).unwrap();
    let _held = bus.allocate_message_buffer(64).unwrap();
    let _also_held = bus.allocate_message_buffer(256).unwrap();

    let survivor_app = registry.register_app("SURVIVOR").unwrap();
    registry.bind_current_thread(survivor_app).unwrap();
    let survivor = bus.create_pipe(4, "SURVIVOR").unwrap();
    let report = bus.cleanup_app(doomed);
    assert_eq!(
        report,
        CleanupReport {
            pipes_deleted: 2,
            buffers_released: 2
        }
    );

    assert_eq!(bus.free_pool_bytes(), free_before);
    assert!(bus.get_pipe_opts(p1).is_err());
    assert!(bus.get_pipe_opts(p2).is_err());
    assert!(bus.get_pipe_opts(survivor).is_ok());
    assert_eq!(bus.stats().pipes_in_use, 1);
    assert_eq!(bus.pool_stats().buffers_in_use, 0);
}

#[test]
fn test_pipe_info_names_owner() {
    let (bus, registry, _events) = setup();
    let app = registry.register_app("INFO_APP").unwrap();
    registry.bind_current_thread(app).unwrap();
    let pipe = bus.create_pipe(6, "INFO_PIPE").unwrap();
    bus.set_pipe_opts(pipe, PipeOptions::new().with_ignore_mine(true)).unwrap();

    let info = bus.pipe_info();
    let entry = info.iter().find(|p| p.pipe_id == pipe).unwrap();
    assert_eq!(entry.app_id, app);
    assert_eq!(entry.app_name, "INFO_APP");
    assert_eq!(entry.pipe_name, "INFO_PIPE");
    assert_eq!(entry.max_queue_depth, 6);
    assert!(entry.options.ignore_mine);
}
