use dspbridge::sim::{status, LoopbackCapability, SimulatedBridge};
use dspbridge::{
    BridgeError, ChannelError, DspUuid, NodeType, ObjectKind, ProcessorEvents, ProcessorSession,
    RequestKind, Timeout,
};

const LOOPBACK: DspUuid = DspUuid::from_fields(
    0x3dac_26d0,
    0x6d4b,
    0x11dd,
    [0xad, 0x8b, 0x08, 0x00, 0x20, 0x0c, 0x9a, 0x66],
);

#[test]
fn open_attaches_and_close_releases_everything() {
    let bridge = SimulatedBridge::new();
    let session = ProcessorSession::open(&bridge, 0).unwrap();
    assert_eq!(session.processor_index(), 0);
    assert_eq!(bridge.open_channels(), 1);
    assert_eq!(bridge.attached_processors(), 1);

    session.close().unwrap();
    assert_eq!(bridge.open_channels(), 0);
    assert_eq!(bridge.attached_processors(), 0);
    assert_eq!(
        bridge.requests(),
        vec![
            RequestKind::Open,
            RequestKind::Attach,
            RequestKind::Detach,
            RequestKind::Close
        ]
    );
}

#[test]
fn failed_attach_closes_the_channel() {
    let bridge = SimulatedBridge::new();
    let err = ProcessorSession::open(&bridge, 3).err().unwrap();
    assert!(matches!(
        err,
        BridgeError::AttachFailed(ChannelError::Failed(s)) if s == status::EINVALIDARG
    ));
    assert_eq!(bridge.open_channels(), 0);
    assert_eq!(bridge.count(RequestKind::Close), 1);
}

#[test]
fn failed_open_sends_nothing_else() {
    let bridge = SimulatedBridge::new();
    bridge.fail_next(RequestKind::Open, ChannelError::Disconnected);
    let err = ProcessorSession::open(&bridge, 0).err().unwrap();
    assert!(matches!(
        err,
        BridgeError::OpenFailed(ChannelError::Disconnected)
    ));
    assert_eq!(bridge.requests(), vec![RequestKind::Open]);
}

#[test]
fn dropping_a_session_detaches_and_closes() {
    let bridge = SimulatedBridge::new();
    {
        let _session = ProcessorSession::open(&bridge, 0).unwrap();
    }
    assert_eq!(bridge.open_channels(), 0);
    assert_eq!(bridge.attached_processors(), 0);
}

#[test]
fn close_reports_detach_failure_but_still_closes() {
    let bridge = SimulatedBridge::new();
    let session = ProcessorSession::open(&bridge, 0).unwrap();
    bridge.fail_next(RequestKind::Detach, ChannelError::Failed(status::EFAIL));
    assert!(matches!(
        session.close(),
        Err(BridgeError::DetachFailed(_))
    ));
    assert_eq!(bridge.open_channels(), 0);
}

#[test]
fn second_processor_is_reachable() {
    let bridge = SimulatedBridge::new().with_processors(2);
    let session = ProcessorSession::open(&bridge, 1).unwrap();
    assert_eq!(session.processor_index(), 1);
}

#[test]
fn register_and_unregister_objects() {
    let bridge = SimulatedBridge::new();
    let session = ProcessorSession::open(&bridge, 0).unwrap();

    session
        .register(LOOPBACK, ObjectKind::Node, "/lib/dsp/dummy.dll64P")
        .unwrap();
    session
        .register(LOOPBACK, ObjectKind::ExecuteLibrary, "/lib/dsp/dummy.dll64P")
        .unwrap();
    assert_eq!(
        bridge
            .registered_path(LOOPBACK, ObjectKind::Node)
            .unwrap()
            .to_str(),
        Some("/lib/dsp/dummy.dll64P")
    );

    session.unregister(LOOPBACK, ObjectKind::Node).unwrap();
    assert_eq!(bridge.registered_path(LOOPBACK, ObjectKind::Node), None);
    assert!(bridge
        .registered_path(LOOPBACK, ObjectKind::ExecuteLibrary)
        .is_some());

    assert!(matches!(
        session.unregister(LOOPBACK, ObjectKind::Node),
        Err(BridgeError::UnregisterFailed(_))
    ));
}

#[test]
fn enumerate_lists_installed_nodes() {
    let device = DspUuid::from_fields(0x1, 0x2, 0x3, [0; 8]);
    let bridge = SimulatedBridge::new()
        .with_loopback_node(LOOPBACK)
        .with_node(device, "ping", NodeType::Task, LoopbackCapability::new);
    let session = ProcessorSession::open(&bridge, 0).unwrap();

    let nodes = session.enumerate_nodes().unwrap();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].uuid, device);
    assert_eq!(nodes[0].name, "ping");
    assert_eq!(nodes[0].node_type, NodeType::Task);
    assert_eq!(nodes[1].uuid, LOOPBACK);
    assert_eq!(nodes[1].node_type, NodeType::Message);
    assert_eq!(bridge.count(RequestKind::EnumerateNode), 3);
}

#[test]
fn events_are_delivered_once_registered() {
    let bridge = SimulatedBridge::new();
    let session = ProcessorSession::open(&bridge, 0).unwrap();

    let err = session
        .wait_for_event(Timeout::from_millis(5))
        .unwrap_err();
    assert!(err.is_timeout());

    session.register_notify(ProcessorEvents::SYS_ERROR).unwrap();
    bridge.raise_event(ProcessorEvents::MMU_FAULT | ProcessorEvents::SYS_ERROR);
    assert_eq!(
        session.wait_for_event(Timeout::Infinite).unwrap(),
        ProcessorEvents::SYS_ERROR
    );
    assert!(session
        .wait_for_event(Timeout::from_millis(5))
        .unwrap_err()
        .is_timeout());
}
