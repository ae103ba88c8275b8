use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_test::assert_ok;

use usk_link::protocol::codec::{append_checksum, checksum};
use usk_link::protocol::incoming::{IncomingFrame, IncomingRegistry};
use usk_link::protocol::outgoing::{OutgoingCommand, FLAG_SET_CLOCK};
use usk_link::protocol::state::{EngineState, Wait};
use usk_link::util::{Cp1251, TextCodec};
use usk_link::{
    CommandKind, DeviceConfig, DeviceEvent, DeviceStatus, EngineConfig, ErrorCode,
    MemoryConnector, ProtocolEngine, Registry, RegistryEvent, Result, Transport,
};

#[derive(Clone, Default)]
struct Wire(Arc<Mutex<Vec<Bytes>>>);

impl Wire {
    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl Transport for Wire {
    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.0.lock().unwrap().push(Bytes::copy_from_slice(frame));
        Ok(())
    }
}

fn inbound(text: &str, prev: u8, cur: u8) -> Vec<u8> {
    let mut raw = vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    let mut payload = Cp1251.encode(text);
    payload.resize(16, b' ');
    raw.extend_from_slice(&payload);
    raw.push(prev);
    raw.push(cur);
    append_checksum(&mut raw);
    raw
}

fn ack(valid: bool) -> Vec<u8> {
    let mut ack = vec![0x05, 0x06, 0x07, 0x08];
    append_checksum(&mut ack);
    if !valid {
        ack[4] = ack[4].wrapping_add(1);
    }
    ack
}

fn drain(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Opened engine with its start-up clock update acknowledged
fn engine() -> (ProtocolEngine, mpsc::UnboundedReceiver<DeviceEvent>, Wire, Instant) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut engine = ProtocolEngine::new(
        DeviceConfig::new("east", "/dev/ttyUSB1", 1),
        EngineConfig::default(),
        tx,
    );
    let wire = Wire::default();
    let at = NaiveDate::from_ymd_opt(2023, 12, 31)
        .unwrap()
        .and_hms_opt(23, 59, 59)
        .unwrap();
    let now = Instant::now();

    engine.open(Box::new(wire.clone()), at);
    engine.on_dispatch_tick(now);
    engine.on_bytes(&ack(true), now);
    drain(&mut rx);
    (engine, rx, wire, now)
}

#[test]
fn test_new_node_split_across_deliveries() {
    let (mut engine, mut rx, _wire, now) = engine();
    let raw = inbound("новый оу:3 луч 5", 0, 0);

    engine.on_bytes(&raw[..13], now);
    assert!(drain(&mut rx).is_empty());
    engine.on_bytes(&raw[13..], now);

    assert_eq!(drain(&mut rx), vec![DeviceEvent::NewNode { ray: 5, node: 3 }]);
    assert_eq!(engine.buffered(), 0);
}

#[test]
fn test_relay_change_without_answer_fails_after_three_sends() {
    let (mut engine, mut rx, wire, mut now) = engine();
    let sent_before = wire.count();
    engine.change_relay(3, 4, 2, false, "gate");

    engine.on_dispatch_tick(now);
    let mut failed = false;
    for _ in 0..3 {
        assert!(engine.in_flight().is_some());
        now += Duration::from_millis(1500);
        engine.on_deadline(now);
        failed |= drain(&mut rx)
            .contains(&DeviceEvent::SendFailed("switch actuator \"gate\" to logical 0".into()));
    }

    assert!(failed);
    assert_eq!(wire.count() - sent_before, 3);
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(engine.deadline().is_none());
}

#[test]
fn test_retry_law_holds_for_any_attempt_count() {
    for attempts in 1..=6 {
        let (mut engine, _rx, wire, mut now) = engine();
        let sent_before = wire.count();
        engine.set_attempts(attempts);
        engine.reset_device();
        engine.on_dispatch_tick(now);

        // Keep firing deadlines well past the last retry
        for _ in 0..attempts + 3 {
            now += Duration::from_millis(1500);
            engine.on_deadline(now);
            assert!(engine.in_flight().is_none() || engine.state() == EngineState::AwaitingResponse);
        }

        assert_eq!(wire.count() - sent_before, attempts as usize);
        assert_eq!(engine.state(), EngineState::Idle);
    }
}

#[test]
fn test_wrong_ack_checksum_is_reported_and_command_cleared() {
    let (mut engine, mut rx, _wire, now) = engine();
    engine.send_message("test");
    engine.on_dispatch_tick(now);
    assert_eq!(engine.deadline().map(|(_, wait)| wait), Some(Wait::Response));
    drain(&mut rx);

    engine.on_bytes(&ack(false), now);
    let events = drain(&mut rx);
    assert_eq!(events[0], DeviceEvent::Error(ErrorCode::WrongPacket));
    assert!(engine.in_flight().is_none());
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(engine.status(), DeviceStatus::Present);
}

#[test]
fn test_clock_frame_header_round_trips() {
    let at = NaiveDate::from_ymd_opt(2031, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap();
    for address in [0u16, 1, 0x00ff, 0x1234, u16::MAX] {
        let frame = OutgoingCommand::new(address, CommandKind::SetClock { at }, 3).encode(&Cp1251);
        assert_eq!(IncomingFrame::parse_header(&frame[1..]), Some((address, FLAG_SET_CLOCK)));
        assert_eq!(frame[26], checksum(&frame[..26]));
    }
}

#[test]
fn test_sensor_changes_follow_differing_bits() {
    let registry = IncomingRegistry::new();
    for (prev, cur) in [(0x00u8, 0xffu8), (0xaa, 0x55), (0x0f, 0x0f), (0x80, 0x01)] {
        let raw = inbound("l=4 k=6", prev, cur);
        let command = registry.classify(&raw, &Cp1251).unwrap();
        let events = command.events();
        assert_eq!(events.len() as u32, (prev ^ cur).count_ones());
        for event in events {
            match event {
                DeviceEvent::SensorChanged { ray, node, sensor, value } => {
                    assert_eq!((ray, node), (4, 6));
                    let bit = 8 - sensor;
                    assert_eq!(value, (cur >> bit) & 1);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_driver_writes_clock_on_first_tick_and_reports_presence() {
    let connector = Arc::new(MemoryConnector::new());
    let peer = connector.attach("/dev/ttyUSB3");
    let (registry, mut events) = assert_ok!(Registry::spawn(connector, EngineConfig::default()));

    assert!(assert_ok!(registry.add("west", "/dev/ttyUSB3", 9).await));
    assert!(assert_ok!(registry.open("west").await));

    sleep(Duration::from_millis(210)).await;
    let written = peer.take_written();
    assert_eq!(written.len(), 1);
    assert_eq!(IncomingFrame::parse_header(&written[0][1..]), Some((9, FLAG_SET_CLOCK)));

    assert!(peer.inject(&ack(true)));
    sleep(Duration::from_millis(10)).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen[0], RegistryEvent::Added { device: "west".into(), added: true });
    assert!(seen.contains(&RegistryEvent::Device {
        device: "west".into(),
        event: DeviceEvent::PresenceChanged { present: true, first: true },
    }));
    assert_eq!(assert_ok!(registry.snapshot().await)[0].status, DeviceStatus::Present);

    assert!(assert_ok!(registry.remove("west").await));
    assert!(assert_ok!(registry.add("west", "/dev/ttyUSB3", 9).await));
}
