//! End-to-end behaviour of a hub driven through the mock transport.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use wedo_core::protocol::constants::ERR_BUSY;
use wedo_core::{
    Command, CommandKind, DeviceKind, DispatchError, FrameCodec, Hub, HubConfig, HubEvent,
    HubObserver, Manager, ManagerConfig, ManagerError, Message, MockScanner, MockTransport,
    PortState, QueueMode, RegistryError, RunExit, TiltDirection, TransportError, Value,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<HubEvent>>,
}

impl Recorder {
    fn count(&self, pred: impl Fn(&HubEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl HubObserver for Recorder {
    fn on_event(&self, event: &HubEvent) {
        self.events.lock().push(event.clone());
    }
}

struct Rig {
    hub: Hub,
    mock: Arc<MockTransport>,
    events: Arc<Recorder>,
    reader: JoinHandle<Result<RunExit, TransportError>>,
}

fn start(config: HubConfig) -> Rig {
    let mock = Arc::new(MockTransport::new("00:16:53:A1:B2:C3"));
    let events = Arc::new(Recorder::default());
    let hub = Hub::connect_with_observer(mock.clone(), "WeDo 2.0 Hub", config, events.clone())
        .unwrap();
    let reader = tokio::spawn({
        let hub = hub.clone();
        async move { hub.run().await }
    });
    Rig {
        hub,
        mock,
        events,
        reader,
    }
}

fn without_setup() -> HubConfig {
    HubConfig {
        auto_setup: false,
        ..HubConfig::default()
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn wait_attached(hub: &Hub, port: u8) {
    wait_until(|| hub.port_state(port).is_ok_and(|s| s.is_attached())).await;
}

#[tokio::test]
async fn test_motor_power_resolves_on_ack() {
    let rig = start(without_setup());
    rig.mock.set_auto_ack(true);
    rig.mock.attach(0, DeviceKind::MOTOR);
    wait_attached(&rig.hub, 0).await;

    let device = rig.hub.device(0).unwrap();
    let ack = rig
        .hub
        .send_command(&device, CommandKind::MotorPower { power: 50 })
        .await
        .unwrap();

    assert_eq!(ack.correlation, Some(1));
    assert_eq!(rig.mock.writes()[0].1, vec![0x06, 0x01, 0x00, 0x01, 0x32, 0x34]);
    assert_eq!(rig.hub.pending_acks(), 0);
}

#[tokio::test]
async fn test_attach_sends_port_setup() {
    let rig = start(HubConfig::default());
    rig.mock.set_auto_ack(true);
    rig.mock.attach(0, DeviceKind::MOTOR);
    wait_attached(&rig.hub, 0).await;

    let commands = rig.mock.commands();
    assert!(matches!(
        commands[0].kind(),
        CommandKind::PortSetup {
            kind: DeviceKind::MOTOR,
            ..
        }
    ));

    // Setup used the first identifier.
    let motor = rig.hub.motor(0).unwrap();
    let ack = motor.set_power(50).await.unwrap();
    assert_eq!(ack.correlation, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_stray_ack_is_discarded() {
    let rig = start(without_setup());
    rig.mock.attach(0, DeviceKind::MOTOR);
    wait_attached(&rig.hub, 0).await;
    let motor = rig.hub.motor(0).unwrap();

    let result = motor.set_power(40).await;
    assert!(matches!(
        result,
        Err(DispatchError::Timeout { correlation: 1, .. })
    ));

    rig.mock.ack(0, 1);
    wait_until(|| rig.events.count(|e| matches!(e, HubEvent::LateAck { correlation: 1, .. })) == 1)
        .await;

    rig.mock.set_auto_ack(true);
    let ack = motor.set_power(40).await.unwrap();
    assert_eq!(ack.correlation, Some(2));
}

#[tokio::test]
async fn test_disconnect_fails_pending_sends() {
    let rig = start(without_setup());
    rig.mock.attach(0, DeviceKind::MOTOR);
    rig.mock.attach(1, DeviceKind::MOTOR);
    wait_attached(&rig.hub, 0).await;
    wait_attached(&rig.hub, 1).await;

    let sends: Vec<_> = [(0u8, 10), (1, 20), (0, 30)]
        .into_iter()
        .map(|(port, power)| {
            let motor = rig.hub.motor(port).unwrap();
            tokio::spawn(async move { motor.set_power(power).await })
        })
        .collect();
    rig.mock.wait_for_writes(3).await;
    assert_eq!(rig.hub.pending_acks(), 3);

    rig.mock.disconnect();
    for send in sends {
        assert_eq!(send.await.unwrap(), Err(DispatchError::HubDisconnected));
    }

    assert!(matches!(rig.reader.await.unwrap(), Ok(RunExit::Disconnected)));
    for port in 0..8 {
        assert_eq!(rig.hub.port_state(port).unwrap(), PortState::Empty);
    }
    assert!(!rig.hub.is_connected());
    assert_eq!(
        rig.events
            .count(|e| matches!(e, HubEvent::Disconnected { .. })),
        1
    );
}

#[tokio::test]
async fn test_garbage_between_frames_is_one_discard() {
    let rig = start(without_setup());
    let codec = FrameCodec::default();

    let mut chunk = codec
        .encode_message(&Message::PortAttached {
            port: 1,
            kind: DeviceKind::TILT,
        })
        .unwrap();
    chunk.extend_from_slice(&[0xFF, 0xFF]);
    chunk.extend(
        codec
            .encode_message(&Message::PortAttached {
                port: 2,
                kind: DeviceKind::DISTANCE,
            })
            .unwrap(),
    );
    rig.mock.inject(&chunk);

    wait_attached(&rig.hub, 1).await;
    wait_attached(&rig.hub, 2).await;
    assert_eq!(
        rig.events.count(|e| matches!(
            e,
            HubEvent::FrameDiscarded { discarded: 2, .. }
        )),
        1
    );
}

#[tokio::test]
async fn test_queued_commands_flush_in_order() {
    let rig = start(without_setup());
    rig.mock.set_auto_ack(true);
    let motor = rig.hub.motor(0).unwrap();
    assert_eq!(rig.hub.port_state(0).unwrap(), PortState::Empty);

    let (first, second, ()) = tokio::join!(motor.set_power(50), motor.set_power(-50), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rig.mock.writes().is_empty());
        rig.mock.attach(0, DeviceKind::MOTOR);
    });

    assert_eq!(first.unwrap().correlation, Some(1));
    assert_eq!(second.unwrap().correlation, Some(2));
    assert_eq!(
        rig.mock.commands(),
        vec![
            Command::new(0, CommandKind::MotorPower { power: 50 }).with_correlation(1),
            Command::new(0, CommandKind::MotorPower { power: -50 }).with_correlation(2),
        ]
    );
}

#[tokio::test]
async fn test_detach_discards_queued_commands() {
    // The setup is not answered, so the port is still Attaching at the detach.
    let rig = start(HubConfig::default());
    let motor = rig.hub.motor(0).unwrap();

    let (result, ()) = tokio::join!(motor.set_power(30), async {
        rig.mock.attach(0, DeviceKind::MOTOR);
        wait_until(|| {
            matches!(
                rig.hub.port_state(0),
                Ok(PortState::Attaching { .. })
            )
        })
        .await;
        rig.mock.wait_for_writes(1).await;
        rig.mock.detach(0);
    });

    assert_eq!(result, Err(DispatchError::DeviceDetached { port: 0 }));
    wait_until(|| rig.hub.port_state(0) == Ok(PortState::Empty)).await;
    // Only the setup command went out.
    assert_eq!(rig.mock.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_setup_still_attaches() {
    let rig = start(HubConfig::default());
    let motor = rig.hub.motor(0).unwrap();

    let (result, ()) = tokio::join!(motor.set_power(30), async {
        rig.mock.attach(0, DeviceKind::MOTOR);
        // The setup times out after a second, then the queue is released.
        rig.mock.wait_for_writes(2).await;
        rig.mock.ack(0, 2);
    });

    assert_eq!(result.unwrap().correlation, Some(2));
    assert!(rig.hub.port_state(0).unwrap().is_attached());
    assert_eq!(
        rig.events
            .count(|e| matches!(e, HubEvent::Log { message, .. } if message.contains("setup failed"))),
        1
    );
}

#[tokio::test]
async fn test_rejected_setup_still_attaches() {
    let rig = start(HubConfig::default());
    rig.mock.attach(0, DeviceKind::MOTOR);
    rig.mock.wait_for_writes(1).await;
    rig.mock.error(0, 1, ERR_BUSY);
    wait_attached(&rig.hub, 0).await;

    rig.mock.set_auto_ack(true);
    let motor = rig.hub.motor(0).unwrap();
    assert_eq!(motor.set_power(40).await.unwrap().correlation, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_queued_command_gives_up_when_port_never_attaches() {
    let rig = start(HubConfig {
        queue_timeout_ms: 200,
        ..HubConfig::default()
    });
    let motor = rig.hub.motor(0).unwrap();

    assert_eq!(
        motor.set_power(30).await,
        Err(DispatchError::PortNotReady {
            port: 0,
            state: PortState::Empty
        })
    );

    // A late attach does not resurrect the abandoned command.
    rig.mock.set_auto_ack(true);
    rig.mock.attach(0, DeviceKind::MOTOR);
    wait_attached(&rig.hub, 0).await;
    let opcodes: Vec<_> = rig.mock.commands().iter().map(|c| c.opcode()).collect();
    assert_eq!(opcodes, vec![wedo_core::Opcode::PortSetup]);

    assert!(motor.set_power(10).await.is_ok());
}

#[tokio::test]
async fn test_reattach_silences_stale_observer() {
    let rig = start(without_setup());
    rig.mock.attach(2, DeviceKind::DISTANCE);
    wait_attached(&rig.hub, 2).await;
    let distance = rig.hub.device(2).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = rig
        .hub
        .on_value_change(&distance, move |value| {
            let _ = tx.send(value);
        })
        .unwrap();

    // Another device takes the port without a detach in between.
    rig.mock.attach(2, DeviceKind::TILT);
    wait_until(|| {
        rig.hub.port_state(2)
            == Ok(PortState::Attached {
                kind: DeviceKind::TILT,
            })
    })
    .await;
    rig.mock.sensor(2, &[180]);
    let tilt = rig.hub.device(2).unwrap();
    wait_until(|| rig.hub.read_value(&tilt) == Ok(Some(Value::Tilt(TiltDirection::Forward)))).await;

    assert!(rig.hub.read_value(&distance).is_err());
    let stale = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
    assert_eq!(stale, Ok(None));
}

#[tokio::test]
async fn test_fail_fast_rejects_unattached_port() {
    let rig = start(HubConfig {
        queue_mode: QueueMode::FailFast,
        ..HubConfig::default()
    });
    assert!(matches!(
        rig.hub.motor(0),
        Err(RegistryError::PortNotReady {
            port: 0,
            state: PortState::Empty
        })
    ));
}

#[tokio::test]
async fn test_stale_device_after_reattach() {
    let rig = start(without_setup());
    rig.mock.attach(0, DeviceKind::MOTOR);
    wait_attached(&rig.hub, 0).await;
    let old = rig.hub.device(0).unwrap();

    rig.mock.detach(0);
    rig.mock.attach(0, DeviceKind::MOTOR);
    wait_until(|| rig.hub.device(0).is_ok_and(|d| d.id() != old.id())).await;

    let result = rig
        .hub
        .send_command(&old, CommandKind::MotorPower { power: 10 })
        .await;
    assert_eq!(result, Err(DispatchError::DeviceDetached { port: 0 }));
}

#[tokio::test]
async fn test_capability_mismatch_is_unsupported() {
    let rig = start(without_setup());
    rig.mock.attach(6, DeviceKind::RGB_LED);
    wait_attached(&rig.hub, 6).await;
    let led = rig.hub.device(6).unwrap();

    let result = rig
        .hub
        .send_command(&led, CommandKind::MotorPower { power: 10 })
        .await;
    assert!(matches!(result, Err(DispatchError::Unsupported(_))));
    assert!(rig.mock.writes().is_empty());
}

#[tokio::test]
async fn test_hub_error_rejects_command() {
    let rig = start(without_setup());
    rig.mock.attach(0, DeviceKind::MOTOR);
    wait_attached(&rig.hub, 0).await;
    let motor = rig.hub.motor(0).unwrap();

    let (result, ()) = tokio::join!(motor.set_power(80), async {
        rig.mock.wait_for_writes(1).await;
        rig.mock.error(0, 1, ERR_BUSY);
    });
    assert!(matches!(
        result,
        Err(DispatchError::Rejected {
            code: ERR_BUSY,
            name: "busy",
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_write_failures_are_retried() {
    let rig = start(without_setup());
    rig.mock.attach(6, DeviceKind::RGB_LED);
    wait_attached(&rig.hub, 6).await;
    rig.mock.fail_next_writes(2);

    let led = rig.hub.led(6).unwrap();
    led.set_index(3).await.unwrap();
    assert_eq!(rig.mock.write_attempts(), 3);
    assert_eq!(rig.mock.writes().len(), 1);
}

#[tokio::test]
async fn test_run_is_single_use() {
    let rig = start(without_setup());
    // Reader is running once it has routed something.
    rig.mock.attach(6, DeviceKind::RGB_LED);
    wait_attached(&rig.hub, 6).await;

    assert!(matches!(
        rig.hub.run().await,
        Err(TransportError::StreamTaken)
    ));
    assert!(rig.hub.is_connected());
}

#[tokio::test]
async fn test_shutdown_tears_down_once() {
    let rig = start(without_setup());
    rig.mock.attach(0, DeviceKind::MOTOR);
    wait_attached(&rig.hub, 0).await;

    rig.hub.shutdown();
    assert!(matches!(rig.reader.await.unwrap(), Ok(RunExit::Cancelled)));
    assert_eq!(rig.hub.port_state(0).unwrap(), PortState::Empty);
    assert_eq!(
        rig.events
            .count(|e| matches!(e, HubEvent::Disconnected { .. })),
        1
    );
    assert!(matches!(
        rig.hub.motor(0).unwrap().set_power(10).await,
        Err(DispatchError::HubDisconnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_led_blink() {
    let rig = start(without_setup());
    rig.mock.attach(6, DeviceKind::RGB_LED);
    wait_attached(&rig.hub, 6).await;
    let led = rig.hub.led(6).unwrap();

    led.blink("red", Duration::from_secs(1)).await.unwrap();

    let colours: Vec<_> = rig
        .mock
        .commands()
        .into_iter()
        .map(|c| c.kind().clone())
        .collect();
    assert_eq!(
        colours,
        vec![
            CommandKind::LedRgb {
                red: 255,
                green: 0,
                blue: 0
            },
            CommandKind::LedRgb {
                red: 0,
                green: 0,
                blue: 0
            },
            CommandKind::LedRgb {
                red: 255,
                green: 0,
                blue: 0
            },
        ]
    );
    assert!(!led.mode_running());
}

#[tokio::test(start_paused = true)]
async fn test_led_disco_until_stopped() {
    let rig = start(without_setup());
    rig.mock.attach(6, DeviceKind::RGB_LED);
    wait_attached(&rig.hub, 6).await;
    let led = rig.hub.led(6).unwrap();

    led.disco();
    assert!(led.mode_running());
    tokio::time::sleep(Duration::from_millis(2500)).await;
    led.stop_mode();
    assert!(!led.mode_running());

    tokio::time::sleep(Duration::from_secs(10)).await;
    let commands = rig.mock.commands();
    assert_eq!(commands.len(), 2);
    assert_eq!(
        commands[0].kind(),
        &CommandKind::LedRgb {
            red: 0,
            green: 0,
            blue: 255
        }
    );
}

#[tokio::test]
async fn test_unknown_colour_is_rejected() {
    let rig = start(without_setup());
    rig.mock.attach(6, DeviceKind::RGB_LED);
    wait_attached(&rig.hub, 6).await;
    let led = rig.hub.led(6).unwrap();

    assert!(matches!(
        led.set_color("orange").await,
        Err(DispatchError::InvalidParameter(_))
    ));
    led.set_color("Cyan").await.unwrap();
    assert_eq!(rig.mock.writes().len(), 1);
}

#[tokio::test]
async fn test_tilt_readings() {
    let rig = start(HubConfig::default());
    rig.mock.set_auto_ack(true);
    rig.mock.attach(1, DeviceKind::TILT);
    wait_attached(&rig.hub, 1).await;

    let tilt = rig.hub.tilt_sensor(1).unwrap();
    assert_eq!(tilt.tilt().unwrap(), TiltDirection::NoTilt);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = tilt
        .on_change(move |direction| {
            let _ = tx.send(direction);
        })
        .unwrap();
    rig.mock.sensor(1, &[180]);

    let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap();
    assert_eq!(seen, Some(TiltDirection::Forward));
    assert_eq!(tilt.tilt().unwrap(), TiltDirection::Forward);
}

#[tokio::test]
async fn test_distance_readings() {
    let rig = start(HubConfig::default());
    rig.mock.set_auto_ack(true);
    rig.mock.attach(2, DeviceKind::DISTANCE);
    wait_attached(&rig.hub, 2).await;

    let sensor = rig.hub.distance_sensor(2).unwrap();
    assert_eq!(sensor.distance().unwrap(), None);

    rig.mock.sensor(2, &[42]);
    wait_until(|| sensor.distance().ok().flatten().is_some()).await;
    assert_eq!(sensor.distance().unwrap(), Some(42.0));
    assert_eq!(
        rig.events.count(|e| matches!(
            e,
            HubEvent::ValueUpdated {
                port: 2,
                value: Value::Distance(_)
            }
        )),
        1
    );
}

#[tokio::test]
async fn test_manager_discovers_matching_hubs() {
    let scanner = Arc::new(MockScanner::new());
    let wedo = scanner.add_hub("AA:01", "WeDo 2.0 Hub");
    scanner.add_hub("BB:02", "Heart Rate Monitor");

    let mut manager = Manager::new(scanner.clone(), ManagerConfig::default());
    let hubs = manager.discover().await.unwrap();
    assert_eq!(hubs.len(), 1);
    assert_eq!(hubs[0].id(), "AA:01");

    // Already connected hubs are not added twice.
    manager.discover().await.unwrap();
    assert_eq!(manager.hubs().len(), 1);
    assert!(manager.hub("AA:01").is_some());

    let (exits, ()) = tokio::join!(manager.run(), async {
        wedo.attach(0, DeviceKind::RGB_LED);
        wait_until(|| manager.device(0).is_ok()).await;
        wedo.disconnect();
    });
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].0, "AA:01");
    assert!(matches!(exits[0].1, Ok(RunExit::Disconnected)));
}

#[tokio::test]
async fn test_manager_without_hubs() {
    let scanner = Arc::new(MockScanner::new());
    scanner.add_hub("CC:03", "Speaker");
    let mut manager = Manager::new(scanner, ManagerConfig::default());

    assert!(matches!(
        manager.discover().await,
        Err(ManagerError::NoHubFound { .. })
    ));
    assert!(matches!(
        manager.device(0),
        Err(ManagerError::NoHubFound { .. })
    ));
}
