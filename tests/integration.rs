// Integration tests driving a whole Robot over the in-memory transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use bytes::Bytes;
use cozmars_stream::{
    Callback, Error, MemoryTransport, Mode, Reply, Robot, RobotConfig, SensorEvent,
};
use serde_json::{json, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("info,cozmars_stream=debug")
        .try_init();
}

fn connect(config: RobotConfig) -> (Arc<MemoryTransport>, Robot) {
    init_tracing();
    let sim = MemoryTransport::new();
    let robot = Robot::connect(config, sim.clone()).unwrap();
    (sim, robot)
}

fn connect_mode(mode: Mode) -> (Arc<MemoryTransport>, Robot) {
    connect(RobotConfig::new("sim").with_mode(mode))
}

fn frame(tag: &str) -> Bytes {
    Bytes::from(tag.to_string())
}

/// Let the worker drain what was just emitted.
fn settle() {
    std::thread::sleep(Duration::from_millis(60));
}

fn emit_event(sim: &MemoryTransport, name: &str, data: Value) {
    sim.emit("sensor_data", SensorEvent::new(name, data).encode());
}

// ── Modes ────────────────────────────────────────────────────────────────────

#[test]
fn test_property_round_trip_blocking_and_deferred() {
    for mode in [Mode::Blocking, Mode::Deferred] {
        let (sim, robot) = connect_mode(mode);

        // Property setters resolve before returning, whatever the mode.
        let reply = robot.motors().set_speed(0.5, -0.25).invoke().unwrap();
        assert!(matches!(reply, Reply::Ready(())), "{mode}: setter must be synchronous");
        assert_eq!(robot.motors().speed().wait().unwrap(), (0.5, -0.25));
        assert_eq!(sim.property("speed"), Some(json!([0.5, -0.25])));

        robot.disconnect().unwrap();
    }
}

#[tokio::test]
async fn test_property_round_trip_native() {
    init_tracing();
    let sim = MemoryTransport::new();
    let robot = Robot::connect_async(RobotConfig::new("sim").with_mode(Mode::Native), sim.clone())
        .await
        .unwrap();

    robot.motors().set_speed(0.5, -0.25).await.unwrap();
    assert_eq!(robot.motors().speed().await.unwrap(), (0.5, -0.25));
    robot.disconnect_async().await.unwrap();
}

#[test]
fn test_deferred_command_returns_pending_handle() {
    let (sim, robot) = connect_mode(Mode::Deferred);
    sim.set_delay("speed", Duration::from_millis(30));

    let reply = robot.motors().forward(Some(1.0)).invoke().unwrap();
    assert!(reply.is_pending());
    let mut handle = reply.into_handle().unwrap();
    assert!(!handle.is_resolved());
    assert_eq!(handle.wait(None).unwrap(), Some(()));
    assert_eq!(sim.calls().last().unwrap().1, json!([[1.0, 1.0], 1.0]));

    // Forced-synchronous calls still resolve in place.
    let reply = robot.env().set("name", "rex").invoke().unwrap();
    assert!(matches!(reply, Reply::Ready(())));
    robot.disconnect().unwrap();
}

#[test]
fn test_blocking_timeout_yields_no_answer_but_completes() {
    let mut config = RobotConfig::new("sim");
    config.call_timeout_ms = 20;
    let (sim, robot) = connect(config);

    let landed = Arc::new(AtomicBool::new(false));
    let flag = landed.clone();
    sim.set_delay("speed", Duration::from_millis(150));
    sim.on_call("speed", move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(Value::Null)
    });

    let reply = robot.motors().forward(Some(2.0)).invoke().unwrap();
    assert!(reply.is_no_answer());
    assert!(!landed.load(Ordering::SeqCst));

    std::thread::sleep(Duration::from_millis(400));
    assert!(landed.load(Ordering::SeqCst), "operation must keep running after the wait gave up");
    robot.disconnect().unwrap();
}

#[test]
fn test_remote_error_is_returned() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    sim.on_call("get_env", |_| Err(Error::Remote("no such key".into())));
    assert!(matches!(robot.env().get("missing").wait(), Err(Error::Remote(_))));
    robot.disconnect().unwrap();
}

#[test]
fn test_head_rejects_duration_and_speed() {
    let (_sim, robot) = connect_mode(Mode::Blocking);
    let outcome = robot.head().set_angle(10.0, Some(1.0), Some(30.0)).wait();
    assert!(matches!(outcome, Err(Error::InvalidState(_))));
    robot.head().set_angle_now(45.0).wait().unwrap();
    assert_eq!(robot.head().angle().wait().unwrap(), 20.0);
    robot.disconnect().unwrap();
}

#[test]
fn test_touch_sensor_properties() {
    let (sim, robot) = connect_mode(Mode::Deferred);
    let touch = robot.touch_sensor();
    touch.set_long_touch_repeat(true).invoke().unwrap();
    touch.set_long_touch_threshold(1.5).invoke().unwrap();
    assert_eq!(sim.property("long_press_repeat"), Some(json!(true)));
    assert!(touch.long_touch_repeat().wait().unwrap());
    assert_eq!(touch.long_touch_threshold().wait().unwrap(), 1.5);
    robot.disconnect().unwrap();
}

// ── Streams ──────────────────────────────────────────────────────────────────

#[test]
fn test_camera_fan_out_and_refcount() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    let camera = robot.camera();
    assert!(camera.is_closed());

    let a = camera.get_buffer(8).wait().unwrap();
    let b = camera.get_buffer(8).wait().unwrap();
    assert_eq!(sim.opened_streams("camera"), 1);
    assert!(!camera.is_closed());

    for tag in ["f1", "f2", "f3"] {
        sim.emit("camera", frame(tag));
    }
    settle();
    for sub in [&a, &b] {
        let got: Vec<Bytes> = (0..3).map(|_| sub.read().unwrap().unwrap()).collect();
        assert_eq!(got, vec![frame("f1"), frame("f2"), frame("f3")]);
    }

    // Removing one of two subscribers keeps the stream flowing to the other.
    drop(a);
    settle();
    assert_eq!(camera.multiplexer().subscriber_count(), 1);
    assert_eq!(sim.live_streams("camera"), 1);
    sim.emit("camera", frame("f4"));
    assert_eq!(b.read_timeout(Duration::from_secs(1)).unwrap(), Some(frame("f4")));

    b.close().unwrap();
    assert!(camera.is_closed());
    assert_eq!(sim.live_streams("camera"), 0);
    assert_eq!(sim.opened_streams("camera"), 1);
    robot.disconnect().unwrap();
}

#[test]
fn test_slow_subscriber_keeps_freshest() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    let sub = robot.camera().get_buffer(3).wait().unwrap();
    for i in 1..=5 {
        sim.emit("camera", frame(&i.to_string()));
    }
    settle();
    let got: Vec<Bytes> = (0..3).map(|_| sub.read().unwrap().unwrap()).collect();
    assert_eq!(got, vec![frame("3"), frame("4"), frame("5")]);
    assert_eq!(sub.dropped(), 2);
    robot.disconnect().unwrap();
}

#[test]
fn test_configured_queue_size_evicts_oldest() {
    let mut config = RobotConfig::new("sim");
    config.camera.q_size = 2;
    let (sim, robot) = connect(config);

    let sub = robot.camera().output_stream().wait().unwrap();
    for tag in ["A", "B", "C"] {
        sim.emit("camera", frame(tag));
    }
    settle();
    assert_eq!(sub.read().unwrap(), Some(frame("B")));
    assert_eq!(sub.read().unwrap(), Some(frame("C")));
    robot.disconnect().unwrap();
}

#[test]
fn test_camera_parameters_locked_while_streaming() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    let camera = robot.camera();
    sim.on_call("capture", |_| Ok(json!([1, 2, 3])));

    assert_eq!(camera.capture().wait().unwrap(), Bytes::from_static(&[1, 2, 3]));
    camera.set_resolution(320, 240).unwrap();

    let sub = camera.get_buffer(1).wait().unwrap();
    assert!(matches!(camera.set_resolution(640, 480), Err(Error::InvalidState(_))));
    assert!(matches!(camera.set_framerate(10), Err(Error::InvalidState(_))));
    assert!(matches!(camera.capture().wait(), Err(Error::InvalidState(_))));
    sub.close().unwrap();

    camera.set_resolution(640, 480).unwrap();
    let sub = camera.get_buffer(1).wait().unwrap();
    assert_eq!(
        sim.stream_args("camera"),
        vec![json!([320, 240, 5]), json!([640, 480, 5])]
    );
    sub.close().unwrap();
    robot.disconnect().unwrap();
}

#[test]
fn test_stream_failure_is_sticky_and_reopen_recovers() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    let broken = robot.microphone().get_buffer(4).wait().unwrap();
    sim.fail("microphone", Error::Remote("mic unplugged".into()));

    for _ in 0..3 {
        assert!(matches!(
            broken.read_timeout(Duration::from_secs(1)),
            Err(Error::Remote(_))
        ));
    }
    assert!(robot.microphone().is_closed());

    // A new subscriber reopens the stream.
    let fresh = robot.microphone().get_buffer(4).wait().unwrap();
    assert_eq!(sim.opened_streams("microphone"), 2);
    sim.emit("microphone", Bytes::from_static(&[0x10, 0x00]));
    let block = fresh.read_timeout(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(block.samples(), vec![16]);
    assert!(broken.try_read().unwrap().is_err());

    drop(broken);
    fresh.close().unwrap();
    robot.disconnect().unwrap();
}

#[test]
fn test_speaker_play_streams_blocks_and_closes() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    let speaker = robot.speaker();
    speaker.set_block_duration(0.02).unwrap();

    speaker
        .play(vec![frame("b1"), frame("b2"), frame("b3")])
        .wait()
        .unwrap();
    settle();
    assert_eq!(sim.received("speaker"), vec![frame("b1"), frame("b2"), frame("b3")]);
    assert!(!speaker.is_playing().wait().unwrap());
    assert_eq!(sim.opened_streams("speaker"), 1);

    speaker.set_volume(150).wait().unwrap();
    assert_eq!(speaker.volume().wait().unwrap(), 100);
    robot.disconnect().unwrap();
}

// ── Sensor events ────────────────────────────────────────────────────────────

#[test]
fn test_touch_callbacks_run_off_the_event_loop() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    let (tx, rx) = mpsc::channel();
    let touched_tx = tx.clone();
    robot
        .touch_sensor()
        .when_touched(Some(Callback::sync(move |_| {
            let _ = touched_tx.send("touched");
        })));
    robot
        .touch_sensor()
        .when_released(Some(Callback::sync(move |_| {
            let _ = tx.send("released");
        })));

    emit_event(&sim, "pressed", json!(true));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "touched");
    assert!(robot.touch_sensor().touched());

    emit_event(&sim, "pressed", json!(false));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "released");
    assert!(!robot.touch_sensor().touched());
    robot.disconnect().unwrap();
}

#[test]
fn test_sonar_and_infrared_events() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    let (tx, rx) = mpsc::channel();
    let range_tx = tx.clone();
    robot
        .sonar()
        .when_in_range(Some(Callback::sync(move |d| {
            let _ = range_tx.send(d);
        })));
    robot
        .infrared()
        .when_state_changed(Some(Callback::sync(move |s| {
            let _ = tx.send(s);
        })));

    emit_event(&sim, "in_range", json!(0.12));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), json!(0.12));

    emit_event(&sim, "lir", json!(1));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        json!([true, false, false])
    );
    let right = robot.infrared().child_named("right").unwrap();
    emit_event(&sim, "rir", json!(true));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        json!([true, false, true])
    );
    assert!(right.state());

    // Malformed and unknown events are skipped without killing the loop.
    sim.emit("sensor_data", Bytes::from_static(b"not json"));
    emit_event(&sim, "teleported", json!(null));
    emit_event(&sim, "in_range", json!(0.5));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), json!(0.5));
    robot.disconnect().unwrap();
}

#[test]
fn test_panicking_callback_does_not_stop_events() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    robot
        .touch_sensor()
        .when_touched(Some(Callback::sync(|_| panic!("user callback bug"))));
    let (tx, rx) = mpsc::channel();
    robot
        .sonar()
        .when_out_of_range(Some(Callback::sync(move |d| {
            let _ = tx.send(d);
        })));

    emit_event(&sim, "pressed", json!(true));
    emit_event(&sim, "out_of_range", json!(1.5));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), json!(1.5));
    robot.disconnect().unwrap();
}

#[tokio::test]
async fn test_native_callbacks_run_on_the_worker() {
    init_tracing();
    let sim = MemoryTransport::new();
    let robot = Robot::connect_async(RobotConfig::new("sim").with_mode(Mode::Native), sim.clone())
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let probe = robot.context().clone();
    robot
        .touch_sensor()
        .when_double_touched(Some(Callback::future(move |_| {
            let tx = tx.clone();
            let inside = probe.running_in_context();
            async move {
                let _ = tx.send(inside);
            }
        })));

    emit_event(&sim, "double_pressed", json!(true));
    let inside = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(inside);
    assert!(robot.touch_sensor().double_touched());
    robot.disconnect_async().await.unwrap();
}

// ── Lifecycle ────────────────────────────────────────────────────────────────

#[test]
fn test_disconnect_closes_everything() {
    let (sim, robot) = connect_mode(Mode::Blocking);
    let frames = robot.camera().get_buffer(2).wait().unwrap();
    assert_eq!(sim.live_streams("sensor_data"), 1);
    assert!(robot.is_connected());

    robot.disconnect().unwrap();
    assert!(!robot.is_connected());
    assert!(matches!(frames.read(), Err(Error::StreamClosed)));
    assert_eq!(sim.live_streams("camera"), 0);
    assert_eq!(sim.live_streams("sensor_data"), 0);

    // Idempotent, and later calls fail cleanly.
    robot.disconnect().unwrap();
    assert!(matches!(robot.motors().speed().wait(), Err(Error::ContextClosed)));
}

#[test]
fn test_drop_stops_the_worker() {
    let (sim, robot) = connect_mode(Mode::Deferred);
    let context = robot.context().clone();
    drop(robot);
    assert!(!context.is_alive());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(sim.live_streams("sensor_data"), 0);
}

#[test]
fn test_invalid_config_is_rejected_before_connecting() {
    init_tracing();
    let mut config = RobotConfig::new("sim");
    config.camera.q_size = 0;
    let sim = MemoryTransport::new();
    assert!(matches!(Robot::connect(config, sim.clone()), Err(Error::Config(_))));
    assert!(sim.calls().is_empty());
}
