//! End-to-end tests driving the telemetry servers over real TCP sockets.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use armwatch::{
    ArmTelemetryProcessor, CanMetricsProcessor, IdleTracker, MessageHandler, RecordingSink,
    SinkHandle, TelemetryServer,
};

async fn start_can_server() -> (TelemetryServer, RecordingSink) {
    let sink = RecordingSink::new();
    let handler: Arc<Mutex<dyn MessageHandler>> = Arc::new(Mutex::new(
        CanMetricsProcessor::new(SinkHandle::new(Arc::new(sink.clone()))),
    ));
    let server = TelemetryServer::bind("can", "127.0.0.1:0", handler)
        .await
        .unwrap();
    (server, sink)
}

async fn start_arm_server() -> (TelemetryServer, RecordingSink) {
    let sink = RecordingSink::new();
    let handler: Arc<Mutex<dyn MessageHandler>> = Arc::new(Mutex::new(
        ArmTelemetryProcessor::new(
            SinkHandle::new(Arc::new(sink.clone())),
            IdleTracker::disabled(),
        ),
    ));
    let server = TelemetryServer::bind("arm", "127.0.0.1:0", handler)
        .await
        .unwrap();
    (server, sink)
}

async fn connect(server: &TelemetryServer) -> TcpStream {
    TcpStream::connect(server.local_addr()).await.unwrap()
}

async fn send_line(stream: &mut TcpStream, line: &str) {
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
}

/// Poll the sink until `pred` holds, or panic after a second.
async fn wait_until(sink: &RecordingSink, mut pred: impl FnMut(&RecordingSink) -> bool) {
    for _ in 0..100 {
        if pred(sink) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for sink events: {:?}", sink.events());
}

#[tokio::test]
async fn test_mapping_then_metrics_resolves_rtt_and_loss() {
    let (server, sink) = start_can_server().await;
    let mut stream = connect(&server).await;

    send_line(
        &mut stream,
        r#"{"type":"mapping","data":{"can_id_map":{"1":17},"joint_names":{"1":"shoulder"}}}"#,
    )
    .await;
    send_line(
        &mut stream,
        r#"{"type":"metrics","data":{"per_pair_rtt":{"[1,17]":{"rtt_mean_ms":5.0,"timeout_count":2,"sample_count":98}}}}"#,
    )
    .await;

    wait_until(&sink, |s| !s.scalar_values("can/loss/17").is_empty()).await;
    assert_eq!(sink.scalar_values("can/rtt/17"), vec![5.0]);
    assert_eq!(sink.scalar_values("can/loss/17"), vec![0.02]);

    server.stop().await;
}

#[tokio::test]
async fn test_connection_survives_malformed_and_unrecognized_lines() {
    let (server, sink) = start_can_server().await;
    let mut stream = connect(&server).await;

    send_line(&mut stream, "{not json at all").await;
    send_line(&mut stream, r#"{"type":"bogus","data":{}}"#).await;
    // Recognized but meant for the other server: ignored without dispatch.
    send_line(
        &mut stream,
        r#"{"type":"sample","data":{"target":[0],"pos":[0],"vel":[0],"torque":[0]}}"#,
    )
    .await;
    send_line(
        &mut stream,
        r#"{"type":"metrics","data":{"bus_load_percent":42.0}}"#,
    )
    .await;

    wait_until(&sink, |s| !s.scalar_values("can/bus/load").is_empty()).await;
    assert_eq!(sink.scalar_values("can/bus/load"), vec![42.0]);
    assert!(sink.scalars_values("arm/joints/j1/pos").is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_health_transitions_over_the_wire() {
    let (server, sink) = start_can_server().await;
    let mut stream = connect(&server).await;

    for (load, errors) in [(25.0, 0.0), (65.0, 0.0), (85.0, 2.5), (10.0, 0.0)] {
        send_line(
            &mut stream,
            &format!(
                r#"{{"type":"metrics","data":{{"bus_load_percent":{load},"error_frames_per_second":{errors}}}}}"#
            ),
        )
        .await;
    }

    // Nominal start is silent; each of the three transitions publishes one
    // status document.
    wait_until(&sink, |s| s.scalar_values("can/bus/load").len() == 4).await;
    assert_eq!(sink.document_count(), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_arm_sample_gripper_and_camera_frame() {
    let (server, sink) = start_arm_server().await;
    let mut stream = connect(&server).await;

    send_line(
        &mut stream,
        r#"{"type":"sample","data":{"t":1.0,"target":[1.0,2.0],"pos":[1.1,2.1],"vel":[0.1,0.2],"torque":[0.5,0.6]}}"#,
    )
    .await;
    send_line(
        &mut stream,
        r#"{"type":"gripper_sample","data":{"pos":0.4,"torque_enabled":true}}"#,
    )
    .await;
    let jpeg = BASE64_STANDARD.encode([0xffu8, 0xd8, 0xff]);
    send_line(
        &mut stream,
        &format!(r#"{{"type":"camera_frame","data":{{"position":"front","jpeg":"{jpeg}"}}}}"#),
    )
    .await;

    wait_until(&sink, |s| s.image_count() > 0).await;
    assert_eq!(sink.scalars_values("arm/joints/j1/pos"), vec![vec![1.0, 1.1]]);
    assert_eq!(sink.scalars_values("arm/joints/j2/pos"), vec![vec![2.0, 2.1]]);
    assert_eq!(sink.scalar_values("gripper/gripper/pos"), vec![0.4]);
    assert_eq!(sink.scalar_values("gripper/gripper/torque_enabled"), vec![1.0]);

    server.stop().await;
}

#[tokio::test]
async fn test_two_connections_share_one_processor() {
    let (server, sink) = start_can_server().await;

    let mut first = connect(&server).await;
    send_line(
        &mut first,
        r#"{"type":"mapping","data":{"joint_ids":{"17":3}}}"#,
    )
    .await;
    // Give the mapping time to land before the second connection's metrics.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = connect(&server).await;
    send_line(
        &mut second,
        r#"{"type":"metrics","data":{"per_pair_rtt":{"[1,17]":{"rtt_mean_ms":4.0}}}}"#,
    )
    .await;

    wait_until(&sink, |s| !s.scalar_values("can/rtt/3").is_empty()).await;
    assert_eq!(sink.scalar_values("can/rtt/3"), vec![4.0]);

    server.stop().await;
}
