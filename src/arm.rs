//! Arm telemetry processing.
//!
//! Consumes `sample`, `event`, `gripper_sample`, and `camera_frame` messages
//! from the arm controller: fans per-joint vectors out into named series,
//! tracks sample recency for idle detection, and gates camera frames while
//! the arm is idle.

use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use tracing::{debug, info};

use crate::health::StatusLevel;
use crate::idle::{FrameDisposition, IdleTracker};
use crate::protocol::{ArmSampleData, CameraFrameData, EventData, GripperSampleData, Message};
use crate::server::MessageHandler;
use crate::sink::SinkHandle;

/// Processor for the arm telemetry server.
#[derive(Debug)]
pub struct ArmTelemetryProcessor {
    /// Synthetic joint names `j1..jn`, established on the first sample.
    joints: Vec<String>,
    layout_sent: bool,
    idle: IdleTracker,
    sink: SinkHandle,
}

impl ArmTelemetryProcessor {
    pub fn new(sink: SinkHandle, idle: IdleTracker) -> Self {
        Self {
            joints: Vec::new(),
            layout_sent: false,
            idle,
            sink,
        }
    }

    /// True while arm samples are arriving within the idle timeout.
    pub fn is_active(&self, now: Instant) -> bool {
        self.idle.is_active(now)
    }

    fn joint_name(&self, index: usize) -> String {
        self.joints
            .get(index)
            .cloned()
            .unwrap_or_else(|| format!("j{}", index + 1))
    }

    /// One-time visualization layout for exactly `n` joints.
    fn init_layout(&mut self, n: usize) {
        if self.layout_sent {
            return;
        }
        self.layout_sent = true;
        self.joints = (1..=n).map(|i| format!("j{i}")).collect();

        self.sink.document(
            "arm",
            "# Arm telemetry\n\nExpand `/arm/joints/...` for per-joint plots.\n",
        );
        for name in &self.joints {
            self.sink
                .series_names(&format!("arm/joints/{name}/pos"), &["target", "actual"]);
            self.sink
                .series_names(&format!("arm/joints/{name}/vel"), &["raw", "filtered"]);
        }
        info!("initialized arm telemetry layout for {} joints", n);
    }

    /// Handle one arm sample.
    ///
    /// Joint identifiers are positional (`j1..jn`); a caller-supplied
    /// `joint_names` field is ignored.
    pub fn process_sample(&mut self, data: &ArmSampleData, now: Instant) {
        if self.idle.record_sample(now) {
            self.sink.text_log(
                "arm/events",
                StatusLevel::Info,
                "arm samples resumed, camera telemetry active",
            );
            info!("arm samples resumed");
        }

        let n = data.joint_count();
        if n == 0 {
            return;
        }
        if !self.layout_sent {
            self.init_layout(n);
        }

        for i in 0..n {
            let name = self.joint_name(i);
            let prefix = format!("arm/joints/{name}");

            let target = data.target[i];
            let actual = data.pos[i];

            let mut pos_values = vec![target, actual];
            if let Some(traj) = data.traj.as_ref().and_then(|v| v.get(i)) {
                pos_values.push(*traj);
            }
            self.sink.scalars(&format!("{prefix}/pos"), &pos_values);

            let mut vel_values = vec![data.vel[i]];
            for optional in [&data.vel_filtered, &data.vel_boundary, &data.traj_vel_filtered] {
                if let Some(value) = optional.as_ref().and_then(|v| v.get(i)) {
                    vel_values.push(*value);
                }
            }
            self.sink.scalars(&format!("{prefix}/vel"), &vel_values);

            self.sink
                .scalar(&format!("{prefix}/pos/tracking_error"), (target - actual).abs());

            if let Some(acc) = data.acc_filtered.as_ref().and_then(|v| v.get(i)) {
                self.sink.scalar(&format!("{prefix}/acc"), *acc);
            }

            self.sink.scalar(&format!("{prefix}/torque"), data.torque[i]);
        }
    }

    /// Handle one camera frame, dropping it while the arm is idle.
    ///
    /// Dropped frames are discarded before the base64 payload is decoded;
    /// the first drop of an idle span logs a single "pausing" event.
    pub fn process_camera_frame(&mut self, data: &CameraFrameData, now: Instant) {
        match self.idle.camera_disposition(now) {
            FrameDisposition::Drop { first_of_span } => {
                if first_of_span {
                    self.sink.text_log(
                        "arm/events",
                        StatusLevel::Info,
                        "pausing camera telemetry while arm is idle",
                    );
                    info!("arm idle: pausing camera telemetry");
                }
            }
            FrameDisposition::Forward => {
                let Some(jpeg) = data.jpeg.as_deref().filter(|s| !s.is_empty()) else {
                    return;
                };
                let name = data.name.as_deref().unwrap_or("camera");
                let position = data.position.as_deref().unwrap_or("unknown");

                match BASE64_STANDARD.decode(jpeg) {
                    Ok(bytes) => {
                        self.sink
                            .image(&format!("camera/{position}/{name}"), "image/jpeg", &bytes);
                    }
                    Err(e) => debug!("discarding camera frame with invalid payload: {}", e),
                }
            }
        }
    }

    /// Forward each present gripper field as an independent scalar.
    pub fn process_gripper_sample(&self, data: &GripperSampleData) {
        let name = data.name.as_deref().unwrap_or("gripper");

        if let Some(pos) = data.pos {
            self.sink.scalar(&format!("gripper/{name}/pos"), pos);
        }
        if let Some(target) = data.target {
            self.sink.scalar(&format!("gripper/{name}/target"), target);
        }
        if let Some(velocity) = data.velocity {
            self.sink.scalar(&format!("gripper/{name}/vel"), velocity);
        }
        if let Some(enabled) = data.torque_enabled {
            self.sink.scalar(
                &format!("gripper/{name}/torque_enabled"),
                if enabled { 1.0 } else { 0.0 },
            );
        }
    }

    /// Forward an arm log-line event. Empty messages are ignored.
    pub fn process_event(&self, data: &EventData) {
        let Some(msg) = data.msg.as_deref().filter(|m| !m.is_empty()) else {
            return;
        };
        let level = StatusLevel::parse(data.level.as_deref().unwrap_or("INFO"));
        self.sink.text_log("arm/events", level, msg);
    }
}

impl MessageHandler for ArmTelemetryProcessor {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Sample(s) => self.process_sample(&s, Instant::now()),
            Message::Event(e) => self.process_event(&e),
            Message::GripperSample(g) => self.process_gripper_sample(&g),
            Message::CameraFrame(c) => self.process_camera_frame(&c, Instant::now()),
            Message::Ping => debug!("received ping"),
            other => debug!("arm server ignoring {} message", other.tag()),
        }
    }
}
