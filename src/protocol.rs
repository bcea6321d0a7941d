//! Wire protocol for the telemetry line servers.
//!
//! Every TCP line is one JSON envelope: `{"type": ..., "timestamp_ns": ...,
//! "data": {...}}`. The envelope is decoded once at the message boundary into
//! the closed [`Message`] enum; anything outside the known tag set lands in
//! [`Message::Unrecognized`] so unknown traffic is logged instead of silently
//! falling through.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

/// Outer envelope carried on every line.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Message tag, e.g. "metrics" or "sample".
    #[serde(rename = "type")]
    pub kind: String,

    /// Producer-side timestamp. Retained for sink adapters that want it;
    /// the core does not consume it.
    #[serde(default)]
    pub timestamp_ns: Option<i64>,

    /// Tag-specific payload.
    #[serde(default)]
    pub data: Value,
}

/// One decoded telemetry message.
///
/// The `event` tag is shared by both producers with different payloads
/// (CAN events vs. arm log lines), so [`EventData`] carries the union of
/// optional fields and each processor consumes its half.
#[derive(Debug, Clone)]
pub enum Message {
    Metrics(MetricsData),
    Event(EventData),
    Mapping(MappingData),
    Ping,
    Sample(ArmSampleData),
    GripperSample(GripperSampleData),
    CameraFrame(CameraFrameData),
    /// Anything outside the known tag set. Logged and ignored, never an error.
    Unrecognized { kind: String },
}

impl Message {
    /// Decode one raw line into a message.
    pub fn from_slice(line: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Envelope = serde_json::from_slice(line)?;
        Self::from_envelope(envelope)
    }

    /// The wire tag this message was decoded from.
    pub fn tag(&self) -> &str {
        match self {
            Message::Metrics(_) => "metrics",
            Message::Event(_) => "event",
            Message::Mapping(_) => "mapping",
            Message::Ping => "ping",
            Message::Sample(_) => "sample",
            Message::GripperSample(_) => "gripper_sample",
            Message::CameraFrame(_) => "camera_frame",
            Message::Unrecognized { kind } => kind,
        }
    }

    /// Interpret an already-parsed envelope.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, serde_json::Error> {
        let Envelope { kind, mut data, .. } = envelope;

        // A missing "data" object is tolerated for every tag, like ping's {}.
        if data.is_null() {
            data = Value::Object(serde_json::Map::new());
        }

        Ok(match kind.as_str() {
            "metrics" => Message::Metrics(serde_json::from_value(data)?),
            "event" => Message::Event(serde_json::from_value(data)?),
            "mapping" => Message::Mapping(serde_json::from_value(data)?),
            "ping" => Message::Ping,
            "sample" => Message::Sample(serde_json::from_value(data)?),
            "gripper_sample" => Message::GripperSample(serde_json::from_value(data)?),
            "camera_frame" => Message::CameraFrame(serde_json::from_value(data)?),
            _ => Message::Unrecognized { kind },
        })
    }
}

/// Aggregated CAN bus statistics, one snapshot per `metrics` message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsData {
    pub bus_load_percent: f64,
    pub total_frames: u64,
    pub active_ids: u64,
    pub error_frames_per_second: f64,
    pub dropped_frames_per_second: f64,
    /// Per CAN-ID frame statistics, keyed by the decimal ID string.
    pub per_id_stats: BTreeMap<String, IdStats>,
    /// Per command/response pair RTT statistics, keyed by "[send_id,recv_id]".
    pub per_pair_rtt: BTreeMap<String, PairRtt>,
}

/// Windowed frame-rate and inter-frame jitter for one CAN ID.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdStats {
    pub fps_window: f64,
    pub dt_mean_ms: f64,
    pub dt_p95_ms: f64,
}

/// Round-trip statistics for one (send_id, recv_id) pair.
///
/// `timeout_count` and `sample_count` are cumulative for the producer's
/// session and assumed monotonically non-decreasing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PairRtt {
    pub rtt_mean_ms: f64,
    pub rtt_p95_ms: f64,
    pub timeout_count: u64,
    pub sample_count: u64,
}

/// Event payload union for both producers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventData {
    // CAN monitor events
    pub event_type: Option<String>,
    pub can_id: Option<i64>,
    /// Free-form detail pairs, kept in producer order for log formatting.
    pub details: serde_json::Map<String, Value>,

    // Arm log-line events
    pub level: Option<String>,
    pub msg: Option<String>,
}

/// ID-mapping payload. Keys arrive as JSON object keys (strings) and values
/// as arbitrary JSON; the registry coerces and skips what it cannot.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MappingData {
    /// send_id -> recv_id
    pub can_id_map: BTreeMap<String, Value>,
    /// can_id -> joint name
    pub joint_names: BTreeMap<String, Value>,
    /// can_id -> joint id
    pub joint_ids: BTreeMap<String, Value>,
}

impl MappingData {
    /// True if no map carries any entries.
    pub fn is_empty(&self) -> bool {
        self.can_id_map.is_empty() && self.joint_names.is_empty() && self.joint_ids.is_empty()
    }
}

/// One arm telemetry sample with per-joint vectors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArmSampleData {
    /// Sample time in seconds (relative or absolute, producer-defined).
    pub t: f64,

    /// Caller-supplied joint names. Parsed but deliberately ignored; joints
    /// are named positionally `j1..jn`.
    pub joint_names: Option<Vec<String>>,

    pub target: Vec<f64>,
    pub pos: Vec<f64>,
    pub vel: Vec<f64>,
    pub torque: Vec<f64>,

    pub vel_filtered: Option<Vec<f64>>,
    pub acc_filtered: Option<Vec<f64>>,
    pub vel_boundary: Option<Vec<f64>>,
    pub traj: Option<Vec<f64>>,
    pub traj_vel_filtered: Option<Vec<f64>>,
}

impl ArmSampleData {
    /// Number of joints to fan out: the minimum length across the four
    /// required vectors. Longer optional vectors are consulted only up to
    /// their own length.
    pub fn joint_count(&self) -> usize {
        self.target
            .len()
            .min(self.pos.len())
            .min(self.vel.len())
            .min(self.torque.len())
    }
}

/// Gripper state sample; absent fields are simply not emitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GripperSampleData {
    pub name: Option<String>,
    pub pos: Option<f64>,
    pub target: Option<f64>,
    pub velocity: Option<f64>,
    pub torque_enabled: Option<bool>,
}

/// One JPEG camera frame, base64-encoded on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CameraFrameData {
    pub name: Option<String>,
    pub position: Option<String>,
    pub jpeg: Option<String>,
}

/// Parse a per-pair RTT key like `"[1,17]"` or `"(1, 17)"` into
/// `(send_id, recv_id)`.
pub fn parse_pair_key(key: &str) -> Option<(i64, i64)> {
    let inner = key
        .trim()
        .trim_start_matches(['[', '('])
        .trim_end_matches([']', ')']);

    let mut parts = inner.splitn(2, ',');
    let send = parts.next()?.trim().parse().ok()?;
    let recv = parts.next()?.trim().parse().ok()?;
    Some((send, recv))
}

/// Coerce a loosely-typed JSON value to an integer.
///
/// Accepts JSON integers and decimal strings; everything else is `None`.
pub fn coerce_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
