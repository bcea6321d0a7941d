//! CAN metrics processing.
//!
//! Consumes `metrics`, `event`, and `mapping` messages from the bus-health
//! monitor: emits bus-level scalars, resolves per-pair RTT and loss onto
//! joint identifiers via the mapping registry, and drives the hysteretic
//! health status. Owned by one server instance behind a mutex; every message
//! is handled to completion without suspension.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info};

use crate::health::{HealthState, StatusLevel};
use crate::protocol::{parse_pair_key, EventData, MappingData, Message, MetricsData};
use crate::registry::JointRegistry;
use crate::server::MessageHandler;
use crate::sink::SinkHandle;

/// Processor for the CAN metrics server.
#[derive(Debug)]
pub struct CanMetricsProcessor {
    registry: JointRegistry,
    health: HealthState,
    /// joint id -> previous cumulative (timeout_count, sample_count)
    pair_counts: BTreeMap<i64, (u64, u64)>,
    sink: SinkHandle,
}

impl CanMetricsProcessor {
    pub fn new(sink: SinkHandle) -> Self {
        Self {
            registry: JointRegistry::new(),
            health: HealthState::new(),
            pair_counts: BTreeMap::new(),
            sink,
        }
    }

    pub fn registry(&self) -> &JointRegistry {
        &self.registry
    }

    pub fn health_level(&self) -> StatusLevel {
        self.health.level()
    }

    /// Resolve a (send_id, recv_id) pair to a joint identifier.
    ///
    /// Prefers the receive-ID joint mapping, falls back to the send-ID
    /// mapping, then to the raw receive ID.
    fn resolve_pair(&self, send_id: i64, recv_id: i64) -> i64 {
        self.registry
            .joint_id(recv_id)
            .or_else(|| self.registry.joint_id(send_id))
            .unwrap_or(recv_id)
    }

    /// Handle one metrics snapshot.
    pub fn process_metrics(&mut self, data: &MetricsData) {
        let bus_load = data.bus_load_percent;
        let error_rate = data.error_frames_per_second;
        let drop_rate = data.dropped_frames_per_second;

        self.sink.scalar("can/bus/load", bus_load);
        self.sink.scalar("can/bus/frames_total", data.total_frames as f64);
        self.sink.scalar("can/bus/active_ids", data.active_ids as f64);
        self.sink.scalar("can/bus/errors_per_s", error_rate);
        self.sink.scalar("can/bus/drops_per_s", drop_rate);

        let mut rtt_means = Vec::with_capacity(data.per_pair_rtt.len());
        for (key, stats) in &data.per_pair_rtt {
            rtt_means.push(stats.rtt_mean_ms);

            let Some((send_id, recv_id)) = parse_pair_key(key) else {
                debug!("skipping unparseable RTT pair key: {:?}", key);
                continue;
            };
            let joint = self.resolve_pair(send_id, recv_id);
            self.sink.scalar(&format!("can/rtt/{joint}"), stats.rtt_mean_ms);

            // Cumulative counters are clamped on apparent decrease
            // (producer reconnect/reset) so deltas never go negative.
            let (prev_timeout, prev_sample) =
                self.pair_counts.get(&joint).copied().unwrap_or((0, 0));
            let delta_timeout = stats.timeout_count.saturating_sub(prev_timeout);
            let delta_sample = stats.sample_count.saturating_sub(prev_sample);
            self.pair_counts.insert(joint, (stats.timeout_count, stats.sample_count));

            let loss_rate = delta_timeout as f64 / (delta_timeout + delta_sample).max(1) as f64;
            self.sink.scalar(&format!("can/loss/{joint}"), loss_rate);
        }

        if !rtt_means.is_empty() {
            let mean = rtt_means.iter().sum::<f64>() / rtt_means.len() as f64;
            let mut sorted = rtt_means;
            sorted.sort_by(f64::total_cmp);
            self.sink.scalar("can/rtt/mean", mean);
            self.sink.scalar("can/rtt/p95", percentile_nearest_rank(&sorted, 0.95));
        }

        for (key, stats) in &data.per_id_stats {
            let Ok(can_id) = key.trim().parse::<i64>() else {
                continue;
            };
            let joint = self.registry.joint_id(can_id).unwrap_or(can_id);
            self.sink.scalar(&format!("can/fps/{joint}"), stats.fps_window);
            self.sink.scalar(&format!("can/jitter/{joint}"), stats.dt_mean_ms);
            self.sink.scalar(&format!("can/jitter_p95/{joint}"), stats.dt_p95_ms);
        }

        if let Some(doc) = self.health.update(bus_load, error_rate, drop_rate) {
            info!(
                "CAN health status -> {}: {}",
                self.health.level().as_str(),
                self.health.message()
            );
            self.sink.document("notify/dashboard", &doc);
        }
    }

    /// Handle one CAN event.
    ///
    /// Events are formatted into the text log only; the stored health status
    /// is driven by metrics, never by individual events.
    pub fn process_event(&self, data: &EventData) {
        let event_type = data.event_type.as_deref().unwrap_or("unknown");

        let level = match event_type {
            "error_frame" | "watchdog" => StatusLevel::Error,
            "timeout" | "high_temp" | "drop" => StatusLevel::Warning,
            _ => StatusLevel::Info,
        };

        let mut message = format!("[CAN] {}", event_type.to_uppercase());
        if let Some(can_id) = data.can_id {
            // Signed IDs should not render as two's-complement hex.
            let sign = if can_id < 0 { "-" } else { "" };
            message.push_str(&format!(" ID={}0x{:03X}", sign, can_id.unsigned_abs()));
        }
        for (key, value) in &data.details {
            message.push_str(&format!(" {}={}", key, detail_value(value)));
        }

        self.sink.text_log("notify/log", level, &message);
        info!("CAN event: {}", message);
    }

    /// Merge a mapping payload into the registry.
    pub fn process_mapping(&mut self, data: &MappingData) {
        self.registry.merge(data);

        if self.registry.joint_id_count() > 0 {
            info!(
                "received CAN joint id mapping: {} IDs",
                self.registry.joint_id_count()
            );
        } else if self.registry.name_count() > 0 {
            info!("received CAN ID mapping: {} joints", self.registry.name_count());
        }
    }
}

impl MessageHandler for CanMetricsProcessor {
    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Metrics(m) => self.process_metrics(&m),
            Message::Event(e) => self.process_event(&e),
            Message::Mapping(m) => self.process_mapping(&m),
            Message::Ping => debug!("received ping"),
            other => debug!("CAN server ignoring {} message", other.tag()),
        }
    }
}

/// Nearest-rank percentile: value at index ⌈q·n⌉−1 of ascending values.
fn percentile_nearest_rank(sorted: &[f64], q: f64) -> f64 {
    debug_assert!(!sorted.is_empty());
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Render a JSON detail value the way it reads on the wire (no quoting).
fn detail_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sink::{RecordingSink, SinkEvent};

    fn processor() -> (CanMetricsProcessor, RecordingSink) {
        let sink = RecordingSink::new();
        let processor = CanMetricsProcessor::new(SinkHandle::new(Arc::new(sink.clone())));
        (processor, sink)
    }

    fn metrics(json: serde_json::Value) -> MetricsData {
        serde_json::from_value(json).unwrap()
    }

    fn mapping(json: serde_json::Value) -> MappingData {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_bus_scalars_emitted() {
        let (mut p, sink) = processor();
        p.process_metrics(&metrics(serde_json::json!({
            "bus_load_percent": 42.5,
            "total_frames": 1000,
            "active_ids": 6,
            "error_frames_per_second": 0.05,
            "dropped_frames_per_second": 0.01,
        })));

        assert_eq!(sink.scalar_values("can/bus/load"), vec![42.5]);
        assert_eq!(sink.scalar_values("can/bus/frames_total"), vec![1000.0]);
        assert_eq!(sink.scalar_values("can/bus/active_ids"), vec![6.0]);
        assert_eq!(sink.scalar_values("can/bus/errors_per_s"), vec![0.05]);
        assert_eq!(sink.scalar_values("can/bus/drops_per_s"), vec![0.01]);
    }

    #[test]
    fn test_pair_rtt_resolved_via_mapping_and_loss_on_first_receipt() {
        let (mut p, sink) = processor();
        p.process_mapping(&mapping(serde_json::json!({
            "can_id_map": {"1": 17},
            "joint_names": {"1": "shoulder"},
        })));

        p.process_metrics(&metrics(serde_json::json!({
            "per_pair_rtt": {
                "[1,17]": {"rtt_mean_ms": 5.0, "timeout_count": 2, "sample_count": 98},
            },
        })));

        // No joint_ids mapped: falls back to the raw receive ID.
        assert_eq!(sink.scalar_values("can/rtt/17"), vec![5.0]);
        // First receipt: previous counts default to zero, loss = 2/100.
        assert_eq!(sink.scalar_values("can/loss/17"), vec![0.02]);
        assert_eq!(sink.scalar_values("can/rtt/mean"), vec![5.0]);
        assert_eq!(sink.scalar_values("can/rtt/p95"), vec![5.0]);
    }

    #[test]
    fn test_pair_resolution_prefers_recv_then_send_joint_id() {
        let (mut p, sink) = processor();
        p.process_mapping(&mapping(serde_json::json!({
            "joint_ids": {"17": 3},
        })));
        p.process_metrics(&metrics(serde_json::json!({
            "per_pair_rtt": {"[1,17]": {"rtt_mean_ms": 4.0}},
        })));
        assert_eq!(sink.scalar_values("can/rtt/3"), vec![4.0]);

        // Only the send side mapped: fall back to it.
        sink.clear();
        p.process_mapping(&mapping(serde_json::json!({
            "joint_ids": {"2": 9},
        })));
        p.process_metrics(&metrics(serde_json::json!({
            "per_pair_rtt": {"[2,18]": {"rtt_mean_ms": 6.0}},
        })));
        assert_eq!(sink.scalar_values("can/rtt/9"), vec![6.0]);
    }

    #[test]
    fn test_loss_rate_clamped_on_counter_reset() {
        let (mut p, sink) = processor();
        p.process_metrics(&metrics(serde_json::json!({
            "per_pair_rtt": {"[1,17]": {"timeout_count": 50, "sample_count": 50}},
        })));
        assert_eq!(sink.scalar_values("can/loss/17"), vec![0.5]);

        // Producer reconnected: counters went backwards. Deltas clamp to
        // zero and the rate stays in [0,1].
        p.process_metrics(&metrics(serde_json::json!({
            "per_pair_rtt": {"[1,17]": {"timeout_count": 1, "sample_count": 3}},
        })));
        let losses = sink.scalar_values("can/loss/17");
        assert_eq!(losses.len(), 2);
        assert_eq!(losses[1], 0.0);
        for loss in losses {
            assert!((0.0..=1.0).contains(&loss));
        }
    }

    #[test]
    fn test_aggregate_rtt_uses_nearest_rank_p95() {
        let (mut p, sink) = processor();

        let mut pairs = serde_json::Map::new();
        for i in 1..=20 {
            pairs.insert(
                format!("[{i},{}]", 100 + i),
                serde_json::json!({"rtt_mean_ms": i as f64}),
            );
        }
        p.process_metrics(&metrics(serde_json::json!({"per_pair_rtt": pairs})));

        assert_eq!(sink.scalar_values("can/rtt/mean"), vec![10.5]);
        // ceil(0.95 * 20) - 1 = index 18 -> 19.0
        assert_eq!(sink.scalar_values("can/rtt/p95"), vec![19.0]);
    }

    #[test]
    fn test_unparseable_pair_key_still_counts_toward_aggregate() {
        let (mut p, sink) = processor();
        p.process_metrics(&metrics(serde_json::json!({
            "per_pair_rtt": {
                "garbage": {"rtt_mean_ms": 10.0},
                "[1,17]": {"rtt_mean_ms": 2.0},
            },
        })));

        assert_eq!(sink.scalar_values("can/rtt/mean"), vec![6.0]);
        assert_eq!(sink.scalar_values("can/rtt/17"), vec![2.0]);
    }

    #[test]
    fn test_per_id_stats_fan_out() {
        let (mut p, sink) = processor();
        p.process_mapping(&mapping(serde_json::json!({
            "joint_ids": {"5": 2},
        })));
        p.process_metrics(&metrics(serde_json::json!({
            "per_id_stats": {
                "5": {"fps_window": 100.0, "dt_mean_ms": 1.5, "dt_p95_ms": 3.0},
                "6": {"fps_window": 50.0, "dt_mean_ms": 2.0, "dt_p95_ms": 4.0},
                "bad": {"fps_window": 1.0},
            },
        })));

        assert_eq!(sink.scalar_values("can/fps/2"), vec![100.0]);
        assert_eq!(sink.scalar_values("can/jitter/2"), vec![1.5]);
        assert_eq!(sink.scalar_values("can/jitter_p95/2"), vec![3.0]);
        // Unmapped ID falls back to the raw CAN ID.
        assert_eq!(sink.scalar_values("can/fps/6"), vec![50.0]);
    }

    #[test]
    fn test_status_transition_sequence() {
        let (mut p, sink) = processor();
        let load = |l: f64, e: f64| {
            metrics(serde_json::json!({
                "bus_load_percent": l,
                "error_frames_per_second": e,
            }))
        };

        p.process_metrics(&load(25.0, 0.0)); // INFO, initial state, no event
        p.process_metrics(&load(65.0, 0.0)); // -> WARNING
        p.process_metrics(&load(85.0, 2.5)); // -> ERROR
        p.process_metrics(&load(10.0, 0.0)); // -> INFO

        assert_eq!(sink.document_count(), 3);
        assert_eq!(p.health_level(), StatusLevel::Info);
    }

    #[test]
    fn test_event_severity_and_formatting() {
        let (p, sink) = processor();
        let event = |json| serde_json::from_value::<EventData>(json).unwrap();

        p.process_event(&event(serde_json::json!({
            "event_type": "timeout", "can_id": 3, "details": {"temp": 71},
        })));
        p.process_event(&event(serde_json::json!({"event_type": "watchdog"})));
        p.process_event(&event(serde_json::json!({"event_type": "startup"})));

        let events = sink.events();
        assert_eq!(
            events[0],
            SinkEvent::TextLog {
                path: "notify/log".to_string(),
                level: StatusLevel::Warning,
                text: "[CAN] TIMEOUT ID=0x003 temp=71".to_string(),
            }
        );
        assert!(matches!(
            &events[1],
            SinkEvent::TextLog { level: StatusLevel::Error, .. }
        ));
        assert!(matches!(
            &events[2],
            SinkEvent::TextLog { level: StatusLevel::Info, .. }
        ));
    }

    #[test]
    fn test_event_details_keep_producer_order() {
        let (p, sink) = processor();
        p.process_event(
            &serde_json::from_slice(
                br#"{"event_type":"timeout","details":{"zeta":1,"alpha":"two"}}"#,
            )
            .unwrap(),
        );

        assert!(matches!(
            &sink.events()[0],
            SinkEvent::TextLog { text, .. } if text == "[CAN] TIMEOUT zeta=1 alpha=two"
        ));
    }

    #[test]
    fn test_negative_can_id_renders_signed_hex() {
        let (p, sink) = processor();
        p.process_event(
            &serde_json::from_value(serde_json::json!({
                "event_type": "timeout", "can_id": -3,
            }))
            .unwrap(),
        );

        assert!(matches!(
            &sink.events()[0],
            SinkEvent::TextLog { text, .. } if text == "[CAN] TIMEOUT ID=-0x003"
        ));
    }

    #[test]
    fn test_events_do_not_affect_health_status() {
        let (mut p, sink) = processor();
        p.process_event(&serde_json::from_value(serde_json::json!({
            "event_type": "error_frame", "can_id": 1,
        })).unwrap());

        assert_eq!(p.health_level(), StatusLevel::Info);
        assert_eq!(sink.document_count(), 0);

        // And a nominal metrics message after the event stays silent.
        p.process_metrics(&metrics(serde_json::json!({"bus_load_percent": 10.0})));
        assert_eq!(sink.document_count(), 0);
    }

    #[test]
    fn test_percentile_nearest_rank_small_sets() {
        assert_eq!(percentile_nearest_rank(&[5.0], 0.95), 5.0);
        assert_eq!(percentile_nearest_rank(&[1.0, 2.0], 0.95), 2.0);
        assert_eq!(percentile_nearest_rank(&[1.0, 2.0, 3.0], 0.5), 2.0);
    }
}
