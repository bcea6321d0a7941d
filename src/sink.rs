//! Visualization sink boundary.
//!
//! The ingestion core forwards named scalar/series updates, markdown status
//! documents, text-log lines, and camera images through the [`TelemetrySink`]
//! trait. Sink failures must never affect ingestion: processors go through
//! [`SinkHandle`], which logs and swallows every error.
//!
//! Two adapters ship with the crate: [`JsonlSink`] writes each record as one
//! newline-delimited JSON object (to stdout or a file), and [`RecordingSink`]
//! captures records in memory for tests and embedding.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::health::StatusLevel;

/// Errors a sink adapter can raise.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Writing to the underlying destination failed.
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record could not be serialized.
    #[error("failed to serialize sink record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The adapter rejected the record.
    #[error("sink rejected record: {0}")]
    Rejected(String),
}

/// Destination for named telemetry signals.
///
/// Paths are slash-separated entity paths like `can/rtt/3` or
/// `arm/joints/j1/pos`.
pub trait TelemetrySink: Send + Sync + fmt::Debug {
    /// Record a single scalar sample.
    fn scalar(&self, path: &str, value: f64) -> Result<(), SinkError>;

    /// Record several series sharing one path (e.g. target + actual).
    fn scalars(&self, path: &str, values: &[f64]) -> Result<(), SinkError>;

    /// Declare display names for the series at a path. Idempotent.
    fn series_names(&self, path: &str, names: &[&str]) -> Result<(), SinkError>;

    /// Append a leveled text-log line.
    fn text_log(&self, path: &str, level: StatusLevel, text: &str) -> Result<(), SinkError>;

    /// Replace the markdown document at a path.
    fn document(&self, path: &str, markdown: &str) -> Result<(), SinkError>;

    /// Record an encoded image (JPEG camera frame).
    fn image(&self, path: &str, media_type: &str, bytes: &[u8]) -> Result<(), SinkError>;
}

/// Shared, infallible handle the processors write through.
///
/// Every error is logged at warn level and dropped; the internal aggregation
/// state of the caller is already updated and is not rolled back.
#[derive(Debug, Clone)]
pub struct SinkHandle {
    inner: Arc<dyn TelemetrySink>,
}

impl SinkHandle {
    pub fn new(inner: Arc<dyn TelemetrySink>) -> Self {
        Self { inner }
    }

    fn report(path: &str, result: Result<(), SinkError>) {
        if let Err(e) = result {
            warn!("sink write failed for {}: {}", path, e);
        }
    }

    pub fn scalar(&self, path: &str, value: f64) {
        Self::report(path, self.inner.scalar(path, value));
    }

    pub fn scalars(&self, path: &str, values: &[f64]) {
        Self::report(path, self.inner.scalars(path, values));
    }

    pub fn series_names(&self, path: &str, names: &[&str]) {
        Self::report(path, self.inner.series_names(path, names));
    }

    pub fn text_log(&self, path: &str, level: StatusLevel, text: &str) {
        Self::report(path, self.inner.text_log(path, level, text));
    }

    pub fn document(&self, path: &str, markdown: &str) {
        Self::report(path, self.inner.document(path, markdown));
    }

    pub fn image(&self, path: &str, media_type: &str, bytes: &[u8]) {
        Self::report(path, self.inner.image(path, media_type, bytes));
    }
}

/// Sink that writes each record as one newline-delimited JSON object.
pub struct JsonlSink {
    writer: Mutex<Box<dyn Write + Send>>,
    description: String,
}

impl JsonlSink {
    /// Write records to stdout.
    pub fn stdout() -> Self {
        Self {
            writer: Mutex::new(Box::new(io::stdout())),
            description: "stdout".to_string(),
        }
    }

    /// Write records to a file (created or truncated).
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
            description: path.display().to_string(),
        })
    }

    /// Write records to an arbitrary writer (useful in tests).
    pub fn from_writer(writer: Box<dyn Write + Send>, description: &str) -> Self {
        Self {
            writer: Mutex::new(writer),
            description: description.to_string(),
        }
    }

    fn write_record(&self, record: serde_json::Value) -> Result<(), SinkError> {
        let line = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for JsonlSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlSink").field("destination", &self.description).finish()
    }
}

impl TelemetrySink for JsonlSink {
    fn scalar(&self, path: &str, value: f64) -> Result<(), SinkError> {
        self.write_record(serde_json::json!({"kind": "scalar", "path": path, "value": value}))
    }

    fn scalars(&self, path: &str, values: &[f64]) -> Result<(), SinkError> {
        self.write_record(serde_json::json!({"kind": "scalars", "path": path, "values": values}))
    }

    fn series_names(&self, path: &str, names: &[&str]) -> Result<(), SinkError> {
        self.write_record(serde_json::json!({"kind": "series_names", "path": path, "names": names}))
    }

    fn text_log(&self, path: &str, level: StatusLevel, text: &str) -> Result<(), SinkError> {
        self.write_record(serde_json::json!({
            "kind": "log", "path": path, "level": level.as_str(), "text": text,
        }))
    }

    fn document(&self, path: &str, markdown: &str) -> Result<(), SinkError> {
        self.write_record(serde_json::json!({"kind": "document", "path": path, "markdown": markdown}))
    }

    fn image(&self, path: &str, media_type: &str, bytes: &[u8]) -> Result<(), SinkError> {
        self.write_record(serde_json::json!({
            "kind": "image",
            "path": path,
            "media_type": media_type,
            "data": BASE64_STANDARD.encode(bytes),
        }))
    }
}

/// One record captured by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Scalar { path: String, value: f64 },
    Scalars { path: String, values: Vec<f64> },
    SeriesNames { path: String, names: Vec<String> },
    TextLog { path: String, level: StatusLevel, text: String },
    Document { path: String, markdown: String },
    Image { path: String, media_type: String, bytes: Vec<u8> },
}

/// In-memory sink for tests and library embedding.
///
/// Clones share the same underlying event log.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<SinkEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured events, in emission order.
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// All scalar values recorded at a path, in order.
    pub fn scalar_values(&self, path: &str) -> Vec<f64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Scalar { path: p, value } if p == path => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// All multi-series vectors recorded at a path, in order.
    pub fn scalars_values(&self, path: &str) -> Vec<Vec<f64>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Scalars { path: p, values } if p == path => Some(values.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of text-log lines containing a substring.
    pub fn log_count_containing(&self, needle: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SinkEvent::TextLog { text, .. } if text.contains(needle)))
            .count()
    }

    /// Number of document emissions (status transitions land here).
    pub fn document_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Document { .. }))
            .count()
    }

    /// Number of images recorded.
    pub fn image_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Image { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: SinkEvent) -> Result<(), SinkError> {
        self.events.lock().push(event);
        Ok(())
    }
}

impl TelemetrySink for RecordingSink {
    fn scalar(&self, path: &str, value: f64) -> Result<(), SinkError> {
        self.push(SinkEvent::Scalar { path: path.to_string(), value })
    }

    fn scalars(&self, path: &str, values: &[f64]) -> Result<(), SinkError> {
        self.push(SinkEvent::Scalars { path: path.to_string(), values: values.to_vec() })
    }

    fn series_names(&self, path: &str, names: &[&str]) -> Result<(), SinkError> {
        self.push(SinkEvent::SeriesNames {
            path: path.to_string(),
            names: names.iter().map(|n| n.to_string()).collect(),
        })
    }

    fn text_log(&self, path: &str, level: StatusLevel, text: &str) -> Result<(), SinkError> {
        self.push(SinkEvent::TextLog { path: path.to_string(), level, text: text.to_string() })
    }

    fn document(&self, path: &str, markdown: &str) -> Result<(), SinkError> {
        self.push(SinkEvent::Document { path: path.to_string(), markdown: markdown.to_string() })
    }

    fn image(&self, path: &str, media_type: &str, bytes: &[u8]) -> Result<(), SinkError> {
        self.push(SinkEvent::Image {
            path: path.to_string(),
            media_type: media_type.to_string(),
            bytes: bytes.to_vec(),
        })
    }
}
