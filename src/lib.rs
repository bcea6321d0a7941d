// Library crate: public API items may not be used by the binary
#![allow(unused)]

//! # armwatch
//!
//! Telemetry ingestion and health monitoring for a robot arm rig.
//!
//! This crate runs two TCP servers speaking a newline-delimited JSON line
//! protocol. One ingests CAN bus metrics and maintains a hysteretic bus
//! health state; the other ingests arm controller samples, gripper samples,
//! camera frames, and log events. Everything decoded is forwarded to a
//! visualization sink as named scalar series, text logs, documents, and
//! images.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          armwatch                            │
//! │                                                              │
//! │  TCP :9877 ──▶ server ──▶ protocol ──▶ can ───┐              │
//! │                                   (metrics,    │             │
//! │                                    mapping,    ▼             │
//! │                                    events)   sink ──▶ JSONL  │
//! │                                                ▲             │
//! │  TCP :9878 ──▶ server ──▶ protocol ──▶ arm ───┘              │
//! │                                   (samples, gripper,         │
//! │                                    camera, events)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **[`server`]**: TCP accept loop and bounded line framing; routes decoded
//!   messages to a shared [`MessageHandler`]
//! - **[`protocol`]**: The closed set of message types and their payloads
//! - **[`can`]**: CAN metrics processing - bus scalars, per-joint RTT and
//!   loss rates, the [`health`] state machine, and event formatting
//! - **[`arm`]**: Per-joint sample fan-out, gripper and camera handling, and
//!   [`idle`]-gated camera frames
//! - **[`sink`]**: The [`TelemetrySink`] trait, the JSONL implementation,
//!   and a recording sink for tests
//!
//! Sink failures are logged and swallowed so that ingestion never stalls on
//! the visualization side.

pub mod arm;
pub mod can;
pub mod config;
pub mod duration;
pub mod health;
pub mod idle;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod sink;

pub use arm::ArmTelemetryProcessor;
pub use can::CanMetricsProcessor;
pub use config::Settings;
pub use health::{HealthState, StatusLevel};
pub use idle::{FrameDisposition, IdleTracker};
pub use protocol::Message;
pub use registry::JointRegistry;
pub use server::{MessageHandler, TelemetryServer};
pub use sink::{JsonlSink, RecordingSink, SinkHandle, TelemetrySink};
