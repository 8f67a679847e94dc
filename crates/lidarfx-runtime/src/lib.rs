//! `lidarfx-runtime` – process-level wiring for the perception pipeline.
//!
//! # Modules
//!
//! - [`node`] – [`PerceptionNode`][node::PerceptionNode]: drains a sensor
//!   source, keeps the orientation tracker current, runs every frame through
//!   the pipeline on a blocking worker and publishes the results.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export
//!   to any OTLP-compatible collector.

pub mod node;
pub mod telemetry;

pub use node::{NodeSummary, PerceptionNode};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};
