//! Observability setup for aslrun: `tracing` subscriber installation with
//! optional JSON output and OpenTelemetry stdout export.

pub mod tracing_setup;
