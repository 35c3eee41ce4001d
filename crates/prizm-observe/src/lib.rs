//! Observability setup for Prizm: structured logging and optional
//! OpenTelemetry export.

pub mod tracing_setup;
