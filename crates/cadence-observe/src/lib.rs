//! Observability setup for Cadence: structured logging with optional
//! OpenTelemetry span export.

pub mod tracing_setup;
