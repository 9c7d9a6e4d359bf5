//! Tracing subscriber initialization.
//!
//! # Usage
//!
//! ```no_run
//! use cadence_observe::tracing_setup::{init_tracing, LogOptions};
//!
//! let options = LogOptions { verbose: 1, ..LogOptions::default() };
//! init_tracing(&options).unwrap();
//! // ... run the engine ...
//! cadence_observe::tracing_setup::shutdown_tracing();
//! ```

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Kept so the provider can be flushed on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// How the process wants its logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    /// `-v` count.
    pub verbose: u8,
    /// Only errors.
    pub quiet: bool,
    /// Emit log lines as JSON objects.
    pub json: bool,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    pub otel: bool,
}

impl LogOptions {
    /// Filter directive derived from the verbosity flags.
    pub fn directive(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,cadence=debug",
            _ => "trace",
        }
    }

    /// `RUST_LOG` wins over the flags when it is set and parses.
    pub fn env_filter(&self) -> EnvFilter {
        match std::env::var(EnvFilter::DEFAULT_ENV) {
            Ok(raw) if !raw.trim().is_empty() => {
                EnvFilter::try_new(&raw).unwrap_or_else(|_| EnvFilter::new(self.directive()))
            }
            _ => EnvFilter::new(self.directive()),
        }
    }
}

/// Install the global subscriber.
///
/// Log lines go to stderr so machine-readable command output on stdout stays
/// clean. With `otel` set, spans are additionally exported through
/// OpenTelemetry.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(options: &LogOptions) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let fmt_layer = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(options.verbose > 0)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(options.env_filter())
        .with(fmt_layer);

    if options.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("cadence");
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        registry.try_init()?;
    }

    tracing::debug!(json = options.json, otel = options.otel, "tracing initialized");
    Ok(())
}

/// Flush and shut down the OpenTelemetry provider. No-op without OTel.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_follows_verbosity() {
        let mut options = LogOptions::default();
        assert_eq!(options.directive(), "warn");

        options.quiet = true;
        assert_eq!(options.directive(), "error");

        options.verbose = 1;
        assert_eq!(options.directive(), "info,cadence=debug");

        options.verbose = 3;
        assert_eq!(options.directive(), "trace");
    }

    #[test]
    fn shutdown_without_otel_is_noop() {
        shutdown_tracing();
    }
}
