//! Error types for distribution bootstrap and lifecycle.
//!
//! Resource detectors never surface errors: anything they cannot determine
//! degrades to an empty resource. These errors only come from wiring the SDK
//! together and from tearing it down.

use figment::Error as FigmentError;

/// Errors from SDK bootstrap and lifecycle.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum DistroError {
    /// Failed to extract configuration from sources.
    #[error("configuration error: {0}")]
    Config(#[source] Box<FigmentError>),

    /// Failed to create trace exporter.
    #[error("failed to create trace exporter")]
    TraceExporter(#[source] opentelemetry_otlp::ExporterBuildError),

    /// Failed to create metric exporter.
    #[error("failed to create metric exporter")]
    MetricExporter(#[source] opentelemetry_otlp::ExporterBuildError),

    /// Failed to create log exporter.
    #[error("failed to create log exporter")]
    LogExporter(#[source] opentelemetry_otlp::ExporterBuildError),

    /// Failed to initialise tracing subscriber.
    #[error("failed to initialise tracing subscriber")]
    TracingSubscriber(#[from] tracing_subscriber::util::TryInitError),

    /// Failed to flush providers.
    #[error("failed to flush providers")]
    Flush(#[source] opentelemetry_sdk::error::OTelSdkError),

    /// Failed to shut down providers.
    #[error("failed to shut down providers")]
    Shutdown(#[source] opentelemetry_sdk::error::OTelSdkError),

    /// The flush thread exited without reporting a result.
    #[error("flush thread did not report a result")]
    FlushTask(#[source] tokio::sync::oneshot::error::RecvError),

    /// Failed to start the thread running the flush.
    #[error("failed to spawn flush thread")]
    FlushThread(#[source] std::io::Error),

    /// Failed to register a handler for a process exit signal.
    #[error("failed to install handler for {signal}")]
    SignalHandler {
        /// Name of the signal.
        signal: &'static str,
        /// Underlying registration failure.
        #[source]
        source: std::io::Error,
    },

    /// Invalid collector base URL format.
    #[error("invalid collector base URL: {url} (must start with http:// or https://)")]
    InvalidEndpoint {
        /// The invalid URL that was provided.
        url: String,
    },
}
