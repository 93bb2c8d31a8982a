//! OpenTelemetry provider lifecycle management.
//!
//! The [`DistroGuard`] owns the tracer, meter and logger providers and the
//! exit hooks that flush them. Whichever comes first (a signal, the
//! application going idle, an explicit [`DistroGuard::shutdown`] or the guard
//! being dropped) performs the one and only flush.

use crate::config::DistroConfig;
use crate::error::DistroError;
use crate::shutdown::{
    ExitHooks, ShutdownOrchestrator, ShutdownOutcome, ShutdownTrigger, run_detached, wait_detached,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::trace::{Span as _, Tracer as _, TracerProvider as _};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::{BatchLogProcessor, SdkLoggerProvider};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{BatchSpanProcessor, SdkTracerProvider};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const INSTRUMENTATION_SCOPE: &str = env!("CARGO_PKG_NAME");

/// Guard that manages OpenTelemetry provider lifecycle.
///
/// On drop, flushes pending telemetry and shuts down providers unless an exit
/// trigger already did. The drop waits at most the configured shutdown
/// timeout.
pub struct DistroGuard {
    hooks: ExitHooks,
    providers: Providers,
    shutdown_timeout: Duration,
}

#[derive(Clone)]
struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl DistroGuard {
    /// Creates a guard from configuration and a detected resource.
    ///
    /// This is typically called by [`DistroBuilder::build`](super::DistroBuilder::build).
    pub(crate) fn from_config(config: DistroConfig, resource: Resource) -> Result<Self, DistroError> {
        let providers = Providers {
            tracer: build_tracer_provider(&config, resource.clone())?,
            meter: build_meter_provider(&config, resource.clone())?,
            logger: build_logger_provider(&config, resource)?,
        };

        opentelemetry::global::set_tracer_provider(providers.tracer.clone());
        opentelemetry::global::set_meter_provider(providers.meter.clone());

        let propagator = TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]);
        opentelemetry::global::set_text_map_propagator(propagator);

        if config.init_tracing_subscriber {
            init_subscriber(&providers, config.default_log_level())?;
        }

        let orchestrator = Arc::new(
            ShutdownOrchestrator::new(flush_operation(providers.clone()))
                .with_timeout(config.shutdown_timeout),
        );
        let hooks = ExitHooks::install(orchestrator, &config)?;

        if let Some(name) = config.bootstrap_span {
            let tracer = providers.tracer.tracer(INSTRUMENTATION_SCOPE);
            tracer.start(name).end();
        }

        Ok(Self {
            hooks,
            providers,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Returns the tracer provider.
    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.providers.tracer
    }

    /// Returns the meter provider.
    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.providers.meter
    }

    /// Returns the logger provider.
    pub fn logger_provider(&self) -> &SdkLoggerProvider {
        &self.providers.logger
    }

    /// Flushes all providers without shutting them down. Errors are logged
    /// but not returned.
    pub fn flush(&self) {
        if let Err(e) = self.providers.tracer.force_flush() {
            tracing::error!(target: "otel_lifecycle", error = %e, "Failed to flush tracer provider");
        }

        if let Err(e) = self.providers.meter.force_flush() {
            tracing::error!(target: "otel_lifecycle", error = %e, "Failed to flush meter provider");
        }

        if let Err(e) = self.providers.logger.force_flush() {
            tracing::error!(target: "otel_lifecycle", error = %e, "Failed to flush logger provider");
        }
    }

    /// Returns the flush-and-close operation the exit hooks race against the
    /// shutdown timeout.
    ///
    /// The operation runs the SDK's blocking flush on its own thread, which
    /// is left behind if the caller stops waiting. Calling it after the guard
    /// has shut down reports the SDK's "already shut down" error.
    pub fn flush_operation(
        &self,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<(), DistroError>> + Send + 'static {
        flush_operation(self.providers.clone())
    }

    /// Signals that the application has no more work scheduled.
    ///
    /// Flushes once unless disabled through `flush_on_empty_event_loop`, in
    /// which case `None` is returned.
    pub async fn before_exit(&self) -> Option<ShutdownOutcome> {
        self.hooks.before_exit().await
    }

    /// Flushes and shuts down all providers, bounded by the shutdown timeout.
    ///
    /// Returns [`ShutdownOutcome::AlreadyShutDown`] if an exit trigger got
    /// there first.
    pub async fn shutdown(self) -> ShutdownOutcome {
        self.hooks
            .orchestrator()
            .shutdown(ShutdownTrigger::Explicit)
            .await
    }
}

impl Drop for DistroGuard {
    fn drop(&mut self) {
        if !self.hooks.orchestrator().claim() {
            return;
        }
        let providers = self.providers.clone();
        match wait_detached(move || providers.flush_and_close(), self.shutdown_timeout) {
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) | Err(e) => {
                tracing::error!(target: "otel_lifecycle", error = %e, "Failed to shut down providers");
            }
            Ok(None) => {
                tracing::error!(
                    target: "otel_lifecycle",
                    timeout = ?self.shutdown_timeout,
                    "Provider shutdown timed out, abandoning pending telemetry"
                );
            }
        }
    }
}

impl Providers {
    fn flush_and_close(&self) -> Result<(), DistroError> {
        self.tracer.force_flush().map_err(DistroError::Flush)?;
        self.tracer.shutdown().map_err(DistroError::Shutdown)?;

        self.logger.force_flush().map_err(DistroError::Flush)?;
        self.logger.shutdown().map_err(DistroError::Shutdown)?;

        self.meter.force_flush().map_err(DistroError::Flush)?;
        self.meter.shutdown().map_err(DistroError::Shutdown)?;

        Ok(())
    }
}

fn flush_operation(
    providers: Providers,
) -> impl FnOnce() -> BoxFuture<'static, Result<(), DistroError>> + Send + 'static {
    move || run_detached(move || providers.flush_and_close()).boxed()
}

macro_rules! build_exporter {
    ($config:expr, $exporter_type:ident, $signal_path:expr, $error_variant:ident) => {{
        let endpoint = $config.signal_endpoint($signal_path);
        opentelemetry_otlp::$exporter_type::builder()
            .with_http()
            .with_endpoint(&endpoint)
            .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
            .build()
            .map_err(DistroError::$error_variant)?
    }};
}

fn build_tracer_provider(
    config: &DistroConfig,
    resource: Resource,
) -> Result<SdkTracerProvider, DistroError> {
    let exporter = build_exporter!(config, SpanExporter, "/v1/traces", TraceExporter);

    let mut builder = SdkTracerProvider::builder()
        .with_span_processor(BatchSpanProcessor::builder(exporter).build());

    if config.debug_print_spans {
        builder = builder.with_span_processor(
            BatchSpanProcessor::builder(opentelemetry_stdout::SpanExporter::default()).build(),
        );
    }

    Ok(builder.with_resource(resource).build())
}

fn build_meter_provider(
    config: &DistroConfig,
    resource: Resource,
) -> Result<SdkMeterProvider, DistroError> {
    let endpoint = config.signal_endpoint("/v1/metrics");
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_endpoint(&endpoint)
        .with_protocol(opentelemetry_otlp::Protocol::HttpBinary)
        .with_timeout(config.metric_export_timeout)
        .build()
        .map_err(DistroError::MetricExporter)?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(config.metric_export_interval)
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}

fn build_logger_provider(
    config: &DistroConfig,
    resource: Resource,
) -> Result<SdkLoggerProvider, DistroError> {
    let exporter = build_exporter!(config, LogExporter, "/v1/logs", LogExporter);

    Ok(SdkLoggerProvider::builder()
        .with_log_processor(BatchLogProcessor::builder(exporter).build())
        .with_resource(resource)
        .build())
}

fn init_subscriber(providers: &Providers, default_level: &str) -> Result<(), DistroError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .without_time();

    let tracer = providers.tracer.tracer(INSTRUMENTATION_SCOPE);
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
    let log_layer = OpenTelemetryTracingBridge::new(&providers.logger);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(telemetry_layer)
        .with(log_layer)
        .try_init()?;

    Ok(())
}
