//! Builder for the distribution.
//!
//! The builder supports layered configuration from multiple sources:
//! 1. Compiled defaults
//! 2. Configuration files (TOML)
//! 3. Environment variables
//! 4. Programmatic overrides
//!
//! Sources are merged in order, with later sources taking precedence.

use crate::config::DistroConfig;
use crate::environment;
use crate::error::DistroError;
use crate::guard::DistroGuard;
use crate::kubernetes::PodUidDetector;
use crate::resource::detect_resource;
use crate::service_name::ServiceNameFallbackDetector;
use figment::Figment;
use figment::providers::{Format, Serialized, Toml};
use std::path::Path;
use std::time::Duration;

/// Builder for configuring and starting the distribution.
///
/// # Example
///
/// ```no_run
/// use opentelemetry_distro::{DistroBuilder, DistroError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), DistroError> {
///     let guard = DistroBuilder::new().with_env().build().await?;
///
///     tracing::info!("Application running");
///
///     guard.shutdown().await;
///     Ok(())
/// }
/// ```
#[must_use = "builders do nothing unless .build() is called"]
pub struct DistroBuilder {
    figment: Figment,
}

impl DistroBuilder {
    /// Creates a new builder with default configuration.
    pub fn new() -> Self {
        Self {
            figment: Figment::from(Serialized::defaults(DistroConfig::default())),
        }
    }

    /// Creates a builder from an existing figment.
    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    /// Merges configuration from a TOML file.
    ///
    /// If the file doesn't exist, it's silently skipped.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            self.figment = self.figment.merge(Toml::file(path));
        }
        self
    }

    /// Merges configuration from the distribution's environment variables.
    ///
    /// - `OTEL_DISTRO_COLLECTOR_BASE_URL` → `collector_base_url`
    /// - `OTEL_DISTRO_DEBUG=true` → `debug`
    /// - `OTEL_DISTRO_DEBUG_PRINT_SPANS=true` → `debug_print_spans`
    /// - `OTEL_DISTRO_FLUSH_ON_SIGTERM_SIGINT=true` → `flush_on_signals`
    /// - `OTEL_DISTRO_FLUSH_ON_EMPTY_EVENT_LOOP=false` → `flush_on_empty_event_loop`
    /// - `OTEL_DISTRO_AUTOMATIC_SERVICE_NAME=false` → `automatic_service_name`
    /// - `OTEL_DISTRO_BOOTSTRAP_SPAN` → `bootstrap_span`
    /// - `OTEL_METRIC_EXPORT_INTERVAL` / `OTEL_METRIC_EXPORT_TIMEOUT`
    ///   (milliseconds) → metric reader timings
    pub fn with_env(mut self) -> Self {
        if let Some(url) = environment::value(environment::COLLECTOR_BASE_URL) {
            self.figment = self
                .figment
                .merge(Serialized::default("collector_base_url", url));
        }

        if environment::has_opted_in(environment::DEBUG) {
            self.figment = self.figment.merge(Serialized::default("debug", true));
        }

        if environment::has_opted_in(environment::DEBUG_PRINT_SPANS) {
            self.figment = self
                .figment
                .merge(Serialized::default("debug_print_spans", true));
        }

        if environment::has_opted_in(environment::FLUSH_ON_SIGTERM_SIGINT) {
            self.figment = self
                .figment
                .merge(Serialized::default("flush_on_signals", true));
        }

        if environment::has_opted_out(environment::FLUSH_ON_EMPTY_EVENT_LOOP) {
            self.figment = self
                .figment
                .merge(Serialized::default("flush_on_empty_event_loop", false));
        }

        if environment::has_opted_out(environment::AUTOMATIC_SERVICE_NAME) {
            self.figment = self
                .figment
                .merge(Serialized::default("automatic_service_name", false));
        }

        if let Some(name) = environment::value(environment::BOOTSTRAP_SPAN) {
            self.figment = self
                .figment
                .merge(Serialized::default("bootstrap_span", name));
        }

        let defaults = DistroConfig::default();
        for (var, key, default) in [
            (
                environment::OTEL_METRIC_EXPORT_INTERVAL,
                "metric_export_interval",
                defaults.metric_export_interval,
            ),
            (
                environment::OTEL_METRIC_EXPORT_TIMEOUT,
                "metric_export_timeout",
                defaults.metric_export_timeout,
            ),
        ] {
            if environment::non_blank(var) {
                let millis = environment::parse_numeric_with_default(var, millis(default));
                self.figment = self
                    .figment
                    .merge(Serialized::default(key, format!("{millis}ms")));
            }
        }

        self
    }

    /// Sets the collector base URL.
    ///
    /// `/v1/traces`, `/v1/metrics` and `/v1/logs` are appended per signal.
    pub fn collector_base_url(mut self, url: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("collector_base_url", url.into()));
        self
    }

    /// Enables or disables flushing on SIGTERM and SIGINT.
    ///
    /// Default: disabled
    pub fn flush_on_signals(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("flush_on_signals", enabled));
        self
    }

    /// Enables or disables flushing when the application runs out of work.
    ///
    /// Default: enabled
    pub fn flush_on_empty_event_loop(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("flush_on_empty_event_loop", enabled));
        self
    }

    /// Enables or disables the package manifest service name fallback.
    ///
    /// Default: enabled
    pub fn automatic_service_name(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("automatic_service_name", enabled));
        self
    }

    /// Also prints every finished span to stdout.
    ///
    /// Default: disabled
    pub fn debug_print_spans(mut self, enabled: bool) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("debug_print_spans", enabled));
        self
    }

    /// Sets the upper bound on the exit flush.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.figment = self.figment.merge(Serialized::default(
            "shutdown_timeout",
            format!("{}ms", millis(timeout)),
        ));
        self
    }

    /// Emits a root span with this name once the SDK is running.
    pub fn bootstrap_span(mut self, name: impl Into<String>) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("bootstrap_span", name.into()));
        self
    }

    /// Disables automatic tracing subscriber initialisation.
    ///
    /// By default, the SDK sets up a `tracing-subscriber` with
    /// `tracing-opentelemetry` and `opentelemetry-appender-tracing` integration.
    /// Disable this if you want to configure the subscriber yourself.
    pub fn without_tracing_subscriber(mut self) -> Self {
        self.figment = self
            .figment
            .merge(Serialized::default("init_tracing_subscriber", false));
        self
    }

    /// Extracts the configuration for inspection or debugging.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration extraction fails or if the collector
    /// base URL is invalid.
    pub fn extract_config(&self) -> Result<DistroConfig, DistroError> {
        let config: DistroConfig = self
            .figment
            .extract()
            .map_err(|e| DistroError::Config(Box::new(e)))?;

        let url = &config.collector_base_url;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(DistroError::InvalidEndpoint { url: url.clone() });
        }

        Ok(config)
    }

    /// Detects the resource and starts the SDK.
    ///
    /// Returns a [`DistroGuard`] that manages provider lifecycle. Must be
    /// called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration extraction fails
    /// - Exporter initialisation fails
    /// - Tracing subscriber initialisation fails
    /// - An exit signal handler cannot be installed
    pub async fn build(self) -> Result<DistroGuard, DistroError> {
        let config = self.extract_config()?;

        let service_name = config
            .automatic_service_name
            .then(|| ServiceNameFallbackDetector::new().ignoring_opt_out_env());
        let resource = detect_resource(&PodUidDetector::new(), &service_name).await;

        DistroGuard::from_config(config, resource)
    }
}

impl Default for DistroBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
