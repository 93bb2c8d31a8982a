//! Configuration for the distribution.
//!
//! [`DistroConfig`] is deserialised through figment, so it can be layered
//! from compiled defaults, environment variables and programmatic overrides.

use crate::shutdown::DEFAULT_SHUTDOWN_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Collector address used when none is configured.
pub const DEFAULT_COLLECTOR_BASE_URL: &str = "http://localhost:4318";

/// Complete distribution configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistroConfig {
    /// Base URL of the OTLP/HTTP collector. Signal paths are appended to it.
    pub collector_base_url: String,

    /// Lowers the default log filter to `debug` when `RUST_LOG` is unset.
    pub debug: bool,

    /// Also export spans to stdout, next to the collector.
    pub debug_print_spans: bool,

    /// Flush telemetry on SIGTERM and SIGINT.
    pub flush_on_signals: bool,

    /// Flush telemetry when the application reports it has no work left.
    pub flush_on_empty_event_loop: bool,

    /// Derive `service.name` from the package manifest when unset.
    pub automatic_service_name: bool,

    /// Interval between metric exports.
    #[serde(with = "humantime_serde")]
    pub metric_export_interval: Duration,

    /// Maximum time a single metric export may take.
    #[serde(with = "humantime_serde")]
    pub metric_export_timeout: Duration,

    /// Upper bound on the flush performed at process exit.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Name of a root span emitted once the SDK is running.
    pub bootstrap_span: Option<String>,

    /// Whether to initialise the tracing subscriber.
    pub init_tracing_subscriber: bool,
}

impl Default for DistroConfig {
    fn default() -> Self {
        Self {
            collector_base_url: DEFAULT_COLLECTOR_BASE_URL.to_string(),
            debug: false,
            debug_print_spans: false,
            flush_on_signals: false,
            flush_on_empty_event_loop: true,
            automatic_service_name: true,
            metric_export_interval: Duration::from_secs(60),
            metric_export_timeout: Duration::from_secs(30),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            bootstrap_span: None,
            init_tracing_subscriber: true,
        }
    }
}

impl DistroConfig {
    /// Returns the endpoint URL for a specific signal type.
    #[must_use]
    pub fn signal_endpoint(&self, signal_path: &str) -> String {
        let base = self.collector_base_url.trim_end_matches('/');
        format!("{base}{signal_path}")
    }

    /// Default directive for the log filter.
    #[must_use]
    pub fn default_log_level(&self) -> &'static str {
        if self.debug { "debug" } else { "info" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DistroConfig::default();
        assert_eq!(config.collector_base_url, "http://localhost:4318");
        assert!(!config.flush_on_signals);
        assert!(config.flush_on_empty_event_loop);
        assert!(config.automatic_service_name);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(500));
        assert_eq!(config.metric_export_interval, Duration::from_secs(60));
        assert_eq!(config.metric_export_timeout, Duration::from_secs(30));
        assert!(config.bootstrap_span.is_none());
        assert!(!config.debug_print_spans);
    }

    #[test]
    fn signal_endpoint_appends_path() {
        let config = DistroConfig::default();
        assert_eq!(
            config.signal_endpoint("/v1/traces"),
            "http://localhost:4318/v1/traces"
        );
    }

    #[test]
    fn signal_endpoint_strips_trailing_slash_before_appending() {
        let config = DistroConfig {
            collector_base_url: "http://collector:4318/".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.signal_endpoint("/v1/metrics"),
            "http://collector:4318/v1/metrics"
        );
    }

    #[test]
    fn debug_lowers_log_level() {
        let config = DistroConfig {
            debug: true,
            ..Default::default()
        };
        assert_eq!(config.default_log_level(), "debug");
        assert_eq!(DistroConfig::default().default_log_level(), "info");
    }

    #[test]
    fn durations_accept_humantime_strings() {
        let config: DistroConfig = figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(DistroConfig::default()))
            .merge(figment::providers::Serialized::default("shutdown_timeout", "2s"))
            .extract()
            .unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
    }
}
