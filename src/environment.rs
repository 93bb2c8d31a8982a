//! Typed access to the environment variables the distribution understands.
//!
//! All functions read the process environment on every call; nothing is
//! cached, so tests can scope variables with `temp_env`.

/// Set to `false` to disable the package manifest service name fallback.
pub const AUTOMATIC_SERVICE_NAME: &str = "OTEL_DISTRO_AUTOMATIC_SERVICE_NAME";
/// Standard OpenTelemetry service name variable.
pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
/// Standard OpenTelemetry resource attributes variable (`k1=v1,k2=v2`).
pub const OTEL_RESOURCE_ATTRIBUTES: &str = "OTEL_RESOURCE_ATTRIBUTES";
/// Base URL of the collector; signal paths are appended to it.
pub const COLLECTOR_BASE_URL: &str = "OTEL_DISTRO_COLLECTOR_BASE_URL";
/// Set to `true` for verbose diagnostics from the distribution itself.
pub const DEBUG: &str = "OTEL_DISTRO_DEBUG";
/// Set to `true` to also print every finished span to stdout.
pub const DEBUG_PRINT_SPANS: &str = "OTEL_DISTRO_DEBUG_PRINT_SPANS";
/// Set to `true` to flush telemetry when receiving SIGTERM or SIGINT.
pub const FLUSH_ON_SIGTERM_SIGINT: &str = "OTEL_DISTRO_FLUSH_ON_SIGTERM_SIGINT";
/// Set to `false` to skip flushing when the application runs out of work.
pub const FLUSH_ON_EMPTY_EVENT_LOOP: &str = "OTEL_DISTRO_FLUSH_ON_EMPTY_EVENT_LOOP";
/// Name of a root span to emit right after startup.
pub const BOOTSTRAP_SPAN: &str = "OTEL_DISTRO_BOOTSTRAP_SPAN";
/// Metric export interval in milliseconds.
pub const OTEL_METRIC_EXPORT_INTERVAL: &str = "OTEL_METRIC_EXPORT_INTERVAL";
/// Metric export timeout in milliseconds.
pub const OTEL_METRIC_EXPORT_TIMEOUT: &str = "OTEL_METRIC_EXPORT_TIMEOUT";

/// Returns true if the variable is set to `true`, ignoring case.
pub fn has_opted_in(name: &str) -> bool {
    std::env::var(name).is_ok_and(|raw| raw.trim().eq_ignore_ascii_case("true"))
}

/// Returns true if the variable is set to `false`, ignoring case.
pub fn has_opted_out(name: &str) -> bool {
    std::env::var(name).is_ok_and(|raw| raw.trim().eq_ignore_ascii_case("false"))
}

/// Returns true if the variable is set to something other than whitespace.
pub fn non_blank(name: &str) -> bool {
    std::env::var(name).is_ok_and(|raw| !raw.trim().is_empty())
}

/// Returns the variable's value if it is set and not blank.
pub fn value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|raw| !raw.trim().is_empty())
}

/// Parses the variable as a base-10 integer, falling back to `default` when
/// it is unset, empty or not a number.
pub fn parse_numeric_with_default(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

/// Returns true if `OTEL_RESOURCE_ATTRIBUTES` carries a non-blank value for
/// `key`.
///
/// Pairs that do not contain exactly one `=` are skipped. One layer of
/// surrounding double quotes is stripped from values, matching how the SDK
/// interprets `key="value"`.
pub fn resource_attributes_define(key: &str) -> bool {
    let Ok(raw) = std::env::var(OTEL_RESOURCE_ATTRIBUTES) else {
        return false;
    };
    raw.split(',').any(|pair| {
        let mut parts = pair.split('=');
        let (Some(k), Some(v), None) = (parts.next(), parts.next(), parts.next()) else {
            return false;
        };
        k.trim() == key && !unquote(v.trim()).trim().is_empty()
    })
}

fn unquote(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}
