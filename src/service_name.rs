//! Service name fallback from the application's package manifest.
//!
//! When nobody configured a service name, the application's `package.json`
//! name and version are the best guess available. The fallback stays out of
//! the way whenever the user expressed an opinion:
//!
//! - `OTEL_DISTRO_AUTOMATIC_SERVICE_NAME=false` turns it off,
//! - a non-blank `OTEL_SERVICE_NAME` wins,
//! - a non-blank `service.name` in `OTEL_RESOURCE_ATTRIBUTES` wins.
//!
//! Detectors created by [`DistroBuilder`](crate::DistroBuilder) leave the
//! opt-out to `DistroConfig::automatic_service_name`, which already folds in
//! the environment variable and any programmatic override.

use crate::environment;
use crate::fs::{FileSystem, TokioFs};
use crate::manifest::{ManifestResolver, PackageManifest};
use crate::resource::AsyncResourceDetector;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use std::sync::Arc;

/// Detects `service.name` and `service.version` from the package manifest.
pub struct ServiceNameFallbackDetector<F = TokioFs> {
    resolver: Arc<ManifestResolver<F>>,
    honour_opt_out_env: bool,
}

impl ServiceNameFallbackDetector<TokioFs> {
    /// Creates a detector backed by the process-wide manifest resolver.
    pub fn new() -> Self {
        Self::with_resolver(ManifestResolver::global())
    }
}

impl Default for ServiceNameFallbackDetector<TokioFs> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> ServiceNameFallbackDetector<F>
where
    F: FileSystem + Clone + 'static,
{
    /// Creates a detector backed by the given resolver.
    pub fn with_resolver(resolver: Arc<ManifestResolver<F>>) -> Self {
        Self {
            resolver,
            honour_opt_out_env: true,
        }
    }

    /// Stops consulting `OTEL_DISTRO_AUTOMATIC_SERVICE_NAME`; the caller has
    /// already decided the fallback is enabled.
    pub(crate) fn ignoring_opt_out_env(mut self) -> Self {
        self.honour_opt_out_env = false;
        self
    }

    /// Returns the service name and version to report, if the fallback applies.
    pub async fn detect_service(&self) -> Option<(String, String)> {
        if self.is_suppressed() {
            return None;
        }
        let manifest = self.resolver.resolve().await?;
        service_attributes(&manifest)
    }
}

impl<F> AsyncResourceDetector for ServiceNameFallbackDetector<F>
where
    F: FileSystem + Clone + 'static,
{
    async fn detect(&self) -> Resource {
        let mut builder = Resource::builder_empty();
        if let Some((name, version)) = self.detect_service().await {
            builder = builder.with_attributes([
                KeyValue::new(SERVICE_NAME, name),
                KeyValue::new(SERVICE_VERSION, version),
            ]);
        }
        builder.build()
    }
}

impl<F> ServiceNameFallbackDetector<F> {
    fn is_suppressed(&self) -> bool {
        (self.honour_opt_out_env && environment::has_opted_out(environment::AUTOMATIC_SERVICE_NAME))
            || environment::non_blank(environment::OTEL_SERVICE_NAME)
            || environment::resource_attributes_define(SERVICE_NAME)
    }
}

// Name and version are reported together or not at all.
fn service_attributes(manifest: &PackageManifest) -> Option<(String, String)> {
    Some((manifest.name.clone()?, manifest.version.clone()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::MemoryFs;

    const MANIFEST: &str = r#"{ "name": "@example/app-under-test", "version": "2.13.47" }"#;

    const ENV_VARS: [&str; 3] = [
        environment::AUTOMATIC_SERVICE_NAME,
        environment::OTEL_SERVICE_NAME,
        environment::OTEL_RESOURCE_ATTRIBUTES,
    ];

    fn detector_with_manifest(content: &str) -> (ServiceNameFallbackDetector<MemoryFs>, MemoryFs) {
        let fs = MemoryFs::new();
        fs.file("/srv/app/index.js", "")
            .file("/srv/app/package.json", content)
            .dir("/srv/app/node_modules");
        let resolver = ManifestResolver::new(fs.clone()).with_entrypoint("/srv/app/index.js");
        (
            ServiceNameFallbackDetector::with_resolver(Arc::new(resolver)),
            fs,
        )
    }

    fn attribute(resource: &Resource, key: &str) -> Option<String> {
        resource
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|(_, v)| v.to_string())
    }

    /// Runs `f` with all fallback-related variables unset except `overrides`.
    fn with_env<R>(overrides: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let vars: Vec<(&str, Option<&str>)> = ENV_VARS
            .iter()
            .map(|name| {
                let value = overrides.iter().find(|(k, _)| k == name).map(|(_, v)| *v);
                (*name, value)
            })
            .collect();
        temp_env::with_vars(vars, f)
    }

    fn detect(detector: &ServiceNameFallbackDetector<MemoryFs>) -> Resource {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(detector.detect())
    }

    #[test]
    fn reports_name_and_version_from_manifest() {
        let (detector, _) = detector_with_manifest(MANIFEST);
        let resource = with_env(&[], || detect(&detector));

        assert_eq!(resource.len(), 2);
        assert_eq!(
            attribute(&resource, SERVICE_NAME).as_deref(),
            Some("@example/app-under-test")
        );
        assert_eq!(attribute(&resource, SERVICE_VERSION).as_deref(), Some("2.13.47"));
    }

    #[test]
    fn opt_out_suppresses_fallback_without_touching_filesystem() {
        for value in ["false", "FALSE", " False "] {
            let (detector, fs) = detector_with_manifest(MANIFEST);
            let resource = with_env(&[(environment::AUTOMATIC_SERVICE_NAME, value)], || {
                detect(&detector)
            });
            assert!(resource.is_empty(), "opt-out value {value:?}");
            assert!(fs.stats().is_empty());
        }
    }

    #[test]
    fn other_opt_out_values_do_not_suppress() {
        let (detector, _) = detector_with_manifest(MANIFEST);
        let resource = with_env(&[(environment::AUTOMATIC_SERVICE_NAME, "true")], || {
            detect(&detector)
        });
        assert_eq!(resource.len(), 2);
    }

    #[test]
    fn configured_detector_ignores_env_opt_out() {
        let (detector, _) = detector_with_manifest(MANIFEST);
        let detector = detector.ignoring_opt_out_env();
        let resource = with_env(&[(environment::AUTOMATIC_SERVICE_NAME, "false")], || {
            detect(&detector)
        });
        assert_eq!(
            attribute(&resource, SERVICE_NAME).as_deref(),
            Some("@example/app-under-test")
        );
    }

    #[test]
    fn configured_detector_still_yields_to_explicit_service_name() {
        let (detector, _) = detector_with_manifest(MANIFEST);
        let detector = detector.ignoring_opt_out_env();
        let resource = with_env(&[(environment::OTEL_SERVICE_NAME, "checkout")], || {
            detect(&detector)
        });
        assert!(resource.is_empty());
    }

    #[test]
    fn explicit_service_name_suppresses_fallback() {
        let (detector, _) = detector_with_manifest(MANIFEST);
        let resource = with_env(&[(environment::OTEL_SERVICE_NAME, "checkout")], || {
            detect(&detector)
        });
        assert!(resource.is_empty());
    }

    #[test]
    fn blank_service_name_does_not_suppress() {
        let (detector, _) = detector_with_manifest(MANIFEST);
        let resource = with_env(&[(environment::OTEL_SERVICE_NAME, "   ")], || {
            detect(&detector)
        });
        assert_eq!(resource.len(), 2);
    }

    #[test]
    fn service_name_in_resource_attributes_suppresses_fallback() {
        let (detector, _) = detector_with_manifest(MANIFEST);
        let resource = with_env(
            &[(
                environment::OTEL_RESOURCE_ATTRIBUTES,
                "deployment.environment=prod,service.name=\"checkout\"",
            )],
            || detect(&detector),
        );
        assert!(resource.is_empty());
    }

    #[test]
    fn blank_service_name_in_resource_attributes_does_not_suppress() {
        let (detector, _) = detector_with_manifest(MANIFEST);
        let resource = with_env(
            &[(environment::OTEL_RESOURCE_ATTRIBUTES, "service.name=\"\"")],
            || detect(&detector),
        );
        assert_eq!(resource.len(), 2);
    }

    #[test]
    fn manifest_without_version_reports_nothing() {
        let (detector, _) = detector_with_manifest(r#"{ "name": "no-version" }"#);
        let resource = with_env(&[], || detect(&detector));
        assert!(resource.is_empty());
    }

    #[test]
    fn missing_manifest_reports_nothing() {
        let fs = MemoryFs::new();
        fs.file("/srv/app/index.js", "");
        let resolver = ManifestResolver::new(fs).with_entrypoint("/srv/app/index.js");
        let detector = ServiceNameFallbackDetector::with_resolver(Arc::new(resolver));

        let resource = with_env(&[], || detect(&detector));
        assert!(resource.is_empty());
    }
}
