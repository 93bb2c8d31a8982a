//! Resource assembly.
//!
//! This module provides:
//! - [`AsyncResourceDetector`] - contract for detectors that need file I/O
//! - [`DistroResourceDetector`] - attributes describing this distribution
//! - [`detect_resource`] - merges the SDK's detectors with the async ones

use opentelemetry::KeyValue;
use opentelemetry_resource_detectors::{
    HostResourceDetector, OsResourceDetector, ProcessResourceDetector,
};
use opentelemetry_sdk::resource::{Resource, ResourceDetector};
use opentelemetry_semantic_conventions::resource::{
    TELEMETRY_DISTRO_NAME, TELEMETRY_DISTRO_VERSION,
};
use std::future::Future;

/// A resource detector that may suspend on I/O.
///
/// Detection never fails: anything that cannot be determined is left out of
/// the returned resource, which may be empty.
pub trait AsyncResourceDetector: Send + Sync {
    /// Detects the attributes this detector is authoritative for.
    fn detect(&self) -> impl Future<Output = Resource> + Send;
}

/// A disabled detector contributes nothing.
impl<D: AsyncResourceDetector> AsyncResourceDetector for Option<D> {
    async fn detect(&self) -> Resource {
        match self {
            Some(detector) => detector.detect().await,
            None => Resource::builder_empty().build(),
        }
    }
}

/// Reports `telemetry.distro.name` and `telemetry.distro.version`.
pub struct DistroResourceDetector;

impl ResourceDetector for DistroResourceDetector {
    fn detect(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes([
                KeyValue::new(TELEMETRY_DISTRO_NAME, env!("CARGO_PKG_NAME")),
                KeyValue::new(TELEMETRY_DISTRO_VERSION, env!("CARGO_PKG_VERSION")),
            ])
            .build()
    }
}

/// Builds the process resource.
///
/// Starts from the SDK defaults (including `OTEL_SERVICE_NAME` and
/// `OTEL_RESOURCE_ATTRIBUTES`), adds host, OS, process and distribution
/// attributes, then merges the results of the pod UID and service name
/// detectors, which run concurrently. Later sources win on conflicting keys.
pub async fn detect_resource<P, S>(pod_uid: &P, service_name: &S) -> Resource
where
    P: AsyncResourceDetector,
    S: AsyncResourceDetector,
{
    let (pod, service) = tokio::join!(pod_uid.detect(), service_name.detect());

    Resource::builder()
        .with_detector(Box::new(HostResourceDetector::default()))
        .with_detector(Box::new(OsResourceDetector))
        .with_detector(Box::new(ProcessResourceDetector))
        .with_detector(Box::new(DistroResourceDetector))
        .with_attributes(key_values(&pod))
        .with_attributes(key_values(&service))
        .build()
}

fn key_values(resource: &Resource) -> Vec<KeyValue> {
    resource
        .iter()
        .map(|(key, value)| KeyValue::new(key.clone(), value.clone()))
        .collect()
}
