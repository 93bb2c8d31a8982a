//! Environment-aware resource detection and graceful shutdown for an
//! OpenTelemetry distribution.
//!
//! Detects where the process runs (Kubernetes pod UID from the cgroup
//! filesystem, service name and version from the application's
//! `package.json`), wires the SDK to an OTLP/HTTP collector, and makes sure
//! buffered telemetry is flushed exactly once when the process goes away.
//!
//! # Example
//!
//! ```no_run
//! use opentelemetry_distro::{DistroBuilder, DistroError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), DistroError> {
//!     let guard = DistroBuilder::new()
//!         .with_env()
//!         .flush_on_signals(true)
//!         .build()
//!         .await?;
//!
//!     tracing::info!("Application running");
//!
//!     guard.before_exit().await;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod builder;
mod config;
pub mod environment;
mod error;
pub mod fs;
mod guard;
pub mod kubernetes;
pub mod manifest;
pub mod resource;
pub mod service_name;
pub mod shutdown;

pub use builder::DistroBuilder;
pub use config::{DEFAULT_COLLECTOR_BASE_URL, DistroConfig};
pub use error::DistroError;
pub use guard::DistroGuard;
pub use kubernetes::{PodUid, PodUidDetection, PodUidDetector, PodUidSource};
pub use manifest::{ManifestResolver, PackageManifest};
pub use resource::{AsyncResourceDetector, DistroResourceDetector, detect_resource};
pub use service_name::ServiceNameFallbackDetector;
pub use shutdown::{
    DEFAULT_SHUTDOWN_TIMEOUT, ExitHooks, ExitSignal, ShutdownOrchestrator, ShutdownOutcome,
    ShutdownTrigger,
};

/// Re-exported for version compatibility with this crate's dependencies.
pub use opentelemetry;
/// Re-exported for version compatibility with this crate's dependencies.
pub use opentelemetry_sdk;
/// Re-exported for version compatibility with this crate's dependencies.
pub use tracing;

/// Re-exported for users who want to construct custom configuration providers.
pub use figment;
