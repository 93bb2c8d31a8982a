//! Locating the host application's package manifest.
//!
//! Starting at the process entrypoint, the resolver walks up the directory
//! tree until it finds a `package.json` that belongs to the application. A
//! manifest counts as the application's own when a `node_modules` directory
//! sits next to it, or when the manifest itself lives inside a `node_modules`
//! tree (installed packages are often deduplicated and have no nested
//! `node_modules` of their own).
//!
//! Missing, unreadable and malformed candidates never abort the walk; the
//! resolver moves on to the parent directory instead. The outcome, positive or
//! negative, is computed once and cached, and concurrent callers share a single
//! in-flight search.

use crate::fs::{EntryKind, FileSystem, TokioFs};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

/// File name of the manifest.
pub const MANIFEST_FILE_NAME: &str = "package.json";

/// Directory holding installed dependencies.
pub const DEPENDENCY_DIR_NAME: &str = "node_modules";

/// The subset of `package.json` the distribution cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageManifest {
    /// Package name.
    #[serde(default)]
    pub name: Option<String>,
    /// Package version, taken verbatim.
    #[serde(default)]
    pub version: Option<String>,
}

type Attempt = Shared<BoxFuture<'static, Option<Arc<PackageManifest>>>>;

#[derive(Debug, Clone, Default)]
enum CacheState {
    #[default]
    Unattempted,
    Failed,
    Cached(Arc<PackageManifest>),
}

#[derive(Default)]
struct Inner {
    cache: CacheState,
    in_flight: Option<Attempt>,
}

static GLOBAL: LazyLock<Arc<ManifestResolver<TokioFs>>> =
    LazyLock::new(|| Arc::new(ManifestResolver::new(TokioFs)));

/// Finds and memoises the application's package manifest.
pub struct ManifestResolver<F = TokioFs> {
    fs: F,
    entrypoint: Option<PathBuf>,
    inner: Mutex<Inner>,
}

impl ManifestResolver<TokioFs> {
    /// The process-wide resolver.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }
}

impl<F> ManifestResolver<F>
where
    F: FileSystem + Clone + 'static,
{
    /// Creates a resolver that starts from the process entrypoint.
    ///
    /// The entrypoint is the first program argument (the script a runtime was
    /// asked to run), or the current executable when there is none.
    pub fn new(fs: F) -> Self {
        let entrypoint = std::env::args_os()
            .nth(1)
            .map(PathBuf::from)
            .or_else(|| std::env::current_exe().ok());
        Self {
            fs,
            entrypoint,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Overrides the path the search starts from.
    #[must_use]
    pub fn with_entrypoint(mut self, entrypoint: impl Into<PathBuf>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    /// Returns the application's manifest, if one can be found.
    ///
    /// Only the first call searches the filesystem. Calls arriving while that
    /// search is still running wait for it instead of starting their own.
    pub async fn resolve(&self) -> Option<Arc<PackageManifest>> {
        let attempt = {
            let mut inner = self.lock();
            match (&inner.in_flight, &inner.cache) {
                (Some(attempt), _) => attempt.clone(),
                (None, CacheState::Cached(manifest)) => return Some(Arc::clone(manifest)),
                (None, CacheState::Failed) => return None,
                (None, CacheState::Unattempted) => {
                    let fs = self.fs.clone();
                    let entrypoint = self.entrypoint.clone();
                    let attempt = async move {
                        find_manifest(&fs, entrypoint.as_deref())
                            .await
                            .map(Arc::new)
                    }
                    .boxed()
                    .shared();
                    inner.in_flight = Some(attempt.clone());
                    attempt
                }
            }
        };

        let manifest = attempt.clone().await;
        self.settle(&attempt, manifest.as_ref());
        manifest
    }

    /// Forgets any cached outcome so the next call searches again.
    #[doc(hidden)]
    pub fn reset_for_testing(&self) {
        *self.lock() = Inner::default();
    }

    fn settle(&self, attempt: &Attempt, manifest: Option<&Arc<PackageManifest>>) {
        let mut inner = self.lock();
        // Every waiter gets here; only the first one for this attempt transitions.
        if !inner
            .in_flight
            .as_ref()
            .is_some_and(|current| current.ptr_eq(attempt))
        {
            return;
        }
        inner.in_flight = None;
        inner.cache = match manifest {
            Some(manifest) => CacheState::Cached(Arc::clone(manifest)),
            None => CacheState::Failed,
        };
        tracing::debug!(
            target: "otel_distro::manifest",
            found = manifest.is_some(),
            "package manifest resolution settled"
        );
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn find_manifest<F: FileSystem>(
    fs: &F,
    entrypoint: Option<&Path>,
) -> Option<PackageManifest> {
    let entrypoint = std::path::absolute(entrypoint?).ok()?;
    let mut directory = match fs.entry_kind(&entrypoint).await.ok()? {
        EntryKind::Directory => entrypoint,
        EntryKind::File | EntryKind::Other => entrypoint.parent()?.to_path_buf(),
    };

    loop {
        if let Some(manifest) = check_directory(fs, &directory).await {
            return Some(manifest);
        }
        directory = directory.parent()?.to_path_buf();
    }
}

/// Returns the manifest in `directory` if it is a viable candidate.
async fn check_directory<F: FileSystem>(fs: &F, directory: &Path) -> Option<PackageManifest> {
    let candidate = directory.join(MANIFEST_FILE_NAME);
    if !matches!(fs.entry_kind(&candidate).await, Ok(EntryKind::File)) {
        return None;
    }

    if !is_inside_dependency_tree(directory) {
        let sibling = directory.join(DEPENDENCY_DIR_NAME);
        if !matches!(fs.entry_kind(&sibling).await, Ok(EntryKind::Directory)) {
            return None;
        }
    }

    let content = fs.read_to_string(&candidate).await.ok()?;
    serde_json::from_str(&content).ok()
}

fn is_inside_dependency_tree(directory: &Path) -> bool {
    directory
        .components()
        .any(|component| matches!(component, Component::Normal(name) if name == DEPENDENCY_DIR_NAME))
}
