//! Integration tests running the detectors against real directory trees and
//! the shutdown hooks against real signals.

use opentelemetry_distro::environment;
use opentelemetry_distro::fs::{EntryKind, FileSystem, TokioFs};
use opentelemetry_distro::shutdown::ProcessControl;
use opentelemetry_distro::{
    DistroBuilder, DistroConfig, ExitHooks, ExitSignal, ManifestResolver, PodUidDetection,
    PodUidDetector, PodUidSource, ServiceNameFallbackDetector, ShutdownOrchestrator,
    ShutdownOutcome,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serves absolute paths from under a temporary root.
#[derive(Clone)]
struct RootedFs {
    root: PathBuf,
}

impl RootedFs {
    fn map(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }
}

impl FileSystem for RootedFs {
    async fn read_to_string(&self, path: &Path) -> io::Result<String> {
        TokioFs.read_to_string(&self.map(path)).await
    }

    async fn entry_kind(&self, path: &Path) -> io::Result<EntryKind> {
        TokioFs.entry_kind(&self.map(path)).await
    }
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn mkdir(root: &Path, relative: &str) {
    std::fs::create_dir_all(root.join(relative)).unwrap();
}

#[tokio::test]
async fn manifest_resolver_walks_up_a_real_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "app/package.json", r#"{"name":"real-app","version":"1.4.0"}"#);
    mkdir(root, "app/node_modules");
    write(root, "app/dist/server/main.js", "");

    let resolver = ManifestResolver::new(TokioFs).with_entrypoint(root.join("app/dist/server/main.js"));
    let manifest = resolver.resolve().await.expect("manifest should be found");

    assert_eq!(manifest.name.as_deref(), Some("real-app"));
    assert_eq!(manifest.version.as_deref(), Some("1.4.0"));
}

#[tokio::test]
async fn manifest_resolver_accepts_deduplicated_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "app/package.json", r#"{"name":"outer","version":"0.0.1"}"#);
    write(
        root,
        "app/node_modules/tool/package.json",
        r#"{"name":"tool","version":"3.0.0"}"#,
    );
    write(root, "app/node_modules/tool/bin/cli.js", "");

    let resolver =
        ManifestResolver::new(TokioFs).with_entrypoint(root.join("app/node_modules/tool/bin/cli.js"));
    let manifest = resolver.resolve().await.expect("manifest should be found");

    assert_eq!(manifest.name.as_deref(), Some("tool"));
}

#[tokio::test]
async fn manifest_resolver_skips_unparseable_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "package.json", r#"{"name":"workspace","version":"9.9.9"}"#);
    mkdir(root, "node_modules");
    write(root, "app/package.json", "{ not json");
    mkdir(root, "app/node_modules");
    write(root, "app/index.js", "");

    let resolver = ManifestResolver::new(TokioFs).with_entrypoint(root.join("app/index.js"));
    let manifest = resolver.resolve().await.expect("manifest should be found");

    assert_eq!(manifest.name.as_deref(), Some("workspace"));
}

#[tokio::test]
async fn manifest_resolver_caches_failure() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "app/index.js", "");

    let resolver = ManifestResolver::new(TokioFs).with_entrypoint(root.join("app/index.js"));
    assert!(resolver.resolve().await.is_none());

    // Appearing later does not matter once the negative outcome is cached.
    write(root, "app/package.json", r#"{"name":"late","version":"1.0.0"}"#);
    mkdir(root, "app/node_modules");
    assert!(resolver.resolve().await.is_none());

    resolver.reset_for_testing();
    let manifest = resolver.resolve().await.expect("manifest after reset");
    assert_eq!(manifest.name.as_deref(), Some("late"));
}

#[test]
fn service_name_fallback_reads_real_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "svc/package.json", r#"{"name":"billing","version":"5.2.1"}"#);
    mkdir(root, "svc/node_modules");
    write(root, "svc/index.js", "");

    let resolver = ManifestResolver::new(TokioFs).with_entrypoint(root.join("svc/index.js"));
    let detector = ServiceNameFallbackDetector::with_resolver(Arc::new(resolver));

    let detected = temp_env::with_vars(
        [
            (environment::AUTOMATIC_SERVICE_NAME, None::<&str>),
            (environment::OTEL_SERVICE_NAME, None),
            (environment::OTEL_RESOURCE_ATTRIBUTES, None),
        ],
        || {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap()
                .block_on(detector.detect_service())
        },
    );

    assert_eq!(
        detected,
        Some(("billing".to_string(), "5.2.1".to_string()))
    );
}

#[tokio::test]
async fn pod_uid_detected_from_fabricated_proc_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        root,
        "etc/hosts",
        "# Kubernetes-managed hosts file.\n127.0.0.1\tlocalhost\n",
    );
    write(
        root,
        "proc/self/mountinfo",
        "2080 2070 254:1 /kubelet/pods/702cc0d1-1251-4dd8-8d74-4c40bcee810e/etc-hosts /etc/hosts rw,relatime - ext4 /dev/vda1 rw,discard\n",
    );

    let detector = PodUidDetector::with_fs(RootedFs {
        root: root.to_path_buf(),
    });
    let PodUidDetection::Detected(uid) = detector.detect_pod_uid().await else {
        panic!("pod uid should be detected");
    };

    assert_eq!(uid.as_str(), "702cc0d1-1251-4dd8-8d74-4c40bcee810e");
    assert_eq!(uid.source(), PodUidSource::MountInfo);
}

#[tokio::test]
async fn pod_uid_detected_despite_non_utf8_mount_point() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "etc/hosts", "# Kubernetes-managed hosts file.\n");
    let mut mountinfo = b"2071 2070 254:1 / /mnt/caf\xe9 rw,relatime - ext4 /dev/vda1 rw\n".to_vec();
    mountinfo.extend_from_slice(
        b"2080 2070 254:1 /kubelet/pods/702cc0d1-1251-4dd8-8d74-4c40bcee810e/etc-hosts /etc/hosts rw,relatime - ext4 /dev/vda1 rw,discard\n",
    );
    std::fs::create_dir_all(root.join("proc/self")).unwrap();
    std::fs::write(root.join("proc/self/mountinfo"), mountinfo).unwrap();

    let detector = PodUidDetector::with_fs(RootedFs {
        root: root.to_path_buf(),
    });
    let detection = detector.detect_pod_uid().await;

    assert_eq!(
        detection.pod_uid().map(|uid| uid.as_str()),
        Some("702cc0d1-1251-4dd8-8d74-4c40bcee810e")
    );
}

#[tokio::test]
async fn pod_uid_falls_back_to_cgroup_slice() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "etc/hosts", "# Kubernetes-managed hosts file.\n");
    write(root, "proc/self/mountinfo", "short\n");
    write(
        root,
        "proc/self/cgroup",
        "0::/kubepods.slice/kubepods-podf57400dc_94ce_4806_a52e_d2726f448f15.slice/cri-containerd-44f639a16a22e394061fb35d2138ef9391c2131db9bf5ae742ef4e447e824887.scope\n",
    );

    let detector = PodUidDetector::with_fs(RootedFs {
        root: root.to_path_buf(),
    });
    let detection = detector.detect_pod_uid().await;

    assert_eq!(
        detection.pod_uid().map(|uid| uid.as_str()),
        Some("f57400dc-94ce-4806-a52e-d2726f448f15")
    );
}

#[tokio::test]
async fn outside_kubernetes_is_not_detected() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "etc/hosts", "127.0.0.1 localhost\n");

    let detector = PodUidDetector::with_fs(RootedFs {
        root: root.to_path_buf(),
    });
    assert_eq!(detector.detect_pod_uid().await, PodUidDetection::NotKubernetes);
}

#[derive(Clone, Default)]
struct RecordingProcess {
    redelivered: Arc<Mutex<Vec<ExitSignal>>>,
}

impl ProcessControl for RecordingProcess {
    fn redeliver(&self, signal: ExitSignal) {
        self.redelivered.lock().unwrap().push(signal);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn sigterm_triggers_single_flush_and_redelivery() {
    let flushes = Arc::new(AtomicUsize::new(0));
    let process = RecordingProcess::default();
    let counter = Arc::clone(&flushes);
    let orchestrator = Arc::new(ShutdownOrchestrator::with_process(
        move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        process.clone(),
    ));
    let config = DistroConfig {
        flush_on_signals: true,
        ..Default::default()
    };
    let hooks = ExitHooks::install(Arc::clone(&orchestrator), &config).unwrap();

    nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while process.redelivered.lock().unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "signal was not handled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(flushes.load(Ordering::SeqCst), 1);
    assert_eq!(*process.redelivered.lock().unwrap(), vec![ExitSignal::Terminate]);
    assert_eq!(hooks.before_exit().await, Some(ShutdownOutcome::AlreadyShutDown));
}

#[tokio::test(flavor = "multi_thread")]
async fn builder_starts_and_shuts_down_sdk() {
    let guard = temp_env::async_with_vars(
        [
            (environment::COLLECTOR_BASE_URL, Some("http://127.0.0.1:9")),
            (environment::BOOTSTRAP_SPAN, Some("integration-bootstrap")),
            (environment::FLUSH_ON_SIGTERM_SIGINT, None),
        ],
        async {
            DistroBuilder::new()
                .with_env()
                .without_tracing_subscriber()
                .build()
                .await
        },
    )
    .await
    .expect("sdk should start");

    tokio::task::block_in_place(|| guard.flush());

    let outcome = guard.shutdown().await;
    assert_ne!(outcome, ShutdownOutcome::AlreadyShutDown);
}
