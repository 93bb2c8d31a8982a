//! Kubernetes pod UID detection.
//!
//! Whether the process runs in Kubernetes is inferred from the first line of
//! `/etc/hosts`, which the kubelet writes with a fixed marker. This is a
//! heuristic: a hosts file managed some other way inside a pod is missed, and
//! a hand-written hosts file carrying the marker outside Kubernetes is taken
//! at face value.
//!
//! The pod UID is then looked up in two places, in order:
//!
//! 1. `/proc/self/mountinfo` (cgroup v1 hosts), where kubelet volume mounts
//!    contain `/pods/<uid>/`.
//! 2. `/proc/self/cgroup` (cgroup v2 hosts), where the second-to-last path
//!    segment names the pod, either as `pod<uid>` or as a systemd slice such
//!    as `kubepods-pod<uid_with_underscores>.slice`.
//!
//! Nothing is cached; every detection re-reads the files.

use crate::fs::{FileSystem, TokioFs};
use crate::resource::AsyncResourceDetector;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::K8S_POD_UID;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

const ETC_HOSTS: &str = "/etc/hosts";
const PROC_SELF_MOUNTINFO: &str = "/proc/self/mountinfo";
const PROC_SELF_CGROUP: &str = "/proc/self/cgroup";

const KUBERNETES_HOSTS_MARKER: &str = "# Kubernetes-managed hosts file";
const POD_UID_LEN: usize = 36;
const POD_PREFIX: &str = "pod";
const PODS_MOUNT_MARKER: &str = "/pods/";
const CONTAINER_ID_LEN: usize = 64;

static POD_SLICE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z_-]*pod(?<uid>[0-9a-f]{8}[-_][0-9a-f]{4}[-_][0-9a-f]{4}[-_][0-9a-f]{4}[-_][0-9a-f]{12})\.slice$",
    )
    .expect("pod slice pattern is valid")
});

/// Where a pod UID was found, from most to least trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodUidSource {
    /// A `/pods/<uid>` kubelet mount in the mount table.
    MountInfo,
    /// A `pod<uid>` cgroup path segment.
    CgroupPodSegment,
    /// A systemd `...pod<uid>.slice` cgroup path segment.
    CgroupSlice,
    /// The raw cgroup path segment, used when nothing else matched. May not
    /// be a pod UID at all.
    CgroupRawSegment,
}

/// A pod UID together with how it was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodUid {
    value: String,
    source: PodUidSource,
}

impl PodUid {
    /// The UID as it will be reported.
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Which parsing strategy produced the UID.
    pub fn source(&self) -> PodUidSource {
        self.source
    }

    /// True when the UID came from the unverified raw-segment fallback.
    pub fn is_low_confidence(&self) -> bool {
        self.source == PodUidSource::CgroupRawSegment
    }
}

impl fmt::Display for PodUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Result of a pod UID detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodUidDetection {
    /// `/etc/hosts` does not look Kubernetes-managed.
    NotKubernetes,
    /// Running in Kubernetes, but no pod UID could be derived.
    Inconclusive,
    /// The pod UID was found.
    Detected(PodUid),
}

impl PodUidDetection {
    /// The detected UID, if any.
    pub fn pod_uid(&self) -> Option<&PodUid> {
        match self {
            PodUidDetection::Detected(uid) => Some(uid),
            PodUidDetection::NotKubernetes | PodUidDetection::Inconclusive => None,
        }
    }
}

/// Detects `k8s.pod.uid` from kernel-exposed files.
#[derive(Debug, Clone, Default)]
pub struct PodUidDetector<F = TokioFs> {
    fs: F,
}

impl PodUidDetector<TokioFs> {
    /// Creates a detector reading the real filesystem.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<F: FileSystem> PodUidDetector<F> {
    /// Creates a detector on top of the given filesystem.
    pub fn with_fs(fs: F) -> Self {
        Self { fs }
    }

    /// Runs the detection.
    pub async fn detect_pod_uid(&self) -> PodUidDetection {
        if !self.is_kubernetes().await {
            return PodUidDetection::NotKubernetes;
        }

        let pod_uid = match self.read_mountinfo_pod_uid().await {
            Some(uid) => Some(uid),
            None => self.read_cgroup_pod_uid().await,
        };

        match pod_uid {
            Some(uid) => {
                tracing::debug!(
                    target: "otel_distro::kubernetes",
                    pod_uid = %uid,
                    source = ?uid.source(),
                    "detected pod uid"
                );
                PodUidDetection::Detected(uid)
            }
            None => {
                tracing::debug!(
                    target: "otel_distro::kubernetes",
                    "running in Kubernetes but the pod uid could not be derived"
                );
                PodUidDetection::Inconclusive
            }
        }
    }

    async fn is_kubernetes(&self) -> bool {
        let Ok(hosts) = self.fs.read_to_string(Path::new(ETC_HOSTS)).await else {
            return false;
        };
        if hosts.trim().is_empty() {
            return false;
        }
        hosts
            .split('\n')
            .next()
            .is_some_and(|first| first.starts_with(KUBERNETES_HOSTS_MARKER))
    }

    async fn read_mountinfo_pod_uid(&self) -> Option<PodUid> {
        let lines = self
            .candidate_lines(PROC_SELF_MOUNTINFO, POD_UID_LEN)
            .await;
        pod_uid_from_mountinfo(&lines)
    }

    async fn read_cgroup_pod_uid(&self) -> Option<PodUid> {
        let lines = self
            .candidate_lines(PROC_SELF_CGROUP, CONTAINER_ID_LEN)
            .await;
        lines.iter().find_map(|line| pod_uid_from_cgroup_line(line))
    }

    /// Trimmed lines longer than `min_len`; unreadable files yield nothing.
    async fn candidate_lines(&self, path: &str, min_len: usize) -> Vec<String> {
        let Ok(content) = self.fs.read_to_string(Path::new(path)).await else {
            return Vec::new();
        };
        content
            .split('\n')
            .map(str::trim)
            .filter(|line| line.len() > min_len)
            .map(str::to_owned)
            .collect()
    }
}

impl<F: FileSystem> AsyncResourceDetector for PodUidDetector<F> {
    async fn detect(&self) -> Resource {
        let mut builder = Resource::builder_empty();
        if let PodUidDetection::Detected(uid) = self.detect_pod_uid().await {
            builder = builder.with_attributes([KeyValue::new(K8S_POD_UID, uid.value)]);
        }
        builder.build()
    }
}

fn pod_uid_from_mountinfo(lines: &[String]) -> Option<PodUid> {
    let mount = lines
        .iter()
        .find(|line| line.find(PODS_MOUNT_MARKER).is_some_and(|idx| idx > 0))?;
    let (_, after) = mount.split_once(PODS_MOUNT_MARKER)?;
    let after = after.split(PODS_MOUNT_MARKER).next().unwrap_or_default();
    let uid = prefix_chars(after, POD_UID_LEN);
    (!uid.is_empty()).then(|| PodUid {
        value: uid.to_owned(),
        source: PodUidSource::MountInfo,
    })
}

fn pod_uid_from_cgroup_line(line: &str) -> Option<PodUid> {
    let segments: Vec<&str> = line.split('/').collect();
    if segments.len() <= 2 {
        return None;
    }
    let segment = segments[segments.len() - 2];

    let (value, source) = if segment.starts_with(POD_PREFIX)
        && segment.len() == POD_UID_LEN + POD_PREFIX.len()
    {
        (
            segment[POD_PREFIX.len()..].to_owned(),
            PodUidSource::CgroupPodSegment,
        )
    } else if let Some(captures) = POD_SLICE.captures(segment) {
        (captures["uid"].replace('_', "-"), PodUidSource::CgroupSlice)
    } else {
        // Unverified: the segment may be something other than a pod UID.
        (segment.to_owned(), PodUidSource::CgroupRawSegment)
    };

    (!value.is_empty()).then_some(PodUid { value, source })
}

fn prefix_chars(s: &str, n: usize) -> &str {
    s.char_indices().nth(n).map_or(s, |(idx, _)| &s[..idx])
}
