//! Execution backend abstraction.
//!
//! A backend owns the container/pod objects of a run and exposes the
//! capability surface the run engine drives: container CRUD by label
//! selector, an event stream, log streams, and a capability probe for
//! feature-dependent admission (GPU resources, worker sets). Two concrete
//! backends exist: [`docker::DockerBackend`] drives a single host's
//! container engine and [`kubernetes::KubernetesBackend`] drives a cluster.

pub mod docker;
pub mod kubernetes;
#[cfg(test)]
pub mod testing;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::logs::NamedLogSource;
use crate::shutdown::Cancellation;

/// Label every run-owned backend object carries.
pub const RUN_LABEL: &str = "tyger-run";
/// Label naming the container's role within the run.
pub const CONTAINER_NAME_LABEL: &str = "tyger-run-container-name";
/// Role name of the main container.
pub const MAIN_CONTAINER_NAME: &str = "main";

/// A label predicate: pairs must match exactly, `None` values assert key
/// presence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub pairs: Vec<(String, Option<String>)>,
}

impl LabelSelector {
    /// All objects of one run.
    pub fn run(run_id: i64) -> Self {
        Self {
            pairs: vec![(RUN_LABEL.to_string(), Some(run_id.to_string()))],
        }
    }

    /// All run-owned objects of any run.
    pub fn any_run() -> Self {
        Self {
            pairs: vec![(RUN_LABEL.to_string(), None)],
        }
    }

    pub fn and(mut self, key: &str, value: &str) -> Self {
        self.pairs.push((key.to_string(), Some(value.to_string())));
        self
    }

    /// Whether a label map satisfies the selector.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.pairs.iter().all(|(key, value)| match value {
            Some(value) => labels.get(key) == Some(value),
            None => labels.contains_key(key),
        })
    }
}

/// A bind mount into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// A container to create.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Entrypoint override.
    pub command: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// uid[:gid] the container process runs as.
    pub user: Option<String>,
    pub gpu: Option<u32>,
}

/// Observed container lifecycle phase, the input to status resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerPhase {
    /// Created but not yet started.
    Created,
    /// Waiting to start, with the backend's reason (image pull, scheduling).
    Waiting { reason: String },
    Running,
    Exited { code: i64 },
    Unknown,
}

/// Snapshot of one backend container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub phase: ContainerPhase,
}

impl ContainerState {
    /// The owning run id, parsed from the run label.
    pub fn run_id(&self) -> Option<i64> {
        self.labels.get(RUN_LABEL).and_then(|v| v.parse().ok())
    }

    /// The container's role name within its run.
    pub fn role(&self) -> Option<&str> {
        self.labels.get(CONTAINER_NAME_LABEL).map(|s| s.as_str())
    }
}

/// One entry of a backend event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    pub run_id: Option<i64>,
    pub object: String,
    pub action: String,
}

/// A live event stream; drops the underlying watcher when dropped.
pub struct EventStream {
    pub receiver: Receiver<BackendEvent>,
}

/// Options for a log stream request.
#[derive(Debug, Clone, Copy)]
pub struct LogRequest {
    pub follow: bool,
    pub tail: Option<u64>,
    pub timestamps: bool,
    pub since: Option<DateTime<Utc>>,
    pub stdout: bool,
    pub stderr: bool,
}

impl Default for LogRequest {
    fn default() -> Self {
        Self {
            follow: false,
            tail: None,
            timestamps: true,
            since: None,
            stdout: true,
            stderr: true,
        }
    }
}

/// Feature probe consulted during admission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCapabilities {
    pub gpu: bool,
    pub workers: bool,
}

/// Host/cluster information.
#[derive(Debug, Clone, Default)]
pub struct SystemInfo {
    pub name: String,
    pub version: String,
    pub gpu: bool,
}

/// The capability surface both backends implement.
pub trait ExecutionBackend: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities;

    fn get_system_info(&self) -> Result<SystemInfo>;

    /// Whether the image is present on the backend host.
    fn image_exists(&self, image: &str) -> Result<bool>;

    fn list_containers(&self, selector: &LabelSelector) -> Result<Vec<ContainerState>>;

    /// Create a container; returns its backend id.
    fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    fn start_container(&self, id: &str) -> Result<()>;

    fn kill_container(&self, id: &str) -> Result<()>;

    fn remove_container(&self, id: &str) -> Result<()>;

    fn inspect_container(&self, id: &str) -> Result<ContainerState>;

    /// Stream lifecycle events for objects matching the selector.
    fn monitor_events(
        &self,
        selector: &LabelSelector,
        cancel: &Cancellation,
    ) -> Result<EventStream>;

    /// Log sources for one container, one per selected channel.
    fn get_container_logs(
        &self,
        id: &str,
        container_name: &str,
        request: &LogRequest,
    ) -> Result<Vec<NamedLogSource>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn run_selector_matches_exact_run() {
        let selector = LabelSelector::run(7);
        assert!(selector.matches(&labels(&[("tyger-run", "7")])));
        assert!(!selector.matches(&labels(&[("tyger-run", "8")])));
        assert!(!selector.matches(&labels(&[])));
    }

    #[test]
    fn any_run_selector_matches_presence() {
        let selector = LabelSelector::any_run();
        assert!(selector.matches(&labels(&[("tyger-run", "7")])));
        assert!(selector.matches(&labels(&[("tyger-run", "99")])));
        assert!(!selector.matches(&labels(&[("other", "x")])));
    }

    #[test]
    fn chained_selector_requires_all_pairs() {
        let selector = LabelSelector::run(7).and(CONTAINER_NAME_LABEL, "main");
        assert!(selector.matches(&labels(&[
            ("tyger-run", "7"),
            ("tyger-run-container-name", "main"),
        ])));
        assert!(!selector.matches(&labels(&[("tyger-run", "7")])));
    }

    #[test]
    fn container_state_exposes_run_id_and_role() {
        let state = ContainerState {
            id: "abc".to_string(),
            name: "tyger-run-7-main".to_string(),
            labels: labels(&[
                ("tyger-run", "7"),
                ("tyger-run-container-name", "main"),
            ]),
            phase: ContainerPhase::Running,
        };
        assert_eq!(state.run_id(), Some(7));
        assert_eq!(state.role(), Some("main"));
    }
}
