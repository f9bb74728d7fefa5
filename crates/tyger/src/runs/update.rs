//! Run cancellation.
//!
//! Cancellation flips the database state first, then makes a best-effort
//! pass at killing every labeled backend object. A kill failure is logged
//! and left to the sweeper; the database transition stands either way.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{ExecutionBackend, LabelSelector};
use crate::error::Result;
use crate::shutdown::Cancellation;
use crate::store::MetadataStore;
use crate::types::{Run, RunStatus};

use super::RunHost;

pub const CANCELED_BY_USER: &str = "Canceled by user";

pub struct RunUpdater {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn ExecutionBackend>,
    host: Arc<dyn RunHost>,
}

impl RunUpdater {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn ExecutionBackend>,
        host: Arc<dyn RunHost>,
    ) -> Self {
        Self {
            store,
            backend,
            host,
        }
    }

    /// Cancel a run. Terminal runs are returned unchanged.
    pub fn cancel_run(&self, id: i64, cancel: &Cancellation) -> Result<Run> {
        cancel.check()?;
        let run = self.store.get_run(id)?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        let updated = self
            .store
            .update_run_status(id, RunStatus::Canceled, Some(CANCELED_BY_USER))?;
        info!(run = id, "run canceled");

        // Sidecars flush on the tombstone before their containers die.
        if let Err(e) = self.host.write_tombstone(id) {
            warn!(run = id, error = %e, "failed to write tombstone");
        }

        match self.backend.list_containers(&LabelSelector::run(id)) {
            Ok(states) => {
                for state in states {
                    if let Err(e) = self.backend.kill_container(&state.id) {
                        warn!(run = id, container = %state.id, error = %e,
                              "failed to kill container");
                    }
                }
            }
            Err(e) => warn!(run = id, error = %e, "failed to list containers for kill"),
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::backend::{ContainerPhase, ContainerState};
    use crate::error::Error;
    use crate::store::memory::MemoryStore;
    use crate::types::{CodespecRef, JobRunSpec, NewRun, RunKind};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TombstoneHost {
        tombstones: Mutex<Vec<i64>>,
    }

    impl RunHost for TombstoneHost {
        fn materialize(
            &self,
            _run: &Run,
            _job: &crate::types::JobCodespec,
            _worker: Option<&crate::types::WorkerCodespec>,
            _bindings: &[super::super::topology::BufferBinding],
        ) -> Result<()> {
            Ok(())
        }

        fn initial_status(&self) -> RunStatus {
            RunStatus::Running
        }

        fn publish_access_urls(
            &self,
            _run_id: i64,
            _urls: &BTreeMap<String, String>,
        ) -> Result<()> {
            Ok(())
        }

        fn write_tombstone(&self, run_id: i64) -> Result<()> {
            self.tombstones.lock().unwrap().push(run_id);
            Ok(())
        }

        fn remove_run_objects(&self, _run_id: i64) -> Result<()> {
            Ok(())
        }
    }

    fn new_run() -> NewRun {
        NewRun {
            kind: RunKind::User,
            job: JobRunSpec {
                codespec: CodespecRef::parse("sleep/versions/1").unwrap(),
                buffers: BTreeMap::new(),
                tags: None,
                replicas: 1,
            },
            worker: None,
            cluster: None,
            timeout_secs: None,
        }
    }

    fn running_container(run_id: i64) -> ContainerState {
        let mut labels = BTreeMap::new();
        labels.insert("tyger-run".to_string(), run_id.to_string());
        ContainerState {
            id: format!("cid-{}", run_id),
            name: "main".to_string(),
            labels,
            phase: ContainerPhase::Running,
        }
    }

    #[test]
    fn cancel_flips_status_and_kills_containers() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let host = Arc::new(TombstoneHost::default());
        let run = store.create_run(&new_run()).unwrap();
        store
            .update_run_status(run.id, RunStatus::Running, None)
            .unwrap();
        backend.push_container(running_container(run.id));

        let updater = RunUpdater::new(store.clone(), backend.clone(), host.clone());
        let canceled = updater.cancel_run(run.id, &Cancellation::new()).unwrap();

        assert_eq!(canceled.status, RunStatus::Canceled);
        assert_eq!(canceled.status_reason.as_deref(), Some(CANCELED_BY_USER));
        assert_eq!(
            *backend.killed.lock().unwrap(),
            vec![format!("cid-{}", run.id)]
        );
        assert_eq!(*host.tombstones.lock().unwrap(), vec![run.id]);
    }

    #[test]
    fn cancel_is_idempotent_for_terminal_runs() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let host = Arc::new(TombstoneHost::default());
        let run = store.create_run(&new_run()).unwrap();
        store
            .update_run_status(run.id, RunStatus::Succeeded, None)
            .unwrap();

        let updater = RunUpdater::new(store, backend.clone(), host);
        let unchanged = updater.cancel_run(run.id, &Cancellation::new()).unwrap();
        assert_eq!(unchanged.status, RunStatus::Succeeded);
        assert!(backend.killed.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_unknown_run_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::new());
        let host = Arc::new(TombstoneHost::default());
        let updater = RunUpdater::new(store, backend, host);
        assert!(matches!(
            updater.cancel_run(404, &Cancellation::new()),
            Err(Error::NotFound(_))
        ));
    }
}
