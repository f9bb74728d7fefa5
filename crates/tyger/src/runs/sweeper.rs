//! Run sweeping: orphan cleanup, terminal reconciliation, log archival,
//! and finalization.
//!
//! Every 30 seconds the sweeper makes four passes:
//!
//! 1. runs that never created backend resources and have outlived the grace
//!    interval are reaped outright;
//! 2. backend container groups that have fully exited are reconciled into
//!    the database, and groups whose run row no longer exists are deleted
//!    unconditionally;
//! 3. terminal runs without archived logs get their merged log stream
//!    uploaded as a gzip artifact;
//! 4. terminal runs whose logs have aged past the grace period are flipped
//!    to final and their backend objects reclaimed.
//!
//! Any backend deletion error is logged; the next tick retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::Utc;
use tracing::{info, warn};

use crate::backend::{ContainerPhase, ContainerState, ExecutionBackend, LabelSelector, LogRequest};
use crate::config::RunsConfig;
use crate::error::{Error, Result};
use crate::logs::{LogArchive, NamedLogSource, archive_run_logs};
use crate::shutdown::Cancellation;
use crate::store::MetadataStore;
use crate::types::Run;

use super::RunHost;
use super::read::{expected_container_count, resolve_status};

const UNFINALIZED_PAGE: usize = 200;

pub struct RunSweeper {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn ExecutionBackend>,
    host: Arc<dyn RunHost>,
    archive: Arc<dyn LogArchive>,
    config: RunsConfig,
}

impl RunSweeper {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn ExecutionBackend>,
        host: Arc<dyn RunHost>,
        archive: Arc<dyn LogArchive>,
        config: RunsConfig,
    ) -> Self {
        Self {
            store,
            backend,
            host,
            archive,
            config,
        }
    }

    /// One sweep tick.
    pub fn run_once(&self, cancel: &Cancellation) {
        if let Err(e) = self.reap_never_scheduled(cancel) {
            warn!(error = %e, "never-scheduled pass failed");
        }
        if let Err(e) = self.reconcile_terminal_groups(cancel) {
            warn!(error = %e, "reconciliation pass failed");
        }
        if let Err(e) = self.archive_terminal_logs(cancel) {
            warn!(error = %e, "log archival pass failed");
        }
        if let Err(e) = self.finalize_archived_runs(cancel) {
            warn!(error = %e, "finalization pass failed");
        }
    }

    /// Pass 1: runs that never created resources.
    fn reap_never_scheduled(&self, cancel: &Cancellation) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.orphan_grace).unwrap_or_default();
        for run in self.store.list_never_scheduled_runs(cutoff)? {
            cancel.check()?;
            if let Err(e) = self.host.remove_run_objects(run.id) {
                warn!(run = run.id, error = %e, "failed to remove partial objects");
                continue;
            }
            self.store.delete_run(run.id)?;
            info!(run = run.id, "reaped never-scheduled run");
        }
        Ok(())
    }

    /// Pass 2: exited container groups and orphaned objects.
    fn reconcile_terminal_groups(&self, cancel: &Cancellation) -> Result<()> {
        let states = self.backend.list_containers(&LabelSelector::any_run())?;
        let mut groups: BTreeMap<i64, Vec<ContainerState>> = BTreeMap::new();
        for state in states {
            if let Some(run_id) = state.run_id() {
                groups.entry(run_id).or_default().push(state);
            }
        }

        for (run_id, group) in groups {
            cancel.check()?;
            let run = match self.store.get_run(run_id) {
                Ok(run) => run,
                Err(Error::NotFound(_)) => {
                    // Objects with no run row are deleted unconditionally.
                    warn!(run = run_id, "removing orphaned backend objects");
                    if let Err(e) = self.host.remove_run_objects(run_id) {
                        warn!(run = run_id, error = %e, "orphan removal failed");
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };
            if run.status.is_terminal() {
                continue;
            }

            let all_exited = group
                .iter()
                .all(|s| matches!(s.phase, ContainerPhase::Exited { .. }));
            if !all_exited {
                continue;
            }
            let (status, reason) =
                resolve_status(expected_container_count(&run), &group, run.status);
            if status.is_terminal() {
                self.store
                    .update_run_status(run_id, status, reason.as_deref())?;
                info!(run = run_id, status = %status, "reconciled exited run");
            }
        }
        Ok(())
    }

    /// Pass 3: archive logs of terminal runs.
    fn archive_terminal_logs(&self, cancel: &Cancellation) -> Result<()> {
        for run in self.store.list_unfinalized_runs(UNFINALIZED_PAGE)? {
            cancel.check()?;
            if !run.status.is_terminal() || run.logs_archived_at.is_some() {
                continue;
            }
            match self.collect_sources(&run) {
                Ok(sources) => {
                    if let Err(e) = archive_run_logs(self.archive.as_ref(), run.id, sources) {
                        warn!(run = run.id, error = %e, "log archival failed");
                        continue;
                    }
                    self.store.mark_logs_archived(run.id, Utc::now())?;
                    info!(run = run.id, "archived run logs");
                }
                Err(e) => warn!(run = run.id, error = %e, "failed to open log sources"),
            }
        }
        Ok(())
    }

    fn collect_sources(&self, run: &Run) -> Result<Vec<NamedLogSource>> {
        let states = self.backend.list_containers(&LabelSelector::run(run.id))?;
        let mut sources = Vec::new();
        for state in states {
            let container_name = state.role().unwrap_or(state.name.as_str()).to_string();
            let request = LogRequest {
                follow: false,
                ..Default::default()
            };
            match self
                .backend
                .get_container_logs(&state.id, &container_name, &request)
            {
                Ok(mut streams) => sources.append(&mut streams),
                Err(e) => warn!(
                    run = run.id,
                    container = %state.id,
                    error = %e,
                    "failed to open container logs"
                ),
            }
        }
        Ok(sources)
    }

    /// Pass 4: flip archived terminal runs to final and reclaim objects.
    fn finalize_archived_runs(&self, cancel: &Cancellation) -> Result<()> {
        let grace = chrono::Duration::from_std(self.config.finalize_grace).unwrap_or_default();
        let cutoff = Utc::now() - grace;
        for run in self.store.list_unfinalized_runs(UNFINALIZED_PAGE)? {
            cancel.check()?;
            if !run.status.is_terminal() {
                continue;
            }
            let Some(archived_at) = run.logs_archived_at else {
                continue;
            };
            if archived_at > cutoff {
                continue;
            }
            if let Err(e) = self.host.remove_run_objects(run.id) {
                warn!(run = run.id, error = %e, "failed to reclaim backend objects");
                continue;
            }
            self.store.delete_run_secret(run.id)?;
            self.store.finalize_run(run.id)?;
            info!(run = run.id, "finalized run");
        }
        Ok(())
    }

    pub fn spawn(self: Arc<Self>, cancel: Cancellation) -> JoinHandle<()> {
        std::thread::spawn(move || {
            loop {
                self.run_once(&cancel);
                if !cancel.sleep(self.config.sweep_interval) {
                    return;
                }
            }
        })
    }
}
