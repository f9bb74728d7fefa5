//! Run status resolution and watch.
//!
//! The reader reconciles the database snapshot with live backend state. A
//! non-final run's status is derived from its containers by the rule table
//! in [`resolve_status`]; the watcher long-polls the backend event stream
//! filtered by the run label and re-resolves on every event, emitting only
//! when the status value changes.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use tracing::warn;

use crate::backend::{ContainerPhase, ContainerState, ExecutionBackend, LabelSelector};
use crate::error::{Error, Result};
use crate::shutdown::Cancellation;
use crate::store::MetadataStore;
use crate::types::{Run, RunStatus};

/// Workers do not gate run completion; only main and its sidecars do.
fn completion_relevant(state: &ContainerState) -> bool {
    state.role() != Some("worker")
}

/// Derive a run status from observed container states.
///
/// | Condition | Status |
/// |---|---|
/// | already canceled | unchanged |
/// | expected count not yet observed | pending |
/// | any container waiting | pending, with the backend's reason |
/// | all exited, any non-zero | failed |
/// | all exited zero | succeeded |
/// | any running | running |
pub fn resolve_status(
    expected: usize,
    states: &[ContainerState],
    current: RunStatus,
) -> (RunStatus, Option<String>) {
    if current == RunStatus::Canceled {
        return (RunStatus::Canceled, None);
    }

    let relevant: Vec<&ContainerState> =
        states.iter().filter(|s| completion_relevant(s)).collect();

    if relevant.len() < expected {
        return (
            RunStatus::Pending,
            Some("waiting for containers to be created".to_string()),
        );
    }

    for state in &relevant {
        if let ContainerPhase::Waiting { reason } = &state.phase {
            let reason = if reason.is_empty() {
                None
            } else {
                Some(format!("{}: {}", state.name, reason))
            };
            return (RunStatus::Pending, reason);
        }
    }

    let all_exited = relevant
        .iter()
        .all(|s| matches!(s.phase, ContainerPhase::Exited { .. }));
    if all_exited && !relevant.is_empty() {
        let failure = relevant.iter().find_map(|s| match s.phase {
            ContainerPhase::Exited { code } if code != 0 => Some((s.name.clone(), code)),
            _ => None,
        });
        return match failure {
            Some((name, code)) => (
                RunStatus::Failed,
                Some(format!("container {} exited with code {}", name, code)),
            ),
            None => (RunStatus::Succeeded, None),
        };
    }

    let any_running = relevant
        .iter()
        .any(|s| matches!(s.phase, ContainerPhase::Running));
    if any_running {
        return (RunStatus::Running, None);
    }

    (RunStatus::Pending, None)
}

/// Containers a run is expected to materialize: one main per job replica
/// plus one sidecar per buffer binding.
pub fn expected_container_count(run: &Run) -> usize {
    run.job.replicas.max(1) as usize + run.job.buffers.len()
}

pub struct RunReader {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn ExecutionBackend>,
}

impl RunReader {
    pub fn new(store: Arc<dyn MetadataStore>, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { store, backend }
    }

    /// The run with its status reconciled against live backend state.
    pub fn get_run(&self, id: i64) -> Result<Run> {
        let run = self.store.get_run(id)?;
        if run.is_final || run.status.is_terminal() {
            return Ok(run);
        }

        let states = self.backend.list_containers(&LabelSelector::run(id))?;
        let (status, reason) = resolve_status(expected_container_count(&run), &states, run.status);
        if status == run.status && reason.as_deref() == run.status_reason.as_deref() {
            return Ok(run);
        }
        self.store.update_run_status(id, status, reason.as_deref())
    }

    /// Long-poll watch: emits the run on every status change, beginning
    /// with an initial snapshot, and closes once the run is terminal.
    pub fn watch(&self, id: i64, cancel: &Cancellation) -> Result<Receiver<Run>> {
        // Surface an unknown id synchronously.
        let _ = self.store.get_run(id)?;

        let (sender, receiver) = std::sync::mpsc::channel();
        let reader = RunReader {
            store: Arc::clone(&self.store),
            backend: Arc::clone(&self.backend),
        };
        let cancel = cancel.clone();

        std::thread::spawn(move || {
            let events = match reader.backend.monitor_events(&LabelSelector::run(id), &cancel) {
                Ok(stream) => Some(stream),
                Err(e) => {
                    warn!(run = id, error = %e, "event stream unavailable; polling only");
                    None
                }
            };

            let mut last_emitted: Option<RunStatus> = None;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let run = match reader.get_run(id) {
                    Ok(run) => run,
                    Err(Error::NotFound(_)) => return,
                    Err(e) => {
                        warn!(run = id, error = %e, "watch resolution failed");
                        if !cancel.sleep(Duration::from_secs(1)) {
                            return;
                        }
                        continue;
                    }
                };

                if last_emitted != Some(run.status) {
                    last_emitted = Some(run.status);
                    let terminal = run.status.is_terminal();
                    if sender.send(run).is_err() || terminal {
                        return;
                    }
                }

                // Wake on the next backend event, with a one-second
                // synthetic tick covering the initial emission and any
                // missed events.
                match &events {
                    Some(stream) => {
                        match stream.receiver.recv_timeout(Duration::from_secs(1)) {
                            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => {
                                if !cancel.sleep(Duration::from_secs(1)) {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        if !cancel.sleep(Duration::from_secs(1)) {
                            return;
                        }
                    }
                }
            }
        });

        Ok(receiver)
    }
}
