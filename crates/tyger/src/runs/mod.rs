//! Run orchestration.
//!
//! The run engine is backend-polymorphic: [`crate::backend::ExecutionBackend`]
//! covers the container capability surface shared by both backends, and
//! [`RunHost`] covers the per-backend topology operations (materializing a
//! run's objects, publishing refreshed access URLs, reclaiming everything).

pub mod create;
pub mod host;
pub mod read;
pub mod secrets;
pub mod sweeper;
pub mod topology;
pub mod update;

use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{JobCodespec, Run, RunStatus, WorkerCodespec};

use topology::BufferBinding;

/// Backend-specific topology operations for one run.
pub trait RunHost: Send + Sync {
    /// Create every backend object of the run: main containers, buffer
    /// sidecars, worker sets, and the secret material sidecars read.
    fn materialize(
        &self,
        run: &Run,
        job: &JobCodespec,
        worker: Option<&WorkerCodespec>,
        bindings: &[BufferBinding],
    ) -> Result<()>;

    /// Status a freshly materialized run reports to the caller.
    fn initial_status(&self) -> RunStatus;

    /// Replace the run's published access URLs in place. Keys are buffer
    /// parameter names.
    fn publish_access_urls(&self, run_id: i64, urls: &BTreeMap<String, String>) -> Result<()>;

    /// Signal sidecars that the run is over.
    fn write_tombstone(&self, run_id: i64) -> Result<()>;

    /// Delete every backend object bearing the run label, plus any
    /// filesystem state.
    fn remove_run_objects(&self, run_id: i64) -> Result<()>;
}
