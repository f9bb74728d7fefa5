//! Metadata store abstraction.
//!
//! The store is the authority for codespecs, buffers, runs, and storage
//! accounts. Two implementations exist: [`postgres::PostgresStore`] for
//! deployments and [`memory::MemoryStore`] for tests and single-process
//! tooling. Both enforce the same semantics:
//!
//! - codespec versions are assigned monotonically per name and never mutated;
//! - buffer mutations are guarded by ETag preconditions;
//! - run status transitions never regress out of a terminal state.

pub mod memory;
pub mod migrations;
pub mod postgres;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Buffer, BufferFilter, BufferPage, Codespec, CodespecDetails, NewRun, Run, RunStatus,
    StorageAccount,
};

/// Secret-refresh tracking row for an active run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSecretRecord {
    pub run_id: i64,
    /// When the refresher should rebuild the run's access URLs.
    pub refresh_due_at: DateTime<Utc>,
    /// When the currently published access URLs expire.
    pub expires_at: DateTime<Utc>,
}

/// Mint a fresh opaque ETag. Regenerated on every buffer mutation.
pub(crate) fn new_etag() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Transactional CRUD over the control-plane data model.
///
/// Every method is safe to call from any thread; implementations serialize
/// writes per row. Methods that mutate buffers take an optional expected
/// ETag and fail with `PreconditionFailed` on mismatch.
pub trait MetadataStore: Send + Sync {
    // -- codespecs ---------------------------------------------------------

    /// Store a codespec body under `name`, assigning the next version.
    fn create_codespec(&self, name: &str, details: &CodespecDetails) -> Result<Codespec>;

    /// Fetch a codespec by name. `version = None` resolves the latest.
    fn get_codespec(&self, name: &str, version: Option<i32>) -> Result<Codespec>;

    /// List the latest version of each codespec, ordered by name, optionally
    /// restricted to a name prefix.
    fn list_codespecs(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<Codespec>>;

    // -- buffers -----------------------------------------------------------

    /// Persist a new buffer row. The id must not already exist.
    fn create_buffer(&self, buffer: &Buffer) -> Result<Buffer>;

    /// Fetch a buffer regardless of its soft-delete state.
    fn get_buffer(&self, id: &str) -> Result<Buffer>;

    /// Replace a buffer's tag map.
    fn update_buffer_tags(
        &self,
        id: &str,
        etag: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> Result<Buffer>;

    /// Flip a buffer to soft-deleted with the given expiration.
    fn soft_delete_buffer(
        &self,
        id: &str,
        etag: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<Buffer>;

    /// Clear the soft-delete flag and assign a fresh active expiration.
    fn restore_buffer(
        &self,
        id: &str,
        etag: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Buffer>;

    /// Remove buffer rows outright. Returns the ids that existed.
    fn delete_buffer_rows(&self, ids: &[String]) -> Result<Vec<String>>;

    /// Page through buffers matching `filter`, newest first, using a
    /// `(created_at, id)` keyset continuation.
    fn list_buffers(
        &self,
        filter: &BufferFilter,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<BufferPage>;

    /// Count buffers matching `filter`.
    fn count_buffers(&self, filter: &BufferFilter) -> Result<u64>;

    /// Ids of soft-deleted buffers whose expiration is in the past,
    /// hard-delete candidates for the deleter.
    fn list_hard_delete_candidates(&self, now: DateTime<Utc>, limit: usize)
    -> Result<Vec<String>>;

    /// Atomically flip active, expired buffers to soft-deleted with the
    /// given soft-delete expiration. Returns how many were flipped.
    fn soft_delete_expired_buffers(
        &self,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64>;

    // -- storage accounts --------------------------------------------------

    /// Register a storage account, or return the existing record for its
    /// name. Ids are stable once assigned.
    fn ensure_storage_account(
        &self,
        name: &str,
        location: &str,
        endpoint: &str,
    ) -> Result<StorageAccount>;

    fn list_storage_accounts(&self) -> Result<Vec<StorageAccount>>;

    // -- runs --------------------------------------------------------------

    /// Persist a new run in `Pending` with `resources_created = false`,
    /// assigning the next monotonic id.
    fn create_run(&self, new_run: &NewRun) -> Result<Run>;

    fn get_run(&self, id: i64) -> Result<Run>;

    /// List runs with id greater than `since_id`, oldest first, optionally
    /// filtered by status.
    fn list_runs(&self, since_id: i64, limit: usize, status: Option<RunStatus>)
    -> Result<Vec<Run>>;

    /// Conditionally transition a run's status. Transitions out of a
    /// terminal state are ignored; the stored run is returned either way.
    /// Stamps `running_at` on the first transition to `Running` and
    /// `finished_at` on the transition into a terminal state.
    fn update_run_status(
        &self,
        id: i64,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<Run>;

    /// Record that backend objects were created for the run.
    fn mark_resources_created(&self, id: i64) -> Result<()>;

    /// Record the log-archival timestamp. The run must be terminal.
    fn mark_logs_archived(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Flip `is_final`. The run must be terminal.
    fn finalize_run(&self, id: i64) -> Result<()>;

    /// Remove a run row (used only for never-scheduled runs).
    fn delete_run(&self, id: i64) -> Result<()>;

    /// Runs that never created backend resources and were created before
    /// `created_before`.
    fn list_never_scheduled_runs(&self, created_before: DateTime<Utc>) -> Result<Vec<Run>>;

    /// Runs not yet finalized, oldest first.
    fn list_unfinalized_runs(&self, limit: usize) -> Result<Vec<Run>>;

    /// Run counts grouped by status.
    fn get_run_counts(&self) -> Result<BTreeMap<RunStatus, u64>>;

    // -- run secret tracking ----------------------------------------------

    /// Record (or replace) the refresh schedule for a run's access URLs.
    fn upsert_run_secret(&self, record: &RunSecretRecord) -> Result<()>;

    /// Secret rows whose refresh is due.
    fn list_due_run_secrets(&self, now: DateTime<Utc>) -> Result<Vec<RunSecretRecord>>;

    fn delete_run_secret(&self, run_id: i64) -> Result<()>;
}
