//! In-memory metadata store.
//!
//! Backs tests and single-process tooling with the same semantics as the
//! PostgreSQL store: monotonic codespec versions, ETag preconditions, and
//! terminal-state protection for runs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::types::{
    Buffer, BufferFilter, BufferPage, Codespec, CodespecDetails, NewRun, Run, RunStatus,
    StorageAccount, decode_continuation, encode_continuation,
};

use super::{MetadataStore, RunSecretRecord, new_etag};

#[derive(Default)]
struct Inner {
    /// (name, version) -> codespec, ordered so the latest version per name
    /// is the last entry in the name's range.
    codespecs: BTreeMap<(String, i32), Codespec>,
    buffers: BTreeMap<String, Buffer>,
    accounts: Vec<StorageAccount>,
    next_account_id: i32,
    runs: BTreeMap<i64, Run>,
    next_run_id: i64,
    run_secrets: BTreeMap<i64, RunSecretRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_etag(buffer: &Buffer, expected: Option<&str>) -> Result<()> {
    if let Some(expected) = expected
        && buffer.etag != expected
    {
        return Err(Error::precondition(format!(
            "buffer {} was modified concurrently",
            buffer.id
        )));
    }
    Ok(())
}

/// Apply a conditional status transition in place. Returns whether the run
/// changed. Transitions out of a terminal state are ignored.
pub(crate) fn apply_status_transition(
    run: &mut Run,
    status: RunStatus,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> bool {
    if run.status.is_terminal() {
        return false;
    }
    if run.status == status && run.status_reason.as_deref() == reason {
        return false;
    }
    run.status = status;
    run.status_reason = reason.map(|r| r.to_string());
    if status == RunStatus::Running && run.running_at.is_none() {
        run.running_at = Some(now);
    }
    if status.is_terminal() && run.finished_at.is_none() {
        run.finished_at = Some(now);
    }
    true
}

impl MetadataStore for MemoryStore {
    fn create_codespec(&self, name: &str, details: &CodespecDetails) -> Result<Codespec> {
        let mut inner = self.inner.lock().unwrap();
        let next_version = inner
            .codespecs
            .range((name.to_string(), 0)..=(name.to_string(), i32::MAX))
            .next_back()
            .map(|((_, v), _)| v + 1)
            .unwrap_or(1);
        let codespec = Codespec {
            name: name.to_string(),
            version: next_version,
            created_at: Utc::now(),
            details: details.clone(),
        };
        inner
            .codespecs
            .insert((name.to_string(), next_version), codespec.clone());
        Ok(codespec)
    }

    fn get_codespec(&self, name: &str, version: Option<i32>) -> Result<Codespec> {
        let inner = self.inner.lock().unwrap();
        let found = match version {
            Some(v) => inner.codespecs.get(&(name.to_string(), v)).cloned(),
            None => inner
                .codespecs
                .range((name.to_string(), 0)..=(name.to_string(), i32::MAX))
                .next_back()
                .map(|(_, c)| c.clone()),
        };
        found.ok_or_else(|| match version {
            Some(v) => Error::not_found(format!("codespec {}/versions/{}", name, v)),
            None => Error::not_found(format!("codespec {}", name)),
        })
    }

    fn list_codespecs(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<Codespec>> {
        let inner = self.inner.lock().unwrap();
        let mut latest: BTreeMap<&str, &Codespec> = BTreeMap::new();
        for ((name, _), codespec) in &inner.codespecs {
            if let Some(prefix) = prefix
                && !name.starts_with(prefix)
            {
                continue;
            }
            latest.insert(name.as_str(), codespec);
        }
        Ok(latest.into_values().take(limit).cloned().collect())
    }

    fn create_buffer(&self, buffer: &Buffer) -> Result<Buffer> {
        let mut inner = self.inner.lock().unwrap();
        if inner.buffers.contains_key(&buffer.id) {
            return Err(Error::precondition(format!(
                "buffer {} already exists",
                buffer.id
            )));
        }
        inner.buffers.insert(buffer.id.clone(), buffer.clone());
        Ok(buffer.clone())
    }

    fn get_buffer(&self, id: &str) -> Result<Buffer> {
        let inner = self.inner.lock().unwrap();
        inner
            .buffers
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("buffer {}", id)))
    }

    fn update_buffer_tags(
        &self,
        id: &str,
        etag: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> Result<Buffer> {
        let mut inner = self.inner.lock().unwrap();
        let buffer = inner
            .buffers
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("buffer {}", id)))?;
        check_etag(buffer, etag)?;
        buffer.tags = tags.clone();
        buffer.etag = new_etag();
        Ok(buffer.clone())
    }

    fn soft_delete_buffer(
        &self,
        id: &str,
        etag: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<Buffer> {
        let mut inner = self.inner.lock().unwrap();
        let buffer = inner
            .buffers
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("buffer {}", id)))?;
        check_etag(buffer, etag)?;
        buffer.soft_deleted = true;
        buffer.expires_at = Some(expires_at);
        buffer.etag = new_etag();
        Ok(buffer.clone())
    }

    fn restore_buffer(
        &self,
        id: &str,
        etag: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Buffer> {
        let mut inner = self.inner.lock().unwrap();
        let buffer = inner
            .buffers
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("buffer {}", id)))?;
        check_etag(buffer, etag)?;
        buffer.soft_deleted = false;
        buffer.expires_at = expires_at;
        buffer.etag = new_etag();
        Ok(buffer.clone())
    }

    fn delete_buffer_rows(&self, ids: &[String]) -> Result<Vec<String>> {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = Vec::new();
        for id in ids {
            if inner.buffers.remove(id).is_some() {
                removed.push(id.clone());
            }
        }
        Ok(removed)
    }

    fn list_buffers(
        &self,
        filter: &BufferFilter,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<BufferPage> {
        let inner = self.inner.lock().unwrap();
        let cursor = continuation.map(decode_continuation).transpose()?;

        let mut matching: Vec<&Buffer> =
            inner.buffers.values().filter(|b| filter.matches(b)).collect();
        // Newest first, id breaks ties, matching the keyset order.
        matching.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let after_cursor = matching.into_iter().filter(|b| match &cursor {
            None => true,
            Some((at, id)) => {
                b.created_at < *at || (b.created_at == *at && b.id.as_str() < id.as_str())
            }
        });

        let mut page: Vec<Buffer> = after_cursor.take(limit + 1).cloned().collect();
        let continuation = if page.len() > limit {
            page.truncate(limit);
            page.last()
                .map(|b| encode_continuation(b.created_at, &b.id))
        } else {
            None
        };
        Ok(BufferPage {
            buffers: page,
            continuation,
        })
    }

    fn count_buffers(&self, filter: &BufferFilter) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.buffers.values().filter(|b| filter.matches(b)).count() as u64)
    }

    fn list_hard_delete_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .buffers
            .values()
            .filter(|b| b.soft_deleted && b.expires_at.is_some_and(|at| at <= now))
            .take(limit)
            .map(|b| b.id.clone())
            .collect())
    }

    fn soft_delete_expired_buffers(
        &self,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut flipped = 0;
        for buffer in inner.buffers.values_mut() {
            if !buffer.soft_deleted && buffer.expires_at.is_some_and(|at| at <= now) {
                buffer.soft_deleted = true;
                buffer.expires_at = Some(expires_at);
                buffer.etag = new_etag();
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    fn ensure_storage_account(
        &self,
        name: &str,
        location: &str,
        endpoint: &str,
    ) -> Result<StorageAccount> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.accounts.iter().find(|a| a.name == name) {
            return Ok(existing.clone());
        }
        inner.next_account_id += 1;
        let account = StorageAccount {
            id: inner.next_account_id,
            name: name.to_string(),
            location: location.to_string(),
            endpoint: endpoint.to_string(),
        };
        inner.accounts.push(account.clone());
        Ok(account)
    }

    fn list_storage_accounts(&self) -> Result<Vec<StorageAccount>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.accounts.clone())
    }

    fn create_run(&self, new_run: &NewRun) -> Result<Run> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_run_id += 1;
        let run = Run {
            id: inner.next_run_id,
            kind: new_run.kind,
            job: new_run.job.clone(),
            worker: new_run.worker.clone(),
            cluster: new_run.cluster.clone(),
            timeout_secs: new_run.timeout_secs,
            status: RunStatus::Pending,
            status_reason: None,
            created_at: Utc::now(),
            running_at: None,
            finished_at: None,
            logs_archived_at: None,
            resources_created: false,
            is_final: false,
        };
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    fn get_run(&self, id: i64) -> Result<Run> {
        let inner = self.inner.lock().unwrap();
        inner
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("run {}", id)))
    }

    fn list_runs(
        &self,
        since_id: i64,
        limit: usize,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .range(since_id + 1..)
            .map(|(_, run)| run)
            .filter(|run| status.is_none_or(|s| run.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    fn update_run_status(
        &self,
        id: i64,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<Run> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("run {}", id)))?;
        apply_status_transition(run, status, reason, Utc::now());
        Ok(run.clone())
    }

    fn mark_resources_created(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("run {}", id)))?;
        run.resources_created = true;
        Ok(())
    }

    fn mark_logs_archived(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("run {}", id)))?;
        if !run.status.is_terminal() {
            return Err(Error::precondition(format!(
                "run {} is not terminal; cannot record log archival",
                id
            )));
        }
        run.logs_archived_at = Some(at);
        Ok(())
    }

    fn finalize_run(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("run {}", id)))?;
        if !run.status.is_terminal() {
            return Err(Error::precondition(format!(
                "run {} is not terminal; cannot finalize",
                id
            )));
        }
        run.is_final = true;
        Ok(())
    }

    fn delete_run(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.runs.remove(&id);
        inner.run_secrets.remove(&id);
        Ok(())
    }

    fn list_never_scheduled_runs(&self, created_before: DateTime<Utc>) -> Result<Vec<Run>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .values()
            .filter(|run| !run.resources_created && run.created_at < created_before)
            .cloned()
            .collect())
    }

    fn list_unfinalized_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .runs
            .values()
            .filter(|run| !run.is_final)
            .take(limit)
            .cloned()
            .collect())
    }

    fn get_run_counts(&self) -> Result<BTreeMap<RunStatus, u64>> {
        let inner = self.inner.lock().unwrap();
        let mut counts = BTreeMap::new();
        for run in inner.runs.values() {
            *counts.entry(run.status).or_insert(0u64) += 1;
        }
        Ok(counts)
    }

    fn upsert_run_secret(&self, record: &RunSecretRecord) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.run_secrets.insert(record.run_id, record.clone());
        Ok(())
    }

    fn list_due_run_secrets(&self, now: DateTime<Utc>) -> Result<Vec<RunSecretRecord>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .run_secrets
            .values()
            .filter(|r| r.refresh_due_at <= now)
            .cloned()
            .collect())
    }

    fn delete_run_secret(&self, run_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.run_secrets.remove(&run_id);
        Ok(())
    }
}
