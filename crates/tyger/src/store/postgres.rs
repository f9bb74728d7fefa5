//! PostgreSQL metadata store.
//!
//! Schema (owned by the migration catalog in [`super::migrations`]):
//!
//! - `codespecs (name, version, created_at, spec jsonb)` -- append-only,
//!   versions assigned per name
//! - `buffers (id, created_at, location, account_id, soft_deleted,
//!   expires_at, etag)`
//! - `tag_keys (id, name)` / `buffer_tags (buffer_id, key_id, value,
//!   created_at)` -- interned tag storage, indexed in both directions
//! - `storage_accounts (id, name, location, endpoint)`
//! - `runs (id, kind, spec jsonb, status, status_reason, timestamps,
//!   resources_created, is_final)`
//! - `run_secrets (run_id, refresh_due_at, expires_at)`
//! - `migrations (version, state, timestamp)` -- append-only

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use postgres::types::ToSql;
use postgres::{Client, NoTls, Row};

use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::types::{
    Buffer, BufferFilter, BufferPage, Codespec, CodespecDetails, NewRun, Run, RunStatus,
    StorageAccount, decode_continuation, encode_continuation,
};

use super::{MetadataStore, RunSecretRecord, new_etag};

/// Stored shape of a run's immutable specification.
#[derive(serde::Serialize, serde::Deserialize)]
struct RunDocument {
    kind: crate::types::RunKind,
    job: crate::types::JobRunSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    worker: Option<crate::types::WorkerRunSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
}

pub struct PostgresStore {
    client: Mutex<Client>,
    /// Role that receives privileges after each migration.
    owner_role: Option<String>,
    pipeline: Pipeline,
}

fn db_err(err: postgres::Error) -> Error {
    // The driver does not distinguish transport faults from constraint
    // violations at the type level; unique-key conflicts come back with a
    // SQLSTATE and everything else is treated as transient so the pipeline
    // retries it.
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        if code.starts_with("23") {
            return Error::precondition(db.message().to_string());
        }
        return Error::transient(db.message().to_string());
    }
    Error::transient(err.to_string())
}

impl PostgresStore {
    pub fn connect(url: &str, owner_role: Option<String>) -> Result<Self> {
        let client = Client::connect(url, NoTls).map_err(db_err)?;
        Ok(Self {
            client: Mutex::new(client),
            owner_role,
            pipeline: Pipeline::from_policy(tyger_retry::RetryPolicy::Database),
        })
    }

    /// Replace the retry strategy database round-trips run with.
    pub fn with_retry_strategy(mut self, config: tyger_retry::RetryStrategyConfig) -> Self {
        self.pipeline = Pipeline::new(config, tyger_retry::PerFailureConfig::default());
        self
    }

    /// Every round-trip runs inside the resilience pipeline; transient
    /// driver failures retry with backoff, constraint conflicts surface as
    /// preconditions. Transactional closures must build their transaction
    /// per call so a retry starts clean.
    fn with_client<T>(
        &self,
        f: impl Fn(&mut Client) -> std::result::Result<T, postgres::Error>,
    ) -> Result<T> {
        let mut client = self.client.lock().unwrap();
        self.pipeline.run(|| f(&mut client).map_err(db_err))
    }

    /// Highest completed migration version, if any migration has run.
    pub fn current_database_version(&self) -> Result<Option<u32>> {
        let row = self.with_client(|c| {
            c.query_one(
                "SELECT MAX(version) FROM migrations WHERE state = 'complete'",
                &[],
            )
        })?;
        let version: Option<i32> = row.get(0);
        Ok(version.map(|v| v as u32))
    }

    pub(crate) fn record_migration(&self, version: u32, state: &str) -> Result<()> {
        self.with_client(|c| {
            c.execute(
                "INSERT INTO migrations (version, state, timestamp) VALUES ($1, $2, now())",
                &[&(version as i32), &state],
            )
        })?;
        Ok(())
    }

    pub(crate) fn execute_batch(&self, statements: &[&str]) -> Result<()> {
        let joined = statements.join(";\n");
        self.with_client(|c| c.batch_execute(&joined))
    }

    /// Re-grant role privileges after a migration reshapes objects.
    pub(crate) fn regrant_privileges(&self) -> Result<()> {
        let Some(role) = &self.owner_role else {
            return Ok(());
        };
        let grants = format!(
            "GRANT SELECT, INSERT, UPDATE, DELETE ON ALL TABLES IN SCHEMA public TO \"{role}\";\n\
             GRANT USAGE, SELECT ON ALL SEQUENCES IN SCHEMA public TO \"{role}\"",
        );
        self.with_client(|c| c.batch_execute(&grants))
    }

    fn load_tags(&self, ids: &[String]) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let rows = self.with_client(|c| {
            c.query(
                "SELECT bt.buffer_id, tk.name, bt.value
                 FROM buffer_tags bt
                 JOIN tag_keys tk ON tk.id = bt.key_id
                 WHERE bt.buffer_id = ANY($1)",
                &[&ids],
            )
        })?;
        let mut tags: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for row in rows {
            let buffer_id: String = row.get(0);
            let key: String = row.get(1);
            let value: String = row.get(2);
            tags.entry(buffer_id).or_default().insert(key, value);
        }
        Ok(tags)
    }

    fn replace_tags<C: postgres::GenericClient>(
        client: &mut C,
        buffer_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> std::result::Result<(), postgres::Error> {
        client.execute(
            "DELETE FROM buffer_tags WHERE buffer_id = $1",
            &[&buffer_id],
        )?;
        for (key, value) in tags {
            client.execute(
                "INSERT INTO tag_keys (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
                &[&key],
            )?;
            client.execute(
                "INSERT INTO buffer_tags (buffer_id, key_id, value, created_at)
                 SELECT $1, id, $3, now() FROM tag_keys WHERE name = $2",
                &[&buffer_id, &key, &value],
            )?;
        }
        Ok(())
    }

    fn buffer_from_row(row: &Row, tags: BTreeMap<String, String>) -> Buffer {
        Buffer {
            id: row.get("id"),
            created_at: row.get("created_at"),
            location: row.get("location"),
            account_id: row.get("account_id"),
            tags,
            soft_deleted: row.get("soft_deleted"),
            expires_at: row.get("expires_at"),
            etag: row.get("etag"),
        }
    }

    fn get_buffer_with_tags(&self, id: &str) -> Result<Buffer> {
        let row = self
            .with_client(|c| {
                c.query_opt(
                    "SELECT id, created_at, location, account_id, soft_deleted, expires_at, etag
                     FROM buffers WHERE id = $1",
                    &[&id],
                )
            })?
            .ok_or_else(|| Error::not_found(format!("buffer {}", id)))?;
        let tags = self
            .load_tags(&[id.to_string()])?
            .remove(id)
            .unwrap_or_default();
        Ok(Self::buffer_from_row(&row, tags))
    }

    fn run_from_row(row: &Row) -> Result<Run> {
        let spec: serde_json::Value = row.get("spec");
        let document: RunDocument = serde_json::from_value(spec)
            .map_err(|e| Error::Internal(anyhow::anyhow!("corrupt run document: {}", e)))?;
        let status: String = row.get("status");
        let status: RunStatus = status
            .parse()
            .map_err(|e: String| Error::Internal(anyhow::anyhow!(e)))?;
        Ok(Run {
            id: row.get("id"),
            kind: document.kind,
            job: document.job,
            worker: document.worker,
            cluster: document.cluster,
            timeout_secs: document.timeout_secs,
            status,
            status_reason: row.get("status_reason"),
            created_at: row.get("created_at"),
            running_at: row.get("running_at"),
            finished_at: row.get("finished_at"),
            logs_archived_at: row.get("logs_archived_at"),
            resources_created: row.get("resources_created"),
            is_final: row.get("is_final"),
        })
    }
}

const RUN_COLUMNS: &str = "id, spec, status, status_reason, created_at, running_at, \
                           finished_at, logs_archived_at, resources_created, is_final";

/// Build the WHERE clause and parameters for a buffer filter plus optional
/// keyset cursor. Parameters are numbered starting at `$1`.
fn build_buffer_predicate(
    filter: &BufferFilter,
    cursor: Option<&(DateTime<Utc>, String)>,
) -> (String, Vec<Box<dyn ToSql + Sync>>) {
    let mut clauses: Vec<String> = vec!["b.soft_deleted = $1".to_string()];
    let mut params: Vec<Box<dyn ToSql + Sync>> = vec![Box::new(filter.soft_deleted)];

    for (key, value) in &filter.include_tags {
        let key_idx = params.len() + 1;
        let value_idx = params.len() + 2;
        clauses.push(format!(
            "EXISTS (SELECT 1 FROM buffer_tags bt JOIN tag_keys tk ON tk.id = bt.key_id \
             WHERE bt.buffer_id = b.id AND tk.name = ${key_idx} AND bt.value = ${value_idx})"
        ));
        params.push(Box::new(key.clone()));
        params.push(Box::new(value.clone()));
    }
    for (key, value) in &filter.exclude_tags {
        let key_idx = params.len() + 1;
        let value_idx = params.len() + 2;
        clauses.push(format!(
            "NOT EXISTS (SELECT 1 FROM buffer_tags bt JOIN tag_keys tk ON tk.id = bt.key_id \
             WHERE bt.buffer_id = b.id AND tk.name = ${key_idx} AND bt.value = ${value_idx})"
        ));
        params.push(Box::new(key.clone()));
        params.push(Box::new(value.clone()));
    }

    if let Some((created_at, id)) = cursor {
        let at_idx = params.len() + 1;
        let id_idx = params.len() + 2;
        clauses.push(format!(
            "(b.created_at, b.id) < (${at_idx}, ${id_idx})"
        ));
        params.push(Box::new(*created_at));
        params.push(Box::new(id.clone()));
    }

    (clauses.join(" AND "), params)
}

impl MetadataStore for PostgresStore {
    fn create_codespec(&self, name: &str, details: &CodespecDetails) -> Result<Codespec> {
        let spec = serde_json::to_value(details)
            .map_err(|e| Error::Internal(anyhow::anyhow!("serialize codespec: {}", e)))?;
        // The (name, version) primary key turns a concurrent assignment of
        // the same version into a conflict the pipeline retries.
        let row = self.with_client(|c| {
            c.query_one(
                "INSERT INTO codespecs (name, version, created_at, spec)
                 SELECT $1, COALESCE(MAX(version), 0) + 1, now(), $2
                 FROM codespecs WHERE name = $1
                 RETURNING version, created_at",
                &[&name, &spec],
            )
        })?;
        Ok(Codespec {
            name: name.to_string(),
            version: row.get(0),
            created_at: row.get(1),
            details: details.clone(),
        })
    }

    fn get_codespec(&self, name: &str, version: Option<i32>) -> Result<Codespec> {
        let row = match version {
            Some(v) => self.with_client(|c| {
                c.query_opt(
                    "SELECT name, version, created_at, spec FROM codespecs
                     WHERE name = $1 AND version = $2",
                    &[&name, &v],
                )
            })?,
            None => self.with_client(|c| {
                c.query_opt(
                    "SELECT name, version, created_at, spec FROM codespecs
                     WHERE name = $1 ORDER BY version DESC LIMIT 1",
                    &[&name],
                )
            })?,
        };
        let row = row.ok_or_else(|| match version {
            Some(v) => Error::not_found(format!("codespec {}/versions/{}", name, v)),
            None => Error::not_found(format!("codespec {}", name)),
        })?;
        let spec: serde_json::Value = row.get(3);
        let details: CodespecDetails = serde_json::from_value(spec)
            .map_err(|e| Error::Internal(anyhow::anyhow!("corrupt codespec: {}", e)))?;
        Ok(Codespec {
            name: row.get(0),
            version: row.get(1),
            created_at: row.get(2),
            details,
        })
    }

    fn list_codespecs(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<Codespec>> {
        let pattern = format!("{}%", prefix.unwrap_or(""));
        let rows = self.with_client(|c| {
            c.query(
                "SELECT DISTINCT ON (name) name, version, created_at, spec
                 FROM codespecs WHERE name LIKE $1
                 ORDER BY name, version DESC LIMIT $2",
                &[&pattern, &(limit as i64)],
            )
        })?;
        rows.iter()
            .map(|row| {
                let spec: serde_json::Value = row.get(3);
                let details: CodespecDetails = serde_json::from_value(spec)
                    .map_err(|e| Error::Internal(anyhow::anyhow!("corrupt codespec: {}", e)))?;
                Ok(Codespec {
                    name: row.get(0),
                    version: row.get(1),
                    created_at: row.get(2),
                    details,
                })
            })
            .collect()
    }

    fn create_buffer(&self, buffer: &Buffer) -> Result<Buffer> {
        self.with_client(|c| {
            let mut tx = c.transaction()?;
            tx.execute(
                "INSERT INTO buffers (id, created_at, location, account_id, soft_deleted, \
                 expires_at, etag) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &buffer.id,
                    &buffer.created_at,
                    &buffer.location,
                    &buffer.account_id,
                    &buffer.soft_deleted,
                    &buffer.expires_at,
                    &buffer.etag,
                ],
            )?;
            Self::replace_tags(&mut tx, &buffer.id, &buffer.tags)?;
            tx.commit()
        })?;
        Ok(buffer.clone())
    }

    fn get_buffer(&self, id: &str) -> Result<Buffer> {
        self.get_buffer_with_tags(id)
    }

    fn update_buffer_tags(
        &self,
        id: &str,
        etag: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> Result<Buffer> {
        let fresh = new_etag();
        let updated = self.with_client(|c| {
            let mut tx = c.transaction()?;
            let count = match etag {
                Some(etag) => tx.execute(
                    "UPDATE buffers SET etag = $3 WHERE id = $1 AND etag = $2",
                    &[&id, &etag, &fresh],
                )?,
                None => tx.execute("UPDATE buffers SET etag = $2 WHERE id = $1", &[&id, &fresh])?,
            };
            if count == 1 {
                Self::replace_tags(&mut tx, id, tags)?;
            }
            tx.commit()?;
            Ok(count)
        })?;
        if updated == 0 {
            // Distinguish a missing row from a stale precondition.
            let _ = self.get_buffer_with_tags(id)?;
            return Err(Error::precondition(format!(
                "buffer {} was modified concurrently",
                id
            )));
        }
        self.get_buffer_with_tags(id)
    }

    fn soft_delete_buffer(
        &self,
        id: &str,
        etag: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<Buffer> {
        let fresh = new_etag();
        let updated = self.with_client(|c| match etag {
            Some(etag) => c.execute(
                "UPDATE buffers SET soft_deleted = true, expires_at = $3, etag = $4
                 WHERE id = $1 AND etag = $2",
                &[&id, &etag, &expires_at, &fresh],
            ),
            None => c.execute(
                "UPDATE buffers SET soft_deleted = true, expires_at = $2, etag = $3
                 WHERE id = $1",
                &[&id, &expires_at, &fresh],
            ),
        })?;
        if updated == 0 {
            let _ = self.get_buffer_with_tags(id)?;
            return Err(Error::precondition(format!(
                "buffer {} was modified concurrently",
                id
            )));
        }
        self.get_buffer_with_tags(id)
    }

    fn restore_buffer(
        &self,
        id: &str,
        etag: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Buffer> {
        let fresh = new_etag();
        let updated = self.with_client(|c| match etag {
            Some(etag) => c.execute(
                "UPDATE buffers SET soft_deleted = false, expires_at = $3, etag = $4
                 WHERE id = $1 AND etag = $2",
                &[&id, &etag, &expires_at, &fresh],
            ),
            None => c.execute(
                "UPDATE buffers SET soft_deleted = false, expires_at = $2, etag = $3
                 WHERE id = $1",
                &[&id, &expires_at, &fresh],
            ),
        })?;
        if updated == 0 {
            let _ = self.get_buffer_with_tags(id)?;
            return Err(Error::precondition(format!(
                "buffer {} was modified concurrently",
                id
            )));
        }
        self.get_buffer_with_tags(id)
    }

    fn delete_buffer_rows(&self, ids: &[String]) -> Result<Vec<String>> {
        let rows = self.with_client(|c| {
            c.query(
                "DELETE FROM buffers WHERE id = ANY($1) RETURNING id",
                &[&ids],
            )
        })?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    fn list_buffers(
        &self,
        filter: &BufferFilter,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<BufferPage> {
        let cursor = continuation.map(decode_continuation).transpose()?;
        let (predicate, params) = build_buffer_predicate(filter, cursor.as_ref());
        let sql = format!(
            "SELECT id, created_at, location, account_id, soft_deleted, expires_at, etag
             FROM buffers b WHERE {predicate}
             ORDER BY b.created_at DESC, b.id DESC LIMIT {}",
            limit + 1
        );
        let rows = self.with_client(|c| {
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p.as_ref()).collect();
            c.query(&sql, &refs)
        })?;

        let mut ids: Vec<String> = rows.iter().map(|r| r.get("id")).collect();
        let has_more = ids.len() > limit;
        ids.truncate(limit);
        let mut tags = self.load_tags(&ids)?;

        let buffers: Vec<Buffer> = rows
            .iter()
            .take(limit)
            .map(|row| {
                let id: String = row.get("id");
                Self::buffer_from_row(row, tags.remove(&id).unwrap_or_default())
            })
            .collect();
        let continuation = if has_more {
            buffers
                .last()
                .map(|b| encode_continuation(b.created_at, &b.id))
        } else {
            None
        };
        Ok(BufferPage {
            buffers,
            continuation,
        })
    }

    fn count_buffers(&self, filter: &BufferFilter) -> Result<u64> {
        let (predicate, params) = build_buffer_predicate(filter, None);
        let sql = format!("SELECT COUNT(*) FROM buffers b WHERE {predicate}");
        let row = self.with_client(|c| {
            let refs: Vec<&(dyn ToSql + Sync)> =
                params.iter().map(|p| p.as_ref()).collect();
            c.query_one(&sql, &refs)
        })?;
        let count: i64 = row.get(0);
        Ok(count as u64)
    }

    fn list_hard_delete_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>> {
        let rows = self.with_client(|c| {
            c.query(
                "SELECT id FROM buffers
                 WHERE soft_deleted AND expires_at IS NOT NULL AND expires_at <= $1
                 ORDER BY expires_at LIMIT $2",
                &[&now, &(limit as i64)],
            )
        })?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    fn soft_delete_expired_buffers(
        &self,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let flipped = self.with_client(|c| {
            c.execute(
                "UPDATE buffers
                 SET soft_deleted = true, expires_at = $2,
                     etag = substr(md5(random()::text || id), 1, 16)
                 WHERE NOT soft_deleted AND expires_at IS NOT NULL AND expires_at <= $1",
                &[&now, &expires_at],
            )
        })?;
        Ok(flipped)
    }

    fn ensure_storage_account(
        &self,
        name: &str,
        location: &str,
        endpoint: &str,
    ) -> Result<StorageAccount> {
        self.with_client(|c| {
            c.execute(
                "INSERT INTO storage_accounts (name, location, endpoint)
                 VALUES ($1, $2, $3) ON CONFLICT (name) DO NOTHING",
                &[&name, &location, &endpoint],
            )
        })?;
        let row = self.with_client(|c| {
            c.query_one(
                "SELECT id, name, location, endpoint FROM storage_accounts WHERE name = $1",
                &[&name],
            )
        })?;
        Ok(StorageAccount {
            id: row.get(0),
            name: row.get(1),
            location: row.get(2),
            endpoint: row.get(3),
        })
    }

    fn list_storage_accounts(&self) -> Result<Vec<StorageAccount>> {
        let rows = self.with_client(|c| {
            c.query(
                "SELECT id, name, location, endpoint FROM storage_accounts ORDER BY id",
                &[],
            )
        })?;
        Ok(rows
            .iter()
            .map(|row| StorageAccount {
                id: row.get(0),
                name: row.get(1),
                location: row.get(2),
                endpoint: row.get(3),
            })
            .collect())
    }

    fn create_run(&self, new_run: &NewRun) -> Result<Run> {
        let document = RunDocument {
            kind: new_run.kind,
            job: new_run.job.clone(),
            worker: new_run.worker.clone(),
            cluster: new_run.cluster.clone(),
            timeout_secs: new_run.timeout_secs,
        };
        let spec = serde_json::to_value(&document)
            .map_err(|e| Error::Internal(anyhow::anyhow!("serialize run: {}", e)))?;
        let row = self.with_client(|c| {
            c.query_one(
                &format!(
                    "INSERT INTO runs (spec, status, created_at, resources_created, is_final)
                     VALUES ($1, 'pending', now(), false, false)
                     RETURNING {RUN_COLUMNS}"
                ),
                &[&spec],
            )
        })?;
        Self::run_from_row(&row)
    }

    fn get_run(&self, id: i64) -> Result<Run> {
        let row = self
            .with_client(|c| {
                c.query_opt(
                    &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"),
                    &[&id],
                )
            })?
            .ok_or_else(|| Error::not_found(format!("run {}", id)))?;
        Self::run_from_row(&row)
    }

    fn list_runs(
        &self,
        since_id: i64,
        limit: usize,
        status: Option<RunStatus>,
    ) -> Result<Vec<Run>> {
        let rows = match status {
            Some(status) => {
                let status = status.to_string();
                self.with_client(|c| {
                    c.query(
                        &format!(
                            "SELECT {RUN_COLUMNS} FROM runs
                             WHERE id > $1 AND status = $2 ORDER BY id LIMIT $3"
                        ),
                        &[&since_id, &status, &(limit as i64)],
                    )
                })?
            }
            None => self.with_client(|c| {
                c.query(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM runs WHERE id > $1 ORDER BY id LIMIT $2"
                    ),
                    &[&since_id, &(limit as i64)],
                )
            })?,
        };
        rows.iter().map(Self::run_from_row).collect()
    }

    fn update_run_status(
        &self,
        id: i64,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<Run> {
        let status_text = status.to_string();
        // Conditional update: a terminal row never changes.
        self.with_client(|c| {
            c.execute(
                "UPDATE runs SET
                     status = $2,
                     status_reason = $3,
                     running_at = CASE WHEN $2 = 'running' AND running_at IS NULL
                                       THEN now() ELSE running_at END,
                     finished_at = CASE WHEN $2 IN ('succeeded', 'failed', 'canceled')
                                             AND finished_at IS NULL
                                        THEN now() ELSE finished_at END
                 WHERE id = $1 AND status NOT IN ('succeeded', 'failed', 'canceled')",
                &[&id, &status_text, &reason],
            )
        })?;
        self.get_run(id)
    }

    fn mark_resources_created(&self, id: i64) -> Result<()> {
        let updated = self.with_client(|c| {
            c.execute("UPDATE runs SET resources_created = true WHERE id = $1", &[&id])
        })?;
        if updated == 0 {
            return Err(Error::not_found(format!("run {}", id)));
        }
        Ok(())
    }

    fn mark_logs_archived(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let updated = self.with_client(|c| {
            c.execute(
                "UPDATE runs SET logs_archived_at = $2
                 WHERE id = $1 AND status IN ('succeeded', 'failed', 'canceled')",
                &[&id, &at],
            )
        })?;
        if updated == 0 {
            let _ = self.get_run(id)?;
            return Err(Error::precondition(format!(
                "run {} is not terminal; cannot record log archival",
                id
            )));
        }
        Ok(())
    }

    fn finalize_run(&self, id: i64) -> Result<()> {
        let updated = self.with_client(|c| {
            c.execute(
                "UPDATE runs SET is_final = true
                 WHERE id = $1 AND status IN ('succeeded', 'failed', 'canceled')",
                &[&id],
            )
        })?;
        if updated == 0 {
            let _ = self.get_run(id)?;
            return Err(Error::precondition(format!(
                "run {} is not terminal; cannot finalize",
                id
            )));
        }
        Ok(())
    }

    fn delete_run(&self, id: i64) -> Result<()> {
        self.with_client(|c| {
            let mut tx = c.transaction()?;
            tx.execute("DELETE FROM run_secrets WHERE run_id = $1", &[&id])?;
            tx.execute("DELETE FROM runs WHERE id = $1", &[&id])?;
            tx.commit()
        })
    }

    fn list_never_scheduled_runs(&self, created_before: DateTime<Utc>) -> Result<Vec<Run>> {
        let rows = self.with_client(|c| {
            c.query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs
                     WHERE NOT resources_created AND created_at < $1 ORDER BY id"
                ),
                &[&created_before],
            )
        })?;
        rows.iter().map(Self::run_from_row).collect()
    }

    fn list_unfinalized_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let rows = self.with_client(|c| {
            c.query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs WHERE NOT is_final ORDER BY id LIMIT $1"
                ),
                &[&(limit as i64)],
            )
        })?;
        rows.iter().map(Self::run_from_row).collect()
    }

    fn get_run_counts(&self) -> Result<BTreeMap<RunStatus, u64>> {
        let rows = self
            .with_client(|c| c.query("SELECT status, COUNT(*) FROM runs GROUP BY status", &[]))?;
        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.get(0);
            let status: RunStatus = status
                .parse()
                .map_err(|e: String| Error::Internal(anyhow::anyhow!(e)))?;
            let count: i64 = row.get(1);
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    fn upsert_run_secret(&self, record: &RunSecretRecord) -> Result<()> {
        self.with_client(|c| {
            c.execute(
                "INSERT INTO run_secrets (run_id, refresh_due_at, expires_at)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (run_id) DO UPDATE
                 SET refresh_due_at = EXCLUDED.refresh_due_at,
                     expires_at = EXCLUDED.expires_at",
                &[&record.run_id, &record.refresh_due_at, &record.expires_at],
            )
        })?;
        Ok(())
    }

    fn list_due_run_secrets(&self, now: DateTime<Utc>) -> Result<Vec<RunSecretRecord>> {
        let rows = self.with_client(|c| {
            c.query(
                "SELECT run_id, refresh_due_at, expires_at FROM run_secrets
                 WHERE refresh_due_at <= $1 ORDER BY refresh_due_at",
                &[&now],
            )
        })?;
        Ok(rows
            .iter()
            .map(|row| RunSecretRecord {
                run_id: row.get(0),
                refresh_due_at: row.get(1),
                expires_at: row.get(2),
            })
            .collect())
    }

    fn delete_run_secret(&self, run_id: i64) -> Result<()> {
        self.with_client(|c| {
            c.execute("DELETE FROM run_secrets WHERE run_id = $1", &[&run_id])
        })?;
        Ok(())
    }
}
