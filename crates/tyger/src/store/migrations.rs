//! Database migrations.
//!
//! The catalog is a linear list of numbered migration units. Applying them
//! online is gated on replica readiness: migration N does not begin until
//! every ready replica reports an in-use schema version of at least N - 1,
//! so each step stays backward-readable by the previous server version.
//!
//! Progress is recorded in the append-only `migrations` table; the current
//! database version is the highest version with a `complete` row. A failed
//! unit halts the suffix, and a later `apply` resumes after the last
//! completed version.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::shutdown::Cancellation;

/// One migration unit: a batch of SQL statements.
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: &'static [&'static str],
}

/// The linear migration catalog. Versions are contiguous from 1.
pub fn catalog() -> &'static [Migration] {
    &[
        Migration {
            version: 1,
            description: "initial schema: codespecs, buffers, storage accounts, runs",
            statements: &[
                "CREATE TABLE IF NOT EXISTS codespecs (
                    name text NOT NULL,
                    version integer NOT NULL,
                    created_at timestamptz NOT NULL,
                    spec jsonb NOT NULL,
                    PRIMARY KEY (name, version)
                )",
                "CREATE TABLE IF NOT EXISTS storage_accounts (
                    id serial PRIMARY KEY,
                    name text NOT NULL UNIQUE,
                    location text NOT NULL,
                    endpoint text NOT NULL
                )",
                "CREATE TABLE IF NOT EXISTS buffers (
                    id text PRIMARY KEY,
                    created_at timestamptz NOT NULL,
                    location text NOT NULL,
                    account_id integer NOT NULL,
                    soft_deleted boolean NOT NULL DEFAULT false,
                    expires_at timestamptz,
                    etag text NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS buffers_keyset
                 ON buffers (created_at DESC, id DESC)",
                "CREATE INDEX IF NOT EXISTS buffers_expiry
                 ON buffers (expires_at) WHERE expires_at IS NOT NULL",
                "CREATE TABLE IF NOT EXISTS runs (
                    id bigserial PRIMARY KEY,
                    spec jsonb NOT NULL,
                    status text NOT NULL,
                    status_reason text,
                    created_at timestamptz NOT NULL,
                    running_at timestamptz,
                    finished_at timestamptz,
                    logs_archived_at timestamptz,
                    resources_created boolean NOT NULL DEFAULT false,
                    is_final boolean NOT NULL DEFAULT false
                )",
                "CREATE INDEX IF NOT EXISTS runs_unfinalized
                 ON runs (id) WHERE NOT is_final",
            ],
        },
        Migration {
            version: 2,
            description: "interned tag storage, indexed in both directions",
            statements: &[
                "CREATE TABLE IF NOT EXISTS tag_keys (
                    id serial PRIMARY KEY,
                    name text NOT NULL UNIQUE
                )",
                "CREATE TABLE IF NOT EXISTS buffer_tags (
                    buffer_id text NOT NULL REFERENCES buffers (id) ON DELETE CASCADE,
                    key_id integer NOT NULL REFERENCES tag_keys (id),
                    value text NOT NULL,
                    created_at timestamptz NOT NULL,
                    PRIMARY KEY (buffer_id, key_id)
                )",
                "CREATE INDEX IF NOT EXISTS buffer_tags_by_key_value
                 ON buffer_tags (key_id, value, buffer_id)",
            ],
        },
        Migration {
            version: 3,
            description: "secret-refresh tracking for active runs",
            statements: &[
                "CREATE TABLE IF NOT EXISTS run_secrets (
                    run_id bigint PRIMARY KEY,
                    refresh_due_at timestamptz NOT NULL,
                    expires_at timestamptz NOT NULL
                )",
                "CREATE INDEX IF NOT EXISTS run_secrets_due
                 ON run_secrets (refresh_due_at)",
            ],
        },
    ]
}

/// The highest schema version this build understands.
pub fn highest_known_version() -> u32 {
    catalog().last().map(|m| m.version).unwrap_or(0)
}

/// Bootstrap statement for the migrations journal itself.
pub const MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS migrations (
    version integer NOT NULL,
    state text NOT NULL,
    timestamp timestamptz NOT NULL
)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Started,
    Complete,
    Failed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Started => "started",
            MigrationState::Complete => "complete",
            MigrationState::Failed => "failed",
        }
    }
}

/// Database-side operations the runner needs. Implemented by
/// [`super::postgres::PostgresStore`]; tests substitute a fake.
pub trait MigrationHost: Send + Sync {
    fn current_database_version(&self) -> Result<Option<u32>>;
    fn record_migration(&self, version: u32, state: MigrationState) -> Result<()>;
    fn execute_batch(&self, statements: &[&str]) -> Result<()>;
    fn regrant_privileges(&self) -> Result<()>;
}

impl MigrationHost for super::postgres::PostgresStore {
    fn current_database_version(&self) -> Result<Option<u32>> {
        super::postgres::PostgresStore::current_database_version(self)
    }

    fn record_migration(&self, version: u32, state: MigrationState) -> Result<()> {
        super::postgres::PostgresStore::record_migration(self, version, state.as_str())
    }

    fn execute_batch(&self, statements: &[&str]) -> Result<()> {
        super::postgres::PostgresStore::execute_batch(self, statements)
    }

    fn regrant_privileges(&self) -> Result<()> {
        super::postgres::PostgresStore::regrant_privileges(self)
    }
}

/// Reports the in-use schema version of each ready server replica.
///
/// The production observer scrapes the replicas' version endpoint; tests
/// script the reports.
pub trait ReplicaObserver: Send + Sync {
    fn replica_versions(&self) -> Result<Vec<u32>>;
}

pub struct MigrationRunner<'a> {
    host: &'a dyn MigrationHost,
    /// Present in online mode; absent when applying offline.
    observer: Option<&'a dyn ReplicaObserver>,
    poll_interval: Duration,
    cancel: Cancellation,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(host: &'a dyn MigrationHost, observer: Option<&'a dyn ReplicaObserver>) -> Self {
        Self {
            host,
            observer,
            poll_interval: Duration::from_secs(5),
            cancel: Cancellation::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Apply the unapplied suffix of the catalog up to `target`
    /// (default: latest).
    pub fn apply(&self, target: Option<u32>) -> Result<()> {
        let latest = highest_known_version();
        let target = target.unwrap_or(latest);
        if target > latest {
            return Err(Error::validation(format!(
                "target version {} is newer than the highest known version {}",
                target, latest
            )));
        }

        self.host.execute_batch(&[MIGRATIONS_TABLE])?;
        let current = self.host.current_database_version()?.unwrap_or(0);
        if target <= current {
            info!(current, target, "database is already at the target version");
            return Ok(());
        }

        for migration in catalog().iter().filter(|m| m.version > current && m.version <= target) {
            self.wait_for_replicas(migration.version)?;

            info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            self.host
                .record_migration(migration.version, MigrationState::Started)?;

            let pipeline = Pipeline::from_policy(tyger_retry::RetryPolicy::Database);
            let applied = pipeline
                .run_cancellable(&self.cancel, || self.host.execute_batch(migration.statements));

            match applied {
                Ok(()) => {
                    self.host.regrant_privileges()?;
                    self.host
                        .record_migration(migration.version, MigrationState::Complete)?;
                }
                Err(e) => {
                    error!(version = migration.version, error = %e, "migration failed");
                    self.host
                        .record_migration(migration.version, MigrationState::Failed)?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Block until every ready replica reports at least `version - 1`.
    fn wait_for_replicas(&self, version: u32) -> Result<()> {
        let Some(observer) = self.observer else {
            return Ok(());
        };
        let required = version.saturating_sub(1);
        loop {
            self.cancel.check()?;
            match observer.replica_versions() {
                Ok(versions) => {
                    let lagging: Vec<u32> =
                        versions.iter().copied().filter(|v| *v < required).collect();
                    if lagging.is_empty() {
                        return Ok(());
                    }
                    info!(
                        version,
                        required,
                        ?lagging,
                        "waiting for replicas before applying migration"
                    );
                }
                Err(e) => warn!(error = %e, "failed to poll replica versions"),
            }
            if !self.cancel.sleep(self.poll_interval) {
                return Err(Error::Cancelled);
            }
        }
    }
}

/// Cached view of the current completed database version.
///
/// Each server process refreshes the cache in the background; if the
/// database ever reports a version newer than this build understands, the
/// cache logs a warning and continues at the highest known version.
#[derive(Clone)]
pub struct DatabaseVersionCache {
    version: Arc<Mutex<u32>>,
}

impl DatabaseVersionCache {
    pub fn new(initial: u32) -> Self {
        Self {
            version: Arc::new(Mutex::new(initial.min(highest_known_version()))),
        }
    }

    pub fn current(&self) -> u32 {
        *self.version.lock().unwrap()
    }

    fn observe(&self, reported: u32) {
        let known = highest_known_version();
        let effective = if reported > known {
            warn!(
                reported,
                known,
                "database version is newer than this build; continuing at the highest known version"
            );
            known
        } else {
            reported
        };
        *self.version.lock().unwrap() = effective;
    }

    /// Spawn the refresh loop. It polls `host` every `interval` until
    /// cancelled.
    pub fn spawn_refresher(
        &self,
        host: Arc<dyn MigrationHost>,
        interval: Duration,
        cancel: Cancellation,
    ) -> JoinHandle<()> {
        let cache = self.clone();
        std::thread::spawn(move || {
            loop {
                match host.current_database_version() {
                    Ok(Some(version)) => cache.observe(version),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "failed to refresh database version"),
                }
                if !cancel.sleep(interval) {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, PartialEq)]
    enum HostEvent {
        Recorded(u32, &'static str),
        Executed(String),
        Regranted,
    }

    #[derive(Default)]
    struct FakeHost {
        version: Mutex<Option<u32>>,
        events: Mutex<Vec<HostEvent>>,
        fail_batches_containing: Mutex<Option<String>>,
    }

    impl FakeHost {
        fn events(&self) -> Vec<HostEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl MigrationHost for FakeHost {
        fn current_database_version(&self) -> Result<Option<u32>> {
            Ok(*self.version.lock().unwrap())
        }

        fn record_migration(&self, version: u32, state: MigrationState) -> Result<()> {
            if state == MigrationState::Complete {
                *self.version.lock().unwrap() = Some(version);
            }
            self.events
                .lock()
                .unwrap()
                .push(HostEvent::Recorded(version, state.as_str()));
            Ok(())
        }

        fn execute_batch(&self, statements: &[&str]) -> Result<()> {
            let first = statements.first().copied().unwrap_or("");
            if let Some(marker) = self.fail_batches_containing.lock().unwrap().as_deref()
                && statements.iter().any(|s| s.contains(marker))
            {
                return Err(Error::fatal("syntax error"));
            }
            self.events
                .lock()
                .unwrap()
                .push(HostEvent::Executed(first.chars().take(30).collect()));
            Ok(())
        }

        fn regrant_privileges(&self) -> Result<()> {
            self.events.lock().unwrap().push(HostEvent::Regranted);
            Ok(())
        }
    }

    struct ScriptedObserver {
        reports: Mutex<VecDeque<Vec<u32>>>,
    }

    impl ScriptedObserver {
        fn new(reports: Vec<Vec<u32>>) -> Self {
            Self {
                reports: Mutex::new(reports.into()),
            }
        }
    }

    impl ReplicaObserver for ScriptedObserver {
        fn replica_versions(&self) -> Result<Vec<u32>> {
            let mut reports = self.reports.lock().unwrap();
            if reports.len() > 1 {
                Ok(reports.pop_front().unwrap())
            } else {
                Ok(reports.front().cloned().unwrap_or_default())
            }
        }
    }

    #[test]
    fn catalog_versions_are_contiguous_from_one() {
        let versions: Vec<u32> = catalog().iter().map(|m| m.version).collect();
        let expected: Vec<u32> = (1..=versions.len() as u32).collect();
        assert_eq!(versions, expected);
    }

    #[test]
    fn offline_apply_runs_the_whole_suffix() {
        let host = FakeHost::default();
        let runner = MigrationRunner::new(&host, None);
        runner.apply(None).expect("apply");

        let events = host.events();
        for migration in catalog() {
            assert!(events.contains(&HostEvent::Recorded(migration.version, "started")));
            assert!(events.contains(&HostEvent::Recorded(migration.version, "complete")));
        }
        assert!(events.contains(&HostEvent::Regranted));
    }

    #[test]
    fn apply_resumes_after_last_completed_version() {
        let host = FakeHost::default();
        *host.version.lock().unwrap() = Some(1);
        let runner = MigrationRunner::new(&host, None);
        runner.apply(None).expect("apply");

        let events = host.events();
        assert!(!events.contains(&HostEvent::Recorded(1, "started")));
        assert!(events.contains(&HostEvent::Recorded(2, "started")));
    }

    #[test]
    fn apply_is_a_no_op_at_the_target() {
        let host = FakeHost::default();
        *host.version.lock().unwrap() = Some(highest_known_version());
        let runner = MigrationRunner::new(&host, None);
        runner.apply(None).expect("apply");
        assert!(
            host.events()
                .iter()
                .all(|e| !matches!(e, HostEvent::Recorded(_, "started")))
        );
    }

    #[test]
    fn apply_rejects_unknown_target() {
        let host = FakeHost::default();
        let runner = MigrationRunner::new(&host, None);
        let err = runner
            .apply(Some(highest_known_version() + 1))
            .expect_err("too new");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn failed_migration_halts_the_suffix() {
        let host = FakeHost::default();
        *host.fail_batches_containing.lock().unwrap() = Some("tag_keys".to_string());
        let runner = MigrationRunner::new(&host, None);
        let err = runner.apply(None).expect_err("must fail");
        assert!(matches!(err, Error::BackendFatal(_)));

        let events = host.events();
        assert!(events.contains(&HostEvent::Recorded(1, "complete")));
        assert!(events.contains(&HostEvent::Recorded(2, "started")));
        assert!(events.contains(&HostEvent::Recorded(2, "failed")));
        assert!(!events.contains(&HostEvent::Recorded(2, "complete")));
        assert!(!events.contains(&HostEvent::Recorded(3, "started")));
    }

    #[test]
    fn online_apply_waits_for_lagging_replicas() {
        let host = FakeHost::default();
        *host.version.lock().unwrap() = Some(1);
        // First two polls report a replica still on version 0; migration 2
        // requires every replica to be at >= 1.
        let observer = ScriptedObserver::new(vec![vec![1, 0], vec![1, 0], vec![1, 1]]);
        let runner = MigrationRunner::new(&host, Some(&observer))
            .with_poll_interval(Duration::from_millis(1));
        runner.apply(Some(2)).expect("apply");

        let events = host.events();
        assert!(events.contains(&HostEvent::Recorded(2, "complete")));
    }

    #[test]
    fn version_cache_clamps_unknown_versions() {
        let cache = DatabaseVersionCache::new(1);
        cache.observe(highest_known_version() + 5);
        assert_eq!(cache.current(), highest_known_version());

        cache.observe(1);
        assert_eq!(cache.current(), 1);
    }
}
