//! Access-URL refresh for active runs.
//!
//! Signed buffer URLs outlive neither their ttl nor a long-running job.
//! Every five seconds the updater picks the runs whose URLs are within 70%
//! of their lifetime of expiry, rebuilds the signed set, and publishes it
//! through the backend-specific mechanism (a secret object on the cluster,
//! an atomic rewrite of the access files on the single host). Tracking rows
//! whose run is terminal or missing are deleted. Failures are logged and
//! the loop continues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::buffers::{BufferManager, EphemeralBufferId};
use crate::config::BufferLifetimeConfig;
use crate::error::{Error, Result};
use crate::provider::{AccessUrlOptions, AccessUrlRequest};
use crate::shutdown::Cancellation;
use crate::store::{MetadataStore, RunSecretRecord};
use crate::types::{CodespecDetails, Run};

use super::RunHost;
use super::create::REFRESH_FRACTION;

pub struct RunSecretUpdater {
    store: Arc<dyn MetadataStore>,
    buffers: Arc<BufferManager>,
    host: Arc<dyn RunHost>,
    lifetimes: BufferLifetimeConfig,
    access_from_docker: bool,
    interval: Duration,
}

impl RunSecretUpdater {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        buffers: Arc<BufferManager>,
        host: Arc<dyn RunHost>,
        lifetimes: BufferLifetimeConfig,
        access_from_docker: bool,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            buffers,
            host,
            lifetimes,
            access_from_docker,
            interval,
        }
    }

    /// One refresh tick.
    pub fn run_once(&self, cancel: &Cancellation) {
        let due = match self.store.list_due_run_secrets(Utc::now()) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "failed to list due run secrets");
                return;
            }
        };
        for record in due {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = self.refresh_run(&record, cancel) {
                warn!(run = record.run_id, error = %e, "secret refresh failed");
            }
        }
    }

    fn refresh_run(&self, record: &RunSecretRecord, cancel: &Cancellation) -> Result<()> {
        let run = match self.store.get_run(record.run_id) {
            Ok(run) => run,
            Err(Error::NotFound(_)) => {
                return self.store.delete_run_secret(record.run_id);
            }
            Err(e) => return Err(e),
        };
        if run.status.is_terminal() {
            return self.store.delete_run_secret(record.run_id);
        }

        let urls = self.rebuild_urls(&run, cancel)?;
        self.host.publish_access_urls(run.id, &urls)?;

        let ttl = self.lifetimes.default_access_ttl;
        let now = Utc::now();
        self.store.upsert_run_secret(&RunSecretRecord {
            run_id: run.id,
            refresh_due_at: now
                + chrono::Duration::from_std(ttl.mul_f64(REFRESH_FRACTION)).unwrap_or_default(),
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_default(),
        })?;
        debug!(run = run.id, urls = urls.len(), "refreshed run access urls");
        Ok(())
    }

    /// Re-mint the signed URL set for every binding of the run.
    fn rebuild_urls(&self, run: &Run, cancel: &Cancellation) -> Result<BTreeMap<String, String>> {
        let codespec = self
            .store
            .get_codespec(&run.job.codespec.name, run.job.codespec.version)?;
        let CodespecDetails::Job(job) = &codespec.details else {
            return Err(Error::Internal(anyhow::anyhow!(
                "run {} references a non-job codespec",
                run.id
            )));
        };

        let mut requests = Vec::new();
        let mut names = Vec::new();
        for (name, writeable) in job.buffers.all() {
            let Some(supplied) = run.job.buffers.get(name) else {
                continue;
            };
            let id = match EphemeralBufferId::parse(supplied) {
                Some(marker) if marker.run_id.is_none() => {
                    marker.scoped_to_run(run.id).to_string()
                }
                _ => supplied.clone(),
            };
            requests.push(AccessUrlRequest { id, writeable });
            names.push(name.to_string());
        }

        let options = AccessUrlOptions {
            prefer_tcp: false,
            from_docker: self.access_from_docker,
            check_exists: false,
            ttl: None,
        };
        let responses = self
            .buffers
            .create_buffer_access_urls(&requests, &options, cancel)?;

        let mut urls = BTreeMap::new();
        for (name, response) in names.into_iter().zip(responses) {
            match response.access {
                Some(access) => {
                    urls.insert(name, access.url);
                }
                None => warn!(
                    run = run.id,
                    buffer = %response.id,
                    "buffer disappeared while its run is active"
                ),
            }
        }
        Ok(urls)
    }

    pub fn spawn(self: Arc<Self>, cancel: Cancellation) -> JoinHandle<()> {
        std::thread::spawn(move || {
            loop {
                self.run_once(&cancel);
                if !cancel.sleep(self.interval) {
                    return;
                }
            }
        })
    }
}
