//! Background buffer deletion.
//!
//! Every 30 seconds the deleter soft-deletes active buffers whose TTL has
//! lapsed and hard-deletes soft-deleted buffers past their grace period.
//! Hard deletion pages in batches of up to 1000: the provider containers go
//! first, then the matching rows, and a full batch immediately triggers
//! another round after a short pause. Errors are logged and never surfaced;
//! the loop self-heals on the next tick.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::BufferLifetimeConfig;
use crate::provider::BufferProvider;
use crate::shutdown::Cancellation;
use crate::store::MetadataStore;

const TICK: Duration = Duration::from_secs(30);
const HARD_DELETE_BATCH: usize = 1000;
const FULL_BATCH_PAUSE: Duration = Duration::from_secs(1);

pub struct BufferDeleter {
    store: Arc<dyn MetadataStore>,
    provider: Arc<dyn BufferProvider>,
    lifetimes: BufferLifetimeConfig,
}

impl BufferDeleter {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        provider: Arc<dyn BufferProvider>,
        lifetimes: BufferLifetimeConfig,
    ) -> Self {
        Self {
            store,
            provider,
            lifetimes,
        }
    }

    /// One deleter tick: flip expired actives, then drain hard-delete
    /// candidates.
    pub fn run_once(&self, cancel: &Cancellation) {
        if let Err(e) = self.soft_delete_pass() {
            warn!(error = %e, "soft-delete pass failed");
        }
        if let Err(e) = self.hard_delete_pass(cancel) {
            warn!(error = %e, "hard-delete pass failed");
        }
    }

    fn soft_delete_pass(&self) -> crate::error::Result<()> {
        let now = Utc::now();
        let soft_expiry = now
            + chrono::Duration::from_std(self.lifetimes.soft_deleted_lifetime)
                .unwrap_or_default();
        let flipped = self.store.soft_delete_expired_buffers(now, soft_expiry)?;
        if flipped > 0 {
            info!(flipped, "soft-deleted expired buffers");
        }
        Ok(())
    }

    fn hard_delete_pass(&self, cancel: &Cancellation) -> crate::error::Result<()> {
        loop {
            cancel.check()?;
            let candidates = self
                .store
                .list_hard_delete_candidates(Utc::now(), HARD_DELETE_BATCH)?;
            if candidates.is_empty() {
                return Ok(());
            }

            // Provider containers go first; rows only disappear once the
            // backing storage is gone.
            let removed = self.provider.delete_buffers(&candidates, cancel)?;
            debug!(
                candidates = candidates.len(),
                removed = removed.len(),
                "hard-deleted provider containers"
            );
            self.store.delete_buffer_rows(&candidates)?;
            info!(count = candidates.len(), "hard-deleted buffers");

            if candidates.len() < HARD_DELETE_BATCH {
                return Ok(());
            }
            if !cancel.sleep(FULL_BATCH_PAUSE) {
                return Ok(());
            }
        }
    }

    /// Spawn the deleter loop.
    pub fn spawn(self: Arc<Self>, cancel: Cancellation) -> JoinHandle<()> {
        std::thread::spawn(move || {
            loop {
                self.run_once(&cancel);
                if !cancel.sleep(TICK) {
                    return;
                }
            }
        })
    }
}
