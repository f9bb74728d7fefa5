//! Buffer manager.
//!
//! The semantic layer over the metadata store and the buffer provider:
//! validates tags, mints ids, resolves TTL policy, and fans access-URL
//! requests out to the real provider and the ephemeral signer in a single
//! order-preserving pass.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::BufferLifetimeConfig;
use crate::error::{Error, Result};
use crate::provider::{
    AccessUrlOptions, AccessUrlRequest, AccessUrlResponse, BufferProvider, ExportRequest,
    ImportRequest,
};
use crate::shutdown::Cancellation;
use crate::store::MetadataStore;
use crate::types::{Buffer, BufferFilter, BufferPage, Run, validate_tags};

/// Mint a buffer id: lowercase base32 of a 128-bit random value,
/// 26 characters of `[a-z2-7]`.
pub fn new_buffer_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base32::encode(base32::Alphabet::Rfc4648Lower { padding: false }, &bytes)
}

/// An ephemeral buffer id: `temp-<id>` lives for a single operation,
/// `run-<runId>-temp-<id>` for the owning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralBufferId {
    pub run_id: Option<i64>,
    pub id: String,
}

impl EphemeralBufferId {
    /// Parse an ephemeral marker. Returns `None` for ordinary buffer ids.
    pub fn parse(s: &str) -> Option<Self> {
        let (run_id, rest) = match s.strip_prefix("run-") {
            Some(rest) => {
                let (run_part, rest) = rest.split_once("-temp-")?;
                let run_id: i64 = run_part.parse().ok()?;
                (Some(run_id), rest)
            }
            None => (None, s.strip_prefix("temp-")?),
        };
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        Some(Self {
            run_id,
            id: rest.to_string(),
        })
    }

    /// Rescope a bare `temp-` marker to its owning run.
    pub fn scoped_to_run(&self, run_id: i64) -> Self {
        Self {
            run_id: Some(run_id),
            id: self.id.clone(),
        }
    }
}

impl std::fmt::Display for EphemeralBufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.run_id {
            Some(run_id) => write!(f, "run-{}-temp-{}", run_id, self.id),
            None => write!(f, "temp-{}", self.id),
        }
    }
}

/// Signs access URLs for ephemeral buffers. On the single-host backend this
/// targets the local data plane; cluster deployments do not configure one.
pub trait EphemeralAccessProvider: Send + Sync {
    fn create_access_urls(
        &self,
        requests: &[AccessUrlRequest],
        options: &AccessUrlOptions,
        cancel: &Cancellation,
    ) -> Result<Vec<AccessUrlResponse>>;
}

pub struct BufferManager {
    store: Arc<dyn MetadataStore>,
    provider: Arc<dyn BufferProvider>,
    ephemeral: Option<Arc<dyn EphemeralAccessProvider>>,
    lifetimes: BufferLifetimeConfig,
}

impl BufferManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        provider: Arc<dyn BufferProvider>,
        ephemeral: Option<Arc<dyn EphemeralAccessProvider>>,
        lifetimes: BufferLifetimeConfig,
    ) -> Self {
        Self {
            store,
            provider,
            ephemeral,
            lifetimes,
        }
    }

    pub fn lifetimes(&self) -> &BufferLifetimeConfig {
        &self.lifetimes
    }

    fn active_expiry(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.lifetimes
            .active_lifetime_opt()
            .map(|lifetime| from + chrono::Duration::from_std(lifetime).unwrap_or_default())
    }

    /// Create a buffer: validate tags, mint an id, place it with the
    /// provider, persist the row.
    pub fn create_buffer(
        &self,
        location: &str,
        tags: &BTreeMap<String, String>,
        cancel: &Cancellation,
    ) -> Result<Buffer> {
        validate_tags(tags)?;
        let now = Utc::now();
        let buffer = Buffer {
            id: new_buffer_id(),
            created_at: now,
            location: location.to_string(),
            account_id: 0,
            tags: tags.clone(),
            soft_deleted: false,
            expires_at: self.active_expiry(now),
            etag: crate::store::new_etag(),
        };
        let placed = self.provider.create_buffer(&buffer, cancel)?;
        self.store.create_buffer(&placed)
    }

    pub fn get_buffer(&self, id: &str) -> Result<Buffer> {
        self.store.get_buffer(id)
    }

    pub fn update_buffer_tags(
        &self,
        id: &str,
        etag: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> Result<Buffer> {
        validate_tags(tags)?;
        self.store.update_buffer_tags(id, etag, tags)
    }

    /// Soft-delete a buffer. `ttl` overrides the configured soft-delete
    /// lifetime but is bounded by it.
    pub fn soft_delete_buffer(
        &self,
        id: &str,
        etag: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Buffer> {
        let lifetime = match ttl {
            Some(requested) => requested.min(self.lifetimes.soft_deleted_lifetime),
            None => self.lifetimes.soft_deleted_lifetime,
        };
        let expires_at = Utc::now() + chrono::Duration::from_std(lifetime).unwrap_or_default();
        self.store.soft_delete_buffer(id, etag, expires_at)
    }

    /// Restore a soft-deleted buffer, assigning a fresh active TTL.
    pub fn restore_buffer(&self, id: &str, etag: Option<&str>) -> Result<Buffer> {
        self.store.restore_buffer(id, etag, self.active_expiry(Utc::now()))
    }

    pub fn list_buffers(
        &self,
        filter: &BufferFilter,
        limit: usize,
        continuation: Option<&str>,
    ) -> Result<BufferPage> {
        self.store.list_buffers(filter, limit, continuation)
    }

    pub fn count_buffers(&self, filter: &BufferFilter) -> Result<u64> {
        self.store.count_buffers(filter)
    }

    /// Mint access URLs for a mixed batch of real and ephemeral buffer ids,
    /// preserving input order in the response.
    pub fn create_buffer_access_urls(
        &self,
        requests: &[AccessUrlRequest],
        options: &AccessUrlOptions,
        cancel: &Cancellation,
    ) -> Result<Vec<AccessUrlResponse>> {
        let mut real = Vec::new();
        let mut real_slots = Vec::new();
        let mut ephemeral = Vec::new();
        let mut ephemeral_slots = Vec::new();
        for (index, request) in requests.iter().enumerate() {
            if EphemeralBufferId::parse(&request.id).is_some() {
                ephemeral.push(request.clone());
                ephemeral_slots.push(index);
            } else {
                real.push(request.clone());
                real_slots.push(index);
            }
        }

        let mut responses: Vec<Option<AccessUrlResponse>> = vec![None; requests.len()];
        if !real.is_empty() {
            let resolved = self.provider.create_access_urls(&real, options, cancel)?;
            for (slot, response) in real_slots.into_iter().zip(resolved) {
                responses[slot] = Some(response);
            }
        }
        if !ephemeral.is_empty() {
            let signer = self.ephemeral.as_ref().ok_or_else(|| {
                Error::validation(
                    "ephemeral buffers require the local data plane, which is not configured",
                )
            })?;
            let resolved = signer.create_access_urls(&ephemeral, options, cancel)?;
            for (slot, response) in ephemeral_slots.into_iter().zip(resolved) {
                responses[slot] = Some(response);
            }
        }

        Ok(responses
            .into_iter()
            .map(|r| r.expect("every slot is filled by one of the passes"))
            .collect())
    }

    pub fn export_buffers(&self, request: &ExportRequest, cancel: &Cancellation) -> Result<Run> {
        validate_tags(&request.filters)?;
        self.provider.export_buffers(request, cancel)
    }

    pub fn import_buffers(&self, request: &ImportRequest, cancel: &Cancellation) -> Result<Run> {
        self.provider.import_buffers(request, cancel)
    }

    pub fn provider(&self) -> &Arc<dyn BufferProvider> {
        &self.provider
    }
}
