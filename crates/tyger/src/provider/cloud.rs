//! Cloud buffer provider.
//!
//! Buffers are backed by object-storage containers, one per buffer, spread
//! round-robin across the storage accounts configured for the buffer's
//! location. Access URLs are signed against per-account user-delegation
//! keys, which a background refresher renews at three quarters of their
//! lifetime. A buffer that fails mid-write receives a `.bufferend` tombstone
//! blob so readers can distinguish failure from a short stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::config::{BufferLifetimeConfig, StorageConfig};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::shutdown::Cancellation;
use crate::store::MetadataStore;
use crate::types::{
    Buffer, BufferAccess, CodespecCommon, CodespecDetails, JobCodespec, JobRunSpec, NewRun, Run,
    RunKind, StorageAccount,
};

use super::sign::{AccessClaims, KeyGeneration, ResourceType, sign_query};
use super::{
    AccessUrlOptions, AccessUrlRequest, AccessUrlResponse, BufferProvider, ExportRequest,
    FAILURE_TOMBSTONE_BLOB, FAILURE_TOMBSTONE_BODY, ImportRequest, SystemRunLauncher,
};

/// A time-bounded key used to sign access URLs for one storage account.
#[derive(Debug, Clone)]
pub struct DelegationKey {
    pub value: Vec<u8>,
    pub expires_at: DateTime<Utc>,
}

impl DelegationKey {
    fn refresh_due(&self, lifetime: Duration) -> DateTime<Utc> {
        // Renew at 0.75 x lifetime, i.e. a quarter lifetime before expiry.
        self.expires_at - chrono::Duration::from_std(lifetime / 4).unwrap_or_default()
    }
}

/// Acquires delegation keys for storage accounts.
pub trait DelegationKeySource: Send + Sync {
    fn acquire(&self, account: &StorageAccount, lifetime: Duration) -> Result<DelegationKey>;
}

/// Acquires delegation keys over the storage account's REST endpoint.
pub struct RestDelegationKeySource {
    http: reqwest::blocking::Client,
}

impl RestDelegationKeySource {
    pub fn new() -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("build http client: {}", e)))?;
        Ok(Self { http })
    }
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct DelegationKeyRequest {
    lifetime_seconds: u64,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DelegationKeyResponse {
    value: String,
    expires_at: DateTime<Utc>,
}

impl DelegationKeySource for RestDelegationKeySource {
    fn acquire(&self, account: &StorageAccount, lifetime: Duration) -> Result<DelegationKey> {
        use base64::Engine;

        let url = format!("{}/delegation-keys", account.endpoint.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&DelegationKeyRequest {
                lifetime_seconds: lifetime.as_secs(),
            })
            .send()
            .map_err(|e| Error::transient(format!("delegation key request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "delegation key request for {} returned {}",
                account.name,
                response.status()
            )));
        }
        let body: DelegationKeyResponse = response
            .json()
            .map_err(|e| Error::transient(format!("malformed delegation key response: {}", e)))?;
        let value = base64::engine::general_purpose::STANDARD
            .decode(&body.value)
            .map_err(|e| Error::transient(format!("malformed delegation key value: {}", e)))?;
        Ok(DelegationKey {
            value,
            expires_at: body.expires_at,
        })
    }
}

pub struct CloudBufferProvider {
    store: Arc<dyn MetadataStore>,
    accounts: Vec<StorageAccount>,
    /// Account indexes per location, in configuration order.
    by_location: BTreeMap<String, Vec<usize>>,
    /// Round-robin cursor per location.
    counters: BTreeMap<String, AtomicUsize>,
    keys: Mutex<BTreeMap<i32, DelegationKey>>,
    key_source: Arc<dyn DelegationKeySource>,
    key_lifetime: Duration,
    lifetimes: BufferLifetimeConfig,
    copier_image: String,
    http: reqwest::blocking::Client,
    pipeline: Pipeline,
    launcher: Mutex<Option<Arc<dyn SystemRunLauncher>>>,
}

impl CloudBufferProvider {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        accounts: Vec<StorageAccount>,
        key_source: Arc<dyn DelegationKeySource>,
        storage: &StorageConfig,
        lifetimes: BufferLifetimeConfig,
    ) -> Result<Self> {
        let mut by_location: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut counters = BTreeMap::new();
        for (index, account) in accounts.iter().enumerate() {
            by_location
                .entry(account.location.clone())
                .or_default()
                .push(index);
            counters
                .entry(account.location.clone())
                .or_insert_with(|| AtomicUsize::new(0));
        }
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(100))
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("build http client: {}", e)))?;
        Ok(Self {
            store,
            accounts,
            by_location,
            counters,
            keys: Mutex::new(BTreeMap::new()),
            key_source,
            key_lifetime: storage.key_lifetime,
            lifetimes,
            copier_image: storage.copier_image.clone(),
            http,
            pipeline: Pipeline::default(),
            launcher: Mutex::new(None),
        })
    }

    /// Replace the retry pipeline object-store calls run through.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Wire in the system-run launcher once the run engine exists.
    pub fn set_run_launcher(&self, launcher: Arc<dyn SystemRunLauncher>) {
        *self.launcher.lock().unwrap() = Some(launcher);
    }

    /// Pick the next account for a location, round-robin.
    fn place(&self, location: &str) -> Result<&StorageAccount> {
        let indexes = self.by_location.get(location).ok_or_else(|| {
            Error::validation(format!("unknown storage location {:?}", location))
        })?;
        let cursor = self
            .counters
            .get(location)
            .expect("counter exists for every location")
            .fetch_add(1, Ordering::Relaxed);
        Ok(&self.accounts[indexes[cursor % indexes.len()]])
    }

    fn account_by_id(&self, id: i32) -> Result<&StorageAccount> {
        self.accounts
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| Error::validation(format!("unknown storage account id {}", id)))
    }

    /// Current delegation key for an account, acquiring one on demand.
    fn delegation_key(&self, account: &StorageAccount) -> Result<DelegationKey> {
        {
            let keys = self.keys.lock().unwrap();
            if let Some(key) = keys.get(&account.id)
                && key.expires_at > Utc::now()
            {
                return Ok(key.clone());
            }
        }
        let key = self.key_source.acquire(account, self.key_lifetime)?;
        self.keys.lock().unwrap().insert(account.id, key.clone());
        Ok(key)
    }

    /// One refresher pass over all accounts. Returns whether any account is
    /// left without a valid key.
    pub fn refresh_keys_once(&self) -> bool {
        let now = Utc::now();
        let mut any_expired_failure = false;
        for account in &self.accounts {
            let existing = self.keys.lock().unwrap().get(&account.id).cloned();
            let due = match &existing {
                Some(key) => now >= key.refresh_due(self.key_lifetime),
                None => true,
            };
            if !due {
                continue;
            }
            match self.key_source.acquire(account, self.key_lifetime) {
                Ok(key) => {
                    self.keys.lock().unwrap().insert(account.id, key);
                }
                Err(e) => {
                    let still_valid = existing.is_some_and(|key| key.expires_at > now);
                    if still_valid {
                        warn!(
                            account = %account.name,
                            error = %e,
                            "delegation key refresh failed; existing key is still valid"
                        );
                    } else {
                        error!(
                            account = %account.name,
                            error = %e,
                            "delegation key refresh failed with no valid key"
                        );
                        any_expired_failure = true;
                    }
                }
            }
        }
        any_expired_failure
    }

    /// Spawn the delegation-key refresh loop.
    pub fn spawn_key_refresher(
        provider: Arc<Self>,
        cancel: Cancellation,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            // A 30 s cadence hits the 0.75 x lifetime renewal point and
            // doubles as the retry interval once a key has lapsed.
            loop {
                provider.refresh_keys_once();
                if !cancel.sleep(Duration::from_secs(30)) {
                    return;
                }
            }
        })
    }

    fn container_url(&self, account: &StorageAccount, id: &str) -> String {
        format!(
            "{}/v1/containers/{}",
            account.endpoint.trim_end_matches('/'),
            id
        )
    }

    fn signed_container_url(
        &self,
        account: &StorageAccount,
        id: &str,
        writeable: bool,
        ttl: Duration,
    ) -> Result<(String, DateTime<Utc>)> {
        let key = self.delegation_key(account)?;
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let claims = AccessClaims {
            subject: id.to_string(),
            writeable,
            resource: ResourceType::Container,
            not_before: now,
            not_after: expires_at,
            generation: KeyGeneration::Primary,
        };
        let url = format!(
            "{}?{}",
            self.container_url(account, id),
            sign_query(&claims, &key.value)
        );
        Ok((url, expires_at))
    }

    /// Resolve a buffer id to its owning account, or `None` when the buffer
    /// row does not exist.
    fn resolve_account(&self, id: &str) -> Result<Option<&StorageAccount>> {
        match self.store.get_buffer(id) {
            Ok(buffer) => Ok(Some(self.account_by_id(buffer.account_id)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn container_exists(&self, url: &str, cancel: &Cancellation) -> Result<bool> {
        self.pipeline.run_cancellable(cancel, || {
            let response = self
                .http
                .head(url)
                .send()
                .map_err(|e| Error::transient(format!("existence check failed: {}", e)))?;
            match response.status().as_u16() {
                200 | 204 => Ok(true),
                // An invalid or unknown resource name reads as "does not
                // exist".
                400 | 404 => Ok(false),
                status => Err(Error::transient(format!(
                    "existence check returned {}",
                    status
                ))),
            }
        })
    }

    fn launcher(&self) -> Result<Arc<dyn SystemRunLauncher>> {
        self.launcher
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("system run launcher is not wired")))
    }

    fn copier_codespec(&self, args: Vec<String>, identity: Option<String>) -> CodespecDetails {
        CodespecDetails::Job(JobCodespec {
            common: CodespecCommon {
                image: self.copier_image.clone(),
                args: Some(args),
                identity,
                ..Default::default()
            },
            buffers: Default::default(),
        })
    }

    fn system_run(&self, codespec_name: &str) -> NewRun {
        NewRun {
            kind: RunKind::System,
            job: JobRunSpec {
                codespec: crate::types::CodespecRef {
                    name: codespec_name.to_string(),
                    version: None,
                },
                buffers: BTreeMap::new(),
                tags: None,
                replicas: 1,
            },
            worker: None,
            cluster: None,
            timeout_secs: None,
        }
    }
}

impl BufferProvider for CloudBufferProvider {
    fn create_buffer(&self, buffer: &Buffer, cancel: &Cancellation) -> Result<Buffer> {
        cancel.check()?;
        let account = self.place(&buffer.location)?;
        let (url, _) = self.signed_container_url(
            account,
            &buffer.id,
            true,
            self.lifetimes.default_access_ttl,
        )?;
        self.pipeline.run_cancellable(cancel, || {
            let response = self
                .http
                .put(&url)
                .send()
                .map_err(|e| Error::transient(format!("container create failed: {}", e)))?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().unwrap_or_default();
                if status.is_client_error() {
                    return Err(Error::fatal(format!(
                        "container create for {} rejected: {} {}",
                        buffer.id, status, body
                    )));
                }
                return Err(Error::transient(format!(
                    "container create for {} returned {}",
                    buffer.id, status
                )));
            }
            Ok(())
        })?;
        let mut placed = buffer.clone();
        placed.account_id = account.id;
        Ok(placed)
    }

    fn create_access_urls(
        &self,
        requests: &[AccessUrlRequest],
        options: &AccessUrlOptions,
        cancel: &Cancellation,
    ) -> Result<Vec<AccessUrlResponse>> {
        let ttl = self.lifetimes.clamp_access_ttl(options.ttl)?;
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            cancel.check()?;
            let access = match self.resolve_account(&request.id)? {
                None => None,
                Some(account) => {
                    let (url, expires_at) =
                        self.signed_container_url(account, &request.id, request.writeable, ttl)?;
                    if options.check_exists && !self.container_exists(&url, cancel)? {
                        None
                    } else {
                        Some(BufferAccess { url, expires_at })
                    }
                }
            };
            responses.push(AccessUrlResponse {
                id: request.id.clone(),
                writeable: request.writeable,
                access,
            });
        }
        Ok(responses)
    }

    fn delete_buffers(&self, ids: &[String], cancel: &Cancellation) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for id in ids {
            cancel.check()?;
            let Some(account) = self.resolve_account(id)? else {
                continue;
            };
            let (url, _) =
                self.signed_container_url(account, id, true, self.lifetimes.default_access_ttl)?;
            let deleted = self.pipeline.run_cancellable(cancel, || {
                let response = self
                    .http
                    .delete(&url)
                    .send()
                    .map_err(|e| Error::transient(format!("container delete failed: {}", e)))?;
                match response.status().as_u16() {
                    404 => Ok(false),
                    status if (200..300).contains(&status) => Ok(true),
                    status => Err(Error::transient(format!(
                        "container delete for {} returned {}",
                        id, status
                    ))),
                }
            })?;
            if deleted {
                removed.push(id.clone());
            }
        }
        Ok(removed)
    }

    fn try_mark_buffer_as_failed(&self, id: &str, cancel: &Cancellation) -> Result<()> {
        cancel.check()?;
        let Some(account) = self.resolve_account(id)? else {
            return Ok(());
        };
        let key = self.delegation_key(account)?;
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(self.lifetimes.default_access_ttl).unwrap_or_default();
        let claims = AccessClaims {
            subject: id.to_string(),
            writeable: true,
            resource: ResourceType::Blob,
            not_before: now,
            not_after: expires_at,
            generation: KeyGeneration::Primary,
        };
        let url = format!(
            "{}/{}?{}",
            self.container_url(account, id),
            FAILURE_TOMBSTONE_BLOB,
            sign_query(&claims, &key.value)
        );
        self.pipeline.run_cancellable(cancel, || {
            let response = self
                .http
                .put(&url)
                .header("If-None-Match", "*")
                .body(FAILURE_TOMBSTONE_BODY)
                .send()
                .map_err(|e| Error::transient(format!("tombstone upload failed: {}", e)))?;
            match response.status().as_u16() {
                // Somebody else already recorded an end state; leave it.
                412 => Ok(()),
                status if (200..300).contains(&status) => {
                    info!(buffer = id, "wrote failure tombstone");
                    Ok(())
                }
                status => {
                    warn!(buffer = id, status, "failed to write failure tombstone");
                    Err(Error::transient(format!(
                        "tombstone upload for {} returned {}",
                        id, status
                    )))
                }
            }
        })
    }

    fn export_buffers(&self, request: &ExportRequest, cancel: &Cancellation) -> Result<Run> {
        cancel.check()?;
        if request.destination_storage_endpoint.trim().is_empty() {
            return Err(Error::validation(
                "destinationStorageEndpoint must be set for an export",
            ));
        }
        let mut args = vec![
            "export".to_string(),
            "--destination".to_string(),
            request.destination_storage_endpoint.clone(),
        ];
        for (key, value) in &request.filters {
            args.push("--filter".to_string());
            args.push(format!("{}={}", key, value));
        }
        for account in &self.accounts {
            args.push("--source-account".to_string());
            args.push(account.endpoint.clone());
        }
        let details = self.copier_codespec(args, request.identity.clone());
        self.launcher()?.launch(
            "buffer-export",
            &details,
            self.system_run("buffer-export"),
            cancel,
        )
    }

    fn import_buffers(&self, request: &ImportRequest, cancel: &Cancellation) -> Result<Run> {
        cancel.check()?;
        if request.source_storage_endpoint.trim().is_empty() {
            return Err(Error::validation(
                "sourceStorageEndpoint must be set for an import",
            ));
        }
        let mut args = vec![
            "import".to_string(),
            "--source".to_string(),
            request.source_storage_endpoint.clone(),
        ];
        for account in &self.accounts {
            args.push("--destination-account".to_string());
            args.push(account.endpoint.clone());
        }
        let details = self.copier_codespec(args, request.identity.clone());
        self.launcher()?.launch(
            "buffer-import",
            &details,
            self.system_run("buffer-import"),
            cancel,
        )
    }

    fn list_storage_accounts(&self) -> Vec<StorageAccount> {
        self.accounts.clone()
    }
}
