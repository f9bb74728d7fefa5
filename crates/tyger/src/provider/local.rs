//! Local buffer provider.
//!
//! A single data-plane process fronts every buffer container, reachable over
//! TCP or a Unix socket. The control plane signs short-lived access tokens
//! with a local private key; a secondary key can be configured so the key
//! can rotate without invalidating URLs already handed to sidecars. The data
//! plane verifies with [`super::sign::verify_query`], accepting both
//! generations.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::{BufferLifetimeConfig, LocalStorageConfig};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;
use crate::shutdown::Cancellation;
use crate::store::MetadataStore;
use crate::types::{Buffer, BufferAccess, Run, StorageAccount};

use super::sign::{AccessClaims, KeyGeneration, ResourceType, sign_query};
use super::{
    AccessUrlOptions, AccessUrlRequest, AccessUrlResponse, BufferProvider, ExportRequest,
    FAILURE_TOMBSTONE_BLOB, FAILURE_TOMBSTONE_BODY, ImportRequest,
};

/// Stable account record the local data plane presents. A single host has
/// exactly one logical account.
pub const LOCAL_ACCOUNT_NAME: &str = "local";
pub const LOCAL_LOCATION: &str = "local";

pub struct LocalBufferProvider {
    store: Arc<dyn MetadataStore>,
    account: StorageAccount,
    tcp_endpoint: Option<String>,
    socket_endpoint: Option<String>,
    docker_endpoint: Option<String>,
    primary_key: Vec<u8>,
    secondary_key: Option<Vec<u8>>,
    lifetimes: BufferLifetimeConfig,
    http: reqwest::blocking::Client,
    pipeline: Pipeline,
}

fn decode_key(encoded: &str, which: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::validation(format!("malformed {} signing key: {}", which, e)))
}

impl LocalBufferProvider {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        account: StorageAccount,
        config: &LocalStorageConfig,
        lifetimes: BufferLifetimeConfig,
    ) -> Result<Self> {
        let primary_key = decode_key(
            config
                .primary_key
                .as_deref()
                .ok_or_else(|| Error::validation("local storage requires a primary key"))?,
            "primary",
        )?;
        let secondary_key = config
            .secondary_key
            .as_deref()
            .map(|k| decode_key(k, "secondary"))
            .transpose()?;
        if config.tcp_endpoint.is_none() && config.socket_path.is_none() {
            return Err(Error::validation(
                "local storage requires a tcp_endpoint or a socket_path",
            ));
        }
        let socket_endpoint = config
            .socket_path
            .as_ref()
            .map(|p| format!("http+unix://{}", p.display()));
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(100))
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("build http client: {}", e)))?;
        Ok(Self {
            store,
            account,
            tcp_endpoint: config.tcp_endpoint.clone(),
            socket_endpoint,
            docker_endpoint: config.docker_endpoint.clone(),
            primary_key,
            secondary_key,
            lifetimes,
            http,
            pipeline: Pipeline::default(),
        })
    }

    /// Replace the retry pipeline data-plane calls run through.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Keys the data plane should verify against: primary first, then the
    /// rotating secondary.
    pub fn verification_keys(&self) -> (&[u8], Option<&[u8]>) {
        (&self.primary_key, self.secondary_key.as_deref())
    }

    /// The endpoint a caller should use, honoring transport preferences.
    fn endpoint_for(&self, options: &AccessUrlOptions) -> &str {
        if options.from_docker
            && let Some(endpoint) = &self.docker_endpoint
        {
            return endpoint;
        }
        match (&self.tcp_endpoint, &self.socket_endpoint) {
            (Some(tcp), Some(socket)) => {
                if options.prefer_tcp {
                    tcp
                } else {
                    socket
                }
            }
            (Some(tcp), None) => tcp,
            (None, Some(socket)) => socket,
            (None, None) => unreachable!("validated in the constructor"),
        }
    }

    /// The endpoint the control plane itself talks to; a Unix socket cannot
    /// be reached by the plain HTTP client, so TCP wins when available.
    fn control_endpoint(&self) -> &str {
        self.tcp_endpoint
            .as_deref()
            .or(self.socket_endpoint.as_deref())
            .expect("validated in the constructor")
    }

    fn signed_url(
        &self,
        endpoint: &str,
        id: &str,
        writeable: bool,
        ttl: Duration,
    ) -> (String, chrono::DateTime<Utc>) {
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
            "{}/v1/containers/{}?{}",
            endpoint.trim_end_matches('/'),
            id,
            sign_query(&claims, &self.primary_key)
        );
        (url, expires_at)
    }

    fn buffer_exists_in_store(&self, id: &str) -> Result<bool> {
        match self.store.get_buffer(id) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
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
                400 | 404 => Ok(false),
                status => Err(Error::transient(format!(
                    "existence check returned {}",
                    status
                ))),
            }
        })
    }
}

impl BufferProvider for LocalBufferProvider {
    fn create_buffer(&self, buffer: &Buffer, cancel: &Cancellation) -> Result<Buffer> {
        cancel.check()?;
        let (url, _) = self.signed_url(
            self.control_endpoint(),
            &buffer.id,
            true,
            self.lifetimes.default_access_ttl,
        );
        self.pipeline.run_cancellable(cancel, || {
            let response = self
                .http
                .put(&url)
                .send()
                .map_err(|e| Error::transient(format!("container create failed: {}", e)))?;
            if !response.status().is_success() {
                return Err(Error::transient(format!(
                    "container create for {} returned {}",
                    buffer.id,
                    response.status()
                )));
            }
            Ok(())
        })?;
        let mut placed = buffer.clone();
        placed.account_id = self.account.id;
        Ok(placed)
    }

    fn create_access_urls(
        &self,
        requests: &[AccessUrlRequest],
        options: &AccessUrlOptions,
        cancel: &Cancellation,
    ) -> Result<Vec<AccessUrlResponse>> {
        let ttl = self.lifetimes.clamp_access_ttl(options.ttl)?;
        let endpoint = self.endpoint_for(options);
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            cancel.check()?;
            let access = if !self.buffer_exists_in_store(&request.id)? {
                None
            } else {
                let (url, expires_at) =
                    self.signed_url(endpoint, &request.id, request.writeable, ttl);
                if options.check_exists {
                    // Existence is checked over the control endpoint even
                    // when the returned URL targets another transport.
                    let (check_url, _) = self.signed_url(
                        self.control_endpoint(),
                        &request.id,
                        false,
                        self.lifetimes.min_access_ttl,
                    );
                    if self.container_exists(&check_url, cancel)? {
                        Some(BufferAccess { url, expires_at })
                    } else {
                        None
                    }
                } else {
                    Some(BufferAccess { url, expires_at })
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
            let (url, _) = self.signed_url(
                self.control_endpoint(),
                id,
                true,
                self.lifetimes.default_access_ttl,
            );
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
            "{}/v1/containers/{}/{}?{}",
            self.control_endpoint().trim_end_matches('/'),
            id,
            FAILURE_TOMBSTONE_BLOB,
            sign_query(&claims, &self.primary_key)
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

    fn export_buffers(&self, _request: &ExportRequest, _cancel: &Cancellation) -> Result<Run> {
        Err(Error::validation(
            "export is not supported by the local buffer provider",
        ))
    }

    fn import_buffers(&self, _request: &ImportRequest, _cancel: &Cancellation) -> Result<Run> {
        Err(Error::validation(
            "import is not supported by the local buffer provider",
        ))
    }

    fn list_storage_accounts(&self) -> Vec<StorageAccount> {
        vec![self.account.clone()]
    }
}

/// Ephemeral buffers are containers the data plane materializes on first
/// write, so the signer skips the store lookup real buffers get.
impl crate::buffers::EphemeralAccessProvider for LocalBufferProvider {
    fn create_access_urls(
        &self,
        requests: &[AccessUrlRequest],
        options: &AccessUrlOptions,
        cancel: &Cancellation,
    ) -> Result<Vec<AccessUrlResponse>> {
        let ttl = self.lifetimes.clamp_access_ttl(options.ttl)?;
        let endpoint = self.endpoint_for(options);
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            cancel.check()?;
            let (url, expires_at) = self.signed_url(endpoint, &request.id, request.writeable, ttl);
            responses.push(AccessUrlResponse {
                id: request.id.clone(),
                writeable: request.writeable,
                access: Some(BufferAccess { url, expires_at }),
            });
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::sign::verify_query;
    use crate::store::memory::MemoryStore;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn key_b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn local_account() -> StorageAccount {
        StorageAccount {
            id: 1,
            name: LOCAL_ACCOUNT_NAME.to_string(),
            location: LOCAL_LOCATION.to_string(),
            endpoint: "http://127.0.0.1:2778".to_string(),
        }
    }

    fn config(primary: &[u8]) -> LocalStorageConfig {
        LocalStorageConfig {
            tcp_endpoint: Some("http://127.0.0.1:2778".to_string()),
            socket_path: Some(PathBuf::from("/var/run/tyger-data-plane.sock")),
            docker_endpoint: Some("http://host.docker.internal:2778".to_string()),
            primary_key: Some(key_b64(primary)),
            secondary_key: None,
        }
    }

    fn provider(store: Arc<dyn MetadataStore>) -> LocalBufferProvider {
        LocalBufferProvider::new(
            store,
            local_account(),
            &config(b"local-primary"),
            BufferLifetimeConfig::default(),
        )
        .expect("provider")
    }

    fn seeded_store(ids: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store
                .create_buffer(&Buffer {
                    id: id.to_string(),
                    created_at: Utc::now(),
                    location: LOCAL_LOCATION.to_string(),
                    account_id: 1,
                    tags: BTreeMap::new(),
                    soft_deleted: false,
                    expires_at: None,
                    etag: "e".to_string(),
                })
                .unwrap();
        }
        store
    }

    #[test]
    fn rejects_config_without_endpoints_or_key() {
        let store = Arc::new(MemoryStore::new());
        let mut bad = config(b"key");
        bad.tcp_endpoint = None;
        bad.socket_path = None;
        assert!(
            LocalBufferProvider::new(
                store.clone(),
                local_account(),
                &bad,
                BufferLifetimeConfig::default()
            )
            .is_err()
        );

        let mut no_key = config(b"key");
        no_key.primary_key = None;
        assert!(
            LocalBufferProvider::new(
                store,
                local_account(),
                &no_key,
                BufferLifetimeConfig::default()
            )
            .is_err()
        );
    }

    #[test]
    fn minted_urls_verify_with_the_primary_key() {
        let store = seeded_store(&["bufone"]);
        let provider = provider(store);

        let responses = provider
            .create_access_urls(
                &[AccessUrlRequest {
                    id: "bufone".to_string(),
                    writeable: true,
                }],
                &AccessUrlOptions {
                    prefer_tcp: true,
                    ..Default::default()
                },
                &Cancellation::new(),
            )
            .expect("urls");

        let access = responses[0].access.as_ref().expect("access");
        let (_, query) = access.url.split_once('?').expect("query");
        let claims = verify_query(query, b"local-primary", None, Utc::now()).expect("verify");
        assert_eq!(claims.subject, "bufone");
        assert!(claims.writeable);
    }

    #[test]
    fn transport_selection_honors_preferences() {
        let store = seeded_store(&["b"]);
        let provider = provider(store);

        let tcp = provider.endpoint_for(&AccessUrlOptions {
            prefer_tcp: true,
            ..Default::default()
        });
        assert!(tcp.starts_with("http://127.0.0.1"));

        let socket = provider.endpoint_for(&AccessUrlOptions::default());
        assert!(socket.starts_with("http+unix://"));

        let docker = provider.endpoint_for(&AccessUrlOptions {
            from_docker: true,
            ..Default::default()
        });
        assert!(docker.contains("host.docker.internal"));
    }

    #[test]
    fn unknown_buffer_gets_a_null_access() {
        let store = seeded_store(&[]);
        let provider = provider(store);
        let responses = provider
            .create_access_urls(
                &[AccessUrlRequest {
                    id: "absent".to_string(),
                    writeable: false,
                }],
                &AccessUrlOptions::default(),
                &Cancellation::new(),
            )
            .expect("urls");
        assert!(responses[0].access.is_none());
    }

    #[test]
    fn ephemeral_urls_are_signed_without_a_store_lookup() {
        use crate::buffers::EphemeralAccessProvider;

        let store = seeded_store(&[]);
        let provider = provider(store);
        let responses = EphemeralAccessProvider::create_access_urls(
            &provider,
            &[AccessUrlRequest {
                id: "run-7-temp-scratch".to_string(),
                writeable: true,
            }],
            &AccessUrlOptions {
                prefer_tcp: true,
                ..Default::default()
            },
            &Cancellation::new(),
        )
        .expect("urls");
        let access = responses[0].access.as_ref().expect("always signed");
        assert!(access.url.contains("/v1/containers/run-7-temp-scratch?"));
    }

    #[test]
    fn export_and_import_are_rejected() {
        let store = seeded_store(&[]);
        let provider = provider(store);
        assert!(matches!(
            provider.export_buffers(&ExportRequest::default(), &Cancellation::new()),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            provider.import_buffers(&ImportRequest::default(), &Cancellation::new()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn cancelled_token_aborts_the_batch() {
        let store = seeded_store(&["b"]);
        let provider = provider(store);
        let cancel = Cancellation::new();
        cancel.cancel();
        let err = provider
            .create_access_urls(
                &[AccessUrlRequest {
                    id: "b".to_string(),
                    writeable: false,
                }],
                &AccessUrlOptions::default(),
                &cancel,
            )
            .expect_err("cancelled");
        assert!(matches!(err, Error::Cancelled));
    }
}
