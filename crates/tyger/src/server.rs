//! Control-plane process composition.
//!
//! [`ControlPlane::start`] builds every component out of a [`TygerConfig`],
//! wires the seams together (store, provider, manager, backend, run hosts),
//! and spawns the background loops: buffer deleter, run sweeper, run-secret
//! updater, delegation-key refresher, and the database-version cache
//! refresher. [`ControlPlane::shutdown`] cancels them and waits for the
//! current iterations to finish.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::info;

use crate::backend::ExecutionBackend;
use crate::backend::docker::DockerBackend;
use crate::backend::kubernetes::KubernetesBackend;
use crate::buffers::{BufferManager, EphemeralAccessProvider};
use crate::codespecs::CodespecManager;
use crate::config::{BackendKind, StorageKind, TygerConfig};
use crate::deleter::BufferDeleter;
use crate::error::{Error, Result};
use crate::logs::{BlobLogArchive, FileLogArchive, LogArchive};
use crate::pipeline::Pipeline;
use crate::provider::BufferProvider;
use crate::provider::cloud::{CloudBufferProvider, RestDelegationKeySource};
use crate::provider::local::{LOCAL_ACCOUNT_NAME, LOCAL_LOCATION, LocalBufferProvider};
use crate::runs::host::{DockerRunHost, KubernetesRunHost, socket_owner_uid};
use crate::runs::read::RunReader;
use crate::runs::secrets::RunSecretUpdater;
use crate::runs::sweeper::RunSweeper;
use crate::runs::update::RunUpdater;
use crate::runs::{RunHost, create::RunCreator};
use crate::shutdown::Cancellation;
use crate::store::migrations::DatabaseVersionCache;
use crate::store::postgres::PostgresStore;
use crate::store::MetadataStore;

const VERSION_CACHE_REFRESH: Duration = Duration::from_secs(60);

pub struct ControlPlane {
    cancel: Cancellation,
    handles: Vec<JoinHandle<()>>,
    pub store: Arc<dyn MetadataStore>,
    pub buffers: Arc<BufferManager>,
    pub codespecs: Arc<CodespecManager>,
    pub creator: Arc<RunCreator>,
    pub reader: Arc<RunReader>,
    pub updater: Arc<RunUpdater>,
    pub version_cache: DatabaseVersionCache,
}

impl ControlPlane {
    /// Build the control plane and start its background loops.
    pub fn start(config: &TygerConfig) -> Result<Self> {
        let cancel = Cancellation::new();
        let mut handles = Vec::new();

        // The resilience pipeline configured by `[retry]` wraps the
        // object-store and backend calls; database round-trips keep the
        // denser database profile.
        let pipeline = Pipeline::new(
            config.retry.to_strategy(),
            config.retry.per_failure.clone(),
        );

        let postgres = Arc::new(PostgresStore::connect(&config.database.url, None)?);
        let store: Arc<dyn MetadataStore> = postgres.clone();

        let version_cache = DatabaseVersionCache::new(0);
        handles.push(version_cache.spawn_refresher(
            postgres.clone(),
            VERSION_CACHE_REFRESH,
            cancel.clone(),
        ));

        // Providers own the buffer backing storage.
        let provider: Arc<dyn BufferProvider>;
        let ephemeral: Option<Arc<dyn EphemeralAccessProvider>>;
        let mut cloud_provider: Option<Arc<CloudBufferProvider>> = None;
        match config.storage.kind {
            StorageKind::Cloud => {
                let mut accounts = Vec::new();
                for account in &config.storage.accounts {
                    accounts.push(store.ensure_storage_account(
                        &account.name,
                        &account.location,
                        &account.endpoint,
                    )?);
                }
                let cloud = Arc::new(
                    CloudBufferProvider::new(
                        store.clone(),
                        accounts,
                        Arc::new(RestDelegationKeySource::new()?),
                        &config.storage,
                        config.buffers.clone(),
                    )?
                    .with_pipeline(pipeline.clone()),
                );
                handles.push(CloudBufferProvider::spawn_key_refresher(
                    cloud.clone(),
                    cancel.clone(),
                ));
                provider = cloud.clone();
                ephemeral = None;
                cloud_provider = Some(cloud);
            }
            StorageKind::Local => {
                let endpoint = config
                    .storage
                    .local
                    .tcp_endpoint
                    .clone()
                    .or_else(|| {
                        config
                            .storage
                            .local
                            .socket_path
                            .as_ref()
                            .map(|p| format!("http+unix://{}", p.display()))
                    })
                    .ok_or_else(|| {
                        Error::validation("local storage requires an endpoint")
                    })?;
                let account = store.ensure_storage_account(
                    LOCAL_ACCOUNT_NAME,
                    LOCAL_LOCATION,
                    &endpoint,
                )?;
                let local = Arc::new(
                    LocalBufferProvider::new(
                        store.clone(),
                        account,
                        &config.storage.local,
                        config.buffers.clone(),
                    )?
                    .with_pipeline(pipeline.clone()),
                );
                provider = local.clone();
                ephemeral = Some(local);
            }
        }

        let buffers = Arc::new(BufferManager::new(
            store.clone(),
            provider.clone(),
            ephemeral,
            config.buffers.clone(),
        ));
        let codespecs = Arc::new(CodespecManager::new(store.clone()));

        // Backend and run host.
        let backend: Arc<dyn ExecutionBackend>;
        let host: Arc<dyn RunHost>;
        let access_from_docker = config.backend.kind == BackendKind::Docker;
        match config.backend.kind {
            BackendKind::Docker => {
                let docker = Arc::new(DockerBackend::new().with_pipeline(pipeline.clone()));
                let sidecar_user = config
                    .storage
                    .local
                    .socket_path
                    .as_deref()
                    .and_then(socket_owner_uid);
                backend = docker.clone();
                host = Arc::new(DockerRunHost::new(
                    docker,
                    config.backend.clone(),
                    sidecar_user,
                ));
            }
            BackendKind::Kubernetes => {
                let kube = Arc::new(
                    KubernetesBackend::new(config.backend.namespace.clone())
                        .with_pipeline(pipeline.clone()),
                );
                backend = kube.clone();
                host = Arc::new(KubernetesRunHost::new(kube, config.backend.clone()));
            }
        }

        let creator = Arc::new(RunCreator::new(
            store.clone(),
            buffers.clone(),
            backend.clone(),
            host.clone(),
            config.buffers.clone(),
            config.backend.cluster.clone(),
            access_from_docker,
        ));
        // Export/import system runs are submitted through the creator.
        if let Some(cloud) = cloud_provider.take() {
            cloud.set_run_launcher(creator.clone());
        }

        let reader = Arc::new(RunReader::new(store.clone(), backend.clone()));
        let updater = Arc::new(RunUpdater::new(store.clone(), backend.clone(), host.clone()));

        let archive: Arc<dyn LogArchive> = match &config.logs.endpoint {
            Some(endpoint) => Arc::new(BlobLogArchive::new(endpoint.clone())?),
            None => Arc::new(FileLogArchive::new(config.logs.path.clone())),
        };

        let deleter = Arc::new(BufferDeleter::new(
            store.clone(),
            provider.clone(),
            config.buffers.clone(),
        ));
        handles.push(deleter.spawn(cancel.clone()));

        let sweeper = Arc::new(RunSweeper::new(
            store.clone(),
            backend.clone(),
            host.clone(),
            archive,
            config.runs.clone(),
        ));
        handles.push(sweeper.spawn(cancel.clone()));

        let secret_updater = Arc::new(RunSecretUpdater::new(
            store.clone(),
            buffers.clone(),
            host.clone(),
            config.buffers.clone(),
            access_from_docker,
            config.runs.secret_refresh_interval,
        ));
        handles.push(secret_updater.spawn(cancel.clone()));

        info!("control plane started");
        Ok(Self {
            cancel,
            handles,
            store,
            buffers,
            codespecs,
            creator,
            reader,
            updater,
            version_cache,
        })
    }

    /// Cancel the background loops and wait for their current iterations.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("control plane stopped");
    }
}
