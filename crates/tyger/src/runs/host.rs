//! Concrete run hosts.
//!
//! [`DockerRunHost`] materializes runs as labeled containers on a single
//! host, with pipes and access files under the run secrets directory.
//! [`KubernetesRunHost`] materializes runs as a pod (main plus sidecars),
//! an optional worker stateful set with its headless service, and a secret
//! carrying the access URLs.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::backend::{ExecutionBackend, LabelSelector};
use crate::backend::kubernetes::KubernetesBackend;
use crate::config::BackendConfig;
use crate::error::Result;
use crate::types::{JobCodespec, Run, RunStatus, WorkerCodespec};

use super::RunHost;
use super::topology::{
    BufferBinding, RunSecretsLayout, access_file_name, docker_main_spec, docker_sidecar_spec,
    pod_manifest, secret_name, worker_service_manifest, worker_statefulset_manifest,
};

/// The uid owning a Unix socket, as a `--user` value for sidecars so a
/// bind-mounted data-plane socket keeps its permissions.
#[cfg(unix)]
pub fn socket_owner_uid(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata(path).ok().map(|m| m.uid().to_string())
}

#[cfg(not(unix))]
pub fn socket_owner_uid(_path: &Path) -> Option<String> {
    None
}

pub struct DockerRunHost {
    backend: Arc<dyn ExecutionBackend>,
    config: BackendConfig,
    sidecar_user: Option<String>,
}

impl DockerRunHost {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        config: BackendConfig,
        sidecar_user: Option<String>,
    ) -> Self {
        Self {
            backend,
            config,
            sidecar_user,
        }
    }

    fn layout(&self, run_id: i64) -> RunSecretsLayout {
        RunSecretsLayout::new(&self.config.run_secrets_path, run_id)
    }
}

impl RunHost for DockerRunHost {
    fn materialize(
        &self,
        run: &Run,
        job: &JobCodespec,
        _worker: Option<&WorkerCodespec>,
        bindings: &[BufferBinding],
    ) -> Result<()> {
        let layout = self.layout(run.id);
        layout.create_dirs()?;
        #[cfg(unix)]
        layout.create_pipes(bindings)?;

        let urls: BTreeMap<String, String> = bindings
            .iter()
            .map(|b| (b.name.clone(), b.access_url.clone()))
            .collect();
        layout.write_access_files(&urls)?;

        // Sidecars first: each must own its pipe end before main opens the
        // other side. One main container per job replica.
        let mut created = Vec::new();
        for binding in bindings {
            let spec = docker_sidecar_spec(
                run,
                binding,
                &layout,
                &self.config.sidecar_image,
                self.sidecar_user.clone(),
            );
            created.push(self.backend.create_container(&spec)?);
        }
        for replica in 0..run.job.replicas.max(1) {
            let main_spec = docker_main_spec(run, job, bindings, &layout, replica);
            created.push(self.backend.create_container(&main_spec)?);
        }

        for id in &created {
            self.backend.start_container(id)?;
        }
        Ok(())
    }

    fn initial_status(&self) -> RunStatus {
        // Start acceptance is synchronous on the single host.
        RunStatus::Running
    }

    fn publish_access_urls(&self, run_id: i64, urls: &BTreeMap<String, String>) -> Result<()> {
        self.layout(run_id).write_access_files(urls)
    }

    fn write_tombstone(&self, run_id: i64) -> Result<()> {
        self.layout(run_id).write_tombstone()
    }

    fn remove_run_objects(&self, run_id: i64) -> Result<()> {
        let selector = LabelSelector::run(run_id);
        for state in self.backend.list_containers(&selector)? {
            if let Err(e) = self.backend.remove_container(&state.id) {
                warn!(run = run_id, container = %state.id, error = %e,
                      "failed to remove container");
                return Err(e);
            }
        }
        self.layout(run_id).remove()
    }
}

pub struct KubernetesRunHost {
    kube: Arc<KubernetesBackend>,
    config: BackendConfig,
}

impl KubernetesRunHost {
    pub fn new(kube: Arc<KubernetesBackend>, config: BackendConfig) -> Self {
        Self { kube, config }
    }

    fn secret_labels(run_id: i64) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(crate::backend::RUN_LABEL.to_string(), run_id.to_string());
        labels
    }

    fn secret_data(urls: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        urls.iter()
            .map(|(name, url)| (access_file_name(name), url.clone()))
            .collect()
    }
}

impl RunHost for KubernetesRunHost {
    fn materialize(
        &self,
        run: &Run,
        job: &JobCodespec,
        worker: Option<&WorkerCodespec>,
        bindings: &[BufferBinding],
    ) -> Result<()> {
        if let Some(worker) = worker {
            self.kube.apply_manifest(&worker_service_manifest(
                run,
                worker,
                self.kube.namespace(),
            ))?;
            self.kube.apply_manifest(&worker_statefulset_manifest(
                run,
                worker,
                self.kube.namespace(),
            ))?;
        }

        let urls: BTreeMap<String, String> = bindings
            .iter()
            .map(|b| (b.name.clone(), b.access_url.clone()))
            .collect();
        self.kube.update_secret(
            &secret_name(run.id),
            &Self::secret_labels(run.id),
            &Self::secret_data(&urls),
        )?;

        self.kube.apply_manifest(&pod_manifest(
            run,
            job,
            worker,
            bindings,
            self.kube.namespace(),
            &self.config.sidecar_image,
            &self.config.worker_waiter_image,
        ))
    }

    fn initial_status(&self) -> RunStatus {
        // The scheduler decides; the run stays pending until pods report.
        RunStatus::Pending
    }

    fn publish_access_urls(&self, run_id: i64, urls: &BTreeMap<String, String>) -> Result<()> {
        // The secret-mounted files update in place; sidecars re-read them.
        self.kube.update_secret(
            &secret_name(run_id),
            &Self::secret_labels(run_id),
            &Self::secret_data(urls),
        )
    }

    fn write_tombstone(&self, _run_id: i64) -> Result<()> {
        // Cluster sidecars share the pod lifecycle with main; termination is
        // observed through the kubelet, not a tombstone file.
        Ok(())
    }

    fn remove_run_objects(&self, run_id: i64) -> Result<()> {
        let selector = LabelSelector::run(run_id);
        self.kube.delete_by_selector("pods", &selector)?;
        self.kube.delete_by_selector("statefulsets", &selector)?;
        self.kube.delete_by_selector("services", &selector)?;
        self.kube.delete_by_selector("secrets", &selector)
    }
}
