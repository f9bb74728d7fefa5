//! Run creation: admission, buffer binding, and submission.
//!
//! Admission resolves and validates the codespec references against the
//! backend's capabilities; binding checks the supplied buffer map against
//! the codespec's declared parameters and mints a signed access URL per
//! binding; submission persists the run as pending, materializes the
//! backend objects through the run host, and stamps `resources_created`.
//! A backend rejection writes the tombstone, marks the run failed with the
//! backend's message, and surfaces a validation error to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::backend::ExecutionBackend;
use crate::buffers::{BufferManager, EphemeralBufferId};
use crate::config::BufferLifetimeConfig;
use crate::error::{Error, Result};
use crate::provider::{AccessUrlOptions, AccessUrlRequest, SystemRunLauncher};
use crate::shutdown::Cancellation;
use crate::store::{MetadataStore, RunSecretRecord};
use crate::types::{
    Codespec, CodespecDetails, CodespecRef, JobCodespec, NewRun, Run, RunKind, RunStatus,
    WorkerCodespec, validate_tags,
};

use super::RunHost;
use super::topology::BufferBinding;

/// Fraction of the access-URL lifetime after which the secret updater
/// refreshes it.
pub(crate) const REFRESH_FRACTION: f64 = 0.7;

pub struct RunCreator {
    store: Arc<dyn MetadataStore>,
    buffers: Arc<BufferManager>,
    backend: Arc<dyn ExecutionBackend>,
    host: Arc<dyn RunHost>,
    lifetimes: BufferLifetimeConfig,
    default_cluster: Option<String>,
    /// Whether sidecars reach the data plane across the container network
    /// boundary (single-host backend).
    access_from_docker: bool,
}

impl RunCreator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        buffers: Arc<BufferManager>,
        backend: Arc<dyn ExecutionBackend>,
        host: Arc<dyn RunHost>,
        lifetimes: BufferLifetimeConfig,
        default_cluster: Option<String>,
        access_from_docker: bool,
    ) -> Self {
        Self {
            store,
            buffers,
            backend,
            host,
            lifetimes,
            default_cluster,
            access_from_docker,
        }
    }

    /// Admit, bind, and submit a run.
    pub fn create_run(&self, new_run: &NewRun, cancel: &Cancellation) -> Result<Run> {
        cancel.check()?;

        let (job_codespec, job) = self.resolve_job_codespec(&new_run.job.codespec)?;
        let worker = self.admit_worker(new_run)?;
        self.admit_resources(&job, worker.as_ref().map(|(_, w)| w))?;
        self.admit_image(&job.common.image)?;
        if let Some(tags) = &new_run.job.tags {
            validate_tags(tags)?;
        }
        if new_run.job.replicas < 1 {
            return Err(Error::validation("job replicas must be at least 1"));
        }
        self.check_bindings(&job, &new_run.job.buffers)?;

        // Persist with normalized codespec references; scheduling state
        // starts at pending with no backend resources.
        let mut admitted = new_run.clone();
        admitted.job.codespec = job_codespec.qualified_ref();
        if let Some((worker_codespec, _)) = &worker {
            let worker_spec = admitted.worker.as_mut().expect("validated above");
            worker_spec.codespec = worker_codespec.qualified_ref();
        }
        if admitted.cluster.is_none() {
            admitted.cluster = self.default_cluster.clone();
        }
        let run = self.store.create_run(&admitted)?;

        let bindings = match self.bind_buffers(&run, &job, cancel) {
            Ok(bindings) => bindings,
            Err(e) => {
                let reason = e.to_string();
                let _ = self
                    .store
                    .update_run_status(run.id, RunStatus::Failed, Some(&reason));
                return Err(e);
            }
        };

        match self
            .host
            .materialize(&run, &job, worker.as_ref().map(|(_, w)| w), &bindings)
        {
            Ok(()) => {}
            Err(e) => {
                let reason = e.to_string();
                warn!(run = run.id, error = %reason, "backend creation failed");
                if let Err(te) = self.host.write_tombstone(run.id) {
                    warn!(run = run.id, error = %te, "failed to write tombstone");
                }
                self.mark_outputs_failed(&bindings, cancel);
                let _ = self
                    .store
                    .update_run_status(run.id, RunStatus::Failed, Some(&reason));
                return Err(Error::validation(reason));
            }
        }

        self.store.mark_resources_created(run.id)?;
        self.schedule_secret_refresh(run.id)?;

        let status = self.host.initial_status();
        let run = self.store.update_run_status(run.id, status, None)?;
        info!(run = run.id, status = %run.status, "run submitted");
        Ok(run)
    }

    fn resolve_job_codespec(&self, reference: &CodespecRef) -> Result<(Codespec, JobCodespec)> {
        let codespec = match self.store.get_codespec(&reference.name, reference.version) {
            Ok(codespec) => codespec,
            Err(Error::NotFound(msg)) => {
                return Err(Error::validation(format!("unknown codespec: {}", msg)));
            }
            Err(e) => return Err(e),
        };
        match &codespec.details {
            CodespecDetails::Job(job) => {
                let job = job.clone();
                Ok((codespec, job))
            }
            CodespecDetails::Worker(_) => Err(Error::validation(format!(
                "codespec {} is a worker codespec and cannot be a run's job",
                reference
            ))),
        }
    }

    fn admit_worker(&self, new_run: &NewRun) -> Result<Option<(Codespec, WorkerCodespec)>> {
        let Some(worker_spec) = &new_run.worker else {
            return Ok(None);
        };
        if !self.backend.capabilities().workers {
            return Err(Error::validation(
                "worker codespecs are not supported by this backend",
            ));
        }
        if worker_spec.replicas < 1 {
            return Err(Error::validation("worker replicas must be at least 1"));
        }
        let codespec = match self
            .store
            .get_codespec(&worker_spec.codespec.name, worker_spec.codespec.version)
        {
            Ok(codespec) => codespec,
            Err(Error::NotFound(msg)) => {
                return Err(Error::validation(format!("unknown codespec: {}", msg)));
            }
            Err(e) => return Err(e),
        };
        match &codespec.details {
            CodespecDetails::Worker(worker) => {
                let mut worker = worker.clone();
                worker.replicas = worker_spec.replicas;
                Ok(Some((codespec, worker)))
            }
            CodespecDetails::Job(_) => Err(Error::validation(format!(
                "codespec {} is a job codespec and cannot be a run's worker",
                worker_spec.codespec
            ))),
        }
    }

    fn admit_resources(
        &self,
        job: &JobCodespec,
        worker: Option<&WorkerCodespec>,
    ) -> Result<()> {
        let needs_gpu = job
            .common
            .resources
            .as_ref()
            .is_some_and(|r| r.needs_gpu())
            || worker.is_some_and(|w| {
                w.common.resources.as_ref().is_some_and(|r| r.needs_gpu())
            });
        if needs_gpu && !self.backend.capabilities().gpu {
            return Err(Error::validation(
                "GPU resources were requested but the backend has no GPU support",
            ));
        }
        Ok(())
    }

    fn admit_image(&self, image: &str) -> Result<()> {
        if !self.backend.image_exists(image)? {
            return Err(Error::validation(format!(
                "image {} is not present on the backend host",
                image
            )));
        }
        Ok(())
    }

    /// The supplied buffer map's key set must equal the declared
    /// input/output parameter names.
    fn check_bindings(&self, job: &JobCodespec, supplied: &BTreeMap<String, String>) -> Result<()> {
        for (name, _) in job.buffers.all() {
            if !supplied.contains_key(name) {
                return Err(Error::validation(format!(
                    "buffer parameter {:?} is not bound",
                    name
                )));
            }
        }
        let declared: std::collections::BTreeSet<&str> =
            job.buffers.all().map(|(name, _)| name).collect();
        for key in supplied.keys() {
            if !declared.contains(key.as_str()) {
                return Err(Error::validation(format!(
                    "{:?} is not a declared buffer parameter",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Mint one access URL per declared parameter, scoping bare ephemeral
    /// markers to the run.
    fn bind_buffers(
        &self,
        run: &Run,
        job: &JobCodespec,
        cancel: &Cancellation,
    ) -> Result<Vec<BufferBinding>> {
        let mut requests = Vec::new();
        let mut names = Vec::new();
        for (name, writeable) in job.buffers.all() {
            let supplied = run
                .job
                .buffers
                .get(name)
                .expect("bindings were checked during admission");
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
            check_exists: true,
            ttl: None,
        };
        let responses = self
            .buffers
            .create_buffer_access_urls(&requests, &options, cancel)?;

        let mut bindings = Vec::with_capacity(responses.len());
        for (name, response) in names.into_iter().zip(responses) {
            let Some(access) = response.access else {
                return Err(Error::validation(format!(
                    "buffer {} bound to parameter {:?} does not exist",
                    response.id, name
                )));
            };
            bindings.push(BufferBinding {
                name,
                buffer_id: response.id,
                writeable: response.writeable,
                access_url: access.url,
            });
        }
        Ok(bindings)
    }

    /// Best-effort failure tombstones for output buffers of a run that
    /// never started.
    fn mark_outputs_failed(&self, bindings: &[BufferBinding], cancel: &Cancellation) {
        for binding in bindings {
            if !binding.writeable || EphemeralBufferId::parse(&binding.buffer_id).is_some() {
                continue;
            }
            if let Err(e) = self
                .buffers
                .provider()
                .try_mark_buffer_as_failed(&binding.buffer_id, cancel)
            {
                warn!(buffer = %binding.buffer_id, error = %e,
                      "failed to mark output buffer as failed");
            }
        }
    }

    fn schedule_secret_refresh(&self, run_id: i64) -> Result<()> {
        let ttl = self.lifetimes.default_access_ttl;
        let now = Utc::now();
        let refresh_due = now
            + chrono::Duration::from_std(ttl.mul_f64(REFRESH_FRACTION)).unwrap_or_default();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.store.upsert_run_secret(&RunSecretRecord {
            run_id,
            refresh_due_at: refresh_due,
            expires_at,
        })
    }
}

impl SystemRunLauncher for RunCreator {
    fn launch(
        &self,
        codespec_name: &str,
        details: &CodespecDetails,
        mut new_run: NewRun,
        cancel: &Cancellation,
    ) -> Result<Run> {
        let codespec = self.store.create_codespec(codespec_name, details)?;
        new_run.kind = RunKind::System;
        new_run.job.codespec = codespec.qualified_ref();
        self.create_run(&new_run, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::buffers::EphemeralAccessProvider;
    use crate::provider::{
        AccessUrlResponse, BufferProvider, ExportRequest, ImportRequest,
    };
    use crate::store::memory::MemoryStore;
    use crate::types::{
        Buffer, BufferAccess, BufferParameters, CodespecCommon, JobRunSpec, ResourceSpec,
        StorageAccount, WorkerRunSpec,
    };
    use std::sync::Mutex;

    /// Provider that signs URLs for ids present in the store.
    struct StoreBackedProvider {
        store: Arc<MemoryStore>,
    }

    impl BufferProvider for StoreBackedProvider {
        fn create_buffer(&self, buffer: &Buffer, _cancel: &Cancellation) -> Result<Buffer> {
            Ok(buffer.clone())
        }

        fn create_access_urls(
            &self,
            requests: &[AccessUrlRequest],
            _options: &AccessUrlOptions,
            _cancel: &Cancellation,
        ) -> Result<Vec<AccessUrlResponse>> {
            Ok(requests
                .iter()
                .map(|r| AccessUrlResponse {
                    id: r.id.clone(),
                    writeable: r.writeable,
                    access: self.store.get_buffer(&r.id).ok().map(|_| BufferAccess {
                        url: format!("https://store/{}", r.id),
                        expires_at: Utc::now() + chrono::Duration::seconds(3600),
                    }),
                })
                .collect())
        }

        fn delete_buffers(&self, ids: &[String], _cancel: &Cancellation) -> Result<Vec<String>> {
            Ok(ids.to_vec())
        }

        fn try_mark_buffer_as_failed(&self, _id: &str, _cancel: &Cancellation) -> Result<()> {
            Ok(())
        }

        fn export_buffers(&self, _r: &ExportRequest, _c: &Cancellation) -> Result<Run> {
            unimplemented!()
        }

        fn import_buffers(&self, _r: &ImportRequest, _c: &Cancellation) -> Result<Run> {
            unimplemented!()
        }

        fn list_storage_accounts(&self) -> Vec<StorageAccount> {
            Vec::new()
        }
    }

    struct FakeEphemeralSigner;

    impl EphemeralAccessProvider for FakeEphemeralSigner {
        fn create_access_urls(
            &self,
            requests: &[AccessUrlRequest],
            _options: &AccessUrlOptions,
            _cancel: &Cancellation,
        ) -> Result<Vec<AccessUrlResponse>> {
            Ok(requests
                .iter()
                .map(|r| AccessUrlResponse {
                    id: r.id.clone(),
                    writeable: r.writeable,
                    access: Some(BufferAccess {
                        url: format!("https://ephemeral/{}", r.id),
                        expires_at: Utc::now() + chrono::Duration::seconds(3600),
                    }),
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        materialized: Mutex<Vec<(i64, Vec<BufferBinding>, bool)>>,
        tombstones: Mutex<Vec<i64>>,
        published: Mutex<Vec<(i64, BTreeMap<String, String>)>>,
        removed: Mutex<Vec<i64>>,
        fail_materialize: Mutex<Option<String>>,
    }

    impl RunHost for RecordingHost {
        fn materialize(
            &self,
            run: &Run,
            _job: &JobCodespec,
            worker: Option<&WorkerCodespec>,
            bindings: &[BufferBinding],
        ) -> Result<()> {
            if let Some(message) = self.fail_materialize.lock().unwrap().clone() {
                return Err(Error::fatal(message));
            }
            self.materialized.lock().unwrap().push((
                run.id,
                bindings.to_vec(),
                worker.is_some(),
            ));
            Ok(())
        }

        fn initial_status(&self) -> RunStatus {
            RunStatus::Running
        }

        fn publish_access_urls(
            &self,
            run_id: i64,
            urls: &BTreeMap<String, String>,
        ) -> Result<()> {
            self.published.lock().unwrap().push((run_id, urls.clone()));
            Ok(())
        }

        fn write_tombstone(&self, run_id: i64) -> Result<()> {
            self.tombstones.lock().unwrap().push(run_id);
            Ok(())
        }

        fn remove_run_objects(&self, run_id: i64) -> Result<()> {
            self.removed.lock().unwrap().push(run_id);
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        backend: Arc<FakeBackend>,
        host: Arc<RecordingHost>,
        creator: RunCreator,
    }

    fn fixture_with(gpu: bool, workers: bool) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let backend = Arc::new(FakeBackend::with_capabilities(gpu, workers));
        let host = Arc::new(RecordingHost::default());
        let provider = Arc::new(StoreBackedProvider {
            store: store.clone(),
        });
        let buffers = Arc::new(BufferManager::new(
            store.clone(),
            provider,
            Some(Arc::new(FakeEphemeralSigner)),
            BufferLifetimeConfig::default(),
        ));
        let creator = RunCreator::new(
            store.clone(),
            buffers,
            backend.clone(),
            host.clone(),
            BufferLifetimeConfig::default(),
            None,
            true,
        );
        Fixture {
            store,
            backend,
            host,
            creator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(false, false)
    }

    fn echo_codespec(store: &MemoryStore) -> Codespec {
        store
            .create_codespec(
                "echo",
                &CodespecDetails::Job(JobCodespec {
                    common: CodespecCommon {
                        image: "alpine".to_string(),
                        command: Some(vec![
                            "sh".to_string(),
                            "-c".to_string(),
                            "cat $INPUT_PIPE > $OUTPUT_PIPE".to_string(),
                        ]),
                        ..Default::default()
                    },
                    buffers: BufferParameters {
                        inputs: vec!["input".to_string()],
                        outputs: vec!["output".to_string()],
                    },
                }),
            )
            .unwrap()
    }

    fn seed_buffer(store: &MemoryStore, id: &str) {
        store
            .create_buffer(&Buffer {
                id: id.to_string(),
                created_at: Utc::now(),
                location: "eastus".to_string(),
                account_id: 1,
                tags: BTreeMap::new(),
                soft_deleted: false,
                expires_at: None,
                etag: "e".to_string(),
            })
            .unwrap();
    }

    fn echo_run(input: &str, output: &str) -> NewRun {
        let mut buffers = BTreeMap::new();
        buffers.insert("input".to_string(), input.to_string());
        buffers.insert("output".to_string(), output.to_string());
        NewRun {
            kind: RunKind::User,
            job: JobRunSpec {
                codespec: CodespecRef::parse("echo").unwrap(),
                buffers,
                tags: None,
                replicas: 1,
            },
            worker: None,
            cluster: None,
            timeout_secs: None,
        }
    }

    #[test]
    fn echo_run_is_admitted_bound_and_submitted() {
        let f = fixture();
        echo_codespec(&f.store);
        seed_buffer(&f.store, "bin");
        seed_buffer(&f.store, "bout");

        let run = f
            .creator
            .create_run(&echo_run("bin", "bout"), &Cancellation::new())
            .expect("create");

        assert_eq!(run.status, RunStatus::Running);
        assert!(run.resources_created);
        // The stored reference is normalized.
        assert_eq!(run.job.codespec.to_string(), "echo/versions/1");

        let materialized = f.host.materialized.lock().unwrap();
        let (run_id, bindings, has_worker) = &materialized[0];
        assert_eq!(*run_id, run.id);
        assert!(!has_worker);
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].name, "input");
        assert!(!bindings[0].writeable);
        assert_eq!(bindings[1].name, "output");
        assert!(bindings[1].writeable);
        assert!(bindings[0].access_url.contains("bin"));

        // A secret-refresh row was scheduled.
        let due = f
            .store
            .list_due_run_secrets(Utc::now() + chrono::Duration::hours(2))
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].run_id, run.id);
    }

    #[test]
    fn bare_name_resolves_latest_codespec_version() {
        let f = fixture();
        echo_codespec(&f.store);
        echo_codespec(&f.store);
        seed_buffer(&f.store, "bin");
        seed_buffer(&f.store, "bout");

        let run = f
            .creator
            .create_run(&echo_run("bin", "bout"), &Cancellation::new())
            .expect("create");
        assert_eq!(run.job.codespec.to_string(), "echo/versions/2");
    }

    #[test]
    fn unknown_codespec_is_a_validation_error() {
        let f = fixture();
        let err = f
            .creator
            .create_run(&echo_run("bin", "bout"), &Cancellation::new())
            .expect_err("unknown codespec");
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("unknown codespec"));
    }

    #[test]
    fn binding_key_set_must_match_declared_parameters() {
        let f = fixture();
        echo_codespec(&f.store);
        seed_buffer(&f.store, "bin");
        seed_buffer(&f.store, "bout");

        // Missing binding.
        let mut missing = echo_run("bin", "bout");
        missing.job.buffers.remove("output");
        let err = f
            .creator
            .create_run(&missing, &Cancellation::new())
            .expect_err("missing");
        assert!(err.to_string().contains("\"output\" is not bound"));

        // Extra binding.
        let mut extra = echo_run("bin", "bout");
        extra
            .job
            .buffers
            .insert("scratch".to_string(), "bx".to_string());
        let err = f
            .creator
            .create_run(&extra, &Cancellation::new())
            .expect_err("extra");
        assert!(err.to_string().contains("not a declared buffer parameter"));
    }

    #[test]
    fn missing_buffer_fails_the_run_with_validation() {
        let f = fixture();
        echo_codespec(&f.store);
        seed_buffer(&f.store, "bin");

        let err = f
            .creator
            .create_run(&echo_run("bin", "ghost"), &Cancellation::new())
            .expect_err("missing buffer");
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("ghost"));

        // The persisted run records the failure for the sweeper.
        let runs = f.store.list_runs(0, 10, None).unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(!runs[0].resources_created);
    }

    #[test]
    fn workers_require_backend_support() {
        let f = fixture();
        echo_codespec(&f.store);
        f.store
            .create_codespec(
                "workers",
                &CodespecDetails::Worker(WorkerCodespec {
                    common: CodespecCommon {
                        image: "contoso/worker:1".to_string(),
                        ..Default::default()
                    },
                    endpoints: BTreeMap::new(),
                    replicas: 2,
                }),
            )
            .unwrap();
        seed_buffer(&f.store, "bin");
        seed_buffer(&f.store, "bout");

        let mut run = echo_run("bin", "bout");
        run.worker = Some(WorkerRunSpec {
            codespec: CodespecRef::parse("workers").unwrap(),
            replicas: 2,
        });
        let err = f
            .creator
            .create_run(&run, &Cancellation::new())
            .expect_err("no workers on this backend");
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn worker_runs_pass_on_cluster_capable_backends() {
        let f = fixture_with(false, true);
        echo_codespec(&f.store);
        f.store
            .create_codespec(
                "workers",
                &CodespecDetails::Worker(WorkerCodespec {
                    common: CodespecCommon {
                        image: "contoso/worker:1".to_string(),
                        ..Default::default()
                    },
                    endpoints: BTreeMap::new(),
                    replicas: 1,
                }),
            )
            .unwrap();
        seed_buffer(&f.store, "bin");
        seed_buffer(&f.store, "bout");

        let mut new_run = echo_run("bin", "bout");
        new_run.worker = Some(WorkerRunSpec {
            codespec: CodespecRef::parse("workers").unwrap(),
            replicas: 3,
        });
        let run = f
            .creator
            .create_run(&new_run, &Cancellation::new())
            .expect("create");
        assert_eq!(
            run.worker.as_ref().unwrap().codespec.to_string(),
            "workers/versions/1"
        );
        let materialized = f.host.materialized.lock().unwrap();
        assert!(materialized[0].2, "worker passed to the host");
    }

    #[test]
    fn gpu_requests_require_gpu_capability() {
        let f = fixture();
        f.store
            .create_codespec(
                "gpu-job",
                &CodespecDetails::Job(JobCodespec {
                    common: CodespecCommon {
                        image: "alpine".to_string(),
                        resources: Some(ResourceSpec {
                            gpu: Some(1),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    buffers: BufferParameters::default(),
                }),
            )
            .unwrap();

        let mut new_run = echo_run("x", "y");
        new_run.job.codespec = CodespecRef::parse("gpu-job").unwrap();
        new_run.job.buffers.clear();
        let err = f
            .creator
            .create_run(&new_run, &Cancellation::new())
            .expect_err("no gpu");
        assert!(err.to_string().contains("GPU"));
    }

    #[test]
    fn missing_image_is_rejected_on_the_single_host() {
        let f = fixture();
        f.backend.images.lock().unwrap().push("other".to_string());
        echo_codespec(&f.store);
        seed_buffer(&f.store, "bin");
        seed_buffer(&f.store, "bout");

        let err = f
            .creator
            .create_run(&echo_run("bin", "bout"), &Cancellation::new())
            .expect_err("image absent");
        assert!(err.to_string().contains("not present"));
    }

    #[test]
    fn backend_rejection_fails_the_run_and_writes_a_tombstone() {
        let f = fixture();
        echo_codespec(&f.store);
        seed_buffer(&f.store, "bin");
        seed_buffer(&f.store, "bout");
        *f.host.fail_materialize.lock().unwrap() = Some("invalid mount".to_string());

        let err = f
            .creator
            .create_run(&echo_run("bin", "bout"), &Cancellation::new())
            .expect_err("backend rejected");
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("invalid mount"));

        let runs = f.store.list_runs(0, 10, None).unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(
            runs[0]
                .status_reason
                .as_deref()
                .unwrap()
                .contains("invalid mount")
        );
        assert!(!runs[0].resources_created);
        assert_eq!(*f.host.tombstones.lock().unwrap(), vec![runs[0].id]);
    }

    #[test]
    fn bare_ephemeral_markers_are_scoped_to_the_run() {
        let f = fixture();
        echo_codespec(&f.store);
        seed_buffer(&f.store, "bin");

        let run = f
            .creator
            .create_run(&echo_run("bin", "temp-scratch"), &Cancellation::new())
            .expect("create");

        let materialized = f.host.materialized.lock().unwrap();
        let bindings = &materialized[0].1;
        let output = bindings.iter().find(|b| b.name == "output").unwrap();
        assert_eq!(output.buffer_id, format!("run-{}-temp-scratch", run.id));
        assert!(output.access_url.contains("ephemeral"));
    }

    #[test]
    fn launcher_creates_a_system_codespec_and_run() {
        let f = fixture();
        let details = CodespecDetails::Job(JobCodespec {
            common: CodespecCommon {
                image: "tyger/buffer-copier:latest".to_string(),
                args: Some(vec!["export".to_string()]),
                ..Default::default()
            },
            buffers: BufferParameters::default(),
        });
        let new_run = NewRun {
            kind: RunKind::System,
            job: JobRunSpec {
                codespec: CodespecRef::parse("buffer-export").unwrap(),
                buffers: BTreeMap::new(),
                tags: None,
                replicas: 1,
            },
            worker: None,
            cluster: None,
            timeout_secs: None,
        };

        let run = f
            .creator
            .launch("buffer-export", &details, new_run, &Cancellation::new())
            .expect("launch");
        assert_eq!(run.kind, RunKind::System);
        assert_eq!(run.job.codespec.name, "buffer-export");
        assert!(f.store.get_codespec("buffer-export", Some(1)).is_ok());
    }
}
