//! Pure topology building blocks shared by both run hosts.
//!
//! Paths under the run secrets root, pipe and access-file naming, the
//! sidecar argument contract, `$(NAME)` environment expansion, and the
//! cluster manifest builders all live here so they can be tested without a
//! backend.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::backend::{CONTAINER_NAME_LABEL, ContainerSpec, Mount, RUN_LABEL};
use crate::error::{Error, Result};
use crate::types::{JobCodespec, Run, WorkerCodespec};

/// Mount points inside run containers.
pub const CONTAINER_PIPES_DIR: &str = "/run/tyger/pipes";
pub const CONTAINER_ACCESS_FILES_DIR: &str = "/run/tyger/access-files";
pub const CONTAINER_TOMBSTONE_DIR: &str = "/run/tyger/tombstone";
/// Name of the tombstone file within the tombstone directory.
pub const TOMBSTONE_FILE: &str = "tombstone";

/// One buffer parameter bound to a concrete buffer with a minted URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferBinding {
    /// Declared parameter name from the codespec.
    pub name: String,
    /// The bound buffer id (possibly an ephemeral marker).
    pub buffer_id: String,
    /// Output parameters are writeable.
    pub writeable: bool,
    /// Signed access URL.
    pub access_url: String,
}

/// Filesystem layout of a run's secrets on the single-host backend:
/// `<root>/<runId>/{pipes,access-files,tombstone}/`.
pub struct RunSecretsLayout {
    run_dir: PathBuf,
}

impl RunSecretsLayout {
    pub fn new(root: &Path, run_id: i64) -> Self {
        Self {
            run_dir: root.join(run_id.to_string()),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn pipes_dir(&self) -> PathBuf {
        self.run_dir.join("pipes")
    }

    pub fn access_files_dir(&self) -> PathBuf {
        self.run_dir.join("access-files")
    }

    pub fn tombstone_dir(&self) -> PathBuf {
        self.run_dir.join("tombstone")
    }

    pub fn tombstone_file(&self) -> PathBuf {
        self.tombstone_dir().join(TOMBSTONE_FILE)
    }

    pub fn pipe_path(&self, binding_name: &str) -> PathBuf {
        self.pipes_dir().join(binding_name)
    }

    pub fn access_file_path(&self, binding_name: &str) -> PathBuf {
        self.access_files_dir().join(access_file_name(binding_name))
    }

    pub fn create_dirs(&self) -> Result<()> {
        for dir in [
            self.pipes_dir(),
            self.access_files_dir(),
            self.tombstone_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Internal(anyhow::anyhow!("create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Create the named pipes sidecars and main share. Mode `0o777`: the
    /// main container runs as an arbitrary uid.
    #[cfg(unix)]
    pub fn create_pipes(&self, bindings: &[BufferBinding]) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;

        for binding in bindings {
            let path = self.pipe_path(&binding.name);
            if path.exists() {
                continue;
            }
            let cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
                .map_err(|_| Error::Internal(anyhow::anyhow!("pipe path contains NUL")))?;
            let rc = unsafe { libc::mkfifo(cstr.as_ptr(), 0o777) };
            if rc != 0 {
                return Err(Error::Internal(anyhow::anyhow!(
                    "mkfifo {}: {}",
                    path.display(),
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }

    /// Write each binding's access URL file, replacing atomically so
    /// sidecars never observe a torn URL.
    pub fn write_access_files(&self, urls: &BTreeMap<String, String>) -> Result<()> {
        for (name, url) in urls {
            let path = self.access_file_path(name);
            atomic_write(&path, url.as_bytes())?;
        }
        Ok(())
    }

    /// Atomically drop the tombstone file, signaling sidecars to flush and
    /// terminate.
    pub fn write_tombstone(&self) -> Result<()> {
        if !self.tombstone_dir().exists() {
            return Ok(());
        }
        atomic_write(&self.tombstone_file(), b"done\n")
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.run_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(anyhow::anyhow!(
                "remove {}: {}",
                self.run_dir.display(),
                e
            ))),
        }
    }
}

fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)
        .map_err(|e| Error::Internal(anyhow::anyhow!("write {}: {}", tmp.display(), e)))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Internal(anyhow::anyhow!("rename to {}: {}", path.display(), e)))?;
    Ok(())
}

/// Access files are `<name>.uri` under the access-files directory.
pub fn access_file_name(binding_name: &str) -> String {
    format!("{}.uri", binding_name)
}

/// Uppercase a buffer parameter name into its env-var stem:
/// `input` -> `INPUT`, `raw-data` -> `RAW_DATA`.
pub fn env_name(binding_name: &str) -> String {
    binding_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// The per-buffer environment exported to the main container.
pub fn binding_env(bindings: &[BufferBinding]) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for binding in bindings {
        let stem = env_name(&binding.name);
        env.insert(
            format!("{}_PIPE", stem),
            format!("{}/{}", CONTAINER_PIPES_DIR, binding.name),
        );
        env.insert(
            format!("{}_BUFFER_URI_FILE", stem),
            format!(
                "{}/{}",
                CONTAINER_ACCESS_FILES_DIR,
                access_file_name(&binding.name)
            ),
        );
    }
    env
}

/// Expand `$(NAME)` references against `env`; `$$` escapes a literal `$`.
/// Unknown references are left verbatim.
pub fn expand_variables(input: &str, env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('(') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c2 in chars.by_ref() {
                    if c2 == ')' {
                        closed = true;
                        break;
                    }
                    name.push(c2);
                }
                match env.get(&name) {
                    Some(value) if closed => out.push_str(value),
                    _ => {
                        out.push_str("$(");
                        out.push_str(&name);
                        if closed {
                            out.push(')');
                        }
                    }
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Expand every element of an optional command/args vector.
pub fn expand_all(elements: &Option<Vec<String>>, env: &BTreeMap<String, String>) -> Option<Vec<String>> {
    elements
        .as_ref()
        .map(|v| v.iter().map(|e| expand_variables(e, env)).collect())
}

/// Object names, shared by labels, containers, pods, and services.
pub fn run_object_name(run_id: i64) -> String {
    format!("tyger-run-{}", run_id)
}

/// Name of one main-container replica. Replica 0 keeps the bare name so
/// single-replica runs read naturally.
pub fn main_container_name(run_id: i64, replica: i32) -> String {
    if replica == 0 {
        format!("{}-main", run_object_name(run_id))
    } else {
        format!("{}-main-{}", run_object_name(run_id), replica)
    }
}

pub fn sidecar_container_name(run_id: i64, binding_name: &str) -> String {
    format!("{}-{}-sidecar", run_object_name(run_id), binding_name)
}

pub fn worker_set_name(run_id: i64) -> String {
    format!("{}-worker", run_object_name(run_id))
}

pub fn secret_name(run_id: i64) -> String {
    format!("{}-secrets", run_object_name(run_id))
}

pub fn run_labels(run_id: i64, container_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(RUN_LABEL.to_string(), run_id.to_string());
    labels.insert(
        CONTAINER_NAME_LABEL.to_string(),
        container_name.to_string(),
    );
    labels
}

/// The argument contract of the buffer sidecar: direction, access-URL file,
/// pipe path, and the tombstone to watch.
pub fn sidecar_args(binding: &BufferBinding) -> Vec<String> {
    vec![
        if binding.writeable { "write" } else { "read" }.to_string(),
        format!(
            "{}/{}",
            CONTAINER_ACCESS_FILES_DIR,
            access_file_name(&binding.name)
        ),
        format!("{}/{}", CONTAINER_PIPES_DIR, binding.name),
        "--tombstone".to_string(),
        format!("{}/{}", CONTAINER_TOMBSTONE_DIR, TOMBSTONE_FILE),
    ]
}

/// The main container's full environment: codespec env expanded against the
/// binding env, plus the binding env itself.
pub fn main_env(job: &JobCodespec, bindings: &[BufferBinding]) -> BTreeMap<String, String> {
    let mut env = binding_env(bindings);
    for (key, value) in &job.common.env {
        let expanded = expand_variables(value, &env);
        env.insert(key.clone(), expanded);
    }
    env
}

/// Single-host main container spec for one job replica.
pub fn docker_main_spec(
    run: &Run,
    job: &JobCodespec,
    bindings: &[BufferBinding],
    layout: &RunSecretsLayout,
    replica: i32,
) -> ContainerSpec {
    let env = main_env(job, bindings);
    ContainerSpec {
        name: main_container_name(run.id, replica),
        image: job.common.image.clone(),
        command: expand_all(&job.common.command, &env),
        args: expand_all(&job.common.args, &env),
        working_dir: job.common.working_dir.clone(),
        env,
        labels: run_labels(run.id, crate::backend::MAIN_CONTAINER_NAME),
        mounts: vec![Mount {
            source: layout.pipes_dir(),
            target: CONTAINER_PIPES_DIR.to_string(),
            read_only: false,
        }],
        user: None,
        gpu: job.common.resources.as_ref().and_then(|r| r.gpu),
    }
}

/// Single-host sidecar container spec for one binding.
pub fn docker_sidecar_spec(
    run: &Run,
    binding: &BufferBinding,
    layout: &RunSecretsLayout,
    sidecar_image: &str,
    user: Option<String>,
) -> ContainerSpec {
    ContainerSpec {
        name: sidecar_container_name(run.id, &binding.name),
        image: sidecar_image.to_string(),
        command: None,
        args: Some(sidecar_args(binding)),
        working_dir: None,
        env: BTreeMap::new(),
        labels: run_labels(run.id, &binding.name),
        mounts: vec![
            Mount {
                source: layout.pipes_dir(),
                target: CONTAINER_PIPES_DIR.to_string(),
                read_only: false,
            },
            Mount {
                source: layout.access_files_dir(),
                target: CONTAINER_ACCESS_FILES_DIR.to_string(),
                read_only: true,
            },
            Mount {
                source: layout.tombstone_dir(),
                target: CONTAINER_TOMBSTONE_DIR.to_string(),
                read_only: true,
            },
        ],
        user,
        gpu: None,
    }
}

/// Cluster pod manifest: main plus one sidecar per binding, pipes on a
/// shared volume, access URLs mounted read-only from the run secret, and a
/// worker-waiter init container when the run has workers.
pub fn pod_manifest(
    run: &Run,
    job: &JobCodespec,
    worker: Option<&WorkerCodespec>,
    bindings: &[BufferBinding],
    namespace: &str,
    sidecar_image: &str,
    worker_waiter_image: &str,
) -> serde_json::Value {
    let env = main_env(job, bindings);
    let env_json: Vec<serde_json::Value> = env
        .iter()
        .map(|(name, value)| serde_json::json!({"name": name, "value": value}))
        .collect();

    let volume_mounts = serde_json::json!([
        {"name": "pipes", "mountPath": CONTAINER_PIPES_DIR},
        {"name": "access-files", "mountPath": CONTAINER_ACCESS_FILES_DIR, "readOnly": true},
        {"name": "tombstone", "mountPath": CONTAINER_TOMBSTONE_DIR, "readOnly": true},
    ]);

    // One main container per job replica, sidecars co-scheduled with them.
    let mut containers = Vec::new();
    for replica in 0..run.job.replicas.max(1) {
        let name = if replica == 0 {
            crate::backend::MAIN_CONTAINER_NAME.to_string()
        } else {
            format!("{}-{}", crate::backend::MAIN_CONTAINER_NAME, replica)
        };
        let mut main = serde_json::json!({
            "name": name,
            "image": job.common.image,
            "env": env_json.clone(),
            "volumeMounts": volume_mounts.clone(),
        });
        if let Some(command) = expand_all(&job.common.command, &env) {
            main["command"] = serde_json::json!(command);
        }
        if let Some(args) = expand_all(&job.common.args, &env) {
            main["args"] = serde_json::json!(args);
        }
        if let Some(dir) = &job.common.working_dir {
            main["workingDir"] = serde_json::json!(dir);
        }
        if let Some(gpu) = job.common.resources.as_ref().and_then(|r| r.gpu) {
            main["resources"] =
                serde_json::json!({"limits": {"nvidia.com/gpu": gpu.to_string()}});
        }
        containers.push(main);
    }
    for binding in bindings {
        containers.push(serde_json::json!({
            "name": format!("{}-sidecar", binding.name),
            "image": sidecar_image,
            "args": sidecar_args(binding),
            "volumeMounts": volume_mounts.clone(),
        }));
    }

    let pipe_init_args = ["init-pipes"]
        .into_iter()
        .map(|s| s.to_string())
        .chain(bindings.iter().map(|b| format!("{}/{}", CONTAINER_PIPES_DIR, b.name)))
        .collect::<Vec<_>>();
    let mut init_containers: Vec<serde_json::Value> = vec![serde_json::json!({
        "name": "pipe-init",
        "image": sidecar_image,
        "args": pipe_init_args,
        "volumeMounts": [{"name": "pipes", "mountPath": CONTAINER_PIPES_DIR}],
    })];
    if let Some(worker) = worker {
        init_containers.push(serde_json::json!({
            "name": "worker-waiter",
            "image": worker_waiter_image,
            "args": [
                "--service".to_string(),
                worker_set_name(run.id),
                "--replicas".to_string(),
                worker.replicas.to_string(),
            ],
        }));
    }

    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": run_object_name(run.id),
            "namespace": namespace,
            "labels": run_labels(run.id, crate::backend::MAIN_CONTAINER_NAME),
        },
        "spec": {
            "restartPolicy": "Never",
            "initContainers": init_containers,
            "containers": containers,
            "volumes": [
                {"name": "pipes", "emptyDir": {}},
                {"name": "access-files", "secret": {"secretName": secret_name(run.id)}},
                {"name": "tombstone", "emptyDir": {}},
            ],
        },
    })
}

/// Cluster worker stateful set: N replicas addressable through the headless
/// service by stable DNS.
pub fn worker_statefulset_manifest(
    run: &Run,
    worker: &WorkerCodespec,
    namespace: &str,
) -> serde_json::Value {
    let name = worker_set_name(run.id);
    let labels = run_labels(run.id, "worker");
    let ports: Vec<serde_json::Value> = worker
        .endpoints
        .iter()
        .map(|(port_name, port)| serde_json::json!({"name": port_name, "containerPort": port}))
        .collect();

    let mut container = serde_json::json!({
        "name": "worker",
        "image": worker.common.image,
        "ports": ports,
        "env": worker
            .common
            .env
            .iter()
            .map(|(n, v)| serde_json::json!({"name": n, "value": v}))
            .collect::<Vec<_>>(),
    });
    if let Some(command) = &worker.common.command {
        container["command"] = serde_json::json!(command);
    }
    if let Some(args) = &worker.common.args {
        container["args"] = serde_json::json!(args);
    }

    serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "serviceName": name,
            "replicas": worker.replicas,
            "selector": {"matchLabels": labels},
            "template": {
                "metadata": {"labels": labels},
                "spec": {"containers": [container]},
            },
        },
    })
}

/// Headless service in front of the worker set.
pub fn worker_service_manifest(
    run: &Run,
    worker: &WorkerCodespec,
    namespace: &str,
) -> serde_json::Value {
    let name = worker_set_name(run.id);
    let labels = run_labels(run.id, "worker");
    let ports: Vec<serde_json::Value> = worker
        .endpoints
        .iter()
        .map(|(port_name, port)| serde_json::json!({"name": port_name, "port": port}))
        .collect();
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "clusterIP": "None",
            "selector": labels,
            "ports": ports,
        },
    })
}
