//! Cluster backend driving `kubectl`.
//!
//! Pods, stateful sets, services, and secrets are applied as JSON manifests
//! over stdin; everything run-owned carries the run label so discovery,
//! cancellation, and sweeping work by selector exactly as on the single-host
//! backend. The binary is overridable via `TYGER_KUBECTL_BIN`.

use std::collections::BTreeMap;
use std::env;
use std::io::{BufReader, Write};
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::logs::{LogChannel, NamedLogSource, ReaderLogSource};
use crate::pipeline::Pipeline;
use crate::process::{StreamingChild, run_command_with_timeout};
use crate::shutdown::Cancellation;

use super::{
    BackendCapabilities, BackendEvent, ContainerPhase, ContainerSpec, ContainerState,
    CONTAINER_NAME_LABEL, EventStream, ExecutionBackend, LabelSelector, LogRequest, RUN_LABEL,
    SystemInfo,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn kubectl_program() -> String {
    env::var("TYGER_KUBECTL_BIN").unwrap_or_else(|_| "kubectl".to_string())
}

fn selector_string(selector: &LabelSelector) -> String {
    selector
        .pairs
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("{}={}", key, value),
            None => key.clone(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Deserialize)]
struct Pod {
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Deserialize)]
struct PodMetadata {
    name: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(rename = "containerStatuses", default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Deserialize)]
struct ContainerStatus {
    name: String,
    #[serde(default)]
    state: ContainerStateDoc,
}

#[derive(Deserialize, Default)]
struct ContainerStateDoc {
    #[serde(default)]
    waiting: Option<WaitingState>,
    #[serde(default)]
    running: Option<serde_json::Value>,
    #[serde(default)]
    terminated: Option<TerminatedState>,
}

#[derive(Deserialize)]
struct WaitingState {
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct TerminatedState {
    #[serde(rename = "exitCode", default)]
    exit_code: i64,
}

fn container_states(pod: Pod) -> Vec<ContainerState> {
    let Pod { metadata, status } = pod;
    if status.container_statuses.is_empty() {
        // Scheduled but not started; surface the pod itself as created.
        return vec![ContainerState {
            id: metadata.name.clone(),
            name: metadata.name,
            labels: metadata.labels,
            phase: if status.phase == "Pending" || status.phase.is_empty() {
                ContainerPhase::Created
            } else {
                ContainerPhase::Unknown
            },
        }];
    }

    status
        .container_statuses
        .into_iter()
        .map(|cs| {
            let phase = if let Some(waiting) = &cs.state.waiting {
                ContainerPhase::Waiting {
                    reason: waiting.reason.clone(),
                }
            } else if let Some(terminated) = &cs.state.terminated {
                ContainerPhase::Exited {
                    code: terminated.exit_code,
                }
            } else if cs.state.running.is_some() {
                ContainerPhase::Running
            } else {
                ContainerPhase::Unknown
            };
            let mut labels = metadata.labels.clone();
            labels
                .entry(CONTAINER_NAME_LABEL.to_string())
                .or_insert_with(|| cs.name.clone());
            ContainerState {
                id: format!("{}/{}", metadata.name, cs.name),
                name: cs.name,
                labels,
                phase,
            }
        })
        .collect()
}

pub struct KubernetesBackend {
    namespace: String,
    cached_info: Mutex<Option<SystemInfo>>,
    pipeline: Pipeline,
}

impl KubernetesBackend {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            cached_info: Mutex::new(None),
            pipeline: Pipeline::default(),
        }
    }

    /// Replace the retry pipeline API-server calls run through.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Run a kubectl subcommand through the resilience pipeline; transient
    /// API-server failures retry with backoff.
    fn kubectl(&self, args: &[&str]) -> Result<String> {
        self.pipeline.run(|| self.kubectl_once(args))
    }

    fn kubectl_once(&self, args: &[&str]) -> Result<String> {
        let program = kubectl_program();
        let mut full: Vec<&str> = vec!["--namespace", &self.namespace];
        full.extend_from_slice(args);
        let out = run_command_with_timeout(&program, &full, Some(REQUEST_TIMEOUT))
            .map_err(|e| Error::transient(format!("{:#}", e)))?;
        if !out.success() {
            let stderr = out.stderr.trim();
            if stderr.contains("NotFound") || stderr.contains("not found") {
                return Err(Error::not_found(stderr.to_string()));
            }
            if out.timed_out {
                return Err(Error::transient(stderr.to_string()));
            }
            return Err(Error::fatal(format!(
                "kubectl {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr
            )));
        }
        Ok(out.stdout)
    }

    /// Apply a JSON manifest over stdin.
    pub fn apply_manifest(&self, manifest: &serde_json::Value) -> Result<()> {
        self.pipeline.run(|| self.apply_manifest_once(manifest))
    }

    fn apply_manifest_once(&self, manifest: &serde_json::Value) -> Result<()> {
        let mut child = Command::new(kubectl_program())
            .args(["--namespace", &self.namespace, "apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::transient(format!("failed to spawn kubectl apply: {}", e)))?;
        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| Error::Internal(anyhow::anyhow!("kubectl stdin not captured")))?;
            stdin
                .write_all(manifest.to_string().as_bytes())
                .map_err(|e| Error::transient(format!("failed to write manifest: {}", e)))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| Error::transient(format!("kubectl apply failed: {}", e)))?;
        if !output.status.success() {
            return Err(Error::fatal(format!(
                "kubectl apply rejected the manifest: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Delete every object of a kind matching the selector.
    pub fn delete_by_selector(&self, kind: &str, selector: &LabelSelector) -> Result<()> {
        let selector = selector_string(selector);
        self.kubectl(&[
            "delete",
            kind,
            "--selector",
            &selector,
            "--ignore-not-found",
            "--wait=false",
        ])
        .map(|_| ())
    }

    /// Create or replace a secret's payload.
    pub fn update_secret(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": labels,
            },
            "type": "Opaque",
            "stringData": data,
        });
        self.apply_manifest(&manifest)
    }

    /// Number of ready endpoints behind a service, from its endpoint slices.
    pub fn ready_endpoint_count(&self, service: &str) -> Result<usize> {
        #[derive(Deserialize)]
        struct SliceList {
            #[serde(default)]
            items: Vec<Slice>,
        }
        #[derive(Deserialize)]
        struct Slice {
            #[serde(default)]
            endpoints: Vec<Endpoint>,
        }
        #[derive(Deserialize)]
        struct Endpoint {
            #[serde(default)]
            conditions: Conditions,
        }
        #[derive(Deserialize, Default)]
        struct Conditions {
            #[serde(default)]
            ready: Option<bool>,
        }

        let selector = format!("kubernetes.io/service-name={}", service);
        let raw = self.kubectl(&["get", "endpointslices", "--selector", &selector, "-o", "json"])?;
        let list: SliceList = serde_json::from_str(raw.trim())
            .map_err(|e| Error::transient(format!("malformed endpointslice list: {}", e)))?;
        Ok(list
            .items
            .iter()
            .flat_map(|s| s.endpoints.iter())
            .filter(|e| e.conditions.ready.unwrap_or(false))
            .count())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pod_name(id: &str) -> &str {
        id.split('/').next().unwrap_or(id)
    }
}

impl ExecutionBackend for KubernetesBackend {
    fn capabilities(&self) -> BackendCapabilities {
        // Worker sets are a cluster feature; GPU pools are resolved at
        // scheduling time by node selectors.
        BackendCapabilities {
            gpu: true,
            workers: true,
        }
    }

    fn get_system_info(&self) -> Result<SystemInfo> {
        if let Some(info) = self.cached_info.lock().unwrap().clone() {
            return Ok(info);
        }

        #[derive(Deserialize)]
        struct VersionDoc {
            #[serde(rename = "serverVersion", default)]
            server_version: Option<ServerVersion>,
        }
        #[derive(Deserialize)]
        struct ServerVersion {
            #[serde(rename = "gitVersion", default)]
            git_version: String,
        }

        let raw = self.kubectl(&["version", "-o", "json"])?;
        let parsed: VersionDoc = serde_json::from_str(raw.trim())
            .map_err(|e| Error::transient(format!("malformed version output: {}", e)))?;
        let info = SystemInfo {
            name: self.namespace.clone(),
            version: parsed
                .server_version
                .map(|v| v.git_version)
                .unwrap_or_default(),
            gpu: true,
        };
        *self.cached_info.lock().unwrap() = Some(info.clone());
        Ok(info)
    }

    fn image_exists(&self, _image: &str) -> Result<bool> {
        // Images are pulled by the kubelet at scheduling time; admission
        // cannot see node-local caches.
        Ok(true)
    }

    fn list_containers(&self, selector: &LabelSelector) -> Result<Vec<ContainerState>> {
        let selector = selector_string(selector);
        let raw = self.kubectl(&["get", "pods", "--selector", &selector, "-o", "json"])?;
        let list: PodList = serde_json::from_str(raw.trim())
            .map_err(|e| Error::transient(format!("malformed pod list: {}", e)))?;
        Ok(list.items.into_iter().flat_map(container_states).collect())
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut container = serde_json::json!({
            "name": spec.name,
            "image": spec.image,
            "env": spec
                .env
                .iter()
                .map(|(name, value)| serde_json::json!({"name": name, "value": value}))
                .collect::<Vec<_>>(),
        });
        if let Some(command) = &spec.command {
            container["command"] = serde_json::json!(command);
        }
        if let Some(args) = &spec.args {
            container["args"] = serde_json::json!(args);
        }
        if let Some(dir) = &spec.working_dir {
            container["workingDir"] = serde_json::json!(dir);
        }
        if let Some(gpu) = spec.gpu {
            container["resources"] =
                serde_json::json!({"limits": {"nvidia.com/gpu": gpu.to_string()}});
        }

        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": spec.name,
                "namespace": self.namespace,
                "labels": spec.labels,
            },
            "spec": {
                "restartPolicy": "Never",
                "containers": [container],
            },
        });
        self.apply_manifest(&manifest)?;
        Ok(spec.name.clone())
    }

    fn start_container(&self, _id: &str) -> Result<()> {
        // Pods start when applied.
        Ok(())
    }

    fn kill_container(&self, id: &str) -> Result<()> {
        self.kubectl(&[
            "delete",
            "pod",
            Self::pod_name(id),
            "--grace-period=0",
            "--force",
            "--wait=false",
        ])
        .map(|_| ())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        match self.kubectl(&[
            "delete",
            "pod",
            Self::pod_name(id),
            "--ignore-not-found",
            "--wait=false",
        ]) {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerState> {
        let pod_name = Self::pod_name(id);
        let raw = self.kubectl(&["get", "pod", pod_name, "-o", "json"])?;
        let pod: Pod = serde_json::from_str(raw.trim())
            .map_err(|e| Error::transient(format!("malformed pod: {}", e)))?;
        let states = container_states(pod);
        states
            .into_iter()
            .find(|s| s.id == id || s.name == Self::pod_name(id))
            .ok_or_else(|| Error::not_found(format!("container {}", id)))
    }

    fn monitor_events(
        &self,
        selector: &LabelSelector,
        cancel: &Cancellation,
    ) -> Result<EventStream> {
        let selector_arg = selector_string(selector);
        let run_id = selector.pairs.iter().find_map(|(key, value)| {
            if key == RUN_LABEL {
                value.as_ref().and_then(|v| v.parse().ok())
            } else {
                None
            }
        });
        let args: [&str; 10] = [
            "--namespace",
            &self.namespace,
            "get",
            "pods",
            "--selector",
            &selector_arg,
            "--watch",
            "--output",
            "name",
            "--no-headers",
        ];
        let mut child = StreamingChild::spawn(&kubectl_program(), &args)
            .map_err(|e| Error::transient(format!("{:#}", e)))?;

        let (sender, receiver) = std::sync::mpsc::channel();
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let line = match child.next_line() {
                    Ok(Some(line)) => line,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(error = %e, "pod watch read failed");
                        return;
                    }
                };
                if line.is_empty() {
                    continue;
                }
                let event = BackendEvent {
                    run_id,
                    object: line,
                    action: "modified".to_string(),
                };
                if sender.send(event).is_err() {
                    return;
                }
            }
        });

        Ok(EventStream { receiver })
    }

    fn get_container_logs(
        &self,
        id: &str,
        container_name: &str,
        request: &LogRequest,
    ) -> Result<Vec<NamedLogSource>> {
        let pod_name = Self::pod_name(id);
        let mut args: Vec<String> = vec![
            "--namespace".to_string(),
            self.namespace.clone(),
            "logs".to_string(),
            pod_name.to_string(),
            "--container".to_string(),
            container_name.to_string(),
        ];
        if request.timestamps {
            args.push("--timestamps".to_string());
        }
        if request.follow {
            args.push("--follow".to_string());
        }
        if let Some(tail) = request.tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        if let Some(since) = request.since {
            args.push(format!("--since-time={}", since.to_rfc3339()));
        }

        let mut child = Command::new(kubectl_program())
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::transient(format!("failed to spawn kubectl logs: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("kubectl stdout not captured")))?;

        struct PodLogSource {
            inner: ReaderLogSource<BufReader<std::process::ChildStdout>>,
            child: std::process::Child,
        }

        impl crate::logs::LogSource for PodLogSource {
            fn next_line(&mut self) -> Result<Option<crate::logs::LogLine>> {
                self.inner.next_line()
            }
        }

        impl Drop for PodLogSource {
            fn drop(&mut self) {
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }

        // The kubelet merges stdout and stderr into one stream.
        Ok(vec![NamedLogSource {
            container: container_name.to_string(),
            channel: LogChannel::Stdout,
            source: Box::new(PodLogSource {
                inner: ReaderLogSource::new(BufReader::new(stdout)),
                child,
            }),
        }])
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    struct EnvGuard {
        key: String,
        old: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let old = env::var(key).ok();
            unsafe { env::set_var(key, value) };
            Self {
                key: key.to_string(),
                old,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(v) = &self.old {
                unsafe { env::set_var(&self.key, v) };
            } else {
                unsafe { env::remove_var(&self.key) };
            }
        }
    }

    fn write_fake_kubectl(bin_dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = bin_dir.join("kubectl");
        fs::write(
            &path,
            "#!/usr/bin/env sh\n\
             printf '%s' \"$*\" >>\"$TYGER_FAKE_DIR/args.log\"\n\
             printf '\\n' >>\"$TYGER_FAKE_DIR/args.log\"\n\
             # subcommand follows the --namespace pair\n\
             sub=\"$3\"\n\
             if [ \"$sub\" = apply ]; then cat - >\"$TYGER_FAKE_DIR/manifest.json\"; fi\n\
             if [ -f \"$TYGER_FAKE_DIR/$sub.out\" ]; then cat \"$TYGER_FAKE_DIR/$sub.out\"; fi\n\
             exit \"${TYGER_FAKE_EXIT:-0}\"\n",
        )
        .expect("write fake kubectl");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path
    }

    fn fake_env(td: &Path) -> (EnvGuard, EnvGuard, PathBuf) {
        let bin = td.join("bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let fake = write_fake_kubectl(&bin);
        let fake_dir = td.join("fake");
        fs::create_dir_all(&fake_dir).expect("mkdir fake");
        (
            EnvGuard::set("TYGER_KUBECTL_BIN", fake.to_str().expect("utf8")),
            EnvGuard::set("TYGER_FAKE_DIR", fake_dir.to_str().expect("utf8")),
            fake_dir,
        )
    }

    const POD_LIST: &str = r#"{
        "items": [{
            "metadata": {
                "name": "tyger-run-7",
                "labels": {"tyger-run": "7"}
            },
            "status": {
                "phase": "Running",
                "containerStatuses": [
                    {"name": "main", "state": {"running": {}}},
                    {"name": "sidecar-input",
                     "state": {"terminated": {"exitCode": 0}}},
                    {"name": "sidecar-output",
                     "state": {"waiting": {"reason": "PodInitializing"}}}
                ]
            }
        }]
    }"#;

    #[test]
    fn selector_string_renders_pairs_and_presence() {
        let selector = LabelSelector::run(7).and("role", "main");
        assert_eq!(selector_string(&selector), "tyger-run=7,role=main");
        assert_eq!(selector_string(&LabelSelector::any_run()), "tyger-run");
    }

    #[test]
    fn pod_statuses_become_container_states() {
        let list: PodList = serde_json::from_str(POD_LIST).expect("parse");
        let states: Vec<ContainerState> =
            list.items.into_iter().flat_map(container_states).collect();

        assert_eq!(states.len(), 3);
        assert_eq!(states[0].name, "main");
        assert_eq!(states[0].phase, ContainerPhase::Running);
        assert_eq!(states[0].run_id(), Some(7));
        assert_eq!(states[0].role(), Some("main"));
        assert_eq!(states[1].phase, ContainerPhase::Exited { code: 0 });
        assert!(matches!(
            &states[2].phase,
            ContainerPhase::Waiting { reason } if reason == "PodInitializing"
        ));
    }

    #[test]
    fn pod_without_statuses_reads_as_created() {
        let raw = r#"{"items": [{"metadata": {"name": "p", "labels": {}},
                      "status": {"phase": "Pending"}}]}"#;
        let list: PodList = serde_json::from_str(raw).expect("parse");
        let states: Vec<ContainerState> =
            list.items.into_iter().flat_map(container_states).collect();
        assert_eq!(states[0].phase, ContainerPhase::Created);
    }

    #[test]
    #[serial]
    fn list_containers_queries_by_selector() {
        let td = tempdir().expect("tempdir");
        let (_a, _b, fake_dir) = fake_env(td.path());
        fs::write(fake_dir.join("get.out"), POD_LIST).unwrap();

        let backend = KubernetesBackend::new("tyger");
        let states = backend
            .list_containers(&LabelSelector::run(7))
            .expect("list");
        assert_eq!(states.len(), 3);

        let args = fs::read_to_string(fake_dir.join("args.log")).unwrap();
        assert!(args.contains("--namespace tyger get pods --selector tyger-run=7 -o json"));
    }

    #[test]
    #[serial]
    fn create_container_applies_a_pod_manifest() {
        let td = tempdir().expect("tempdir");
        let (_a, _b, fake_dir) = fake_env(td.path());

        let backend = KubernetesBackend::new("tyger");
        let mut spec = ContainerSpec {
            name: "tyger-run-7-main".to_string(),
            image: "alpine".to_string(),
            command: Some(vec!["sh".to_string()]),
            gpu: Some(1),
            ..Default::default()
        };
        spec.labels
            .insert("tyger-run".to_string(), "7".to_string());

        let id = backend.create_container(&spec).expect("create");
        assert_eq!(id, "tyger-run-7-main");

        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(fake_dir.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["kind"], "Pod");
        assert_eq!(manifest["metadata"]["labels"]["tyger-run"], "7");
        assert_eq!(manifest["spec"]["containers"][0]["image"], "alpine");
        assert_eq!(
            manifest["spec"]["containers"][0]["resources"]["limits"]["nvidia.com/gpu"],
            "1"
        );
    }

    #[test]
    #[serial]
    fn update_secret_applies_string_data() {
        let td = tempdir().expect("tempdir");
        let (_a, _b, fake_dir) = fake_env(td.path());

        let backend = KubernetesBackend::new("tyger");
        let mut labels = BTreeMap::new();
        labels.insert("tyger-run".to_string(), "7".to_string());
        let mut data = BTreeMap::new();
        data.insert("input.url".to_string(), "https://signed".to_string());
        backend
            .update_secret("tyger-run-7-secrets", &labels, &data)
            .expect("secret");

        let manifest: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(fake_dir.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["kind"], "Secret");
        assert_eq!(manifest["stringData"]["input.url"], "https://signed");
    }

    #[test]
    fn cluster_capabilities_allow_gpu_and_workers() {
        let backend = KubernetesBackend::new("tyger");
        let caps = backend.capabilities();
        assert!(caps.gpu);
        assert!(caps.workers);
    }
}
