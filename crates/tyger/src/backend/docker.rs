//! Single-host backend driving the `docker` CLI.
//!
//! The binary is overridable via `TYGER_DOCKER_BIN` so tests can substitute
//! a fake. Every request runs with a 60 second timeout; event and log
//! streams are child processes whose stdout is consumed line by line.

use std::collections::BTreeMap;
use std::env;
use std::io::BufReader;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::logs::{LogChannel, LogLine, LogSource, NamedLogSource, ReaderLogSource};
use crate::pipeline::Pipeline;
use crate::process::{StreamingChild, run_command_with_timeout};
use crate::shutdown::Cancellation;

use super::{
    BackendCapabilities, BackendEvent, ContainerPhase, ContainerSpec, ContainerState,
    EventStream, ExecutionBackend, LabelSelector, LogRequest, RUN_LABEL, SystemInfo,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn docker_program() -> String {
    env::var("TYGER_DOCKER_BIN").unwrap_or_else(|_| "docker".to_string())
}

/// One docker invocation, surfacing a non-zero exit as an error.
fn docker_once(args: &[&str]) -> Result<String> {
    let program = docker_program();
    let out = run_command_with_timeout(&program, args, Some(REQUEST_TIMEOUT))
        .map_err(|e| Error::transient(format!("{:#}", e)))?;
    if !out.success() {
        let stderr = out.stderr.trim();
        // The engine reports bad specs and missing images on stderr with a
        // zero-information exit code; classify by message.
        if stderr.contains("No such") || stderr.contains("not found") {
            return Err(Error::not_found(stderr.to_string()));
        }
        if out.timed_out {
            return Err(Error::transient(stderr.to_string()));
        }
        return Err(Error::fatal(format!(
            "docker {} failed: {}",
            args.first().copied().unwrap_or(""),
            stderr
        )));
    }
    Ok(out.stdout)
}

fn selector_filters(selector: &LabelSelector) -> Vec<String> {
    selector
        .pairs
        .iter()
        .map(|(key, value)| match value {
            Some(value) => format!("label={}={}", key, value),
            None => format!("label={}", key),
        })
        .collect()
}

#[derive(Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Config", default)]
    config: InspectConfig,
    #[serde(rename = "State", default)]
    state: InspectState,
}

#[derive(Deserialize, Default)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: BTreeMap<String, String>,
}

#[derive(Deserialize, Default)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: i64,
    #[serde(rename = "Error", default)]
    error: String,
}

/// Map the engine's state record onto the resolution phases.
fn phase_from_state(status: &str, exit_code: i64, error: &str) -> ContainerPhase {
    match status {
        "created" => ContainerPhase::Created,
        "running" | "paused" => ContainerPhase::Running,
        "exited" | "dead" => ContainerPhase::Exited { code: exit_code },
        "restarting" => ContainerPhase::Waiting {
            reason: if error.is_empty() {
                "restarting".to_string()
            } else {
                error.to_string()
            },
        },
        _ => ContainerPhase::Unknown,
    }
}

impl From<InspectEntry> for ContainerState {
    fn from(entry: InspectEntry) -> Self {
        ContainerState {
            id: entry.id,
            name: entry.name.trim_start_matches('/').to_string(),
            labels: entry.config.labels,
            phase: phase_from_state(
                &entry.state.status,
                entry.state.exit_code,
                &entry.state.error,
            ),
        }
    }
}

#[derive(Deserialize)]
struct EventEntry {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "id", default)]
    id: String,
    #[serde(rename = "Actor", default)]
    actor: EventActor,
}

#[derive(Deserialize, Default)]
struct EventActor {
    #[serde(rename = "Attributes", default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct DockerInfo {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "ServerVersion", default)]
    server_version: String,
    #[serde(rename = "Runtimes", default)]
    runtimes: BTreeMap<String, serde_json::Value>,
}

pub struct DockerBackend {
    cached_info: Mutex<Option<SystemInfo>>,
    pipeline: Pipeline,
}

impl DockerBackend {
    pub fn new() -> Self {
        Self {
            cached_info: Mutex::new(None),
            pipeline: Pipeline::default(),
        }
    }

    /// Replace the retry pipeline engine calls run through.
    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Run a docker subcommand through the resilience pipeline; transient
    /// engine failures retry with backoff.
    fn docker(&self, args: &[&str]) -> Result<String> {
        self.pipeline.run(|| docker_once(args))
    }
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Kills the log child once every pipe reader is done with it.
struct ChildGuard(Mutex<Child>);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let mut child = self.0.lock().unwrap();
        let _ = child.kill();
        let _ = child.wait();
    }
}

struct PipeLogSource<R: std::io::Read + Send> {
    inner: ReaderLogSource<BufReader<R>>,
    _guard: Arc<ChildGuard>,
}

impl<R: std::io::Read + Send> LogSource for PipeLogSource<R> {
    fn next_line(&mut self) -> Result<Option<LogLine>> {
        self.inner.next_line()
    }
}

impl ExecutionBackend for DockerBackend {
    fn capabilities(&self) -> BackendCapabilities {
        let gpu = self.get_system_info().map(|info| info.gpu).unwrap_or(false);
        BackendCapabilities {
            gpu,
            workers: false,
        }
    }

    fn get_system_info(&self) -> Result<SystemInfo> {
        if let Some(info) = self.cached_info.lock().unwrap().clone() {
            return Ok(info);
        }
        let raw = self.docker(&["info", "--format", "{{json .}}"])?;
        let parsed: DockerInfo = serde_json::from_str(raw.trim())
            .map_err(|e| Error::transient(format!("malformed docker info: {}", e)))?;
        let info = SystemInfo {
            name: parsed.name,
            version: parsed.server_version,
            gpu: parsed.runtimes.contains_key("nvidia"),
        };
        *self.cached_info.lock().unwrap() = Some(info.clone());
        Ok(info)
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker(&["image", "inspect", "--format", "{{.Id}}", image]) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(Error::BackendFatal(msg)) if msg.contains("No such image") => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list_containers(&self, selector: &LabelSelector) -> Result<Vec<ContainerState>> {
        let mut args = vec![
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
        ];
        for filter in selector_filters(selector) {
            args.push("--filter".to_string());
            args.push(filter);
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let raw = self.docker(&arg_refs)?;

        let mut states = Vec::new();
        for id in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.inspect_container(id) {
                Ok(state) => states.push(state),
                // The container can disappear between the listing and the
                // inspect.
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(states)
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args: Vec<String> = vec!["create".to_string()];
        args.push("--name".to_string());
        args.push(spec.name.clone());
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &spec.mounts {
            let mut volume = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("--volume".to_string());
            args.push(volume);
        }
        if let Some(user) = &spec.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        if let Some(dir) = &spec.working_dir {
            args.push("--workdir".to_string());
            args.push(dir.clone());
        }
        if let Some(gpu) = spec.gpu {
            args.push("--gpus".to_string());
            args.push(gpu.to_string());
        }

        // An explicit command becomes the entrypoint; its tail and the args
        // become the container command.
        let mut trailing: Vec<String> = Vec::new();
        if let Some(command) = &spec.command {
            if let Some(first) = command.first() {
                args.push("--entrypoint".to_string());
                args.push(first.clone());
            }
            trailing.extend(command.iter().skip(1).cloned());
        }
        args.push(spec.image.clone());
        args.extend(trailing);
        if let Some(extra) = &spec.args {
            args.extend(extra.iter().cloned());
        }

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let raw = self.docker(&arg_refs)?;
        Ok(raw.trim().to_string())
    }

    fn start_container(&self, id: &str) -> Result<()> {
        self.docker(&["start", id]).map(|_| ())
    }

    fn kill_container(&self, id: &str) -> Result<()> {
        self.docker(&["kill", id]).map(|_| ())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        match self.docker(&["rm", "--force", id]) {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerState> {
        let raw = self.docker(&["inspect", id])?;
        let entries: Vec<InspectEntry> = serde_json::from_str(raw.trim())
            .map_err(|e| Error::transient(format!("malformed inspect output: {}", e)))?;
        entries
            .into_iter()
            .next()
            .map(ContainerState::from)
            .ok_or_else(|| Error::not_found(format!("container {}", id)))
    }

    fn monitor_events(
        &self,
        selector: &LabelSelector,
        cancel: &Cancellation,
    ) -> Result<EventStream> {
        let mut args: Vec<String> = vec![
            "events".to_string(),
            "--format".to_string(),
            "{{json .}}".to_string(),
        ];
        for filter in selector_filters(selector) {
            args.push("--filter".to_string());
            args.push(filter);
        }
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let mut child = StreamingChild::spawn(&docker_program(), &arg_refs)
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
                        warn!(error = %e, "event stream read failed");
                        return;
                    }
                };
                let Ok(entry) = serde_json::from_str::<EventEntry>(&line) else {
                    continue;
                };
                let event = BackendEvent {
                    run_id: entry
                        .actor
                        .attributes
                        .get(RUN_LABEL)
                        .and_then(|v| v.parse().ok()),
                    object: entry.id,
                    action: entry.action,
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
        let mut args: Vec<String> = vec!["logs".to_string()];
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
            args.push("--since".to_string());
            args.push(since.to_rfc3339());
        }
        args.push(id.to_string());

        let mut command = Command::new(docker_program());
        command.args(&args);
        command.stdout(if request.stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stderr(if request.stderr {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = command
            .spawn()
            .map_err(|e| Error::transient(format!("failed to spawn docker logs: {}", e)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let guard = Arc::new(ChildGuard(Mutex::new(child)));

        let mut sources = Vec::new();
        if let Some(stdout) = stdout {
            sources.push(NamedLogSource {
                container: container_name.to_string(),
                channel: LogChannel::Stdout,
                source: Box::new(PipeLogSource {
                    inner: ReaderLogSource::new(BufReader::new(stdout)),
                    _guard: Arc::clone(&guard),
                }),
            });
        }
        if let Some(stderr) = stderr {
            sources.push(NamedLogSource {
                container: container_name.to_string(),
                channel: LogChannel::Stderr,
                source: Box::new(PipeLogSource {
                    inner: ReaderLogSource::new(BufReader::new(stderr)),
                    _guard: guard,
                }),
            });
        }
        Ok(sources)
    }
}
