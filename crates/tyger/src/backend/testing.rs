//! Scriptable in-memory backend for engine tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::mpsc;

use crate::error::{Error, Result};
use crate::logs::{LogChannel, LogLine, NamedLogSource, VecLogSource};
use crate::shutdown::Cancellation;

use super::{
    BackendCapabilities, BackendEvent, ContainerSpec, ContainerState, EventStream,
    ExecutionBackend, LabelSelector, LogRequest, SystemInfo,
};

#[derive(Default)]
pub struct FakeBackend {
    pub capabilities: Mutex<BackendCapabilities>,
    pub containers: Mutex<Vec<ContainerState>>,
    pub images: Mutex<Vec<String>>,
    pub created: Mutex<Vec<ContainerSpec>>,
    pub started: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub logs: Mutex<BTreeMap<String, Vec<LogLine>>>,
    pub fail_create: Mutex<Option<String>>,
    pub events: Mutex<Vec<BackendEvent>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(gpu: bool, workers: bool) -> Self {
        let backend = Self::default();
        *backend.capabilities.lock().unwrap() = BackendCapabilities { gpu, workers };
        backend
    }

    pub fn push_container(&self, state: ContainerState) {
        self.containers.lock().unwrap().push(state);
    }

    pub fn set_containers(&self, states: Vec<ContainerState>) {
        *self.containers.lock().unwrap() = states;
    }
}

impl ExecutionBackend for FakeBackend {
    fn capabilities(&self) -> BackendCapabilities {
        *self.capabilities.lock().unwrap()
    }

    fn get_system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            name: "fake".to_string(),
            version: "0".to_string(),
            gpu: self.capabilities().gpu,
        })
    }

    fn image_exists(&self, image: &str) -> Result<bool> {
        let images = self.images.lock().unwrap();
        Ok(images.is_empty() || images.iter().any(|i| i == image))
    }

    fn list_containers(&self, selector: &LabelSelector) -> Result<Vec<ContainerState>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|s| selector.matches(&s.labels))
            .cloned()
            .collect())
    }

    fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        if let Some(message) = self.fail_create.lock().unwrap().clone() {
            return Err(Error::fatal(message));
        }
        self.created.lock().unwrap().push(spec.clone());
        Ok(spec.name.clone())
    }

    fn start_container(&self, id: &str) -> Result<()> {
        self.started.lock().unwrap().push(id.to_string());
        Ok(())
    }

    fn kill_container(&self, id: &str) -> Result<()> {
        self.killed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    fn remove_container(&self, id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(id.to_string());
        self.containers.lock().unwrap().retain(|s| s.id != id);
        Ok(())
    }

    fn inspect_container(&self, id: &str) -> Result<ContainerState> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("container {}", id)))
    }

    fn monitor_events(
        &self,
        _selector: &LabelSelector,
        _cancel: &Cancellation,
    ) -> Result<EventStream> {
        let (sender, receiver) = mpsc::channel();
        for event in self.events.lock().unwrap().drain(..) {
            let _ = sender.send(event);
        }
        // Sender dropped here: the stream closes after the scripted events.
        Ok(EventStream { receiver })
    }

    fn get_container_logs(
        &self,
        id: &str,
        container_name: &str,
        _request: &LogRequest,
    ) -> Result<Vec<NamedLogSource>> {
        let lines = self.logs.lock().unwrap().get(id).cloned().unwrap_or_default();
        Ok(vec![NamedLogSource {
            container: container_name.to_string(),
            channel: LogChannel::Stdout,
            source: Box::new(VecLogSource::new(lines)),
        }])
    }
}
