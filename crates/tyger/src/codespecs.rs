//! Codespec management: validation and versioned storage.
//!
//! Codespecs are append-only; creating one under an existing name assigns
//! the next version, and stored bodies are never mutated or deleted.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::MetadataStore;
use crate::types::{Codespec, CodespecDetails, CodespecRef};

/// Validate a codespec body before it is stored.
pub fn validate_codespec(details: &CodespecDetails) -> Result<()> {
    let common = details.common();
    if common.image.trim().is_empty() {
        return Err(Error::validation("codespec image must not be empty"));
    }

    if let CodespecDetails::Job(job) = details {
        let mut seen = BTreeSet::new();
        for (name, _) in job.buffers.all() {
            if name.is_empty() {
                return Err(Error::validation(
                    "buffer parameter names must not be empty",
                ));
            }
            if !seen.insert(name) {
                return Err(Error::validation(format!(
                    "buffer parameter {:?} is declared more than once",
                    name
                )));
            }
        }
    }

    if let CodespecDetails::Worker(worker) = details {
        if worker.replicas < 1 {
            return Err(Error::validation("worker replicas must be at least 1"));
        }
        for (name, port) in &worker.endpoints {
            if name.is_empty() {
                return Err(Error::validation("endpoint names must not be empty"));
            }
            if *port == 0 {
                return Err(Error::validation(format!(
                    "endpoint {:?} has port 0",
                    name
                )));
            }
        }
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        || name.starts_with('-')
    {
        return Err(Error::validation(format!(
            "codespec name {:?} must be lowercase alphanumeric with dashes or dots",
            name
        )));
    }
    Ok(())
}

pub struct CodespecManager {
    store: Arc<dyn MetadataStore>,
}

impl CodespecManager {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Validate and store a codespec, assigning the next version for its
    /// name.
    pub fn create(&self, name: &str, details: &CodespecDetails) -> Result<Codespec> {
        validate_name(name)?;
        validate_codespec(details)?;
        self.store.create_codespec(name, details)
    }

    pub fn get(&self, name: &str, version: Option<i32>) -> Result<Codespec> {
        self.store.get_codespec(name, version)
    }

    pub fn get_by_ref(&self, reference: &CodespecRef) -> Result<Codespec> {
        self.store.get_codespec(&reference.name, reference.version)
    }

    /// Latest version of each codespec, optionally filtered by name prefix.
    pub fn list(&self, prefix: Option<&str>, limit: usize) -> Result<Vec<Codespec>> {
        self.store.list_codespecs(prefix, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::types::{BufferParameters, CodespecCommon, JobCodespec, WorkerCodespec};

    fn job(image: &str, inputs: &[&str], outputs: &[&str]) -> CodespecDetails {
        CodespecDetails::Job(JobCodespec {
            common: CodespecCommon {
                image: image.to_string(),
                ..Default::default()
            },
            buffers: BufferParameters {
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                outputs: outputs.iter().map(|s| s.to_string()).collect(),
            },
        })
    }

    fn manager() -> (Arc<MemoryStore>, CodespecManager) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), CodespecManager::new(store))
    }

    #[test]
    fn create_assigns_monotonic_versions() {
        let (_store, manager) = manager();
        let v1 = manager.create("recon", &job("img:1", &[], &[])).unwrap();
        let v2 = manager.create("recon", &job("img:2", &[], &[])).unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
    }

    #[test]
    fn empty_image_is_rejected() {
        let (_store, manager) = manager();
        let err = manager
            .create("recon", &job("  ", &[], &[]))
            .expect_err("empty image");
        assert!(err.to_string().contains("image"));
    }

    #[test]
    fn buffer_names_must_be_unique_across_inputs_and_outputs() {
        let (_store, manager) = manager();
        let err = manager
            .create("recon", &job("img", &["data"], &["data"]))
            .expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));

        let err = manager
            .create("recon", &job("img", &[""], &[]))
            .expect_err("empty");
        assert!(err.to_string().contains("not be empty"));
    }

    #[test]
    fn worker_codespecs_validate_replicas_and_endpoints() {
        let (_store, manager) = manager();
        let bad_replicas = CodespecDetails::Worker(WorkerCodespec {
            common: CodespecCommon {
                image: "img".to_string(),
                ..Default::default()
            },
            endpoints: Default::default(),
            replicas: 0,
        });
        assert!(manager.create("workers", &bad_replicas).is_err());

        let bad_port = CodespecDetails::Worker(WorkerCodespec {
            common: CodespecCommon {
                image: "img".to_string(),
                ..Default::default()
            },
            endpoints: [("grpc".to_string(), 0u16)].into_iter().collect(),
            replicas: 1,
        });
        assert!(manager.create("workers", &bad_port).is_err());
    }

    #[test]
    fn names_are_restricted_to_reference_grammar() {
        let (_store, manager) = manager();
        assert!(manager.create("ok-name.v2", &job("img", &[], &[])).is_ok());
        assert!(manager.create("Bad", &job("img", &[], &[])).is_err());
        assert!(manager.create("", &job("img", &[], &[])).is_err());
        assert!(manager.create("has/slash", &job("img", &[], &[])).is_err());
    }

    #[test]
    fn get_by_ref_resolves_versions() {
        let (_store, manager) = manager();
        manager.create("recon", &job("img:1", &[], &[])).unwrap();
        manager.create("recon", &job("img:2", &[], &[])).unwrap();

        let latest = manager
            .get_by_ref(&CodespecRef::parse("recon").unwrap())
            .unwrap();
        assert_eq!(latest.version, 2);

        let pinned = manager
            .get_by_ref(&CodespecRef::parse("recon/versions/1").unwrap())
            .unwrap();
        assert_eq!(pinned.details.common().image, "img:1");
    }
}
