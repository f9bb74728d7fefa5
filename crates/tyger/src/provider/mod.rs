//! Buffer provider abstraction.
//!
//! A provider owns the backing storage of buffers and mints signed access
//! URLs for them. Two variants exist behind the common trait:
//! [`cloud::CloudBufferProvider`] signs against per-account delegation keys
//! and places buffers round-robin across storage accounts;
//! [`local::LocalBufferProvider`] fronts a single-host data plane and signs
//! with a rotatable local key pair.

pub mod cloud;
pub mod local;
pub mod sign;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::shutdown::Cancellation;
use crate::types::{Buffer, BufferAccess, NewRun, Run, StorageAccount};

/// One entry of a `create_access_urls` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUrlRequest {
    pub id: String,
    pub writeable: bool,
}

/// One entry of a `create_access_urls` response, in request order.
/// `access` is `None` when the buffer does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessUrlResponse {
    pub id: String,
    pub writeable: bool,
    pub access: Option<BufferAccess>,
}

/// Options shared by every access-URL request in a batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessUrlOptions {
    /// Prefer the TCP endpoint over a Unix socket where both exist.
    pub prefer_tcp: bool,
    /// Address the data plane the way a container on the Docker network
    /// reaches it.
    pub from_docker: bool,
    /// Verify the backing container exists before minting a URL.
    pub check_exists: bool,
    /// Requested validity; `None` uses the configured default.
    pub ttl: Option<Duration>,
}

/// Request to copy matching buffers to an external storage endpoint.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub destination_storage_endpoint: String,
    /// Only buffers carrying all of these tags are exported.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// Request to import buffers from an external storage endpoint.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub source_storage_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

/// Submits system runs on behalf of a provider. Implemented by the run
/// creator; a seam so the provider does not depend on the run engine.
pub trait SystemRunLauncher: Send + Sync {
    /// Create a new version of the named system codespec and submit a system
    /// run executing it. The run's codespec reference is normalized by the
    /// launcher.
    fn launch(
        &self,
        codespec_name: &str,
        details: &crate::types::CodespecDetails,
        new_run: NewRun,
        cancel: &Cancellation,
    ) -> Result<Run>;
}

/// Backing storage for buffers.
///
/// Implementations must treat an invalid resource name on read as "does not
/// exist" rather than an error, keep `delete_buffers` idempotent, and honor
/// the caller's cancellation token.
pub trait BufferProvider: Send + Sync {
    /// Create the backing container for a buffer and stamp its placement.
    fn create_buffer(&self, buffer: &Buffer, cancel: &Cancellation) -> Result<Buffer>;

    /// Mint signed access URLs for a batch of buffers, preserving input
    /// order.
    fn create_access_urls(
        &self,
        requests: &[AccessUrlRequest],
        options: &AccessUrlOptions,
        cancel: &Cancellation,
    ) -> Result<Vec<AccessUrlResponse>>;

    /// Remove backing containers. Idempotent; returns the ids that were
    /// actually removed.
    fn delete_buffers(&self, ids: &[String], cancel: &Cancellation) -> Result<Vec<String>>;

    /// Write the failure tombstone blob into a buffer, silently giving way
    /// to an existing one.
    fn try_mark_buffer_as_failed(&self, id: &str, cancel: &Cancellation) -> Result<()>;

    /// Submit a system run that copies matching buffers to the destination.
    fn export_buffers(&self, request: &ExportRequest, cancel: &Cancellation) -> Result<Run>;

    /// Submit a system run that copies buffers in from the source.
    fn import_buffers(&self, request: &ImportRequest, cancel: &Cancellation) -> Result<Run>;

    fn list_storage_accounts(&self) -> Vec<StorageAccount>;
}

/// Name of the failure-tombstone blob written into a failed buffer.
pub const FAILURE_TOMBSTONE_BLOB: &str = ".bufferend";

/// Contents of the failure-tombstone blob.
pub const FAILURE_TOMBSTONE_BODY: &str = "{\"status\":\"failed\"}";
