//! # Tyger
//!
//! The core of the tyger control plane: run orchestration and buffer
//! lifecycle management for containerized signal-processing jobs whose
//! inputs and outputs are large opaque byte streams.
//!
//! Users declare a **codespec** (container image, command, resource
//! requests, named input/output buffer parameters), create **buffers**
//! (content-addressed blob containers), and submit **runs** that bind
//! buffers to the codespec's parameters. The control plane materializes
//! each run as containers, wires every declared buffer to a sidecar that
//! streams bytes between the buffer store and a named pipe in the user
//! container, tracks the run to a terminal state, archives its logs, and
//! eventually reclaims all resources.
//!
//! ## Subsystems
//!
//! - [`store`] -- metadata store: transactional CRUD for codespecs, buffers,
//!   runs, and tags over PostgreSQL, plus the migration runner and its
//!   replica-gated online protocol
//! - [`provider`] -- buffer backing storage: the cloud variant (delegation
//!   keys, round-robin placement, failure tombstones) and the local
//!   data-plane variant (rotatable HMAC signing keys)
//! - [`buffers`] -- buffer manager: tag validation, id minting, TTL policy,
//!   ephemeral buffer ids, access-URL fan-out
//! - [`deleter`] -- background soft/hard deletion of expired buffers
//! - [`backend`] -- execution backend abstraction over a single-host
//!   container engine and a cluster orchestrator
//! - [`runs`] -- the run engine: admission and submission, status
//!   resolution and watch, cancellation, the sweeper, and the run-secret
//!   updater
//! - [`logs`] -- per-container log sources, k-way timestamp merging, live
//!   follow, and gzip archival
//! - [`codespecs`] -- codespec validation and versioned storage
//! - [`pipeline`] -- the resilience pipeline wrapping database,
//!   object-store, and backend calls
//! - [`config`] -- `tyger.toml` loading and validation
//! - [`server`] -- process composition: wiring plus background loops
//!
//! ## Lifecycle sketch
//!
//! A run creation request resolves its codespec, validates its buffer
//! bindings, persists the run as pending, and materializes backend objects
//! through the run host. Backend events reconcile status through the
//! reader; the sweeper finalizes terminal runs after archiving their logs;
//! the secret updater re-signs buffer access URLs before they expire; the
//! deleter walks buffer TTLs. Every loop honors cancellation and recovers
//! from failures on its next tick.

pub mod backend;
pub mod buffers;
pub mod codespecs;
pub mod config;
pub mod deleter;
pub mod error;
pub mod logs;
pub mod pipeline;
pub mod provider;
pub mod runs;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod types;

mod process;

/// Configurable retry strategies with backoff and jitter.
/// Re-exported from the tyger-retry microcrate.
pub use tyger_retry as retry;

pub use error::{Error, Result};
