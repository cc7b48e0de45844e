//! Web GIS orchestrator - concurrent resource operations over a cached tree
//!
//! Architecture:
//! - `tree`: cached mirror of the remote resource hierarchy, written only by reconciliation
//! - `tracker`: per-resource operation locks, the single serialization point
//! - `intent` / `scheduler`: validate user intents, lock, fan out jobs under a concurrency bound
//! - `reconcile`: single consumer applying resolved jobs and assembling batch reports
//! - `remote`: the Web GIS API seam; `memory` is an in-process implementation of it

pub mod events;
pub mod intent;
pub mod job;
pub mod memory;
pub mod reconcile;
pub mod remote;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod tracker;
pub mod tree;

pub use events::OrchestratorEvent;
pub use intent::Intent;
pub use job::{BatchId, JobId, JobState};
pub use memory::InMemoryRemote;
pub use remote::RemoteResourceClient;
pub use report::{BatchReport, FailureEntry, FailureReport, SkipReason};
pub use scheduler::{BatchOptions, Canceller, Handle, JobScheduler};
pub use tracker::{LockScope, OperationKey, OperationKind, OperationRecord, OperationStateTracker};
pub use tree::{ResourceNode, ResourceTree};
