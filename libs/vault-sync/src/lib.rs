//! Vault event synchronization.
//!
//! Mirrors events emitted by the time-locked vault contract into local
//! records and fans out notifications:
//! - Connecting to the node and verifying the contract binding
//! - Checkpointed historical replay in fixed block windows
//! - Live subscription with reconnect and gap repair
//! - Rate-limited, retried provider calls
//! - Idempotent application of vault, deposit and withdrawal events

pub mod applier;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod email;
pub mod executor;
pub mod pipeline;
pub mod store;
pub mod sync;

#[cfg(test)]
mod mock;

pub use applier::{ApplyOutcome, EventApplier};
pub use chain::{AlloyChainProvider, ChainError, ChainProvider, ConnectionManager, ConnectionState};
pub use checkpoint::CheckpointTracker;
pub use config::SyncConfig;
pub use email::{EmailSender, LoggingEmailSender};
pub use executor::{RequestExecutor, ExecutorConfig, EndpointConfig};
pub use pipeline::{PipelineStatus, SyncPipeline};
pub use store::{MemoryStore, VaultStore};
