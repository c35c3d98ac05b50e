//! Eaves client engine
//!
//! This module ties the object model to a remote store, including:
//! - Direct saves, deletes and fetches with retry for transient failures
//! - A persistent command queue for eventual saves and deletes
//! - Manual and periodic queue draining
//! - Queries under cache policies, backed by the pinning datastore
//! - Request observation hooks

pub mod datastore;
pub mod drain;
pub mod engine;
pub mod hooks;
pub mod policy;
pub mod queue;
pub mod retry;

// Re-export main types
pub use datastore::PinningDatastore;
pub use drain::{DrainMode, DrainReport, DrainRequest, DrainScheduler, DrainSchedulerHandle};
pub use engine::Client;
pub use hooks::{
    Observers, RequestInfo, RequestKind, RequestObserver, ResponseOutcome, TracingObserver,
};
pub use policy::{CachePolicy, QueryExecutor, ResultSet, ResultSource, ResultStream};
pub use queue::{
    CommandId, CommandKind, CommandQueue, CommandStatus, QueueEvent, QueuedCommand,
};
pub use retry::{RetryConfig, RetryExecutor};
