//! Storage abstractions for Eaves.
//!
//! This module provides the two external collaborators of the sync engine:
//! - The remote store, an async request/response service behind the
//!   [`RemoteStore`] trait, with an in-memory implementation for tests and
//!   offline development
//! - The local store, an embedded SQLite database backing the pinning
//!   datastore and the query result cache
//!
//! # Design Principles
//! - Every remote call maps to exactly one logical request
//! - Remote failures use the common error taxonomy so callers can classify
//!   them as retriable or terminal
//! - Local multi-row writes are transactional

pub mod local;
pub mod memory;
pub mod query;
pub mod remote;

pub use local::{IntegrityReport, LocalStore, PinSummary, StoredRecord};
pub use memory::{Fault, MemoryRemote, RemoteOp, RequestRecord};
pub use query::{Constraint, ConstraintOp, OrderBy, QuerySpec};
pub use remote::{ObjectData, RemoteStore, RequestContext, SaveRequest, SessionInfo};
