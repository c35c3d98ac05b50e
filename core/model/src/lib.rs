//! Object model for Eaves.
//!
//! This crate provides:
//! - Remote objects with per-key dirty tracking
//! - The identity map that owns every known object
//! - Access control lists, roles and their evaluation
//! - The class registry consulted when objects are materialized
//! - Session management for the current actor
//! - Client configuration

pub mod acl;
pub mod config;
pub mod object;
pub mod registry;
pub mod role;
pub mod session;
pub mod store;

pub use acl::{evaluate, Acl, DefaultAcl, Permission, Permissions, Subject};
pub use config::{ClientConfig, QueueRetryConfig};
pub use object::{ObjectRecord, RemoteObject, SaveDelta, ACL_KEY};
pub use registry::{create_default_registry, ClassFactory, ClassRegistry};
pub use role::{validate_role_name, Role, RoleDirectory};
pub use session::{Actor, Session, SessionManager};
pub use store::{ObjectHandle, ObjectStore};
