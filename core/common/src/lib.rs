//! Common utilities and types shared across the Eaves crates.
//!
//! This module provides the error taxonomy used by every layer, object
//! identity types, and the attribute value model carried by remote objects.

pub mod error;
pub mod types;
pub mod value;

pub use error::{codes, Error, Result};
pub use types::{validate_class_name, LocalId, ObjectRef};
pub use value::{Attributes, Delta, FieldOp, GeoPoint, RelationRef, Value};
