//! Identity types used throughout Eaves.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Client-generated identifier of an object.
///
/// Every object gets one at creation, whether or not the remote service has
/// assigned it an object id yet. Queued commands and pinned records use it to
/// refer to objects that have never been saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Generate a fresh local id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a local id from its string form.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidInput(format!("Invalid local id '{}': {}", s, e)))
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to an object by identity.
///
/// Saved objects are addressed by (class, object id). Objects the remote has
/// not created yet are addressed by (class, local id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectRef {
    Saved { class_name: String, object_id: String },
    Unsaved { class_name: String, local_id: LocalId },
}

impl ObjectRef {
    /// Reference a saved object.
    pub fn saved(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::Saved {
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }

    /// Reference an object that has no object id yet.
    pub fn unsaved(class_name: impl Into<String>, local_id: LocalId) -> Self {
        Self::Unsaved {
            class_name: class_name.into(),
            local_id,
        }
    }

    /// Class of the referenced object.
    pub fn class_name(&self) -> &str {
        match self {
            Self::Saved { class_name, .. } | Self::Unsaved { class_name, .. } => class_name,
        }
    }

    /// Remote object id, if assigned.
    pub fn object_id(&self) -> Option<&str> {
        match self {
            Self::Saved { object_id, .. } => Some(object_id),
            Self::Unsaved { .. } => None,
        }
    }

    /// Local id, for references to unsaved objects.
    pub fn local_id(&self) -> Option<LocalId> {
        match self {
            Self::Saved { .. } => None,
            Self::Unsaved { local_id, .. } => Some(*local_id),
        }
    }

    /// Key identifying the object within its class.
    ///
    /// The object id for saved objects, `local:<uuid>` otherwise. Used as the
    /// storage key in the local datastore.
    pub fn object_key(&self) -> String {
        match self {
            Self::Saved { object_id, .. } => object_id.clone(),
            Self::Unsaved { local_id, .. } => format!("local:{}", local_id),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.class_name(), self.object_key())
    }
}

/// Validate a class name.
///
/// Class names must start with a letter (or `_` for system classes such as
/// `_User` and `_Role`) and contain only ASCII alphanumerics and `_`.
///
/// # Errors
/// - Returns `InvalidInput` if the name is empty or contains other characters
pub fn validate_class_name(name: &str) -> crate::Result<()> {
    let mut chars = name.chars();
    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if !valid_head || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(crate::Error::InvalidInput(format!(
            "Invalid class name '{}'",
            name
        )));
    }
    Ok(())
}
