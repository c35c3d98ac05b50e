//! Access control lists.
//!
//! An ACL maps subjects (the public wildcard, user ids and role names) to a
//! set of read/update/delete grants. Grants are discrete per subject and per
//! verb; revoking a grant removes it. The wire form is a JSON object:
//!
//! ```json
//! { "*": { "read": true }, "u1": { "read": true, "update": true }, "role:Admins": { "delete": true } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use eaves_common::{Error, Result};

use crate::role::{validate_role_name, Role, RoleDirectory};

const PUBLIC_KEY: &str = "*";
const ROLE_PREFIX: &str = "role:";

/// A single permission verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Update,
    Delete,
}

impl Permission {
    pub const ALL: [Permission; 3] = [Permission::Read, Permission::Update, Permission::Delete];

    fn key(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Update => "update",
            Permission::Delete => "delete",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Grants held by one subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub update: bool,
    pub delete: bool,
}

impl Permissions {
    pub fn get(&self, permission: Permission) -> bool {
        match permission {
            Permission::Read => self.read,
            Permission::Update => self.update,
            Permission::Delete => self.delete,
        }
    }

    pub fn set(&mut self, permission: Permission, allowed: bool) {
        match permission {
            Permission::Read => self.read = allowed,
            Permission::Update => self.update = allowed,
            Permission::Delete => self.delete = allowed,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.read || self.update || self.delete)
    }
}

/// A subject that can hold grants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subject {
    Public,
    User(String),
    Role(String),
}

impl Subject {
    fn to_key(&self) -> String {
        match self {
            Subject::Public => PUBLIC_KEY.to_string(),
            Subject::User(id) => id.clone(),
            Subject::Role(name) => format!("{}{}", ROLE_PREFIX, name),
        }
    }

    fn from_key(key: &str) -> Result<Self> {
        if key == PUBLIC_KEY {
            Ok(Subject::Public)
        } else if let Some(name) = key.strip_prefix(ROLE_PREFIX) {
            validate_role_name(name).map_err(|_| Error::InvalidAcl(format!("bad role '{}'", name)))?;
            Ok(Subject::Role(name.to_string()))
        } else if key.is_empty() {
            Err(Error::InvalidAcl("empty subject".to_string()))
        } else {
            Ok(Subject::User(key.to_string()))
        }
    }
}

/// Access control list attached to an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub struct Acl {
    entries: BTreeMap<Subject, Permissions>,
}

impl Acl {
    /// Create an ACL with no grants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an ACL granting read and write access to one user only.
    pub fn with_user(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let mut acl = Self::new();
        acl.set_user_access(&user_id, Permission::Read, true);
        acl.set_user_write_access(&user_id, true);
        acl
    }

    fn set(&mut self, subject: Subject, permission: Permission, allowed: bool) {
        let entry = self.entries.entry(subject.clone()).or_default();
        entry.set(permission, allowed);
        if entry.is_empty() {
            self.entries.remove(&subject);
        }
    }

    fn get(&self, subject: &Subject, permission: Permission) -> bool {
        self.entries
            .get(subject)
            .is_some_and(|p| p.get(permission))
    }

    pub fn set_public_access(&mut self, permission: Permission, allowed: bool) {
        self.set(Subject::Public, permission, allowed);
    }

    pub fn public_access(&self, permission: Permission) -> bool {
        self.get(&Subject::Public, permission)
    }

    pub fn set_public_read_access(&mut self, allowed: bool) {
        self.set_public_access(Permission::Read, allowed);
    }

    /// Grant or revoke public update and delete together.
    pub fn set_public_write_access(&mut self, allowed: bool) {
        self.set_public_access(Permission::Update, allowed);
        self.set_public_access(Permission::Delete, allowed);
    }

    pub fn set_user_access(&mut self, user_id: &str, permission: Permission, allowed: bool) {
        self.set(Subject::User(user_id.to_string()), permission, allowed);
    }

    pub fn user_access(&self, user_id: &str, permission: Permission) -> bool {
        self.get(&Subject::User(user_id.to_string()), permission)
    }

    /// Grant or revoke update and delete together for a user.
    pub fn set_user_write_access(&mut self, user_id: &str, allowed: bool) {
        self.set_user_access(user_id, Permission::Update, allowed);
        self.set_user_access(user_id, Permission::Delete, allowed);
    }

    /// Set access for a role by name.
    ///
    /// # Errors
    /// - Invalid role name
    pub fn set_role_access(
        &mut self,
        role_name: &str,
        permission: Permission,
        allowed: bool,
    ) -> Result<()> {
        validate_role_name(role_name)?;
        self.set(Subject::Role(role_name.to_string()), permission, allowed);
        Ok(())
    }

    pub fn role_access(&self, role_name: &str, permission: Permission) -> bool {
        self.get(&Subject::Role(role_name.to_string()), permission)
    }

    /// Set access for a role object.
    ///
    /// # Errors
    /// - `InvalidInput` if the role has never been saved
    pub fn set_role_object_access(
        &mut self,
        role: &Role,
        permission: Permission,
        allowed: bool,
    ) -> Result<()> {
        let name = role.saved_name()?;
        self.set_role_access(name, permission, allowed)
    }

    /// Read access for a role object.
    ///
    /// # Errors
    /// - `InvalidInput` if the role has never been saved
    pub fn role_object_access(&self, role: &Role, permission: Permission) -> Result<bool> {
        Ok(self.role_access(role.saved_name()?, permission))
    }

    /// Whether the ACL holds no grants at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over subjects and their grants.
    pub fn entries(&self) -> impl Iterator<Item = (&Subject, &Permissions)> {
        self.entries.iter()
    }

    /// Encode the ACL in its wire form.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .entries
            .iter()
            .map(|(subject, perms)| {
                let grants: serde_json::Map<String, serde_json::Value> = Permission::ALL
                    .iter()
                    .filter(|p| perms.get(**p))
                    .map(|p| (p.key().to_string(), serde_json::Value::Bool(true)))
                    .collect();
                (subject.to_key(), serde_json::Value::Object(grants))
            })
            .collect();
        serde_json::Value::Object(map)
    }

    /// Decode an ACL from its wire form.
    ///
    /// `"write": true` is accepted as update plus delete. Explicit `false`
    /// values are the same as absent grants.
    ///
    /// # Errors
    /// - `InvalidAcl` for non-object documents, unknown verbs, non-boolean
    ///   grants or invalid subjects
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let entries = value
            .as_object()
            .ok_or_else(|| Error::InvalidAcl("ACL must be a JSON object".to_string()))?;

        let mut acl = Self::new();
        for (key, grants) in entries {
            let subject = Subject::from_key(key)?;
            let grants = grants.as_object().ok_or_else(|| {
                Error::InvalidAcl(format!("grants for '{}' must be an object", key))
            })?;
            for (verb, allowed) in grants {
                let allowed = allowed.as_bool().ok_or_else(|| {
                    Error::InvalidAcl(format!("grant '{}' for '{}' must be a boolean", verb, key))
                })?;
                let permissions: &[Permission] = match verb.as_str() {
                    "read" => &[Permission::Read],
                    "update" => &[Permission::Update],
                    "delete" => &[Permission::Delete],
                    "write" => &[Permission::Update, Permission::Delete],
                    other => {
                        return Err(Error::InvalidAcl(format!("unknown permission '{}'", other)))
                    }
                };
                for permission in permissions {
                    if allowed {
                        acl.set(subject.clone(), *permission, true);
                    }
                }
            }
        }
        Ok(acl)
    }
}

impl TryFrom<serde_json::Value> for Acl {
    type Error = Error;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        Acl::from_json(&value)
    }
}

impl From<Acl> for serde_json::Value {
    fn from(acl: Acl) -> Self {
        acl.to_json()
    }
}

/// Decide whether `user_id` holds `permission` under `acl`.
///
/// Resolution order:
/// 1. An explicit grant to the user
/// 2. A grant to any role the user belongs to, directly or through child
///    roles
/// 3. The public grant
///
/// Anything else is denied. Anonymous callers (`None`) are only covered by
/// public grants.
pub fn evaluate(
    acl: &Acl,
    user_id: Option<&str>,
    permission: Permission,
    roles: &RoleDirectory,
) -> bool {
    if let Some(user_id) = user_id {
        if acl.user_access(user_id, permission) {
            return true;
        }
        let by_role = acl.entries.iter().any(|(subject, perms)| match subject {
            Subject::Role(name) => perms.get(permission) && roles.has_member(name, user_id),
            _ => false,
        });
        if by_role {
            return true;
        }
    }
    acl.public_access(permission)
}

/// Template copied onto every newly created object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultAcl {
    template: Acl,
    grant_current_user: bool,
}

impl DefaultAcl {
    /// Register a template. The ACL is copied, so later changes to the
    /// caller's instance do not affect it.
    pub fn new(template: &Acl, grant_current_user: bool) -> Self {
        Self {
            template: template.clone(),
            grant_current_user,
        }
    }

    /// Build the ACL for a new object created by `current_user`.
    pub fn instantiate(&self, current_user: Option<&str>) -> Acl {
        let mut acl = self.template.clone();
        if let (true, Some(user_id)) = (self.grant_current_user, current_user) {
            acl.set_user_access(user_id, Permission::Read, true);
            acl.set_user_access(user_id, Permission::Update, true);
        }
        acl
    }
}
