//! Roles and role membership.
//!
//! A role grants its permissions to its child users and, transitively, to
//! the members of its child roles. The role graph comes from remote data and
//! may contain cycles, so every traversal tracks visited roles.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::warn;

use eaves_common::{Error, Result, Value};
use eaves_storage::ObjectData;

/// Class name of role objects on the remote service.
pub const ROLE_CLASS: &str = "_Role";

/// Validate a role name.
///
/// Role names must be non-empty and contain only alphanumerics, `_`, `-`
/// and spaces.
///
/// # Errors
/// - Returns `InvalidInput` for empty names or other characters
pub fn validate_role_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ');
    if !valid {
        return Err(Error::InvalidInput(format!("Invalid role name '{}'", name)));
    }
    Ok(())
}

/// A named group of users and roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    name: String,
    /// Remote object id; absent until the role is saved.
    object_id: Option<String>,
    users: BTreeSet<String>,
    /// Names of child roles whose members inherit this role.
    roles: BTreeSet<String>,
}

impl Role {
    /// Create an unsaved role.
    ///
    /// # Errors
    /// - Invalid role name
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validate_role_name(&name)?;
        Ok(Self {
            name,
            object_id: None,
            users: BTreeSet::new(),
            roles: BTreeSet::new(),
        })
    }

    /// Attach the remote object id of a saved role.
    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    /// Return the name of a saved role.
    ///
    /// # Errors
    /// - `InvalidInput` if the role has never been saved
    pub fn saved_name(&self) -> Result<&str> {
        match self.object_id {
            Some(_) => Ok(&self.name),
            None => Err(Error::InvalidInput(format!(
                "Role '{}' must be saved before it can be used in an ACL",
                self.name
            ))),
        }
    }

    pub fn add_user(&mut self, user_id: impl Into<String>) {
        self.users.insert(user_id.into());
    }

    pub fn remove_user(&mut self, user_id: &str) {
        self.users.remove(user_id);
    }

    /// Add a child role. Members of the child inherit this role.
    pub fn add_role(&mut self, role_name: impl Into<String>) {
        self.roles.insert(role_name.into());
    }

    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.users.iter().map(String::as_str)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.roles.iter().map(String::as_str)
    }
}

/// Known roles, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct RoleDirectory {
    roles: HashMap<String, Role>,
}

impl RoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a role.
    pub fn upsert(&mut self, role: Role) {
        self.roles.insert(role.name.clone(), role);
    }

    pub fn get(&self, name: &str) -> Option<&Role> {
        self.roles.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Role> {
        self.roles.remove(name)
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Whether `user_id` is a member of `role_name`, directly or through any
    /// chain of child roles.
    pub fn has_member(&self, role_name: &str, user_id: &str) -> bool {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut pending: VecDeque<&str> = VecDeque::from([role_name]);

        while let Some(name) = pending.pop_front() {
            if !visited.insert(name) {
                continue;
            }
            let Some(role) = self.roles.get(name) else {
                continue;
            };
            if role.users.contains(user_id) {
                return true;
            }
            pending.extend(role.roles.iter().map(String::as_str));
        }
        false
    }

    /// Names of every role `user_id` belongs to.
    pub fn roles_of(&self, user_id: &str) -> BTreeSet<String> {
        self.roles
            .keys()
            .filter(|name| self.has_member(name, user_id))
            .cloned()
            .collect()
    }

    /// Build a directory from remote `_Role` objects.
    ///
    /// Expects a `name` string, a `users` array of user pointers and a
    /// `roles` array of role pointers. Child roles are resolved to names
    /// through their object ids; unresolvable pointers and malformed
    /// objects are skipped.
    pub fn from_objects(objects: &[ObjectData]) -> Self {
        let names: HashMap<&str, &str> = objects
            .iter()
            .filter(|o| o.class_name == ROLE_CLASS)
            .filter_map(|o| {
                let name = o.attributes.get("name")?.as_str()?;
                Some((o.object_id.as_str(), name))
            })
            .collect();

        let mut directory = Self::new();
        for object in objects.iter().filter(|o| o.class_name == ROLE_CLASS) {
            let Some(name) = names.get(object.object_id.as_str()) else {
                continue;
            };
            let mut role = match Role::new(*name) {
                Ok(role) => role.with_object_id(object.object_id.clone()),
                Err(e) => {
                    warn!("Skipping role {}: {}", object.object_id, e);
                    continue;
                }
            };
            for pointer in pointers(object.attributes.get("users")) {
                if let Some(id) = pointer.object_id() {
                    role.add_user(id);
                }
            }
            for pointer in pointers(object.attributes.get("roles")) {
                if let Some(child) = pointer.object_id().and_then(|id| names.get(id)) {
                    role.add_role(*child);
                }
            }
            directory.upsert(role);
        }
        directory
    }
}

fn pointers(value: Option<&Value>) -> Vec<eaves_common::ObjectRef> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(|v| v.as_pointer().cloned()).collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eaves_common::{Attributes, ObjectRef};

    fn role(name: &str, users: &[&str], roles: &[&str]) -> Role {
        let mut role = Role::new(name).unwrap();
        users.iter().for_each(|u| role.add_user(*u));
        roles.iter().for_each(|r| role.add_role(*r));
        role
    }

    #[test]
    fn test_role_name_validation() {
        assert!(validate_role_name("Moderators").is_ok());
        assert!(validate_role_name("Team A-1_x").is_ok());
        assert!(validate_role_name("").is_err());
        assert!(validate_role_name("admins!").is_err());
    }

    #[test]
    fn test_unsaved_role_has_no_saved_name() {
        let role = Role::new("Admins").unwrap();
        assert!(matches!(role.saved_name(), Err(Error::InvalidInput(_))));
        assert_eq!(role.with_object_id("r1").saved_name().unwrap(), "Admins");
    }

    #[test]
    fn test_transitive_membership() {
        let mut directory = RoleDirectory::new();
        directory.upsert(role("Admins", &["root"], &["Moderators"]));
        directory.upsert(role("Moderators", &["mod"], &["Helpers"]));
        directory.upsert(role("Helpers", &["helper"], &[]));

        assert!(directory.has_member("Admins", "helper"));
        assert!(directory.has_member("Moderators", "helper"));
        assert!(!directory.has_member("Helpers", "mod"));
        assert!(!directory.has_member("Unknown", "root"));

        let roles = directory.roles_of("mod");
        assert_eq!(
            roles.into_iter().collect::<Vec<_>>(),
            vec!["Admins".to_string(), "Moderators".to_string()]
        );
    }

    #[test]
    fn test_cyclic_graph_terminates() {
        let mut directory = RoleDirectory::new();
        directory.upsert(role("A", &[], &["B"]));
        directory.upsert(role("B", &[], &["A"]));
        directory.upsert(role("C", &["u"], &["C"]));

        assert!(!directory.has_member("A", "u"));
        assert!(directory.has_member("C", "u"));
    }

    #[test]
    fn test_from_objects() {
        let data = |id: &str, name: &str, users: Vec<Value>, roles: Vec<Value>| ObjectData {
            class_name: ROLE_CLASS.to_string(),
            object_id: id.to_string(),
            attributes: Attributes::from([
                ("name".to_string(), Value::from(name)),
                ("users".to_string(), Value::Array(users)),
                ("roles".to_string(), Value::Array(roles)),
            ]),
            acl: None,
            created_at: None,
            updated_at: None,
        };
        let objects = vec![
            data(
                "r1",
                "Admins",
                vec![Value::Pointer(ObjectRef::saved("_User", "u1"))],
                vec![Value::Pointer(ObjectRef::saved(ROLE_CLASS, "r2"))],
            ),
            data(
                "r2",
                "Staff",
                vec![Value::Pointer(ObjectRef::saved("_User", "u2"))],
                vec![Value::Pointer(ObjectRef::saved(ROLE_CLASS, "missing"))],
            ),
        ];

        let directory = RoleDirectory::from_objects(&objects);
        assert_eq!(directory.len(), 2);
        assert!(directory.has_member("Admins", "u2"));
        assert!(!directory.has_member("Staff", "u1"));
        assert_eq!(directory.get("Staff").unwrap().object_id(), Some("r2"));
    }
}
