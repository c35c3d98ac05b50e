//! Class registry for runtime-determined object types.

use std::collections::HashMap;

use eaves_common::{validate_class_name, Error, ObjectRef, Result, Value, RelationRef};

use crate::object::RemoteObject;
use crate::role::ROLE_CLASS;

/// Class name of user objects on the remote service.
pub const USER_CLASS: &str = "_User";

/// Factory function type for building objects of one class.
///
/// Receives the identity of the object being materialized and returns its
/// initial in-memory form.
pub type ClassFactory = Box<dyn Fn(&ObjectRef) -> RemoteObject + Send + Sync>;

/// Registry of class factories.
///
/// Consulted whenever an object is created or materialized from remote or
/// cached data. Classes without a registered factory get a generic record.
pub struct ClassRegistry {
    factories: HashMap<String, ClassFactory>,
}

impl ClassRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a class factory.
    ///
    /// # Preconditions
    /// - `class_name` must be unique within the registry
    ///
    /// # Postconditions
    /// - Objects of the class are built by the factory
    ///
    /// # Errors
    /// - Invalid class name
    /// - Returns error if the class is already registered
    pub fn register(&mut self, class_name: impl Into<String>, factory: ClassFactory) -> Result<()> {
        let class_name = class_name.into();
        validate_class_name(&class_name)?;
        if self.factories.contains_key(&class_name) {
            return Err(Error::InvalidInput(format!(
                "Class '{}' is already registered",
                class_name
            )));
        }
        self.factories.insert(class_name, factory);
        Ok(())
    }

    /// Build the in-memory form of an object.
    pub fn instantiate(&self, object_ref: &ObjectRef) -> RemoteObject {
        match self.factories.get(object_ref.class_name()) {
            Some(factory) => factory(object_ref),
            None => RemoteObject::from_ref(object_ref),
        }
    }

    /// Get list of registered class names.
    pub fn classes(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Check if a class is registered.
    pub fn has_class(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in classes.
///
/// New `_Role` objects start with `users` and `roles` relation handles.
pub fn create_default_registry() -> ClassRegistry {
    let mut registry = ClassRegistry::new();
    registry.factories.insert(
        ROLE_CLASS.to_string(),
        Box::new(|object_ref| {
            let mut role = RemoteObject::from_ref(object_ref);
            if object_ref.object_id().is_none() {
                let users = Value::Relation(RelationRef {
                    target_class: USER_CLASS.to_string(),
                });
                let roles = Value::Relation(RelationRef {
                    target_class: ROLE_CLASS.to_string(),
                });
                // Both keys are valid attribute names.
                let _ = role.set("users", users);
                let _ = role.set("roles", roles);
            }
            role
        }),
    );
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use eaves_common::LocalId;

    #[test]
    fn test_generic_fallback() {
        let registry = ClassRegistry::new();
        let object = registry.instantiate(&ObjectRef::saved("Note", "n1"));
        assert_eq!(object.class_name(), "Note");
        assert!(!object.is_data_available());
    }

    #[test]
    fn test_register_and_instantiate() {
        let mut registry = ClassRegistry::new();
        registry
            .register(
                "Game",
                Box::new(|r| {
                    let mut object = RemoteObject::from_ref(r);
                    object.set("score", 0i64).unwrap();
                    object
                }),
            )
            .unwrap();

        assert!(registry.has_class("Game"));
        let game = registry.instantiate(&ObjectRef::unsaved("Game", LocalId::new()));
        assert_eq!(game.get("score"), Some(&Value::Integer(0)));
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let mut registry = ClassRegistry::new();
        registry
            .register("Game", Box::new(RemoteObject::from_ref))
            .unwrap();
        assert!(registry
            .register("Game", Box::new(RemoteObject::from_ref))
            .is_err());
        assert!(registry
            .register("bad name", Box::new(RemoteObject::from_ref))
            .is_err());
    }

    #[test]
    fn test_default_registry_roles() {
        let registry = create_default_registry();
        let role = registry.instantiate(&ObjectRef::unsaved(ROLE_CLASS, LocalId::new()));
        assert!(matches!(role.get("users"), Some(Value::Relation(_))));
        assert!(matches!(role.get("roles"), Some(Value::Relation(_))));

        let fetched = registry.instantiate(&ObjectRef::saved(ROLE_CLASS, "r1"));
        assert!(fetched.get("users").is_none());
    }
}
