//! Identity map owning every known remote object.
//!
//! Each identity has at most one live instance. The store only holds weak
//! references: once the application drops the last [`ObjectHandle`] for an
//! object, its entry is gone and a later lookup builds a fresh placeholder.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use eaves_common::{validate_class_name, LocalId, ObjectRef, Result};
use eaves_storage::ObjectData;

use crate::acl::{Acl, DefaultAcl};
use crate::object::{ObjectRecord, RemoteObject};
use crate::registry::ClassRegistry;

#[derive(Debug)]
struct Shared {
    local_id: LocalId,
    object: Mutex<RemoteObject>,
}

/// Shared handle to a canonical object.
///
/// The per-object mutex is the unit of exclusion for in-memory reads and
/// merges. It must never be held across I/O.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    inner: Arc<Shared>,
}

impl ObjectHandle {
    fn new(object: RemoteObject) -> Self {
        Self {
            inner: Arc::new(Shared {
                local_id: object.local_id(),
                object: Mutex::new(object),
            }),
        }
    }

    /// Lock the object for reading or mutation.
    pub fn lock(&self) -> MutexGuard<'_, RemoteObject> {
        self.inner.object.lock()
    }

    /// Stable local id of the object.
    pub fn local_id(&self) -> LocalId {
        self.inner.local_id
    }

    /// Current identity of the object.
    pub fn object_ref(&self) -> ObjectRef {
        self.lock().object_ref()
    }

    /// Whether both handles point to the same instance.
    pub fn ptr_eq(&self, other: &ObjectHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}

#[derive(Default)]
struct Index {
    by_id: HashMap<(String, String), Weak<Shared>>,
    by_local: HashMap<LocalId, Weak<Shared>>,
}

impl Index {
    fn prune(&mut self) {
        self.by_id.retain(|_, w| w.strong_count() > 0);
        self.by_local.retain(|_, w| w.strong_count() > 0);
    }

    fn insert(&mut self, handle: &ObjectHandle, object_id: Option<&str>, class_name: &str) {
        self.by_local.insert(handle.local_id(), handle.downgrade());
        if let Some(id) = object_id {
            self.by_id
                .insert((class_name.to_string(), id.to_string()), handle.downgrade());
        }
    }
}

/// Object store and identity map.
pub struct ObjectStore {
    registry: ClassRegistry,
    index: Mutex<Index>,
    default_acl: Mutex<Option<DefaultAcl>>,
}

impl ObjectStore {
    /// Create a store that builds objects through `registry`.
    pub fn new(registry: ClassRegistry) -> Self {
        Self {
            registry,
            index: Mutex::new(Index::default()),
            default_acl: Mutex::new(None),
        }
    }

    /// Register the ACL template applied to new objects.
    ///
    /// The template is copied; later changes to `acl` do not leak into it.
    pub fn set_default_acl(&self, acl: &Acl, grant_current_user: bool) {
        *self.default_acl.lock() = Some(DefaultAcl::new(acl, grant_current_user));
    }

    pub fn clear_default_acl(&self) {
        *self.default_acl.lock() = None;
    }

    /// Return the canonical instance for a saved identity.
    ///
    /// Builds an unfetched placeholder if none is live.
    ///
    /// # Errors
    /// - Invalid class name
    pub fn intern(&self, class_name: &str, object_id: &str) -> Result<ObjectHandle> {
        validate_class_name(class_name)?;
        let mut index = self.index.lock();
        let key = (class_name.to_string(), object_id.to_string());
        if let Some(handle) = index.by_id.get(&key).and_then(ObjectHandle::upgrade) {
            return Ok(handle);
        }
        index.prune();
        let handle = ObjectHandle::new(
            self.registry
                .instantiate(&ObjectRef::saved(class_name, object_id)),
        );
        index.insert(&handle, Some(object_id), class_name);
        Ok(handle)
    }

    /// Create a new unsaved object, applying the default ACL.
    ///
    /// # Errors
    /// - Invalid class name
    pub fn create(&self, class_name: &str, current_user: Option<&str>) -> Result<ObjectHandle> {
        validate_class_name(class_name)?;
        let mut object = self
            .registry
            .instantiate(&ObjectRef::unsaved(class_name, LocalId::new()));
        if let Some(default_acl) = self.default_acl.lock().as_ref() {
            object.init_acl(default_acl.instantiate(current_user));
        }
        let handle = ObjectHandle::new(object);
        let mut index = self.index.lock();
        index.prune();
        index.insert(&handle, None, class_name);
        debug!("Created {}", handle.object_ref());
        Ok(handle)
    }

    /// Find the live instance for an identity, if any.
    pub fn lookup(&self, object_ref: &ObjectRef) -> Option<ObjectHandle> {
        let index = self.index.lock();
        match object_ref {
            ObjectRef::Saved {
                class_name,
                object_id,
            } => index
                .by_id
                .get(&(class_name.clone(), object_id.clone()))
                .and_then(ObjectHandle::upgrade),
            ObjectRef::Unsaved { local_id, .. } => {
                index.by_local.get(local_id).and_then(ObjectHandle::upgrade)
            }
        }
    }

    /// Find the live instance by local id.
    pub fn lookup_local(&self, local_id: LocalId) -> Option<ObjectHandle> {
        self.index
            .lock()
            .by_local
            .get(&local_id)
            .and_then(ObjectHandle::upgrade)
    }

    /// Intern an object from remote data and merge the data into it.
    pub fn materialize(&self, data: &ObjectData) -> Result<ObjectHandle> {
        let handle = self.intern(&data.class_name, &data.object_id)?;
        handle.lock().merge(data)?;
        Ok(handle)
    }

    /// Rebuild an object from a persisted record.
    ///
    /// Reuses the live instance when there is one, otherwise builds one with
    /// the recorded local id so that queued commands still resolve to it.
    pub fn restore(&self, record: &ObjectRecord) -> Result<ObjectHandle> {
        validate_class_name(&record.class_name)?;
        let existing = record
            .object_id
            .as_ref()
            .and_then(|id| self.lookup(&ObjectRef::saved(&record.class_name, id)))
            .or_else(|| self.lookup_local(record.local_id));
        let handle = match existing {
            Some(handle) => handle,
            None => {
                let handle = ObjectHandle::new(
                    self.registry
                        .instantiate(&ObjectRef::unsaved(&record.class_name, record.local_id)),
                );
                let mut index = self.index.lock();
                index.prune();
                index.insert(&handle, record.object_id.as_deref(), &record.class_name);
                handle
            }
        };
        handle.lock().apply_record(record);
        Ok(handle)
    }

    /// Index an object under the object id it just received.
    pub fn assign_object_id(&self, handle: &ObjectHandle) {
        let object_ref = handle.object_ref();
        if let ObjectRef::Saved {
            class_name,
            object_id,
        } = &object_ref
        {
            self.index
                .lock()
                .insert(handle, Some(object_id), class_name);
            debug!("Assigned {} to local {}", object_ref, handle.local_id());
        }
    }

    /// Every live object.
    pub fn live_handles(&self) -> Vec<ObjectHandle> {
        let mut index = self.index.lock();
        index.prune();
        index
            .by_local
            .values()
            .filter_map(ObjectHandle::upgrade)
            .collect()
    }

    /// Repoint every live pointer to `from` at `to`.
    ///
    /// Returns the objects that changed.
    pub fn rewrite_references(&self, from: &ObjectRef, to: &ObjectRef) -> Vec<ObjectHandle> {
        self.live_handles()
            .into_iter()
            .filter(|handle| handle.lock().rewrite_ref(from, to))
            .collect()
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        let mut index = self.index.lock();
        index.prune();
        index.by_local.len()
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new(crate::registry::create_default_registry())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Permission;
    use eaves_common::Value;

    fn data(object_id: &str, title: &str) -> ObjectData {
        ObjectData {
            class_name: "Note".to_string(),
            object_id: object_id.to_string(),
            attributes: [("title".to_string(), Value::from(title))].into(),
            acl: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_intern_is_canonical() {
        let store = ObjectStore::default();
        let a = store.intern("Note", "n1").unwrap();
        let b = store.intern("Note", "n1").unwrap();
        assert!(a.ptr_eq(&b));
        assert!(!a.lock().is_data_available());

        let c = store.intern("Note", "n2").unwrap();
        assert!(!a.ptr_eq(&c));
        assert!(store.intern("bad class", "x").is_err());
    }

    #[test]
    fn test_dropped_objects_leave_the_map() {
        let store = ObjectStore::default();
        let first = store.materialize(&data("n1", "A")).unwrap();
        assert_eq!(store.live_count(), 1);
        drop(first);
        assert_eq!(store.live_count(), 0);

        let again = store.intern("Note", "n1").unwrap();
        assert!(!again.lock().is_data_available());
    }

    #[test]
    fn test_materialize_merges() {
        let store = ObjectStore::default();
        let handle = store.intern("Note", "n1").unwrap();
        store.materialize(&data("n1", "A")).unwrap();
        assert_eq!(handle.lock().get("title"), Some(&Value::from("A")));
    }

    #[test]
    fn test_create_then_assign_id() {
        let store = ObjectStore::default();
        let handle = store.create("Note", None).unwrap();
        let local = handle.object_ref();
        assert!(store.lookup(&local).is_some());

        let delta = handle.lock().save_delta();
        handle.lock().confirm_save(&delta, &data("n9", "A")).unwrap();
        store.assign_object_id(&handle);

        let by_id = store.lookup(&ObjectRef::saved("Note", "n9")).unwrap();
        assert!(by_id.ptr_eq(&handle));
        assert!(store.lookup_local(handle.local_id()).is_some());
    }

    #[test]
    fn test_default_acl_applied_and_copied() {
        let store = ObjectStore::default();
        let mut template = Acl::new();
        template.set_public_read_access(true);
        store.set_default_acl(&template, true);
        template.set_public_write_access(true);

        let handle = store.create("Note", Some("u1")).unwrap();
        let object = handle.lock();
        let acl = object.acl().unwrap();
        assert!(acl.public_access(Permission::Read));
        assert!(!acl.public_access(Permission::Update));
        assert!(acl.user_access("u1", Permission::Update));
        assert!(object.save_delta().acl.is_some());
    }

    #[test]
    fn test_rewrite_references() {
        let store = ObjectStore::default();
        let child = store.create("Tag", None).unwrap();
        let parent = store.create("Note", None).unwrap();
        let old = child.object_ref();
        parent.lock().set("tag", old.clone()).unwrap();

        let new = ObjectRef::saved("Tag", "t1");
        let changed = store.rewrite_references(&old, &new);
        assert_eq!(changed.len(), 1);
        assert!(changed[0].ptr_eq(&parent));
        assert_eq!(parent.lock().get("tag").and_then(Value::as_pointer), Some(&new));
    }

    #[test]
    fn test_restore_reuses_local_id() {
        let store = ObjectStore::default();
        let handle = store.create("Note", None).unwrap();
        handle.lock().set("title", "A").unwrap();
        let record = handle.lock().to_record();
        let local_id = handle.local_id();
        drop(handle);

        let restored = store.restore(&record).unwrap();
        assert_eq!(restored.local_id(), local_id);
        assert_eq!(restored.lock().get("title"), Some(&Value::from("A")));
        assert!(restored.lock().is_key_dirty("title"));
    }
}
