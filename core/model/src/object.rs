//! Remote objects and dirty-state tracking.
//!
//! Every local edit stamps the edited key with a fresh generation number.
//! A save captures the current generations in its [`SaveDelta`]; when the
//! save is confirmed only keys whose generation is unchanged become clean,
//! so an edit made while the save was in flight stays dirty and is sent by
//! a later save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use eaves_common::{Attributes, Delta, Error, FieldOp, LocalId, ObjectRef, Result, Value};
use eaves_storage::{ObjectData, SaveRequest};

use crate::acl::Acl;

/// Dirty-key name used for ACL replacement.
pub const ACL_KEY: &str = "ACL";

const RESERVED_KEYS: [&str; 4] = ["objectId", "createdAt", "updatedAt", ACL_KEY];

/// Changes captured for one save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveDelta {
    /// Attribute operations.
    pub changes: Delta,
    /// Replacement ACL, if the ACL is dirty.
    pub acl: Option<Acl>,
    /// Edit generation of each captured key, including [`ACL_KEY`].
    pub generations: BTreeMap<String, u64>,
    /// Instance the generations belong to. Generations only clear dirty
    /// keys on the instance that captured them.
    #[serde(default)]
    pub epoch: Option<Uuid>,
}

impl SaveDelta {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.acl.is_none()
    }

    /// Build the remote request body.
    pub fn to_request(&self) -> SaveRequest {
        SaveRequest {
            changes: self.changes.clone(),
            acl: self.acl.as_ref().map(Acl::to_json),
        }
    }

    /// Object references carried by the changes.
    pub fn references(&self) -> Vec<ObjectRef> {
        let mut refs = Vec::new();
        self.changes.values().for_each(|op| op.collect_refs(&mut refs));
        refs
    }

    /// Rewrite pointers to `from` so they point to `to`.
    pub fn rewrite_ref(&mut self, from: &ObjectRef, to: &ObjectRef) -> bool {
        self.changes
            .values_mut()
            .fold(false, |changed, op| op.rewrite_ref(from, to) || changed)
    }
}

/// Serialized form of an object, used by the local datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub class_name: String,
    pub object_id: Option<String>,
    pub local_id: LocalId,
    pub attributes: Attributes,
    pub acl: Option<Acl>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Keys with local edits not yet confirmed by the remote.
    #[serde(default)]
    pub dirty_keys: Vec<String>,
}

impl ObjectRecord {
    pub fn object_ref(&self) -> ObjectRef {
        match &self.object_id {
            Some(id) => ObjectRef::saved(&self.class_name, id),
            None => ObjectRef::unsaved(&self.class_name, self.local_id),
        }
    }

    /// Serialize record to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize record from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// A mutable record mirrored from the remote service.
#[derive(Debug, Clone)]
pub struct RemoteObject {
    class_name: String,
    object_id: Option<String>,
    local_id: LocalId,
    attributes: Attributes,
    acl: Option<Acl>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    /// Dirty key -> generation of its latest local edit.
    dirty: BTreeMap<String, u64>,
    next_generation: u64,
    epoch: Uuid,
    data_available: bool,
    deleted: bool,
}

impl RemoteObject {
    /// Create a new unsaved object.
    pub fn new(class_name: impl Into<String>) -> Self {
        Self::with_local_id(class_name, LocalId::new())
    }

    /// Create an unsaved object with a known local id.
    pub fn with_local_id(class_name: impl Into<String>, local_id: LocalId) -> Self {
        Self {
            class_name: class_name.into(),
            object_id: None,
            local_id,
            attributes: Attributes::new(),
            acl: None,
            created_at: None,
            updated_at: None,
            dirty: BTreeMap::new(),
            next_generation: 1,
            epoch: Uuid::new_v4(),
            data_available: true,
            deleted: false,
        }
    }

    /// Create an unfetched placeholder for a saved object.
    pub fn placeholder(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        let mut object = Self::new(class_name);
        object.object_id = Some(object_id.into());
        object.data_available = false;
        object
    }

    /// Build the object an [`ObjectRef`] points to, with no data.
    pub fn from_ref(object_ref: &ObjectRef) -> Self {
        match object_ref {
            ObjectRef::Saved {
                class_name,
                object_id,
            } => Self::placeholder(class_name, object_id),
            ObjectRef::Unsaved {
                class_name,
                local_id,
            } => Self::with_local_id(class_name, *local_id),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    /// Current identity of this object.
    pub fn object_ref(&self) -> ObjectRef {
        match &self.object_id {
            Some(id) => ObjectRef::saved(&self.class_name, id),
            None => ObjectRef::unsaved(&self.class_name, self.local_id),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn acl(&self) -> Option<&Acl> {
        self.acl.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_data_available(&self) -> bool {
        self.data_available
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || self.object_id.is_none()
    }

    pub fn is_key_dirty(&self, key: &str) -> bool {
        self.dirty.contains_key(key)
    }

    pub fn dirty_keys(&self) -> Vec<String> {
        self.dirty.keys().cloned().collect()
    }

    fn touch(&mut self, key: &str) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.dirty.insert(key.to_string(), generation);
    }

    fn ensure_mutable(&self, key: &str) -> Result<()> {
        if self.deleted {
            return Err(Error::InvalidInput(format!(
                "Cannot modify deleted object {}",
                self.object_ref()
            )));
        }
        if RESERVED_KEYS.contains(&key) || key.is_empty() {
            return Err(Error::InvalidInput(format!("Key '{}' is reserved", key)));
        }
        Ok(())
    }

    /// Set an attribute and mark it dirty.
    ///
    /// # Errors
    /// - Reserved or empty key
    /// - Object is a tombstone
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.ensure_mutable(key)?;
        self.attributes.insert(key.to_string(), value.into());
        self.touch(key);
        Ok(())
    }

    /// Remove an attribute and mark it dirty.
    pub fn unset(&mut self, key: &str) -> Result<()> {
        self.ensure_mutable(key)?;
        self.attributes.remove(key);
        self.touch(key);
        Ok(())
    }

    /// Replace the ACL. This is a dirty mutation of [`ACL_KEY`].
    pub fn set_acl(&mut self, acl: Acl) -> Result<()> {
        if self.deleted {
            return Err(Error::InvalidInput(format!(
                "Cannot modify deleted object {}",
                self.object_ref()
            )));
        }
        self.acl = Some(acl);
        self.touch(ACL_KEY);
        Ok(())
    }

    /// Install the default ACL on a new object.
    pub(crate) fn init_acl(&mut self, acl: Acl) {
        self.acl = Some(acl);
        self.touch(ACL_KEY);
    }

    /// Capture the pending changes for a save.
    ///
    /// For unsaved objects every attribute is included so the create
    /// carries the full state.
    pub fn save_delta(&self) -> SaveDelta {
        let mut delta = SaveDelta {
            epoch: Some(self.epoch),
            ..SaveDelta::default()
        };
        let keys: Vec<&String> = if self.object_id.is_none() {
            self.attributes.keys().chain(self.dirty.keys()).collect()
        } else {
            self.dirty.keys().collect()
        };
        for key in keys {
            if key == ACL_KEY {
                delta.acl = self.acl.clone();
            } else {
                let op = match self.attributes.get(key) {
                    Some(value) => FieldOp::Set(value.clone()),
                    None => FieldOp::Unset,
                };
                delta.changes.insert(key.clone(), op);
            }
            if let Some(generation) = self.dirty.get(key) {
                delta.generations.insert(key.clone(), *generation);
            }
        }
        if self.object_id.is_none() && delta.acl.is_none() {
            delta.acl = self.acl.clone();
        }
        delta
    }

    /// Apply the remote's answer to a save of `delta`.
    ///
    /// Assigns the object id on create, clears the dirty keys whose
    /// generation still matches `delta`, then merges the returned values.
    /// A delta captured by another instance of the object (one rebuilt after
    /// a restart) carries foreign generations; for it a key is clean only if
    /// its value still equals the value sent.
    ///
    /// # Errors
    /// - Object id in the response differs from the known one
    /// - Malformed ACL in the response
    pub fn confirm_save(&mut self, delta: &SaveDelta, response: &ObjectData) -> Result<()> {
        match &self.object_id {
            None => self.object_id = Some(response.object_id.clone()),
            Some(id) if *id != response.object_id => {
                return Err(Error::InvalidInput(format!(
                    "Save response for {} carries object id {}",
                    self.object_ref(),
                    response.object_id
                )));
            }
            Some(_) => {}
        }
        let same_instance = delta.epoch == Some(self.epoch);
        for (key, generation) in &delta.generations {
            let confirmed = if same_instance {
                self.dirty.get(key) == Some(generation)
            } else {
                self.dirty.contains_key(key) && self.holds_sent_value(key, delta)
            };
            if confirmed {
                self.dirty.remove(key);
            }
        }
        self.merge_values(response)
    }

    /// Whether the local value of `key` is the one `delta` sent.
    fn holds_sent_value(&self, key: &str, delta: &SaveDelta) -> bool {
        if key == ACL_KEY {
            return delta.acl.is_some() && self.acl == delta.acl;
        }
        match delta.changes.get(key) {
            Some(FieldOp::Set(value)) => self.attributes.get(key) == Some(value),
            Some(FieldOp::Unset) => !self.attributes.contains_key(key),
            None => false,
        }
    }

    /// Apply server-authoritative data.
    ///
    /// Keys present in `incoming` overwrite local values unless they are
    /// dirty locally; keys absent from it are left untouched.
    ///
    /// # Errors
    /// - Malformed ACL in the response
    pub fn merge(&mut self, incoming: &ObjectData) -> Result<()> {
        if self.object_id.is_none() {
            self.object_id = Some(incoming.object_id.clone());
        }
        self.merge_values(incoming)?;
        self.data_available = true;
        Ok(())
    }

    fn merge_values(&mut self, incoming: &ObjectData) -> Result<()> {
        let acl = match &incoming.acl {
            Some(doc) if !self.dirty.contains_key(ACL_KEY) => Some(Acl::from_json(doc)?),
            _ => None,
        };
        for (key, value) in &incoming.attributes {
            if !self.dirty.contains_key(key) {
                self.attributes.insert(key.clone(), value.clone());
            }
        }
        if let Some(acl) = acl {
            self.acl = Some(acl);
        }
        if incoming.created_at.is_some() {
            self.created_at = incoming.created_at;
        }
        if incoming.updated_at.is_some() {
            self.updated_at = incoming.updated_at;
        }
        Ok(())
    }

    /// Turn the object into a tombstone after a remote delete.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.dirty.clear();
    }

    /// Object references held in attributes.
    pub fn references(&self) -> Vec<ObjectRef> {
        let mut refs = Vec::new();
        self.attributes.values().for_each(|v| v.collect_refs(&mut refs));
        refs
    }

    /// Rewrite pointers to `from` so they point to `to`.
    pub fn rewrite_ref(&mut self, from: &ObjectRef, to: &ObjectRef) -> bool {
        self.attributes
            .values_mut()
            .fold(false, |changed, v| v.rewrite_ref(from, to) || changed)
    }

    /// Snapshot for local persistence.
    pub fn to_record(&self) -> ObjectRecord {
        ObjectRecord {
            class_name: self.class_name.clone(),
            object_id: self.object_id.clone(),
            local_id: self.local_id,
            attributes: self.attributes.clone(),
            acl: self.acl.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            dirty_keys: self.dirty_keys(),
        }
    }

    /// Apply a persisted snapshot.
    ///
    /// Values for keys dirty in memory win over the snapshot. Keys dirty in
    /// the snapshot become dirty again.
    pub fn apply_record(&mut self, record: &ObjectRecord) {
        if self.object_id.is_none() {
            self.object_id = record.object_id.clone();
        }
        for (key, value) in &record.attributes {
            if !self.dirty.contains_key(key) {
                self.attributes.insert(key.clone(), value.clone());
            }
        }
        if !self.dirty.contains_key(ACL_KEY) && record.acl.is_some() {
            self.acl = record.acl.clone();
        }
        self.created_at = record.created_at.or(self.created_at);
        self.updated_at = record.updated_at.or(self.updated_at);
        for key in &record.dirty_keys {
            if !self.dirty.contains_key(key) {
                self.touch(key);
            }
        }
        self.data_available = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Permission;

    fn response(object_id: &str, pairs: &[(&str, Value)]) -> ObjectData {
        ObjectData {
            class_name: "Note".to_string(),
            object_id: object_id.to_string(),
            attributes: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            acl: None,
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_new_object_is_unsaved_and_dirty() {
        let mut note = RemoteObject::new("Note");
        assert!(note.object_id().is_none());
        assert!(note.is_dirty());
        note.set("title", "A").unwrap();
        assert_eq!(note.dirty_keys(), vec!["title".to_string()]);
        assert!(matches!(note.object_ref(), ObjectRef::Unsaved { .. }));
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let mut note = RemoteObject::new("Note");
        assert!(note.set("objectId", "x").is_err());
        assert!(note.set(ACL_KEY, "x").is_err());
        assert!(note.set("", "x").is_err());
    }

    #[test]
    fn test_create_delta_carries_all_attributes() {
        let mut note = RemoteObject::new("Note");
        note.set("title", "A").unwrap();
        note.set("body", "x").unwrap();
        note.unset("body").unwrap();

        let delta = note.save_delta();
        assert_eq!(delta.changes.get("title"), Some(&FieldOp::Set("A".into())));
        assert_eq!(delta.changes.get("body"), Some(&FieldOp::Unset));
        assert_eq!(delta.generations.len(), 2);
    }

    #[test]
    fn test_confirm_assigns_id_and_cleans() {
        let mut note = RemoteObject::new("Note");
        note.set("title", "A").unwrap();
        let delta = note.save_delta();

        note.confirm_save(&delta, &response("n1", &[])).unwrap();
        assert_eq!(note.object_id(), Some("n1"));
        assert!(!note.is_dirty());
        assert_eq!(note.get("title"), Some(&Value::from("A")));
    }

    #[test]
    fn test_edit_during_flight_stays_dirty() {
        let mut note = RemoteObject::new("Note");
        note.set("title", "A").unwrap();
        let delta = note.save_delta();

        note.set("title", "B").unwrap();
        note.confirm_save(&delta, &response("n1", &[("title", "A".into())]))
            .unwrap();

        assert!(note.is_key_dirty("title"));
        assert_eq!(note.get("title"), Some(&Value::from("B")));

        let follow_up = note.save_delta();
        assert_eq!(
            follow_up.changes.get("title"),
            Some(&FieldOp::Set("B".into()))
        );
        assert_eq!(follow_up.changes.len(), 1);
    }

    #[test]
    fn test_foreign_delta_does_not_clean() {
        let mut original = RemoteObject::new("Note");
        original.set("title", "A").unwrap();
        let delta = original.save_delta();

        let mut rebuilt = RemoteObject::with_local_id("Note", original.local_id());
        rebuilt.set("title", "B").unwrap();
        rebuilt
            .confirm_save(&delta, &response("n1", &[("title", "A".into())]))
            .unwrap();
        assert_eq!(rebuilt.object_id(), Some("n1"));
        assert!(rebuilt.is_key_dirty("title"));
        assert_eq!(rebuilt.get("title"), Some(&Value::from("B")));
    }

    #[test]
    fn test_foreign_delta_cleans_matching_values() {
        let mut original = RemoteObject::new("Note");
        original.set("title", "A").unwrap();
        original.set("body", "x").unwrap();
        let delta = original.save_delta();

        let mut rebuilt = RemoteObject::with_local_id("Note", original.local_id());
        rebuilt.set("title", "A").unwrap();
        rebuilt.set("body", "y").unwrap();
        rebuilt.confirm_save(&delta, &response("n1", &[])).unwrap();
        assert!(!rebuilt.is_key_dirty("title"));
        assert!(rebuilt.is_key_dirty("body"));
    }

    #[test]
    fn test_merge_keeps_dirty_and_absent_keys() {
        let mut note = RemoteObject::placeholder("Note", "n1");
        assert!(!note.is_data_available());
        note.merge(&response("n1", &[("title", "A".into()), ("body", "x".into())]))
            .unwrap();
        assert!(note.is_data_available());

        note.set("title", "mine").unwrap();
        note.merge(&response("n1", &[("title", "theirs".into())])).unwrap();
        assert_eq!(note.get("title"), Some(&Value::from("mine")));
        assert_eq!(note.get("body"), Some(&Value::from("x")));
    }

    #[test]
    fn test_merge_rejects_bad_acl() {
        let mut note = RemoteObject::placeholder("Note", "n1");
        let mut data = response("n1", &[]);
        data.acl = Some(serde_json::json!({"u1": "yes"}));
        assert!(matches!(note.merge(&data), Err(Error::InvalidAcl(_))));
    }

    #[test]
    fn test_acl_is_dirty_mutation() {
        let mut note = RemoteObject::placeholder("Note", "n1");
        note.set_acl(Acl::with_user("u1")).unwrap();
        assert!(note.is_key_dirty(ACL_KEY));

        let delta = note.save_delta();
        assert!(delta.changes.is_empty());
        let request = delta.to_request();
        let acl = Acl::from_json(request.acl.as_ref().unwrap()).unwrap();
        assert!(acl.user_access("u1", Permission::Update));
    }

    #[test]
    fn test_tombstone_rejects_edits() {
        let mut note = RemoteObject::placeholder("Note", "n1");
        note.mark_deleted();
        assert!(note.is_deleted());
        assert!(note.set("title", "A").is_err());
    }

    #[test]
    fn test_record_roundtrip_restores_dirty_keys() {
        let mut note = RemoteObject::new("Note");
        note.set("title", "A").unwrap();
        let record = note.to_record();
        let json = record.to_json().unwrap();
        let restored_record = ObjectRecord::from_json(&json).unwrap();

        let mut restored = RemoteObject::with_local_id("Note", restored_record.local_id);
        restored.apply_record(&restored_record);
        assert_eq!(restored.attributes(), note.attributes());
        assert!(restored.is_key_dirty("title"));
    }

    #[test]
    fn test_rewrite_pointer() {
        let author_local = ObjectRef::unsaved("Author", LocalId::new());
        let author_saved = ObjectRef::saved("Author", "a1");
        let mut note = RemoteObject::new("Note");
        note.set("author", author_local.clone()).unwrap();

        let mut delta = note.save_delta();
        assert_eq!(delta.references(), vec![author_local.clone()]);
        assert!(delta.rewrite_ref(&author_local, &author_saved));
        assert!(note.rewrite_ref(&author_local, &author_saved));
        assert_eq!(note.references(), vec![author_saved]);
    }
}
