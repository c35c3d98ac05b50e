//! Pinning datastore.
//!
//! Bridges the in-memory [`ObjectStore`] and the SQLite [`LocalStore`].
//! Pinning an object also pins everything it references: referenced
//! objects whose data is loaded are stored with content, the others only
//! as members so a later fetch of them still reports a cache miss.
//!
//! Unpinning drops the named objects and every member that is no longer
//! reachable from the pin's remaining roots.

use std::collections::{HashSet, VecDeque};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use eaves_common::{Error, LocalId, ObjectRef, Result};
use eaves_model::{ObjectHandle, ObjectRecord, ObjectStore};
use eaves_storage::{IntegrityReport, LocalStore, ObjectData, PinSummary, QuerySpec, StoredRecord};

fn validate_pin_name(pin_name: &str) -> Result<()> {
    if pin_name.trim().is_empty() {
        return Err(Error::InvalidInput("Pin name must not be empty".to_string()));
    }
    Ok(())
}

/// Durable pinned-object storage.
pub struct PinningDatastore {
    local: LocalStore,
    objects: Arc<ObjectStore>,
    /// Serializes pin and unpin so an unpin never drops members a
    /// concurrent pin just added.
    membership: Mutex<()>,
}

impl PinningDatastore {
    pub fn new(local: LocalStore, objects: Arc<ObjectStore>) -> Self {
        Self {
            local,
            objects,
            membership: Mutex::new(()),
        }
    }

    /// Underlying SQLite store.
    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// Pin `roots` and everything reachable from them under `pin_name`.
    ///
    /// Returns the number of objects written. The write is atomic.
    ///
    /// # Errors
    /// - Empty pin name
    /// - Storage failure
    pub fn pin(&self, roots: &[ObjectHandle], pin_name: &str) -> Result<usize> {
        validate_pin_name(pin_name)?;
        let _guard = self.membership.lock();
        let records = self.collect(roots)?;
        self.local.write_pin(pin_name, &records)?;
        info!(
            "Pinned {} objects ({} roots) under '{}'",
            records.len(),
            roots.len(),
            pin_name
        );
        Ok(records.len())
    }

    /// Walk the reference graph breadth first, visiting each identity once.
    fn collect(&self, roots: &[ObjectHandle]) -> Result<Vec<StoredRecord>> {
        let mut visited: HashSet<ObjectRef> = HashSet::new();
        let mut pending: VecDeque<(ObjectRef, Option<ObjectHandle>)> = roots
            .iter()
            .map(|h| (h.object_ref(), Some(h.clone())))
            .collect();
        let root_refs: HashSet<ObjectRef> = roots.iter().map(ObjectHandle::object_ref).collect();
        let mut records = Vec::new();

        while let Some((object_ref, handle)) = pending.pop_front() {
            if !visited.insert(object_ref.clone()) {
                continue;
            }
            let handle = handle.or_else(|| self.objects.lookup(&object_ref));
            let payload = match handle {
                Some(handle) => {
                    let (record, references, available, deleted) = {
                        let object = handle.lock();
                        (
                            object.to_record(),
                            object.references(),
                            object.is_data_available(),
                            object.is_deleted(),
                        )
                    };
                    if deleted {
                        continue;
                    }
                    pending.extend(references.into_iter().map(|r| (r, None)));
                    if available {
                        Some(record.to_json()?)
                    } else {
                        None
                    }
                }
                None => None,
            };
            records.push(StoredRecord {
                class_name: object_ref.class_name().to_string(),
                object_key: object_ref.object_key(),
                payload,
                root: root_refs.contains(&object_ref),
            });
        }
        Ok(records)
    }

    /// Remove objects from one pin.
    ///
    /// Members that were only pinned because a removed object referenced
    /// them leave the pin too; members still reachable from another root of
    /// the pin stay. Returns the number of memberships removed.
    pub fn unpin(&self, handles: &[ObjectHandle], pin_name: &str) -> Result<usize> {
        validate_pin_name(pin_name)?;
        let _guard = self.membership.lock();
        let removed: HashSet<(String, String)> = handles
            .iter()
            .map(|h| {
                let r = h.object_ref();
                (r.class_name().to_string(), r.object_key())
            })
            .collect();
        let members: HashSet<(String, String)> =
            self.local.pin_members(pin_name)?.into_iter().collect();
        let roots: Vec<(String, String)> = self
            .local
            .pin_roots(pin_name)?
            .into_iter()
            .filter(|root| !removed.contains(root))
            .collect();
        let reachable = self.reachable(&roots, &members, &removed);

        let dropped: Vec<(String, String)> = members
            .into_iter()
            .filter(|member| !reachable.contains(member))
            .collect();
        let count = self.local.remove_from_pin(pin_name, &dropped)?;
        debug!("Unpinned {} objects from '{}'", count, pin_name);
        Ok(count)
    }

    /// Members reachable from `roots` without passing through `excluded`.
    ///
    /// References are read from the live object when there is one, else
    /// from its stored copy.
    fn reachable(
        &self,
        roots: &[(String, String)],
        members: &HashSet<(String, String)>,
        excluded: &HashSet<(String, String)>,
    ) -> HashSet<(String, String)> {
        let mut reached = HashSet::new();
        let mut pending: VecDeque<(String, String)> = roots.iter().cloned().collect();
        while let Some(key) = pending.pop_front() {
            if excluded.contains(&key) || !members.contains(&key) || !reached.insert(key.clone()) {
                continue;
            }
            let references = self.references_of(&key.0, &key.1);
            pending.extend(
                references
                    .into_iter()
                    .map(|r| (r.class_name().to_string(), r.object_key())),
            );
        }
        reached
    }

    fn references_of(&self, class_name: &str, object_key: &str) -> Vec<ObjectRef> {
        let object_ref = match object_key.strip_prefix("local:").map(LocalId::parse) {
            Some(Ok(local_id)) => ObjectRef::unsaved(class_name, local_id),
            _ => ObjectRef::saved(class_name, object_key),
        };
        if let Some(handle) = self.objects.lookup(&object_ref) {
            let object = handle.lock();
            if object.is_data_available() {
                return object.references();
            }
        }
        let mut refs = Vec::new();
        if let Ok(record) = self.fetch_record(&object_ref) {
            record.attributes.values().for_each(|v| v.collect_refs(&mut refs));
        }
        refs
    }

    /// Empty a pin.
    pub fn unpin_all(&self, pin_name: &str) -> Result<usize> {
        validate_pin_name(pin_name)?;
        let _guard = self.membership.lock();
        self.local.clear_pin(pin_name)
    }

    /// Load a pinned object's stored record.
    ///
    /// # Errors
    /// - `CacheMiss` unless the object is pinned with content
    pub fn fetch_record(&self, object_ref: &ObjectRef) -> Result<ObjectRecord> {
        let payload = self
            .local
            .read_object(object_ref.class_name(), &object_ref.object_key())?
            .ok_or_else(|| Error::CacheMiss(format!("{} is not pinned", object_ref)))?;
        ObjectRecord::from_json(&payload)
    }

    /// Load a pinned object into the object store.
    ///
    /// # Errors
    /// - `CacheMiss` unless the object is pinned with content
    pub fn fetch(&self, object_ref: &ObjectRef) -> Result<ObjectHandle> {
        let record = self.fetch_record(object_ref)?;
        self.objects.restore(&record)
    }

    /// Evaluate a query against pinned objects only.
    ///
    /// With `pin_name` only that pin is searched.
    pub fn find(&self, query: &QuerySpec, pin_name: Option<&str>) -> Result<Vec<ObjectHandle>> {
        let records = self
            .local
            .pinned_payloads(pin_name, Some(&query.class_name))?
            .iter()
            .map(|payload| ObjectRecord::from_json(payload))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|r| query.matches(r.object_id.as_deref(), &r.attributes))
            .collect();
        query
            .apply_window(records, |r: &ObjectRecord| &r.attributes)
            .iter()
            .map(|r| self.objects.restore(r))
            .collect()
    }

    /// Whether the object belongs to any pin.
    pub fn is_pinned(&self, object_ref: &ObjectRef) -> Result<bool> {
        self.local
            .is_pinned(object_ref.class_name(), &object_ref.object_key())
    }

    /// Rewrite the stored copy of a pinned object from memory.
    ///
    /// Returns false if the object is not stored.
    pub fn refresh(&self, handle: &ObjectHandle) -> Result<bool> {
        let (object_ref, record) = {
            let object = handle.lock();
            if !object.is_data_available() || object.is_deleted() {
                return Ok(false);
            }
            (object.object_ref(), object.to_record())
        };
        self.local.refresh_object(
            object_ref.class_name(),
            &object_ref.object_key(),
            &record.to_json()?,
        )
    }

    /// Move a stored object from its local key to its new object id.
    pub fn rekey(&self, from: &ObjectRef, to: &ObjectRef) -> Result<()> {
        self.local
            .rekey_object(from.class_name(), &from.object_key(), &to.object_key())
    }

    /// Drop a deleted object from every pin.
    pub fn forget(&self, object_ref: &ObjectRef) -> Result<()> {
        self.local
            .forget_object(object_ref.class_name(), &object_ref.object_key())
    }

    /// Remember the network result of a query.
    pub fn cache_query_result(&self, query: &QuerySpec, results: &[ObjectData]) -> Result<()> {
        let payload =
            serde_json::to_string(results).map_err(|e| Error::Serialization(e.to_string()))?;
        self.local.put_query_result(&query.signature()?, &payload)
    }

    /// The last network result of a query, if cached.
    pub fn cached_query_result(&self, query: &QuerySpec) -> Result<Option<Vec<ObjectData>>> {
        self.local
            .get_query_result(&query.signature()?)?
            .map(|payload| {
                serde_json::from_str(&payload).map_err(|e| Error::Serialization(e.to_string()))
            })
            .transpose()
    }

    pub fn clear_query_cache(&self) -> Result<usize> {
        self.local.clear_query_results()
    }

    pub fn pins(&self) -> Result<Vec<PinSummary>> {
        self.local.pins()
    }

    /// Delete stored objects no pin references.
    pub fn compact(&self) -> Result<usize> {
        self.local.compact()
    }

    pub fn verify(&self) -> Result<IntegrityReport> {
        self.local.verify()
    }
}
