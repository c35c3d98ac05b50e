//! Client facade that orchestrates objects, queries, pins and the command
//! queue against one remote store.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eaves_common::{codes, Attributes, Error, FieldOp, LocalId, ObjectRef, Result};
use eaves_model::config::{
    CONFIG_FILENAME, DATASTORE_FILENAME, JOURNAL_FILENAME, SESSION_FILENAME,
};
use eaves_model::role::ROLE_CLASS;
use eaves_model::{
    create_default_registry, evaluate, Acl, Actor, ClassRegistry, ClientConfig, ObjectHandle,
    ObjectRecord, ObjectStore, Permission, Role, RoleDirectory, SaveDelta, Session,
    SessionManager,
};
use eaves_storage::query::OBJECT_ID_KEY;
use eaves_storage::{LocalStore, ObjectData, QuerySpec, RemoteStore, RequestContext};

use crate::datastore::PinningDatastore;
use crate::drain::{DrainMode, DrainReport, DrainScheduler};
use crate::hooks::{Observers, RequestInfo, RequestKind, RequestObserver, TracingObserver};
use crate::policy::{CachePolicy, QueryExecutor, ResultSet, ResultStream};
use crate::queue::{CommandId, CommandKind, CommandQueue, QueueEvent, QueuedCommand};
use crate::retry::{RetryConfig, RetryExecutor};

/// Result of sending one queued command.
enum Dispatched {
    Saved(ObjectData),
    Deleted,
    /// Nothing to send, e.g. deleting an object that was never created.
    Skipped,
    /// Waits for the create of an object it points to.
    Blocked,
}

enum Settled {
    Completed,
    Retried,
    Failed,
    Blocked,
}

struct ClientInner {
    /// Configuration.
    config: ClientConfig,
    /// Remote store.
    remote: Arc<dyn RemoteStore>,
    /// Identity map.
    objects: Arc<ObjectStore>,
    /// Pinned objects and cached queries, when enabled.
    datastore: Option<Arc<PinningDatastore>>,
    /// Eventual saves and deletes.
    queue: Mutex<CommandQueue>,
    /// Current actor.
    sessions: Arc<SessionManager>,
    /// Roles used for local ACL evaluation.
    roles: parking_lot::RwLock<RoleDirectory>,
    /// Request hooks.
    observers: Observers,
    /// Retry executor for direct calls.
    retry: Arc<RetryExecutor>,
    /// Backoff schedule for queued commands.
    queue_retry: RetryConfig,
    /// Query runner.
    queries: QueryExecutor,
    /// Background drain task.
    drain: parking_lot::Mutex<Option<(DrainScheduler, JoinHandle<()>)>>,
}

/// Entry point of the library.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Open a client with the built-in class registry.
    pub async fn open(config: ClientConfig, remote: Arc<dyn RemoteStore>) -> Result<Self> {
        Self::with_registry(config, remote, create_default_registry()).await
    }

    /// Open a client.
    ///
    /// With a data directory the command journal and the session survive
    /// restarts; with the local datastore enabled pins do too.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - `Integrity` if the datastore holds a partially applied write
    /// - Unreadable journal or session file
    pub async fn with_registry(
        config: ClientConfig,
        remote: Arc<dyn RemoteStore>,
        registry: ClassRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let objects = Arc::new(ObjectStore::new(registry));

        let (datastore, queue, sessions) = match &config.data_dir {
            Some(dir) => {
                fs::create_dir_all(dir).await.map_err(Error::Io)?;
                fs::write(dir.join(CONFIG_FILENAME), config.to_json()?)
                    .await
                    .map_err(Error::Io)?;
                let datastore = if config.local_datastore_enabled {
                    let local = LocalStore::open(dir.join(DATASTORE_FILENAME))?;
                    Some(Arc::new(PinningDatastore::new(local, objects.clone())))
                } else {
                    None
                };
                (
                    datastore,
                    CommandQueue::open(dir.join(JOURNAL_FILENAME)).await?,
                    SessionManager::open(dir.join(SESSION_FILENAME)).await?,
                )
            }
            None => (None, CommandQueue::in_memory(), SessionManager::in_memory()),
        };

        let sessions = Arc::new(sessions);
        let observers = Observers::new();
        observers.add(Arc::new(TracingObserver));
        let retry = Arc::new(RetryExecutor::new(
            RetryConfig::new(config.network_retry_attempts)
                .with_initial_delay(config.queue_retry.initial_backoff())
                .with_max_delay(config.queue_retry.max_backoff())
                .with_timeout(config.request_timeout()),
        ));
        let queries = QueryExecutor::new(
            remote.clone(),
            objects.clone(),
            datastore.clone(),
            sessions.clone(),
            observers.clone(),
            retry.clone(),
        );

        info!(
            "Client opened against {} via {} ({} queued commands, datastore {})",
            config.server,
            remote.name(),
            queue.len(),
            if datastore.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                queue_retry: RetryConfig::from(&config.queue_retry),
                config,
                remote,
                objects,
                datastore,
                queue: Mutex::new(queue),
                sessions,
                roles: parking_lot::RwLock::new(RoleDirectory::new()),
                observers,
                retry,
                queries,
                drain: parking_lot::Mutex::new(None),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The identity map backing this client.
    pub fn object_store(&self) -> &Arc<ObjectStore> {
        &self.inner.objects
    }

    /// The pinning datastore, if enabled.
    pub fn datastore(&self) -> Option<&Arc<PinningDatastore>> {
        self.inner.datastore.as_ref()
    }

    /// Register a request observer.
    pub fn add_observer(&self, observer: Arc<dyn RequestObserver>) {
        self.inner.observers.add(observer);
    }

    // ---- objects ----

    /// Create a new unsaved object carrying the default ACL.
    pub fn object(&self, class_name: &str) -> Result<ObjectHandle> {
        let user_id = self.inner.sessions.current_user_id();
        self.inner.objects.create(class_name, user_id.as_deref())
    }

    /// The canonical instance of a saved object, without fetching it.
    pub fn object_without_data(&self, class_name: &str, object_id: &str) -> Result<ObjectHandle> {
        self.inner.objects.intern(class_name, object_id)
    }

    /// Find the instance an identity refers to.
    ///
    /// Looks at live objects, then pins, then the queued saves of an
    /// unsaved object (after a restart that is the only place its state
    /// survives). Saved identities fall back to an unfetched placeholder.
    ///
    /// # Errors
    /// - `CacheMiss` for an unsaved identity nothing knows about
    pub async fn resolve(&self, object_ref: &ObjectRef) -> Result<ObjectHandle> {
        if let Some(handle) = self.inner.objects.lookup(object_ref) {
            return Ok(handle);
        }
        if let Some(datastore) = &self.inner.datastore {
            match datastore.fetch(object_ref) {
                Ok(handle) => return Ok(handle),
                Err(Error::CacheMiss(_)) => {}
                Err(e) => return Err(e),
            }
        }
        match object_ref {
            ObjectRef::Saved {
                class_name,
                object_id,
            } => self.inner.objects.intern(class_name, object_id),
            ObjectRef::Unsaved {
                class_name,
                local_id,
            } => {
                let record = self.record_from_queue(object_ref, class_name, *local_id).await?;
                self.inner.objects.restore(&record)
            }
        }
    }

    async fn record_from_queue(
        &self,
        object_ref: &ObjectRef,
        class_name: &str,
        local_id: LocalId,
    ) -> Result<ObjectRecord> {
        let queue = self.inner.queue.lock().await;
        let mut attributes = Attributes::new();
        let mut acl = None;
        let mut found = false;
        for command in queue.commands_for(object_ref) {
            if let CommandKind::Save { delta } = &command.kind {
                found = true;
                for (key, op) in &delta.changes {
                    match op {
                        FieldOp::Set(value) => {
                            attributes.insert(key.clone(), value.clone());
                        }
                        FieldOp::Unset => {
                            attributes.remove(key);
                        }
                    }
                }
                if delta.acl.is_some() {
                    acl = delta.acl.clone();
                }
            }
        }
        if !found {
            return Err(Error::CacheMiss(format!(
                "{} is not loaded, pinned or queued",
                object_ref
            )));
        }
        Ok(ObjectRecord {
            class_name: class_name.to_string(),
            object_id: None,
            local_id,
            attributes,
            acl,
            created_at: None,
            updated_at: None,
            dirty_keys: Vec::new(),
        })
    }

    /// Save an object now.
    ///
    /// Unsaved objects it points to are saved first. Fails if the object
    /// still has queued commands, since a direct save would overtake them.
    ///
    /// # Errors
    /// - `Unauthorized` when local ACL checks deny the update
    /// - Remote rejections and network errors after retries
    pub async fn save(&self, handle: &ObjectHandle) -> Result<()> {
        let mut visiting = HashSet::new();
        self.save_inner(handle, &mut visiting).await?;
        self.notify_drain();
        Ok(())
    }

    fn save_inner<'a>(
        &'a self,
        handle: &'a ObjectHandle,
        visiting: &'a mut HashSet<LocalId>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !visiting.insert(handle.local_id()) {
                return Err(Error::InvalidInput(format!(
                    "Unsaved objects around {} point to each other",
                    handle.object_ref()
                )));
            }
            let (target, deleted, children) = {
                let object = handle.lock();
                let children: Vec<ObjectRef> = object
                    .references()
                    .into_iter()
                    .filter(|r| r.object_id().is_none())
                    .collect();
                (object.object_ref(), object.is_deleted(), children)
            };
            if deleted {
                return Err(Error::InvalidInput(format!("{} has been deleted", target)));
            }
            self.ensure_not_queued(&target).await?;
            self.ensure_access(handle, Permission::Update)?;

            for child in children {
                let child_handle = self.inner.objects.lookup(&child).ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "{} points to unsaved {} which is no longer loaded",
                        target, child
                    ))
                })?;
                self.save_inner(&child_handle, visiting).await?;
            }

            let delta = handle.lock().save_delta();
            if delta.is_empty() && target.object_id().is_some() {
                debug!("Nothing to save for {}", target);
                return Ok(());
            }

            let token = self.inner.sessions.current_token();
            let data = self.send_save(&target, &delta, token.clone(), false).await?;
            let current = ObjectRef::saved(target.class_name(), &data.object_id);
            if target != current {
                self.inner.queue.lock().await.reassign(&target, &current).await?;
                self.identity_assigned(&target, &current);
            }
            if let Some(handle) = self.absorb_save(&target, &current, &delta, &data)? {
                self.follow_up(&handle, token).await?;
            }
            info!("Saved {}", current);
            Ok(())
        })
    }

    /// Queue a save to be sent when the remote is reachable.
    ///
    /// Unsaved objects it points to are queued first. Returns `None` when
    /// there is nothing to save.
    pub async fn save_eventually(&self, handle: &ObjectHandle) -> Result<Option<CommandId>> {
        let mut visiting = HashSet::new();
        let id = self.enqueue_save(handle, &mut visiting).await?;
        self.notify_drain();
        Ok(id)
    }

    fn enqueue_save<'a>(
        &'a self,
        handle: &'a ObjectHandle,
        visiting: &'a mut HashSet<LocalId>,
    ) -> BoxFuture<'a, Result<Option<CommandId>>> {
        Box::pin(async move {
            if !visiting.insert(handle.local_id()) {
                return Ok(None);
            }
            let (target, deleted, children) = {
                let object = handle.lock();
                let children: Vec<ObjectRef> = object
                    .references()
                    .into_iter()
                    .filter(|r| r.object_id().is_none())
                    .collect();
                (object.object_ref(), object.is_deleted(), children)
            };
            if deleted {
                return Err(Error::InvalidInput(format!("{} has been deleted", target)));
            }
            self.ensure_access(handle, Permission::Update)?;

            for child in children {
                let queued = self.inner.queue.lock().await.has_pending_for(&child, None);
                if queued {
                    continue;
                }
                if let Some(child_handle) = self.inner.objects.lookup(&child) {
                    self.enqueue_save(&child_handle, visiting).await?;
                }
            }

            let delta = handle.lock().save_delta();
            if delta.is_empty() && target.object_id().is_some() {
                return Ok(None);
            }
            let token = self.inner.sessions.current_token();
            let id = self
                .inner
                .queue
                .lock()
                .await
                .enqueue(target.clone(), CommandKind::Save { delta }, token)
                .await?;
            self.refresh_pinned(handle);
            info!("Queued save {} for {}", id, target);
            Ok(Some(id))
        })
    }

    /// Save several objects, one after another.
    ///
    /// Every object is attempted; the first error is returned.
    pub async fn save_all(&self, handles: &[ObjectHandle]) -> Result<()> {
        let mut first_error = None;
        for handle in handles {
            if let Err(e) = self.save(handle).await {
                warn!("Failed to save {}: {}", handle.object_ref(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Delete an object now.
    ///
    /// Deleting an object that was never saved only marks it deleted.
    pub async fn delete(&self, handle: &ObjectHandle) -> Result<()> {
        let target = handle.object_ref();
        self.ensure_not_queued(&target).await?;
        let Some(object_id) = target.object_id() else {
            self.absorb_delete(&target);
            return Ok(());
        };
        self.ensure_access(handle, Permission::Delete)?;

        let class_name = target.class_name();
        let token = self.inner.sessions.current_token();
        let info = RequestInfo::new(RequestKind::Delete, class_name).with_object_id(object_id);
        self.call(info, token, true, |ctx| {
            let remote = self.inner.remote.clone();
            async move { remote.delete(&ctx, class_name, object_id).await }
        })
        .await?;

        self.absorb_delete(&target);
        info!("Deleted {}", target);
        Ok(())
    }

    /// Queue a delete to be sent when the remote is reachable.
    pub async fn delete_eventually(&self, handle: &ObjectHandle) -> Result<Option<CommandId>> {
        let target = handle.object_ref();
        let mut queue = self.inner.queue.lock().await;
        if target.object_id().is_none() && !queue.has_pending_for(&target, None) {
            drop(queue);
            self.absorb_delete(&target);
            return Ok(None);
        }
        self.ensure_access(handle, Permission::Delete)?;
        let token = self.inner.sessions.current_token();
        let id = queue
            .enqueue(target.clone(), CommandKind::Delete, token)
            .await?;
        drop(queue);
        info!("Queued delete {} for {}", id, target);
        self.notify_drain();
        Ok(Some(id))
    }

    /// Delete several objects, one after another.
    pub async fn delete_all(&self, handles: &[ObjectHandle]) -> Result<()> {
        let mut first_error = None;
        for handle in handles {
            if let Err(e) = self.delete(handle).await {
                warn!("Failed to delete {}: {}", handle.object_ref(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Load an object's full state from the remote.
    pub async fn fetch(&self, handle: &ObjectHandle) -> Result<()> {
        let target = handle.object_ref();
        let object_id = target.object_id().ok_or_else(|| {
            Error::from_code(
                codes::MISSING_OBJECT_ID,
                format!("{} has not been saved", target),
            )
        })?;
        let class_name = target.class_name();
        let token = self.inner.sessions.current_token();
        let info = RequestInfo::new(RequestKind::Fetch, class_name).with_object_id(object_id);
        let data = self
            .call(info, token, true, |ctx| {
                let remote = self.inner.remote.clone();
                async move { remote.fetch(&ctx, class_name, object_id).await }
            })
            .await?;

        handle.lock().merge(&data)?;
        self.refresh_pinned(handle);
        Ok(())
    }

    /// Fetch unless the object's data is already loaded.
    pub async fn fetch_if_needed(&self, handle: &ObjectHandle) -> Result<()> {
        let available = handle.lock().is_data_available();
        if available {
            return Ok(());
        }
        self.fetch(handle).await
    }

    /// Get one object by id under a cache policy.
    ///
    /// # Errors
    /// - `ObjectNotFound` if no such object exists
    pub async fn get(
        &self,
        class_name: &str,
        object_id: &str,
        policy: CachePolicy,
    ) -> Result<ObjectHandle> {
        let query = QuerySpec::new(class_name)?
            .equal_to(OBJECT_ID_KEY, object_id)
            .limit(1);
        self.find(&query, policy)
            .await?
            .objects
            .into_iter()
            .next()
            .ok_or_else(|| Error::ObjectNotFound(format!("{}/{}", class_name, object_id)))
    }

    // ---- queries ----

    /// Run a query yielding a single result set.
    pub async fn find(&self, query: &QuerySpec, policy: CachePolicy) -> Result<ResultSet> {
        self.inner
            .queries
            .find(query, policy, &CancellationToken::new())
            .await
    }

    /// Like [`find`](Self::find), abandoned when `cancel` fires.
    pub async fn find_with_cancel(
        &self,
        query: &QuerySpec,
        policy: CachePolicy,
        cancel: &CancellationToken,
    ) -> Result<ResultSet> {
        self.inner.queries.find(query, policy, cancel).await
    }

    /// Run a query under any policy, including cache-then-network.
    pub fn query(
        &self,
        query: QuerySpec,
        policy: CachePolicy,
        cancel: CancellationToken,
    ) -> ResultStream {
        self.inner.queries.execute(query, policy, cancel)
    }

    /// Count matching objects on the remote.
    pub async fn count(&self, query: &QuerySpec) -> Result<u64> {
        self.inner.queries.count(query).await
    }

    // ---- pins ----

    fn require_datastore(&self) -> Result<&Arc<PinningDatastore>> {
        self.inner
            .datastore
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("Local datastore is not enabled".to_string()))
    }

    fn pin_name<'a>(&'a self, pin_name: Option<&'a str>) -> &'a str {
        pin_name.unwrap_or(self.inner.config.default_pin_name.as_str())
    }

    /// Pin an object under the default pin.
    pub fn pin(&self, handle: &ObjectHandle) -> Result<usize> {
        self.pin_all(std::slice::from_ref(handle), None)
    }

    /// Pin objects, and everything they reference, under `pin_name`.
    pub fn pin_all(&self, handles: &[ObjectHandle], pin_name: Option<&str>) -> Result<usize> {
        self.require_datastore()?
            .pin(handles, self.pin_name(pin_name))
    }

    /// Remove an object from the default pin.
    pub fn unpin(&self, handle: &ObjectHandle) -> Result<usize> {
        self.unpin_all(std::slice::from_ref(handle), None)
    }

    pub fn unpin_all(&self, handles: &[ObjectHandle], pin_name: Option<&str>) -> Result<usize> {
        self.require_datastore()?
            .unpin(handles, self.pin_name(pin_name))
    }

    /// Empty a pin.
    pub fn unpin_all_with_name(&self, pin_name: &str) -> Result<usize> {
        self.require_datastore()?.unpin_all(pin_name)
    }

    /// Empty the default pin.
    pub fn unpin_all_objects(&self) -> Result<usize> {
        self.unpin_all_with_name(self.pin_name(None))
    }

    /// Load a pinned object.
    ///
    /// # Errors
    /// - `CacheMiss` unless the object is pinned with content
    pub fn fetch_from_local_datastore(&self, object_ref: &ObjectRef) -> Result<ObjectHandle> {
        match &self.inner.datastore {
            Some(datastore) => datastore.fetch(object_ref),
            None => Err(Error::CacheMiss("local datastore is disabled".to_string())),
        }
    }

    /// Query pinned objects, optionally within one pin.
    pub fn find_in_local_datastore(
        &self,
        query: &QuerySpec,
        pin_name: Option<&str>,
    ) -> Result<Vec<ObjectHandle>> {
        self.require_datastore()?.find(query, pin_name)
    }

    // ---- sessions and access ----

    /// Make the owner of `token` the current user.
    pub async fn become_user(&self, token: &str) -> Result<Session> {
        let info = RequestInfo::new(RequestKind::ValidateSession, eaves_model::registry::USER_CLASS);
        self.inner
            .observers
            .observe(
                info,
                self.inner.sessions.become_user(self.inner.remote.as_ref(), token),
            )
            .await
    }

    /// Clear the current user. Queued commands keep the session they were
    /// enqueued with.
    pub async fn log_out(&self) -> Result<()> {
        let info = RequestInfo::new(RequestKind::RevokeSession, eaves_model::registry::USER_CLASS);
        self.inner
            .observers
            .observe(info, self.inner.sessions.log_out(self.inner.remote.as_ref()))
            .await
    }

    pub fn current_user(&self) -> Option<Session> {
        self.inner.sessions.current()
    }

    pub fn current_actor(&self) -> Actor {
        self.inner.sessions.current_actor()
    }

    pub fn enable_automatic_user(&self) {
        self.inner.sessions.enable_automatic_user();
    }

    /// Template ACL for objects created from now on.
    pub fn set_default_acl(&self, acl: &Acl, grant_current_user: bool) {
        self.inner.objects.set_default_acl(acl, grant_current_user);
    }

    pub fn clear_default_acl(&self) {
        self.inner.objects.clear_default_acl();
    }

    /// Whether the current user holds `permission` on the object.
    ///
    /// Objects without an ACL are open to everyone.
    pub fn check_access(&self, handle: &ObjectHandle, permission: Permission) -> bool {
        let acl = handle.lock().acl().cloned();
        match acl {
            None => true,
            Some(acl) => {
                let user_id = self.inner.sessions.current_user_id();
                evaluate(&acl, user_id.as_deref(), permission, &self.inner.roles.read())
            }
        }
    }

    fn ensure_access(&self, handle: &ObjectHandle, permission: Permission) -> Result<()> {
        if !self.inner.config.local_acl_checks {
            return Ok(());
        }
        let target = handle.object_ref();
        if target.object_id().is_none() || self.check_access(handle, permission) {
            return Ok(());
        }
        Err(Error::Unauthorized(format!(
            "{:?} access to {} denied",
            permission, target
        )))
    }

    /// Reload every role from the remote.
    pub async fn refresh_roles(&self) -> Result<usize> {
        let query = QuerySpec::new(ROLE_CLASS)?;
        let token = self.inner.sessions.current_token();
        let info = RequestInfo::new(RequestKind::Find, ROLE_CLASS);
        let data = self
            .call(info, token, true, |ctx| {
                let remote = self.inner.remote.clone();
                let query = &query;
                async move { remote.find(&ctx, query).await }
            })
            .await?;
        let directory = RoleDirectory::from_objects(&data);
        let count = directory.len();
        *self.inner.roles.write() = directory;
        debug!("Loaded {} roles", count);
        Ok(count)
    }

    /// Add or replace a role known locally.
    pub fn upsert_role(&self, role: Role) {
        self.inner.roles.write().upsert(role);
    }

    // ---- command queue ----

    pub async fn queue_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.queue.lock().await.subscribe()
    }

    /// Commands not yet in a terminal state, in enqueue order.
    pub async fn pending_commands(&self) -> Vec<QueuedCommand> {
        self.inner.queue.lock().await.pending()
    }

    /// Permanently failed commands awaiting acknowledgement.
    pub async fn failed_commands(&self) -> Vec<QueuedCommand> {
        self.inner.queue.lock().await.failed().to_vec()
    }

    pub async fn acknowledge_failure(&self, id: CommandId) -> Result<Option<QueuedCommand>> {
        self.inner.queue.lock().await.acknowledge(id).await
    }

    /// Send every dispatchable command.
    ///
    /// Lanes run concurrently and each command is settled as soon as its
    /// response arrives; within a lane commands go one at a time in enqueue
    /// order. Commands in backoff stay queued.
    ///
    /// # Errors
    /// The first journal write that failed. Every command of the batch is
    /// settled or handed back to its lane before the error is returned.
    pub async fn drain_queue(&self) -> Result<DrainReport> {
        let started = Instant::now();
        let mut report = DrainReport::default();
        let mut first_error = None;

        while first_error.is_none() {
            let batch = self.inner.queue.lock().await.take_ready(Utc::now()).await?;
            if batch.is_empty() {
                break;
            }
            debug!("Dispatching {} queued commands", batch.len());
            let mut in_flight: FuturesUnordered<_> = batch
                .iter()
                .map(|command| async move { (command, self.dispatch(command).await) })
                .collect();

            let mut blocked = Vec::new();
            while let Some((command, outcome)) = in_flight.next().await {
                match self.settle(command, outcome).await {
                    Ok(Settled::Completed) => report.completed += 1,
                    Ok(Settled::Retried) => report.retried += 1,
                    Ok(Settled::Failed) => report.failed += 1,
                    Ok(Settled::Blocked) => blocked.push(command),
                    Err(e) => {
                        self.release(command, &e).await;
                        first_error.get_or_insert(e);
                    }
                }
            }
            // Settle blocked commands last so a create completed in this
            // batch unblocks them for the next round.
            for command in blocked {
                let delay = if self.is_blocked(&command.kind).await {
                    self.inner.queue_retry.delay_for_attempt(0)
                } else {
                    Duration::ZERO
                };
                let deferred = self.inner.queue.lock().await.defer(command.id, delay).await;
                if let Err(e) = deferred {
                    self.release(command, &e).await;
                    first_error.get_or_insert(e);
                }
            }
        }

        report.remaining = self.inner.queue.lock().await.len();
        report.duration = started.elapsed();
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Give a command whose settlement failed back to its lane.
    async fn release(&self, command: &QueuedCommand, error: &Error) {
        warn!("Could not settle command {} for {}: {}", command.id, command.target, error);
        self.inner.queue.lock().await.release(command.id);
    }

    /// Drain in the background according to `mode`, and after every
    /// enqueue.
    pub fn start_background_drain(&self, mode: DrainMode) {
        let mut slot = self.inner.drain.lock();
        if slot.is_some() {
            return;
        }
        let (scheduler, handle) = DrainScheduler::new(mode);
        let weak: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(handle.run(move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => Client { inner }.drain_queue().await,
                    None => Err(Error::Cancelled),
                }
            }
        }));
        scheduler.notify();
        *slot = Some((scheduler, task));
    }

    fn notify_drain(&self) {
        if let Some((scheduler, _)) = self.inner.drain.lock().as_ref() {
            scheduler.notify();
        }
    }

    /// Stop the background drain task.
    pub async fn shutdown(&self) {
        let running = self.inner.drain.lock().take();
        if let Some((scheduler, task)) = running {
            scheduler.shutdown().await;
            if let Err(e) = task.await {
                warn!("Drain task ended abnormally: {}", e);
            }
        }
        info!("Client shut down");
    }

    // ---- internals ----

    /// Run one remote call with observation, retrying transient failures
    /// when `retry` is set. Every attempt is bounded by the request timeout.
    async fn call<T, F, Fut>(
        &self,
        info: RequestInfo,
        session_token: Option<String>,
        retry: bool,
        op: F,
    ) -> Result<T>
    where
        F: Fn(RequestContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempt = || {
            let ctx = RequestContext::new(session_token.clone());
            let info = RequestInfo {
                request_id: ctx.request_id,
                ..info.clone()
            };
            self.inner
                .observers
                .observe(info, self.inner.retry.bounded(op(ctx)))
        };
        if retry {
            self.inner.retry.execute(attempt).await
        } else {
            attempt().await
        }
    }

    async fn send_save(
        &self,
        target: &ObjectRef,
        delta: &SaveDelta,
        session_token: Option<String>,
        queued: bool,
    ) -> Result<ObjectData> {
        let request = delta.to_request();
        let class_name = target.class_name();
        match target.object_id() {
            None => {
                let mut info = RequestInfo::new(RequestKind::Create, class_name);
                info.queued = queued;
                self.call(info, session_token, !queued, |ctx| {
                    let remote = self.inner.remote.clone();
                    let request = request.clone();
                    async move { remote.create(&ctx, class_name, request).await }
                })
                .await
            }
            Some(object_id) => {
                let mut info =
                    RequestInfo::new(RequestKind::Update, class_name).with_object_id(object_id);
                info.queued = queued;
                self.call(info, session_token, !queued, |ctx| {
                    let remote = self.inner.remote.clone();
                    let request = request.clone();
                    async move { remote.update(&ctx, class_name, object_id, request).await }
                })
                .await
            }
        }
    }

    async fn ensure_not_queued(&self, target: &ObjectRef) -> Result<()> {
        if self.inner.queue.lock().await.has_pending_for(target, None) {
            return Err(Error::InvalidInput(format!(
                "{} has queued commands; use the eventual operations until they drain",
                target
            )));
        }
        Ok(())
    }

    /// Whether a command points to an object whose create is still queued.
    async fn is_blocked(&self, kind: &CommandKind) -> bool {
        let CommandKind::Save { delta } = kind else {
            return false;
        };
        let unsaved: Vec<ObjectRef> = delta
            .references()
            .into_iter()
            .filter(|r| r.object_id().is_none())
            .collect();
        if unsaved.is_empty() {
            return false;
        }
        let queue = self.inner.queue.lock().await;
        unsaved.iter().any(|r| queue.has_pending_for(r, None))
    }

    async fn dispatch(&self, command: &QueuedCommand) -> Result<Dispatched> {
        match &command.kind {
            CommandKind::Delete => {
                let Some(object_id) = command.target.object_id() else {
                    return Ok(Dispatched::Skipped);
                };
                let class_name = command.target.class_name();
                let info = RequestInfo::new(RequestKind::Delete, class_name)
                    .with_object_id(object_id)
                    .queued();
                self.call(info, command.session_token.clone(), false, |ctx| {
                    let remote = self.inner.remote.clone();
                    async move { remote.delete(&ctx, class_name, object_id).await }
                })
                .await?;
                Ok(Dispatched::Deleted)
            }
            CommandKind::Save { delta } => {
                if self.is_blocked(&command.kind).await {
                    return Ok(Dispatched::Blocked);
                }
                let data = self
                    .send_save(&command.target, delta, command.session_token.clone(), true)
                    .await?;
                Ok(Dispatched::Saved(data))
            }
        }
    }

    async fn settle(&self, command: &QueuedCommand, outcome: Result<Dispatched>) -> Result<Settled> {
        match outcome {
            Ok(Dispatched::Saved(data)) => {
                let current = ObjectRef::saved(command.target.class_name(), &data.object_id);
                {
                    let mut queue = self.inner.queue.lock().await;
                    if command.target != current {
                        queue.complete_create(command.id, &current).await?;
                    } else {
                        queue.complete(command.id).await?;
                    }
                }
                if command.target != current {
                    self.identity_assigned(&command.target, &current);
                }
                if let CommandKind::Save { delta } = &command.kind {
                    match self.absorb_save(&command.target, &current, delta, &data) {
                        Ok(Some(handle)) => {
                            self.follow_up(&handle, command.session_token.clone())
                                .await?
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Saved {} but could not apply the response: {}", current, e),
                    }
                }
                Ok(Settled::Completed)
            }
            Ok(Dispatched::Deleted) => {
                self.inner.queue.lock().await.complete(command.id).await?;
                self.absorb_delete(&command.target);
                Ok(Settled::Completed)
            }
            Ok(Dispatched::Skipped) => {
                self.inner.queue.lock().await.complete(command.id).await?;
                self.absorb_delete(&command.target);
                Ok(Settled::Completed)
            }
            Ok(Dispatched::Blocked) => Ok(Settled::Blocked),
            Err(e) if e.is_retryable() => {
                let delay = self.inner.queue_retry.delay_for_attempt(command.attempts);
                self.inner
                    .queue
                    .lock()
                    .await
                    .retry_later(command.id, &e, delay)
                    .await?;
                Ok(Settled::Retried)
            }
            Err(e) => {
                self.inner.queue.lock().await.fail(command.id, &e).await?;
                Ok(Settled::Failed)
            }
        }
    }

    /// Propagate a newly assigned object id to pins and live pointers.
    fn identity_assigned(&self, previous: &ObjectRef, current: &ObjectRef) {
        if let Some(datastore) = &self.inner.datastore {
            if let Err(e) = datastore.rekey(previous, current) {
                warn!("Failed to rekey pinned {}: {}", previous, e);
            }
        }
        for handle in self.inner.objects.rewrite_references(previous, current) {
            self.refresh_pinned(&handle);
        }
    }

    /// Apply a save response to the object it belongs to.
    ///
    /// The object is the live instance if there is one, otherwise its pinned
    /// copy. Returns the object that was updated, if any.
    fn absorb_save(
        &self,
        previous: &ObjectRef,
        current: &ObjectRef,
        delta: &SaveDelta,
        data: &ObjectData,
    ) -> Result<Option<ObjectHandle>> {
        let live = self
            .inner
            .objects
            .lookup(previous)
            .or_else(|| self.inner.objects.lookup(current));
        let handle = match (live, &self.inner.datastore) {
            (Some(handle), _) => Some(handle),
            (None, Some(datastore)) => datastore.fetch(current).ok(),
            (None, None) => None,
        };
        if let Some(handle) = &handle {
            handle.lock().confirm_save(delta, data)?;
            self.inner.objects.assign_object_id(handle);
            self.refresh_pinned(handle);
        }
        Ok(handle)
    }

    fn absorb_delete(&self, target: &ObjectRef) {
        if let Some(handle) = self.inner.objects.lookup(target) {
            handle.lock().mark_deleted();
        }
        if let Some(datastore) = &self.inner.datastore {
            if let Err(e) = datastore.forget(target) {
                warn!("Failed to drop deleted {} from pins: {}", target, e);
            }
        }
    }

    /// Queue what is still dirty after a save completed, unless a later
    /// command for the object is already waiting.
    async fn follow_up(&self, handle: &ObjectHandle, session_token: Option<String>) -> Result<()> {
        let (target, delta, dirty) = {
            let object = handle.lock();
            (
                object.object_ref(),
                object.save_delta(),
                object.is_dirty() && !object.is_deleted(),
            )
        };
        if !dirty || delta.is_empty() {
            return Ok(());
        }
        let mut queue = self.inner.queue.lock().await;
        if queue.has_pending_for(&target, None) {
            return Ok(());
        }
        let id = queue
            .enqueue(target.clone(), CommandKind::Save { delta }, session_token)
            .await?;
        info!("Queued follow-up save {} for {}", id, target);
        Ok(())
    }

    fn refresh_pinned(&self, handle: &ObjectHandle) {
        if let Some(datastore) = &self.inner.datastore {
            if let Err(e) = datastore.refresh(handle) {
                warn!("Failed to refresh pinned {}: {}", handle.object_ref(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eaves_common::Value;
    use eaves_model::QueueRetryConfig;
    use eaves_storage::{Fault, MemoryRemote, RemoteOp, SaveRequest, SessionInfo};
    use tempfile::TempDir;

    async fn client(remote: &MemoryRemote) -> Client {
        let config = ClientConfig::new("memory://", "test-app")
            .with_network_retry_attempts(0);
        Client::open(config, Arc::new(remote.clone())).await.unwrap()
    }

    async fn client_with_datastore(remote: &MemoryRemote, dir: &TempDir) -> Client {
        let config = ClientConfig::new("memory://", "test-app")
            .with_local_datastore(dir.path())
            .with_network_retry_attempts(0);
        Client::open(config, Arc::new(remote.clone())).await.unwrap()
    }

    #[tokio::test]
    async fn test_save_create_then_update() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;

        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save(&note).await.unwrap();

        let id = note.lock().object_id().unwrap().to_string();
        assert!(!note.lock().is_dirty());
        assert!(client.object_without_data("Note", &id).unwrap().ptr_eq(&note));

        note.lock().set("title", "B").unwrap();
        client.save(&note).await.unwrap();
        let ops: Vec<RemoteOp> = remote.requests().iter().map(|r| r.op).collect();
        assert_eq!(ops, vec![RemoteOp::Create, RemoteOp::Update]);
        assert_eq!(
            remote.get("Note", &id).unwrap().attributes.get("title"),
            Some(&Value::from("B"))
        );
    }

    #[tokio::test]
    async fn test_save_creates_children_first() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;

        let tag = client.object("Tag").unwrap();
        tag.lock().set("name", "work").unwrap();
        let note = client.object("Note").unwrap();
        note.lock().set("tag", tag.object_ref()).unwrap();

        client.save(&note).await.unwrap();
        let tag_ref = tag.object_ref();
        assert!(tag_ref.object_id().is_some());
        let stored = remote
            .get("Note", note.lock().object_id().unwrap())
            .unwrap();
        assert_eq!(
            stored.attributes.get("tag").and_then(Value::as_pointer),
            Some(&tag_ref)
        );
    }

    #[tokio::test]
    async fn test_rejection_keeps_object_dirty() {
        let remote = MemoryRemote::new();
        remote.add_unique_key("Note", "slug");
        let client = client(&remote).await;

        let first = client.object("Note").unwrap();
        first.lock().set("slug", "x").unwrap();
        client.save(&first).await.unwrap();

        let second = client.object("Note").unwrap();
        second.lock().set("slug", "x").unwrap();
        let err = client.save(&second).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateValue(_)));
        assert!(second.lock().object_id().is_none());
        assert!(second.lock().is_key_dirty("slug"));
    }

    #[tokio::test]
    async fn test_fetch_and_delete() {
        let remote = MemoryRemote::new();
        remote.seed(ObjectData {
            class_name: "Note".to_string(),
            object_id: "n1".to_string(),
            attributes: [("title".to_string(), Value::from("A"))].into(),
            acl: None,
            created_at: None,
            updated_at: None,
        });
        let client = client(&remote).await;

        let note = client.object_without_data("Note", "n1").unwrap();
        client.fetch_if_needed(&note).await.unwrap();
        assert_eq!(note.lock().get("title"), Some(&Value::from("A")));
        client.fetch_if_needed(&note).await.unwrap();
        assert_eq!(remote.requests().len(), 1);

        client.delete(&note).await.unwrap();
        assert!(note.lock().is_deleted());
        assert!(remote.get("Note", "n1").is_none());
        assert!(matches!(
            client.fetch(&note).await,
            Err(Error::ObjectNotFound(_))
        ));

        let unsaved = client.object("Note").unwrap();
        assert!(matches!(
            client.fetch(&unsaved).await,
            Err(Error::Remote { code: 104, .. })
        ));
    }

    #[tokio::test]
    async fn test_get_by_id() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;
        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save(&note).await.unwrap();
        let id = note.lock().object_id().unwrap().to_string();

        let found = client.get("Note", &id, CachePolicy::IgnoreCache).await.unwrap();
        assert!(found.ptr_eq(&note));
        assert!(matches!(
            client.get("Note", "missing", CachePolicy::IgnoreCache).await,
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_queued_save_drains_when_online() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;
        remote.set_online(false);

        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save_eventually(&note).await.unwrap().unwrap();

        let report = client.drain_queue().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.remaining, 1);
        assert!(note.lock().object_id().is_none());

        remote.set_online(true);
        // Skip the backoff.
        let command = client.pending_commands().await.remove(0);
        client
            .inner
            .queue
            .lock()
            .await
            .defer(command.id, Duration::ZERO)
            .await
            .unwrap();
        let report = client.drain_queue().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.remaining, 0);
        assert!(note.lock().object_id().is_some());
        assert!(!note.lock().is_dirty());
    }

    #[tokio::test]
    async fn test_direct_save_refused_while_queued() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;
        remote.set_online(false);

        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save_eventually(&note).await.unwrap();
        assert!(matches!(
            client.save(&note).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_failure_is_reported() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;
        let mut events = client.queue_events().await;

        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        remote.fail_next(Fault::Code(142));
        let id = client.save_eventually(&note).await.unwrap().unwrap();

        let report = client.drain_queue().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(client.pending_commands().await.is_empty());
        let failed = client.failed_commands().await;
        assert_eq!(failed[0].id, id);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Failed { code, .. } = event {
                assert_eq!(code, 142);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        assert!(client.acknowledge_failure(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_queued_pointer_waits_for_child_create() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;

        let tag = client.object("Tag").unwrap();
        tag.lock().set("name", "work").unwrap();
        let note = client.object("Note").unwrap();
        note.lock().set("tag", tag.object_ref()).unwrap();
        client.save_eventually(&note).await.unwrap();
        assert_eq!(client.pending_commands().await.len(), 2);

        let report = client.drain_queue().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);
        let tag_ref = tag.object_ref();
        let stored = remote
            .get("Note", note.lock().object_id().unwrap())
            .unwrap();
        assert_eq!(
            stored.attributes.get("tag").and_then(Value::as_pointer),
            Some(&tag_ref)
        );
    }

    #[tokio::test]
    async fn test_delete_eventually_of_unsaved_is_local() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;
        let note = client.object("Note").unwrap();
        assert!(client.delete_eventually(&note).await.unwrap().is_none());
        assert!(note.lock().is_deleted());
        assert!(remote.requests().is_empty());
    }

    #[tokio::test]
    async fn test_queued_commands_carry_enqueue_session() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;
        let session = remote.register_session("u1");
        client.become_user(&session.session_token).await.unwrap();
        remote.set_online(false);

        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save_eventually(&note).await.unwrap();

        remote.set_online(true);
        client.log_out().await.unwrap();
        let command = client.pending_commands().await.remove(0);
        assert_eq!(command.session_token.as_deref(), Some(session.session_token.as_str()));

        // The token was revoked by the log-out, so the replay is rejected.
        client.drain_queue().await.unwrap();
        let failed = client.failed_commands().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error_code, Some(codes::INVALID_SESSION_TOKEN));
    }

    /// Remote whose updates never answer.
    struct StalledUpdates(MemoryRemote);

    #[async_trait::async_trait]
    impl RemoteStore for StalledUpdates {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn create(
            &self,
            ctx: &RequestContext,
            class_name: &str,
            request: SaveRequest,
        ) -> Result<ObjectData> {
            self.0.create(ctx, class_name, request).await
        }

        async fn update(
            &self,
            _ctx: &RequestContext,
            _class_name: &str,
            _object_id: &str,
            _request: SaveRequest,
        ) -> Result<ObjectData> {
            std::future::pending().await
        }

        async fn delete(&self, ctx: &RequestContext, class_name: &str, object_id: &str) -> Result<()> {
            self.0.delete(ctx, class_name, object_id).await
        }

        async fn fetch(
            &self,
            ctx: &RequestContext,
            class_name: &str,
            object_id: &str,
        ) -> Result<ObjectData> {
            self.0.fetch(ctx, class_name, object_id).await
        }

        async fn find(&self, ctx: &RequestContext, query: &QuerySpec) -> Result<Vec<ObjectData>> {
            self.0.find(ctx, query).await
        }

        async fn count(&self, ctx: &RequestContext, query: &QuerySpec) -> Result<u64> {
            self.0.count(ctx, query).await
        }

        async fn validate_session(&self, token: &str) -> Result<SessionInfo> {
            self.0.validate_session(token).await
        }

        async fn revoke_session(&self, token: &str) -> Result<()> {
            self.0.revoke_session(token).await
        }
    }

    #[tokio::test]
    async fn test_unanswered_update_does_not_stall_other_lanes() {
        let memory = MemoryRemote::new();
        memory.seed(ObjectData {
            class_name: "Note".to_string(),
            object_id: "n1".to_string(),
            attributes: [("title".to_string(), Value::from("A"))].into(),
            acl: None,
            created_at: None,
            updated_at: None,
        });
        let config = ClientConfig::new("memory://", "test-app")
            .with_network_retry_attempts(0)
            .with_request_timeout(Duration::from_millis(50));
        let client = Client::open(config, Arc::new(StalledUpdates(memory.clone())))
            .await
            .unwrap();

        let note = client.object_without_data("Note", "n1").unwrap();
        note.lock().set("title", "B").unwrap();
        client.save_eventually(&note).await.unwrap().unwrap();
        let tag = client.object("Tag").unwrap();
        tag.lock().set("label", "urgent").unwrap();
        client.save_eventually(&tag).await.unwrap().unwrap();

        let report = tokio::time::timeout(Duration::from_secs(3), client.drain_queue())
            .await
            .expect("drain finishes")
            .unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.retried, 1);
        assert!(tag.lock().object_id().is_some());
        assert_eq!(memory.object_count("Tag"), 1);

        let pending = client.pending_commands().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, ObjectRef::saved("Note", "n1"));
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("no response"));
    }

    #[tokio::test]
    async fn test_unanswered_direct_call_times_out() {
        let memory = MemoryRemote::new();
        memory.seed(ObjectData {
            class_name: "Note".to_string(),
            object_id: "n1".to_string(),
            attributes: [("title".to_string(), Value::from("A"))].into(),
            acl: None,
            created_at: None,
            updated_at: None,
        });
        let config = ClientConfig::new("memory://", "test-app")
            .with_network_retry_attempts(1)
            .with_request_timeout(Duration::from_millis(20))
            .with_queue_retry(QueueRetryConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                multiplier: 1.0,
            });
        let client = Client::open(config, Arc::new(StalledUpdates(memory)))
            .await
            .unwrap();

        let note = client.object_without_data("Note", "n1").unwrap();
        note.lock().set("title", "B").unwrap();
        assert!(matches!(client.save(&note).await, Err(Error::Timeout(_))));
        assert!(note.lock().is_dirty());
    }

    /// Deletes the client's data directory when the first queued request
    /// goes out, so the journal writes that follow fail.
    struct RemoveDataDir {
        dir: std::path::PathBuf,
        armed: std::sync::atomic::AtomicBool,
    }

    impl RequestObserver for RemoveDataDir {
        fn before_dispatch(&self, request: &RequestInfo) {
            if request.queued && self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                std::fs::remove_dir_all(&self.dir).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_journal_failure_leaves_every_lane_dispatchable() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("client");
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let config = ClientConfig::new("memory://", "test-app")
            .with_data_dir(&dir)
            .with_network_retry_attempts(0)
            .with_queue_retry(QueueRetryConfig {
                initial_backoff_ms: 1,
                max_backoff_ms: 1,
                multiplier: 1.0,
            });
        let client = Client::open(config, Arc::new(remote.clone())).await.unwrap();

        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save_eventually(&note).await.unwrap().unwrap();
        let tag = client.object("Tag").unwrap();
        tag.lock().set("label", "urgent").unwrap();
        client.save_eventually(&tag).await.unwrap().unwrap();

        client.add_observer(Arc::new(RemoveDataDir {
            dir: dir.clone(),
            armed: std::sync::atomic::AtomicBool::new(true),
        }));
        assert!(matches!(client.drain_queue().await, Err(Error::Io(_))));
        let pending = client.pending_commands().await;
        assert_eq!(pending.len(), 2);
        assert!(pending
            .iter()
            .all(|c| c.status == crate::queue::CommandStatus::Pending));

        std::fs::create_dir_all(&dir).unwrap();
        remote.set_online(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = client.drain_queue().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.remaining, 0);
        assert!(note.lock().object_id().is_some());
        assert!(tag.lock().object_id().is_some());
    }

    #[tokio::test]
    async fn test_local_acl_checks() {
        let remote = MemoryRemote::new();
        let config = ClientConfig::new("memory://", "test-app")
            .with_network_retry_attempts(0)
            .with_local_acl_checks(true);
        let client = Client::open(config, Arc::new(remote.clone())).await.unwrap();

        let mut acl = Acl::new();
        acl.set_public_read_access(true);
        client.set_default_acl(&acl, false);

        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save(&note).await.unwrap();

        note.lock().set("title", "B").unwrap();
        assert!(matches!(
            client.save(&note).await,
            Err(Error::Unauthorized(_))
        ));
        assert!(client.check_access(&note, Permission::Read));
        assert!(!client.check_access(&note, Permission::Delete));

        let session = remote.register_session("u1");
        client.become_user(&session.session_token).await.unwrap();
        let mut editors = Role::new("Editors").unwrap();
        editors.add_user("u1");
        client.upsert_role(editors);
        let mut acl = note.lock().acl().cloned().unwrap();
        acl.set_role_access("Editors", Permission::Update, true).unwrap();
        note.lock().set_acl(acl).unwrap();
        assert!(client.check_access(&note, Permission::Update));
    }

    #[tokio::test]
    async fn test_refresh_roles() {
        let remote = MemoryRemote::new();
        remote.seed(ObjectData {
            class_name: ROLE_CLASS.to_string(),
            object_id: "r1".to_string(),
            attributes: [
                ("name".to_string(), Value::from("Admins")),
                (
                    "users".to_string(),
                    Value::Array(vec![Value::Pointer(ObjectRef::saved("_User", "u1"))]),
                ),
            ]
            .into(),
            acl: None,
            created_at: None,
            updated_at: None,
        });
        let client = client(&remote).await;
        assert_eq!(client.refresh_roles().await.unwrap(), 1);
        assert!(client.inner.roles.read().has_member("Admins", "u1"));
    }

    #[tokio::test]
    async fn test_pins_require_datastore() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;
        let note = client.object("Note").unwrap();
        assert!(client.pin(&note).is_err());
        assert!(matches!(
            client.fetch_from_local_datastore(&note.object_ref()),
            Err(Error::CacheMiss(_))
        ));
    }

    #[tokio::test]
    async fn test_pinned_object_is_rekeyed_on_create() {
        let temp = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let client = client_with_datastore(&remote, &temp).await;

        let note = client.object("Note").unwrap();
        note.lock().set("title", "draft").unwrap();
        client.pin(&note).unwrap();
        client.save(&note).await.unwrap();

        let saved = note.object_ref();
        let record = client
            .datastore()
            .unwrap()
            .fetch_record(&saved)
            .unwrap();
        assert_eq!(record.object_id.as_deref(), saved.object_id());
        assert!(record.dirty_keys.is_empty());
    }

    #[tokio::test]
    async fn test_background_drain() {
        let remote = MemoryRemote::new();
        let client = client(&remote).await;
        client.start_background_drain(DrainMode::Periodic {
            interval: Duration::from_millis(20),
        });

        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save_eventually(&note).await.unwrap();

        for _ in 0..50 {
            if note.lock().object_id().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(note.lock().object_id().is_some());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_offline_edit_survives_restart() {
        let temp = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let config = ClientConfig::new("memory://", "test-app")
            .with_data_dir(temp.path())
            .with_network_retry_attempts(0);

        let local_ref = {
            let client = Client::open(config.clone(), Arc::new(remote.clone()))
                .await
                .unwrap();
            let note = client.object("Note").unwrap();
            note.lock().set("title", "A").unwrap();
            client.save_eventually(&note).await.unwrap();
            note.object_ref()
        };

        let client = Client::open(config, Arc::new(remote.clone())).await.unwrap();
        let pending = client.pending_commands().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target, local_ref);

        let note = client.resolve(&local_ref).await.unwrap();
        assert_eq!(note.lock().get("title"), Some(&Value::from("A")));
        note.lock().set("title", "B").unwrap();
        client.save_eventually(&note).await.unwrap();

        remote.set_online(true);
        let report = client.drain_queue().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.remaining, 0);

        let id = note.lock().object_id().unwrap().to_string();
        assert_eq!(remote.object_count("Note"), 1);
        assert_eq!(
            remote.get("Note", &id).unwrap().attributes.get("title"),
            Some(&Value::from("B"))
        );
        assert!(!note.lock().is_dirty());
    }

    #[tokio::test]
    async fn test_lane_order_under_latency() {
        let remote = MemoryRemote::new().with_latency(Duration::from_millis(15));
        let client = client(&remote).await;

        let note = client.object("Note").unwrap();
        note.lock().set("title", "0").unwrap();
        client.save(&note).await.unwrap();
        let id = note.lock().object_id().unwrap().to_string();

        let mut others = Vec::new();
        for i in 1..=3 {
            note.lock().set("title", i.to_string()).unwrap();
            client.save_eventually(&note).await.unwrap();
            let other = client.object("Tag").unwrap();
            other.lock().set("name", format!("t{}", i)).unwrap();
            client.save_eventually(&other).await.unwrap();
            others.push(other);
        }

        let report = client.drain_queue().await.unwrap();
        assert_eq!(report.completed, 6);
        let sent: Vec<Value> = remote
            .requests()
            .iter()
            .filter(|r| r.op == RemoteOp::Update && r.object_id.as_deref() == Some(id.as_str()))
            .filter_map(|r| match r.changes.as_ref()?.get("title")? {
                FieldOp::Set(value) => Some(value.clone()),
                FieldOp::Unset => None,
            })
            .collect();
        assert_eq!(sent, vec![Value::from("1"), Value::from("2"), Value::from("3")]);
        assert_eq!(
            remote.get("Note", &id).unwrap().attributes.get("title"),
            Some(&Value::from("3"))
        );
        assert!(others.iter().all(|o| o.lock().object_id().is_some()));
    }

    #[tokio::test]
    async fn test_cache_then_network_through_client() {
        use futures::StreamExt;

        let temp = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let client = client_with_datastore(&remote, &temp).await;
        let note = client.object("Note").unwrap();
        note.lock().set("title", "A").unwrap();
        client.save(&note).await.unwrap();

        let query = QuerySpec::new("Note").unwrap();
        let cold = client.find(&query, CachePolicy::CacheOnly).await;
        assert!(matches!(cold, Err(Error::CacheMiss(_))));
        client.find(&query, CachePolicy::NetworkOnly).await.unwrap();

        let sets: Vec<ResultSet> = client
            .query(query, CachePolicy::CacheThenNetwork, CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].source, crate::policy::ResultSource::Cache);
        assert_eq!(sets[1].source, crate::policy::ResultSource::Network);
        assert!(sets[1].objects[0].ptr_eq(&note));
    }

    #[tokio::test]
    async fn test_unpin_releases_referenced_objects() {
        let temp = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        let client = client_with_datastore(&remote, &temp).await;

        let tag = client.object("Tag").unwrap();
        tag.lock().set("label", "work").unwrap();
        let note = client.object("Note").unwrap();
        note.lock().set("tag", tag.object_ref()).unwrap();
        client.save(&note).await.unwrap();
        assert_eq!(client.pin_all(&[note.clone()], Some("N")).unwrap(), 2);
        let tag_ref = tag.object_ref();
        drop(tag);

        assert_eq!(client.unpin_all(&[note], Some("N")).unwrap(), 2);
        client.datastore().unwrap().compact().unwrap();
        assert!(matches!(
            client.fetch_from_local_datastore(&tag_ref),
            Err(Error::CacheMiss(_))
        ));
        assert!(client.datastore().unwrap().pins().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pins_survive_restart() {
        let temp = TempDir::new().unwrap();
        let remote = MemoryRemote::new();

        let saved_ref = {
            let client = client_with_datastore(&remote, &temp).await;
            let note = client.object("Note").unwrap();
            note.lock().set("title", "A").unwrap();
            client.save(&note).await.unwrap();
            client.pin_all(&[note.clone()], Some("offline")).unwrap();
            note.object_ref()
        };

        let client = client_with_datastore(&remote, &temp).await;
        remote.clear_requests();
        let note = client.fetch_from_local_datastore(&saved_ref).unwrap();
        assert_eq!(note.lock().get("title"), Some(&Value::from("A")));

        let query = QuerySpec::new("Note").unwrap().equal_to("title", "A");
        let found = client.find_in_local_datastore(&query, Some("offline")).unwrap();
        assert_eq!(found.len(), 1);
        assert!(remote.requests().is_empty());

        assert_eq!(client.unpin_all_with_name("offline").unwrap(), 1);
        assert!(matches!(
            client.fetch_from_local_datastore(&saved_ref),
            Err(Error::CacheMiss(_))
        ));
    }
}
