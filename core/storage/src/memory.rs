//! In-memory remote store for testing.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use eaves_common::{codes, Attributes, Delta, Error, FieldOp, ObjectRef, Result, Value};

use crate::query::QuerySpec;
use crate::remote::{ObjectData, RemoteStore, RequestContext, SaveRequest, SessionInfo};

/// Server-side validation hook for a class.
pub type Validator = Arc<dyn Fn(&Attributes) -> std::result::Result<(), String> + Send + Sync>;

/// Failure injected into the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    ConnectionFailed,
    Timeout,
    /// Structured rejection with the given error code.
    Code(i64),
}

impl Fault {
    fn into_error(self) -> Error {
        match self {
            Fault::ConnectionFailed => Error::ConnectionFailed("injected fault".to_string()),
            Fault::Timeout => Error::Timeout("injected fault".to_string()),
            Fault::Code(code) => Error::from_code(code, "injected fault"),
        }
    }
}

/// Kind of request recorded in the request log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Create,
    Update,
    Delete,
    Fetch,
    Find,
    Count,
}

/// One request observed by the memory remote.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub request_id: Uuid,
    pub op: RemoteOp,
    pub class_name: String,
    /// Target object id, or the assigned id for successful creates.
    pub object_id: Option<String>,
    pub changes: Option<Delta>,
    pub session_token: Option<String>,
    pub succeeded: bool,
}

#[derive(Default)]
struct State {
    objects: HashMap<(String, String), ObjectData>,
    sessions: HashMap<String, SessionInfo>,
    unique_keys: HashSet<(String, String)>,
    validators: HashMap<String, Validator>,
    faults: VecDeque<Fault>,
    offline: bool,
    log: Vec<RequestRecord>,
}

/// In-memory remote store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Supports connectivity toggling, fault injection,
/// unique keys, per-class validators and an optional random latency so
/// that concurrent requests complete out of order.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
    max_latency: Option<Duration>,
}

impl MemoryRemote {
    /// Create a new empty memory remote.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            max_latency: None,
        }
    }

    /// Delay every request by a random duration up to `max`.
    pub fn with_latency(mut self, max: Duration) -> Self {
        self.max_latency = Some(max);
        self
    }

    /// Toggle connectivity. While offline every request fails with
    /// `ConnectionFailed`.
    pub fn set_online(&self, online: bool) {
        self.state.lock().offline = !online;
    }

    pub fn is_online(&self) -> bool {
        !self.state.lock().offline
    }

    /// Fail the next request with the given fault.
    pub fn fail_next(&self, fault: Fault) {
        self.state.lock().faults.push_back(fault);
    }

    /// Declare `key` unique across objects of `class_name`.
    pub fn add_unique_key(&self, class_name: &str, key: &str) {
        self.state
            .lock()
            .unique_keys
            .insert((class_name.to_string(), key.to_string()));
    }

    /// Install a validator run against the full attributes on every save.
    pub fn set_validator(&self, class_name: &str, validator: Validator) {
        self.state
            .lock()
            .validators
            .insert(class_name.to_string(), validator);
    }

    /// Create a session for `user_id` and return it.
    pub fn register_session(&self, user_id: &str) -> SessionInfo {
        let info = SessionInfo {
            user_id: user_id.to_string(),
            session_token: format!("r:{}", Uuid::new_v4().simple()),
            expires_at: Some(Utc::now() + ChronoDuration::days(365)),
        };
        self.state
            .lock()
            .sessions
            .insert(info.session_token.clone(), info.clone());
        info
    }

    /// Insert an object directly, bypassing validation.
    pub fn seed(&self, data: ObjectData) {
        self.state
            .lock()
            .objects
            .insert((data.class_name.clone(), data.object_id.clone()), data);
    }

    /// Current server-side state of an object.
    pub fn get(&self, class_name: &str, object_id: &str) -> Option<ObjectData> {
        self.state
            .lock()
            .objects
            .get(&(class_name.to_string(), object_id.to_string()))
            .cloned()
    }

    /// Number of stored objects of a class.
    pub fn object_count(&self, class_name: &str) -> usize {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(c, _)| c == class_name)
            .count()
    }

    /// Snapshot of every request received so far, in completion order.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.state.lock().log.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().log.clear();
    }

    async fn simulate_latency(&self) {
        if let Some(max) = self.max_latency {
            let delay = max.mul_f64(rand::random::<f64>());
            tokio::time::sleep(delay).await;
        }
    }

    fn generate_object_id() -> String {
        Uuid::new_v4().simple().to_string()[..10].to_string()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Connectivity, injected faults and session checks shared by every request.
    fn admit(&mut self, ctx: &RequestContext) -> Result<()> {
        if self.offline {
            return Err(Error::ConnectionFailed("remote unreachable".to_string()));
        }
        if let Some(fault) = self.faults.pop_front() {
            return Err(fault.into_error());
        }
        if let Some(token) = &ctx.session_token {
            if !self.sessions.contains_key(token) {
                return Err(Error::Unauthorized("invalid session token".to_string()));
            }
        }
        Ok(())
    }

    fn record(
        &mut self,
        ctx: &RequestContext,
        op: RemoteOp,
        class_name: &str,
        object_id: Option<String>,
        changes: Option<Delta>,
        succeeded: bool,
    ) {
        self.log.push(RequestRecord {
            request_id: ctx.request_id,
            op,
            class_name: class_name.to_string(),
            object_id,
            changes,
            session_token: ctx.session_token.clone(),
            succeeded,
        });
    }

    /// Apply a save to `current`, enforcing uniqueness and validators.
    fn apply_save(
        &self,
        class_name: &str,
        object_id: &str,
        mut current: Attributes,
        request: &SaveRequest,
    ) -> Result<Attributes> {
        for (key, op) in &request.changes {
            match op {
                FieldOp::Set(value) => {
                    let mut refs = Vec::new();
                    value.collect_refs(&mut refs);
                    if refs.iter().any(|r| matches!(r, ObjectRef::Unsaved { .. })) {
                        return Err(Error::Remote {
                            code: codes::MISSING_OBJECT_ID,
                            message: format!("pointer in '{}' has no object id", key),
                        });
                    }
                    current.insert(key.clone(), value.clone());
                }
                FieldOp::Unset => {
                    current.remove(key);
                }
            }
        }

        for (key, value) in &current {
            if !self
                .unique_keys
                .contains(&(class_name.to_string(), key.clone()))
            {
                continue;
            }
            let taken = self.objects.iter().any(|((c, id), other)| {
                c == class_name && id != object_id && other.attributes.get(key) == Some(value)
            });
            if taken {
                return Err(Error::DuplicateValue(format!(
                    "{} already has an object with this '{}'",
                    class_name, key
                )));
            }
        }

        if let Some(validator) = self.validators.get(class_name) {
            validator(&current).map_err(Error::ValidationRejected)?;
        }
        Ok(current)
    }
}

fn check_acl_document(acl: &Option<serde_json::Value>) -> Result<()> {
    let Some(doc) = acl else {
        return Ok(());
    };
    let entries = doc
        .as_object()
        .ok_or_else(|| Error::InvalidAcl("ACL must be an object".to_string()))?;
    for (subject, grants) in entries {
        let grants = grants
            .as_object()
            .ok_or_else(|| Error::InvalidAcl(format!("grants for '{}' must be an object", subject)))?;
        if grants.values().any(|v| !v.is_boolean()) {
            return Err(Error::InvalidAcl(format!(
                "grants for '{}' must be booleans",
                subject
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(
        &self,
        ctx: &RequestContext,
        class_name: &str,
        request: SaveRequest,
    ) -> Result<ObjectData> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let result = state.admit(ctx).and_then(|_| {
            check_acl_document(&request.acl)?;
            let object_id = Self::generate_object_id();
            let attributes = state.apply_save(class_name, &object_id, Attributes::new(), &request)?;
            let now = Utc::now();
            Ok(ObjectData {
                class_name: class_name.to_string(),
                object_id,
                attributes,
                acl: request.acl.clone(),
                created_at: Some(now),
                updated_at: Some(now),
            })
        });

        let assigned = result.as_ref().ok().map(|d| d.object_id.clone());
        state.record(
            ctx,
            RemoteOp::Create,
            class_name,
            assigned,
            Some(request.changes.clone()),
            result.is_ok(),
        );
        if let Ok(data) = &result {
            debug!("Created {}/{}", class_name, data.object_id);
            state
                .objects
                .insert((class_name.to_string(), data.object_id.clone()), data.clone());
        }
        result
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        class_name: &str,
        object_id: &str,
        request: SaveRequest,
    ) -> Result<ObjectData> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let key = (class_name.to_string(), object_id.to_string());
        let result = state.admit(ctx).and_then(|_| {
            check_acl_document(&request.acl)?;
            let existing = state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::ObjectNotFound(format!("{}/{}", class_name, object_id)))?;
            let attributes =
                state.apply_save(class_name, object_id, existing.attributes.clone(), &request)?;
            Ok(ObjectData {
                attributes,
                acl: request.acl.clone().or(existing.acl),
                updated_at: Some(Utc::now()),
                ..existing
            })
        });

        state.record(
            ctx,
            RemoteOp::Update,
            class_name,
            Some(object_id.to_string()),
            Some(request.changes.clone()),
            result.is_ok(),
        );
        if let Ok(data) = &result {
            state.objects.insert(key, data.clone());
        }
        result
    }

    async fn delete(&self, ctx: &RequestContext, class_name: &str, object_id: &str) -> Result<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let key = (class_name.to_string(), object_id.to_string());
        let result = state.admit(ctx).and_then(|_| {
            state
                .objects
                .remove(&key)
                .map(|_| ())
                .ok_or_else(|| Error::ObjectNotFound(format!("{}/{}", class_name, object_id)))
        });
        state.record(
            ctx,
            RemoteOp::Delete,
            class_name,
            Some(object_id.to_string()),
            None,
            result.is_ok(),
        );
        result
    }

    async fn fetch(
        &self,
        ctx: &RequestContext,
        class_name: &str,
        object_id: &str,
    ) -> Result<ObjectData> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let key = (class_name.to_string(), object_id.to_string());
        let result = state.admit(ctx).and_then(|_| {
            state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::ObjectNotFound(format!("{}/{}", class_name, object_id)))
        });
        state.record(
            ctx,
            RemoteOp::Fetch,
            class_name,
            Some(object_id.to_string()),
            None,
            result.is_ok(),
        );
        result
    }

    async fn find(&self, ctx: &RequestContext, query: &QuerySpec) -> Result<Vec<ObjectData>> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let result = state.admit(ctx).map(|_| {
            let mut matching: Vec<ObjectData> = state
                .objects
                .values()
                .filter(|d| {
                    d.class_name == query.class_name
                        && query.matches(Some(&d.object_id), &d.attributes)
                })
                .cloned()
                .collect();
            // Stable base order before the query's own ordering.
            matching.sort_by(|a, b| a.object_id.cmp(&b.object_id));
            query.apply_window(matching, |d| &d.attributes)
        });
        state.record(ctx, RemoteOp::Find, &query.class_name, None, None, result.is_ok());
        result
    }

    async fn count(&self, ctx: &RequestContext, query: &QuerySpec) -> Result<u64> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        let result = state.admit(ctx).map(|_| {
            state
                .objects
                .values()
                .filter(|d| {
                    d.class_name == query.class_name
                        && query.matches(Some(&d.object_id), &d.attributes)
                })
                .count() as u64
        });
        state.record(ctx, RemoteOp::Count, &query.class_name, None, None, result.is_ok());
        result
    }

    async fn validate_session(&self, token: &str) -> Result<SessionInfo> {
        self.simulate_latency().await;
        let state = self.state.lock();
        if state.offline {
            return Err(Error::ConnectionFailed("remote unreachable".to_string()));
        }
        state
            .sessions
            .get(token)
            .cloned()
            .ok_or_else(|| Error::Unauthorized("invalid session token".to_string()))
    }

    async fn revoke_session(&self, token: &str) -> Result<()> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        if state.offline {
            return Err(Error::ConnectionFailed("remote unreachable".to_string()));
        }
        state.sessions.remove(token);
        Ok(())
    }
}
