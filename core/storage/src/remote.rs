//! Remote store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eaves_common::{Attributes, Delta, Result};

use crate::query::QuerySpec;

/// Per-request context sent with every remote call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique id of this logical request.
    pub request_id: Uuid,
    /// Session token of the actor issuing the request, when available.
    pub session_token: Option<String>,
}

impl RequestContext {
    /// Create a context carrying the given session token.
    pub fn new(session_token: Option<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            session_token,
        }
    }

    /// Create a context without credentials.
    pub fn anonymous() -> Self {
        Self::new(None)
    }
}

/// Object state as returned by the remote store.
///
/// For fetches and queries `attributes` is the full attribute set. For saves
/// it holds the values the server considers authoritative after the write,
/// which may be a subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectData {
    pub class_name: String,
    pub object_id: String,
    pub attributes: Attributes,
    /// ACL document in wire form, parsed by the model layer.
    pub acl: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Body of a create or update request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    /// Attribute operations to apply.
    pub changes: Delta,
    /// Replacement ACL document, if the ACL changed.
    pub acl: Option<serde_json::Value>,
}

/// Result of validating a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub user_id: String,
    pub session_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Remote store trait.
///
/// All operations are async. Implementations report failures with the
/// common error taxonomy: transient transport problems as
/// `ConnectionFailed`/`Timeout`, and permanent rejections as
/// `ObjectNotFound`, `DuplicateValue`, `ValidationRejected`, `Unauthorized`
/// or `Remote`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the remote name (e.g., "memory", "https").
    fn name(&self) -> &str;

    /// Create a new object.
    ///
    /// # Postconditions
    /// - The returned data carries the newly assigned object id
    ///
    /// # Errors
    /// - Duplicate unique value
    /// - Validation rejected
    /// - Network errors
    async fn create(
        &self,
        ctx: &RequestContext,
        class_name: &str,
        request: SaveRequest,
    ) -> Result<ObjectData>;

    /// Apply changes to an existing object.
    ///
    /// # Errors
    /// - Object not found
    /// - Duplicate unique value
    /// - Validation rejected
    /// - Network errors
    async fn update(
        &self,
        ctx: &RequestContext,
        class_name: &str,
        object_id: &str,
        request: SaveRequest,
    ) -> Result<ObjectData>;

    /// Delete an object.
    ///
    /// # Errors
    /// - Object not found
    async fn delete(&self, ctx: &RequestContext, class_name: &str, object_id: &str) -> Result<()>;

    /// Fetch the full state of an object.
    async fn fetch(
        &self,
        ctx: &RequestContext,
        class_name: &str,
        object_id: &str,
    ) -> Result<ObjectData>;

    /// Run a query and return matching objects with full data.
    async fn find(&self, ctx: &RequestContext, query: &QuerySpec) -> Result<Vec<ObjectData>>;

    /// Count objects matching a query.
    async fn count(&self, ctx: &RequestContext, query: &QuerySpec) -> Result<u64>;

    /// Validate a session token and return the session it belongs to.
    ///
    /// # Errors
    /// - `Unauthorized` if the token is unknown or revoked
    async fn validate_session(&self, token: &str) -> Result<SessionInfo>;

    /// Revoke a session token.
    async fn revoke_session(&self, token: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use eaves_common::{FieldOp, Value};

    #[test]
    fn test_object_data_serialization() {
        let data = ObjectData {
            class_name: "Note".to_string(),
            object_id: "n1".to_string(),
            attributes: Attributes::from([("title".to_string(), Value::from("A"))]),
            acl: Some(serde_json::json!({"*": {"read": true}})),
            created_at: Some(Utc::now()),
            updated_at: None,
        };

        let json = serde_json::to_string(&data).unwrap();
        let restored: ObjectData = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_save_request_default_is_empty() {
        let mut request = SaveRequest::default();
        assert!(request.changes.is_empty());
        request
            .changes
            .insert("title".to_string(), FieldOp::Set(Value::from("A")));
        assert_eq!(request.changes.len(), 1);
    }

    #[test]
    fn test_request_context_ids_unique() {
        let a = RequestContext::anonymous();
        let b = RequestContext::new(Some("tok".to_string()));
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(b.session_token.as_deref(), Some("tok"));
    }
}
