//! Request observation hooks.
//!
//! Observers see every remote call the client makes, direct or queued,
//! before it is dispatched and after its response arrives. They cannot
//! alter the request.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use eaves_common::{Error, Result};

/// Kind of remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Create,
    Update,
    Delete,
    Fetch,
    Find,
    Count,
    ValidateSession,
    RevokeSession,
}

/// Description of one remote call.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub request_id: Uuid,
    pub kind: RequestKind,
    pub class_name: Option<String>,
    pub object_id: Option<String>,
    /// Whether the call replays a queued command.
    pub queued: bool,
}

impl RequestInfo {
    pub fn new(kind: RequestKind, class_name: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            kind,
            class_name: Some(class_name.into()),
            object_id: None,
            queued: false,
        }
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn queued(mut self) -> Self {
        self.queued = true;
        self
    }
}

/// How a remote call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Success,
    Failure {
        code: i64,
        message: String,
        retryable: bool,
    },
}

impl ResponseOutcome {
    fn from_error(err: &Error) -> Self {
        ResponseOutcome::Failure {
            code: err.code(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// Observer of remote calls.
pub trait RequestObserver: Send + Sync {
    /// Called before a request is sent.
    fn before_dispatch(&self, _request: &RequestInfo) {}

    /// Called once the request has completed.
    fn after_response(&self, _request: &RequestInfo, _outcome: &ResponseOutcome, _elapsed: Duration) {}
}

/// Observer that logs every call through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl RequestObserver for TracingObserver {
    fn before_dispatch(&self, request: &RequestInfo) {
        debug!(
            "-> {:?} {} {} ({})",
            request.kind,
            request.class_name.as_deref().unwrap_or("-"),
            request.object_id.as_deref().unwrap_or("-"),
            request.request_id
        );
    }

    fn after_response(&self, request: &RequestInfo, outcome: &ResponseOutcome, elapsed: Duration) {
        match outcome {
            ResponseOutcome::Success => {
                debug!("<- {:?} ok in {:?} ({})", request.kind, elapsed, request.request_id)
            }
            ResponseOutcome::Failure { code, message, .. } => warn!(
                "<- {:?} failed with {} in {:?}: {} ({})",
                request.kind, code, elapsed, message, request.request_id
            ),
        }
    }
}

/// Registered observers.
#[derive(Clone, Default)]
pub struct Observers {
    list: Arc<RwLock<Vec<Arc<dyn RequestObserver>>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn RequestObserver>) {
        self.list.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.list.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().is_empty()
    }

    /// Run `call`, notifying every observer around it.
    pub async fn observe<T, Fut>(&self, request: RequestInfo, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let observers = self.list.read().clone();
        observers.iter().for_each(|o| o.before_dispatch(&request));

        let started = Instant::now();
        let result = call.await;
        let elapsed = started.elapsed();

        if !observers.is_empty() {
            let outcome = match &result {
                Ok(_) => ResponseOutcome::Success,
                Err(e) => ResponseOutcome::from_error(e),
            };
            observers
                .iter()
                .for_each(|o| o.after_response(&request, &outcome, elapsed));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl RequestObserver for Recorder {
        fn before_dispatch(&self, request: &RequestInfo) {
            self.events.lock().push(format!("before {:?}", request.kind));
        }

        fn after_response(&self, request: &RequestInfo, outcome: &ResponseOutcome, _elapsed: Duration) {
            let label = match outcome {
                ResponseOutcome::Success => "ok".to_string(),
                ResponseOutcome::Failure { code, .. } => code.to_string(),
            };
            self.events
                .lock()
                .push(format!("after {:?} {}", request.kind, label));
        }
    }

    #[tokio::test]
    async fn test_observers_see_both_sides() {
        let observers = Observers::new();
        let recorder = Arc::new(Recorder::default());
        observers.add(recorder.clone());
        observers.add(Arc::new(TracingObserver));
        assert_eq!(observers.len(), 2);

        let ok: Result<u32> = observers
            .observe(RequestInfo::new(RequestKind::Fetch, "Note"), async { Ok(1) })
            .await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<u32> = observers
            .observe(RequestInfo::new(RequestKind::Create, "Note"), async {
                Err(Error::DuplicateValue("title".to_string()))
            })
            .await;
        assert!(err.is_err());

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "before Fetch".to_string(),
                "after Fetch ok".to_string(),
                "before Create".to_string(),
                "after Create 137".to_string(),
            ]
        );
    }
}
