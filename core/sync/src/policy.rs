//! Cache policies for queries.
//!
//! A query resolves against the local query result cache, the remote store,
//! or both, depending on its [`CachePolicy`]. Network results are merged
//! into the object store only after the request has completed and only if
//! the caller has not cancelled.

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use eaves_common::{Error, Result};
use eaves_model::{ObjectHandle, ObjectStore, SessionManager};
use eaves_storage::{ObjectData, QuerySpec, RemoteStore, RequestContext};

use crate::datastore::PinningDatastore;
use crate::hooks::{Observers, RequestInfo, RequestKind};
use crate::retry::RetryExecutor;

/// Where a query looks for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Network only; the result is not cached.
    #[default]
    IgnoreCache,
    /// Cache only; never touches the network.
    CacheOnly,
    /// Network only; the result is cached.
    NetworkOnly,
    /// Cache, falling back to the network on a miss.
    CacheElseNetwork,
    /// Network, falling back to the cache on any network failure.
    NetworkElseCache,
    /// Cached result first (when there is one), then the network result.
    CacheThenNetwork,
}

/// Origin of a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Cache,
    Network,
}

/// Objects answering a query.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub source: ResultSource,
    pub objects: Vec<ObjectHandle>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Stream of result sets produced by [`QueryExecutor::execute`].
pub type ResultStream = Pin<Box<dyn Stream<Item = Result<ResultSet>> + Send>>;

enum Step {
    Start,
    Network,
}

/// Runs queries under a cache policy.
#[derive(Clone)]
pub struct QueryExecutor {
    remote: Arc<dyn RemoteStore>,
    objects: Arc<ObjectStore>,
    datastore: Option<Arc<PinningDatastore>>,
    sessions: Arc<SessionManager>,
    observers: Observers,
    retry: Arc<RetryExecutor>,
}

impl QueryExecutor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        objects: Arc<ObjectStore>,
        datastore: Option<Arc<PinningDatastore>>,
        sessions: Arc<SessionManager>,
        observers: Observers,
        retry: Arc<RetryExecutor>,
    ) -> Self {
        Self {
            remote,
            objects,
            datastore,
            sessions,
            observers,
            retry,
        }
    }

    /// Run a query, yielding one result set, or two for
    /// [`CachePolicy::CacheThenNetwork`] when the cache has a match.
    pub fn execute(
        &self,
        query: QuerySpec,
        policy: CachePolicy,
        cancel: CancellationToken,
    ) -> ResultStream {
        let executor = self.clone();
        Box::pin(stream::unfold(Some(Step::Start), move |step| {
            let executor = executor.clone();
            let query = query.clone();
            let cancel = cancel.clone();
            async move {
                match step? {
                    Step::Start if policy == CachePolicy::CacheThenNetwork => {
                        match executor.from_cache(&query) {
                            Ok(cached) => Some((Ok(cached), Some(Step::Network))),
                            Err(e) => {
                                debug!("No cached result, going to network: {}", e);
                                let result = executor.from_network(&query, true, &cancel).await;
                                Some((result, None))
                            }
                        }
                    }
                    Step::Start => Some((executor.find(&query, policy, &cancel).await, None)),
                    Step::Network => {
                        Some((executor.from_network(&query, true, &cancel).await, None))
                    }
                }
            }
        }))
    }

    /// Run a query that yields exactly one result set.
    ///
    /// # Errors
    /// - `InvalidInput` for [`CachePolicy::CacheThenNetwork`]; use
    ///   [`execute`](Self::execute) instead
    /// - `CacheMiss` when the policy allows no further fallback
    /// - `Cancelled`
    pub async fn find(
        &self,
        query: &QuerySpec,
        policy: CachePolicy,
        cancel: &CancellationToken,
    ) -> Result<ResultSet> {
        match policy {
            CachePolicy::IgnoreCache => self.from_network(query, false, cancel).await,
            CachePolicy::NetworkOnly => self.from_network(query, true, cancel).await,
            CachePolicy::CacheOnly => self.from_cache(query),
            CachePolicy::CacheElseNetwork => match self.from_cache(query) {
                Ok(cached) => Ok(cached),
                Err(e) => {
                    debug!("Cache lookup failed, going to network: {}", e);
                    self.from_network(query, true, cancel).await
                }
            },
            CachePolicy::NetworkElseCache => match self.from_network(query, true, cancel).await {
                Ok(fresh) => Ok(fresh),
                Err(Error::Cancelled) => Err(Error::Cancelled),
                Err(e) => {
                    debug!("Network lookup failed, falling back to cache: {}", e);
                    self.from_cache(query)
                }
            },
            CachePolicy::CacheThenNetwork => Err(Error::InvalidInput(
                "Cache-then-network yields two results; use execute".to_string(),
            )),
        }
    }

    /// Count matching objects on the remote store.
    pub async fn count(&self, query: &QuerySpec) -> Result<u64> {
        self.retry
            .execute(|| {
                let ctx = RequestContext::new(self.sessions.current_token());
                let info = RequestInfo {
                    request_id: ctx.request_id,
                    ..RequestInfo::new(RequestKind::Count, &query.class_name)
                };
                let remote = self.remote.clone();
                let request = async move { remote.count(&ctx, query).await };
                self.observers.observe(info, self.retry.bounded(request))
            })
            .await
    }

    fn from_cache(&self, query: &QuerySpec) -> Result<ResultSet> {
        let datastore = self
            .datastore
            .as_ref()
            .ok_or_else(|| Error::CacheMiss("local datastore is disabled".to_string()))?;
        let cached = datastore.cached_query_result(query)?.ok_or_else(|| {
            Error::CacheMiss(format!("no cached result for query on {}", query.class_name))
        })?;
        let objects = self.materialize(&cached)?;
        Ok(ResultSet {
            source: ResultSource::Cache,
            objects,
        })
    }

    async fn from_network(
        &self,
        query: &QuerySpec,
        write_cache: bool,
        cancel: &CancellationToken,
    ) -> Result<ResultSet> {
        let call = self.retry.execute(|| {
            let ctx = RequestContext::new(self.sessions.current_token());
            let info = RequestInfo {
                request_id: ctx.request_id,
                ..RequestInfo::new(RequestKind::Find, &query.class_name)
            };
            let remote = self.remote.clone();
            let request = async move { remote.find(&ctx, query).await };
            self.observers.observe(info, self.retry.bounded(request))
        });
        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            results = call => results?,
        };
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let objects = self.materialize(&results)?;
        if let Some(datastore) = &self.datastore {
            for handle in &objects {
                if let Err(e) = datastore.refresh(handle) {
                    warn!("Failed to refresh pinned {}: {}", handle.object_ref(), e);
                }
            }
            if write_cache {
                if let Err(e) = datastore.cache_query_result(query, &results) {
                    warn!("Failed to cache query result: {}", e);
                }
            }
        }
        Ok(ResultSet {
            source: ResultSource::Network,
            objects,
        })
    }

    fn materialize(&self, data: &[ObjectData]) -> Result<Vec<ObjectHandle>> {
        data.iter().map(|d| self.objects.materialize(d)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eaves_common::Value;
    use eaves_storage::{LocalStore, MemoryRemote};
    use futures::StreamExt;
    use std::time::Duration;

    use crate::retry::RetryConfig;

    struct Fixture {
        remote: MemoryRemote,
        objects: Arc<ObjectStore>,
        executor: QueryExecutor,
    }

    fn fixture(remote: MemoryRemote, with_datastore: bool) -> Fixture {
        let objects = Arc::new(ObjectStore::default());
        let datastore = with_datastore.then(|| {
            Arc::new(PinningDatastore::new(
                LocalStore::in_memory().unwrap(),
                objects.clone(),
            ))
        });
        let executor = QueryExecutor::new(
            Arc::new(remote.clone()),
            objects.clone(),
            datastore,
            Arc::new(SessionManager::in_memory()),
            Observers::new(),
            Arc::new(RetryExecutor::new(
                RetryConfig::new(0).with_initial_delay(Duration::from_millis(1)),
            )),
        );
        Fixture {
            remote,
            objects,
            executor,
        }
    }

    fn seed(remote: &MemoryRemote, id: &str, title: &str) {
        remote.seed(ObjectData {
            class_name: "Note".to_string(),
            object_id: id.to_string(),
            attributes: [("title".to_string(), Value::from(title))].into(),
            acl: None,
            created_at: None,
            updated_at: None,
        });
    }

    fn notes() -> QuerySpec {
        QuerySpec::new("Note").unwrap().order_by_ascending("title")
    }

    #[tokio::test]
    async fn test_cache_only_miss_makes_no_request() {
        let f = fixture(MemoryRemote::new(), true);
        let err = f
            .executor
            .find(&notes(), CachePolicy::CacheOnly, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheMiss(_)));
        assert!(f.remote.requests().is_empty());
    }

    #[tokio::test]
    async fn test_network_result_is_cached() {
        let f = fixture(MemoryRemote::new(), true);
        seed(&f.remote, "n1", "A");
        let cancel = CancellationToken::new();

        let fresh = f
            .executor
            .find(&notes(), CachePolicy::NetworkOnly, &cancel)
            .await
            .unwrap();
        assert_eq!(fresh.source, ResultSource::Network);
        assert_eq!(fresh.len(), 1);

        let cached = f
            .executor
            .find(&notes(), CachePolicy::CacheOnly, &cancel)
            .await
            .unwrap();
        assert_eq!(cached.source, ResultSource::Cache);
        assert!(cached.objects[0].ptr_eq(&fresh.objects[0]));
        assert_eq!(f.remote.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_ignore_cache_does_not_write() {
        let f = fixture(MemoryRemote::new(), true);
        seed(&f.remote, "n1", "A");
        let cancel = CancellationToken::new();
        f.executor
            .find(&notes(), CachePolicy::IgnoreCache, &cancel)
            .await
            .unwrap();
        assert!(f
            .executor
            .find(&notes(), CachePolicy::CacheOnly, &cancel)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cache_then_network_yields_twice() {
        let f = fixture(MemoryRemote::new(), true);
        seed(&f.remote, "n1", "A");
        let cancel = CancellationToken::new();
        f.executor
            .find(&notes(), CachePolicy::NetworkOnly, &cancel)
            .await
            .unwrap();
        seed(&f.remote, "n2", "B");

        let results: Vec<_> = f
            .executor
            .execute(notes(), CachePolicy::CacheThenNetwork, cancel)
            .collect()
            .await;
        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        let second = results[1].as_ref().unwrap();
        assert_eq!(first.source, ResultSource::Cache);
        assert_eq!(first.len(), 1);
        assert_eq!(second.source, ResultSource::Network);
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_then_network_skips_empty_cache() {
        let f = fixture(MemoryRemote::new(), true);
        seed(&f.remote, "n1", "A");
        let results: Vec<_> = f
            .executor
            .execute(notes(), CachePolicy::CacheThenNetwork, CancellationToken::new())
            .collect()
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().source, ResultSource::Network);
    }

    #[tokio::test]
    async fn test_find_rejects_cache_then_network() {
        let f = fixture(MemoryRemote::new(), true);
        assert!(matches!(
            f.executor
                .find(&notes(), CachePolicy::CacheThenNetwork, &CancellationToken::new())
                .await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_network_else_cache() {
        let f = fixture(MemoryRemote::new(), true);
        let cancel = CancellationToken::new();
        f.remote.set_online(false);
        assert!(matches!(
            f.executor
                .find(&notes(), CachePolicy::NetworkElseCache, &cancel)
                .await,
            Err(Error::CacheMiss(_))
        ));

        f.remote.set_online(true);
        seed(&f.remote, "n1", "A");
        f.executor
            .find(&notes(), CachePolicy::NetworkOnly, &cancel)
            .await
            .unwrap();
        f.remote.set_online(false);
        let fallback = f
            .executor
            .find(&notes(), CachePolicy::NetworkElseCache, &cancel)
            .await
            .unwrap();
        assert_eq!(fallback.source, ResultSource::Cache);
    }

    #[tokio::test]
    async fn test_cache_else_network() {
        let f = fixture(MemoryRemote::new(), false);
        seed(&f.remote, "n1", "A");
        let result = f
            .executor
            .find(&notes(), CachePolicy::CacheElseNetwork, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.source, ResultSource::Network);
    }

    #[tokio::test]
    async fn test_cancelled_query_leaves_store_untouched() {
        let f = fixture(
            MemoryRemote::new().with_latency(Duration::from_millis(200)),
            true,
        );
        seed(&f.remote, "n1", "A");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .executor
            .find(&notes(), CachePolicy::NetworkOnly, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(f.objects.live_count(), 0);
    }

    #[tokio::test]
    async fn test_count() {
        let f = fixture(MemoryRemote::new(), false);
        seed(&f.remote, "n1", "A");
        seed(&f.remote, "n2", "B");
        let query = QuerySpec::new("Note").unwrap().equal_to("title", "B");
        assert_eq!(f.executor.count(&query).await.unwrap(), 1);
    }
}
