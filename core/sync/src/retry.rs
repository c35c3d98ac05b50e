//! Backoff schedules for transient remote failures.
//!
//! Direct calls retry in place through [`RetryExecutor`]. Queued commands
//! are not retried in place; the queue asks [`RetryConfig::delay_for_attempt`]
//! how long a failed command waits before it is dispatchable again.
//!
//! Every attempt, queued or not, runs under the request deadline; an attempt
//! that outlives it fails with [`Error::Timeout`].

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use eaves_common::{Error, Result};
use eaves_model::QueueRetryConfig;

/// Exponential backoff with proportional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub retries: u32,
    pub initial_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random. Zero disables it.
    pub jitter: f64,
    /// Deadline for a single attempt.
    pub timeout: Option<Duration>,
}

impl RetryConfig {
    pub fn new(retries: u32) -> Self {
        Self {
            retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
            timeout: None,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let nominal = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = nominal.min(self.max_delay.as_secs_f64());
        let spread = if self.jitter > 0.0 {
            1.0 + self.jitter * (2.0 * rand::random::<f64>() - 1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * spread).max(0.0))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

impl From<&QueueRetryConfig> for RetryConfig {
    /// Queued commands retry until they succeed or fail permanently.
    fn from(config: &QueueRetryConfig) -> Self {
        Self::new(u32::MAX)
            .with_initial_delay(config.initial_backoff())
            .with_max_delay(config.max_backoff())
            .with_multiplier(config.multiplier)
    }
}

/// Runs a remote call, sleeping and retrying while it fails transiently.
#[derive(Debug, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Await one attempt under the configured deadline.
    pub async fn bounded<T, Fut>(&self, attempt: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let Some(limit) = self.config.timeout else {
            return attempt.await;
        };
        match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "no response within {}ms",
                limit.as_millis()
            ))),
        }
    }

    /// Run `call`, retrying errors for which [`Error::is_retryable`] holds.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_when(call, Error::is_retryable).await
    }

    /// Run `call`, retrying errors accepted by `retryable`.
    ///
    /// Each attempt is bounded by the deadline.
    pub async fn execute_when<F, Fut, T, P>(&self, call: F, retryable: P) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let mut retry = 0;
        loop {
            let err = match self.bounded(call()).await {
                Ok(value) => {
                    if retry > 0 {
                        debug!("Call succeeded on retry {}", retry);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };
            if !retryable(&err) || retry >= self.config.retries {
                if retry > 0 {
                    warn!("Giving up after {} retries: {}", retry, err);
                }
                return Err(err);
            }
            let delay = self.config.delay_for_attempt(retry);
            retry += 1;
            debug!("Transient failure ({}), retry {} in {:?}", err, retry, delay);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// A call that fails with `error` for its first `failures` invocations.
    fn flaky(
        failures: u32,
        error: fn() -> Error,
    ) -> (Arc<AtomicU32>, impl Fn() -> futures::future::Ready<Result<&'static str>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let call = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(if n < failures { Err(error()) } else { Ok("done") })
        };
        (calls, call)
    }

    fn fast(retries: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryConfig::new(retries)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(0.0),
        )
    }

    #[test]
    fn test_schedule_doubles_until_cap() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(3))
            .with_jitter(0.0);
        let delays: Vec<u128> = (0..5).map(|a| config.delay_for_attempt(a).as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_band() {
        let config = RetryConfig::new(1).with_initial_delay(Duration::from_secs(2));
        for _ in 0..100 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(1500), "{:?}", delay);
            assert!(delay <= Duration::from_millis(2500), "{:?}", delay);
        }
    }

    #[test]
    fn test_from_queue_settings() {
        let config = RetryConfig::from(&QueueRetryConfig {
            initial_backoff_ms: 250,
            max_backoff_ms: 1000,
            multiplier: 3.0,
        })
        .with_jitter(0.0);
        assert_eq!(config.retries, u32::MAX);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(750));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_recovers_from_dropped_connection() {
        let (calls, call) = flaky(2, || Error::ConnectionFailed("reset".to_string()));
        assert_eq!(fast(3).execute(call).await.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (calls, call) = flaky(5, || Error::DuplicateValue("slug".to_string()));
        let result = fast(3).execute(call).await;
        assert!(matches!(result, Err(Error::DuplicateValue(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let (calls, call) = flaky(10, || Error::Timeout("slow".to_string()));
        let result = fast(2).execute(call).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unanswered_attempt_times_out() {
        let executor = RetryExecutor::new(
            RetryConfig::new(1)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(0.0)
                .with_timeout(Duration::from_millis(20)),
        );
        let calls = AtomicU32::new(0);
        let result: Result<()> = executor
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending()
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let quick = executor.bounded(async { Ok(7) }).await;
        assert_eq!(quick.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let (calls, call) = flaky(1, || Error::CacheMiss("cold".to_string()));
        let result = fast(1)
            .execute_when(call, |e| matches!(e, Error::CacheMiss(_)))
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
