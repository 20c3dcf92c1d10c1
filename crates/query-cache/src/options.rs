use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;

use crate::config::CacheDefaults;

/// The user-supplied asynchronous operation behind an entry.
///
/// The cache treats the operation as opaque: it is called once per attempt, and the returned
/// future is never cancelled by the cache, only disconnected from the entry.
pub struct Operation<T, E> {
    f: Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>,
}

impl<T, E> Operation<T, E> {
    /// Wraps a closure returning a future.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            f: Arc::new(move || f().boxed()),
        }
    }

    pub(crate) fn call(&self) -> BoxFuture<'static, Result<T, E>> {
        (self.f)()
    }
}

impl<T, E> Clone for Operation<T, E> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<T, E> fmt::Debug for Operation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").finish_non_exhaustive()
    }
}

/// What kind of call an entry caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// A data fetch. Attaching runs the operation whenever the cached result is stale.
    #[default]
    Query,
    /// A data-mutating call. It only runs on an explicit refresh, and never on attach.
    Mutation,
}

/// How often and how fast a failed operation is retried before the entry settles to `error`.
///
/// Retries belong to the same invocation: concurrent callers keep waiting on the one shared
/// result, and subscribers only see the final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// The number of retries after the first failed attempt.
    pub retries: u32,
    /// The delay before the first retry. It doubles for every following retry.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Upper bound for the delay between two attempts.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that settles on the first failure.
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Default::default()
        }
    }

    /// Returns the delay to wait after the failed attempt number `attempt` (starting at 0).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// The per-key configuration, captured when registering interest in a key.
///
/// When the same key is registered again, the latest options win for all future decisions.
pub struct QueryOptions<T, E> {
    /// The operation to run.
    pub operation: Operation<T, E>,
    /// Whether this is a query or a mutation.
    pub kind: OperationKind,
    /// How long a result stays fresh. `None` means forever, in which case only
    /// [`invalidate`](crate::QueryStore::invalidate) or a forced refresh cause a new invocation.
    pub fresh_for: Option<Duration>,
    /// How long an entry without subscribers is kept around.
    pub gc_time: Duration,
    /// Retries of failed invocations.
    pub retry: RetryPolicy,
    /// Whether a new subscriber triggers a refetch of an entry that settled to `error`,
    /// even if it is still fresh.
    pub refetch_on_error_attach: bool,
}

impl<T, E> QueryOptions<T, E> {
    /// Creates query options with the built-in defaults.
    pub fn new(operation: Operation<T, E>) -> Self {
        Self::with_defaults(operation, &CacheDefaults::default())
    }

    /// Creates mutation options with the built-in defaults.
    pub fn mutation(operation: Operation<T, E>) -> Self {
        Self::mutation_with_defaults(operation, &CacheDefaults::default())
    }

    /// Creates query options based on the given defaults.
    pub fn with_defaults(operation: Operation<T, E>, defaults: &CacheDefaults) -> Self {
        Self {
            operation,
            kind: OperationKind::Query,
            fresh_for: defaults.fresh_for,
            gc_time: defaults.gc_time,
            retry: defaults.retry,
            refetch_on_error_attach: defaults.refetch_on_error_attach,
        }
    }

    /// Creates mutation options based on the given defaults.
    ///
    /// Mutations are never retried by default, as re-running a side effect is rarely safe.
    pub fn mutation_with_defaults(operation: Operation<T, E>, defaults: &CacheDefaults) -> Self {
        Self {
            operation,
            kind: OperationKind::Mutation,
            fresh_for: Some(Duration::ZERO),
            gc_time: defaults.mutation_gc_time,
            retry: RetryPolicy::none(),
            refetch_on_error_attach: false,
        }
    }

    pub fn fresh_for(mut self, fresh_for: impl Into<Option<Duration>>) -> Self {
        self.fresh_for = fresh_for.into();
        self
    }

    pub fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn refetch_on_error_attach(mut self, refetch: bool) -> Self {
        self.refetch_on_error_attach = refetch;
        self
    }
}

impl<T, E> Clone for QueryOptions<T, E> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            kind: self.kind,
            fresh_for: self.fresh_for,
            gc_time: self.gc_time,
            retry: self.retry,
            refetch_on_error_attach: self.refetch_on_error_attach,
        }
    }
}

impl<T, E> fmt::Debug for QueryOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("kind", &self.kind)
            .field("fresh_for", &self.fresh_for)
            .field("gc_time", &self.gc_time)
            .field("retry", &self.retry)
            .field("refetch_on_error_attach", &self.refetch_on_error_attach)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy {
            retries: 10,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for(40), Duration::from_secs(1));
    }

    #[test]
    fn test_mutation_defaults() {
        let options = QueryOptions::<(), ()>::mutation(Operation::new(|| async { Ok(()) }));
        assert_eq!(options.kind, OperationKind::Mutation);
        assert_eq!(options.gc_time, Duration::ZERO);
        assert_eq!(options.retry.retries, 0);
    }
}
