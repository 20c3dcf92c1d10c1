//! Running operations, at most one current invocation per entry.
//!
//! An invocation is a spawned, [`Shared`] future. Every caller that asks for the result of a
//! key while it runs gets a clone of the same future, so the operation runs once no matter how
//! many callers there are. The invocation writes its result back into the entry itself, which
//! only takes effect if it is still the entry's current invocation.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use crate::entry::Entry;
use crate::key::CanonicalKey;
use crate::options::{Operation, RetryPolicy};

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a single invocation of an operation, including all of its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(u64);

impl InvocationId {
    fn next() -> Self {
        Self(NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The result of an invocation, which can be awaited by any number of callers.
pub type SharedResult<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// The connection between a running invocation and the entry it was started for.
pub(crate) trait InvocationOwner<T, E>: Send + Sync + 'static {
    /// Whether invocation `id` is still the one the entry is waiting for.
    fn is_current(&self, id: InvocationId) -> bool;

    /// Hands the final result of invocation `id` to the entry.
    fn settle(&self, id: InvocationId, result: &Result<T, E>);
}

pub(crate) struct Invocation<T, E> {
    pub(crate) id: InvocationId,
    result: SharedResult<T, E>,
}

impl<T, E> Invocation<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    /// Spawns the operation onto the current tokio runtime.
    ///
    /// The spawned task drives the invocation to completion even if every caller stops waiting
    /// for it.
    fn start<O>(
        key: &CanonicalKey,
        operation: Operation<T, E>,
        retry: RetryPolicy,
        owner: O,
    ) -> Self
    where
        O: InvocationOwner<T, E>,
    {
        let id = InvocationId::next();
        let key = key.clone();

        let future = async move {
            let started = Instant::now();
            let result = run_with_retry(&key, &operation, retry, || owner.is_current(id)).await;

            metric!(
                timer("query_cache.invocation.duration") = started.elapsed(),
                "status" => if result.is_ok() { "success" } else { "error" },
            );
            owner.settle(id, &result);
            result
        }
        .boxed()
        .shared();

        tokio::spawn(future.clone());
        Self { id, result: future }
    }
}

impl<T, E> Invocation<T, E> {
    /// Wraps an already existing future without spawning it.
    #[cfg(test)]
    pub(crate) fn detached(result: SharedResult<T, E>) -> Self {
        Self {
            id: InvocationId::next(),
            result,
        }
    }

    pub(crate) fn join(&self) -> SharedResult<T, E> {
        self.result.clone()
    }
}

/// Returns the result of the entry's current invocation, starting one if necessary.
///
/// With `supersede`, a new invocation replaces the running one, whose result will then be
/// discarded on arrival. Otherwise a running invocation is joined.
pub(crate) fn invoke<T, E, O>(
    entry: &mut Entry<T, E>,
    key: &CanonicalKey,
    owner: O,
    supersede: bool,
) -> SharedResult<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
    O: InvocationOwner<T, E>,
{
    if !supersede {
        if let Some(running) = entry.in_flight() {
            metric!(counter("query_cache.invocation.joined") += 1);
            tracing::trace!(%key, invocation = %running.id, "Joining running invocation");
            return running.join();
        }
    }

    let options = &entry.options;
    let invocation = Invocation::start(key, options.operation.clone(), options.retry, owner);
    metric!(
        counter("query_cache.invocation.started") += 1,
        "kind" => if supersede { "superseding" } else { "new" },
    );
    tracing::debug!(%key, invocation = %invocation.id, "Starting invocation");

    let result = invocation.join();
    if let Some(superseded) = entry.begin(invocation) {
        tracing::trace!(%key, invocation = %superseded.id, "Superseded running invocation");
    }
    result
}

/// Runs `operation`, retrying failures according to `policy`.
///
/// Stops retrying as soon as `is_current` turns false, as nobody would see the result anyway.
async fn run_with_retry<T, E, C>(
    key: &CanonicalKey,
    operation: &Operation<T, E>,
    policy: RetryPolicy,
    is_current: C,
) -> Result<T, E>
where
    E: fmt::Display,
    C: Fn() -> bool,
{
    let mut attempt = 0;
    loop {
        let result = operation.call().await;
        let error = match result {
            Err(ref error) if attempt < policy.retries && is_current() => error,
            _ => break result,
        };

        let delay = policy.delay_for(attempt);
        tracing::debug!(
            %key,
            attempt,
            error = %error,
            "Operation failed, retrying in {}",
            humantime::format_duration(delay),
        );
        metric!(counter("query_cache.invocation.retry") += 1);

        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::query_key;

    fn key() -> CanonicalKey {
        query_key!["flaky"].canonicalize().unwrap()
    }

    /// Fails the first `failures` calls.
    fn flaky(failures: usize) -> (Operation<usize, String>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let operation = {
            let calls = Arc::clone(&calls);
            Operation::new(move || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < failures {
                        Err(format!("failure {call}"))
                    } else {
                        Ok(call)
                    }
                }
            })
        };
        (operation, calls)
    }

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let (operation, calls) = flaky(2);

        let started = Instant::now();
        let result = run_with_retry(&key(), &operation, policy(3), || true).await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted() {
        let (operation, calls) = flaky(10);

        let result = run_with_retry(&key(), &operation, policy(2), || true).await;

        assert_eq!(result, Err("failure 2".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_when_superseded() {
        let (operation, calls) = flaky(10);

        let result = run_with_retry(&key(), &operation, policy(5), || false).await;

        assert_eq!(result, Err("failure 0".to_owned()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(InvocationId, Result<usize, String>)>>);

    impl InvocationOwner<usize, String> for Arc<Recorder> {
        fn is_current(&self, _id: InvocationId) -> bool {
            true
        }

        fn settle(&self, id: InvocationId, result: &Result<usize, String>) {
            self.0.lock().unwrap().push((id, result.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_invocation_settles_without_callers() {
        let (operation, calls) = flaky(0);
        let recorder = Arc::new(Recorder::default());

        let invocation = Invocation::start(&key(), operation, policy(0), Arc::clone(&recorder));
        let id = invocation.id;
        drop(invocation);

        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.0.lock().unwrap(), vec![(id, Ok(0))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_callers_share_one_run() {
        let (operation, calls) = flaky(0);
        let recorder = Arc::new(Recorder::default());

        let invocation = Invocation::start(&key(), operation, policy(0), Arc::clone(&recorder));
        let (a, b) = futures::join!(invocation.join(), invocation.join());

        assert_eq!(a, Ok(0));
        assert_eq!(b, Ok(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
