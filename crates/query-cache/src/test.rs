//! Helpers for testing the cache.
//!
//! In every test that exercises the store, call [`setup`] first. It sets up the logger so that
//! all output is captured by the test runner.
//!
//! Most tests run on a paused tokio clock (`#[tokio::test(start_paused = true)]`), so operation
//! latencies and eviction timers elapse instantly and in a deterministic order.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use crate::options::Operation;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("query_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The number of times an operation has been called.
pub type Calls = Arc<AtomicUsize>;

pub fn calls(calls: &Calls) -> usize {
    calls.load(Ordering::SeqCst)
}

/// An operation that immediately succeeds with `value`.
pub fn counting<T>(value: T) -> (Operation<T, String>, Calls)
where
    T: Clone + Send + Sync + 'static,
{
    sequence(vec![(Duration::ZERO, Ok(value))])
}

/// An operation that succeeds with `value` after `latency`.
pub fn slow<T>(latency: Duration, value: T) -> (Operation<T, String>, Calls)
where
    T: Clone + Send + Sync + 'static,
{
    sequence(vec![(latency, Ok(value))])
}

/// An operation whose n-th call resolves to the n-th result after the given latency.
///
/// Calls beyond the end of `results` repeat the last one.
pub fn sequence<T>(results: Vec<(Duration, Result<T, String>)>) -> (Operation<T, String>, Calls)
where
    T: Clone + Send + Sync + 'static,
{
    assert!(!results.is_empty());
    let calls = Calls::default();

    let operation = {
        let calls = Arc::clone(&calls);
        let results = Arc::new(results);
        Operation::new(move || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            let (latency, result) = results[call.min(results.len() - 1)].clone();
            async move {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                result
            }
        })
    };

    (operation, calls)
}
