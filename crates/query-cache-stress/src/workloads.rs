use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use query_cache::{QueryKey, QueryOptions, QueryStore, Status, query_key};

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// A synthetic workload against one cache.
///
/// Every operation attaches to one of `keys` random keys, waits for the entry to settle and
/// detaches again.
#[derive(Debug, Deserialize)]
pub struct Workload {
    /// The number of operations in flight at any time.
    pub concurrency: usize,
    /// The number of distinct keys.
    pub keys: usize,
    /// How long the simulated fetch takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The fraction of simulated fetches that fail, between 0 and 1.
    #[serde(default)]
    pub failure_rate: f64,
    /// Overrides the configured `fresh_for`. An explicit `null` keeps results fresh forever.
    #[serde(default, deserialize_with = "deserialize_fresh_for")]
    pub fresh_for: Option<Option<Duration>>,
    /// Overrides the configured `gc_time`.
    #[serde(default, with = "humantime_serde")]
    pub gc_time: Option<Duration>,
}

fn deserialize_fresh_for<'de, D>(deserializer: D) -> Result<Option<Option<Duration>>, D::Error>
where
    D: Deserializer<'de>,
{
    // only called for present fields, so `null` is an explicit "never stale"
    humantime_serde::deserialize::<Option<Duration>, _>(deserializer).map(Some)
}

/// A workload, ready to run against a store.
pub struct PreparedWorkload {
    index: usize,
    keys: usize,
    options: QueryOptions<u64, String>,
    invocations: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }

    fn random_key(&self) -> QueryKey {
        let key = rand::random_range(0..self.keys.max(1));
        query_key!["stress", { "workload": self.index, "key": key }]
    }
}

pub fn prepare_workload(
    store: &QueryStore<u64, String>,
    index: usize,
    workload: &Workload,
) -> PreparedWorkload {
    let invocations = Arc::new(AtomicUsize::new(0));
    let latency = workload.latency;
    let failure_rate = workload.failure_rate;

    let mut options = store.query({
        let invocations = Arc::clone(&invocations);
        move || {
            let invocation = invocations.fetch_add(1, Ordering::Relaxed);
            async move {
                tokio::time::sleep(latency).await;
                if rand::random::<f64>() < failure_rate {
                    Err(format!("simulated failure in invocation {invocation}"))
                } else {
                    Ok(invocation as u64)
                }
            }
        }
    });

    if let Some(fresh_for) = workload.fresh_for {
        options = options.fresh_for(fresh_for);
    }
    if let Some(gc_time) = workload.gc_time {
        options = options.gc_time(gc_time);
    }

    PreparedWorkload {
        index,
        keys: workload.keys,
        options,
        invocations,
    }
}

/// Runs one operation of `workload` and returns the status it settled to.
pub async fn process_workload(
    store: &QueryStore<u64, String>,
    workload: &PreparedWorkload,
) -> Status {
    let key = workload.random_key();
    let subscriber = match store.attach(&key, workload.options.clone()) {
        Ok(subscriber) => subscriber,
        Err(error) => {
            tracing::error!(error = &error as &dyn std::error::Error, "Failed to attach");
            return Status::Error;
        }
    };

    let state = subscriber.settled().await;

    if let Err(error) = subscriber.detach() {
        tracing::error!(error = &error as &dyn std::error::Error, "Failed to detach");
    }
    state.status
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Workload {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_fresh_for() {
        let workload = parse("concurrency: 1\nkeys: 1\nlatency: 5ms");
        assert_eq!(workload.fresh_for, None);

        let workload = parse("concurrency: 1\nkeys: 1\nlatency: 5ms\nfresh_for: null");
        assert_eq!(workload.fresh_for, Some(None));

        let workload = parse("concurrency: 1\nkeys: 1\nlatency: 5ms\nfresh_for: 2s");
        assert_eq!(workload.fresh_for, Some(Some(Duration::from_secs(2))));
    }
}
