//! A keyed cache for the results of asynchronous operations.
//!
//! Callers attach to a structured [`QueryKey`] with the operation that produces its value. The
//! [`QueryStore`] makes sure that:
//!
//!  - concurrent requests for the same key share one running invocation,
//!  - results are kept while anybody is attached, and for a grace period after that,
//!  - stale results are refetched on attach or refresh, and explicit invalidation forces it,
//!  - results of superseded or abandoned invocations never overwrite newer state.
//!
//! ```
//! use query_cache::{QueryStore, query_key};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = QueryStore::<Vec<String>, String>::default();
//! let key = query_key!["contacts-search", { "text": "jo" }];
//!
//! let options = store.query(|| async { Ok(vec!["John".to_owned()]) });
//! let subscriber = store.attach(&key, options).unwrap();
//! let state = subscriber.settled().await;
//! assert_eq!(state.data.unwrap(), ["John"]);
//!
//! subscriber.detach().unwrap();
//! # }
//! ```

#[macro_use]
pub mod metrics;

pub mod config;
pub mod definition;
pub mod entry;
pub mod error;
pub mod invocation;
pub mod key;
pub mod lifecycle;
pub mod logging;
pub mod options;
pub mod staleness;
pub mod store;

#[cfg(test)]
#[allow(unused)]
mod test;

pub use config::{CacheDefaults, Config};
pub use definition::QueryDefinition;
pub use entry::{EntryState, ListenerId, Status};
pub use error::CacheError;
pub use key::{CanonicalKey, KeyFilter, QueryKey, canonicalize};
pub use lifecycle::{Subscriber, SubscriberId};
pub use options::{Operation, OperationKind, QueryOptions, RetryPolicy};
pub use store::QueryStore;

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
