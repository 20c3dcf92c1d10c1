use std::fmt;

use crate::entry::EntryState;
use crate::error::CacheError;
use crate::key::{CanonicalKey, QueryKey};
use crate::lifecycle::Subscriber;
use crate::options::QueryOptions;
use crate::store::QueryStore;

/// A key together with the options to attach to it with.
///
/// Defining a query once and attaching to it from several places makes sure all of them share
/// the same entry and configuration.
pub struct QueryDefinition<T, E> {
    key: QueryKey,
    canonical: CanonicalKey,
    options: QueryOptions<T, E>,
}

impl<T, E> QueryDefinition<T, E> {
    /// Creates a definition, failing early if `key` is invalid.
    pub fn new(key: QueryKey, options: QueryOptions<T, E>) -> Result<Self, CacheError> {
        let canonical = key.canonicalize()?;
        Ok(Self {
            key,
            canonical,
            options,
        })
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn canonical_key(&self) -> &CanonicalKey {
        &self.canonical
    }

    pub fn options(&self) -> &QueryOptions<T, E> {
        &self.options
    }
}

impl<T, E> QueryDefinition<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    /// Attaches to this definition's entry in `store`.
    pub fn attach(&self, store: &QueryStore<T, E>) -> Result<Subscriber<T, E>, CacheError> {
        store.attach(&self.key, self.options.clone())
    }

    /// Returns the state of this definition's entry in `store`, without registering interest.
    pub fn read(&self, store: &QueryStore<T, E>) -> Result<Option<EntryState<T, E>>, CacheError> {
        store.read(&self.key)
    }
}

impl<T, E> Clone for QueryDefinition<T, E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            canonical: self.canonical.clone(),
            options: self.options.clone(),
        }
    }
}

impl<T, E> fmt::Debug for QueryDefinition<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryDefinition")
            .field("key", &self.canonical)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::query_key;
    use crate::test;

    #[tokio::test(start_paused = true)]
    async fn test_definition_shares_entry() {
        test::setup();
        let store = QueryStore::default();
        let (operation, calls) = test::counting("contacts");

        let definition = QueryDefinition::new(
            query_key!["contacts-search", { "searchText": "" }],
            QueryOptions::new(operation).fresh_for(Duration::ZERO),
        )
        .unwrap();

        let a = definition.attach(&store).unwrap();
        let b = definition.attach(&store).unwrap();
        assert_eq!(a.canonical_key(), b.canonical_key());

        let state = a.settled().await;
        assert_eq!(state.data, Some("contacts"));
        assert_eq!(state.subscribers, 2);
        assert_eq!(test::calls(&calls), 1);

        assert!(definition.read(&store).unwrap().is_some());
    }

    #[test]
    fn test_invalid_definition() {
        let (operation, _) = test::counting(());
        let result = QueryDefinition::new(QueryKey::new(vec![]), QueryOptions::new(operation));
        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
    }
}
