//! Reference-counted interest in entries, and garbage collection of idle entries.
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::AbortHandle;

use crate::entry::{EntryId, EntryState, ListenerId};
use crate::error::CacheError;
use crate::key::{CanonicalKey, QueryKey};
use crate::options::QueryOptions;
use crate::store::QueryStore;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one registration of interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        Self(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies one scheduled eviction of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EvictionToken(u64);

struct EvictionTimer {
    token: EvictionToken,
    handle: AbortHandle,
}

/// The subscribers of an entry, and the eviction timer that runs while there are none.
///
/// A timer is only ever scheduled while the subscriber set is empty, and attaching cancels it
/// before the subscriber is counted.
#[derive(Default)]
pub(crate) struct Interest {
    subscribers: HashSet<SubscriberId>,
    eviction: Option<EvictionTimer>,
    next_token: u64,
}

impl Interest {
    pub(crate) fn count(&self) -> usize {
        self.subscribers.len()
    }

    /// Registers a new subscriber, cancelling a pending eviction.
    pub(crate) fn attach(&mut self) -> SubscriberId {
        self.cancel_eviction();
        let id = SubscriberId::next();
        self.subscribers.insert(id);
        id
    }

    /// Removes a subscriber and returns how many are left.
    pub(crate) fn detach(&mut self, id: SubscriberId) -> Result<usize, CacheError> {
        if !self.subscribers.remove(&id) {
            return Err(CacheError::Underflow);
        }
        Ok(self.subscribers.len())
    }

    /// Calls `evict` after `gc_time`, unless the eviction is cancelled before.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn schedule_eviction<F>(&mut self, gc_time: Duration, evict: F)
    where
        F: FnOnce(EvictionToken) + Send + 'static,
    {
        self.cancel_eviction();

        self.next_token += 1;
        let token = EvictionToken(self.next_token);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(gc_time).await;
            evict(token);
        })
        .abort_handle();

        self.eviction = Some(EvictionTimer { token, handle });
    }

    /// Claims the eviction `token` on behalf of a fired timer.
    ///
    /// Returns `false` if that timer has been cancelled or replaced in the meantime.
    pub(crate) fn take_fired(&mut self, token: EvictionToken) -> bool {
        match self.eviction {
            Some(ref timer) if timer.token == token => {
                self.eviction = None;
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_eviction_scheduled(&self) -> bool {
        self.eviction.is_some()
    }

    fn cancel_eviction(&mut self) {
        if let Some(timer) = self.eviction.take() {
            timer.handle.abort();
        }
    }
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.cancel_eviction();
    }
}

/// A registered interest in one key of a [`QueryStore`].
///
/// The entry stays in the store at least as long as the subscriber is attached. Call
/// [`detach`](Self::detach) exactly once when the result is not needed anymore.
pub struct Subscriber<T, E> {
    pub(crate) store: QueryStore<T, E>,
    pub(crate) key: QueryKey,
    pub(crate) canonical: CanonicalKey,
    pub(crate) entry: EntryId,
    pub(crate) id: SubscriberId,
    pub(crate) options: QueryOptions<T, E>,
}

impl<T, E> Subscriber<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn canonical_key(&self) -> &CanonicalKey {
        &self.canonical
    }

    /// The current state of the entry.
    ///
    /// An entry that has been cleared from the store in the meantime reads as `pending`.
    pub fn state(&self) -> EntryState<T, E> {
        self.store.current_state(self)
    }

    /// Returns the result of the entry.
    ///
    /// Joins a running invocation, returns a fresh cached result, or starts a new invocation if
    /// the cached one is stale. With `force`, always starts a new invocation.
    pub fn refresh(&self, force: bool) -> BoxFuture<'static, Result<T, E>> {
        self.store.refresh(self, force)
    }

    /// Runs a mutation and returns its result.
    ///
    /// This is the same as a forced refresh, and is mostly useful for mutation entries.
    pub fn mutate(&self) -> BoxFuture<'static, Result<T, E>> {
        self.store.refresh(self, true)
    }

    /// Waits until the entry has no running invocation and returns its state.
    pub async fn settled(&self) -> EntryState<T, E> {
        self.store.settled(self).await
    }

    /// Registers a callback that is invoked after state transitions of the entry.
    ///
    /// Snapshots arrive in the order of the transitions. One that loses the race against a newer
    /// one is skipped.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&EntryState<T, E>) + Send + Sync + 'static,
    {
        self.store.add_listener(self, listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.store.remove_listener(self, id)
    }

    /// Unregisters this interest, making the entry eligible for eviction if it was the last one.
    pub fn detach(&self) -> Result<(), CacheError> {
        self.store.detach(self)
    }
}

impl<T, E> Clone for Subscriber<T, E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            key: self.key.clone(),
            canonical: self.canonical.clone(),
            entry: self.entry,
            id: self.id,
            options: self.options.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Subscriber<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("key", &self.canonical)
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_evictor(evictions: Arc<AtomicUsize>) -> impl FnOnce(EvictionToken) + Send {
        move |_| {
            evictions.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_detach_underflow() {
        let mut interest = Interest::default();
        let a = interest.attach();
        let b = interest.attach();
        assert_eq!(interest.count(), 2);

        assert_eq!(interest.detach(a), Ok(1));
        assert_eq!(interest.detach(a), Err(CacheError::Underflow));
        assert_eq!(interest.detach(b), Ok(0));
        assert_eq!(interest.detach(b), Err(CacheError::Underflow));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_fires() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let mut interest = Interest::default();

        interest.schedule_eviction(
            Duration::from_secs(10),
            counting_evictor(Arc::clone(&evictions)),
        );
        assert!(interest.is_eviction_scheduled());

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(evictions.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_cancels_eviction() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let mut interest = Interest::default();

        interest.schedule_eviction(
            Duration::from_secs(10),
            counting_evictor(Arc::clone(&evictions)),
        );
        tokio::time::sleep(Duration::from_secs(5)).await;

        let id = interest.attach();
        assert!(!interest.is_eviction_scheduled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(evictions.load(Ordering::SeqCst), 0);

        interest.detach(id).unwrap();
        interest.schedule_eviction(
            Duration::from_secs(10),
            counting_evictor(Arc::clone(&evictions)),
        );
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token() {
        let mut interest = Interest::default();

        interest.schedule_eviction(Duration::from_secs(10), |_| {});
        let first = EvictionToken(interest.next_token);
        interest.schedule_eviction(Duration::from_secs(10), |_| {});

        assert!(!interest.take_fired(first));
        assert!(interest.is_eviction_scheduled());

        let second = EvictionToken(interest.next_token);
        assert!(interest.take_fired(second));
        assert!(!interest.is_eviction_scheduled());
        assert!(!interest.take_fired(second));
    }
}
