//! The keyed store of entries, and all operations on it.
//!
//! Every state transition happens while holding the store lock, so each of them is atomic with
//! respect to all others. Listeners are notified after the lock has been released, and futures
//! returned to callers never hold it. Since notifications of one entry may then race each other,
//! a listener can miss intermediate snapshots, but never sees an older one after a newer one.
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tokio::time::Instant;

use crate::config::CacheDefaults;
use crate::entry::{Entry, EntryId, EntryState, ListenerId, Notification, Settled};
use crate::error::CacheError;
use crate::invocation::{self, InvocationId, InvocationOwner};
use crate::key::{CanonicalKey, KeyFilter, QueryKey};
use crate::lifecycle::{EvictionToken, Subscriber};
use crate::options::{Operation, OperationKind, QueryOptions};
use crate::staleness::{RefetchTrigger, StalenessPolicy};


type Entries<T, E> = HashMap<CanonicalKey, Entry<T, E>>;

fn lock<T, E>(entries: &Mutex<Entries<T, E>>) -> MutexGuard<'_, Entries<T, E>> {
    entries.lock().unwrap()
}

fn notify_all<T, E>(notifications: impl IntoIterator<Item = Notification<T, E>>) {
    for notification in notifications {
        notification.notify();
    }
}

/// A keyed cache of asynchronous operation results.
///
/// The store coalesces concurrent requests for the same key into one invocation, keeps results
/// while anybody is interested in them and for a grace period afterwards, and refetches stale
/// results on demand. Cloning the store is cheap and yields a handle to the same entries.
///
/// All methods that start invocations or schedule evictions must be called from within a tokio
/// runtime.
pub struct QueryStore<T, E> {
    entries: Arc<Mutex<Entries<T, E>>>,
    defaults: CacheDefaults,
}

impl<T, E> Clone for QueryStore<T, E> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            defaults: self.defaults,
        }
    }
}

impl<T, E> fmt::Debug for QueryStore<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryStore")
            .field("entries", &lock(&self.entries).len())
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl<T, E> Default for QueryStore<T, E> {
    fn default() -> Self {
        Self::new(CacheDefaults::default())
    }
}

impl<T, E> QueryStore<T, E> {
    pub fn new(defaults: CacheDefaults) -> Self {
        Self {
            entries: Arc::default(),
            defaults,
        }
    }

    /// The defaults new options are created from.
    pub fn defaults(&self) -> &CacheDefaults {
        &self.defaults
    }

    /// Creates query options for `operation` from this store's defaults.
    pub fn query<F, Fut>(&self, operation: F) -> QueryOptions<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        QueryOptions::with_defaults(Operation::new(operation), &self.defaults)
    }

    /// Creates mutation options for `operation` from this store's defaults.
    pub fn mutation<F, Fut>(&self, operation: F) -> QueryOptions<T, E>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        QueryOptions::mutation_with_defaults(Operation::new(operation), &self.defaults)
    }

    /// The number of entries in the store.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// The keys of all entries in the store, in no particular order.
    pub fn keys(&self) -> Vec<QueryKey> {
        lock(&self.entries)
            .values()
            .map(|entry| entry.key.clone())
            .collect()
    }
}

impl<T, E> QueryStore<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    /// Returns the state of the entry for `key`, creating it if needed.
    ///
    /// For an existing entry, `options` replace the previously registered ones. A new entry
    /// nobody attaches to is evicted after its `gc_time`.
    pub fn get_or_create(
        &self,
        key: &QueryKey,
        options: QueryOptions<T, E>,
    ) -> Result<EntryState<T, E>, CacheError> {
        let canonical = key.canonicalize()?;
        let mut entries = lock(&self.entries);
        let entry = self.entry_locked(&mut entries, key, &canonical, options, true);
        Ok(entry.state())
    }

    /// Returns the state of the entry for `key`, if there is one.
    pub fn read(&self, key: &QueryKey) -> Result<Option<EntryState<T, E>>, CacheError> {
        let canonical = key.canonicalize()?;
        Ok(lock(&self.entries).get(&canonical).map(Entry::state))
    }

    /// Returns the last successful result for `key`, if there is one.
    pub fn get_data(&self, key: &QueryKey) -> Result<Option<T>, CacheError> {
        let canonical = key.canonicalize()?;
        let entries = lock(&self.entries);
        Ok(entries
            .get(&canonical)
            .and_then(|entry| entry.data().cloned()))
    }

    /// Writes `data` to the entry for `key` as if its operation had just succeeded.
    ///
    /// A running invocation is superseded and its result discarded. Returns `false` if there is
    /// no entry for `key`.
    pub fn set_data(&self, key: &QueryKey, data: T) -> Result<bool, CacheError> {
        let canonical = key.canonicalize()?;
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(&canonical) else {
            return Ok(false);
        };

        if let Some(superseded) = entry.set_data(data, Instant::now()) {
            tracing::trace!(key = %canonical, invocation = %superseded.id, "Superseded by data");
        }
        let notification = entry.notification();
        drop(entries);

        notify_all(notification);
        Ok(true)
    }

    /// Registers interest in `key`.
    ///
    /// Creates the entry if needed, cancels a pending eviction, and starts an invocation if the
    /// cached result is stale. A running invocation is joined instead of starting another one.
    pub fn attach(
        &self,
        key: &QueryKey,
        options: QueryOptions<T, E>,
    ) -> Result<Subscriber<T, E>, CacheError> {
        let canonical = key.canonicalize()?;
        metric!(counter("query_cache.access") += 1);

        let mut entries = lock(&self.entries);
        let entry = self.entry_locked(&mut entries, key, &canonical, options, true);
        let id = entry.interest.attach();
        tracing::trace!(key = %canonical, subscriber = ?id, "Attached");

        let policy = StalenessPolicy::from(&entry.options);
        let notification =
            if policy.should_refetch(entry.freshness(), Instant::now(), RefetchTrigger::Attach) {
                // the returned future is only needed by callers that wait for the result
                let _ = invocation::invoke(entry, &canonical, self.owner(&canonical), false);
                entry.notification()
            } else {
                None
            };

        let subscriber = Subscriber {
            store: self.clone(),
            key: key.clone(),
            canonical,
            entry: entry.id,
            id,
            options: entry.options.clone(),
        };
        drop(entries);

        notify_all(notification);
        Ok(subscriber)
    }

    /// Unregisters the interest of `subscriber`.
    ///
    /// When the last subscriber detaches, the entry is evicted after its `gc_time`, or right away
    /// if that is zero. Detaching from an entry that has been cleared in the meantime does
    /// nothing.
    pub fn detach(&self, subscriber: &Subscriber<T, E>) -> Result<(), CacheError> {
        let canonical = &subscriber.canonical;
        let mut entries = lock(&self.entries);

        let Some(entry) = entries
            .get_mut(canonical)
            .filter(|entry| entry.id == subscriber.entry)
        else {
            tracing::trace!(key = %canonical, "Detached from an entry that is gone");
            return Ok(());
        };

        let remaining = entry.interest.detach(subscriber.id).inspect_err(|error| {
            tracing::error!(key = %canonical, subscriber = ?subscriber.id, "{error}");
        })?;
        tracing::trace!(key = %canonical, subscriber = ?subscriber.id, remaining, "Detached");
        if remaining > 0 {
            return Ok(());
        }

        let gc_time = entry.options.gc_time;
        if !gc_time.is_zero() {
            let evict = self.evictor(canonical, entry.id);
            entry.interest.schedule_eviction(gc_time, evict);
            return Ok(());
        }

        let reason = match entry.options.kind {
            OperationKind::Query => "gc",
            OperationKind::Mutation => "mutation",
        };
        entries.remove(canonical);
        metric!(counter("query_cache.evicted") += 1, "reason" => reason);
        tracing::debug!(key = %canonical, "Evicted entry without subscribers");
        Ok(())
    }

    /// Returns the result for `subscriber`'s key.
    ///
    /// The decision is made immediately: a running invocation is joined, a fresh cached result
    /// is returned as is, and a stale one is refetched. With `force`, or for mutations, a new
    /// invocation always starts and supersedes a running one.
    ///
    /// If the entry has been cleared in the meantime, it is recreated from the options the
    /// subscriber attached with.
    pub fn refresh(
        &self,
        subscriber: &Subscriber<T, E>,
        force: bool,
    ) -> BoxFuture<'static, Result<T, E>> {
        let canonical = &subscriber.canonical;
        let mut entries = lock(&self.entries);
        let entry = self.entry_locked(
            &mut entries,
            &subscriber.key,
            canonical,
            subscriber.options.clone(),
            false,
        );

        let policy = StalenessPolicy::from(&entry.options);
        let trigger = RefetchTrigger::Refresh { force };
        let supersede = force || policy.kind == OperationKind::Mutation;

        if !supersede {
            if let Some(running) = entry.in_flight() {
                metric!(counter("query_cache.invocation.joined") += 1);
                return running.join().boxed();
            }
            if !policy.should_refetch(entry.freshness(), Instant::now(), trigger) {
                if let Some(cached) = entry.cached_result() {
                    tracing::trace!(key = %canonical, "Returning cached result");
                    return future::ready(cached).boxed();
                }
            }
        }

        let result = invocation::invoke(entry, canonical, self.owner(canonical), supersede);
        let notification = entry.notification();
        drop(entries);

        notify_all(notification);
        result.boxed()
    }

    /// Marks all query entries matching `filter` as stale.
    ///
    /// Entries with subscribers are refetched right away, superseding a running invocation. All
    /// others are refetched by their next attach or refresh, and a running invocation is
    /// abandoned. Mutations are never stale and are left alone. Returns the number of
    /// invalidated entries.
    pub fn invalidate(&self, filter: impl Into<KeyFilter>) -> Result<usize, CacheError> {
        let filter = filter.into();
        let filter = filter.resolve()?;

        let mut entries = lock(&self.entries);
        let mut notifications = Vec::new();
        let mut matched = 0;

        for (canonical, entry) in entries.iter_mut() {
            if entry.options.kind == OperationKind::Mutation
                || !filter.matches(&entry.key, canonical)
            {
                continue;
            }
            matched += 1;
            entry.mark_invalidated();

            if entry.interest.count() > 0 {
                let _ = invocation::invoke(entry, canonical, self.owner(canonical), true);
            } else if let Some(abandoned) = entry.abandon() {
                tracing::trace!(key = %canonical, invocation = %abandoned, "Abandoned invocation");
            }
            notifications.extend(entry.notification());
        }
        drop(entries);

        tracing::debug!(matched, "Invalidated entries");
        notify_all(notifications);
        Ok(matched)
    }

    /// Removes all entries matching `filter` right away, regardless of their subscribers.
    ///
    /// Results of invocations that are still running are discarded. Returns the number of
    /// removed entries.
    pub fn clear(&self, filter: impl Into<KeyFilter>) -> Result<usize, CacheError> {
        let filter = filter.into();
        let filter = filter.resolve()?;

        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|canonical, entry| {
            let matches = filter.matches(&entry.key, canonical);
            if matches && entry.in_flight().is_some() {
                tracing::trace!(key = %canonical, "Clearing entry with a running invocation");
            }
            !matches
        });
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            metric!(counter("query_cache.evicted") += removed as i64, "reason" => "clear");
        }
        tracing::debug!(removed, "Cleared entries");
        Ok(removed)
    }

    pub(crate) fn current_state(&self, subscriber: &Subscriber<T, E>) -> EntryState<T, E> {
        lock(&self.entries)
            .get(&subscriber.canonical)
            .map(Entry::state)
            .unwrap_or_default()
    }

    pub(crate) async fn settled(&self, subscriber: &Subscriber<T, E>) -> EntryState<T, E> {
        loop {
            let running = lock(&self.entries)
                .get(&subscriber.canonical)
                .and_then(|entry| entry.in_flight().map(|running| running.join()));

            match running {
                // a superseding invocation may have started while waiting
                Some(running) => {
                    let _ = running.await;
                }
                None => return self.current_state(subscriber),
            }
        }
    }

    pub(crate) fn add_listener<F>(&self, subscriber: &Subscriber<T, E>, listener: F) -> ListenerId
    where
        F: Fn(&EntryState<T, E>) + Send + Sync + 'static,
    {
        let mut entries = lock(&self.entries);
        let entry = self.entry_locked(
            &mut entries,
            &subscriber.key,
            &subscriber.canonical,
            subscriber.options.clone(),
            false,
        );
        entry.add_listener(Arc::new(listener))
    }

    pub(crate) fn remove_listener(&self, subscriber: &Subscriber<T, E>, id: ListenerId) -> bool {
        lock(&self.entries)
            .get_mut(&subscriber.canonical)
            .is_some_and(|entry| entry.remove_listener(id))
    }

    /// Looks up the entry for `canonical`, creating it with `options` if it does not exist.
    ///
    /// With `register`, the options of an existing entry are replaced as well.
    fn entry_locked<'a>(
        &self,
        entries: &'a mut Entries<T, E>,
        key: &QueryKey,
        canonical: &CanonicalKey,
        options: QueryOptions<T, E>,
        register: bool,
    ) -> &'a mut Entry<T, E> {
        match entries.entry(canonical.clone()) {
            MapEntry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                if register {
                    entry.options = options;
                }
                entry
            }
            MapEntry::Vacant(vacant) => {
                tracing::debug!(key = %canonical, kind = ?options.kind, "Creating entry");
                let entry = vacant.insert(Entry::new(key.clone(), options));
                // nobody is interested yet, an attach right after creation cancels this
                let evict = self.evictor(canonical, entry.id);
                entry.interest.schedule_eviction(entry.options.gc_time, evict);
                entry
            }
        }
    }

    fn owner(&self, canonical: &CanonicalKey) -> EntrySlot<T, E> {
        EntrySlot {
            entries: Arc::downgrade(&self.entries),
            key: canonical.clone(),
        }
    }

    fn evictor(
        &self,
        canonical: &CanonicalKey,
        entry_id: EntryId,
    ) -> impl FnOnce(EvictionToken) + Send + 'static + use<T, E> {
        let entries = Arc::downgrade(&self.entries);
        let canonical = canonical.clone();
        move |token| {
            if let Some(entries) = entries.upgrade() {
                evict_idle(&entries, &canonical, entry_id, token);
            }
        }
    }
}

/// Removes an entry whose eviction timer fired, unless it has been revived in the meantime.
fn evict_idle<T, E>(
    entries: &Mutex<Entries<T, E>>,
    canonical: &CanonicalKey,
    entry_id: EntryId,
    token: EvictionToken,
) {
    let mut entries = lock(entries);
    let evict = match entries.get_mut(canonical) {
        Some(entry) if entry.id == entry_id => {
            entry.interest.take_fired(token) && entry.interest.count() == 0
        }
        _ => false,
    };
    if !evict {
        return;
    }

    entries.remove(canonical);
    metric!(counter("query_cache.evicted") += 1, "reason" => "gc");
    tracing::debug!(key = %canonical, "Evicted idle entry");
}

/// The store-side end of a running invocation.
///
/// Only holds a weak reference, a running invocation does not keep a dropped store alive.
struct EntrySlot<T, E> {
    entries: Weak<Mutex<Entries<T, E>>>,
    key: CanonicalKey,
}

impl<T, E> InvocationOwner<T, E> for EntrySlot<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn is_current(&self, id: InvocationId) -> bool {
        let Some(entries) = self.entries.upgrade() else {
            return false;
        };
        lock(&entries)
            .get(&self.key)
            .and_then(|entry| entry.in_flight())
            .is_some_and(|running| running.id == id)
    }

    fn settle(&self, id: InvocationId, result: &Result<T, E>) {
        let Some(entries) = self.entries.upgrade() else {
            return;
        };
        let mut entries = lock(&entries);

        let settled = match entries.get_mut(&self.key) {
            Some(entry) => entry.settle(id, result, Instant::now()),
            None => Settled::Discarded,
        };

        match settled {
            Settled::Applied => {
                let status = if result.is_ok() { "success" } else { "error" };
                metric!(counter("query_cache.settle") += 1, "status" => status);
                tracing::debug!(key = %self.key, invocation = %id, status, "Settled");

                let notification = entries.get(&self.key).and_then(Entry::notification);
                drop(entries);
                notify_all(notification);
            }
            Settled::Discarded => {
                metric!(counter("query_cache.settle.discarded") += 1);
                tracing::trace!(key = %self.key, invocation = %id, "Discarded stale result");
            }
        }
    }
}
