use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::time::Instant;

use crate::invocation::{Invocation, InvocationId};
use crate::key::QueryKey;
use crate::lifecycle::Interest;
use crate::options::QueryOptions;
use crate::staleness::Freshness;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one incarnation of an entry.
///
/// A key that is evicted and later requested again gets a new entry with a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

impl EntryId {
    fn next() -> Self {
        Self(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies a change listener registered on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// The status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No settled result yet, or a new invocation is running.
    Pending,
    /// The last invocation succeeded.
    Success,
    /// The last invocation failed.
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time view of an entry, as seen by its subscribers.
#[derive(Debug, Clone)]
pub struct EntryState<T, E> {
    pub status: Status,
    /// The last successful result. It survives later failures.
    pub data: Option<T>,
    /// The last failure, cleared by the next success.
    pub error: Option<E>,
    /// When the entry last settled.
    pub updated_at: Option<Instant>,
    /// Whether an invocation is currently running.
    pub is_fetching: bool,
    /// The number of attached subscribers.
    pub subscribers: usize,
}

impl<T, E> Default for EntryState<T, E> {
    fn default() -> Self {
        Self {
            status: Status::Pending,
            data: None,
            error: None,
            updated_at: None,
            is_fetching: false,
            subscribers: 0,
        }
    }
}

/// A callback invoked after every state transition of an entry.
pub type Listener<T, E> = Arc<dyn Fn(&EntryState<T, E>) + Send + Sync>;

/// Orders the snapshots handed to the listeners of one entry.
///
/// Revisions are issued under the store lock, so they follow the order of transitions. Delivery
/// happens after the lock is released and may race, a snapshot older than the last delivered one
/// is dropped.
#[derive(Debug, Default)]
struct Revisions {
    issued: AtomicU64,
    delivered: AtomicU64,
}

/// Listeners to call with a snapshot, once the store lock has been released.
#[must_use]
pub(crate) struct Notification<T, E> {
    listeners: Vec<Listener<T, E>>,
    state: EntryState<T, E>,
    revision: u64,
    revisions: Arc<Revisions>,
}

impl<T, E> Notification<T, E> {
    pub(crate) fn notify(self) {
        let delivered = self.revisions.delivered.fetch_max(self.revision, Ordering::AcqRel);
        if delivered >= self.revision {
            tracing::trace!(
                revision = self.revision,
                delivered,
                "Dropped outdated notification"
            );
            return;
        }
        for listener in self.listeners {
            listener(&self.state);
        }
    }
}

/// The outcome of [`Entry::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settled {
    Applied,
    /// The invocation is not the current one anymore and its result was dropped.
    Discarded,
}

/// The cached state of one canonical key.
///
/// `status`, `data`, `error` and the in-flight invocation only change through the transitions
/// below. Subscribers and the eviction timer live in [`Interest`] and are owned by the
/// lifecycle manager.
pub(crate) struct Entry<T, E> {
    pub(crate) id: EntryId,
    pub(crate) key: QueryKey,
    pub(crate) options: QueryOptions<T, E>,
    pub(crate) interest: Interest,

    status: Status,
    data: Option<T>,
    error: Option<E>,
    updated_at: Option<Instant>,
    in_flight: Option<Invocation<T, E>>,
    invalidated: bool,
    listeners: Vec<(ListenerId, Listener<T, E>)>,
    revisions: Arc<Revisions>,
}

impl<T: Clone, E: Clone> Entry<T, E> {
    pub(crate) fn new(key: QueryKey, options: QueryOptions<T, E>) -> Self {
        Self {
            id: EntryId::next(),
            key,
            options,
            interest: Interest::default(),
            status: Status::Pending,
            data: None,
            error: None,
            updated_at: None,
            in_flight: None,
            invalidated: false,
            listeners: Vec::new(),
            revisions: Arc::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub(crate) fn in_flight(&self) -> Option<&Invocation<T, E>> {
        self.in_flight.as_ref()
    }

    /// The inputs of a staleness decision.
    pub(crate) fn freshness(&self) -> Freshness {
        Freshness {
            status: self.status,
            updated_at: self.updated_at,
            invalidated: self.invalidated,
        }
    }

    /// The last settled result, if any.
    pub(crate) fn cached_result(&self) -> Option<Result<T, E>> {
        match self.status {
            Status::Success => self.data.clone().map(Ok),
            Status::Error => self.error.clone().map(Err),
            Status::Pending => None,
        }
    }

    pub(crate) fn state(&self) -> EntryState<T, E> {
        EntryState {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
            is_fetching: self.in_flight.is_some(),
            subscribers: self.interest.count(),
        }
    }

    /// Makes `invocation` the current one and moves to `pending`.
    ///
    /// Returns the invocation that got superseded, if there was one.
    pub(crate) fn begin(&mut self, invocation: Invocation<T, E>) -> Option<Invocation<T, E>> {
        self.status = Status::Pending;
        self.in_flight.replace(invocation)
    }

    /// Applies the result of invocation `id`.
    ///
    /// Results of anything but the current invocation are discarded without touching the entry.
    pub(crate) fn settle(
        &mut self,
        id: InvocationId,
        result: &Result<T, E>,
        now: Instant,
    ) -> Settled {
        match self.in_flight {
            Some(ref current) if current.id == id => {}
            _ => return Settled::Discarded,
        }

        self.in_flight = None;
        match result {
            Ok(data) => {
                self.status = Status::Success;
                self.data = Some(data.clone());
                self.error = None;
            }
            Err(error) => {
                self.status = Status::Error;
                self.error = Some(error.clone());
            }
        }
        self.updated_at = Some(now);
        self.invalidated = false;
        Settled::Applied
    }

    /// Writes `data` as if an invocation had just succeeded, superseding any running one.
    pub(crate) fn set_data(&mut self, data: T, now: Instant) -> Option<Invocation<T, E>> {
        let superseded = self.in_flight.take();
        self.status = Status::Success;
        self.data = Some(data);
        self.error = None;
        self.updated_at = Some(now);
        self.invalidated = false;
        superseded
    }

    /// Disconnects the running invocation from this entry, its result will be discarded.
    pub(crate) fn abandon(&mut self) -> Option<InvocationId> {
        self.in_flight.take().map(|invocation| invocation.id)
    }

    /// Marks the cached result as stale, regardless of its age.
    pub(crate) fn mark_invalidated(&mut self) {
        self.invalidated = true;
    }

    pub(crate) fn add_listener(&mut self, listener: Listener<T, E>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.listeners.push((id, listener));
        id
    }

    pub(crate) fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Snapshots the state for all listeners, if there are any.
    ///
    /// Must be called with the store lock held, right after the transition it reports.
    pub(crate) fn notification(&self) -> Option<Notification<T, E>> {
        if self.listeners.is_empty() {
            return None;
        }
        let revision = self.revisions.issued.fetch_add(1, Ordering::Relaxed) + 1;
        Some(Notification {
            listeners: self.listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            state: self.state(),
            revision,
            revisions: Arc::clone(&self.revisions),
        })
    }
}
