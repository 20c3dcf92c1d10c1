//! Decides whether an entry's cached result is still good enough.
use std::time::Duration;

use tokio::time::Instant;

use crate::entry::Status;
use crate::options::{OperationKind, QueryOptions};

/// What asks for a possible refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchTrigger {
    /// A subscriber attached.
    Attach,
    /// A subscriber explicitly asked for the result.
    Refresh {
        /// Run a new invocation no matter what.
        force: bool,
    },
}

/// The parts of an entry a staleness decision depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    pub status: Status,
    pub updated_at: Option<Instant>,
    /// Set by an explicit invalidation, cleared by the next settle.
    pub invalidated: bool,
}

/// The staleness-related part of [`QueryOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub kind: OperationKind,
    pub fresh_for: Option<Duration>,
    pub refetch_on_error_attach: bool,
}

impl<T, E> From<&QueryOptions<T, E>> for StalenessPolicy {
    fn from(options: &QueryOptions<T, E>) -> Self {
        Self {
            kind: options.kind,
            fresh_for: options.fresh_for,
            refetch_on_error_attach: options.refetch_on_error_attach,
        }
    }
}

impl StalenessPolicy {
    /// Whether `trigger` should start a new invocation for an entry in state `freshness`.
    ///
    /// An in-flight invocation is not considered here, joining it is up to the caller.
    pub fn should_refetch(
        &self,
        freshness: Freshness,
        now: Instant,
        trigger: RefetchTrigger,
    ) -> bool {
        if self.kind == OperationKind::Mutation {
            return matches!(trigger, RefetchTrigger::Refresh { .. });
        }

        if let RefetchTrigger::Refresh { force: true } = trigger {
            return true;
        }

        let Some(updated_at) = freshness.updated_at else {
            return true;
        };
        if freshness.invalidated {
            return true;
        }

        if freshness.status == Status::Error
            && trigger == RefetchTrigger::Attach
            && self.refetch_on_error_attach
        {
            return true;
        }

        match self.fresh_for {
            Some(fresh_for) => now.saturating_duration_since(updated_at) >= fresh_for,
            None => false,
        }
    }
}
