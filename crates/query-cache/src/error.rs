use thiserror::Error;

/// Errors raised by the cache itself.
///
/// Failures of the user-supplied operation are not part of this enum. Those are recorded on the
/// entry and handed to whoever awaits the invocation, see [`EntryState::error`](crate::EntryState).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The key could not be turned into a [`CanonicalKey`](crate::CanonicalKey).
    ///
    /// The attached string describes why, e.g. a map with non-string keys or an empty key.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// A subscriber was detached without a matching attach.
    ///
    /// This is a programming error on the caller side, most likely a handle that was
    /// detached twice.
    #[error("detach without matching attach")]
    Underflow,
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidKey(err.to_string())
    }
}
