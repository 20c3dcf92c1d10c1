use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// A structured key identifying one cached operation.
///
/// A key is an ordered sequence of segments. Each segment is a primitive value or a mapping of
/// strings to nested values. Two keys address the same entry iff their [`CanonicalKey`]s are
/// equal, which means that the order of fields within mappings does not matter.
///
/// Use the [`query_key!`](crate::query_key) macro for literal keys:
///
/// ```
/// use query_cache::query_key;
///
/// let a = query_key!["contacts-search", { "text": "jo", "page": 1 }];
/// let b = query_key!["contacts-search", { "page": 1, "text": "jo" }];
/// assert_eq!(a.canonicalize().unwrap(), b.canonicalize().unwrap());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    segments: Vec<Value>,
}

impl QueryKey {
    /// Creates a key from already converted segments.
    pub fn new(segments: Vec<Value>) -> Self {
        Self { segments }
    }

    /// Creates a key by serializing every segment.
    ///
    /// Fails with [`CacheError::InvalidKey`] if any of the segments can not be represented,
    /// for example a map with non-string keys.
    pub fn from_segments<I, S>(segments: I) -> Result<Self, CacheError>
    where
        I: IntoIterator<Item = S>,
        S: Serialize,
    {
        let segments = segments
            .into_iter()
            .map(|segment| serde_json::to_value(segment))
            .collect::<Result<_, _>>()?;
        Ok(Self { segments })
    }

    /// Appends a serializable segment to this key.
    pub fn push<S: Serialize>(&mut self, segment: S) -> Result<(), CacheError> {
        self.segments.push(serde_json::to_value(segment)?);
        Ok(())
    }

    /// The raw segments of this key.
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// Turns this key into its canonical, comparable identity.
    pub fn canonicalize(&self) -> Result<CanonicalKey, CacheError> {
        canonicalize(self)
    }
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        Self::new(vec![Value::from(segment)])
    }
}

impl From<String> for QueryKey {
    fn from(segment: String) -> Self {
        Self::new(vec![Value::from(segment)])
    }
}

/// Builds a [`QueryKey`] out of JSON-like segment literals.
#[macro_export]
macro_rules! query_key {
    ($($segment:tt),* $(,)?) => {
        $crate::QueryKey::new(vec![$($crate::__private::json!($segment)),*])
    };
}

/// The canonical identity of a [`QueryKey`].
///
/// The canonical form is a stable string rendering of every segment, with the fields of every
/// mapping sorted recursively. It is hashed with sha-256 to make comparisons cheap, and keeps the
/// per-segment rendering around for prefix matching.
#[derive(Clone, Eq)]
pub struct CanonicalKey {
    metadata: Arc<str>,
    segments: Arc<[Box<str>]>,
    hash: [u8; 32],
}

impl CanonicalKey {
    /// Returns the canonical string this key is derived from.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// A canonical key always has at least one segment.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether all segments of `prefix` match the leading segments of `self`.
    pub fn starts_with(&self, prefix: &CanonicalKey) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl PartialEq for CanonicalKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CanonicalKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metadata)
    }
}

impl fmt::Debug for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CanonicalKey").field(&self.metadata).finish()
    }
}

/// Canonicalizes a [`QueryKey`].
///
/// Fails with [`CacheError::InvalidKey`] for keys without any segment.
pub fn canonicalize(key: &QueryKey) -> Result<CanonicalKey, CacheError> {
    if key.segments.is_empty() {
        return Err(CacheError::InvalidKey("key has no segments".into()));
    }

    let mut segments = Vec::with_capacity(key.segments.len());
    for segment in &key.segments {
        let mut rendered = String::new();
        write_canonical(&mut rendered, segment).map_err(|e| CacheError::InvalidKey(e.to_string()))?;
        segments.push(rendered.into_boxed_str());
    }

    let metadata = format!("[{}]", segments.join(","));
    let hash = Sha256::digest(metadata.as_bytes()).into();

    Ok(CanonicalKey {
        metadata: metadata.into(),
        segments: segments.into(),
        hash,
    })
}

fn write_canonical(out: &mut String, value: &Value) -> fmt::Result {
    match value {
        Value::Null => out.write_str("null"),
        Value::Bool(b) => write!(out, "{b}"),
        Value::Number(n) => write!(out, "{n}"),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.write_char('[')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                write_canonical(out, item)?;
            }
            out.write_char(']')
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.write_char('{')?;
            for (i, (name, value)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.write_char(',')?;
                }
                write_string(out, name)?;
                out.write_char(':')?;
                write_canonical(out, value)?;
            }
            out.write_char('}')
        }
    }
}

fn write_string(out: &mut String, s: &str) -> fmt::Result {
    // `Debug` escaping is not stable enough for identities, go through the JSON encoder instead.
    let escaped = serde_json::to_string(s).map_err(|_| fmt::Error)?;
    out.write_str(&escaped)
}

/// Selects the entries affected by [`QueryStore::invalidate`](crate::QueryStore::invalidate)
/// and [`QueryStore::clear`](crate::QueryStore::clear).
#[derive(Clone)]
pub enum KeyFilter {
    /// Every entry in the store.
    All,
    /// The single entry with exactly this key.
    Exact(QueryKey),
    /// All entries whose key starts with all the segments of this key.
    Prefix(QueryKey),
    /// All entries for which the predicate returns `true`.
    Predicate(Arc<dyn Fn(&QueryKey) -> bool + Send + Sync>),
}

impl KeyFilter {
    /// Creates a [`KeyFilter::Predicate`].
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&QueryKey) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub(crate) fn resolve(&self) -> Result<ResolvedFilter<'_>, CacheError> {
        Ok(match self {
            Self::All => ResolvedFilter::All,
            Self::Exact(key) => ResolvedFilter::Exact(key.canonicalize()?),
            Self::Prefix(key) => ResolvedFilter::Prefix(key.canonicalize()?),
            Self::Predicate(f) => ResolvedFilter::Predicate(f.as_ref()),
        })
    }
}

impl From<QueryKey> for KeyFilter {
    fn from(key: QueryKey) -> Self {
        Self::Exact(key)
    }
}

impl From<&QueryKey> for KeyFilter {
    fn from(key: &QueryKey) -> Self {
        Self::Exact(key.clone())
    }
}

impl fmt::Debug for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Exact(key) => f.debug_tuple("Exact").field(key).finish(),
            Self::Prefix(key) => f.debug_tuple("Prefix").field(key).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A [`KeyFilter`] with its keys canonicalized.
pub(crate) enum ResolvedFilter<'a> {
    All,
    Exact(CanonicalKey),
    Prefix(CanonicalKey),
    Predicate(&'a (dyn Fn(&QueryKey) -> bool + Send + Sync)),
}

impl ResolvedFilter<'_> {
    pub(crate) fn matches(&self, key: &QueryKey, canonical: &CanonicalKey) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => canonical == exact,
            Self::Prefix(prefix) => canonical.starts_with(prefix),
            Self::Predicate(f) => f(key),
        }
    }
}
