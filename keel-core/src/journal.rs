//! Per-invocation execution journal.
//!
//! Every task or resource-init invocation gets a fresh journal unless the
//! caller forwards one explicitly. Middleware layers and the body use it as
//! a typed cooperation channel: a cache layer records its hit flag, a retry
//! layer its attempt counter, a timeout layer its cancellation handle, and
//! the body can read any of them.

use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, JournalError};
use crate::types::AnyValue;

/// An opaque, typed journal key.
///
/// The phantom type ties reads and writes of one key to one value type.
/// Keys are usually declared as constants next to the middleware that owns
/// them:
///
/// ```ignore
/// const ATTEMPT: JournalKey<u32> = JournalKey::new("retry.attempt");
/// ```
pub struct JournalKey<T> {
    id: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JournalKey<T> {
    pub const fn new(id: &'static str) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &'static str {
        self.id
    }
}

impl<T> Clone for JournalKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for JournalKey<T> {}

/// Well-known key under which cancellation-aware middleware installs a
/// [`CancellationToken`]. Downstream layers that observe cancellation are
/// expected to abort cooperatively.
pub const CANCELLATION: JournalKey<CancellationToken> =
    JournalKey::new("keel.journal.cancellation");

struct JournalInner {
    id: Uuid,
    entries: DashMap<&'static str, AnyValue>,
}

/// The per-invocation typed key/value store.
///
/// Cloning a `Journal` clones the handle, not the entries; all clones see
/// the same store. Forward a clone into a nested task call to share state
/// across invocations.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<JournalInner>,
}

impl Journal {
    /// Create a fresh, empty journal.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(JournalInner {
                id: Uuid::new_v4(),
                entries: DashMap::new(),
            }),
        }
    }

    /// Unique id of this journal (one per invocation unless forwarded).
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Write a value under `key`. Fails fast if the key is already present;
    /// use [`set_override`](Self::set_override) to replace deliberately.
    pub fn set<T: Send + Sync + 'static>(
        &self,
        key: &JournalKey<T>,
        value: T,
    ) -> Result<(), Error> {
        use dashmap::mapref::entry::Entry;
        match self.inner.entries.entry(key.id) {
            Entry::Occupied(_) => Err(Error::Journal(JournalError::KeyInUse { key: key.id })),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(value));
                Ok(())
            }
        }
    }

    /// Write a value under `key`, replacing any existing entry.
    pub fn set_override<T: Send + Sync + 'static>(&self, key: &JournalKey<T>, value: T) {
        self.inner.entries.insert(key.id, Arc::new(value));
    }

    /// Read a value, cloning it out of the journal.
    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &JournalKey<T>) -> Option<T> {
        self.get_arc(key).map(|arc| (*arc).clone())
    }

    /// Read a value without cloning the payload.
    pub fn get_arc<T: Send + Sync + 'static>(&self, key: &JournalKey<T>) -> Option<Arc<T>> {
        self.inner
            .entries
            .get(key.id)
            .and_then(|entry| entry.value().clone().downcast::<T>().ok())
    }

    pub fn has<T>(&self, key: &JournalKey<T>) -> bool {
        self.inner.entries.contains_key(key.id)
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Untyped write used by the kernel itself.
    pub(crate) fn set_raw(&self, key: &'static str, value: AnyValue) {
        self.inner.entries.insert(key, value);
    }

    /// Untyped read used by the kernel itself.
    #[allow(dead_code)]
    pub(crate) fn get_raw(&self, key: &'static str) -> Option<AnyValue> {
        self.inner.entries.get(key).map(|entry| entry.value().clone())
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("id", &self.inner.id)
            .field("entry_count", &self.inner.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: JournalKey<u32> = JournalKey::new("test.counter");
    const LABEL: JournalKey<String> = JournalKey::new("test.label");

    #[test]
    fn set_then_get() {
        let journal = Journal::new();
        journal.set(&COUNTER, 7).unwrap();
        assert_eq!(journal.get(&COUNTER), Some(7));
        assert!(journal.has(&COUNTER));
        assert!(!journal.has(&LABEL));
    }

    #[test]
    fn duplicate_set_fails_fast() {
        let journal = Journal::new();
        journal.set(&COUNTER, 1).unwrap();
        let err = journal.set(&COUNTER, 2).unwrap_err();
        assert!(matches!(
            err,
            Error::Journal(JournalError::KeyInUse { key: "test.counter" })
        ));
        // the original value survives
        assert_eq!(journal.get(&COUNTER), Some(1));
    }

    #[test]
    fn override_replaces() {
        let journal = Journal::new();
        journal.set(&COUNTER, 1).unwrap();
        journal.set_override(&COUNTER, 2);
        assert_eq!(journal.get(&COUNTER), Some(2));
    }

    #[test]
    fn clones_share_entries() {
        let journal = Journal::new();
        let forwarded = journal.clone();
        forwarded.set(&LABEL, "hello".to_string()).unwrap();
        assert_eq!(journal.get(&LABEL).as_deref(), Some("hello"));
        assert_eq!(journal.id(), forwarded.id());
    }

    #[test]
    fn cancellation_key_roundtrip() {
        let journal = Journal::new();
        let token = CancellationToken::new();
        journal.set(&CANCELLATION, token.clone()).unwrap();
        token.cancel();
        assert!(journal.get(&CANCELLATION).unwrap().is_cancelled());
    }
}
