//! Run-scoped deduplication ledger
//!
//! A single set of accepted file identities shared between discovery and the
//! download workers. Discovery inserts URL keys before a task is scheduled;
//! workers insert content keys (md5 of the downloaded bytes) before a file is
//! moved into place, catching the same binary served from rotating paths.
//! First-seen wins; the ledger is not persisted across runs.

use std::collections::HashSet;
use std::sync::Mutex;

/// Identity of a file within one run
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Resolved absolute download URL, query string stripped
    Url(String),
    /// Hex md5 digest of the file contents
    Content(String),
}

impl DedupKey {
    /// Key for a resolved download URL
    ///
    /// The query string is ignored so that the same server path carrying
    /// different `?f=` display names compares equal.
    pub fn from_url(url: &str) -> Self {
        let normalized = match url.split_once('?') {
            Some((path, _)) => path,
            None => url,
        };
        Self::Url(normalized.trim_end_matches('/').to_string())
    }

    /// Key for downloaded file contents
    pub fn from_content(bytes: &[u8]) -> Self {
        Self::Content(format!("{:x}", md5::compute(bytes)))
    }
}

/// Set of accepted [`DedupKey`]s for one run
#[derive(Debug, Default)]
pub struct DedupLedger {
    seen: Mutex<HashSet<DedupKey>>,
}

impl DedupLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the key if it has not been seen this run
    ///
    /// Inserts on accept, so a second call with the same key returns false.
    pub fn should_accept(&self, key: DedupKey) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key)
    }

    /// Number of distinct keys accepted so far
    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// True when no key has been accepted yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
