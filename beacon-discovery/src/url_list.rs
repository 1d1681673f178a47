//! Snapshot list of server URLs
//!
//! Readers load an immutable `Arc<Vec<String>>` without locking; every
//! mutation builds a new vector and swaps it in, bumping the version. Writers
//! are serialized among themselves so a read-modify-swap never loses an
//! update.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Read side of the membership view, the only contract with URL selectors.
pub trait UrlSource: Send + Sync {
    /// Current snapshot of reachable server URLs
    fn urls(&self) -> Arc<Vec<String>>;
}

/// Deduplicated, atomically swapped list of URLs
pub struct UrlList {
    current: ArcSwap<Vec<String>>,
    version: AtomicU64,
    writer: Mutex<()>,
}

impl UrlList {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(Vec::new()),
            version: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot. Never blocks.
    #[inline]
    pub fn snapshot(&self) -> Arc<Vec<String>> {
        self.current.load_full()
    }

    /// Number of mutations published so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.current.load().iter().any(|u| u == url)
    }

    /// Replace the whole list, dropping duplicates but keeping first-seen order
    pub fn replace<I>(&self, urls: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut next: Vec<String> = Vec::new();
        for url in urls {
            if !next.contains(&url) {
                next.push(url);
            }
        }

        let _guard = self.writer.lock();
        self.publish(next);
    }

    /// Append `url` unless already present. Returns whether it was added.
    pub fn insert(&self, url: &str) -> bool {
        let _guard = self.writer.lock();
        let current = self.current.load();
        if current.iter().any(|u| u == url) {
            return false;
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(url.to_string());
        self.publish(next);
        true
    }

    /// Remove `url` if present. Returns whether it was removed.
    pub fn remove(&self, url: &str) -> bool {
        let _guard = self.writer.lock();
        let current = self.current.load();
        if !current.iter().any(|u| u == url) {
            return false;
        }

        let next: Vec<String> = current.iter().filter(|u| *u != url).cloned().collect();
        self.publish(next);
        true
    }

    /// Replace `old` with `new` in place, or append `new` if `old` is absent.
    pub fn replace_entry(&self, old: &str, new: &str) {
        let _guard = self.writer.lock();
        let current = self.current.load();

        let mut next: Vec<String> = Vec::with_capacity(current.len() + 1);
        let mut placed = false;
        for url in current.iter() {
            if url == old || url == new {
                if !placed {
                    next.push(new.to_string());
                    placed = true;
                }
            } else {
                next.push(url.clone());
            }
        }
        if !placed {
            next.push(new.to_string());
        }
        self.publish(next);
    }

    pub fn clear(&self) {
        let _guard = self.writer.lock();
        self.publish(Vec::new());
    }

    // Caller holds the writer lock
    fn publish(&self, next: Vec<String>) {
        self.current.store(Arc::new(next));
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl Default for UrlList {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UrlList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlList")
            .field("urls", &self.snapshot())
            .field("version", &self.version())
            .finish()
    }
}

impl UrlSource for UrlList {
    fn urls(&self) -> Arc<Vec<String>> {
        self.snapshot()
    }
}
