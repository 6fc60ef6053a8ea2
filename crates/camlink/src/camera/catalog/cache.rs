//! Catalog cache and scan progress counters.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::camera::types::FileDescriptor;

/// The published result of the last complete scan.
#[derive(Debug, Default)]
pub struct CatalogCache {
    entries: Vec<FileDescriptor>,
    complete: bool,
}

impl CatalogCache {
    /// Replaces the contents with a finished scan's listing.
    pub fn publish(&mut self, entries: Vec<FileDescriptor>) {
        self.entries = entries;
        self.complete = true;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.complete = false;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `[page_index * page_size, +page_size)` clamped to the listing.
    /// Out-of-range pages and a zero page size give an empty page.
    pub fn page(&self, page_index: usize, page_size: usize) -> Vec<FileDescriptor> {
        if page_size == 0 {
            return Vec::new();
        }
        let Some(start) = page_index.checked_mul(page_size) else {
            return Vec::new();
        };
        if start >= self.entries.len() {
            return Vec::new();
        }
        let end = start.saturating_add(page_size).min(self.entries.len());
        self.entries[start..end].to_vec()
    }
}

/// Lock-free progress counters, written by the scan worker and read by pollers.
#[derive(Debug, Default)]
pub struct ScanCounters {
    current: AtomicU64,
    total: AtomicU64,
}

impl ScanCounters {
    pub fn reset(&self) {
        self.current.store(0, Ordering::Relaxed);
        self.total.store(0, Ordering::Relaxed);
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn advance(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// (current, total)
    pub fn snapshot(&self) -> (u64, u64) {
        (self.current.load(Ordering::Relaxed), self.total.load(Ordering::Relaxed))
    }
}
