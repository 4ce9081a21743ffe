use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::DeviceHandle;

/// Maps an exact request size to the block last grown for that size.
///
/// A hit is only a hint: the caller still has to claim the block, which fails if the block is
/// in use or was returned to the device.
pub(crate) struct SizeCache {
    entries: scc::HashMap<u64, DeviceHandle>,

    /// Layout fingerprint of the configuration the entries were created under.
    fingerprint: AtomicU64,

    /// The request size of the most recent growth, used to spot repeated growth.
    last_growth: AtomicU64,
}

impl SizeCache {
    pub(crate) fn new(fingerprint: u64) -> Self {
        Self {
            entries: scc::HashMap::new(),
            fingerprint: AtomicU64::new(fingerprint),
            last_growth: AtomicU64::new(0),
        }
    }

    /// Clears the cache if the layout fingerprint differs from the one the entries were
    /// created under. Returns whether the cache was cleared.
    ///
    /// Concurrent callers may insert entries for the old layout while this runs. Those are
    /// harmless because hits are verified before use.
    pub(crate) fn sync_layout(&self, fingerprint: u64) -> bool {
        if self.fingerprint.swap(fingerprint, Ordering::AcqRel) == fingerprint {
            return false;
        }

        self.entries.clear();
        true
    }

    pub(crate) fn get(&self, size: u64) -> Option<DeviceHandle> {
        self.entries.read(&size, |_, handle| *handle)
    }

    /// Records that a block was grown for a request of `size` bytes and returns whether the
    /// previous growth was for the same size.
    pub(crate) fn note_growth(&self, size: u64) -> bool {
        self.last_growth.swap(size, Ordering::Relaxed) == size
    }

    /// Points the entry for `size` at `handle`. A new entry is only added while the cache
    /// holds fewer than `capacity` entries.
    pub(crate) fn insert(&self, size: u64, handle: DeviceHandle, capacity: usize) -> bool {
        if self
            .entries
            .update(&size, |_, cached| *cached = handle)
            .is_some()
        {
            return true;
        }

        // The length check races with other inserters, so the cache can overshoot the
        // capacity by the number of concurrent callers.
        if self.entries.len() >= capacity {
            return false;
        }

        self.entries.insert(size, handle).is_ok()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for SizeCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeCache")
            .field("len", &self.len())
            .field("fingerprint", &self.fingerprint.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
