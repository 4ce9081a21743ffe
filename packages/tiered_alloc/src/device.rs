use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::DeviceError;

/// Opaque identifier of a block of device memory, issued by a [`DeviceMemory`] implementation.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    /// Wraps a raw device-specific identifier (e.g. a device pointer).
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw device-specific identifier.
    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The device-memory primitive that backs an [`Allocator`][crate::Allocator].
///
/// This may be a real device allocator or a simulation. The allocator never assumes that
/// `allocate()` succeeds - failure is a normal outcome that it remediates or reports.
///
/// Each handle returned by `allocate()` is passed to `free()` exactly once.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceMemory: Debug + Send + Sync + 'static {
    /// Allocates a block of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot satisfy the request.
    fn allocate(&self, size: u64) -> Result<DeviceHandle, DeviceError>;

    /// Returns a block previously obtained from `allocate()` to the device.
    fn free(&self, handle: DeviceHandle);
}

/// A simulated device that hands out unique handles, optionally within a byte budget.
///
/// This is the default device of an [`Allocator`][crate::Allocator]. No memory is actually
/// reserved - only the accounting is performed - which makes it suitable for driving the
/// allocator's control logic in tests, benchmarks and environments without a device.
///
/// # Examples
///
/// ```
/// use tiered_alloc::{DeviceMemory, HostMemory};
///
/// let device = HostMemory::with_budget(1024);
///
/// let handle = device.allocate(1000).unwrap();
/// assert!(device.allocate(100).is_err());
///
/// device.free(handle);
/// assert!(device.allocate(100).is_ok());
/// ```
pub struct HostMemory {
    budget: Option<u64>,
    outstanding: AtomicU64,
    next_handle: AtomicU64,

    // Sizes are needed to refund the budget on free.
    sizes: scc::HashMap<DeviceHandle, u64>,
}

/// Handles start at a non-zero, aligned value so they never look like a null pointer.
const FIRST_HANDLE: u64 = 0x1000;

impl HostMemory {
    /// Creates a device without a byte budget. Allocations only fail on arithmetic overflow.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a device that fails any allocation that would take the outstanding byte count
    /// above `budget`.
    #[must_use]
    pub fn with_budget(budget: u64) -> Self {
        Self::build(Some(budget))
    }

    fn build(budget: Option<u64>) -> Self {
        Self {
            budget,
            outstanding: AtomicU64::new(0),
            next_handle: AtomicU64::new(FIRST_HANDLE),
            sizes: scc::HashMap::new(),
        }
    }

    /// Number of bytes currently allocated and not yet freed.
    #[must_use]
    pub fn outstanding_bytes(&self) -> u64 {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Number of blocks currently allocated and not yet freed.
    #[must_use]
    pub fn outstanding_blocks(&self) -> usize {
        self.sizes.len()
    }

    fn reserve(&self, size: u64) -> Result<(), DeviceError> {
        let limit = self.budget.unwrap_or(u64::MAX);

        self.outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|total| *total <= limit)
            })
            .map(|_| ())
            .map_err(|current| {
                DeviceError::new(
                    size,
                    format!("budget of {limit} bytes exhausted ({current} bytes outstanding)"),
                )
            })
    }
}

impl Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory")
            .field("budget", &self.budget)
            .field("outstanding_bytes", &self.outstanding_bytes())
            .field("outstanding_blocks", &self.outstanding_blocks())
            .finish_non_exhaustive()
    }
}

impl Default for HostMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory for HostMemory {
    fn allocate(&self, size: u64) -> Result<DeviceHandle, DeviceError> {
        self.reserve(size)?;

        // Relaxed is sufficient - uniqueness is all we need from the counter. Stepping by a
        // page keeps raw handles looking like plausible block addresses in logs.
        let handle = DeviceHandle(self.next_handle.fetch_add(FIRST_HANDLE, Ordering::Relaxed));

        // Handles are unique, so the insert cannot collide.
        drop(self.sizes.insert(handle, size));

        Ok(handle)
    }

    fn free(&self, handle: DeviceHandle) {
        if let Some((_, size)) = self.sizes.remove(&handle) {
            self.outstanding.fetch_sub(size, Ordering::AcqRel);
        }
    }
}
