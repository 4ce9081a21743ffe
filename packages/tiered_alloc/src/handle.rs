use crate::{DeviceHandle, Tier};

/// A block of device memory lent out by [`Allocator::acquire()`][crate::Allocator::acquire].
///
/// The allocator keeps ownership of the underlying block. The caller must give the handle back
/// via [`Allocator::release()`][crate::Allocator::release] exactly once when done with it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Handle {
    device: DeviceHandle,
    tier: Tier,
    block_size: u64,
    aligned_size: u64,
}

impl Handle {
    pub(crate) fn new(
        device: DeviceHandle,
        tier: Tier,
        block_size: u64,
        aligned_size: u64,
    ) -> Self {
        Self {
            device,
            tier,
            block_size,
            aligned_size,
        }
    }

    /// The device identifier of the underlying block.
    #[must_use]
    pub fn device_handle(&self) -> DeviceHandle {
        self.device
    }

    /// The tier the block belongs to.
    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Size of the underlying block. At least the requested size and a multiple of
    /// [`ALIGNMENT`][crate::ALIGNMENT]. May exceed the request when a larger free block
    /// was reused or the block was grown with over-allocation.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// The requested size rounded up to [`ALIGNMENT`][crate::ALIGNMENT]. This is what the
    /// acquisition counts against the tier.
    #[must_use]
    pub fn aligned_size(&self) -> u64 {
        self.aligned_size
    }
}
