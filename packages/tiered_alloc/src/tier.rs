use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use foldhash::{HashMap, HashMapExt};
use tracing::debug;

use crate::{DeviceError, DeviceHandle, DeviceMemory};

/// Every block size and every charged size is a multiple of this many bytes.
pub const ALIGNMENT: u64 = 16;

/// Aligned requests up to and including this size are served by [`Tier::Small`].
pub const SMALL_LIMIT: u64 = 65_536;

/// Aligned requests up to and including this size (and above [`SMALL_LIMIT`]) are served by
/// [`Tier::Medium`]. Anything larger goes to [`Tier::Large`].
pub const MEDIUM_LIMIT: u64 = 1_048_576;

/// Size class of an allocation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Tier {
    /// Requests up to [`SMALL_LIMIT`] bytes.
    Small,

    /// Requests up to [`MEDIUM_LIMIT`] bytes.
    Medium,

    /// Everything larger.
    Large,
}

impl Tier {
    /// All tiers, in ascending size order.
    pub const ALL: [Self; 3] = [Self::Small, Self::Medium, Self::Large];

    /// Selects the tier that serves an already-aligned request size.
    #[must_use]
    pub fn for_size(aligned_size: u64) -> Self {
        if aligned_size <= SMALL_LIMIT {
            Self::Small
        } else if aligned_size <= MEDIUM_LIMIT {
            Self::Medium
        } else {
            Self::Large
        }
    }

    /// Lowercase name used in logs and metric names.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rounds `size` up to the next multiple of [`ALIGNMENT`], or `None` on overflow.
pub(crate) fn align_up(size: u64) -> Option<u64> {
    size.checked_next_multiple_of(ALIGNMENT)
}

/// Size of a block grown to serve an aligned request of `min_size` bytes.
///
/// The result is never smaller than `min_size` and is always aligned.
#[expect(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    reason = "over-allocation is a heuristic and the float range is checked before converting back"
)]
pub(crate) fn grown_size(min_size: u64, growth_factor: f64) -> u64 {
    let scaled = (min_size as f64 * growth_factor).ceil();

    if !scaled.is_finite() || scaled >= u64::MAX as f64 {
        return min_size;
    }

    align_up((scaled as u64).max(min_size)).unwrap_or(min_size)
}

/// Lock-free counters of one tier.
///
/// `used` is charged and refunded without holding the structural lock so that pressure can be
/// sampled at any time. `total` is only written while the structural lock is held but may be
/// read without it.
#[derive(Debug, Default)]
pub(crate) struct PoolTier {
    used: AtomicU64,
    total: AtomicU64,

    /// Set by the checkpoint loop when this tier alone crosses the medium watermark.
    armed: AtomicBool,
}

impl PoolTier {
    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Fraction of the tier capacity that is in use.
    ///
    /// The capacity is the larger of the bytes held in blocks and the nominal tier size, so a
    /// freshly grown tier is not reported as full just because it holds one snug block.
    #[expect(
        clippy::cast_precision_loss,
        reason = "pressure is a ratio, precision loss on huge sizes is harmless"
    )]
    pub(crate) fn pressure(&self, nominal: u64) -> f64 {
        let capacity = self.total().max(nominal);

        if capacity == 0 {
            return 0.0;
        }

        self.used() as f64 / capacity as f64
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Relaxed)
    }

    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::Relaxed);
    }

    /// Clears the armed flag, returning whether it was set.
    pub(crate) fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::Relaxed)
    }

    fn charge(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Subtracts `bytes` from the used counter, clamping at zero.
    fn refund(&self, bytes: u64) {
        // The closure always returns `Some`, so this cannot fail.
        drop(
            self.used
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                    Some(used.saturating_sub(bytes))
                }),
        );
    }

    fn add_total(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    fn subtract_total(&self, bytes: u64) {
        drop(
            self.total
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                    Some(total.saturating_sub(bytes))
                }),
        );
    }
}

/// A block of device memory owned by a tier.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Block {
    pub(crate) handle: DeviceHandle,
    pub(crate) size: u64,

    /// Bytes charged to the tier's used counter by the current holder; zero while free.
    charged: u64,
}

impl Block {
    fn is_free(&self) -> bool {
        self.charged == 0
    }
}

/// Index of a block within its tier's block table.
pub(crate) type BlockId = usize;

/// What happened to a handle passed to [`TierBlocks::release()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ReleaseOutcome {
    Released { refunded: u64 },
    AlreadyFree,
    Unknown,
}

/// What a compaction pass returned to the device.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Compaction {
    pub(crate) blocks: usize,
    pub(crate) bytes: u64,
}

/// The block table of one tier: an arena of blocks indexed by small integer IDs and a
/// free list of IDs whose blocks are not held by anyone.
///
/// Only accessed while holding the structural lock of the owning
/// [`MemoryPool`][crate::memory_pool::MemoryPool].
#[derive(Debug, Default)]
pub(crate) struct TierBlocks {
    blocks: Vec<Block>,

    /// Free block IDs, oldest release first.
    free: Vec<BlockId>,

    by_handle: HashMap<DeviceHandle, BlockId>,
}

impl TierBlocks {
    pub(crate) fn new() -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
            by_handle: HashMap::new(),
        }
    }

    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Returns the position in the free list of the first free block of at least `min_size`
    /// bytes. First fit, not best fit - the scan stops at the first candidate.
    pub(crate) fn find_reusable(&self, min_size: u64) -> Option<usize> {
        self.free.iter().position(|&id| {
            self.blocks
                .get(id)
                .is_some_and(|block| block.size >= min_size)
        })
    }

    /// Takes the block at `free_position` off the free list and charges `charge` bytes for it.
    pub(crate) fn claim_free(
        &mut self,
        counters: &PoolTier,
        free_position: usize,
        charge: u64,
    ) -> Option<Block> {
        if free_position >= self.free.len() {
            return None;
        }

        let id = self.free.remove(free_position);
        self.mark_used(counters, id, charge)
    }

    /// Claims the block identified by `handle` if it is free and large enough.
    pub(crate) fn claim_handle(
        &mut self,
        counters: &PoolTier,
        handle: DeviceHandle,
        charge: u64,
    ) -> Option<Block> {
        let id = *self.by_handle.get(&handle)?;

        let block = self.blocks.get(id)?;
        if !block.is_free() || block.size < charge {
            return None;
        }

        let free_position = self.free.iter().position(|&free_id| free_id == id)?;
        self.free.remove(free_position);

        self.mark_used(counters, id, charge)
    }

    fn mark_used(&mut self, counters: &PoolTier, id: BlockId, charge: u64) -> Option<Block> {
        let block = self.blocks.get_mut(id)?;

        debug_assert!(block.is_free(), "free list referenced a block that is in use");
        debug_assert!(charge > 0 && charge <= block.size);

        block.charged = charge;
        counters.charge(charge);

        Some(*block)
    }

    /// Obtains a new block from the device for an aligned request of `min_size` bytes,
    /// over-allocating by `growth_factor`. If the device cannot provide the grown size, retries
    /// once at exactly `min_size`.
    ///
    /// The new block is charged `min_size` bytes and is not placed on the free list.
    pub(crate) fn grow(
        &mut self,
        counters: &PoolTier,
        device: &dyn DeviceMemory,
        min_size: u64,
        growth_factor: f64,
    ) -> Result<Block, DeviceError> {
        let preferred = grown_size(min_size, growth_factor);

        let (handle, size) = match device.allocate(preferred) {
            Ok(handle) => (handle, preferred),
            Err(e) if preferred > min_size => {
                debug!(
                    preferred,
                    min_size,
                    error = %e,
                    "grown block unavailable, retrying at exact size"
                );
                (device.allocate(min_size)?, min_size)
            }
            Err(e) => return Err(e),
        };

        let block = Block {
            handle,
            size,
            charged: min_size,
        };

        let id = self.blocks.len();
        self.blocks.push(block);
        self.by_handle.insert(handle, id);

        counters.add_total(size);
        counters.charge(min_size);

        Ok(block)
    }

    /// Returns the block identified by `handle` to the free list and refunds its charge.
    pub(crate) fn release(&mut self, counters: &PoolTier, handle: DeviceHandle) -> ReleaseOutcome {
        let Some(&id) = self.by_handle.get(&handle) else {
            return ReleaseOutcome::Unknown;
        };

        let Some(block) = self.blocks.get_mut(id) else {
            return ReleaseOutcome::Unknown;
        };

        if block.is_free() {
            return ReleaseOutcome::AlreadyFree;
        }

        let refunded = block.charged;
        block.charged = 0;
        self.free.push(id);
        counters.refund(refunded);

        ReleaseOutcome::Released { refunded }
    }

    /// Returns every free block to the device. Blocks in use are kept and stay addressable by
    /// their handles.
    pub(crate) fn compact(&mut self, counters: &PoolTier, device: &dyn DeviceMemory) -> Compaction {
        if self.free.is_empty() {
            return Compaction::default();
        }

        let mut compaction = Compaction::default();

        let blocks = std::mem::take(&mut self.blocks);
        self.free.clear();
        self.by_handle.clear();

        for block in blocks {
            if block.is_free() {
                device.free(block.handle);
                counters.subtract_total(block.size);
                compaction.blocks = compaction.blocks.saturating_add(1);
                compaction.bytes = compaction.bytes.saturating_add(block.size);
            } else {
                self.by_handle.insert(block.handle, self.blocks.len());
                self.blocks.push(block);
            }
        }

        compaction
    }

    /// Returns every block, free or not, to the device and resets the counters.
    pub(crate) fn drain(&mut self, counters: &PoolTier, device: &dyn DeviceMemory) {
        for block in self.blocks.drain(..) {
            device.free(block.handle);
        }

        self.free.clear();
        self.by_handle.clear();

        counters.used.store(0, Ordering::Relaxed);
        counters.total.store(0, Ordering::Relaxed);
    }
}
