use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::tier::{Block, Compaction, PoolTier, ReleaseOutcome, TierBlocks};
use crate::{AllocatorConfig, DeviceError, DeviceHandle, DeviceMemory, Tier};

/// One value per [`Tier`].
#[derive(Debug, Default)]
pub(crate) struct TierSet<T> {
    small: T,
    medium: T,
    large: T,
}

impl<T> TierSet<T> {
    pub(crate) fn get(&self, tier: Tier) -> &T {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }

    pub(crate) fn get_mut(&mut self, tier: Tier) -> &mut T {
        match tier {
            Tier::Small => &mut self.small,
            Tier::Medium => &mut self.medium,
            Tier::Large => &mut self.large,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (Tier, &T)> {
        Tier::ALL.into_iter().map(move |tier| (tier, self.get(tier)))
    }
}

/// The three tiers of an allocator and the device that backs them.
///
/// Structural mutation of any tier (block creation, free-list edits, compaction) is serialized
/// by a single lock, obtained via [`lock()`][Self::lock]. The per-tier counters are atomics and
/// can be sampled without the lock.
pub(crate) struct MemoryPool {
    tiers: TierSet<PoolTier>,
    blocks: Mutex<TierSet<TierBlocks>>,
    device: Arc<dyn DeviceMemory>,
}

impl MemoryPool {
    pub(crate) fn new(device: Arc<dyn DeviceMemory>) -> Self {
        Self {
            tiers: TierSet::default(),
            blocks: Mutex::new(TierSet {
                small: TierBlocks::new(),
                medium: TierBlocks::new(),
                large: TierBlocks::new(),
            }),
            device,
        }
    }

    pub(crate) fn tier(&self, tier: Tier) -> &PoolTier {
        self.tiers.get(tier)
    }

    pub(crate) fn tiers(&self) -> impl Iterator<Item = (Tier, &PoolTier)> {
        self.tiers.iter()
    }

    pub(crate) fn total_used(&self) -> u64 {
        self.tiers()
            .map(|(_, tier)| tier.used())
            .fold(0, u64::saturating_add)
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.tiers()
            .map(|(_, tier)| tier.total())
            .fold(0, u64::saturating_add)
    }

    /// Pressure of one tier under `config`.
    pub(crate) fn tier_pressure(&self, tier: Tier, config: &AllocatorConfig) -> f64 {
        self.tier(tier).pressure(config.nominal_capacity(tier))
    }

    /// Whole-pool pressure: used bytes of all tiers over their combined capacity.
    #[expect(
        clippy::cast_precision_loss,
        reason = "pressure is a ratio, precision loss on huge sizes is harmless"
    )]
    pub(crate) fn pressure(&self, config: &AllocatorConfig) -> f64 {
        let nominal = Tier::ALL
            .into_iter()
            .map(|tier| config.nominal_capacity(tier))
            .fold(0, u64::saturating_add);

        let capacity = self.total_size().max(nominal);

        if capacity == 0 {
            return 0.0;
        }

        self.total_used() as f64 / capacity as f64
    }

    /// Takes the structural lock.
    pub(crate) fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            pool: self,
            blocks: self.blocks.lock(),
        }
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("tiers", &self.tiers)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let blocks = self.blocks.get_mut();

        for tier in Tier::ALL {
            blocks
                .get_mut(tier)
                .drain(self.tiers.get(tier), self.device.as_ref());
        }
    }
}

/// Structural access to the tiers of a [`MemoryPool`], valid while the pool lock is held.
pub(crate) struct PoolGuard<'a> {
    pool: &'a MemoryPool,
    blocks: MutexGuard<'a, TierSet<TierBlocks>>,
}

impl PoolGuard<'_> {
    pub(crate) fn find_reusable(&self, tier: Tier, min_size: u64) -> Option<usize> {
        self.blocks.get(tier).find_reusable(min_size)
    }

    pub(crate) fn claim_free(
        &mut self,
        tier: Tier,
        free_position: usize,
        charge: u64,
    ) -> Option<Block> {
        self.blocks
            .get_mut(tier)
            .claim_free(self.pool.tiers.get(tier), free_position, charge)
    }

    pub(crate) fn claim_handle(
        &mut self,
        tier: Tier,
        handle: DeviceHandle,
        charge: u64,
    ) -> Option<Block> {
        self.blocks
            .get_mut(tier)
            .claim_handle(self.pool.tiers.get(tier), handle, charge)
    }

    pub(crate) fn grow(
        &mut self,
        tier: Tier,
        min_size: u64,
        growth_factor: f64,
    ) -> Result<Block, DeviceError> {
        self.blocks.get_mut(tier).grow(
            self.pool.tiers.get(tier),
            self.pool.device.as_ref(),
            min_size,
            growth_factor,
        )
    }

    pub(crate) fn release(&mut self, tier: Tier, handle: DeviceHandle) -> ReleaseOutcome {
        self.blocks
            .get_mut(tier)
            .release(self.pool.tiers.get(tier), handle)
    }

    pub(crate) fn compact(&mut self, tier: Tier) -> Compaction {
        self.blocks
            .get_mut(tier)
            .compact(self.pool.tiers.get(tier), self.pool.device.as_ref())
    }

    pub(crate) fn compact_all(&mut self) -> Compaction {
        Tier::ALL
            .into_iter()
            .map(|tier| self.compact(tier))
            .fold(Compaction::default(), |acc, c| Compaction {
                blocks: acc.blocks.saturating_add(c.blocks),
                bytes: acc.bytes.saturating_add(c.bytes),
            })
    }

    pub(crate) fn free_count(&self, tier: Tier) -> usize {
        self.blocks.get(tier).free_count()
    }

    pub(crate) fn block_count(&self, tier: Tier) -> usize {
        self.blocks.get(tier).block_count()
    }
}
