use crate::Tier;

/// Point-in-time view of one tier of an [`Allocator`][crate::Allocator].
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub struct TierStats {
    /// The tier described.
    pub tier: Tier,

    /// Used bytes over the larger of the tier's block bytes and its nominal capacity.
    pub pressure: f64,

    /// Bytes charged to outstanding handles.
    pub used_bytes: u64,

    /// Bytes held in blocks, free or not.
    pub total_bytes: u64,

    /// Number of blocks held by the tier.
    pub blocks: usize,

    /// Number of blocks not lent out.
    pub free_blocks: usize,

    /// Whether the checkpoint loop has armed the tier for compaction before its next growth.
    pub armed: bool,
}

/// Point-in-time view of an [`Allocator`][crate::Allocator], as returned by
/// [`Allocator::metrics()`][crate::Allocator::metrics].
///
/// The values are sampled one after another without a global lock, so under concurrent use
/// they need not add up exactly.
#[derive(Clone, Copy, Debug, PartialEq)]
#[non_exhaustive]
pub struct AllocatorStats {
    /// The small tier.
    pub small: TierStats,

    /// The medium tier.
    pub medium: TierStats,

    /// The large tier.
    pub large: TierStats,

    /// Bytes charged to outstanding handles across all tiers.
    pub total_used_bytes: u64,

    /// Bytes held in blocks across all tiers.
    pub total_bytes: u64,

    /// Whether the size cache is in use under the current configuration.
    pub auto_tuning_enabled: bool,

    /// The high watermark of the current configuration.
    pub high_watermark: f64,

    /// The critical watermark of the current configuration.
    pub critical_watermark: f64,

    /// Remaining checkpoint ticks before pressure-triggered compaction may run again.
    pub cooling: u32,

    /// Checkpoint budget armed by the most recent escalation.
    pub checkpoint_counter: i32,

    /// Number of checkpoint passes run so far, by the background thread or by
    /// [`Allocator::checkpoint()`][crate::Allocator::checkpoint].
    pub checkpoint_ticks: u64,

    /// Number of entries in the size cache.
    pub cached_sizes: usize,
}

impl AllocatorStats {
    /// The stats of one tier.
    #[must_use]
    pub fn tier(&self, tier: Tier) -> &TierStats {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }

    /// Mean pressure of the three tiers.
    #[must_use]
    pub fn mean_pressure(&self) -> f64 {
        (self.small.pressure + self.medium.pressure + self.large.pressure) / 3.0
    }
}
