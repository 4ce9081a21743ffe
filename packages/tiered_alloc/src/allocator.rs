use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointThread};
use crate::memory_pool::MemoryPool;
use crate::size_cache::SizeCache;
use crate::tier::{Compaction, ReleaseOutcome, align_up};
use crate::{
    AllocError, AllocatorBuilder, AllocatorConfig, AllocatorStats, ConfigError, ConfigRegistry,
    Handle, TelemetrySink, Tier, TierStats,
};

/// A tiered pool allocator of device memory.
///
/// Requests are rounded up to [`ALIGNMENT`][crate::ALIGNMENT] and served from one of three
/// tiers by size. Each tier keeps the blocks it obtained from the device and lends them out
/// again after they are released, preferring the first free block that is large enough. New
/// blocks are over-allocated by the configured growth factor.
///
/// When a tier fills up past the configured watermarks, acquisitions return free blocks to the
/// device before growing. A background checkpoint thread samples pressure on a fixed tick and
/// maintains the cooldown that keeps this from happening on every call.
///
/// The allocator is thread-safe. Share it via `Arc` between threads and
/// [`Pipeline`][crate::Pipeline]s.
///
/// # Lifetime
///
/// Dropping the allocator stops the checkpoint thread and returns every block to the device,
/// including blocks whose handles were never released.
///
/// # Examples
///
/// ```
/// use tiered_alloc::{Allocator, Tier};
///
/// let allocator = Allocator::new();
///
/// let handle = allocator.acquire(1000).unwrap();
/// assert_eq!(handle.tier(), Tier::Small);
/// assert!(handle.block_size() >= 1008);
///
/// allocator.release(handle);
/// ```
#[derive(Debug)]
pub struct Allocator {
    // Declared first so that it is dropped (stopped) before the shared state it ticks on.
    checkpoint_thread: Option<CheckpointThread>,

    shared: Arc<Shared>,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) pool: MemoryPool,
    pub(crate) registry: Arc<ConfigRegistry>,
    pub(crate) cache: SizeCache,
    pub(crate) checkpoint: Checkpoint,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
}

impl Allocator {
    /// Creates an allocator backed by a [`HostMemory`][crate::HostMemory] device, with the
    /// default configuration and adaptive checkpointing enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building an allocator with custom collaborators.
    pub fn builder() -> AllocatorBuilder {
        AllocatorBuilder::new()
    }

    pub(crate) fn from_parts(shared: Shared, checkpoint_tick: Option<Duration>) -> Self {
        let shared = Arc::new(shared);

        let checkpoint_thread = checkpoint_tick.map(|tick| {
            let shared = Arc::clone(&shared);
            CheckpointThread::spawn(tick, move || shared.checkpoint_tick())
        });

        Self {
            checkpoint_thread,
            shared,
        }
    }

    /// Lends out a block of at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidSize`] if `size` is zero and [`AllocError::OutOfMemory`]
    /// if the device cannot provide a block even after free blocks have been reclaimed.
    pub fn acquire(&self, size: u64) -> Result<Handle, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }

        let aligned = align_up(size).ok_or(AllocError::OutOfMemory { requested: size })?;
        let tier = Tier::for_size(aligned);

        // One snapshot for the whole call, so a concurrent publish cannot mix two configs.
        let config = self.shared.registry.get_current();

        if config.auto_tuning_enabled
            && let Some(handle) = self.shared.acquire_cached(size, aligned, tier, &config)
        {
            return Ok(handle);
        }

        self.shared.relieve_pressure(tier, &config);

        let mut pool = self.shared.pool.lock();

        if let Some(position) = pool.find_reusable(tier, aligned)
            && let Some(block) = pool.claim_free(tier, position, aligned)
        {
            return Ok(Handle::new(block.handle, tier, block.size, aligned));
        }

        if self.shared.pool.tier(tier).disarm() {
            let compaction = pool.compact(tier);
            self.shared.cache.clear();

            debug!(
                %tier,
                blocks = compaction.blocks,
                bytes = compaction.bytes,
                "compacted armed tier before growth"
            );
        }

        let block = pool
            .grow(tier, aligned, config.growth_factor)
            .map_err(|e| {
                debug!(%tier, size, aligned, error = %e, "tier growth failed");
                AllocError::OutOfMemory { requested: size }
            })?;

        drop(pool);

        debug!(%tier, aligned, block_size = block.size, "grew tier");

        if config.auto_tuning_enabled && self.shared.cache.note_growth(size) {
            self.shared
                .cache
                .insert(size, block.handle, config.cache_capacity());
        }

        Ok(Handle::new(block.handle, tier, block.size, aligned))
    }

    /// Returns a handle obtained from [`acquire()`][Self::acquire] so its block can be lent
    /// out again.
    ///
    /// Each handle must be released exactly once. Releasing a handle twice, or a handle from a
    /// different allocator, is a caller bug: it is logged and otherwise ignored.
    pub fn release(&self, handle: Handle) {
        let outcome = self
            .shared
            .pool
            .lock()
            .release(handle.tier(), handle.device_handle());

        match outcome {
            ReleaseOutcome::Released { .. } => {}
            ReleaseOutcome::AlreadyFree => {
                warn!(
                    handle = %handle.device_handle(),
                    tier = %handle.tier(),
                    "ignoring duplicate release"
                );
            }
            ReleaseOutcome::Unknown => {
                warn!(
                    handle = %handle.device_handle(),
                    tier = %handle.tier(),
                    "ignoring release of a handle this allocator does not own"
                );
            }
        }
    }

    /// Clears the size cache and returns every free block of every tier to the device.
    ///
    /// Blocks that are lent out are not affected.
    pub fn reclaim(&self) {
        let compaction = self.shared.compact_all();

        info!(
            blocks = compaction.blocks,
            bytes = compaction.bytes,
            "reclaimed free blocks"
        );
    }

    /// Samples the state of the allocator.
    #[must_use]
    pub fn metrics(&self) -> AllocatorStats {
        let shared = &self.shared;
        let config = shared.registry.get_current();

        let pool = shared.pool.lock();

        let tier_stats = |tier: Tier| {
            let counters = shared.pool.tier(tier);

            TierStats {
                tier,
                pressure: shared.pool.tier_pressure(tier, &config),
                used_bytes: counters.used(),
                total_bytes: counters.total(),
                blocks: pool.block_count(tier),
                free_blocks: pool.free_count(tier),
                armed: counters.is_armed(),
            }
        };

        let small = tier_stats(Tier::Small);
        let medium = tier_stats(Tier::Medium);
        let large = tier_stats(Tier::Large);

        drop(pool);

        AllocatorStats {
            small,
            medium,
            large,
            total_used_bytes: shared.pool.total_used(),
            total_bytes: shared.pool.total_size(),
            auto_tuning_enabled: config.auto_tuning_enabled,
            high_watermark: config.high_watermark,
            critical_watermark: config.critical_watermark,
            cooling: shared.checkpoint.cooling(),
            checkpoint_counter: shared.checkpoint.counter(),
            checkpoint_ticks: shared.checkpoint.ticks(),
            cached_sizes: shared.cache.len(),
        }
    }

    /// The currently published configuration.
    #[must_use]
    pub fn config(&self) -> Arc<AllocatorConfig> {
        self.shared.registry.get_current()
    }

    /// The registry this allocator reads its configuration from.
    #[must_use]
    pub fn config_registry(&self) -> &Arc<ConfigRegistry> {
        &self.shared.registry
    }

    /// Validates and publishes a new configuration through the allocator's registry.
    ///
    /// Acquisitions already in progress finish with the configuration they started with.
    /// If the new configuration changes the block layout, the size cache is cleared.
    ///
    /// # Errors
    ///
    /// Returns the validation error if `candidate` is rejected. The previous configuration
    /// stays in effect.
    pub fn update_config(&self, candidate: AllocatorConfig) -> Result<(), ConfigError> {
        self.shared.registry.update(candidate)?;

        if self
            .shared
            .cache
            .sync_layout(self.shared.registry.get_current().layout_fingerprint())
        {
            debug!("size cache cleared after layout change");
        }

        Ok(())
    }

    /// Whether the background checkpoint thread is running.
    #[must_use]
    pub fn is_checkpointing(&self) -> bool {
        self.checkpoint_thread.is_some()
    }

    /// Runs one checkpoint pass on the calling thread, as the background thread does on
    /// every tick.
    ///
    /// Useful when adaptive checkpointing is disabled and the caller drives the cadence.
    pub fn checkpoint(&self) {
        self.shared.checkpoint_tick();
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    pub(crate) fn new(
        pool: MemoryPool,
        registry: Arc<ConfigRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let fingerprint = registry.get_current().layout_fingerprint();

        Self {
            pool,
            registry,
            cache: SizeCache::new(fingerprint),
            checkpoint: Checkpoint::default(),
            telemetry,
        }
    }

    fn acquire_cached(
        &self,
        size: u64,
        aligned: u64,
        tier: Tier,
        config: &AllocatorConfig,
    ) -> Option<Handle> {
        // The registry may be shared, so a layout change may have been published by someone
        // else since the last call.
        if self.cache.sync_layout(config.layout_fingerprint()) {
            debug!("size cache cleared after layout change");
        }

        let device_handle = self.cache.get(size)?;

        let block = self
            .pool
            .lock()
            .claim_handle(tier, device_handle, aligned)?;

        Some(Handle::new(block.handle, tier, block.size, aligned))
    }

    /// Compacts all tiers if the pressure of `tier` calls for it.
    fn relieve_pressure(&self, tier: Tier, config: &AllocatorConfig) {
        let pressure = self.pool.tier_pressure(tier, config);

        let cooldown = if pressure > config.critical_watermark {
            config.cooldown().saturating_mul(2)
        } else if pressure > config.high_watermark && self.checkpoint.cooling() == 0 {
            config.cooldown()
        } else {
            return;
        };

        self.checkpoint.start_cooldown(cooldown);
        let compaction = self.compact_all();

        debug!(
            %tier,
            pressure,
            cooldown,
            blocks = compaction.blocks,
            bytes = compaction.bytes,
            "pressure-triggered compaction"
        );
    }

    fn compact_all(&self) -> Compaction {
        let mut pool = self.pool.lock();

        // Cleared under the lock so no entry can point at a block freed below.
        self.cache.clear();

        pool.compact_all()
    }

    pub(crate) fn checkpoint_tick(&self) {
        let config = self.registry.get_current();
        self.checkpoint
            .tick(&self.pool, &config, self.telemetry.as_ref());
    }
}
