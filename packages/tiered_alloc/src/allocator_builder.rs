use std::sync::Arc;
use std::time::Duration;

use crate::allocator::Shared;
use crate::checkpoint::DEFAULT_TICK;
use crate::memory_pool::MemoryPool;
use crate::{Allocator, ConfigRegistry, DeviceMemory, HostMemory, NmTelemetry, TelemetrySink};

/// Builder for creating an instance of [`Allocator`].
///
/// Every setting is optional. By default the allocator is backed by a fresh
/// [`HostMemory`] device, reads its configuration from a registry of its own that publishes
/// the default configuration, reports to [`NmTelemetry`] and runs the checkpoint loop every
/// 100 ms.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use tiered_alloc::{Allocator, ConfigRegistry, HostMemory};
///
/// let registry = Arc::new(ConfigRegistry::new());
///
/// let allocator = Allocator::builder()
///     .device(Arc::new(HostMemory::with_budget(64 * 1024 * 1024)))
///     .config_registry(Arc::clone(&registry))
///     .adaptive_checkpointing(false)
///     .build();
///
/// assert!(!allocator.is_checkpointing());
/// ```
#[derive(Debug)]
#[must_use]
pub struct AllocatorBuilder {
    device: Option<Arc<dyn DeviceMemory>>,
    registry: Option<Arc<ConfigRegistry>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    checkpoint_tick: Option<Duration>,
}

impl AllocatorBuilder {
    pub(crate) fn new() -> Self {
        Self {
            device: None,
            registry: None,
            telemetry: None,
            checkpoint_tick: Some(DEFAULT_TICK),
        }
    }

    /// Sets the device that provides the blocks.
    pub fn device(mut self, device: Arc<dyn DeviceMemory>) -> Self {
        self.device = Some(device);
        self
    }

    /// Sets the registry to read the configuration from. The registry may be shared with
    /// other allocators, in which case a publish through any of them affects all of them.
    pub fn config_registry(mut self, registry: Arc<ConfigRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Sets the sink that receives pool pressure samples from the checkpoint loop.
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Enables or disables the background checkpoint thread. Enabled by default.
    ///
    /// Without it, the cooldown started by a pressure-triggered compaction only decays when
    /// [`Allocator::checkpoint()`] is called, and tiers are never pre-armed on their own.
    pub fn adaptive_checkpointing(mut self, enabled: bool) -> Self {
        self.checkpoint_tick = enabled.then_some(self.checkpoint_tick.unwrap_or(DEFAULT_TICK));
        self
    }

    /// Sets the interval of the checkpoint thread and enables it.
    ///
    /// # Panics
    ///
    /// Panics if `tick` is zero.
    pub fn checkpoint_tick(mut self, tick: Duration) -> Self {
        assert!(!tick.is_zero(), "checkpoint tick must be non-zero");
        self.checkpoint_tick = Some(tick);
        self
    }

    /// Builds the allocator and, unless disabled, starts its checkpoint thread.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to create the checkpoint thread.
    #[must_use]
    pub fn build(self) -> Allocator {
        let device = self
            .device
            .unwrap_or_else(|| Arc::new(HostMemory::new()));
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ConfigRegistry::new()));
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(NmTelemetry));

        Allocator::from_parts(
            Shared::new(MemoryPool::new(device), registry, telemetry),
            self.checkpoint_tick,
        )
    }
}
