//! Devices, telemetry sinks and configurations shared by the integration tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tiered_alloc::{
    Allocator, AllocatorConfig, BatchOutcome, ConfigRegistry, DeviceError, DeviceHandle,
    DeviceMemory, HostMemory, TelemetrySink,
};

/// A device that fails its first `failures` allocations and then behaves like [`HostMemory`].
#[derive(Debug)]
pub(crate) struct FlakyDevice {
    remaining_failures: AtomicUsize,
    inner: HostMemory,
}

impl FlakyDevice {
    pub(crate) fn failing_first(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            inner: HostMemory::new(),
        }
    }

    pub(crate) fn outstanding_bytes(&self) -> u64 {
        self.inner.outstanding_bytes()
    }
}

impl DeviceMemory for FlakyDevice {
    fn allocate(&self, size: u64) -> Result<DeviceHandle, DeviceError> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();

        if failed {
            return Err(DeviceError::new(size, "injected failure"));
        }

        self.inner.allocate(size)
    }

    fn free(&self, handle: DeviceHandle) {
        self.inner.free(handle);
    }
}

/// Records what a pipeline reports, for assertions.
#[derive(Debug, Default)]
pub(crate) struct RecordingTelemetry {
    pub(crate) batch_sizes: Mutex<Vec<u32>>,
    pub(crate) outcomes: Mutex<Vec<BatchOutcome>>,
    pub(crate) allocation_errors: AtomicUsize,
}

impl TelemetrySink for RecordingTelemetry {
    fn allocation_error(&self, _stream: &str) {
        self.allocation_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_outcome(&self, _stream: &str, outcome: BatchOutcome) {
        self.outcomes.lock().push(outcome);
    }

    fn batch_size(&self, _stream: &str, batch_size: u32) {
        self.batch_sizes.lock().push(batch_size);
    }
}

/// The default configuration with the size cache turned off, so every acquire goes through
/// the free lists.
pub(crate) fn uncached_config() -> AllocatorConfig {
    let mut config = AllocatorConfig::default();
    config.auto_tuning_enabled = false;
    config
}

/// An allocator without a checkpoint thread, so that tests control every state change.
pub(crate) fn manual_allocator(
    config: AllocatorConfig,
    device: Arc<dyn DeviceMemory>,
) -> Allocator {
    let registry = ConfigRegistry::try_with_initial(config).unwrap();

    Allocator::builder()
        .device(device)
        .config_registry(Arc::new(registry))
        .adaptive_checkpointing(false)
        .build()
}
