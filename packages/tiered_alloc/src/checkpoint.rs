//! Hysteresis state consulted by acquisitions and the background loop that maintains it.

use std::fmt;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use event_listener::{Event, Listener};
use tracing::{debug, trace};

use crate::memory_pool::MemoryPool;
use crate::{AllocatorConfig, TelemetrySink, Tier};

/// Default interval between two checkpoint ticks.
pub(crate) const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// What a checkpoint tick decided based on whole-pool pressure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TickDecision {
    /// Pressure above the critical watermark armed a double-strength checkpoint.
    Critical,

    /// Pressure above the high watermark armed a checkpoint.
    High,

    /// Pressure above a watermark, but a cooldown is still running.
    Cooling,

    /// Pressure below the low watermark let the cooldown decay by one tick.
    Decayed,

    /// Nothing to do.
    Idle,
}

/// Checkpoint counter and cooldown shared by [`Allocator::acquire()`][crate::Allocator::acquire]
/// and the checkpoint loop.
#[derive(Debug, Default)]
pub(crate) struct Checkpoint {
    /// Checkpoint budget armed by the most recent escalation. Advisory only.
    counter: AtomicI32,

    /// Remaining ticks before pressure-triggered remediation may run again.
    cooling: AtomicU32,

    ticks: AtomicU64,
}

impl Checkpoint {
    pub(crate) fn counter(&self) -> i32 {
        self.counter.load(Ordering::Relaxed)
    }

    pub(crate) fn cooling(&self) -> u32 {
        self.cooling.load(Ordering::Relaxed)
    }

    pub(crate) fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn start_cooldown(&self, ticks: u32) {
        self.cooling.store(ticks, Ordering::Relaxed);
    }

    /// One pass of the checkpoint loop.
    ///
    /// Adjusts the counter and cooldown from whole-pool pressure, arms every tier whose own
    /// pressure exceeds the medium watermark and reports per-tier pressure to `telemetry`.
    /// Never frees memory itself.
    pub(crate) fn tick(
        &self,
        pool: &MemoryPool,
        config: &AllocatorConfig,
        telemetry: &dyn TelemetrySink,
    ) -> TickDecision {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        let pressure = pool.pressure(config);
        let cooling = self.cooling();

        let decision = if pressure > config.critical_watermark {
            if cooling == 0 {
                self.counter.store(
                    config.checkpoint_freq.saturating_mul(2),
                    Ordering::Relaxed,
                );
                self.start_cooldown(config.cooldown().saturating_mul(2));
                TickDecision::Critical
            } else {
                TickDecision::Cooling
            }
        } else if pressure > config.high_watermark {
            if cooling == 0 {
                self.counter
                    .store(config.checkpoint_freq, Ordering::Relaxed);
                self.start_cooldown(config.cooldown());
                TickDecision::High
            } else {
                TickDecision::Cooling
            }
        } else if pressure < config.low_watermark && cooling > 0 {
            // Only this loop decrements, so a plain store cannot lose a concurrent decrement.
            // A concurrent `start_cooldown()` may be overwritten, which merely shortens it.
            self.cooling
                .store(cooling.saturating_sub(1), Ordering::Relaxed);
            TickDecision::Decayed
        } else {
            TickDecision::Idle
        };

        for (tier, counters) in pool.tiers() {
            let tier_pressure = counters.pressure(config.nominal_capacity(tier));
            telemetry.pool_pressure(tier, tier_pressure);

            if tier_pressure > config.medium_watermark {
                counters.arm();

                // Arming a tier never lowers a budget set by an escalation above.
                if cooling == 0 {
                    self.counter
                        .fetch_max(config.checkpoint_freq, Ordering::Relaxed);
                }
            }
        }

        trace!(
            tick,
            pressure,
            cooling,
            ?decision,
            armed_small = pool.tier(Tier::Small).is_armed(),
            armed_medium = pool.tier(Tier::Medium).is_armed(),
            armed_large = pool.tier(Tier::Large).is_armed(),
            "checkpoint tick"
        );

        decision
    }
}

struct Control {
    shutdown: AtomicBool,
    wake: Event,
}

/// A named background thread that calls a function on a fixed tick until stopped.
///
/// Dropping the value stops the thread and waits for it to exit.
pub(crate) struct CheckpointThread {
    control: Arc<Control>,
    handle: Option<JoinHandle<()>>,
}

impl CheckpointThread {
    /// # Panics
    ///
    /// Panics if the operating system refuses to create a thread.
    pub(crate) fn spawn<F>(tick: Duration, mut on_tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let control = Arc::new(Control {
            shutdown: AtomicBool::new(false),
            wake: Event::new(),
        });

        let thread_control = Arc::clone(&control);

        let handle = thread::Builder::new()
            .name("tiered-alloc-checkpoint".to_string())
            .spawn(move || {
                debug!(tick_ms = tick.as_millis(), "checkpoint thread started");

                loop {
                    let listener = thread_control.wake.listen();

                    // Re-check after registering the listener to avoid a lost wakeup.
                    if thread_control.shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    // Only shutdown notifies, so an early wakeup goes back to the check above.
                    if listener.wait_timeout(tick).is_some() {
                        continue;
                    }

                    on_tick();
                }

                debug!("checkpoint thread exiting");
            })
            .expect("failed to spawn checkpoint thread: thread spawning failure is not supported");

        Self {
            control,
            handle: Some(handle),
        }
    }

    #[cfg_attr(test, mutants::skip)] // Removing this causes timeouts (the thread never stops).
    fn stop(&mut self) {
        // Release pairs with the Acquire in the loop so the thread observes the flag.
        self.control.shutdown.store(true, Ordering::Release);
        self.control.wake.notify(usize::MAX);

        if let Some(handle) = self.handle.take()
            && let Err(payload) = handle.join()
            && !thread::panicking()
        {
            // The tick function panicked. Surface that instead of silently losing it.
            panic::resume_unwind(payload);
        }
    }
}

impl fmt::Debug for CheckpointThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointThread")
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for CheckpointThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;
    use crate::{DeviceMemory, HostMemory, MockTelemetrySink, NoopTelemetry};

    fn small_config() -> AllocatorConfig {
        let mut config = AllocatorConfig::default();
        config.small_pool_size = 1024;
        config.medium_pool_size = 2048;
        config.large_pool_size = 4096;
        config.growth_factor = 1.001;
        config.cooldown_cycles = 3;
        config.checkpoint_freq = 10;
        config
    }

    /// Fills the small tier with `bytes` of used memory in 64-byte requests.
    fn fill_small(pool: &MemoryPool, bytes: u64) {
        let mut guard = pool.lock();

        for _ in 0..bytes / 64 {
            guard.grow(Tier::Small, 64, 1.001).unwrap();
        }
    }

    fn pool() -> MemoryPool {
        MemoryPool::new(Arc::new(HostMemory::new()) as Arc<dyn DeviceMemory>)
    }

    #[test]
    fn critical_pressure_arms_double_strength() {
        let pool = pool();
        let config = small_config();
        let checkpoint = Checkpoint::default();

        // 7168 used bytes in 7456 bytes of blocks.
        fill_small(&pool, 1024);
        let mut guard = pool.lock();
        guard.grow(Tier::Medium, 2048, 1.001).unwrap();
        guard.grow(Tier::Large, 4096, 1.001).unwrap();
        drop(guard);

        assert_eq!(
            checkpoint.tick(&pool, &config, &NoopTelemetry),
            TickDecision::Critical
        );
        assert_eq!(checkpoint.counter(), 20);
        assert_eq!(checkpoint.cooling(), 6);

        assert_eq!(
            checkpoint.tick(&pool, &config, &NoopTelemetry),
            TickDecision::Cooling
        );
        assert_eq!(checkpoint.cooling(), 6);
    }

    #[test]
    fn cooldown_decays_only_below_low_watermark() {
        let pool = pool();
        let config = small_config();
        let checkpoint = Checkpoint::default();
        checkpoint.start_cooldown(2);

        assert_eq!(
            checkpoint.tick(&pool, &config, &NoopTelemetry),
            TickDecision::Decayed
        );
        assert_eq!(
            checkpoint.tick(&pool, &config, &NoopTelemetry),
            TickDecision::Decayed
        );
        assert_eq!(
            checkpoint.tick(&pool, &config, &NoopTelemetry),
            TickDecision::Idle
        );
        assert_eq!(checkpoint.cooling(), 0);
        assert_eq!(checkpoint.ticks(), 3);
    }

    #[test]
    fn tier_above_medium_watermark_is_armed() {
        let pool = pool();
        let config = small_config();
        let checkpoint = Checkpoint::default();

        // 832 of 1040 small bytes is above 0.75 while the whole pool stays below 0.5.
        fill_small(&pool, 832);

        assert_eq!(
            checkpoint.tick(&pool, &config, &NoopTelemetry),
            TickDecision::Idle
        );
        assert!(pool.tier(Tier::Small).is_armed());
        assert!(!pool.tier(Tier::Medium).is_armed());
        assert_eq!(checkpoint.counter(), 10);
    }

    #[test]
    fn tick_reports_pressure_of_every_tier() {
        let pool = pool();
        let config = small_config();
        let checkpoint = Checkpoint::default();
        fill_small(&pool, 512);

        let mut telemetry = MockTelemetrySink::new();
        telemetry
            .expect_pool_pressure()
            .withf(|tier, pressure| *tier == Tier::Small && (*pressure - 0.5).abs() < 1e-9)
            .times(1)
            .return_const(());
        telemetry
            .expect_pool_pressure()
            .withf(|tier, pressure| *tier != Tier::Small && *pressure == 0.0)
            .times(2)
            .return_const(());

        checkpoint.tick(&pool, &config, &telemetry);
    }

    #[cfg_attr(miri, ignore)] // Real threads and sleeps.
    #[test]
    fn thread_ticks_until_dropped() {
        testing::with_watchdog(|| {
            let ticks = Arc::new(AtomicUsize::new(0));

            let thread = CheckpointThread::spawn(Duration::from_millis(1), {
                let ticks = Arc::clone(&ticks);
                move || {
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            });

            let started = Instant::now();
            while ticks.load(Ordering::Relaxed) < 3 {
                assert!(started.elapsed() < Duration::from_secs(5));
                thread::sleep(Duration::from_millis(1));
            }

            drop(thread);

            let after_stop = ticks.load(Ordering::Relaxed);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(ticks.load(Ordering::Relaxed), after_stop);
        });
    }

    #[cfg_attr(miri, ignore)] // Real threads.
    #[test]
    fn drop_does_not_wait_for_long_tick() {
        testing::with_watchdog(|| {
            let started = Instant::now();
            let thread = CheckpointThread::spawn(Duration::from_secs(3600), || {});

            drop(thread);

            assert!(started.elapsed() < Duration::from_secs(60));
        });
    }
}
