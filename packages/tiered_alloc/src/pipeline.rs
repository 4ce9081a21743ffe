use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use scopeguard::guard;
use tracing::{debug, warn};

use crate::batch_tuner::{self, BatchLimits, WindowSignals};
use crate::{
    AllocError, Allocator, BatchOutcome, BoxError, ExecError, Handle, PipelineBuilder,
    TelemetrySink,
};

/// Lifecycle phase of a [`Pipeline`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum PipelineState {
    /// The batch size is not adjusted yet.
    WarmingUp,

    /// The batch size is adjusted at the end of every profiling window. A pipeline never
    /// leaves this state.
    Steady,
}

/// Point-in-time view of a [`Pipeline`], as returned by [`Pipeline::stats()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct PipelineStats {
    /// The batch size the next call will use.
    pub batch_size: u32,

    /// Number of [`Pipeline::execute()`] calls started so far.
    pub total_batches: u64,

    /// The lifecycle phase.
    pub state: PipelineState,

    /// Mean latency of the batches completed successfully in the current profiling window.
    pub window_avg_latency: Option<Duration>,

    /// Batches completed successfully in the current profiling window.
    pub window_completed: u64,

    /// Batches that timed out in the current profiling window.
    pub window_timed_out: u64,

    /// Batches whose unit of work failed in the current profiling window.
    pub window_errored: u64,
}

/// Runs units of work against memory from an [`Allocator`], adapting how much memory each
/// unit of work gets from observed latency and allocator pressure.
///
/// Each call to [`execute()`][Self::execute] acquires a block sized for the current batch
/// size, runs the unit of work with it under a timeout and releases the block again.
///
/// After a warm-up period, the pipeline re-evaluates its batch size at the end of every
/// profiling window: it grows while batches are fast and the allocator is roomy and shrinks
/// when batches are slow or the allocator is under pressure. When an allocation fails, the
/// pipeline falls back to a smaller batch before giving up.
///
/// The pipeline may be shared between tasks. One pipeline corresponds to one logical stream
/// of work and its name identifies that stream in telemetry.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use tiered_alloc::{Allocator, BoxError, Pipeline};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let allocator = Arc::new(Allocator::new());
/// let pipeline = Pipeline::builder(allocator).name("prompts").build();
///
/// let block_size = pipeline
///     .execute(1000, |handle| async move { Ok::<_, BoxError>(handle.block_size()) })
///     .await
///     .unwrap();
///
/// // 1000 bytes plus 10% padding, times the initial batch size of 4.
/// assert!(block_size >= 4400);
/// # }
/// ```
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    allocator: Arc<Allocator>,
    telemetry: Arc<dyn TelemetrySink>,

    limits: BatchLimits,
    warmup_steps: u64,
    profiling_window: u64,
    padding: f64,

    batch_size: AtomicU32,
    calls: AtomicU64,

    // Profiling window counters, reset by every adjustment.
    latency_micros: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    errored: AtomicU64,
}

/// Settings collected by [`PipelineBuilder`].
#[derive(Debug)]
pub(crate) struct PipelineSettings {
    pub(crate) name: String,
    pub(crate) allocator: Arc<Allocator>,
    pub(crate) telemetry: Arc<dyn TelemetrySink>,
    pub(crate) limits: BatchLimits,
    pub(crate) initial_batch: u32,
    pub(crate) warmup_steps: u64,
    pub(crate) profiling_window: u64,
    pub(crate) padding: f64,
}

impl Pipeline {
    /// Creates a pipeline with default settings that draws memory from `allocator`.
    #[must_use]
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self::builder(allocator).build()
    }

    /// Starts building a pipeline that draws memory from `allocator`.
    pub fn builder(allocator: Arc<Allocator>) -> PipelineBuilder {
        PipelineBuilder::new(allocator)
    }

    pub(crate) fn from_settings(settings: PipelineSettings) -> Self {
        settings
            .telemetry
            .batch_size(&settings.name, settings.initial_batch);

        Self {
            name: settings.name,
            allocator: settings.allocator,
            telemetry: settings.telemetry,
            limits: settings.limits,
            warmup_steps: settings.warmup_steps,
            profiling_window: settings.profiling_window,
            padding: settings.padding,
            batch_size: AtomicU32::new(settings.initial_batch),
            calls: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            errored: AtomicU64::new(0),
        }
    }

    /// The name of the stream this pipeline serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The allocator this pipeline draws memory from.
    #[must_use]
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// The batch size the next call will use.
    #[must_use]
    pub fn batch_size(&self) -> u32 {
        self.batch_size.load(Ordering::Relaxed)
    }

    /// The lifecycle phase.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        if self.calls.load(Ordering::Relaxed) > self.warmup_steps {
            PipelineState::Steady
        } else {
            PipelineState::WarmingUp
        }
    }

    /// Samples the state of the pipeline.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let latency_micros = self.latency_micros.load(Ordering::Relaxed);

        PipelineStats {
            batch_size: self.batch_size(),
            total_batches: self.calls.load(Ordering::Relaxed),
            state: self.state(),
            window_avg_latency: latency_micros
                .checked_div(completed)
                .map(Duration::from_micros),
            window_completed: completed,
            window_timed_out: self.timed_out.load(Ordering::Relaxed),
            window_errored: self.errored.load(Ordering::Relaxed),
        }
    }

    /// Acquires a block for one batch of `request_size`-byte items, runs `work` with it and
    /// releases the block.
    ///
    /// The block is sized for the current batch size plus padding. It is released exactly
    /// once whatever happens: when `work` succeeds, fails or times out, and when the returned
    /// future is dropped before completion.
    ///
    /// Must be polled within a Tokio runtime with the time driver enabled.
    ///
    /// # Errors
    ///
    /// * [`ExecError::AllocationFailed`] if no block could be acquired, even for a smaller
    ///   batch. The batch size is reset to the minimum.
    /// * [`ExecError::WorkFailed`] if `work` returns an error.
    /// * [`ExecError::Timeout`] if `work` does not complete within the pipeline timeout.
    pub async fn execute<F, Fut, T, E>(&self, request_size: u64, work: F) -> Result<T, ExecError>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let call = self.calls.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        if self.is_adjustment_point(call) {
            self.adjust_batch_size();
        }

        let handle = self.acquire_with_fallback(request_size)?;

        // Released on every exit path, including cancellation of this future.
        let handle = guard(handle, |handle| self.allocator.release(handle));

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.limits.timeout, work(*handle)).await;
        let latency = started.elapsed();

        self.telemetry.batch_latency(&self.name, latency);

        match outcome {
            Ok(Ok(output)) => {
                self.latency_micros.fetch_add(
                    u64::try_from(latency.as_micros()).unwrap_or(u64::MAX),
                    Ordering::Relaxed,
                );
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.telemetry
                    .batch_outcome(&self.name, BatchOutcome::Success);

                Ok(output)
            }
            Ok(Err(e)) => {
                self.errored.fetch_add(1, Ordering::Relaxed);
                self.telemetry.batch_outcome(&self.name, BatchOutcome::Error);

                Err(ExecError::WorkFailed(e.into()))
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                self.telemetry
                    .batch_outcome(&self.name, BatchOutcome::Timeout);

                Err(ExecError::Timeout(self.limits.timeout))
            }
        }
    }

    /// Call numbers up to `warmup_steps` are warm-up. After that, every `profiling_window`-th
    /// call adjusts the batch size before it runs.
    fn is_adjustment_point(&self, call: u64) -> bool {
        call > self.warmup_steps
            && call
                .wrapping_sub(self.warmup_steps)
                .is_multiple_of(self.profiling_window)
    }

    #[expect(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        reason = "padding is a small non-negative fraction and the result is range-checked"
    )]
    fn alloc_size(&self, request_size: u64, batch: u32) -> u64 {
        let padding = (request_size as f64 * self.padding).floor();
        let padding = if padding < u64::MAX as f64 {
            padding as u64
        } else {
            u64::MAX
        };

        request_size
            .saturating_add(padding)
            .saturating_mul(u64::from(batch))
    }

    #[expect(
        clippy::integer_division,
        reason = "batch sizes are whole numbers, truncation is intended"
    )]
    fn acquire_with_fallback(&self, request_size: u64) -> Result<Handle, ExecError> {
        let batch = self.batch_size();
        let size = self.alloc_size(request_size, batch);

        let mut error = match self.allocator.acquire(size) {
            Ok(handle) => {
                self.telemetry.allocation(&self.name, size);
                return Ok(handle);
            }
            // Nothing a smaller batch could fix.
            Err(AllocError::InvalidSize) => {
                return Err(ExecError::AllocationFailed(AllocError::InvalidSize));
            }
            Err(e) => e,
        };

        self.telemetry.allocation_error(&self.name);

        if batch > self.limits.min_batch.saturating_mul(2) {
            let halved = batch / 2;
            self.set_batch_size(halved);

            warn!(
                stream = self.name,
                from = batch,
                to = halved,
                error = %error,
                "allocation failed, retrying with half the batch"
            );

            let size = self.alloc_size(request_size, halved);

            match self.allocator.acquire(size) {
                Ok(handle) => {
                    self.telemetry.allocation(&self.name, size);
                    return Ok(handle);
                }
                Err(e) => error = e,
            }
        }

        self.set_batch_size(self.limits.min_batch);

        warn!(
            stream = self.name,
            min_batch = self.limits.min_batch,
            error = %error,
            "allocation failed, batch size reset to minimum"
        );

        Err(ExecError::AllocationFailed(error))
    }

    fn set_batch_size(&self, batch: u32) {
        self.batch_size.store(batch, Ordering::Relaxed);
        self.telemetry.batch_size(&self.name, batch);
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "latency averages do not need integer precision"
    )]
    fn adjust_batch_size(&self) {
        let latency_micros = self.latency_micros.swap(0, Ordering::Relaxed);
        let completed = self.completed.swap(0, Ordering::Relaxed);
        let timed_out = self.timed_out.swap(0, Ordering::Relaxed);
        let errored = self.errored.swap(0, Ordering::Relaxed);

        let latency_secs = if completed > 0 {
            latency_micros as f64 / completed as f64 / 1_000_000.0
        } else if timed_out > 0 {
            f64::INFINITY
        } else {
            // No latency signal at all. Neutral, so only pressure decides.
            self.limits.timeout.as_secs_f64()
        };

        let allocator = self.allocator.metrics();

        let signals = WindowSignals {
            latency_secs,
            pressure: allocator.mean_pressure(),
            high_watermark: allocator.high_watermark,
            critical_watermark: allocator.critical_watermark,
        };

        let current = self.batch_size();
        let next = batch_tuner::adjust(current, self.limits, signals);
        self.set_batch_size(next);

        debug!(
            stream = self.name,
            from = current,
            to = next,
            latency_ms = latency_secs * 1000.0,
            pressure = signals.pressure,
            completed,
            timed_out,
            errored,
            "adjusted batch size"
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io;

    use mockall::predicate::{always, eq};
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{DeviceMemory, HostMemory, MockTelemetrySink};

    assert_impl_all!(Pipeline: Send, Sync);

    fn allocator() -> Arc<Allocator> {
        Arc::new(Allocator::builder().adaptive_checkpointing(false).build())
    }

    #[test]
    fn alloc_size_pads_and_multiplies() {
        let pipeline = Pipeline::new(allocator());

        assert_eq!(pipeline.alloc_size(1000, 4), 4400);
        assert_eq!(pipeline.alloc_size(9, 2), 18);
        assert_eq!(pipeline.alloc_size(u64::MAX, 2), u64::MAX);
    }

    #[test]
    fn adjustment_points_follow_warmup_and_window() {
        let pipeline = Pipeline::builder(allocator())
            .warmup_steps(100)
            .profiling_window(1000)
            .build();

        assert!(!pipeline.is_adjustment_point(100));
        assert!(!pipeline.is_adjustment_point(1000));
        assert!(!pipeline.is_adjustment_point(1099));
        assert!(pipeline.is_adjustment_point(1100));
        assert!(!pipeline.is_adjustment_point(1101));
        assert!(pipeline.is_adjustment_point(2100));
    }

    #[tokio::test]
    async fn success_releases_block() {
        let allocator = allocator();
        let pipeline = Pipeline::new(Arc::clone(&allocator));

        let aligned = pipeline
            .execute(100, |handle| async move { Ok::<_, io::Error>(handle.aligned_size()) })
            .await
            .unwrap();

        assert_eq!(aligned, 448);
        assert_eq!(allocator.metrics().total_used_bytes, 0);

        let stats = pipeline.stats();
        assert_eq!(stats.window_completed, 1);
        assert_eq!(stats.total_batches, 1);
        assert_eq!(stats.state, PipelineState::WarmingUp);
    }

    #[tokio::test]
    async fn work_failure_releases_block() {
        let allocator = allocator();
        let pipeline = Pipeline::new(Arc::clone(&allocator));

        let result = pipeline
            .execute(100, |_| async { Err::<(), _>(io::Error::other("bad batch")) })
            .await;

        match result {
            Err(ExecError::WorkFailed(inner)) => assert_eq!(inner.to_string(), "bad batch"),
            other => panic!("expected WorkFailed, got {other:?}"),
        }
        assert_eq!(allocator.metrics().total_used_bytes, 0);
        assert_eq!(pipeline.stats().window_errored, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_block() {
        let allocator = allocator();
        let pipeline = Pipeline::builder(Arc::clone(&allocator))
            .timeout(Duration::from_millis(10))
            .build();

        let result = pipeline
            .execute(100, |_| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<_, io::Error>(())
            })
            .await;

        assert!(matches!(result, Err(ExecError::Timeout(t)) if t == Duration::from_millis(10)));
        assert_eq!(allocator.metrics().total_used_bytes, 0);
        assert_eq!(pipeline.stats().window_timed_out, 1);
    }

    #[tokio::test]
    async fn cancelled_call_releases_block() {
        let allocator = allocator();
        let pipeline = Pipeline::new(Arc::clone(&allocator));

        {
            let call = pipeline.execute(100, |_| std::future::pending::<Result<(), io::Error>>());
            let mut call = Box::pin(call);

            // Poll once so the block is acquired, then abandon the call.
            assert!(futures::poll!(call.as_mut()).is_pending());
            assert!(allocator.metrics().total_used_bytes > 0);
        }

        assert_eq!(allocator.metrics().total_used_bytes, 0);
    }

    #[tokio::test]
    async fn zero_request_is_not_retried() {
        let pipeline = Pipeline::builder(allocator()).initial_batch(16).build();

        let result = pipeline
            .execute(0, |_| async { Ok::<_, io::Error>(()) })
            .await;

        assert!(matches!(
            result,
            Err(ExecError::AllocationFailed(AllocError::InvalidSize))
        ));
        assert_eq!(pipeline.batch_size(), 16);
    }

    #[tokio::test]
    async fn fallback_succeeds_at_half_batch() {
        // 16 items of 550 bytes need 8800 bytes even without growth. 8 items fit with growth.
        let device = Arc::new(HostMemory::with_budget(8_000));
        let allocator = Arc::new(
            Allocator::builder()
                .device(device as Arc<dyn DeviceMemory>)
                .adaptive_checkpointing(false)
                .build(),
        );

        let pipeline = Pipeline::builder(allocator).initial_batch(16).build();

        let result = pipeline
            .execute(500, |handle| async move { Ok::<_, io::Error>(handle.aligned_size()) })
            .await
            .unwrap();

        assert_eq!(result, 4400);
        assert_eq!(pipeline.batch_size(), 8);
    }

    #[tokio::test]
    async fn telemetry_sees_batch_lifecycle() {
        let mut telemetry = MockTelemetrySink::new();
        telemetry
            .expect_batch_size()
            .with(eq("s"), eq(4))
            .times(1)
            .return_const(());
        telemetry
            .expect_allocation()
            .with(eq("s"), eq(4400))
            .times(1)
            .return_const(());
        telemetry
            .expect_batch_latency()
            .with(eq("s"), always())
            .times(1)
            .return_const(());
        telemetry
            .expect_batch_outcome()
            .with(eq("s"), eq(BatchOutcome::Success))
            .times(1)
            .return_const(());

        let pipeline = Pipeline::builder(allocator())
            .name("s")
            .telemetry(Arc::new(telemetry))
            .build();

        pipeline
            .execute(1000, |_| async { Ok::<_, io::Error>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn window_without_completions_uses_timeouts_as_signal() {
        let pipeline = Pipeline::builder(allocator())
            .initial_batch(16)
            .warmup_steps(0)
            .profiling_window(2)
            .timeout(Duration::from_millis(1))
            .build();

        // Call 1 times out; call 2 is an adjustment point and sees infinite latency.
        let _ = pipeline
            .execute(10, |_| std::future::pending::<Result<(), io::Error>>())
            .await;
        pipeline
            .execute(10, |_| async { Ok::<_, io::Error>(()) })
            .await
            .unwrap();

        assert_eq!(pipeline.batch_size(), 12);
        assert_eq!(pipeline.stats().window_timed_out, 0);
        assert_eq!(pipeline.stats().window_completed, 1);
    }
}
