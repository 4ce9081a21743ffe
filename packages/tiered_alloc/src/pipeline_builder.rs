use std::sync::Arc;
use std::time::Duration;

use crate::batch_tuner::BatchLimits;
use crate::pipeline::PipelineSettings;
use crate::{Allocator, NmTelemetry, Pipeline, TelemetrySink};

const DEFAULT_NAME: &str = "default";
const DEFAULT_MIN_BATCH: u32 = 4;
const DEFAULT_MAX_BATCH: u32 = 32;
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(50);
const DEFAULT_WARMUP_STEPS: u64 = 100;
const DEFAULT_PROFILING_WINDOW: u64 = 1000;
const DEFAULT_PADDING: f64 = 0.1;

/// Builder for creating an instance of [`Pipeline`].
///
/// The allocator is mandatory and given to [`Pipeline::builder()`]. Every other setting is
/// optional:
///
/// | Setting | Default |
/// |---------|---------|
/// | name | `"default"` |
/// | batch size bounds | 4 ..= 32 |
/// | initial batch size | the minimum |
/// | timeout | 50 ms |
/// | warm-up | 100 calls |
/// | profiling window | 1000 calls |
/// | padding | 10% of the request size |
/// | telemetry | [`NmTelemetry`] |
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use tiered_alloc::{Allocator, Pipeline};
///
/// let allocator = Arc::new(Allocator::new());
///
/// let pipeline = Pipeline::builder(allocator)
///     .name("embeddings")
///     .batch_bounds(8, 64)
///     .timeout(Duration::from_millis(200))
///     .build();
///
/// assert_eq!(pipeline.batch_size(), 8);
/// ```
#[derive(Debug)]
#[must_use]
pub struct PipelineBuilder {
    allocator: Arc<Allocator>,
    name: String,
    min_batch: u32,
    max_batch: u32,
    initial_batch: Option<u32>,
    timeout: Duration,
    warmup_steps: u64,
    profiling_window: u64,
    padding: f64,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl PipelineBuilder {
    pub(crate) fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            allocator,
            name: DEFAULT_NAME.to_owned(),
            min_batch: DEFAULT_MIN_BATCH,
            max_batch: DEFAULT_MAX_BATCH,
            initial_batch: None,
            timeout: DEFAULT_TIMEOUT,
            warmup_steps: DEFAULT_WARMUP_STEPS,
            profiling_window: DEFAULT_PROFILING_WINDOW,
            padding: DEFAULT_PADDING,
            telemetry: None,
        }
    }

    /// Sets the name of the stream the pipeline serves, used to label telemetry.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the inclusive bounds of the batch size.
    ///
    /// # Panics
    ///
    /// Panics if `min` is zero or greater than `max`.
    pub fn batch_bounds(mut self, min: u32, max: u32) -> Self {
        assert!(min > 0, "minimum batch size must be non-zero");
        assert!(
            min <= max,
            "minimum batch size {min} exceeds maximum batch size {max}"
        );

        self.min_batch = min;
        self.max_batch = max;
        self
    }

    /// Sets the batch size of the first calls. Clamped into the batch size bounds when the
    /// pipeline is built.
    pub fn initial_batch(mut self, batch: u32) -> Self {
        self.initial_batch = Some(batch);
        self
    }

    /// Sets how long a unit of work may run before the call fails with
    /// [`ExecError::Timeout`][crate::ExecError::Timeout]. Also the latency target that batch
    /// size adjustment steers by.
    ///
    /// # Panics
    ///
    /// Panics if `timeout` is zero.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "pipeline timeout must be non-zero");
        self.timeout = timeout;
        self
    }

    /// Sets the number of calls before the batch size is first adjusted.
    pub fn warmup_steps(mut self, steps: u64) -> Self {
        self.warmup_steps = steps;
        self
    }

    /// Sets the number of calls between batch size adjustments.
    ///
    /// # Panics
    ///
    /// Panics if `calls` is zero.
    pub fn profiling_window(mut self, calls: u64) -> Self {
        assert!(calls > 0, "profiling window must be non-zero");
        self.profiling_window = calls;
        self
    }

    /// Sets the extra space requested per item, as a fraction of the request size.
    ///
    /// # Panics
    ///
    /// Panics if `fraction` is negative or not finite.
    pub fn padding(mut self, fraction: f64) -> Self {
        assert!(
            fraction.is_finite() && fraction >= 0.0,
            "padding must be a finite non-negative fraction"
        );
        self.padding = fraction;
        self
    }

    /// Sets the sink that receives the pipeline's batch and allocation telemetry.
    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the pipeline.
    #[must_use]
    pub fn build(self) -> Pipeline {
        let initial_batch = self
            .initial_batch
            .unwrap_or(self.min_batch)
            .clamp(self.min_batch, self.max_batch);

        Pipeline::from_settings(PipelineSettings {
            name: self.name,
            allocator: self.allocator,
            telemetry: self.telemetry.unwrap_or_else(|| Arc::new(NmTelemetry)),
            limits: BatchLimits {
                min_batch: self.min_batch,
                max_batch: self.max_batch,
                timeout: self.timeout,
            },
            initial_batch,
            warmup_steps: self.warmup_steps,
            profiling_window: self.profiling_window,
            padding: self.padding,
        })
    }
}
