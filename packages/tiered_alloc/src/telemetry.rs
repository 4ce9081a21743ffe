use std::fmt::{self, Debug, Display};
use std::time::Duration;

use crate::Tier;
use crate::metrics::{
    ALLOCATION_BYTES, ALLOCATION_ERRORS, BATCH_LATENCY_MS, BATCH_SIZE, BATCHES_FAILED,
    BATCHES_SUCCEEDED, BATCHES_TIMED_OUT, LARGE_POOL_PRESSURE_PERMILLE,
    MEDIUM_POOL_PRESSURE_PERMILLE, SMALL_POOL_PRESSURE_PERMILLE,
};

/// How a pipeline batch ended.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum BatchOutcome {
    /// The unit of work completed successfully.
    Success,

    /// The unit of work returned an error.
    Error,

    /// The unit of work did not complete within the pipeline timeout.
    Timeout,
}

impl BatchOutcome {
    /// Lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives observations from allocators and pipelines.
///
/// Observations are pushed in a fire-and-forget manner from hot paths, so implementations
/// must return promptly and never block on I/O. Every method has an empty default body,
/// so a sink only needs to implement what it is interested in.
///
/// `stream` is the name of the pipeline the observation originates from.
#[cfg_attr(test, mockall::automock)]
pub trait TelemetrySink: Debug + Send + Sync + 'static {
    /// A pipeline requested an allocation of `bytes`.
    fn allocation(&self, _stream: &str, _bytes: u64) {}

    /// An allocation attempt by a pipeline failed. Reported once per call, whether or not
    /// a retry with a smaller batch then succeeds.
    fn allocation_error(&self, _stream: &str) {}

    /// A batch finished (in any manner) after `latency`.
    fn batch_latency(&self, _stream: &str, _latency: Duration) {}

    /// A batch finished with the given outcome.
    fn batch_outcome(&self, _stream: &str, _outcome: BatchOutcome) {}

    /// The batch size of a pipeline was set to `batch_size`.
    fn batch_size(&self, _stream: &str, _batch_size: u32) {}

    /// Periodic sample of the pressure of one tier, as a fraction of its capacity.
    fn pool_pressure(&self, _tier: Tier, _pressure: f64) {}
}

/// Publishes observations as [`nm`] events.
///
/// Events are aggregated across streams; use the stream name in your own sink if you need
/// a per-stream breakdown. Collect the events with `nm::Report::collect()`.
///
/// This is the default sink of allocators and pipelines.
#[derive(Clone, Copy, Debug, Default)]
pub struct NmTelemetry;

impl TelemetrySink for NmTelemetry {
    fn allocation(&self, _stream: &str, bytes: u64) {
        ALLOCATION_BYTES.with(|e| e.observe(bytes));
    }

    fn allocation_error(&self, _stream: &str) {
        ALLOCATION_ERRORS.with(|e| e.observe_once());
    }

    fn batch_latency(&self, _stream: &str, latency: Duration) {
        BATCH_LATENCY_MS.with(|e| e.observe_millis(latency));
    }

    fn batch_outcome(&self, _stream: &str, outcome: BatchOutcome) {
        let event = match outcome {
            BatchOutcome::Success => &BATCHES_SUCCEEDED,
            BatchOutcome::Error => &BATCHES_FAILED,
            BatchOutcome::Timeout => &BATCHES_TIMED_OUT,
        };

        event.with(|e| e.observe_once());
    }

    fn batch_size(&self, _stream: &str, batch_size: u32) {
        BATCH_SIZE.with(|e| e.observe(batch_size));
    }

    #[expect(
        clippy::cast_possible_truncation,
        reason = "pressure is a small fraction, the permille value fits comfortably"
    )]
    fn pool_pressure(&self, tier: Tier, pressure: f64) {
        let permille = (pressure * 1000.0).round() as i64;

        let event = match tier {
            Tier::Small => &SMALL_POOL_PRESSURE_PERMILLE,
            Tier::Medium => &MEDIUM_POOL_PRESSURE_PERMILLE,
            Tier::Large => &LARGE_POOL_PRESSURE_PERMILLE,
        };

        event.with(|e| e.observe(permille));
    }
}

/// Discards every observation.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {}
