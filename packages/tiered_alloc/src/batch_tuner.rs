//! The batch-size adjustment rule of a [`Pipeline`][crate::Pipeline], as a pure function.

use std::time::Duration;

/// Bounds and latency target of a pipeline.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BatchLimits {
    pub(crate) min_batch: u32,
    pub(crate) max_batch: u32,
    pub(crate) timeout: Duration,
}

/// What a profiling window observed.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WindowSignals {
    /// Mean latency of completed batches, in seconds. Infinite if nothing completed and
    /// something timed out.
    pub(crate) latency_secs: f64,

    /// Mean pressure of the three allocator tiers.
    pub(crate) pressure: f64,

    pub(crate) high_watermark: f64,
    pub(crate) critical_watermark: f64,
}

/// Returns the batch size to use for the next profiling window.
///
/// Three regimes, checked in order:
///
/// 1. Fast and roomy (latency under half the timeout, pressure under 60% of the high
///    watermark): grow by 4, or by 2 when pressure is above 40% of the high watermark.
/// 2. Slow or cramped (latency over 1.5x the timeout, pressure over 90% of the critical
///    watermark): shrink by a quarter when severe (latency over 2x the timeout or pressure
///    over the critical watermark), otherwise by an eighth, and always by at least 1.
/// 3. Otherwise nudge by 1: up when latency is under 0.8x the timeout and pressure under
///    80% of the high watermark, down when latency is over 1.2x the timeout or pressure is
///    over the high watermark.
///
/// The result is clamped to the limits.
#[expect(
    clippy::integer_division,
    reason = "batch sizes are whole numbers, truncation is intended"
)]
pub(crate) fn adjust(batch: u32, limits: BatchLimits, signals: WindowSignals) -> u32 {
    let timeout = limits.timeout.as_secs_f64();
    let latency = signals.latency_secs;
    let pressure = signals.pressure;
    let high = signals.high_watermark;
    let critical = signals.critical_watermark;

    let target = if latency < timeout * 0.5 && pressure < high * 0.6 && batch < limits.max_batch
    {
        let step = if pressure > high * 0.4 { 2 } else { 4 };
        batch.saturating_add(step)
    } else if latency > timeout * 1.5 || pressure > critical * 0.9 {
        let severe = latency > timeout * 2.0 || pressure > critical;
        let reduction = if severe { batch / 4 } else { batch / 8 };
        batch.saturating_sub(reduction.max(1))
    } else if latency < timeout * 0.8 && pressure < high * 0.8 {
        batch.saturating_add(1)
    } else if latency > timeout * 1.2 || pressure > high {
        batch.saturating_sub(1)
    } else {
        batch
    };

    target.clamp(limits.min_batch, limits.max_batch)
}
