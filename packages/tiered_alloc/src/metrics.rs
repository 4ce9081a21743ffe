//! Metrics published by [`NmTelemetry`][crate::NmTelemetry].
//!
//! Events are per-thread instances, merged by name when a report is collected.

use nm::{Event, Magnitude};

/// Allocation sizes in bytes, powers of four from 64 bytes to 1 GiB.
const ALLOCATION_BYTES_BUCKETS: &[Magnitude] = &[
    64,
    256,
    1024,
    4096,
    16_384,
    65_536,
    262_144,
    1_048_576,
    4_194_304,
    16_777_216,
    67_108_864,
    268_435_456,
    1_073_741_824,
];

/// Batch latency in milliseconds. The default pipeline timeout is 50 ms, so resolution is
/// concentrated around it.
const BATCH_LATENCY_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 35, 50, 75, 100, 250, 1000];

/// Batch sizes as set by the pipeline after fallback or adjustment.
const BATCH_SIZE_BUCKETS: &[Magnitude] = &[1, 2, 4, 8, 12, 16, 24, 32, 64, 128];

/// Pool pressure in thousandths, with extra resolution above the default high watermark.
const PRESSURE_PERMILLE_BUCKETS: &[Magnitude] =
    &[0, 100, 250, 500, 750, 800, 850, 900, 950, 975, 1000];

thread_local! {
    pub(crate) static ALLOCATION_BYTES: Event = Event::builder()
        .name("tiered_alloc_allocation_bytes")
        .histogram(ALLOCATION_BYTES_BUCKETS)
        .build();

    pub(crate) static ALLOCATION_ERRORS: Event = Event::builder()
        .name("tiered_alloc_allocation_errors")
        .build();

    pub(crate) static BATCH_LATENCY_MS: Event = Event::builder()
        .name("tiered_alloc_batch_latency_ms")
        .histogram(BATCH_LATENCY_MS_BUCKETS)
        .build();

    pub(crate) static BATCH_SIZE: Event = Event::builder()
        .name("tiered_alloc_batch_size")
        .histogram(BATCH_SIZE_BUCKETS)
        .build();

    pub(crate) static BATCHES_SUCCEEDED: Event = Event::builder()
        .name("tiered_alloc_batches_succeeded")
        .build();

    pub(crate) static BATCHES_FAILED: Event = Event::builder()
        .name("tiered_alloc_batches_failed")
        .build();

    pub(crate) static BATCHES_TIMED_OUT: Event = Event::builder()
        .name("tiered_alloc_batches_timed_out")
        .build();

    pub(crate) static SMALL_POOL_PRESSURE_PERMILLE: Event = Event::builder()
        .name("tiered_alloc_small_pool_pressure_permille")
        .histogram(PRESSURE_PERMILLE_BUCKETS)
        .build();

    pub(crate) static MEDIUM_POOL_PRESSURE_PERMILLE: Event = Event::builder()
        .name("tiered_alloc_medium_pool_pressure_permille")
        .histogram(PRESSURE_PERMILLE_BUCKETS)
        .build();

    pub(crate) static LARGE_POOL_PRESSURE_PERMILLE: Event = Event::builder()
        .name("tiered_alloc_large_pool_pressure_permille")
        .histogram(PRESSURE_PERMILLE_BUCKETS)
        .build();
}
