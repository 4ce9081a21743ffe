//! Tiered pool allocator of device memory with pressure-driven reclamation, and a pipeline
//! that adapts its batch size to latency and memory pressure.
//!
//! The [`Allocator`] lends out blocks of memory obtained from a [`DeviceMemory`]
//! implementation. Requests are served from one of three size tiers, each of which keeps the
//! blocks it has obtained and reuses them after they are released. When the pool comes under
//! pressure, free blocks are handed back to the device. A background checkpoint loop samples
//! pressure and arms individual tiers for compaction before they grow further.
//!
//! The [`Pipeline`] runs units of work against blocks from an allocator. It sizes each block
//! for a batch of items and, after a warm-up period, tunes the batch size from what it
//! observes over each profiling window.
//!
//! The allocator configuration lives in a [`ConfigRegistry`] and can be replaced at runtime,
//! from code or from JSON or TOML documents.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use tiered_alloc::{Allocator, BoxError, Pipeline, Tier};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let allocator = Arc::new(Allocator::new());
//!
//! // Direct use of the allocator.
//! let handle = allocator.acquire(1000).unwrap();
//! assert_eq!(handle.tier(), Tier::Small);
//! assert_eq!(handle.aligned_size(), 1008);
//! allocator.release(handle);
//!
//! // Batched work through a pipeline.
//! let pipeline = Pipeline::new(Arc::clone(&allocator));
//!
//! let size = pipeline
//!     .execute(1000, |handle| async move { Ok::<_, BoxError>(handle.aligned_size()) })
//!     .await
//!     .unwrap();
//! assert_eq!(size, 4400);
//! # }
//! ```
//!
//! # Configuration
//!
//! ```rust
//! use tiered_alloc::Allocator;
//!
//! let allocator = Allocator::builder().adaptive_checkpointing(false).build();
//!
//! allocator
//!     .config_registry()
//!     .load_json(r#"{ "version": "v2", "growth_factor": 1.5 }"#)
//!     .unwrap();
//!
//! assert_eq!(allocator.config().growth_factor, 1.5);
//! ```
//!
//! # Observability
//!
//! The allocator and the pipeline log through `tracing` and report measurements to a
//! [`TelemetrySink`]. The default sink, [`NmTelemetry`], publishes them as `nm` events.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod allocator;
mod allocator_builder;
mod batch_tuner;
mod checkpoint;
mod config;
mod config_registry;
mod device;
mod error;
mod handle;
mod memory_pool;
mod metrics;
mod pipeline;
mod pipeline_builder;
mod size_cache;
mod stats;
mod telemetry;
mod tier;

pub use allocator::Allocator;
pub use allocator_builder::AllocatorBuilder;
pub use config::{AllocatorConfig, ConfigVersion};
pub use config_registry::ConfigRegistry;
pub use device::{DeviceHandle, DeviceMemory, HostMemory};
#[cfg(test)]
pub(crate) use device::MockDeviceMemory;
pub use error::{AllocError, BoxError, ConfigError, DeviceError, ExecError};
pub use handle::Handle;
pub use pipeline::{Pipeline, PipelineState, PipelineStats};
pub use pipeline_builder::PipelineBuilder;
pub use stats::{AllocatorStats, TierStats};
#[cfg(test)]
pub(crate) use telemetry::MockTelemetrySink;
pub use telemetry::{BatchOutcome, NmTelemetry, NoopTelemetry, TelemetrySink};
pub use tier::{ALIGNMENT, MEDIUM_LIMIT, SMALL_LIMIT, Tier};
