//! Runs a stream of simulated batches through a pipeline and prints how the batch size and
//! the allocator evolve, followed by the collected metrics.

use std::sync::Arc;
use std::time::Duration;

use tiered_alloc::{Allocator, BoxError, Pipeline, Tier};

const CONFIG: &str = r#"
version = "v2"
small_pool_size = 262144
growth_factor = 1.25
high_watermark = 0.80
critical_watermark = 0.90
"#;

#[tokio::main]
async fn main() {
    let allocator = Arc::new(Allocator::new());
    allocator
        .config_registry()
        .load_toml(CONFIG)
        .expect("example configuration is valid");

    let pipeline = Pipeline::builder(Arc::clone(&allocator))
        .name("example")
        .warmup_steps(50)
        .profiling_window(100)
        .timeout(Duration::from_millis(20))
        .build();

    for call in 1..=1000_u64 {
        // Work gets slower as batches get larger.
        let result = pipeline
            .execute(2_000, |handle| async move {
                let micros = handle.aligned_size() / 50;
                tokio::time::sleep(Duration::from_micros(micros)).await;
                Ok::<_, BoxError>(())
            })
            .await;

        if let Err(e) = result {
            println!("call {call}: {e}");
        }

        if call % 100 == 0 {
            let stats = pipeline.stats();
            println!(
                "call {call}: batch size {}, state {:?}, window latency {:?}",
                stats.batch_size, stats.state, stats.window_avg_latency
            );
        }
    }

    let stats = allocator.metrics();
    for tier in Tier::ALL {
        let tier_stats = stats.tier(tier);
        println!(
            "{tier}: {} blocks ({} free), {} of {} bytes used, pressure {:.3}",
            tier_stats.blocks,
            tier_stats.free_blocks,
            tier_stats.used_bytes,
            tier_stats.total_bytes,
            tier_stats.pressure
        );
    }

    allocator.reclaim();

    println!();
    println!("{}", nm::Report::collect());
}
