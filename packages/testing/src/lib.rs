#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests and benchmarks of the tiered allocator.

use std::sync::{Barrier, mpsc};
use std::thread;
use std::time::Duration;

/// Environment variable that disables the watchdog when set to "1", so that mutation testing
/// can detect mutations that hang.
const MUTATION_TESTING: &str = "MUTATION_TESTING";

/// Runs a test body on a separate thread and fails the test if it does not finish in time.
///
/// Background threads that fail to shut down tend to turn into hung test runs rather than
/// failures. The watchdog turns them into failures instead.
///
/// The limit is 10 seconds, or 60 seconds under Miri.
///
/// # Panics
///
/// Panics if the test body panics or exceeds the limit.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let value = with_watchdog(|| 2 + 2);
/// assert_eq!(value, 4);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var(MUTATION_TESTING).as_deref() == Ok("1") {
        return test_fn();
    }

    let limit = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    let (tx, rx) = mpsc::channel();

    let body = thread::spawn(move || {
        // The receiver is gone if we already timed out.
        drop(tx.send(test_fn()));
    });

    match rx.recv_timeout(limit) {
        Ok(result) => {
            body.join().expect("test thread sent its result, so it cannot have panicked");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded the watchdog limit of {limit:?}");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match body.join() {
            Ok(()) => panic!("test thread exited without a result"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Runs `f` on `threads` threads at once and collects the results in thread order.
///
/// All threads are released together by a barrier, which maximizes overlap between them.
/// Each call receives the index of its thread.
///
/// # Panics
///
/// Re-raises the panic of any thread that panics.
///
/// # Example
///
/// ```rust
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use testing::run_concurrently;
///
/// let counter = AtomicUsize::new(0);
/// let indexes = run_concurrently(4, |i| {
///     counter.fetch_add(1, Ordering::Relaxed);
///     i
/// });
///
/// assert_eq!(indexes, vec![0, 1, 2, 3]);
/// assert_eq!(counter.load(Ordering::Relaxed), 4);
/// ```
pub fn run_concurrently<F, R>(threads: usize, f: F) -> Vec<R>
where
    F: Fn(usize) -> R + Sync,
    R: Send,
{
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        let handles = (0..threads)
            .map(|index| {
                let barrier = &barrier;
                let f = &f;

                s.spawn(move || {
                    barrier.wait();
                    f(index)
                })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(e) => std::panic::resume_unwind(e),
            })
            .collect()
    })
}

/// Returns the distance between `a` and `b`, or zero if it is within `close_enough`.
///
/// Use as `assert_eq!(f64_diff_abs(a, b, 0.0001), 0.0)` to compare floating point values
/// with a tolerance while still seeing the actual difference on failure.
#[must_use]
pub fn f64_diff_abs(a: f64, b: f64, close_enough: f64) -> f64 {
    let diff = (a - b).abs();

    if diff <= close_enough { 0.0 } else { diff }
}
