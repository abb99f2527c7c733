//! Calibrated busy-wait used by test partitions to simulate work.

/// Loop iterations that take roughly one millisecond on the reference board.
pub const ITERATIONS_PER_MS: u64 = 15000;

/// Spin for `iterations` loop turns.
#[inline(never)]
pub fn wait_loop(iterations: u64) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}

/// Spin for about `ms` milliseconds. Returns `ms`.
pub fn sleep_active_wait(ms: u32) -> u32 {
    wait_loop(ms as u64 * ITERATIONS_PER_MS);
    ms
}
