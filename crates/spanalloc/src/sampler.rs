//! Allocation sampling.
//!
//! A byte countdown picks allocations for profiling at a configurable
//! mean interval. Sampled allocations are promoted to dedicated spans so
//! their exact requested size survives for reporting, and a slice of
//! them can additionally be guarded with an inaccessible trailing page
//! that turns overruns into faults.
//!
//! The countdown is per thread and jittered, so two threads with the
//! same allocation pattern do not sample the same objects. Rates are
//! process-wide atomics; the `Scoped*` guards save and restore them for
//! tests and targeted profiling.

use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Mean bytes between samples by default.
const DEFAULT_INTERVAL: usize = 2 << 20;

/// Mean bytes between sampled allocations. 0 samples nothing, 1 samples
/// everything.
static SAMPLE_INTERVAL: AtomicUsize = AtomicUsize::new(DEFAULT_INTERVAL);

/// Sampled allocations between guarded ones; negative disables guarding.
static GUARDED_RATE: AtomicI64 = AtomicI64::new(-1);

static SAMPLED_COUNT: AtomicU64 = AtomicU64::new(0);

static GUARD_COUNTDOWN: AtomicI64 = AtomicI64::new(0);

thread_local! {
    static COUNTDOWN: Cell<usize> = const { Cell::new(0) };
    static RNG: Cell<u64> = const { Cell::new(0) };
}

#[inline]
fn next_random() -> u64 {
    RNG.with(|rng| {
        let mut x = rng.get();
        if x == 0 {
            // Seed from the slot's own address, distinct per thread.
            x = (rng as *const Cell<u64> as u64) | 1;
        }
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        rng.set(x);
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    })
}

/// Draws the next countdown: uniform in `[1, 2 * interval)`, mean
/// `interval`.
#[inline]
fn draw_countdown(interval: usize) -> usize {
    #[allow(clippy::cast_possible_truncation)]
    let jitter = (next_random() % (2 * interval as u64).max(1)) as usize;
    jitter.max(1)
}

/// Whether this allocation of `size` bytes is picked for sampling.
#[inline]
pub fn should_sample(size: usize) -> bool {
    let interval = SAMPLE_INTERVAL.load(Ordering::Relaxed);
    if interval == 0 {
        return false;
    }
    if interval == 1 {
        SAMPLED_COUNT.fetch_add(1, Ordering::Relaxed);
        return true;
    }
    COUNTDOWN.with(|countdown| {
        let mut left = countdown.get();
        if left == 0 {
            // First decision on this thread; start a fresh countdown.
            left = draw_countdown(interval);
        }
        if left > size {
            countdown.set(left - size);
            return false;
        }
        countdown.set(draw_countdown(interval));
        SAMPLED_COUNT.fetch_add(1, Ordering::Relaxed);
        true
    })
}

/// Whether a sampled allocation should additionally get a guard page.
#[inline]
pub fn take_guard() -> bool {
    let rate = GUARDED_RATE.load(Ordering::Relaxed);
    if rate < 0 {
        return false;
    }
    if rate == 0 {
        return true;
    }
    if GUARD_COUNTDOWN.fetch_sub(1, Ordering::Relaxed) <= 1 {
        GUARD_COUNTDOWN.store(rate, Ordering::Relaxed);
        return true;
    }
    false
}

/// Allocations sampled since process start.
#[must_use]
pub fn sampled_count() -> u64 {
    SAMPLED_COUNT.load(Ordering::Relaxed)
}

fn set_interval(interval: usize) -> usize {
    SAMPLE_INTERVAL.swap(interval, Ordering::Relaxed)
}

/// Samples every allocation while alive.
pub struct ScopedAlwaysSample {
    prior: usize,
}

impl ScopedAlwaysSample {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prior: set_interval(1),
        }
    }
}

impl Default for ScopedAlwaysSample {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedAlwaysSample {
    fn drop(&mut self) {
        set_interval(self.prior);
    }
}

/// Samples nothing while alive.
pub struct ScopedNeverSample {
    prior: usize,
}

impl ScopedNeverSample {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prior: set_interval(0),
        }
    }
}

impl Default for ScopedNeverSample {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedNeverSample {
    fn drop(&mut self) {
        set_interval(self.prior);
    }
}

/// Overrides the mean sampling interval while alive.
pub struct ScopedProfileSamplingRate {
    prior: usize,
}

impl ScopedProfileSamplingRate {
    #[must_use]
    pub fn new(interval: usize) -> Self {
        Self {
            prior: set_interval(interval),
        }
    }
}

impl Drop for ScopedProfileSamplingRate {
    fn drop(&mut self) {
        set_interval(self.prior);
    }
}

/// Overrides the guarded sampling rate while alive. Negative disables
/// guard pages entirely.
pub struct ScopedGuardedSamplingRate {
    prior: i64,
}

impl ScopedGuardedSamplingRate {
    #[must_use]
    pub fn new(rate: i64) -> Self {
        Self {
            prior: GUARDED_RATE.swap(rate, Ordering::Relaxed),
        }
    }
}

impl Drop for ScopedGuardedSamplingRate {
    fn drop(&mut self) {
        GUARDED_RATE.swap(self.prior, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::SAMPLING;

    #[test]
    fn test_scoped_overrides_nest_and_restore() {
        let _lock = SAMPLING.lock();
        let outer = ScopedProfileSamplingRate::new(4096);
        assert_eq!(SAMPLE_INTERVAL.load(Ordering::Relaxed), 4096);
        {
            let _inner = ScopedNeverSample::new();
            assert!(!should_sample(usize::MAX / 2));
        }
        assert_eq!(SAMPLE_INTERVAL.load(Ordering::Relaxed), 4096);
        drop(outer);
    }

    #[test]
    fn test_always_sample_fires_every_time() {
        let _lock = SAMPLING.lock();
        let _guard = ScopedAlwaysSample::new();
        for _ in 0..100 {
            assert!(should_sample(1));
        }
    }

    #[test]
    fn test_guard_disabled_by_negative_rate() {
        let _lock = SAMPLING.lock();
        let _guard = ScopedGuardedSamplingRate::new(-1);
        for _ in 0..100 {
            assert!(!take_guard());
        }
    }

    #[test]
    fn test_countdown_tracks_bytes() {
        let _lock = SAMPLING.lock();
        let _guard = ScopedProfileSamplingRate::new(1 << 16);
        // Burn through any leftover countdown, then verify the mean
        // distance between samples is in the right ballpark.
        let mut samples = 0u32;
        let total = 10_000u32;
        for _ in 0..total {
            if should_sample(1 << 12) {
                samples += 1;
            }
        }
        let bytes = u64::from(total) << 12;
        let expect = bytes / (1 << 16);
        assert!(u64::from(samples) > expect / 4, "sampled {samples}");
        assert!(u64::from(samples) < expect * 4, "sampled {samples}");
    }
}
