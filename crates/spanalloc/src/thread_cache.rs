//! Per-thread slot caches.
//!
//! The fast path for small allocations: each thread keeps a freelist per
//! size class and only talks to the central lists in batches of
//! [`BATCH`]. Per-class capacity adapts to the workload, growing after
//! consecutive refills and shrinking after consecutive overflows, so a
//! thread that churns through one class ends up paying the central lock
//! for a small fraction of its operations.
//!
//! The cache is destroyed with the thread; late allocations during
//! thread teardown fall through to the central lists directly.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::central;
use crate::size_class::{class_to_size, NUM_CLASSES};

/// Slots moved per central-list transfer.
pub const BATCH: usize = 32;

const MIN_CACHE: u32 = BATCH as u32;
const MAX_CACHE: u32 = 1024;

/// Consecutive refills or overflows before capacity adapts.
const ADAPT_STREAK: u8 = 2;

/// Bytes sitting in all thread caches, updated with relaxed ordering.
static CACHED_BYTES: AtomicUsize = AtomicUsize::new(0);

struct ClassCache {
    head: *mut u8,
    len: u32,
    max_len: u32,
    refill_streak: u8,
    overflow_streak: u8,
}

impl ClassCache {
    const NEW: Self = Self {
        head: ptr::null_mut(),
        len: 0,
        max_len: MIN_CACHE,
        refill_streak: 0,
        overflow_streak: 0,
    };

    #[inline]
    fn pop(&mut self) -> Option<*mut u8> {
        if self.head.is_null() {
            return None;
        }
        let p = self.head;
        // SAFETY: cached slots carry the next link in their first word.
        self.head = unsafe { p.cast::<*mut u8>().read() };
        self.len -= 1;
        Some(p)
    }

    #[inline]
    fn push(&mut self, p: *mut u8) {
        // SAFETY: the slot is free; its first word becomes the link.
        unsafe { p.cast::<*mut u8>().write(self.head) };
        self.head = p;
        self.len += 1;
    }
}

struct ThreadCache {
    classes: [ClassCache; NUM_CLASSES],
}

impl ThreadCache {
    const fn new() -> Self {
        Self {
            classes: [ClassCache::NEW; NUM_CLASSES],
        }
    }

    fn allocate(&mut self, class: usize) -> Option<*mut u8> {
        let slot = class_to_size(class);
        let cache = &mut self.classes[class];
        if let Some(p) = cache.pop() {
            CACHED_BYTES.fetch_sub(slot, Ordering::Relaxed);
            return Some(p);
        }

        let mut batch = [ptr::null_mut(); BATCH];
        let want = (cache.max_len as usize).min(BATCH);
        let got = central::fetch(class, &mut batch[..want]);
        if got == 0 {
            return None;
        }
        for &p in &batch[1..got] {
            cache.push(p);
        }
        CACHED_BYTES.fetch_add((got - 1) * slot, Ordering::Relaxed);

        cache.overflow_streak = 0;
        cache.refill_streak += 1;
        if cache.refill_streak >= ADAPT_STREAK {
            cache.refill_streak = 0;
            cache.max_len = (cache.max_len * 2).min(MAX_CACHE);
        }
        Some(batch[0])
    }

    /// # Safety
    ///
    /// `p` must be a live slot of `class`.
    unsafe fn deallocate(&mut self, class: usize, p: *mut u8) {
        let slot = class_to_size(class);
        let cache = &mut self.classes[class];
        cache.push(p);
        CACHED_BYTES.fetch_add(slot, Ordering::Relaxed);

        if cache.len <= cache.max_len {
            return;
        }

        let mut batch = [ptr::null_mut(); BATCH];
        for out in &mut batch {
            *out = cache.pop().expect("overflowing cache ran dry");
        }
        CACHED_BYTES.fetch_sub(BATCH * slot, Ordering::Relaxed);
        // SAFETY: everything in the cache came from this class.
        unsafe { central::return_batch(class, &batch) };

        cache.refill_streak = 0;
        cache.overflow_streak += 1;
        if cache.overflow_streak >= ADAPT_STREAK {
            cache.overflow_streak = 0;
            cache.max_len = (cache.max_len / 2).max(MIN_CACHE);
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        let mut batch = [ptr::null_mut(); BATCH];
        for class in 0..NUM_CLASSES {
            let slot = class_to_size(class);
            let cache = &mut self.classes[class];
            while cache.len > 0 {
                let mut n = 0;
                while n < BATCH {
                    match cache.pop() {
                        Some(p) => {
                            batch[n] = p;
                            n += 1;
                        }
                        None => break,
                    }
                }
                CACHED_BYTES.fetch_sub(n * slot, Ordering::Relaxed);
                // SAFETY: cached slots all belong to `class`.
                unsafe { central::return_batch(class, &batch[..n]) };
            }
        }
    }
}

thread_local! {
    static CACHE: RefCell<ThreadCache> = const { RefCell::new(ThreadCache::new()) };
}

/// Allocates one slot of `class`. Returns `None` when the page heap is
/// out of memory.
pub fn allocate(class: usize) -> Option<*mut u8> {
    CACHE
        .try_with(|cache| cache.borrow_mut().allocate(class))
        .unwrap_or_else(|_| {
            // Thread cache already destroyed; go straight to central.
            let mut one = [ptr::null_mut()];
            (central::fetch(class, &mut one) == 1).then(|| one[0])
        })
}

/// Returns one slot of `class`.
///
/// # Safety
///
/// `p` must be a live slot of `class`, freed exactly once.
pub unsafe fn deallocate(class: usize, p: *mut u8) {
    let direct = CACHE.try_with(|cache| {
        // SAFETY: forwarded contract.
        unsafe { cache.borrow_mut().deallocate(class, p) };
    });
    if direct.is_err() {
        // SAFETY: forwarded contract.
        unsafe { central::return_batch(class, &[p]) };
    }
}

/// Bytes currently held across all thread caches.
#[must_use]
pub fn cached_bytes() -> usize {
    CACHED_BYTES.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_recycles_freed_slot() {
        let class = 5;
        let p = allocate(class).expect("slot");
        unsafe { deallocate(class, p) };
        let q = allocate(class).expect("slot");
        // LIFO cache hands the same slot straight back.
        assert_eq!(p, q);
        unsafe { deallocate(class, q) };
    }

    #[test]
    fn test_cache_survives_heavy_churn() {
        let class = 2;
        let mut held = Vec::new();
        for _ in 0..4096 {
            held.push(allocate(class).expect("slot"));
        }
        let mut sorted = held.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), held.len(), "duplicate slot handed out");
        for p in held {
            unsafe { deallocate(class, p) };
        }
    }

    #[test]
    fn test_cached_bytes_counts_freed_slot() {
        let class = 12;
        let p = allocate(class).expect("slot");
        unsafe { deallocate(class, p) };
        // The freed slot sits in this thread's cache; nobody else can
        // take it, so the global counter covers it.
        assert!(cached_bytes() >= class_to_size(class));
    }
}
