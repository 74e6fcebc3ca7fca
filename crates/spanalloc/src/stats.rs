//! Introspection and memory-return controls.

use std::fmt::Write as _;

use crate::size_class::{class_for, class_to_size, PAGE_SHIFT, PAGE_SIZE};
use crate::span::{registry, SpanState};
use crate::{api, page_heap, sampler, thread_cache};

/// Returns free pages to the OS until at least `target` bytes have been
/// released, in whole-span units. Returns the bytes actually released;
/// 0 when nothing releasable remains. `usize::MAX` releases everything.
pub fn release_memory_to_system(target: usize) -> usize {
    page_heap::release_to_system(target)
}

/// Usable capacity behind a live pointer, or `None` for pointers this
/// allocator does not own. Sampled allocations report their exact
/// requested size.
#[must_use]
pub fn allocated_size(p: *const u8) -> Option<usize> {
    let meta = registry().lookup(p as usize)?;
    match meta.state {
        SpanState::Free | SpanState::InCentral => None,
        SpanState::Carved => meta.class.map(class_to_size),
        SpanState::LargeObject => Some(meta.capacity()),
    }
}

/// Capacity a request of `size` bytes at `align` would be provisioned
/// with, without allocating. `None` for unsatisfiable requests.
#[must_use]
pub fn rounded_size(size: usize, align: usize) -> Option<usize> {
    if size > isize::MAX as usize || !align.is_power_of_two() {
        return None;
    }
    Some(match class_for(size, align) {
        Some(class) => class_to_size(class),
        None => ((size.max(1) + PAGE_SIZE - 1) >> PAGE_SHIFT).max(1) << PAGE_SHIFT,
    })
}

/// Looks up one numeric statistic by name.
///
/// Known names: `generic.current_allocated_bytes`,
/// `pageheap.unmapped_bytes`, `pageheap.reserved_bytes`,
/// `thread_cache.bytes`, `sampler.sampled_count`.
#[must_use]
pub fn numeric_property(name: &str) -> Option<usize> {
    match name {
        "generic.current_allocated_bytes" => Some(api::live_bytes()),
        "pageheap.unmapped_bytes" => Some(page_heap::unmapped_bytes()),
        "pageheap.reserved_bytes" => Some(sys_pages::reserved_bytes()),
        "thread_cache.bytes" => Some(thread_cache::cached_bytes()),
        #[allow(clippy::cast_possible_truncation)]
        "sampler.sampled_count" => Some(sampler::sampled_count() as usize),
        _ => None,
    }
}

/// Renders a human-readable statistics dump.
#[must_use]
pub fn stats() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "------------------------------------------------");
    let _ = writeln!(
        out,
        "MALLOC: {:>16} bytes in use by application",
        api::live_bytes()
    );
    let _ = writeln!(
        out,
        "MALLOC: {:>16} bytes in thread caches",
        thread_cache::cached_bytes()
    );
    let _ = writeln!(
        out,
        "MALLOC: {:>16} bytes released to OS (unmapped)",
        page_heap::unmapped_bytes()
    );
    let _ = writeln!(
        out,
        "MALLOC: {:>16} spans handed out",
        page_heap::spans_allocated()
    );
    let _ = writeln!(
        out,
        "MALLOC: {:>16} release operations",
        page_heap::releases()
    );
    let _ = writeln!(
        out,
        "MALLOC: {:>16} allocations sampled",
        sampler::sampled_count()
    );
    let _ = writeln!(out, "------------------------------------------------");
    let _ = writeln!(out, "Low-level allocator stats:");
    let _ = writeln!(
        out,
        "sys_pages: {} bytes allocated",
        sys_pages::reserved_bytes()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::{MAX_SMALL_SIZE, MIN_ALIGN};

    #[test]
    fn test_numeric_properties_exist() {
        for name in [
            "generic.current_allocated_bytes",
            "pageheap.unmapped_bytes",
            "pageheap.reserved_bytes",
            "thread_cache.bytes",
            "sampler.sampled_count",
        ] {
            assert!(numeric_property(name).is_some(), "missing {name}");
        }
        assert!(numeric_property("no.such.property").is_none());
    }

    #[test]
    fn test_allocated_size_matches_rounding() {
        let _lock = crate::test_util::SAMPLING.lock();
        let _quiet = crate::ScopedNeverSample::new();
        for size in [1usize, 100, 10_000, MAX_SMALL_SIZE, 1 << 20] {
            let p = crate::try_alloc(size).expect("alloc");
            let reported = allocated_size(p.as_ptr()).expect("live pointer");
            assert_eq!(reported, rounded_size(size, MIN_ALIGN).expect("satisfiable"));
            assert!(reported >= size);
            unsafe { crate::dealloc(p.as_ptr()) };
        }
    }

    #[test]
    fn test_foreign_pointer_has_no_size() {
        let local = 0u8;
        assert!(allocated_size(&local).is_none());
    }

    #[test]
    fn test_stats_dump_names_low_level_allocator() {
        let dump = stats();
        assert!(dump.contains("bytes in use by application"));
        assert!(dump.contains("sys_pages:"));
    }
}
