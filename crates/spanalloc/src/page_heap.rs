//! Page-granular span allocator.
//!
//! The page heap owns every page reserved from the OS. It hands out
//! spans, takes them back, splits and coalesces free runs, and returns
//! backing pages to the OS on request. Free spans live in three disjoint
//! pools keyed by locality; a chunk mapped for one pool never serves
//! another, so hot, cold and default allocations occupy disjoint page
//! ranges for the lifetime of the process.
//!
//! All operations run under a single mutex. The only potentially
//! unbounded waits in the allocator are the system calls issued from
//! here (mapping fresh chunks and decommitting released spans).

use std::collections::BTreeSet;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::size_class::{PAGE_SHIFT, PAGE_SIZE};
use crate::span::{page_of, registry, Locality, PageId, SpanMeta, SpanState};
use crate::tracing::internal as trace;

/// Fresh chunks are mapped in multiples of this, amortizing syscalls for
/// small span requests.
pub const MIN_CHUNK_BYTES: usize = 1 << 20;

/// What the requested span will become. Applied atomically with
/// registration so the registry never exposes a half-initialized span.
#[derive(Debug, Clone, Copy)]
pub enum SpanKind {
    /// Will be sliced into size-class slots.
    Carved {
        /// Owning size class.
        class: usize,
    },
    /// A single page-granular object.
    Large {
        /// Exact requested size.
        requested: usize,
        /// Chosen by the sampling profiler.
        sampled: bool,
        /// Last page is a guard page.
        guarded: bool,
    },
}

struct PageHeapInner {
    /// Free spans per locality pool, keyed (pages, base) so the first
    /// entry at or above a length is the best fit.
    free: [BTreeSet<(usize, PageId)>; Locality::COUNT],
    /// Bytes currently decommitted back to the OS.
    unmapped_bytes: usize,
    next_chunk: u32,
    spans_allocated: u64,
    releases: u64,
}

impl PageHeapInner {
    const fn new() -> Self {
        Self {
            free: [BTreeSet::new(), BTreeSet::new(), BTreeSet::new()],
            unmapped_bytes: 0,
            next_chunk: 0,
            spans_allocated: 0,
            releases: 0,
        }
    }
}

static PAGE_HEAP: Mutex<PageHeapInner> = Mutex::new(PageHeapInner::new());

fn apply_kind(meta: &mut SpanMeta, kind: SpanKind) {
    match kind {
        SpanKind::Carved { class } => {
            meta.state = SpanState::Carved;
            meta.class = Some(class);
        }
        SpanKind::Large {
            requested,
            sampled,
            guarded,
        } => {
            meta.state = SpanState::LargeObject;
            meta.requested = requested;
            meta.sampled = sampled;
            meta.guarded = guarded;
        }
    }
}

/// Allocates a span of `pages` pages from the given locality pool.
///
/// Prefers an exact-length free span, then the smallest sufficient one
/// (splitting off the remainder); maps a fresh chunk of at least
/// [`MIN_CHUNK_BYTES`] from the OS only when the pool is exhausted.
/// Returns `None` when the OS refuses to provide memory.
pub fn new_span(pages: usize, locality: Locality, kind: SpanKind) -> Option<SpanMeta> {
    let pool = locality.index();
    let mut heap = PAGE_HEAP.lock();

    let best = heap.free[pool].range((pages, 0)..).next().copied();
    let mut meta = if let Some((avail, base)) = best {
        heap.free[pool].remove(&(avail, base));
        let mut meta = registry()
            .remove(base)
            .expect("free span missing from registry");

        if meta.released {
            let ptr = span_ptr(&meta);
            if unsafe { sys_pages::commit(ptr, meta.len_bytes()) }.is_err() {
                registry().insert(meta);
                heap.free[pool].insert((avail, base));
                return None;
            }
            heap.unmapped_bytes -= meta.len_bytes();
            meta.released = false;
        }

        if avail > pages {
            let rem = SpanMeta {
                base: base + pages,
                pages: avail - pages,
                state: SpanState::Free,
                class: None,
                locality,
                requested: 0,
                sampled: false,
                guarded: false,
                chunk: meta.chunk,
                released: false,
            };
            registry().insert(rem);
            heap.free[pool].insert((rem.pages, rem.base));
        }
        meta.pages = pages;
        trace::trace_new_span(pages, locality, false);
        meta
    } else {
        let need = pages << PAGE_SHIFT;
        let len = need.max(MIN_CHUNK_BYTES);
        let ptr = unsafe { sys_pages::map_aligned(len, PAGE_SIZE) }.ok()?;
        let chunk = heap.next_chunk;
        heap.next_chunk += 1;

        let base = page_of(ptr.as_ptr() as usize);
        let total = len >> PAGE_SHIFT;
        if total > pages {
            let rem = SpanMeta {
                base: base + pages,
                pages: total - pages,
                state: SpanState::Free,
                class: None,
                locality,
                requested: 0,
                sampled: false,
                guarded: false,
                chunk,
                released: false,
            };
            registry().insert(rem);
            heap.free[pool].insert((rem.pages, rem.base));
        }
        trace::trace_new_span(pages, locality, true);
        SpanMeta {
            base,
            pages,
            state: SpanState::Free,
            class: None,
            locality,
            requested: 0,
            sampled: false,
            guarded: false,
            chunk,
            released: false,
        }
    };

    apply_kind(&mut meta, kind);
    registry().insert(meta);
    heap.spans_allocated += 1;
    Some(meta)
}

/// Allocates a span whose base is aligned beyond [`PAGE_SIZE`]. Such
/// spans always come from a dedicated chunk; the free pools give no
/// alignment guarantee past the page.
pub fn new_span_aligned(
    pages: usize,
    align: usize,
    locality: Locality,
    kind: SpanKind,
) -> Option<SpanMeta> {
    debug_assert!(align > PAGE_SIZE);
    let len = pages << PAGE_SHIFT;
    let ptr = unsafe { sys_pages::map_aligned(len, align) }.ok()?;

    let mut heap = PAGE_HEAP.lock();
    let chunk = heap.next_chunk;
    heap.next_chunk += 1;
    heap.spans_allocated += 1;
    drop(heap);

    let mut meta = SpanMeta {
        base: page_of(ptr.as_ptr() as usize),
        pages,
        state: SpanState::Free,
        class: None,
        locality,
        requested: 0,
        sampled: false,
        guarded: false,
        chunk,
        released: false,
    };
    apply_kind(&mut meta, kind);
    registry().insert(meta);
    trace::trace_new_span(pages, locality, true);
    Some(meta)
}

/// Returns a span to its free pool, coalescing with address-adjacent
/// free neighbors from the same chunk.
pub fn delete_span(base: PageId) {
    let mut heap = PAGE_HEAP.lock();
    let mut meta = registry().remove(base).expect("deleting unknown span");
    debug_assert_ne!(meta.state, SpanState::Free, "span freed twice");

    meta.state = SpanState::Free;
    meta.class = None;
    meta.requested = 0;
    meta.sampled = false;
    meta.guarded = false;

    let pool = meta.locality.index();
    if let Some(prev) = registry().adjacent_before(meta.base) {
        if mergeable(&prev, &meta) {
            heap.free[pool].remove(&(prev.pages, prev.base));
            registry().remove(prev.base);
            meta.base = prev.base;
            meta.pages += prev.pages;
        }
    }
    if let Some(next) = registry().adjacent_after(meta.base, meta.pages) {
        if mergeable(&next, &meta) {
            heap.free[pool].remove(&(next.pages, next.base));
            registry().remove(next.base);
            meta.pages += next.pages;
        }
    }

    trace::trace_delete_span(meta.pages);
    registry().insert(meta);
    heap.free[pool].insert((meta.pages, meta.base));
}

fn mergeable(neighbor: &SpanMeta, span: &SpanMeta) -> bool {
    neighbor.state == SpanState::Free
        && neighbor.chunk == span.chunk
        && neighbor.locality == span.locality
        && neighbor.released == span.released
}

fn span_ptr(meta: &SpanMeta) -> NonNull<u8> {
    // Span bases come from successful mappings, never address zero.
    NonNull::new(meta.base_addr() as *mut u8).expect("span at null address")
}

/// Decommits free spans, largest first, until at least `target` bytes
/// have been returned to the OS or no candidates remain. Whole spans
/// only. Already-released spans are skipped, so a repeat call with no
/// new free spans returns 0.
pub fn release_to_system(target: usize) -> usize {
    let mut heap = PAGE_HEAP.lock();

    let mut candidates: Vec<(usize, PageId)> = Vec::new();
    for pool in 0..Locality::COUNT {
        for &(pages, base) in &heap.free[pool] {
            let meta = registry()
                .lookup(base << PAGE_SHIFT)
                .expect("free span missing from registry");
            if !meta.released {
                candidates.push((pages, base));
            }
        }
    }
    candidates.sort_unstable_by(|a, b| b.0.cmp(&a.0));

    let mut released = 0usize;
    for (_, base) in candidates {
        if released >= target {
            break;
        }
        let meta = registry()
            .update(base, |m| m.released = true)
            .expect("candidate span vanished");
        let len = meta.len_bytes();
        if unsafe { sys_pages::decommit(span_ptr(&meta), len) }.is_err() {
            registry().update(base, |m| m.released = false);
            continue;
        }
        heap.unmapped_bytes += len;
        heap.releases += 1;
        released += len;
    }

    trace::trace_release(released, target);
    released
}

/// Bytes currently decommitted back to the OS.
#[must_use]
pub fn unmapped_bytes() -> usize {
    PAGE_HEAP.lock().unmapped_bytes
}

/// Spans handed out since process start.
#[must_use]
pub fn spans_allocated() -> u64 {
    PAGE_HEAP.lock().spans_allocated
}

/// Release operations performed since process start.
#[must_use]
pub fn releases() -> u64 {
    PAGE_HEAP.lock().releases
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large(requested: usize) -> SpanKind {
        SpanKind::Large {
            requested,
            sampled: false,
            guarded: false,
        }
    }

    #[test]
    fn test_new_span_registers_and_splits() {
        let span = new_span(4, Locality::Default, large(4 * PAGE_SIZE)).expect("span");
        assert_eq!(span.pages, 4);
        assert_eq!(span.state, SpanState::LargeObject);

        let found = registry()
            .lookup(span.base_addr() + PAGE_SIZE)
            .expect("registered");
        assert_eq!(found.base, span.base);

        delete_span(span.base);
        assert_eq!(
            registry().lookup(span.base_addr()).expect("still mapped").state,
            SpanState::Free
        );
    }

    #[test]
    fn test_delete_coalesces_adjacent_spans() {
        // Carve two adjacent spans out of one chunk, then free both; the
        // second free must merge them into a single free run.
        let a = new_span(2, Locality::Default, large(2 * PAGE_SIZE)).expect("a");
        let b = new_span(2, Locality::Default, large(2 * PAGE_SIZE)).expect("b");
        if b.base != a.base + a.pages || a.chunk != b.chunk {
            // Another test raced us for the chunk; adjacency is exercised
            // deterministically in the release integration test.
            delete_span(a.base);
            delete_span(b.base);
            return;
        }

        delete_span(a.base);
        delete_span(b.base);
        let merged = registry().lookup(a.base_addr()).expect("merged span");
        assert_eq!(merged.state, SpanState::Free);
        assert!(merged.pages >= 4);
        assert!(merged.base <= a.base);
    }

    #[test]
    fn test_aligned_span_base() {
        let align = 1 << 16;
        let span = new_span_aligned(2, align, Locality::Default, large(PAGE_SIZE)).expect("span");
        assert_eq!(span.base_addr() % align, 0);
        delete_span(span.base);
    }

    #[test]
    fn test_pools_are_disjoint() {
        let hot = new_span(1, Locality::Hot, large(PAGE_SIZE)).expect("hot");
        let cold = new_span(1, Locality::Cold, large(PAGE_SIZE)).expect("cold");
        assert_ne!(hot.chunk, cold.chunk);
        let hot_range = hot.base..hot.base + hot.pages;
        assert!(!hot_range.contains(&cold.base));
        delete_span(hot.base);
        delete_span(cold.base);
    }
}
