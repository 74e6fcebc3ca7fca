//! Allocation entry points.
//!
//! Small unhinted requests go through the thread cache; everything else
//! (page-granular sizes, hot/cold hints, sampled allocations,
//! over-aligned requests with no matching slot) gets its own span. Every
//! deallocation resolves the pointer through the span registry first, so
//! invalid frees are caught deterministically instead of corrupting a
//! freelist.
//!
//! Out-of-memory surfaces as `None` from the `try_` variants; the plain
//! variants call [`std::alloc::handle_alloc_error`]. Misuse (foreign
//! pointers, double frees, wrong sized frees) aborts the process.
//!
//! # Examples
//!
//! ```
//! let p = spanalloc::try_alloc(100).expect("out of memory");
//! unsafe {
//!     p.as_ptr().write_bytes(0xAB, 100);
//!     spanalloc::dealloc_sized(p.as_ptr(), 100);
//! }
//! ```

use std::alloc::{handle_alloc_error, GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::hot_cold::HotCold;
use crate::page_heap::{self, SpanKind};
use crate::sampler;
use crate::size_class::{class_for, class_to_size, MIN_ALIGN, PAGE_SHIFT, PAGE_SIZE};
use crate::span::{registry, Locality, SpanMeta, SpanState};
use crate::thread_cache;
use crate::tracing::internal as trace;

/// Bytes currently allocated by callers (rounded capacities, not
/// requests).
static LIVE_BYTES: AtomicUsize = AtomicUsize::new(0);

/// A pointer together with the usable capacity behind it.
#[derive(Debug, Clone, Copy)]
pub struct SizedAlloc {
    /// Start of the allocation.
    pub ptr: NonNull<u8>,
    /// Usable bytes, at least the requested size. The whole range may be
    /// written and later passed to a sized free.
    pub capacity: usize,
}

#[cold]
fn misuse(msg: &str, addr: usize) -> ! {
    eprintln!("spanalloc: {msg} (pointer {addr:#x})");
    std::process::abort()
}

fn locality_hint(locality: Locality) -> Option<HotCold> {
    match locality {
        Locality::Default => None,
        Locality::Hot => Some(HotCold::HOTTEST),
        Locality::Cold => Some(HotCold::COLDEST),
    }
}

/// Serves a request from a dedicated span.
fn span_allocate(
    size: usize,
    align: usize,
    hint: Option<HotCold>,
    sampled: bool,
    zero: bool,
) -> Option<SizedAlloc> {
    let guarded = sampled && sampler::take_guard();
    let payload_pages = ((size.max(1) + PAGE_SIZE - 1) >> PAGE_SHIFT).max(1);
    let pages = payload_pages + usize::from(guarded);
    let locality = hint.map_or(Locality::Default, HotCold::locality);
    let kind = SpanKind::Large {
        requested: size,
        sampled,
        guarded,
    };

    let mut meta = if align > PAGE_SIZE {
        page_heap::new_span_aligned(pages, align, locality, kind)?
    } else {
        page_heap::new_span(pages, locality, kind)?
    };

    if guarded {
        let guard_addr = meta.base_addr() + ((pages - 1) << PAGE_SHIFT);
        // Base addresses come from successful mappings, never null.
        let guard_ptr = NonNull::new(guard_addr as *mut u8).expect("null guard page");
        // SAFETY: the guard page lies inside the span just mapped.
        if unsafe { sys_pages::protect_none(guard_ptr, PAGE_SIZE) }.is_err() {
            // Protection failed; keep the page usable instead.
            meta = registry()
                .update(meta.base, |m| m.guarded = false)
                .expect("fresh span vanished");
        }
    }
    if sampled {
        trace::trace_sample(size, meta.guarded);
    }

    let p = meta.base_addr() as *mut u8;
    if zero && size > 0 {
        // Reused spans carry stale data; fresh chunks are already zero.
        // SAFETY: size fits in the payload pages of the span.
        unsafe { ptr::write_bytes(p, 0, size) };
    }
    LIVE_BYTES.fetch_add(meta.capacity(), Ordering::Relaxed);
    Some(SizedAlloc {
        ptr: NonNull::new(p).expect("span at null address"),
        capacity: meta.capacity(),
    })
}

fn allocate(size: usize, align: usize, hint: Option<HotCold>, zero: bool) -> Option<SizedAlloc> {
    if size > isize::MAX as usize || !align.is_power_of_two() {
        return None;
    }
    let sampled = sampler::should_sample(size.max(1));

    if !sampled && hint.is_none() {
        if let Some(class) = class_for(size, align) {
            let p = thread_cache::allocate(class)?;
            let capacity = class_to_size(class);
            if zero {
                // SAFETY: the slot holds `capacity >= size` bytes.
                unsafe { ptr::write_bytes(p, 0, size) };
            }
            LIVE_BYTES.fetch_add(capacity, Ordering::Relaxed);
            return Some(SizedAlloc {
                ptr: NonNull::new(p).expect("null slot from thread cache"),
                capacity,
            });
        }
    }
    span_allocate(size, align, hint, sampled, zero)
}

/// Allocates `size` bytes aligned to [`MIN_ALIGN`], or `None` when out
/// of memory.
#[must_use]
pub fn try_alloc(size: usize) -> Option<NonNull<u8>> {
    allocate(size, MIN_ALIGN, None, false).map(|a| a.ptr)
}

/// Allocates `size` zeroed bytes.
#[must_use]
pub fn try_alloc_zeroed(size: usize) -> Option<NonNull<u8>> {
    allocate(size, MIN_ALIGN, None, true).map(|a| a.ptr)
}

/// Allocates with an explicit alignment, which must be a power of two
/// at least pointer-sized.
#[must_use]
pub fn try_alloc_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    if align < std::mem::size_of::<*const ()>() {
        return None;
    }
    allocate(size, align, None, false).map(|a| a.ptr)
}

/// Allocates with an access-frequency hint. Hinted objects are placed in
/// dedicated hot or cold page ranges.
#[must_use]
pub fn try_alloc_hot_cold(size: usize, hint: HotCold) -> Option<NonNull<u8>> {
    allocate(size, MIN_ALIGN, Some(hint), false).map(|a| a.ptr)
}

/// Allocates with both an explicit alignment and an access hint.
#[must_use]
pub fn try_alloc_aligned_hot_cold(size: usize, align: usize, hint: HotCold) -> Option<NonNull<u8>> {
    if align < std::mem::size_of::<*const ()>() {
        return None;
    }
    allocate(size, align, Some(hint), false).map(|a| a.ptr)
}

/// Allocates zeroed room for `count` elements of `size` bytes each. The
/// multiplication is checked; overflow fails without touching memory.
#[must_use]
pub fn try_alloc_array(count: usize, size: usize) -> Option<NonNull<u8>> {
    let total = count.checked_mul(size)?;
    allocate(total, MIN_ALIGN, None, true).map(|a| a.ptr)
}

/// Allocates and reports the usable capacity actually provisioned.
#[must_use]
pub fn try_alloc_size_returning(size: usize) -> Option<SizedAlloc> {
    allocate(size, MIN_ALIGN, None, false)
}

/// Size-returning allocation with an access hint.
#[must_use]
pub fn try_alloc_size_returning_hot_cold(size: usize, hint: HotCold) -> Option<SizedAlloc> {
    allocate(size, MIN_ALIGN, Some(hint), false)
}

/// Allocates `size` bytes; diverges via
/// [`std::alloc::handle_alloc_error`] on failure.
#[must_use]
pub fn alloc(size: usize) -> NonNull<u8> {
    try_alloc(size).unwrap_or_else(|| oom(size, MIN_ALIGN))
}

/// Allocates zeroed; diverges on failure.
#[must_use]
pub fn alloc_zeroed(size: usize) -> NonNull<u8> {
    try_alloc_zeroed(size).unwrap_or_else(|| oom(size, MIN_ALIGN))
}

/// Allocates aligned; diverges on failure.
#[must_use]
pub fn alloc_aligned(size: usize, align: usize) -> NonNull<u8> {
    try_alloc_aligned(size, align).unwrap_or_else(|| oom(size, align))
}

/// Allocates with a hint; diverges on failure.
#[must_use]
pub fn alloc_hot_cold(size: usize, hint: HotCold) -> NonNull<u8> {
    try_alloc_hot_cold(size, hint).unwrap_or_else(|| oom(size, MIN_ALIGN))
}

/// Allocates a zeroed array; diverges on failure, including multiply
/// overflow.
#[must_use]
pub fn alloc_array(count: usize, size: usize) -> NonNull<u8> {
    try_alloc_array(count, size).unwrap_or_else(|| oom(count.saturating_mul(size), MIN_ALIGN))
}

#[cold]
fn oom(size: usize, align: usize) -> ! {
    let layout = Layout::from_size_align(size.max(1), align.max(1).next_power_of_two())
        .unwrap_or(Layout::new::<u8>());
    handle_alloc_error(layout)
}

fn free_carved(meta: &SpanMeta, addr: usize, size: Option<usize>, align: usize, p: *mut u8) {
    let class = meta.class.expect("carved span without a class");
    let slot = class_to_size(class);
    if (addr - meta.base_addr()) % slot != 0 {
        misuse("free of a pointer into the middle of an object", addr);
    }
    if let Some(size) = size {
        if class_for(size, align) != Some(class) {
            misuse("sized free does not match the allocation", addr);
        }
    }
    LIVE_BYTES.fetch_sub(slot, Ordering::Relaxed);
    // SAFETY: validated above as a live slot of `class`.
    unsafe { thread_cache::deallocate(class, p) };
}

fn free_large(meta: &SpanMeta, addr: usize, size: Option<usize>, align: usize) {
    if addr != meta.base_addr() {
        misuse("free of a pointer into the middle of an object", addr);
    }
    if let Some(size) = size {
        if size < meta.requested || size > meta.capacity() {
            misuse("sized free does not match the allocation", addr);
        }
    }
    if addr % align != 0 {
        misuse("aligned free does not match the allocation", addr);
    }
    if meta.guarded {
        let guard_addr = meta.base_addr() + ((meta.pages - 1) << PAGE_SHIFT);
        let guard_ptr = NonNull::new(guard_addr as *mut u8).expect("null guard page");
        // SAFETY: the guard page belongs to this span. Restore access so
        // the page heap can recycle it; failure leaves the span
        // unrecyclable but is otherwise harmless.
        let _ = unsafe { sys_pages::protect_read_write(guard_ptr, PAGE_SIZE) };
    }
    LIVE_BYTES.fetch_sub(meta.capacity(), Ordering::Relaxed);
    page_heap::delete_span(meta.base);
}

fn free_inner(p: *mut u8, size: Option<usize>, align: usize) {
    let addr = p as usize;
    let Some(meta) = registry().lookup(addr) else {
        misuse("free of a pointer not from this allocator", addr);
    };
    match meta.state {
        SpanState::Free | SpanState::InCentral => misuse("double free", addr),
        SpanState::Carved => free_carved(&meta, addr, size, align, p),
        SpanState::LargeObject => free_large(&meta, addr, size, align),
    }
}

/// Frees an allocation.
///
/// # Safety
///
/// `p` must have been returned by this allocator and not freed since.
pub unsafe fn dealloc(p: *mut u8) {
    free_inner(p, None, 1);
}

/// Frees an allocation, checking the size. Any size between the original
/// request and the reported capacity is accepted.
///
/// # Safety
///
/// As [`dealloc`].
pub unsafe fn dealloc_sized(p: *mut u8, size: usize) {
    free_inner(p, Some(size), 1);
}

/// Frees an allocation, checking size and alignment against the original
/// request.
///
/// # Safety
///
/// As [`dealloc`].
pub unsafe fn dealloc_sized_aligned(p: *mut u8, size: usize, align: usize) {
    free_inner(p, Some(size), align.max(1));
}

/// Grows or shrinks an allocation, copying if it must move.
///
/// Returns the new pointer, or `None` when out of memory (the original
/// stays valid). A null `p` behaves like an allocation. Requests that
/// round to the same size class, or large objects that still fit their
/// span, keep their address.
///
/// # Safety
///
/// `p` must be null or a live allocation from this allocator; on success
/// with a moved pointer the old one is freed.
pub unsafe fn realloc(p: *mut u8, new_size: usize) -> Option<NonNull<u8>> {
    // SAFETY: forwarded contract.
    unsafe { realloc_inner(p, new_size, MIN_ALIGN) }
}

unsafe fn realloc_inner(p: *mut u8, new_size: usize, align: usize) -> Option<NonNull<u8>> {
    let Some(old) = NonNull::new(p) else {
        return allocate(new_size, align, None, false).map(|a| a.ptr);
    };
    if new_size > isize::MAX as usize {
        return None;
    }

    let addr = old.as_ptr() as usize;
    let Some(meta) = registry().lookup(addr) else {
        misuse("realloc of a pointer not from this allocator", addr);
    };
    let old_capacity = match meta.state {
        SpanState::Free | SpanState::InCentral => misuse("realloc after free", addr),
        SpanState::Carved => {
            let class = meta.class.expect("carved span without a class");
            if class_for(new_size, align) == Some(class) {
                return Some(old);
            }
            class_to_size(class)
        }
        SpanState::LargeObject => {
            let payload_pages = meta.pages - usize::from(meta.guarded);
            let new_pages = ((new_size.max(1) + PAGE_SIZE - 1) >> PAGE_SHIFT).max(1);
            if !meta.sampled && !meta.guarded && new_pages <= payload_pages {
                // Shrinks keep the whole span reserved; the registry only
                // learns the new request so sized frees stay consistent.
                let _ = registry().update(meta.base, |m| m.requested = new_size);
                return Some(old);
            }
            meta.capacity()
        }
    };

    let fresh = allocate(new_size, align, locality_hint(meta.locality), false)?;
    // SAFETY: both regions are live and distinct; the copy length fits
    // in each.
    unsafe {
        ptr::copy_nonoverlapping(
            old.as_ptr(),
            fresh.ptr.as_ptr(),
            old_capacity.min(new_size),
        );
        dealloc(old.as_ptr());
    }
    Some(fresh.ptr)
}

/// Bytes currently allocated by callers, at provisioned granularity.
#[must_use]
pub fn live_bytes() -> usize {
    LIVE_BYTES.load(Ordering::Relaxed)
}

/// [`GlobalAlloc`] adapter.
///
/// Internal bookkeeping (the span registry, central list maps) allocates
/// through the global allocator too. A thread-local depth flag breaks
/// the cycle: nested allocations are forwarded to [`System`], and frees
/// route by registry ownership, so either origin is always torn down by
/// the allocator that produced it.
///
/// # Examples
///
/// ```ignore
/// #[global_allocator]
/// static ALLOC: spanalloc::SpanAlloc = spanalloc::SpanAlloc;
/// ```
pub struct SpanAlloc;

thread_local! {
    static IN_ALLOCATOR: Cell<bool> = const { Cell::new(false) };
}

fn enter() -> bool {
    IN_ALLOCATOR
        .try_with(|flag| {
            if flag.get() {
                false
            } else {
                flag.set(true);
                true
            }
        })
        .unwrap_or(false)
}

fn exit() {
    let _ = IN_ALLOCATOR.try_with(|flag| flag.set(false));
}

unsafe impl GlobalAlloc for SpanAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if !enter() {
            // SAFETY: forwarded contract.
            return unsafe { System.alloc(layout) };
        }
        let p = allocate(layout.size(), layout.align(), None, false)
            .map_or(ptr::null_mut(), |a| a.ptr.as_ptr());
        exit();
        p
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if !enter() {
            // SAFETY: forwarded contract.
            return unsafe { System.alloc_zeroed(layout) };
        }
        let p = allocate(layout.size(), layout.align(), None, true)
            .map_or(ptr::null_mut(), |a| a.ptr.as_ptr());
        exit();
        p
    }

    unsafe fn dealloc(&self, p: *mut u8, layout: Layout) {
        if registry().lookup(p as usize).is_none() {
            // Allocated by System during a nested call.
            // SAFETY: forwarded contract.
            return unsafe { System.dealloc(p, layout) };
        }
        let nested = !enter();
        free_inner(p, Some(layout.size()), layout.align());
        if !nested {
            exit();
        }
    }

    unsafe fn realloc(&self, p: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if registry().lookup(p as usize).is_none() {
            // SAFETY: forwarded contract.
            return unsafe { System.realloc(p, layout, new_size) };
        }
        let nested = !enter();
        // SAFETY: registry ownership established above; caller upholds
        // liveness.
        let out = unsafe { realloc_inner(p, new_size, layout.align()) }
            .map_or(ptr::null_mut(), NonNull::as_ptr);
        if !nested {
            exit();
        }
        out
    }
}
