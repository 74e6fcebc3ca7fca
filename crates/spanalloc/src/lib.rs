//! A concurrent, span-based memory allocator.
//!
//! `spanalloc` manages memory in spans of 8 KiB logical pages. Small
//! requests are rounded to one of a fixed set of size classes and served
//! from per-thread caches backed by central free lists; page-granular
//! requests get spans of their own. An address-ordered span registry
//! maps any live pointer back to its owning span, which is what makes
//! interior-pointer diagnostics, sized-free validation and span
//! coalescing possible.
//!
//! # Features
//!
//! - **Thread-cached small objects**: the hot path touches no locks
//! - **Hot/cold placement**: hinted allocations land in dedicated page
//!   ranges, keeping rarely-used data off hot cache lines
//! - **Sampling profiler**: a jittered byte countdown picks allocations
//!   for exact-size tracking, optionally with trailing guard pages
//! - **Memory release**: free spans can be returned to the OS on demand
//!   while staying reserved for reuse
//!
//! # Quick Start
//!
//! ```
//! let p = spanalloc::try_alloc(100).expect("out of memory");
//! unsafe {
//!     p.as_ptr().write_bytes(0, 100);
//!     spanalloc::dealloc_sized(p.as_ptr(), 100);
//! }
//! ```
//!
//! As the global allocator:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: spanalloc::SpanAlloc = spanalloc::SpanAlloc;
//! ```
//!
//! # Misuse Handling
//!
//! Freeing a foreign pointer, freeing twice, or passing a size that does
//! not match the allocation aborts the process with a message on
//! stderr. Out of memory is not misuse: the `try_` entry points return
//! `None` and the plain ones call [`std::alloc::handle_alloc_error`].

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod api;
mod central;
mod hot_cold;
mod page_heap;
mod sampler;
mod size_class;
mod span;
mod stats;
mod thread_cache;
mod tracing;

pub use api::{
    alloc, alloc_aligned, alloc_array, alloc_hot_cold, alloc_zeroed, dealloc, dealloc_sized,
    dealloc_sized_aligned, realloc, try_alloc, try_alloc_aligned, try_alloc_aligned_hot_cold,
    try_alloc_array, try_alloc_hot_cold, try_alloc_size_returning,
    try_alloc_size_returning_hot_cold, try_alloc_zeroed, SizedAlloc, SpanAlloc,
};
pub use hot_cold::HotCold;
pub use sampler::{
    ScopedAlwaysSample, ScopedGuardedSamplingRate, ScopedNeverSample, ScopedProfileSamplingRate,
};
pub use size_class::{MAX_SMALL_SIZE, MIN_ALIGN, PAGE_SIZE};
pub use stats::{allocated_size, numeric_property, release_memory_to_system, rounded_size, stats};
