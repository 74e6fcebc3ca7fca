//! Spans and the process-wide span registry.
//!
//! A span is a contiguous run of logical pages managed as a unit. The
//! registry is an address-ordered map from first page to span metadata;
//! it is the single source of truth linking a live pointer to the span
//! that owns it. Span page ranges are pairwise disjoint and their union
//! is exactly the memory currently reserved from the OS.
//!
//! Coalescing and interior-pointer resolution are both bounded range
//! lookups on this map; spans never hold raw neighbor pointers.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::size_class::{PAGE_SHIFT, PAGE_SIZE};

/// Index of a logical page (address divided by [`PAGE_SIZE`]).
pub type PageId = usize;

/// Converts an address to the id of the page containing it.
#[inline]
#[must_use]
pub const fn page_of(addr: usize) -> PageId {
    addr >> PAGE_SHIFT
}

/// Lifecycle state of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanState {
    /// Owned by the page heap, available for reuse.
    Free,
    /// Handed to a central free list but not yet carved.
    InCentral,
    /// Sliced into size-class slots owned by a central free list.
    Carved,
    /// A single page-granular object.
    LargeObject,
}

/// Locality pool a span is drawn from. Pools are disjoint: a page never
/// moves between pools for the lifetime of its chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locality {
    /// Unhinted allocations.
    #[default]
    Default,
    /// Frequently accessed data.
    Hot,
    /// Rarely accessed data.
    Cold,
}

impl Locality {
    /// Pool index for per-pool tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Default => 0,
            Self::Hot => 1,
            Self::Cold => 2,
        }
    }

    /// Number of pools.
    pub const COUNT: usize = 3;
}

/// Metadata for one span.
#[derive(Debug, Clone, Copy)]
pub struct SpanMeta {
    /// First page of the span.
    pub base: PageId,
    /// Number of pages.
    pub pages: usize,
    /// Lifecycle state.
    pub state: SpanState,
    /// Owning size class when `Carved`.
    pub class: Option<usize>,
    /// Locality pool.
    pub locality: Locality,
    /// Exact requested size for `LargeObject` spans.
    pub requested: usize,
    /// Chosen by the sampling profiler; `allocated_size` reports
    /// `requested` instead of the rounded capacity for these.
    pub sampled: bool,
    /// The last page is an inaccessible guard page.
    pub guarded: bool,
    /// System chunk the span was carved from. Spans never coalesce
    /// across chunk boundaries.
    pub chunk: u32,
    /// Backing pages have been returned to the OS (span stays reserved).
    pub released: bool,
}

impl SpanMeta {
    /// Base address of the span.
    #[inline]
    #[must_use]
    pub const fn base_addr(&self) -> usize {
        self.base << PAGE_SHIFT
    }

    /// Length of the span in bytes, guard page included.
    #[inline]
    #[must_use]
    pub const fn len_bytes(&self) -> usize {
        self.pages << PAGE_SHIFT
    }

    /// Usable capacity in bytes: the span minus any guard page. For
    /// sampled spans the reported capacity is the exact request.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        if self.sampled {
            self.requested
        } else {
            let guard = if self.guarded { PAGE_SIZE } else { 0 };
            (self.pages << PAGE_SHIFT) - guard
        }
    }

    #[inline]
    #[must_use]
    pub(crate) const fn contains_page(&self, page: PageId) -> bool {
        page >= self.base && page < self.base + self.pages
    }
}

/// Address-ordered span registry.
pub struct SpanRegistry {
    inner: RwLock<BTreeMap<PageId, SpanMeta>>,
}

static REGISTRY: SpanRegistry = SpanRegistry {
    inner: RwLock::new(BTreeMap::new()),
};

/// The process-wide registry.
#[inline]
pub fn registry() -> &'static SpanRegistry {
    &REGISTRY
}

impl SpanRegistry {
    /// Resolves an address (interior pointers included) to its owning
    /// span, if any.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<SpanMeta> {
        let page = page_of(addr);
        let map = self.inner.read();
        let (_, meta) = map.range(..=page).next_back()?;
        meta.contains_page(page).then_some(*meta)
    }

    /// Registers a span. The range must not overlap any registered span.
    pub fn insert(&self, meta: SpanMeta) {
        let prev = self.inner.write().insert(meta.base, meta);
        debug_assert!(prev.is_none(), "span registered twice at {}", meta.base);
    }

    /// Removes and returns the span starting at `base`.
    pub fn remove(&self, base: PageId) -> Option<SpanMeta> {
        self.inner.write().remove(&base)
    }

    /// Mutates the span starting at `base` in place. Returns the updated
    /// metadata, or `None` when no span starts there.
    pub fn update<F>(&self, base: PageId, f: F) -> Option<SpanMeta>
    where
        F: FnOnce(&mut SpanMeta),
    {
        let mut map = self.inner.write();
        let meta = map.get_mut(&base)?;
        f(meta);
        Some(*meta)
    }

    /// Returns the span immediately preceding `base` in address order,
    /// if it is adjacent to `base`.
    #[must_use]
    pub fn adjacent_before(&self, base: PageId) -> Option<SpanMeta> {
        let map = self.inner.read();
        let (_, meta) = map.range(..base).next_back()?;
        (meta.base + meta.pages == base).then_some(*meta)
    }

    /// Returns the span starting exactly at `base + pages`, if any.
    #[must_use]
    pub fn adjacent_after(&self, base: PageId, pages: usize) -> Option<SpanMeta> {
        self.inner.read().get(&(base + pages)).copied()
    }
}
