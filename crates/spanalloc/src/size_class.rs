//! Size class table.
//!
//! Small requests are rounded up to one of a fixed set of slot sizes and
//! served from carved spans. The table is generated at compile time with
//! a bounded-waste growth rule: consecutive classes grow by roughly an
//! eighth, so no more than ~12.5% of a slot is ever wasted by rounding.
//!
//! Dispatch is constant time through two precomputed bucket arrays, one
//! with 16-byte granularity for requests up to 1 KiB and one with
//! 128-byte granularity above that. Every class above 1 KiB is a multiple
//! of 128, so the coarse buckets map exactly onto class boundaries.

/// Logical page shift. All spans are managed in 8 KiB pages.
pub const PAGE_SHIFT: usize = 13;

/// Logical page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Platform maximum required alignment. Every slot size is a multiple of
/// this, so every carved slot satisfies it for free.
pub const MIN_ALIGN: usize = 16;

/// Largest request served from a size class. Anything bigger goes to the
/// page-granular path.
pub const MAX_SMALL_SIZE: usize = 256 * 1024;

/// Classes at or below this size step in `MIN_ALIGN` increments.
const SMALL_STEP_LIMIT: usize = 1024;

/// Step granularity for classes above `SMALL_STEP_LIMIT`.
const LARGE_STEP: usize = 128;

const fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

const fn next_slot(slot: usize) -> usize {
    let grown = slot + slot / 8;
    if grown <= SMALL_STEP_LIMIT {
        align_up(grown, MIN_ALIGN)
    } else {
        align_up(grown, LARGE_STEP)
    }
}

const fn count_classes() -> usize {
    let mut slot = MIN_ALIGN;
    let mut n = 1;
    while slot < MAX_SMALL_SIZE {
        slot = next_slot(slot);
        if slot > MAX_SMALL_SIZE {
            slot = MAX_SMALL_SIZE;
        }
        n += 1;
    }
    n
}

/// Number of size classes.
pub const NUM_CLASSES: usize = count_classes();

// The bucket index arrays store class ids as u8.
const _: () = assert!(NUM_CLASSES <= u8::MAX as usize);

const fn build_slot_sizes() -> [usize; NUM_CLASSES] {
    let mut out = [0usize; NUM_CLASSES];
    let mut slot = MIN_ALIGN;
    let mut i = 0;
    while i < NUM_CLASSES {
        out[i] = slot;
        i += 1;
        slot = next_slot(slot);
        if slot > MAX_SMALL_SIZE {
            slot = MAX_SMALL_SIZE;
        }
    }
    out
}

const SLOT_SIZES: [usize; NUM_CLASSES] = build_slot_sizes();

/// Picks the span length for a slot size: the smallest page count whose
/// trailing waste is at most an eighth of the span. `k >= 8*slot/PAGE`
/// always satisfies the bound, so the search terminates.
const fn span_pages_for(slot: usize) -> usize {
    let mut pages = if slot > PAGE_SIZE {
        slot >> PAGE_SHIFT
    } else {
        1
    };
    loop {
        let span = pages << PAGE_SHIFT;
        if span >= slot && span % slot <= span / 8 {
            return pages;
        }
        pages += 1;
    }
}

const fn build_span_pages() -> [usize; NUM_CLASSES] {
    let mut out = [0usize; NUM_CLASSES];
    let mut i = 0;
    while i < NUM_CLASSES {
        out[i] = span_pages_for(SLOT_SIZES[i]);
        i += 1;
    }
    out
}

const SPAN_PAGES: [usize; NUM_CLASSES] = build_span_pages();

/// Smallest class whose slot holds `size` bytes, by linear scan. Only
/// used at compile time to build the bucket arrays.
const fn class_ge(size: usize) -> u8 {
    let mut i = 0;
    while i < NUM_CLASSES {
        if SLOT_SIZES[i] >= size {
            #[allow(clippy::cast_possible_truncation)]
            return i as u8;
        }
        i += 1;
    }
    unreachable!()
}

const SMALL_BUCKETS: usize = SMALL_STEP_LIMIT / MIN_ALIGN + 1;
const LARGE_BUCKETS: usize = MAX_SMALL_SIZE / LARGE_STEP + 1;

const fn build_index_small() -> [u8; SMALL_BUCKETS] {
    let mut out = [0u8; SMALL_BUCKETS];
    let mut b = 1;
    while b < SMALL_BUCKETS {
        out[b] = class_ge(b * MIN_ALIGN);
        b += 1;
    }
    out
}

const fn build_index_large() -> [u8; LARGE_BUCKETS] {
    let mut out = [0u8; LARGE_BUCKETS];
    let mut b = SMALL_STEP_LIMIT / LARGE_STEP + 1;
    while b < LARGE_BUCKETS {
        out[b] = class_ge(b * LARGE_STEP);
        b += 1;
    }
    out
}

const INDEX_SMALL: [u8; SMALL_BUCKETS] = build_index_small();
const INDEX_LARGE: [u8; LARGE_BUCKETS] = build_index_large();

/// Maps a request to its size class.
///
/// Returns `None` when the size exceeds [`MAX_SMALL_SIZE`], the
/// alignment exceeds [`PAGE_SIZE`], or no class slot is a multiple of
/// the requested alignment; the caller falls back to the page-granular
/// path. Zero-byte requests map like one byte.
#[inline]
#[must_use]
pub fn class_for(size: usize, align: usize) -> Option<usize> {
    if size > MAX_SMALL_SIZE {
        return None;
    }
    let size = if size == 0 { 1 } else { size };
    let class = if size <= SMALL_STEP_LIMIT {
        INDEX_SMALL[(size + MIN_ALIGN - 1) / MIN_ALIGN] as usize
    } else {
        INDEX_LARGE[(size + LARGE_STEP - 1) / LARGE_STEP] as usize
    };
    if align <= MIN_ALIGN {
        return Some(class);
    }
    if align > PAGE_SIZE {
        // Span bases are only page-aligned, so no slot layout can
        // guarantee stronger alignment. The caller takes a dedicated
        // over-aligned span instead.
        return None;
    }
    // Over-aligned small request: take the next class whose slot is a
    // multiple of the alignment. Slots are laid out back to back from a
    // page-aligned base, so for alignments dividing the page size,
    // slot % align == 0 makes every slot aligned.
    let mut c = class;
    while c < NUM_CLASSES {
        if SLOT_SIZES[c] % align == 0 {
            return Some(c);
        }
        c += 1;
    }
    None
}

/// Slot size of a class.
#[inline]
#[must_use]
pub const fn class_to_size(class: usize) -> usize {
    SLOT_SIZES[class]
}

/// Pages backing one span of a class.
#[inline]
#[must_use]
pub const fn class_to_pages(class: usize) -> usize {
    SPAN_PAGES[class]
}

/// Slots carved out of one span of a class.
#[inline]
#[must_use]
pub const fn objects_per_span(class: usize) -> usize {
    (SPAN_PAGES[class] << PAGE_SHIFT) / SLOT_SIZES[class]
}
