//! Central free lists, one per size class.
//!
//! Each list owns the carved spans of its class and an intrusive
//! freelist of slots inside them. Thread caches move slots in and out in
//! batches; a span whose slots are all free is detached and returned to
//! the page heap.
//!
//! Lists only serve the default locality pool. Hinted allocations bypass
//! the size-class machinery entirely so that hot and cold objects never
//! share a span with unhinted ones.
//!
//! Lock order: a central list mutex may be held while calling into the
//! page heap, never the other way around.

use std::collections::BTreeMap;
use std::ptr;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::page_heap::{self, SpanKind};
use crate::size_class::{class_to_pages, class_to_size, objects_per_span, NUM_CLASSES};
use crate::span::{page_of, Locality, PageId};

/// Slot bookkeeping for one carved span.
struct SpanSlots {
    pages: usize,
    free_head: *mut u8,
    free_count: u32,
    total: u32,
}

// Raw slot pointers are only dereferenced under the owning list's mutex.
unsafe impl Send for SpanSlots {}

struct CentralList {
    class: usize,
    spans: BTreeMap<PageId, SpanSlots>,
    /// Bases of spans with at least one free slot.
    nonempty: Vec<PageId>,
}

impl CentralList {
    fn new(class: usize) -> Self {
        Self {
            class,
            spans: BTreeMap::new(),
            nonempty: Vec::new(),
        }
    }

    /// Carves a fresh span into slots and threads the freelist through
    /// them. Returns `false` when the page heap is out of memory.
    fn grow(&mut self) -> bool {
        let class = self.class;
        let Some(span) = page_heap::new_span(
            class_to_pages(class),
            Locality::Default,
            SpanKind::Carved { class },
        ) else {
            return false;
        };

        let slot = class_to_size(class);
        let total = objects_per_span(class);
        let base = span.base_addr() as *mut u8;
        let mut head = ptr::null_mut();
        for i in (0..total).rev() {
            // SAFETY: i * slot < span length and every slot is at least
            // pointer-aligned, so the link write stays in bounds.
            unsafe {
                let p = base.add(i * slot);
                p.cast::<*mut u8>().write(head);
                head = p;
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        self.spans.insert(
            span.base,
            SpanSlots {
                pages: span.pages,
                free_head: head,
                free_count: total as u32,
                total: total as u32,
            },
        );
        self.nonempty.push(span.base);
        true
    }

    fn fetch(&mut self, out: &mut [*mut u8]) -> usize {
        let mut filled = 0;
        while filled < out.len() {
            let Some(&base) = self.nonempty.last() else {
                if !self.grow() {
                    break;
                }
                continue;
            };
            let slots = self.spans.get_mut(&base).expect("nonempty span missing");
            while filled < out.len() && slots.free_count > 0 {
                let p = slots.free_head;
                // SAFETY: free slots carry the next-slot link in their
                // first word, written by grow or return_batch.
                slots.free_head = unsafe { p.cast::<*mut u8>().read() };
                slots.free_count -= 1;
                out[filled] = p;
                filled += 1;
            }
            if slots.free_count == 0 {
                self.nonempty.pop();
            }
        }
        filled
    }

    /// # Safety
    ///
    /// Every pointer must be a slot of this class, currently allocated,
    /// and not passed twice.
    unsafe fn return_batch(&mut self, ptrs: &[*mut u8]) {
        for &p in ptrs {
            let page = page_of(p as usize);
            let (&base, slots) = self
                .spans
                .range_mut(..=page)
                .next_back()
                .expect("slot outside any span of this class");
            debug_assert!(page < base + slots.pages, "slot outside owning span");

            // SAFETY: the slot is free from here on; reuse its first word
            // as the freelist link.
            unsafe { p.cast::<*mut u8>().write(slots.free_head) };
            if slots.free_count == 0 {
                self.nonempty.push(base);
            }
            slots.free_head = p;
            slots.free_count += 1;

            if slots.free_count == slots.total {
                self.spans.remove(&base);
                self.nonempty.retain(|&b| b != base);
                page_heap::delete_span(base);
            }
        }
    }
}

fn lists() -> &'static [Mutex<CentralList>] {
    static LISTS: OnceLock<Box<[Mutex<CentralList>]>> = OnceLock::new();
    LISTS.get_or_init(|| {
        (0..NUM_CLASSES)
            .map(|class| Mutex::new(CentralList::new(class)))
            .collect()
    })
}

/// Moves up to `out.len()` free slots of `class` into `out`, growing
/// from the page heap as needed. Returns how many were written; 0 means
/// out of memory.
pub fn fetch(class: usize, out: &mut [*mut u8]) -> usize {
    lists()[class].lock().fetch(out)
}

/// Returns a batch of slots to their class.
///
/// # Safety
///
/// Every pointer must have been fetched from `class` and not freed
/// since.
pub unsafe fn return_batch(class: usize, ptrs: &[*mut u8]) {
    // SAFETY: forwarded contract.
    unsafe { lists()[class].lock().return_batch(ptrs) };
}
