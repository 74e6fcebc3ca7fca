//! Structured tracing support.
//!
//! When the `tracing` feature is enabled, this module emits events for
//! span creation, release-to-system and sampling decisions. With the
//! feature disabled every shim compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use crate::span::Locality;
    use tracing::{debug, trace};

    /// Log a span obtained from the page heap.
    pub fn trace_new_span(pages: usize, locality: Locality, fresh_chunk: bool) {
        trace!(pages, ?locality, fresh_chunk, "new_span");
    }

    /// Log a span returned to the page heap.
    pub fn trace_delete_span(pages: usize) {
        trace!(pages, "delete_span");
    }

    /// Log pages returned to the operating system.
    pub fn trace_release(bytes: usize, target: usize) {
        debug!(bytes, target, "release_to_system");
    }

    /// Log an allocation picked by the sampling profiler.
    pub fn trace_sample(requested: usize, guarded: bool) {
        trace!(requested, guarded, "sampled_allocation");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    use crate::span::Locality;

    /// Stub when tracing is disabled.
    #[inline]
    pub fn trace_new_span(_pages: usize, _locality: Locality, _fresh_chunk: bool) {}

    /// Stub when tracing is disabled.
    #[inline]
    pub fn trace_delete_span(_pages: usize) {}

    /// Stub when tracing is disabled.
    #[inline]
    pub fn trace_release(_bytes: usize, _target: usize) {}

    /// Stub when tracing is disabled.
    #[inline]
    pub fn trace_sample(_requested: usize, _guarded: bool) {}
}
