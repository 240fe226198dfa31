//! Error types for allocation entry points

use std::alloc::Layout;

/// Errors surfaced by the fallible allocation entry points.
///
/// Explicit destruction of an already-destroyed object and raw-pointer
/// lookups that miss the heap are not errors: the former is a silent no-op,
/// the latter yields a null handle.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// The underlying allocator returned null.
    #[error("allocation of {} bytes failed", .layout.size())]
    AllocationFailed {
        /// Layout of the failed request (header plus payload).
        layout: Layout,
    },

    /// The requested element count overflows the maximum allocation size.
    #[error("allocation size overflow for {count} elements of {elem_size} bytes")]
    SizeOverflow {
        /// Requested element count.
        count: usize,
        /// Size of one element in bytes.
        elem_size: usize,
    },
}
