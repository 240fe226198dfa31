//! Per-allocation object header

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::class::ClassDescriptor;

/// Mark color for tri-color marking.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkColor {
    /// Not yet visited
    White = 0,
    /// In worklist
    Gray = 1,
    /// Fully scanned
    Black = 2,
}

/// Header placed at the front of every managed allocation.
///
/// Layout of an allocation: `| ObjectHeader | padding | payload |`, with the
/// payload holding `alloc_len` contiguous elements of the header's class.
/// The header outlives explicit destruction of the payload: `destroy` runs
/// the element destructors and zeroes `array_length`, while the memory block
/// itself is only released by the sweep phase (or collector teardown).
#[repr(C)]
pub struct ObjectHeader {
    /// Class of the payload elements.
    klass: &'static ClassDescriptor,
    /// Number of live elements. Zero once the payload has been destroyed.
    array_length: Cell<usize>,
    /// Element count the block was allocated with. Never changes; needed to
    /// reconstruct the allocation layout when the block is released.
    alloc_len: usize,
    /// Mark bits for tri-color marking (White=0, Gray=1, Black=2).
    color: AtomicU8,
}

impl ObjectHeader {
    /// Create a header for a fresh allocation of `len` elements.
    pub(crate) fn new(klass: &'static ClassDescriptor, len: usize) -> Self {
        Self {
            klass,
            array_length: Cell::new(len),
            alloc_len: len,
            color: AtomicU8::new(MarkColor::White as u8),
        }
    }

    /// Class descriptor of the payload elements.
    #[inline]
    pub fn class(&self) -> &'static ClassDescriptor {
        self.klass
    }

    /// Number of live payload elements. Zero after explicit destruction.
    #[inline]
    pub fn array_len(&self) -> usize {
        self.array_length.get()
    }

    /// True once the payload destructors have run.
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.array_length.get() == 0
    }

    /// Element count the block was allocated with.
    #[inline]
    pub(crate) fn alloc_len(&self) -> usize {
        self.alloc_len
    }

    /// Current mark color.
    #[inline]
    pub fn color(&self) -> MarkColor {
        match self.color.load(Ordering::Acquire) {
            1 => MarkColor::Gray,
            2 => MarkColor::Black,
            _ => MarkColor::White,
        }
    }

    /// Set the mark color.
    #[inline]
    pub fn set_color(&self, color: MarkColor) {
        self.color.store(color as u8, Ordering::Release);
    }

    /// Address of the first payload byte.
    #[inline]
    pub fn payload_start(&self) -> *mut u8 {
        let base = self as *const ObjectHeader as *mut u8;
        // SAFETY: header and payload live in one allocation; the offset was
        // part of the allocation layout.
        unsafe { base.add(self.klass.payload_offset()) }
    }

    /// Byte length of the live payload interval.
    #[inline]
    pub fn payload_bytes(&self) -> usize {
        self.klass.elem_size() * self.array_length.get()
    }

    /// Whether `addr` lies inside the live payload interval.
    ///
    /// The interval is half-open; a destroyed or zero-length payload
    /// contains nothing.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.payload_start() as usize;
        addr >= start && addr < start + self.payload_bytes()
    }

    /// Run the element destructors and mark the payload dead.
    ///
    /// Idempotent: a second call observes `array_length == 0` and returns.
    /// The header stays in the collector's live set until swept.
    pub(crate) fn destroy(&self) {
        let len = self.array_length.get();
        if len == 0 {
            return;
        }
        // Zero the length before running destructors so re-entrant
        // destruction through another handle is a no-op.
        self.array_length.set(0);
        if !self.klass.needs_drop() {
            return;
        }
        let elem_size = self.klass.elem_size();
        let drop_fn = self.klass.drop_fn();
        let base = self.payload_start();
        for i in 0..len {
            // SAFETY: the payload held `len` initialized elements and the
            // length has been zeroed, so each element is dropped once.
            unsafe { drop_fn(base.add(i * elem_size)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_roundtrip() {
        let klass = ClassDescriptor::get::<u64>();
        let header = ObjectHeader::new(klass, 1);
        assert_eq!(header.color(), MarkColor::White);

        header.set_color(MarkColor::Gray);
        assert_eq!(header.color(), MarkColor::Gray);

        header.set_color(MarkColor::Black);
        assert_eq!(header.color(), MarkColor::Black);
    }

    #[test]
    fn zero_length_header_is_born_destroyed() {
        let klass = ClassDescriptor::get::<u64>();
        let header = ObjectHeader::new(klass, 0);
        assert!(header.is_destroyed());
        assert_eq!(header.payload_bytes(), 0);
        // No elements to drop; must not touch the (nonexistent) payload.
        header.destroy();
        assert!(header.is_destroyed());
    }
}
