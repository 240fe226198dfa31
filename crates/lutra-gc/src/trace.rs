//! Trace declarations and embedded-handle enumeration
//!
//! Managed types declare their embedded handle slots by implementing
//! [`Trace`]. The declaration is consumed two ways:
//!
//! - On the first construction of a class, a discovery pass records the byte
//!   offset of every visited slot that lies inside the payload. From then on
//!   the default enumerator walks `offsets × array elements` without calling
//!   user code.
//! - Container types (whose handles live in spilled storage such as a `Vec`
//!   buffer) set [`Trace::DYNAMIC_LAYOUT`] and are re-traced on every
//!   enumeration instead.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, LinkedList, VecDeque};
use std::marker::PhantomData;
use std::ops::Range;
use std::ptr::NonNull;

use parking_lot::RwLockReadGuard;

use crate::handle::{Gc, GcAny, HandleBase};

/// Declares the handle slots embedded in a managed value.
///
/// Implementations must visit every [`Gc`]/[`GcAny`] slot owned by `self`
/// (including `None` option slots, whose addresses still take part in offset
/// discovery) and nothing else. Visiting a slot the value does not own would
/// let the collector treat a genuine root as an embedded handle and reclaim
/// its referent while it is still reachable.
///
/// Leaf types implement this with an empty body.
pub trait Trace {
    /// True when embedded handles live outside the payload interval
    /// (containers with spilled storage). Such types are enumerated through
    /// [`Trace::trace`] on every visit instead of the recorded offsets.
    const DYNAMIC_LAYOUT: bool = false;

    /// Visit every embedded handle slot.
    fn trace(&self, visitor: &mut Visitor<'_>);
}

/// Receives handle slots from [`Trace::trace`].
///
/// The visitor is single-use and its mode is chosen by the collector; trace
/// implementations only forward their slots.
pub struct Visitor<'a> {
    kind: VisitorKind<'a>,
}

enum VisitorKind<'a> {
    /// Offset discovery over the first element of a new class: record the
    /// payload-relative offset of every in-payload slot.
    Discover {
        elem: Range<usize>,
        offsets: &'a mut Vec<usize>,
    },
    /// Enumeration: collect the registration records behind the slots.
    Collect {
        slots: &'a mut Vec<NonNull<HandleBase>>,
    },
}

impl<'a> Visitor<'a> {
    pub(crate) fn discover(elem: Range<usize>, offsets: &'a mut Vec<usize>) -> Self {
        Self {
            kind: VisitorKind::Discover { elem, offsets },
        }
    }

    pub(crate) fn collect(slots: &'a mut Vec<NonNull<HandleBase>>) -> Self {
        Self {
            kind: VisitorKind::Collect { slots },
        }
    }

    /// Visit a handle slot.
    pub fn visit<T: Trace + 'static>(&mut self, handle: &Gc<T>) {
        self.slot(handle as *const Gc<T> as usize, Some(handle.base_ptr()));
    }

    /// Visit a type-erased handle slot.
    pub fn visit_any(&mut self, handle: &GcAny) {
        self.slot(handle as *const GcAny as usize, Some(handle.base_ptr()));
    }

    /// Visit an optional handle slot. `None` slots still participate in
    /// offset discovery.
    pub fn visit_opt<T: Trace + 'static>(&mut self, slot: &Option<Gc<T>>) {
        self.slot(
            slot as *const Option<Gc<T>> as usize,
            slot.as_ref().map(Gc::base_ptr),
        );
    }

    /// Visit an optional type-erased handle slot.
    pub fn visit_opt_any(&mut self, slot: &Option<GcAny>) {
        self.slot(
            slot as *const Option<GcAny> as usize,
            slot.as_ref().map(GcAny::base_ptr),
        );
    }

    fn slot(&mut self, addr: usize, record: Option<NonNull<HandleBase>>) {
        match &mut self.kind {
            VisitorKind::Discover { elem, offsets } => {
                if elem.contains(&addr) {
                    offsets.push(addr - elem.start);
                }
            }
            VisitorKind::Collect { slots } => {
                if let Some(record) = record {
                    slots.push(record);
                }
            }
        }
    }
}

/// Fresh, single-pass stream over the handles embedded in one object.
///
/// Produced per use by [`ClassDescriptor::enumerate`]; not restartable.
///
/// [`ClassDescriptor::enumerate`]: crate::class::ClassDescriptor::enumerate
pub struct PointerEnumerator {
    inner: EnumeratorInner,
}

enum EnumeratorInner {
    Empty,
    Offsets(OffsetWalk),
    Snapshot(std::vec::IntoIter<NonNull<HandleBase>>),
}

/// Default enumerator: walks the class's recorded offsets over every array
/// element.
struct OffsetWalk {
    base: *mut u8,
    elem_size: usize,
    len: usize,
    offsets: RwLockReadGuard<'static, Vec<usize>>,
    elem_idx: usize,
    offset_idx: usize,
}

impl PointerEnumerator {
    pub(crate) fn empty() -> Self {
        Self {
            inner: EnumeratorInner::Empty,
        }
    }

    pub(crate) fn offsets(
        base: *mut u8,
        elem_size: usize,
        len: usize,
        offsets: RwLockReadGuard<'static, Vec<usize>>,
    ) -> Self {
        Self {
            inner: EnumeratorInner::Offsets(OffsetWalk {
                base,
                elem_size,
                len,
                offsets,
                elem_idx: 0,
                offset_idx: 0,
            }),
        }
    }

    pub(crate) fn snapshot(slots: Vec<NonNull<HandleBase>>) -> Self {
        Self {
            inner: EnumeratorInner::Snapshot(slots.into_iter()),
        }
    }
}

impl Iterator for PointerEnumerator {
    type Item = NonNull<HandleBase>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            EnumeratorInner::Empty => None,
            EnumeratorInner::Offsets(walk) => walk.next(),
            EnumeratorInner::Snapshot(iter) => iter.next(),
        }
    }
}

impl Iterator for OffsetWalk {
    type Item = NonNull<HandleBase>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.elem_idx >= self.len {
                return None;
            }
            if self.offset_idx >= self.offsets.len() {
                self.offset_idx = 0;
                self.elem_idx += 1;
                continue;
            }
            let at = self.elem_idx * self.elem_size + self.offsets[self.offset_idx];
            self.offset_idx += 1;
            // SAFETY: `base` points at a live payload of `len` elements, and
            // every recorded offset was observed at a handle slot; both
            // `Gc<T>` and `Option<Gc<T>>` slots read as an optional record
            // pointer (null meaning an empty option slot).
            let record = unsafe {
                (self.base.add(at) as *const Option<NonNull<HandleBase>>).read()
            };
            if let Some(record) = record {
                return Some(record);
            }
        }
    }
}

macro_rules! leaf_trace {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Trace for $ty {
                fn trace(&self, _visitor: &mut Visitor<'_>) {}
            }
        )*
    };
}

leaf_trace!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
);

impl<T> Trace for PhantomData<T> {
    fn trace(&self, _visitor: &mut Visitor<'_>) {}
}

impl<T: Trace> Trace for Vec<T> {
    const DYNAMIC_LAYOUT: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for VecDeque<T> {
    const DYNAMIC_LAYOUT: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for LinkedList<T> {
    const DYNAMIC_LAYOUT: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for Box<T> {
    const DYNAMIC_LAYOUT: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        (**self).trace(visitor);
    }
}

impl<K: 'static, V: Trace> Trace for BTreeMap<K, V> {
    const DYNAMIC_LAYOUT: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        for value in self.values() {
            value.trace(visitor);
        }
    }
}

impl<T: Trace> Trace for BTreeSet<T> {
    const DYNAMIC_LAYOUT: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

impl<K: 'static, V: Trace, S: 'static> Trace for HashMap<K, V, S> {
    const DYNAMIC_LAYOUT: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        for value in self.values() {
            value.trace(visitor);
        }
    }
}

/// Mutable borrows must not be held across a `gc_collect` call: enumeration
/// borrows the cell and will panic on a conflict rather than skip contents.
impl<T: Trace> Trace for RefCell<T> {
    const DYNAMIC_LAYOUT: bool = true;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.borrow().trace(visitor);
    }
}

impl<T: Trace, const N: usize> Trace for [T; N] {
    const DYNAMIC_LAYOUT: bool = T::DYNAMIC_LAYOUT;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        for item in self {
            item.trace(visitor);
        }
    }
}

impl<A: Trace, B: Trace> Trace for (A, B) {
    const DYNAMIC_LAYOUT: bool = A::DYNAMIC_LAYOUT || B::DYNAMIC_LAYOUT;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.0.trace(visitor);
        self.1.trace(visitor);
    }
}

impl<A: Trace, B: Trace, C: Trace> Trace for (A, B, C) {
    const DYNAMIC_LAYOUT: bool = A::DYNAMIC_LAYOUT || B::DYNAMIC_LAYOUT || C::DYNAMIC_LAYOUT;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.0.trace(visitor);
        self.1.trace(visitor);
        self.2.trace(visitor);
    }
}
