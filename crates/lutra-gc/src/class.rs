//! Per-type class metadata and the global class registry
//!
//! A [`ClassDescriptor`] exists once per managed payload type and is pinned
//! for the lifetime of the process. It carries the element layout, the
//! capability functions the collector needs (destructor, trace), and the
//! byte offsets at which handles are embedded in one element.
//!
//! Offsets are learned by observation: the first successful construction of
//! a class runs the type's trace over the fresh payload and records every
//! slot that falls inside it. After that the descriptor is frozen.

use std::alloc::Layout;
use std::any::{TypeId, type_name};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};
use rustc_hash::FxHashMap;

use crate::error::GcError;
use crate::object::ObjectHeader;
use crate::trace::{PointerEnumerator, Trace, Visitor};

/// Drops one payload element in place.
pub type DropFn = unsafe fn(*mut u8);

/// Runs a type's trace over one payload element.
pub type TraceFn = unsafe fn(*const u8, &mut Visitor<'_>);

/// Registration state of a class descriptor.
///
/// Transitions `Unregistered → Registered` exactly once, on the first
/// successful construction of the class; the offset list is immutable
/// afterwards.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassState {
    /// No object of this class has finished construction yet.
    Unregistered = 0,
    /// Offset list frozen.
    Registered = 1,
}

/// Per-type metadata shared by every allocation of that type.
pub struct ClassDescriptor {
    /// Payload type, for checked downcasts.
    type_id: TypeId,
    /// Payload type name, for diagnostics only.
    type_name: &'static str,
    /// Layout of one payload element.
    elem_layout: Layout,
    /// Byte offset of the payload from the start of the allocation.
    payload_offset: usize,
    /// Whether elements have drop glue; lets `destroy` skip the drop loop.
    needs_drop: bool,
    /// Whether embedded handles live outside the payload (containers) and
    /// must be re-enumerated through the trace on every visit.
    dynamic_layout: bool,
    drop_fn: DropFn,
    trace_fn: TraceFn,
    /// Observed embedded-handle offsets, strictly ascending once frozen.
    sub_handle_offsets: RwLock<Vec<usize>>,
    state: AtomicU8,
}

impl ClassDescriptor {
    /// Get (or lazily create) the descriptor for `T`.
    pub fn get<T: Trace + 'static>() -> &'static ClassDescriptor {
        let registry = REGISTRY.get_or_init(|| RwLock::new(FxHashMap::default()));
        let id = TypeId::of::<T>();
        if let Some(desc) = registry.read().get(&id) {
            return desc;
        }
        let mut map = registry.write();
        // Descriptors are leaked: one bounded allocation per managed type,
        // alive for the rest of the process.
        *map.entry(id)
            .or_insert_with(|| &*Box::leak(Box::new(Self::new_for::<T>())))
    }

    fn new_for<T: Trace + 'static>() -> ClassDescriptor {
        let elem_layout = Layout::new::<T>();
        let (_, payload_offset) = Layout::new::<ObjectHeader>()
            .extend(elem_layout)
            .expect("payload layout overflow");
        ClassDescriptor {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            elem_layout,
            payload_offset,
            needs_drop: std::mem::needs_drop::<T>(),
            dynamic_layout: T::DYNAMIC_LAYOUT,
            drop_fn: drop_value::<T>,
            trace_fn: trace_value::<T>,
            sub_handle_offsets: RwLock::new(Vec::new()),
            state: AtomicU8::new(ClassState::Unregistered as u8),
        }
    }

    /// Payload type id.
    #[inline]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Payload type name (diagnostics only).
    #[inline]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Size of one payload element in bytes.
    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_layout.size()
    }

    /// Byte offset of the payload from the allocation base.
    #[inline]
    pub(crate) fn payload_offset(&self) -> usize {
        self.payload_offset
    }

    #[inline]
    pub(crate) fn needs_drop(&self) -> bool {
        self.needs_drop
    }

    #[inline]
    pub(crate) fn drop_fn(&self) -> DropFn {
        self.drop_fn
    }

    /// Current registration state.
    #[inline]
    pub fn state(&self) -> ClassState {
        match self.state.load(Ordering::Acquire) {
            1 => ClassState::Registered,
            _ => ClassState::Unregistered,
        }
    }

    fn mark_registered(&self) {
        self.state.store(ClassState::Registered as u8, Ordering::Release);
    }

    /// Observed embedded-handle offsets of one element.
    pub fn sub_handle_offsets(&'static self) -> RwLockReadGuard<'static, Vec<usize>> {
        self.sub_handle_offsets.read()
    }

    /// Record one embedded-handle offset during observational discovery.
    ///
    /// Ignored once the class is registered, and ignored when `offset` is
    /// not strictly greater than the last recorded offset (a re-entrant
    /// construction has already recorded it).
    pub(crate) fn register_sub_handle(&self, offset: usize) {
        if self.state() == ClassState::Registered {
            return;
        }
        let mut offsets = self.sub_handle_offsets.write();
        if offsets.last().is_some_and(|last| offset <= *last) {
            return;
        }
        offsets.push(offset);
    }

    /// Learn the embedded-handle layout from the first fully-constructed
    /// object of this class, then freeze the descriptor.
    ///
    /// Container classes spill their handles outside the payload; they skip
    /// the probe and are enumerated through their trace instead. A
    /// zero-length construction observes nothing and leaves the class
    /// unregistered, so a later non-empty construction still gets probed.
    pub(crate) fn observe_first_construction(&'static self, header: &ObjectHeader) {
        if self.state() == ClassState::Registered {
            return;
        }
        if header.array_len() == 0 {
            return;
        }
        if !self.dynamic_layout {
            let base = header.payload_start();
            let elem = base as usize..base as usize + self.elem_size();
            let mut found = Vec::new();
            {
                let mut visitor = Visitor::discover(elem, &mut found);
                // SAFETY: the payload's first element is fully initialized.
                unsafe { (self.trace_fn)(base, &mut visitor) };
            }
            // Trace order is the implementor's choice, not address order.
            found.sort_unstable();
            found.dedup();
            for offset in found {
                self.register_sub_handle(offset);
            }
        }
        self.mark_registered();
    }

    /// Fresh single-pass enumerator over the handles embedded in `header`'s
    /// payload.
    pub(crate) fn enumerate(&'static self, header: &ObjectHeader) -> PointerEnumerator {
        let len = header.array_len();
        if len == 0 {
            return PointerEnumerator::empty();
        }
        let base = header.payload_start();
        if self.dynamic_layout {
            let mut slots = Vec::new();
            {
                let mut visitor = Visitor::collect(&mut slots);
                for i in 0..len {
                    // SAFETY: all `len` elements are initialized while the
                    // header is live.
                    unsafe { (self.trace_fn)(base.add(i * self.elem_size()), &mut visitor) };
                }
            }
            PointerEnumerator::snapshot(slots)
        } else {
            let offsets = self.sub_handle_offsets();
            if offsets.is_empty() {
                return PointerEnumerator::empty();
            }
            PointerEnumerator::offsets(base, self.elem_size(), len, offsets)
        }
    }

    /// Layout of a whole allocation (header plus `count` elements).
    pub(crate) fn allocation_layout(&self, count: usize) -> Result<Layout, GcError> {
        let overflow = || GcError::SizeOverflow {
            count,
            elem_size: self.elem_layout.size(),
        };
        let bytes = self
            .elem_layout
            .size()
            .checked_mul(count)
            .ok_or_else(overflow)?;
        let payload =
            Layout::from_size_align(bytes, self.elem_layout.align()).map_err(|_| overflow())?;
        let (total, offset) = Layout::new::<ObjectHeader>()
            .extend(payload)
            .map_err(|_| overflow())?;
        debug_assert_eq!(offset, self.payload_offset);
        Ok(total.pad_to_align())
    }
}

/// `TypeId → descriptor` registry. Descriptors are leaked, so lookups hand
/// out `&'static` references without holding the lock.
static REGISTRY: OnceLock<RwLock<FxHashMap<TypeId, &'static ClassDescriptor>>> = OnceLock::new();

unsafe fn drop_value<T>(ptr: *mut u8) {
    // SAFETY: caller passes a pointer to an initialized `T`.
    unsafe { std::ptr::drop_in_place(ptr as *mut T) }
}

unsafe fn trace_value<T: Trace>(ptr: *const u8, visitor: &mut Visitor<'_>) {
    // SAFETY: caller passes a pointer to an initialized `T`.
    unsafe { (*(ptr as *const T)).trace(visitor) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_returns_one_descriptor_per_type() {
        let a = ClassDescriptor::get::<u32>();
        let b = ClassDescriptor::get::<u32>();
        assert!(std::ptr::eq(a, b));
        assert_ne!(
            ClassDescriptor::get::<i8>().type_id(),
            ClassDescriptor::get::<u32>().type_id()
        );
    }

    #[test]
    fn offsets_stay_strictly_ascending() {
        // A dedicated local type so the descriptor is untouched by other
        // tests.
        struct Probe;
        impl Trace for Probe {
            fn trace(&self, _visitor: &mut Visitor<'_>) {}
        }

        let desc = ClassDescriptor::get::<Probe>();
        desc.register_sub_handle(8);
        desc.register_sub_handle(8); // re-entrant duplicate, dropped
        desc.register_sub_handle(4); // out of order, dropped
        desc.register_sub_handle(24);
        assert_eq!(&*desc.sub_handle_offsets(), &[8, 24]);
    }

    #[test]
    fn registered_class_ignores_late_offsets() {
        struct Frozen;
        impl Trace for Frozen {
            fn trace(&self, _visitor: &mut Visitor<'_>) {}
        }

        let desc = ClassDescriptor::get::<Frozen>();
        desc.register_sub_handle(16);
        desc.mark_registered();
        assert_eq!(desc.state(), ClassState::Registered);
        desc.register_sub_handle(32);
        assert_eq!(&*desc.sub_handle_offsets(), &[16]);
    }

    #[test]
    fn allocation_layout_rejects_overflow() {
        let desc = ClassDescriptor::get::<u64>();
        assert!(desc.allocation_layout(usize::MAX / 4).is_err());
        assert!(desc.allocation_layout(4).is_ok());
    }
}
