//! Smart handles and their registration records
//!
//! A [`Gc<T>`] is a pointer-sized smart handle to a managed object. Every
//! live handle owns a heap-pinned [`HandleBase`] registration record, so the
//! collector's handle vector stays valid while handle values move freely
//! between stack slots, fields, and containers.
//!
//! A fresh handle is presumed to be a root. Handles that are embedded in a
//! managed object are demoted when the object finishes construction and,
//! for spilled container storage, lazily by the root-marking phase.

use std::any::TypeId;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::collector;
use crate::object::ObjectHeader;
use crate::trace::{Trace, Visitor};

/// Registration record of one live handle.
///
/// Records are heap-pinned: the collector refers to them by address and
/// tracks their position in its handle vector for O(1) unregistration.
pub struct HandleBase {
    /// Referenced object's header, if any.
    header: Cell<Option<NonNull<ObjectHeader>>>,
    /// Typed payload address the owning handle dereferences to. Null for a
    /// null handle or after a failed checked cast.
    payload: Cell<*mut u8>,
    /// Whether this handle is currently presumed to be a root.
    is_root: Cell<bool>,
    /// Position in the collector's handle vector, or `UNREGISTERED`.
    index: Cell<usize>,
}

/// Index value of a record that never made it into the handle vector
/// (created while the collector was being torn down).
pub(crate) const UNREGISTERED: usize = usize::MAX;

impl HandleBase {
    /// Allocate and register a record.
    fn alloc(header: Option<NonNull<ObjectHeader>>, payload: *mut u8) -> NonNull<HandleBase> {
        let record = NonNull::from(Box::leak(Box::new(HandleBase {
            header: Cell::new(header),
            payload: Cell::new(payload),
            is_root: Cell::new(true),
            index: Cell::new(UNREGISTERED),
        })));
        collector::register_handle(record);
        record
    }

    /// Unregister and free a record. Called exactly once, from the owning
    /// handle's drop.
    unsafe fn release(record: NonNull<HandleBase>) {
        collector::unregister_handle(record);
        // SAFETY: allocated in `alloc`, released once.
        drop(unsafe { Box::from_raw(record.as_ptr()) });
    }

    /// Referenced header, if any.
    #[inline]
    pub fn header(&self) -> Option<NonNull<ObjectHeader>> {
        self.header.get()
    }

    /// Whether the handle is currently presumed to be a root.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.is_root.get()
    }

    #[inline]
    pub(crate) fn payload(&self) -> *mut u8 {
        self.payload.get()
    }

    /// Demote the handle from root to embedded.
    #[inline]
    pub(crate) fn demote(&self) {
        self.is_root.set(false);
    }

    #[inline]
    pub(crate) fn index(&self) -> usize {
        self.index.get()
    }

    #[inline]
    pub(crate) fn set_index(&self, index: usize) {
        self.index.set(index);
    }

    /// Detach the record from its object (used by explicit destruction and
    /// failed construction rollback).
    #[inline]
    pub(crate) fn clear(&self) {
        self.header.set(None);
        self.payload.set(std::ptr::null_mut());
    }
}

/// Smart handle to a garbage-collected `T`.
///
/// Cloning a handle registers a new root presumption; dropping one
/// unregisters it. The handle never owns its referent exclusively; the
/// object lives for as long as it is reachable from any root.
///
/// Dereferencing a null handle, or one whose referent was explicitly
/// destroyed with [`gc_delete`], panics.
///
/// [`gc_delete`]: crate::gc_delete
#[repr(transparent)]
pub struct Gc<T: Trace + 'static> {
    base: NonNull<HandleBase>,
    _marker: PhantomData<*mut T>,
}

impl<T: Trace + 'static> Gc<T> {
    /// A handle referencing nothing.
    pub fn null() -> Self {
        Self::from_parts(None, std::ptr::null_mut())
    }

    pub(crate) fn from_parts(header: Option<NonNull<ObjectHeader>>, payload: *mut u8) -> Self {
        Gc {
            base: HandleBase::alloc(header, payload),
            _marker: PhantomData,
        }
    }

    /// Handle to the first element of `header`'s payload.
    pub(crate) fn from_header(header: NonNull<ObjectHeader>) -> Self {
        // SAFETY: the header is live for the duration of this call.
        let payload = unsafe { header.as_ref().payload_start() };
        Self::from_parts(Some(header), payload)
    }

    #[inline]
    pub(crate) fn base_ptr(&self) -> NonNull<HandleBase> {
        self.base
    }

    #[inline]
    fn base(&self) -> &HandleBase {
        // SAFETY: the record lives until this handle is dropped.
        unsafe { self.base.as_ref() }
    }

    /// Referenced object header, if any.
    pub fn header(&self) -> Option<&ObjectHeader> {
        // SAFETY: a referenced header is kept out of the sweeper's hands by
        // this very handle (directly as a root or through its owner).
        self.base().header().map(|h| unsafe { &*h.as_ptr() })
    }

    /// True when the handle references nothing (or a checked cast failed).
    #[inline]
    pub fn is_null(&self) -> bool {
        self.base().payload().is_null()
    }

    /// True when the referent's payload has been destroyed (or the handle is
    /// null).
    pub fn is_destroyed(&self) -> bool {
        match self.header() {
            Some(header) => header.is_destroyed(),
            None => true,
        }
    }

    /// Borrow the referent, or `None` for a null/destroyed handle.
    pub fn get(&self) -> Option<&T> {
        let payload = self.base().payload();
        if payload.is_null() || self.header().is_none_or(ObjectHeader::is_destroyed) {
            return None;
        }
        // SAFETY: live payload, typed at construction or cast check.
        Some(unsafe { &*(payload as *const T) })
    }

    /// Mutably borrow the referent.
    ///
    /// # Safety
    /// The caller must have exclusive access to the referent: no other
    /// borrow obtained through any handle to the same object may be alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        let payload = self.base().payload();
        assert!(
            !payload.is_null() && !self.is_destroyed(),
            "mutably borrowed a null or destroyed Gc handle"
        );
        // SAFETY: live payload; exclusivity is the caller's obligation.
        unsafe { &mut *(payload as *mut T) }
    }

    /// Raw pointer to the referent (null for a null handle).
    #[inline]
    pub fn as_ptr(&self) -> *const T {
        self.base().payload() as *const T
    }

    /// Number of array elements from this handle's position to the end of
    /// the referent's payload. Zero for null or destroyed handles, one for
    /// scalar objects.
    pub fn len(&self) -> usize {
        let payload = self.base().payload();
        match self.header() {
            Some(header) if !payload.is_null() && header.contains(payload as usize) => {
                let start = header.payload_start() as usize;
                let elem = header.class().elem_size();
                header.array_len() - (payload as usize - start) / elem
            }
            _ => 0,
        }
    }

    /// True when [`Gc::len`] is zero.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow the remaining array elements as a slice. Empty for null or
    /// destroyed handles.
    pub fn as_slice(&self) -> &[T] {
        let len = self.len();
        if len == 0 {
            return &[];
        }
        // SAFETY: `len` live elements follow the payload pointer.
        unsafe { std::slice::from_raw_parts(self.base().payload() as *const T, len) }
    }

    /// Reinterpret the referent as a `U` while keeping the same header.
    ///
    /// # Safety
    /// `U` must be layout- and validity-compatible with the stored payload
    /// at this handle's address.
    pub unsafe fn static_cast<U: Trace + 'static>(&self) -> Gc<U> {
        Gc::from_parts(self.base().header(), self.base().payload())
    }

    /// Checked cast to the concrete payload type `U`.
    ///
    /// On a type mismatch the returned handle keeps the header (so callers
    /// can still inspect it) but has a null payload and dereferences to
    /// nothing.
    pub fn dynamic_cast<U: Trace + 'static>(&self) -> Gc<U> {
        let header = self.base().header();
        let matches = self
            .header()
            .is_some_and(|h| h.class().type_id() == TypeId::of::<U>());
        let payload = if matches {
            self.base().payload()
        } else {
            std::ptr::null_mut()
        };
        Gc::from_parts(header, payload)
    }

    /// Erase the payload type while keeping the same referent.
    pub fn erase(&self) -> GcAny {
        GcAny::from_parts(self.base().header(), self.base().payload())
    }

    pub(crate) fn clear_record(&self) {
        self.base().clear();
    }
}

impl<T: Trace + 'static> Clone for Gc<T> {
    fn clone(&self) -> Self {
        Self::from_parts(self.base().header(), self.base().payload())
    }
}

impl<T: Trace + 'static> Drop for Gc<T> {
    fn drop(&mut self) {
        // SAFETY: `base` came out of `HandleBase::alloc` and each handle
        // drops exactly once.
        unsafe { HandleBase::release(self.base) }
    }
}

impl<T: Trace + 'static> Default for Gc<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Trace + 'static> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.get()
            .expect("dereferenced a null or destroyed Gc handle")
    }
}

/// Handle identity: two handles are equal when they reference the same
/// object (or are both null).
impl<T: Trace + 'static> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.base().header() == other.base().header()
    }
}

impl<T: Trace + 'static> Eq for Gc<T> {}

impl<T: Trace + 'static> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base().header() {
            Some(header) => write!(
                f,
                "Gc<{}>({:p})",
                std::any::type_name::<T>(),
                header.as_ptr()
            ),
            None => write!(f, "Gc<{}>(null)", std::any::type_name::<T>()),
        }
    }
}

impl<T: Trace + 'static> Trace for Gc<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit(self);
    }
}

impl<T: Trace + 'static> Trace for Option<Gc<T>> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit_opt(self);
    }
}

/// Type-erased smart handle.
///
/// Behaves like [`Gc<T>`] for reference tracking; the payload can be
/// recovered with [`GcAny::downcast`].
#[repr(transparent)]
pub struct GcAny {
    base: NonNull<HandleBase>,
    _marker: PhantomData<*mut ()>,
}

impl GcAny {
    pub(crate) fn from_parts(header: Option<NonNull<ObjectHeader>>, payload: *mut u8) -> Self {
        GcAny {
            base: HandleBase::alloc(header, payload),
            _marker: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn base_ptr(&self) -> NonNull<HandleBase> {
        self.base
    }

    #[inline]
    fn base(&self) -> &HandleBase {
        // SAFETY: the record lives until this handle is dropped.
        unsafe { self.base.as_ref() }
    }

    /// Referenced object header, if any.
    pub fn header(&self) -> Option<&ObjectHeader> {
        // SAFETY: as for `Gc::header`.
        self.base().header().map(|h| unsafe { &*h.as_ptr() })
    }

    /// True when the erased payload is a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.header()
            .is_some_and(|h| h.class().type_id() == TypeId::of::<T>())
    }

    /// Checked cast back to a typed handle; same semantics as
    /// [`Gc::dynamic_cast`].
    pub fn downcast<T: Trace + 'static>(&self) -> Gc<T> {
        let payload = if self.is::<T>() {
            self.base().payload()
        } else {
            std::ptr::null_mut()
        };
        Gc::from_parts(self.base().header(), payload)
    }

    /// Payload type name (diagnostics only); `None` for a null handle.
    pub fn type_name(&self) -> Option<&'static str> {
        self.header().map(|h| h.class().type_name())
    }

    pub(crate) fn payload(&self) -> *mut u8 {
        self.base().payload()
    }
}

impl Clone for GcAny {
    fn clone(&self) -> Self {
        Self::from_parts(self.base().header(), self.base().payload())
    }
}

impl Drop for GcAny {
    fn drop(&mut self) {
        // SAFETY: as for `Gc::drop`.
        unsafe { HandleBase::release(self.base) }
    }
}

impl PartialEq for GcAny {
    fn eq(&self, other: &Self) -> bool {
        self.base().header() == other.base().header()
    }
}

impl Eq for GcAny {}

impl fmt::Debug for GcAny {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base().header() {
            Some(header) => write!(f, "GcAny({:p})", header.as_ptr()),
            None => write!(f, "GcAny(null)"),
        }
    }
}

impl Trace for GcAny {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit_any(self);
    }
}

impl Trace for Option<GcAny> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit_opt_any(self);
    }
}
