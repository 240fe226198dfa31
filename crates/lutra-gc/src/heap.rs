//! Allocation entry points
//!
//! Objects are allocated as one block (`header | payload`), registered with
//! the collector before their payload is initialized (so raw-pointer lookup
//! works from inside initializers), and observed for embedded-handle layout
//! when construction finishes.

use std::ptr::NonNull;

use crate::class::ClassDescriptor;
use crate::collector;
use crate::error::GcError;
use crate::handle::Gc;
use crate::object::ObjectHeader;
use crate::trace::Trace;

/// Step budget used when callers have no particular pacing in mind.
pub const DEFAULT_STEP_BUDGET: usize = 256;

/// Allocate one `T` on the collected heap and return a root handle.
///
/// Aborts via [`std::alloc::handle_alloc_error`] when the underlying
/// allocator fails; use [`try_gc_new`] to observe the failure instead.
pub fn gc_new<T: Trace + 'static>(value: T) -> Gc<T> {
    unwrap_alloc(try_gc_new(value))
}

/// Fallible variant of [`gc_new`].
pub fn try_gc_new<T: Trace + 'static>(value: T) -> Result<Gc<T>, GcError> {
    let klass = ClassDescriptor::get::<T>();
    let header = collector::new_header(klass, 1)?;
    // SAFETY: fresh allocation with room for one `T`.
    unsafe {
        (header.as_ref().payload_start() as *mut T).write(value);
    }
    collector::finish_construction(header, false);
    Ok(Gc::from_header(header))
}

/// Allocate `len` contiguous `T`, constructing element `i` with `init(i)`.
///
/// If an initializer panics, the elements constructed so far are dropped in
/// reverse order, the allocation is withdrawn, and the panic resumes.
/// A zero-length array is well-formed: it owns no payload and is reclaimed
/// as soon as it becomes unreachable.
pub fn gc_new_array<T: Trace + 'static>(len: usize, init: impl FnMut(usize) -> T) -> Gc<T> {
    unwrap_alloc(try_gc_new_array(len, init))
}

/// Fallible variant of [`gc_new_array`].
pub fn try_gc_new_array<T: Trace + 'static>(
    len: usize,
    mut init: impl FnMut(usize) -> T,
) -> Result<Gc<T>, GcError> {
    let klass = ClassDescriptor::get::<T>();
    let header = collector::new_header(klass, len)?;
    // SAFETY: the header is live until released.
    let base = unsafe { header.as_ref() }.payload_start() as *mut T;

    struct Rollback<T> {
        header: NonNull<ObjectHeader>,
        base: *mut T,
        constructed: usize,
        armed: bool,
    }
    impl<T> Drop for Rollback<T> {
        fn drop(&mut self) {
            if !self.armed {
                return;
            }
            // An initializer panicked: destroy the constructed prefix in
            // reverse order and withdraw the allocation, then let the panic
            // resume.
            for i in (0..self.constructed).rev() {
                // SAFETY: elements `0..constructed` were written.
                unsafe { std::ptr::drop_in_place(self.base.add(i)) };
            }
            collector::finish_construction(self.header, true);
        }
    }

    let mut guard = Rollback {
        header,
        base,
        constructed: 0,
        armed: true,
    };
    for i in 0..len {
        let value = init(i);
        // SAFETY: slot `i` is within the allocation and uninitialized.
        unsafe { base.add(i).write(value) };
        guard.constructed = i + 1;
    }
    guard.armed = false;
    drop(guard);

    collector::finish_construction(header, false);
    Ok(Gc::from_header(header))
}

/// Allocate a `T` whose initializer receives a handle to the object under
/// construction, for building self-referential structures.
///
/// The handle passed to `init` references an object whose payload does not
/// exist yet: it may be cloned and stored, but must not be dereferenced
/// until `gc_new_cyclic` returns.
pub fn gc_new_cyclic<T: Trace + 'static>(init: impl FnOnce(&Gc<T>) -> T) -> Gc<T> {
    unwrap_alloc(try_gc_new_cyclic(init))
}

/// Fallible variant of [`gc_new_cyclic`].
pub fn try_gc_new_cyclic<T: Trace + 'static>(
    init: impl FnOnce(&Gc<T>) -> T,
) -> Result<Gc<T>, GcError> {
    let klass = ClassDescriptor::get::<T>();
    let header = collector::new_header(klass, 1)?;
    let handle = Gc::from_header(header);

    struct Rollback<'a, T: Trace + 'static> {
        handle: &'a Gc<T>,
        header: NonNull<ObjectHeader>,
        armed: bool,
    }
    impl<T: Trace + 'static> Drop for Rollback<'_, T> {
        fn drop(&mut self) {
            if !self.armed {
                return;
            }
            // The initializer panicked before the payload existed: detach
            // the handle and withdraw the allocation without running a
            // destructor.
            self.handle.clear_record();
            collector::finish_construction(self.header, true);
        }
    }

    let mut guard = Rollback {
        handle: &handle,
        header,
        armed: true,
    };
    let value = init(&handle);
    // SAFETY: fresh allocation with room for one `T`.
    unsafe {
        (header.as_ref().payload_start() as *mut T).write(value);
    }
    guard.armed = false;
    drop(guard);

    collector::finish_construction(header, false);
    Ok(handle)
}

/// Recover a handle from a raw pointer into a managed payload.
///
/// Returns a null handle when `ptr` does not point at an element of a live
/// payload of type `T` (the pointer is dangling, interior to an element, or
/// of the wrong type). The lookup scans the object under construction first,
/// so it works from inside [`gc_new_cyclic`] initializers.
pub fn gc_from<T: Trace + 'static>(ptr: *const T) -> Gc<T> {
    if ptr.is_null() {
        return Gc::null();
    }
    let addr = ptr as usize;
    let Some(header) = collector::find_owner(addr) else {
        return Gc::null();
    };
    // SAFETY: `find_owner` only returns live headers.
    let header_ref = unsafe { header.as_ref() };
    let klass = header_ref.class();
    if klass.type_id() != std::any::TypeId::of::<T>() {
        return Gc::null();
    }
    // Reject pointers into the middle of an element.
    let offset = addr - header_ref.payload_start() as usize;
    if klass.elem_size() == 0 || offset % klass.elem_size() != 0 {
        return Gc::null();
    }
    Gc::from_parts(Some(header), ptr as *mut u8)
}

/// Explicitly destroy the referenced object.
///
/// Runs the payload destructors immediately and nulls `handle`; the header
/// stays tracked until the next sweep reclaims it. Deleting an
/// already-destroyed or null handle is a silent no-op. Other handles to the
/// same object observe it as destroyed and panic on dereference.
pub fn gc_delete<T: Trace + 'static>(handle: &mut Gc<T>) {
    if let Some(header) = handle.header() {
        header.destroy();
    }
    handle.clear_record();
}

/// Advance the collection state machine by up to `budget` steps.
///
/// A step touches one handle, gray header, or swept header; the budget is a
/// soft bound (an object's embedded handles are always enumerated to
/// completion). The call suspends mid-phase when the budget runs out and
/// resumes where it left off on the next call.
pub fn gc_collect(budget: usize) {
    collector::collect(budget);
}

fn unwrap_alloc<T: Trace + 'static>(result: Result<Gc<T>, GcError>) -> Gc<T> {
    match result {
        Ok(handle) => handle,
        Err(GcError::AllocationFailed { layout }) => std::alloc::handle_alloc_error(layout),
        Err(err) => panic!("gc allocation failed: {err}"),
    }
}
