//! Callables with collected captured state
//!
//! A [`GcFunction`] pairs a plain function pointer with a captured-state
//! object that lives on the collected heap and is traced like any other
//! managed object. Handles captured in the state participate in marking, so
//! a stored callback keeps its environment alive (including cycles through
//! the callback itself).

use crate::handle::GcAny;
use crate::heap::gc_new;
use crate::trace::{Trace, Visitor};

/// Type-erased callable taking `A` (use a tuple for several arguments) and
/// returning `R`, whose captured state is a managed object.
pub struct GcFunction<A: 'static, R: 'static> {
    state: GcAny,
    invoke: unsafe fn(*const u8, A) -> R,
}

/// Captured state plus entry point, stored as one managed object.
struct Thunk<S, A, R> {
    state: S,
    call: fn(&S, A) -> R,
}

impl<S: Trace, A: 'static, R: 'static> Trace for Thunk<S, A, R> {
    const DYNAMIC_LAYOUT: bool = S::DYNAMIC_LAYOUT;

    fn trace(&self, visitor: &mut Visitor<'_>) {
        self.state.trace(visitor);
    }
}

unsafe fn invoke_thunk<S: Trace + 'static, A: 'static, R: 'static>(
    payload: *const u8,
    args: A,
) -> R {
    // SAFETY: the payload was allocated as a `Thunk<S, A, R>` by
    // `GcFunction::new` with this exact monomorphization.
    let thunk = unsafe { &*(payload as *const Thunk<S, A, R>) };
    (thunk.call)(&thunk.state, args)
}

impl<A: 'static, R: 'static> GcFunction<A, R> {
    /// Build a callable from captured state and an entry point.
    pub fn new<S: Trace + 'static>(state: S, call: fn(&S, A) -> R) -> Self {
        let handle = gc_new(Thunk { state, call });
        GcFunction {
            state: handle.erase(),
            invoke: invoke_thunk::<S, A, R>,
        }
    }

    /// Build a stateless callable.
    pub fn from_fn(call: fn(A) -> R) -> Self {
        Self::new(call, |f, args| f(args))
    }

    /// Invoke the callable.
    ///
    /// Panics if the captured state was explicitly destroyed.
    pub fn call(&self, args: A) -> R {
        let payload = self.state.payload();
        let destroyed = self
            .state
            .header()
            .is_none_or(crate::object::ObjectHeader::is_destroyed);
        assert!(
            !payload.is_null() && !destroyed,
            "called a GcFunction whose captured state was destroyed"
        );
        // SAFETY: payload is the live `Thunk` written by `new`.
        unsafe { (self.invoke)(payload, args) }
    }
}

impl<A: 'static, R: 'static> Clone for GcFunction<A, R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            invoke: self.invoke,
        }
    }
}

impl<A: 'static, R: 'static> Trace for GcFunction<A, R> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit_any(&self.state);
    }
}

impl<A: 'static, R: 'static> Trace for fn(A) -> R {
    fn trace(&self, _visitor: &mut Visitor<'_>) {}
}
