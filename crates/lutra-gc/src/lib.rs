//! # Lutra Garbage Collector
//!
//! An embeddable, incremental, tri-color mark/sweep garbage collector with
//! smart handles.
//!
//! ## Design
//!
//! - **Smart handles**: [`Gc<T>`] tracks references automatically; roots
//!   are discovered by registration, not by stack scanning
//! - **Tri-color marking**: White/Gray/Black marks handle arbitrary object
//!   graphs, including cycles
//! - **Incremental collection**: [`gc_collect`] advances a three-phase
//!   state machine by a bounded step budget and resumes across calls
//! - **Write barriers**: handle creation and mutation shade their referents
//!   so mutation may interleave with collection
//! - **Observed layouts**: a type's embedded handle offsets are learned
//!   from its first construction and reused for every later trace
//!
//! ## Declaring managed types
//!
//! Types stored on the collected heap implement [`Trace`], visiting each
//! embedded handle slot:
//!
//! ```
//! use lutra_gc::{Gc, Trace, Visitor, gc_collect, gc_new};
//!
//! struct Node {
//!     next: Option<Gc<Node>>,
//!     value: i32,
//! }
//!
//! impl Trace for Node {
//!     fn trace(&self, visitor: &mut Visitor<'_>) {
//!         visitor.visit_opt(&self.next);
//!     }
//! }
//!
//! let head = gc_new(Node { next: None, value: 1 });
//! let _tail = gc_new(Node { next: Some(head.clone()), value: 2 });
//! gc_collect(1000);
//! assert_eq!(head.value, 1);
//! ```
//!
//! The collector is cooperative and per-thread: nothing is reclaimed unless
//! [`gc_collect`] is called, and handles must not cross threads.

#![warn(clippy::all)]
#![warn(missing_docs)]

mod class;
mod collector;
mod containers;
mod error;
mod function;
mod handle;
mod heap;
mod object;
mod trace;

pub use class::{ClassDescriptor, ClassState};
pub use collector::{
    GcPhase, GcStats, gc_dump_stats, gc_stats, set_collect_threshold, should_collect,
};
pub use containers::{
    GcDeque, GcHashMap, GcList, GcMap, GcSet, GcVec, gc_new_deque, gc_new_hash_map, gc_new_list,
    gc_new_map, gc_new_set, gc_new_vec,
};
pub use error::GcError;
pub use function::GcFunction;
pub use handle::{Gc, GcAny, HandleBase};
pub use heap::{
    DEFAULT_STEP_BUDGET, gc_collect, gc_delete, gc_from, gc_new, gc_new_array, gc_new_cyclic,
    try_gc_new, try_gc_new_array, try_gc_new_cyclic,
};
pub use object::{MarkColor, ObjectHeader};
pub use trace::{PointerEnumerator, Trace, Visitor};
