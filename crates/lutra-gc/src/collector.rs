//! The collector: handle registry, live set, and the incremental
//! tri-color state machine
//!
//! ## Design
//!
//! - **Tri-color marking**: White/Gray/Black marks with a gray worklist
//! - **Three incremental phases**: root marking, leaf marking, sweeping,
//!   each advanced by a step budget per `collect` call
//! - **Automatic roots**: every live handle is registered; a handle is a
//!   root unless it is found embedded in a managed payload
//! - **Write barrier**: handle registration and mutation notify the
//!   collector so objects referenced mid-cycle survive it
//! - **Interval-ordered live set**: headers keyed by payload address for
//!   O(log N) raw-pointer-to-owner queries
//!
//! One collector exists per thread and is torn down at thread exit, running
//! the destructors of everything still tracked.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;

use crate::class::ClassDescriptor;
use crate::error::GcError;
use crate::handle::{HandleBase, UNREGISTERED};
use crate::object::{MarkColor, ObjectHeader};

/// Phase of the incremental collection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// Scanning registered handles for roots to shade.
    RootMarking,
    /// Draining the gray worklist, blackening objects.
    LeafMarking,
    /// Reclaiming white headers, whitening survivors.
    Sweeping,
}

impl fmt::Display for GcPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcPhase::RootMarking => "RootMarking",
            GcPhase::LeafMarking => "LeafMarking",
            GcPhase::Sweeping => "Sweeping",
        })
    }
}

/// Snapshot of the collector's bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    /// Registered handle records.
    pub handles: usize,
    /// Tracked headers (including explicitly destroyed ones awaiting sweep).
    pub headers: usize,
    /// Headers whose payload is still alive.
    pub live_objects: usize,
    /// Headers currently on the gray worklist.
    pub gray: usize,
    /// Current phase.
    pub phase: GcPhase,
    /// Completed collection cycles.
    pub cycles: u64,
    /// Bytes currently allocated (headers plus payloads).
    pub allocated_bytes: usize,
    /// Objects reclaimed by the last completed sweep.
    pub last_reclaimed_objects: usize,
    /// Bytes reclaimed by the last completed sweep.
    pub last_reclaimed_bytes: usize,
}

/// Default byte threshold for [`should_collect`].
const DEFAULT_THRESHOLD: usize = 1024 * 1024;

pub(crate) struct Collector {
    /// All live handle records; swap-with-last removal.
    handles: RefCell<Vec<NonNull<HandleBase>>>,
    /// Headers keyed by payload start address.
    live: RefCell<BTreeMap<usize, NonNull<ObjectHeader>>>,
    /// Gray worklist (LIFO).
    gray: RefCell<Vec<NonNull<ObjectHeader>>>,
    /// Headers whose object is currently under construction, in order.
    creating: RefCell<Vec<NonNull<ObjectHeader>>>,
    phase: Cell<GcPhase>,
    /// RootMarking cursor into `handles`.
    next_root: Cell<usize>,
    /// Sweeping cursor: smallest payload key not yet examined.
    sweep_cursor: Cell<usize>,
    in_collect: Cell<bool>,
    allocated_bytes: Cell<usize>,
    threshold: Cell<usize>,
    cycles: Cell<u64>,
    reclaimed_objects: Cell<usize>,
    reclaimed_bytes: Cell<usize>,
}

thread_local! {
    static COLLECTOR: Collector = Collector::new();
}

/// Run `f` against this thread's collector. Returns `None` once the
/// collector has been torn down (thread exit).
fn with<R>(f: impl FnOnce(&Collector) -> R) -> Option<R> {
    COLLECTOR.try_with(|collector| f(collector)).ok()
}

impl Collector {
    fn new() -> Self {
        Self {
            handles: RefCell::new(Vec::with_capacity(1024)),
            live: RefCell::new(BTreeMap::new()),
            gray: RefCell::new(Vec::with_capacity(256)),
            creating: RefCell::new(Vec::new()),
            phase: Cell::new(GcPhase::RootMarking),
            next_root: Cell::new(0),
            sweep_cursor: Cell::new(0),
            in_collect: Cell::new(false),
            allocated_bytes: Cell::new(0),
            threshold: Cell::new(DEFAULT_THRESHOLD),
            cycles: Cell::new(0),
            reclaimed_objects: Cell::new(0),
            reclaimed_bytes: Cell::new(0),
        }
    }

    // ---------------------------------------------------------------
    // Handle registration
    // ---------------------------------------------------------------

    fn register(&self, record: NonNull<HandleBase>) {
        {
            let mut handles = self.handles.borrow_mut();
            // SAFETY: the record outlives its vector entry.
            unsafe { record.as_ref() }.set_index(handles.len());
            handles.push(record);
        }
        // A fresh handle referencing an object is a mutation event: without
        // this, an object assigned during marking or sweeping could be
        // missed by the current cycle.
        let record = unsafe { record.as_ref() };
        if record.header().is_some() {
            self.on_handle_changed(record);
        }
    }

    fn unregister(&self, record: NonNull<HandleBase>) {
        let index = unsafe { record.as_ref() }.index();
        let moved = {
            let mut handles = self.handles.borrow_mut();
            debug_assert!(handles.get(index).copied() == Some(record));
            handles.swap_remove(index);
            handles.get(index).copied()
        };
        let Some(moved) = moved else { return };
        // SAFETY: records in the vector are alive.
        let moved = unsafe { moved.as_ref() };
        moved.set_index(index);
        // The moved record inherited a slot the root-marking cursor may
        // already have passed; shade it now or this pass misses it.
        if moved.header().is_some()
            && self.phase.get() == GcPhase::RootMarking
            && index < self.next_root.get()
        {
            self.try_mark_root(moved);
        }
    }

    /// Shade `record`'s referent if the record is still presumed a root.
    fn try_mark_root(&self, record: &HandleBase) {
        if !record.is_root() {
            return;
        }
        let Some(header) = record.header() else { return };
        // SAFETY: referenced headers are live.
        let header_ref = unsafe { header.as_ref() };
        if header_ref.color() == MarkColor::White {
            header_ref.set_color(MarkColor::Gray);
            self.gray.borrow_mut().push(header);
        }
    }

    /// Write barrier. Called when a registered handle starts referencing an
    /// object (registration, assignment).
    fn on_handle_changed(&self, record: &HandleBase) {
        let Some(header) = record.header() else { return };
        match self.phase.get() {
            GcPhase::RootMarking => {
                // Only the already-visited region needs help; the cursor
                // will reach everything after it anyway.
                if record.index() < self.next_root.get() {
                    self.try_mark_root(record);
                }
            }
            GcPhase::LeafMarking => self.try_mark_root(record),
            GcPhase::Sweeping => {
                // SAFETY: referenced headers are live.
                let header = unsafe { header.as_ref() };
                if header.color() == MarkColor::White {
                    if (header.payload_start() as usize) < self.sweep_cursor.get() {
                        // Already passed over: safe to stay White until the
                        // next cycle.
                    } else {
                        // The sweeper is still heading here; protect it.
                        header.set_color(MarkColor::Black);
                    }
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Allocation bookkeeping
    // ---------------------------------------------------------------

    fn alloc_header(
        &self,
        klass: &'static ClassDescriptor,
        count: usize,
    ) -> Result<NonNull<ObjectHeader>, GcError> {
        let layout = klass.allocation_layout(count)?;
        // SAFETY: the layout covers at least the header, so it is non-zero.
        let block = unsafe { std::alloc::alloc(layout) };
        let Some(block) = NonNull::new(block) else {
            return Err(GcError::AllocationFailed { layout });
        };
        let header = block.cast::<ObjectHeader>();
        // SAFETY: freshly allocated block, properly aligned for the header.
        unsafe { header.as_ptr().write(ObjectHeader::new(klass, count)) };
        let start = unsafe { header.as_ref() }.payload_start() as usize;
        self.live.borrow_mut().insert(start, header);
        self.creating.borrow_mut().push(header);
        self.allocated_bytes
            .set(self.allocated_bytes.get() + layout.size());
        Ok(header)
    }

    fn end_construction(&self, header: NonNull<ObjectHeader>, failed: bool) {
        {
            let mut creating = self.creating.borrow_mut();
            if let Some(pos) = creating.iter().rposition(|h| *h == header) {
                creating.remove(pos);
            }
        }
        // SAFETY: the header was allocated by `alloc_header` and not yet
        // released.
        let header_ref = unsafe { header.as_ref() };
        if failed {
            let start = header_ref.payload_start() as usize;
            self.live.borrow_mut().remove(&start);
            self.release_block(header);
            return;
        }
        let klass = header_ref.class();
        klass.observe_first_construction(header_ref);
        // Handles that ended up inside the payload are embedded, not roots.
        for embedded in klass.enumerate(header_ref) {
            // SAFETY: enumerated records belong to live handles.
            unsafe { embedded.as_ref() }.demote();
        }
    }

    /// Release a header's memory block. The payload destructors must
    /// already have run (or never have been started).
    fn release_block(&self, header: NonNull<ObjectHeader>) {
        // SAFETY: header was produced by `alloc_header`.
        let header_ref = unsafe { header.as_ref() };
        let klass = header_ref.class();
        let Ok(layout) = klass.allocation_layout(header_ref.alloc_len()) else {
            // The same computation succeeded at allocation time.
            return;
        };
        self.allocated_bytes
            .set(self.allocated_bytes.get().saturating_sub(layout.size()));
        // SAFETY: allocated with exactly this layout, released once.
        unsafe { std::alloc::dealloc(header.as_ptr() as *mut u8, layout) };
    }

    fn find_owner(&self, addr: usize) -> Option<NonNull<ObjectHeader>> {
        // Fast path: the owner is almost always the innermost object under
        // construction.
        {
            let creating = self.creating.borrow();
            for header in creating.iter().rev() {
                // SAFETY: creating entries are live headers.
                if unsafe { header.as_ref() }.contains(addr) {
                    return Some(*header);
                }
            }
        }
        let live = self.live.borrow();
        let (_, header) = live.range(..=addr).next_back()?;
        // SAFETY: live entries are live headers.
        unsafe { header.as_ref() }
            .contains(addr)
            .then_some(*header)
    }

    fn is_creating(&self, header: NonNull<ObjectHeader>) -> bool {
        self.creating.borrow().contains(&header)
    }

    // ---------------------------------------------------------------
    // The state machine
    // ---------------------------------------------------------------

    fn collect(&self, budget: usize) {
        if self.in_collect.replace(true) {
            // Re-entered from a destructor; the outer call owns the cycle.
            return;
        }
        struct ResetGuard<'a>(&'a Cell<bool>);
        impl Drop for ResetGuard<'_> {
            fn drop(&mut self) {
                self.0.set(false);
            }
        }
        let _guard = ResetGuard(&self.in_collect);
        self.step(budget);
    }

    fn step(&self, mut budget: usize) {
        loop {
            match self.phase.get() {
                GcPhase::RootMarking => {
                    loop {
                        let cursor = self.next_root.get();
                        if cursor >= self.handles.borrow().len() {
                            break;
                        }
                        if budget == 0 {
                            return;
                        }
                        budget -= 1;
                        let record = self.handles.borrow()[cursor];
                        self.next_root.set(cursor + 1);
                        // SAFETY: records in the vector are alive.
                        let record = unsafe { record.as_ref() };
                        let Some(header) = record.header() else {
                            continue;
                        };
                        // Demote whatever the referent embeds. This lazily
                        // corrects handles in spilled container storage the
                        // class layout could not discover structurally.
                        if !self.is_creating(header) {
                            // SAFETY: referenced headers are live.
                            let header_ref = unsafe { header.as_ref() };
                            for embedded in header_ref.class().enumerate(header_ref) {
                                // SAFETY: enumerated records are alive.
                                unsafe { embedded.as_ref() }.demote();
                            }
                        }
                        self.try_mark_root(record);
                    }
                    self.next_root.set(0);
                    self.set_phase(GcPhase::LeafMarking);
                }
                GcPhase::LeafMarking => {
                    loop {
                        if self.gray.borrow().is_empty() {
                            break;
                        }
                        if budget == 0 {
                            return;
                        }
                        budget -= 1;
                        let Some(header) = self.gray.borrow_mut().pop() else {
                            break;
                        };
                        // SAFETY: gray entries are live headers.
                        let header_ref = unsafe { header.as_ref() };
                        header_ref.set_color(MarkColor::Black);
                        if self.is_creating(header) {
                            // Payload not fully initialized yet; its
                            // children are still held by the constructing
                            // code and shaded through their own records.
                            continue;
                        }
                        for embedded in header_ref.class().enumerate(header_ref) {
                            budget = budget.saturating_sub(1);
                            // SAFETY: enumerated records are alive.
                            let embedded = unsafe { embedded.as_ref() };
                            let Some(child) = embedded.header() else {
                                continue;
                            };
                            // SAFETY: referenced headers are live.
                            let child_ref = unsafe { child.as_ref() };
                            if child_ref.color() == MarkColor::White {
                                child_ref.set_color(MarkColor::Gray);
                                self.gray.borrow_mut().push(child);
                            }
                        }
                    }
                    self.sweep_cursor.set(0);
                    self.reclaimed_objects.set(0);
                    self.reclaimed_bytes.set(0);
                    self.set_phase(GcPhase::Sweeping);
                }
                GcPhase::Sweeping => {
                    loop {
                        let next = {
                            let live = self.live.borrow();
                            live.range(self.sweep_cursor.get()..)
                                .next()
                                .map(|(key, header)| (*key, *header))
                        };
                        let Some((key, header)) = next else { break };
                        if budget == 0 {
                            return;
                        }
                        budget -= 1;
                        self.sweep_cursor.set(key + 1);
                        if self.is_creating(header) {
                            continue;
                        }
                        // SAFETY: live entries are live headers.
                        let header_ref = unsafe { header.as_ref() };
                        if header_ref.color() == MarkColor::White {
                            self.live.borrow_mut().remove(&key);
                            self.reclaimed_objects
                                .set(self.reclaimed_objects.get() + 1);
                            if let Ok(layout) =
                                header_ref.class().allocation_layout(header_ref.alloc_len())
                            {
                                self.reclaimed_bytes
                                    .set(self.reclaimed_bytes.get() + layout.size());
                            }
                            // Runs user destructors; no collector borrows
                            // are held here.
                            header_ref.destroy();
                            self.release_block(header);
                        } else {
                            header_ref.set_color(MarkColor::White);
                        }
                    }
                    self.cycles.set(self.cycles.get() + 1);
                    self.set_phase(GcPhase::RootMarking);
                    #[cfg(feature = "gc_logging")]
                    tracing::info!(
                        target: "lutra::gc",
                        cycle = self.cycles.get(),
                        reclaimed_objects = self.reclaimed_objects.get(),
                        reclaimed_bytes = self.reclaimed_bytes.get(),
                        live_bytes = self.allocated_bytes.get(),
                        "collection cycle complete"
                    );
                    if self.live.borrow().is_empty() {
                        return;
                    }
                    // Otherwise spend the remaining budget on a new cycle.
                }
            }
        }
    }

    fn set_phase(&self, phase: GcPhase) {
        self.phase.set(phase);
        #[cfg(feature = "gc_logging")]
        tracing::debug!(target: "lutra::gc", phase = %phase, "phase transition");
    }

    fn stats(&self) -> GcStats {
        let live = self.live.borrow();
        let live_objects = live
            .values()
            // SAFETY: live entries are live headers.
            .filter(|h| !unsafe { h.as_ref() }.is_destroyed())
            .count();
        GcStats {
            handles: self.handles.borrow().len(),
            headers: live.len(),
            live_objects,
            gray: self.gray.borrow().len(),
            phase: self.phase.get(),
            cycles: self.cycles.get(),
            allocated_bytes: self.allocated_bytes.get(),
            last_reclaimed_objects: self.reclaimed_objects.get(),
            last_reclaimed_bytes: self.reclaimed_bytes.get(),
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        // Final sweep at thread exit: run every remaining destructor, then
        // release the blocks. Two passes per round so a destructor never
        // observes an already-freed neighbor; destructors may allocate, so
        // loop until the live set stops refilling.
        loop {
            let snapshot: Vec<(usize, NonNull<ObjectHeader>)> = self
                .live
                .borrow()
                .iter()
                .map(|(key, header)| (*key, *header))
                .collect();
            if snapshot.is_empty() {
                break;
            }
            for (_, header) in &snapshot {
                // SAFETY: live entries are live headers.
                unsafe { header.as_ref() }.destroy();
            }
            for (key, header) in snapshot {
                self.live.borrow_mut().remove(&key);
                self.release_block(header);
            }
        }
    }
}

// ---------------------------------------------------------------
// Crate-facing entry points
// ---------------------------------------------------------------

pub(crate) fn register_handle(record: NonNull<HandleBase>) {
    // During collector teardown the record stays UNREGISTERED and is
    // skipped on drop.
    let _ = with(|c| c.register(record));
}

pub(crate) fn unregister_handle(record: NonNull<HandleBase>) {
    // SAFETY: called from the owning handle's drop; the record is alive.
    if unsafe { record.as_ref() }.index() == UNREGISTERED {
        return;
    }
    let _ = with(|c| c.unregister(record));
}

pub(crate) fn new_header(
    klass: &'static ClassDescriptor,
    count: usize,
) -> Result<NonNull<ObjectHeader>, GcError> {
    let layout = klass.allocation_layout(count)?;
    with(|c| c.alloc_header(klass, count)).unwrap_or(Err(GcError::AllocationFailed { layout }))
}

pub(crate) fn finish_construction(header: NonNull<ObjectHeader>, failed: bool) {
    let _ = with(|c| c.end_construction(header, failed));
}

pub(crate) fn find_owner(addr: usize) -> Option<NonNull<ObjectHeader>> {
    with(|c| c.find_owner(addr)).flatten()
}

/// Advance the collection state machine by up to `budget` steps.
///
/// See [`gc_collect`](crate::gc_collect).
pub(crate) fn collect(budget: usize) {
    let _ = with(|c| c.collect(budget));
}

/// Snapshot of this thread's collector bookkeeping.
pub fn gc_stats() -> GcStats {
    with(Collector::stats).unwrap_or(GcStats {
        handles: 0,
        headers: 0,
        live_objects: 0,
        gray: 0,
        phase: GcPhase::RootMarking,
        cycles: 0,
        allocated_bytes: 0,
        last_reclaimed_objects: 0,
        last_reclaimed_bytes: 0,
    })
}

/// True once the bytes tracked by this thread's collector exceed the
/// configured threshold; a good moment to call
/// [`gc_collect`](crate::gc_collect).
pub fn should_collect() -> bool {
    with(|c| c.allocated_bytes.get() >= c.threshold.get()).unwrap_or(false)
}

/// Set the byte threshold consulted by [`should_collect`].
pub fn set_collect_threshold(bytes: usize) {
    let _ = with(|c| c.threshold.set(bytes));
}

/// Print the collector's bookkeeping to the diagnostic stream.
pub fn gc_dump_stats() {
    let stats = gc_stats();
    eprintln!("========= [gc] =========");
    eprintln!("[registered handles] {:6}", stats.handles);
    eprintln!("[tracked headers   ] {:6}", stats.headers);
    eprintln!("[gray headers      ] {:6}", stats.gray);
    eprintln!("[live objects      ] {:6}", stats.live_objects);
    eprintln!("[allocated bytes   ] {:6}", stats.allocated_bytes);
    eprintln!("[completed cycles  ] {:6}", stats.cycles);
    eprintln!("[collector phase   ] {}", stats.phase);
    eprintln!("========================");
}
