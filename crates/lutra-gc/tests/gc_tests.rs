//! Collector correctness tests
//!
//! Each test runs on its own thread and therefore against its own
//! collector, so heap counts observed through `gc_stats` are exact.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lutra_gc::{
    Gc, GcFunction, GcPhase, Trace, Visitor, gc_collect, gc_delete, gc_from, gc_new, gc_new_array,
    gc_new_cyclic, gc_new_map, gc_new_set, gc_new_vec, gc_stats,
};

/// Linked node that reports its destruction.
struct Node {
    next: Option<Gc<Node>>,
    drops: Option<Rc<Cell<usize>>>,
    value: i32,
}

impl Node {
    fn new(value: i32) -> Self {
        Node {
            next: None,
            drops: None,
            value,
        }
    }

    fn counted(value: i32, drops: &Rc<Cell<usize>>) -> Self {
        Node {
            next: None,
            drops: Some(drops.clone()),
            value,
        }
    }
}

impl Trace for Node {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit_opt(&self.next);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(drops) = &self.drops {
            drops.set(drops.get() + 1);
        }
    }
}

/// Run enough full cycles to reach a fixed point.
fn collect_to_quiescence() {
    for _ in 0..4 {
        gc_collect(100_000);
    }
}

#[test]
fn simple_allocation_and_drop() {
    let drops = Rc::new(Cell::new(0));

    let a = gc_new(Node::counted(7, &drops));
    assert_eq!(a.value, 7);
    assert_eq!(gc_stats().headers, 1);

    drop(a);
    collect_to_quiescence();

    assert_eq!(gc_stats().headers, 0);
    assert_eq!(drops.get(), 1);
}

#[test]
fn cycle_is_reclaimed() {
    let drops = Rc::new(Cell::new(0));

    {
        let a = gc_new(Node::counted(1, &drops));
        let b = gc_new(Node::counted(2, &drops));
        let c = gc_new(Node::counted(3, &drops));
        // a -> b -> c -> b: a cycle between b and c.
        // SAFETY: no other borrows of these payloads exist.
        unsafe {
            a.get_mut().next = Some(b.clone());
            b.get_mut().next = Some(c.clone());
            c.get_mut().next = Some(b.clone());
        }
        assert_eq!(gc_stats().headers, 3);
    }

    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 0);
    assert_eq!(drops.get(), 3);
}

#[test]
fn self_referential_object_is_reclaimed() {
    let drops = Rc::new(Cell::new(0));

    {
        let node = gc_new_cyclic(|this: &Gc<Node>| {
            let mut value = Node::counted(0, &drops);
            value.next = Some(this.clone());
            value
        });
        assert_eq!(node.next.as_ref(), Some(&node));
    }

    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 0);
    assert_eq!(drops.get(), 1);
}

#[test]
fn container_keeps_elements_alive() {
    let drops = Rc::new(Cell::new(0));

    let vec = gc_new_vec::<Node>();
    for i in 0..10 {
        vec.push(gc_new(Node::counted(i, &drops)));
    }

    collect_to_quiescence();
    // The vector object plus its ten elements.
    assert_eq!(gc_stats().headers, 11);
    assert_eq!(drops.get(), 0);

    drop(vec);
    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 0);
    assert_eq!(drops.get(), 10);
}

#[test]
fn incremental_steps_never_lose_reachable_nodes() {
    // A chain of 100 nodes rooted at the head.
    let mut head = gc_new(Node::new(99));
    for value in (0..99).rev() {
        let mut node = Node::new(value);
        node.next = Some(head);
        head = gc_new(node);
    }
    assert_eq!(gc_stats().headers, 100);

    for _ in 0..100 {
        gc_collect(1);
        assert_eq!(gc_stats().headers, 100);
    }

    // Still fully reachable afterwards.
    let mut length = 0;
    let mut cursor = Some(head.clone());
    while let Some(node) = cursor {
        length += 1;
        cursor = node.next.clone();
    }
    assert_eq!(length, 100);
}

#[test]
fn write_barrier_protects_target_during_sweep() {
    let x = gc_new(Node::new(42));
    let raw = x.as_ptr();
    drop(x);

    // One rooted object paces the marking phases.
    let pad = gc_new(Node::new(0));
    assert_eq!(gc_stats().headers, 2);

    // Budget 2: one step visits the pad handle, one drains the gray
    // worklist; the call then enters Sweeping without examining a header.
    gc_collect(2);
    assert_eq!(gc_stats().phase, GcPhase::Sweeping);

    // Resurrect a root to the White, unswept X mid-sweep.
    let x2 = gc_from(raw);
    assert!(!x2.is_null());

    gc_collect(1_000_000);
    // X was recolored and survived the cycle.
    assert_eq!(gc_stats().headers, 2);
    assert_eq!(x2.value, 42);

    // Once X is unreachable again, a full cycle reclaims it.
    drop(x2);
    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 1);
    drop(pad);
}

#[test]
fn unregistering_before_the_cursor_reshades_the_moved_handle() {
    let a = gc_new(Node::new(1));
    let b = gc_new(Node::new(2));

    // Visit only a's handle, leaving the cursor past slot 0.
    gc_collect(1);
    assert_eq!(gc_stats().phase, GcPhase::RootMarking);

    // Dropping `a` swaps b's record into the already-visited slot; the
    // collector must shade it or this pass would sweep a rooted object.
    drop(a);
    gc_collect(1_000_000);

    assert_eq!(gc_stats().headers, 1);
    assert_eq!(b.value, 2);
}

#[test]
fn constructor_panic_rolls_back_partial_array() {
    let order = Rc::new(RefCell::new(Vec::new()));

    struct Tracked {
        id: usize,
        order: Rc<RefCell<Vec<usize>>>,
    }
    impl Trace for Tracked {
        fn trace(&self, _visitor: &mut Visitor<'_>) {}
    }
    impl Drop for Tracked {
        fn drop(&mut self) {
            self.order.borrow_mut().push(self.id);
        }
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let order = order.clone();
        gc_new_array(5, move |i| {
            if i == 2 {
                panic!("third element refuses to construct");
            }
            Tracked {
                id: i,
                order: order.clone(),
            }
        })
    }));
    assert!(result.is_err());

    // The two constructed elements were destroyed in reverse order and the
    // allocation was withdrawn.
    assert_eq!(*order.borrow(), vec![1, 0]);
    assert_eq!(gc_stats().headers, 0);
    assert_eq!(gc_stats().allocated_bytes, 0);
}

#[test]
fn zero_length_array_is_well_formed() {
    let empty = gc_new_array(0, |_| Node::new(0));
    assert_eq!(empty.len(), 0);
    assert!(empty.as_slice().is_empty());
    assert_eq!(gc_stats().headers, 1);

    drop(empty);
    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 0);
}

#[test]
fn array_elements_are_traced() {
    let drops = Rc::new(Cell::new(0));

    let target = gc_new(Node::counted(5, &drops));
    let array = gc_new_array(4, |_| Node {
        next: Some(target.clone()),
        drops: None,
        value: 0,
    });
    drop(target);

    collect_to_quiescence();
    // The target stays alive through the array elements.
    assert_eq!(gc_stats().headers, 2);
    assert_eq!(drops.get(), 0);
    assert_eq!(array.as_slice().len(), 4);

    drop(array);
    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 0);
    assert_eq!(drops.get(), 1);
}

#[test]
fn raw_pointer_roundtrip() {
    let a = gc_new(Node::new(3));
    let recovered = gc_from(a.as_ptr());
    assert_eq!(recovered, a);
    assert_eq!(recovered.value, 3);

    // A pointer outside any payload yields a null handle.
    let local = 0i32;
    let missing = gc_from(&local as *const i32);
    assert!(missing.is_null());
}

#[test]
fn quiescent_collection_is_idempotent() {
    let root = gc_new(Node::new(1));
    collect_to_quiescence();
    let before = gc_stats();

    gc_collect(1_000_000);
    gc_collect(1_000_000);
    let after = gc_stats();

    assert_eq!(before.headers, after.headers);
    assert_eq!(after.headers, 1);
    assert_eq!(root.value, 1);
}

#[test]
fn explicit_delete_is_immediate_and_idempotent() {
    let drops = Rc::new(Cell::new(0));

    let mut a = gc_new(Node::counted(1, &drops));
    let alias = a.clone();

    gc_delete(&mut a);
    assert_eq!(drops.get(), 1);
    assert!(a.is_null());
    // The header lingers until the next sweep; aliases observe it as
    // destroyed.
    assert!(alias.is_destroyed());
    assert_eq!(gc_stats().headers, 1);

    // Deleting again through the alias is a no-op.
    let mut alias = alias;
    gc_delete(&mut alias);
    assert_eq!(drops.get(), 1);

    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 0);
}

#[test]
#[should_panic(expected = "destroyed")]
fn deref_of_destroyed_handle_panics() {
    let mut a = gc_new(Node::new(1));
    let alias = a.clone();
    gc_delete(&mut a);
    let _ = alias.value;
}

#[test]
fn dynamic_cast_checks_the_payload_type() {
    let node = gc_new(Node::new(9));
    let erased = node.erase();

    assert!(erased.is::<Node>());
    let back = erased.downcast::<Node>();
    assert!(!back.is_null());
    assert_eq!(back.value, 9);

    // Wrong type: null payload, header retained for inspection.
    let wrong = erased.downcast::<i32>();
    assert!(wrong.is_null());
    assert!(wrong.header().is_some());
    assert_eq!(wrong, node.dynamic_cast::<i32>());
}

#[test]
fn map_and_set_trace_their_values() {
    let drops = Rc::new(Cell::new(0));

    let map = gc_new_map::<i32, Node>();
    map.insert(1, gc_new(Node::counted(1, &drops)));
    map.insert(2, gc_new(Node::counted(2, &drops)));

    // The set deduplicates by value: two distinct objects holding 7
    // collapse to one member.
    let set = gc_new_set::<i32>();
    let first = gc_new(7);
    let second = gc_new(7);
    assert!(set.insert(first.clone()));
    assert!(!set.insert(second.clone()));
    assert!(set.insert(gc_new(9)));
    assert_eq!(set.len(), 2);
    assert!(set.contains(&7));
    assert!(!set.contains(&8));

    // Iteration runs in value order.
    let mut values = Vec::new();
    set.for_each(|item| values.push(**item));
    assert_eq!(values, vec![7, 9]);

    drop(first);
    drop(second);
    collect_to_quiescence();
    // Two container objects, two map nodes, and the two set members; the
    // rejected duplicate was reclaimed.
    assert_eq!(gc_stats().headers, 6);
    assert_eq!(drops.get(), 0);

    drop(map);
    drop(set);
    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 0);
    assert_eq!(drops.get(), 2);
}

#[test]
fn container_deep_destroy_runs_destructors() {
    let drops = Rc::new(Cell::new(0));

    let vec = gc_new_vec::<Node>();
    for i in 0..3 {
        vec.push(gc_new(Node::counted(i, &drops)));
    }

    vec.destroy_elements();
    // Destructors ran immediately; the vector object itself is untouched.
    assert_eq!(drops.get(), 3);
    assert_eq!(vec.len(), 0);

    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 1);
}

#[test]
fn extracted_element_outlives_the_container() {
    let vec = gc_new_vec::<Node>();
    vec.push(gc_new(Node::new(11)));

    // The popped handle must keep the node alive on its own.
    let popped = vec.pop().expect("one element");
    drop(vec);

    collect_to_quiescence();
    assert_eq!(gc_stats().headers, 1);
    assert_eq!(popped.value, 11);
}

#[test]
fn function_state_is_traced_and_callable() {
    let drops = Rc::new(Cell::new(0));

    struct Counter {
        base: Gc<Node>,
    }
    impl Trace for Counter {
        fn trace(&self, visitor: &mut Visitor<'_>) {
            visitor.visit(&self.base);
        }
    }

    let add = {
        let base = gc_new(Node::counted(100, &drops));
        GcFunction::<i32, i32>::new(Counter { base }, |state, n| state.base.value + n)
    };

    collect_to_quiescence();
    // The captured node survives through the function's state object.
    assert_eq!(drops.get(), 0);
    assert_eq!(add.call(1), 101);
    assert_eq!(add.clone().call(2), 102);

    let plain = GcFunction::<(i32, i32), i32>::from_fn(|(a, b)| a + b);
    assert_eq!(plain.call((2, 3)), 5);

    drop(add);
    collect_to_quiescence();
    assert_eq!(drops.get(), 1);
}
