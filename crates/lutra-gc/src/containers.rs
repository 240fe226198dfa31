//! Collected container wrappers
//!
//! Each wrapper is a managed object holding handles to its elements; the
//! elements are traced through the container's `Trace` implementation, so
//! they stay alive exactly as long as the container (or another root)
//! reaches them.
//!
//! Extraction methods (`pop`, `remove`, `get`) hand back a *fresh* root
//! handle rather than the stored one: a handle that has been classified as
//! embedded must not migrate to the stack, where the collector has no way
//! to reclassify it.
//!
//! Interior mutability uses `RefCell`; do not hold a borrow across a
//! [`gc_collect`](crate::gc_collect) call.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, LinkedList, VecDeque};

use rustc_hash::FxHashMap;

use crate::handle::Gc;
use crate::heap::{gc_delete, gc_new};
use crate::trace::{Trace, Visitor};

macro_rules! wrapper_common {
    ($name:ident) => {
        impl<T: Trace + 'static> Clone for $name<T> {
            fn clone(&self) -> Self {
                Self {
                    inner: self.inner.clone(),
                }
            }
        }

        impl<T: Trace + 'static> Trace for $name<T> {
            fn trace(&self, visitor: &mut Visitor<'_>) {
                visitor.visit(&self.inner);
            }
        }

        impl<T: Trace + 'static> PartialEq for $name<T> {
            fn eq(&self, other: &Self) -> bool {
                self.inner == other.inner
            }
        }
    };
}

/// Re-root a handle extracted from container storage.
fn reroot<T: Trace + 'static>(stored: Gc<T>) -> Gc<T> {
    let fresh = stored.clone();
    drop(stored);
    fresh
}

// ---------------------------------------------------------------
// Vector
// ---------------------------------------------------------------

/// Growable array of handles on the collected heap.
pub struct GcVec<T: Trace + 'static> {
    inner: Gc<RefCell<Vec<Gc<T>>>>,
}

wrapper_common!(GcVec);

/// Allocate an empty [`GcVec`].
pub fn gc_new_vec<T: Trace + 'static>() -> GcVec<T> {
    GcVec {
        inner: gc_new(RefCell::new(Vec::new())),
    }
}

impl<T: Trace + 'static> GcVec<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// True when the vector holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a handle.
    pub fn push(&self, value: Gc<T>) {
        self.inner.borrow_mut().push(value);
    }

    /// Remove and return the last element.
    pub fn pop(&self) -> Option<Gc<T>> {
        let stored = self.inner.borrow_mut().pop()?;
        Some(reroot(stored))
    }

    /// Handle to element `index`.
    pub fn get(&self, index: usize) -> Option<Gc<T>> {
        self.inner.borrow().get(index).cloned()
    }

    /// Replace element `index`, returning the previous handle.
    pub fn set(&self, index: usize, value: Gc<T>) -> Gc<T> {
        let stored = std::mem::replace(&mut self.inner.borrow_mut()[index], value);
        reroot(stored)
    }

    /// Drop all element handles.
    pub fn clear(&self) {
        self.inner.borrow_mut().clear();
    }

    /// Visit every element handle in order.
    pub fn for_each(&self, mut f: impl FnMut(&Gc<T>)) {
        for item in self.inner.borrow().iter() {
            f(item);
        }
    }

    /// Explicitly destroy every element, then clear.
    ///
    /// The container object itself stays alive; see
    /// [`gc_delete`](crate::gc_delete) for the destruction semantics.
    pub fn destroy_elements(&self) {
        let mut inner = self.inner.borrow_mut();
        for item in inner.iter_mut() {
            gc_delete(item);
        }
        inner.clear();
    }
}

// ---------------------------------------------------------------
// Deque
// ---------------------------------------------------------------

/// Double-ended queue of handles on the collected heap.
pub struct GcDeque<T: Trace + 'static> {
    inner: Gc<RefCell<VecDeque<Gc<T>>>>,
}

wrapper_common!(GcDeque);

/// Allocate an empty [`GcDeque`].
pub fn gc_new_deque<T: Trace + 'static>() -> GcDeque<T> {
    GcDeque {
        inner: gc_new(RefCell::new(VecDeque::new())),
    }
}

impl<T: Trace + 'static> GcDeque<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// True when the deque holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append at the back.
    pub fn push_back(&self, value: Gc<T>) {
        self.inner.borrow_mut().push_back(value);
    }

    /// Prepend at the front.
    pub fn push_front(&self, value: Gc<T>) {
        self.inner.borrow_mut().push_front(value);
    }

    /// Remove and return the back element.
    pub fn pop_back(&self) -> Option<Gc<T>> {
        let stored = self.inner.borrow_mut().pop_back()?;
        Some(reroot(stored))
    }

    /// Remove and return the front element.
    pub fn pop_front(&self) -> Option<Gc<T>> {
        let stored = self.inner.borrow_mut().pop_front()?;
        Some(reroot(stored))
    }

    /// Visit every element handle, front to back.
    pub fn for_each(&self, mut f: impl FnMut(&Gc<T>)) {
        for item in self.inner.borrow().iter() {
            f(item);
        }
    }

    /// Explicitly destroy every element, then clear.
    pub fn destroy_elements(&self) {
        let mut inner = self.inner.borrow_mut();
        for item in inner.iter_mut() {
            gc_delete(item);
        }
        inner.clear();
    }
}

// ---------------------------------------------------------------
// List
// ---------------------------------------------------------------

/// Linked list of handles on the collected heap.
pub struct GcList<T: Trace + 'static> {
    inner: Gc<RefCell<LinkedList<Gc<T>>>>,
}

wrapper_common!(GcList);

/// Allocate an empty [`GcList`].
pub fn gc_new_list<T: Trace + 'static>() -> GcList<T> {
    GcList {
        inner: gc_new(RefCell::new(LinkedList::new())),
    }
}

impl<T: Trace + 'static> GcList<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// True when the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append at the back.
    pub fn push_back(&self, value: Gc<T>) {
        self.inner.borrow_mut().push_back(value);
    }

    /// Prepend at the front.
    pub fn push_front(&self, value: Gc<T>) {
        self.inner.borrow_mut().push_front(value);
    }

    /// Remove and return the back element.
    pub fn pop_back(&self) -> Option<Gc<T>> {
        let stored = self.inner.borrow_mut().pop_back()?;
        Some(reroot(stored))
    }

    /// Remove and return the front element.
    pub fn pop_front(&self) -> Option<Gc<T>> {
        let stored = self.inner.borrow_mut().pop_front()?;
        Some(reroot(stored))
    }

    /// Visit every element handle, front to back.
    pub fn for_each(&self, mut f: impl FnMut(&Gc<T>)) {
        for item in self.inner.borrow().iter() {
            f(item);
        }
    }

    /// Explicitly destroy every element, then clear.
    pub fn destroy_elements(&self) {
        let mut inner = self.inner.borrow_mut();
        for item in inner.iter_mut() {
            gc_delete(item);
        }
        inner.clear();
    }
}

// ---------------------------------------------------------------
// Ordered map
// ---------------------------------------------------------------

/// Ordered map from plain keys to handles on the collected heap.
///
/// Keys are ordinary values; handles are not usable as keys.
pub struct GcMap<K: Ord + 'static, V: Trace + 'static> {
    inner: Gc<RefCell<BTreeMap<K, Gc<V>>>>,
}

/// Allocate an empty [`GcMap`].
pub fn gc_new_map<K: Ord + 'static, V: Trace + 'static>() -> GcMap<K, V> {
    GcMap {
        inner: gc_new(RefCell::new(BTreeMap::new())),
    }
}

impl<K: Ord + 'static, V: Trace + 'static> Clone for GcMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Ord + 'static, V: Trace + 'static> Trace for GcMap<K, V> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit(&self.inner);
    }
}

impl<K: Ord + 'static, V: Trace + 'static> GcMap<K, V> {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an entry, returning the handle it displaced, if any.
    pub fn insert(&self, key: K, value: Gc<V>) -> Option<Gc<V>> {
        let stored = self.inner.borrow_mut().insert(key, value)?;
        Some(reroot(stored))
    }

    /// Handle stored under `key`.
    pub fn get(&self, key: &K) -> Option<Gc<V>> {
        self.inner.borrow().get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.borrow().contains_key(key)
    }

    /// Remove and return the entry under `key`.
    pub fn remove(&self, key: &K) -> Option<Gc<V>> {
        let stored = self.inner.borrow_mut().remove(key)?;
        Some(reroot(stored))
    }

    /// Visit every entry in key order.
    pub fn for_each(&self, mut f: impl FnMut(&K, &Gc<V>)) {
        for (key, value) in self.inner.borrow().iter() {
            f(key, value);
        }
    }

    /// Explicitly destroy every value, then clear.
    pub fn destroy_elements(&self) {
        let mut inner = self.inner.borrow_mut();
        for value in inner.values_mut() {
            gc_delete(value);
        }
        inner.clear();
    }
}

// ---------------------------------------------------------------
// Hash map
// ---------------------------------------------------------------

/// Hash map from plain keys to handles on the collected heap.
pub struct GcHashMap<K: std::hash::Hash + Eq + 'static, V: Trace + 'static> {
    inner: Gc<RefCell<FxHashMap<K, Gc<V>>>>,
}

/// Allocate an empty [`GcHashMap`].
pub fn gc_new_hash_map<K: std::hash::Hash + Eq + 'static, V: Trace + 'static>() -> GcHashMap<K, V>
{
    GcHashMap {
        inner: gc_new(RefCell::new(FxHashMap::default())),
    }
}

impl<K: std::hash::Hash + Eq + 'static, V: Trace + 'static> Clone for GcHashMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: std::hash::Hash + Eq + 'static, V: Trace + 'static> Trace for GcHashMap<K, V> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit(&self.inner);
    }
}

impl<K: std::hash::Hash + Eq + 'static, V: Trace + 'static> GcHashMap<K, V> {
    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an entry, returning the handle it displaced, if any.
    pub fn insert(&self, key: K, value: Gc<V>) -> Option<Gc<V>> {
        let stored = self.inner.borrow_mut().insert(key, value)?;
        Some(reroot(stored))
    }

    /// Handle stored under `key`.
    pub fn get(&self, key: &K) -> Option<Gc<V>> {
        self.inner.borrow().get(key).cloned()
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.borrow().contains_key(key)
    }

    /// Remove and return the entry under `key`.
    pub fn remove(&self, key: &K) -> Option<Gc<V>> {
        let stored = self.inner.borrow_mut().remove(key)?;
        Some(reroot(stored))
    }

    /// Visit every entry in arbitrary order.
    pub fn for_each(&self, mut f: impl FnMut(&K, &Gc<V>)) {
        for (key, value) in self.inner.borrow().iter() {
            f(key, value);
        }
    }

    /// Explicitly destroy every value, then clear.
    pub fn destroy_elements(&self) {
        let mut inner = self.inner.borrow_mut();
        for value in inner.values_mut() {
            gc_delete(value);
        }
        inner.clear();
    }
}

// ---------------------------------------------------------------
// Set
// ---------------------------------------------------------------

/// Set member ordered by its referent's value.
struct ByValue<T: Trace + Ord + 'static>(Gc<T>);

impl<T: Trace + Ord + 'static> Trace for ByValue<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit(&self.0);
    }
}

impl<T: Trace + Ord + 'static> PartialEq for ByValue<T> {
    fn eq(&self, other: &Self) -> bool {
        *self.0 == *other.0
    }
}

impl<T: Trace + Ord + 'static> Eq for ByValue<T> {}

impl<T: Trace + Ord + 'static> PartialOrd for ByValue<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Trace + Ord + 'static> Ord for ByValue<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self.0).cmp(&*other.0)
    }
}

impl<T: Trace + Ord + 'static> std::borrow::Borrow<T> for ByValue<T> {
    fn borrow(&self) -> &T {
        &*self.0
    }
}

/// Ordered set of handles on the collected heap, deduplicated by the
/// referents' values.
///
/// Two handles whose referents compare equal collapse to one member, and
/// iteration runs in value order. Members must stay comparable while
/// stored: do not mutate their ordering-relevant state or explicitly
/// destroy them through an outside handle (use
/// [`GcSet::destroy_elements`] instead). Null handles are not storable.
pub struct GcSet<T: Trace + Ord + 'static> {
    inner: Gc<RefCell<BTreeSet<ByValue<T>>>>,
}

impl<T: Trace + Ord + 'static> Clone for GcSet<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Trace + Ord + 'static> Trace for GcSet<T> {
    fn trace(&self, visitor: &mut Visitor<'_>) {
        visitor.visit(&self.inner);
    }
}

impl<T: Trace + Ord + 'static> PartialEq for GcSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

/// Allocate an empty [`GcSet`].
pub fn gc_new_set<T: Trace + Ord + 'static>() -> GcSet<T> {
    GcSet {
        inner: gc_new(RefCell::new(BTreeSet::new())),
    }
}

impl<T: Trace + Ord + 'static> GcSet<T> {
    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.borrow().len()
    }

    /// True when the set holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a handle; returns false when an equal value was already
    /// present (or the handle is null or destroyed), keeping the existing
    /// member.
    pub fn insert(&self, value: Gc<T>) -> bool {
        if value.is_destroyed() {
            return false;
        }
        self.inner.borrow_mut().insert(ByValue(value))
    }

    /// Whether a member equal to `value` is present.
    pub fn contains(&self, value: &T) -> bool {
        self.inner.borrow().contains(value)
    }

    /// Remove the member equal to `value`, returning its handle.
    pub fn remove(&self, value: &T) -> Option<Gc<T>> {
        let stored = self.inner.borrow_mut().take(value)?;
        Some(reroot(stored.0))
    }

    /// Visit every element handle in value order.
    pub fn for_each(&self, mut f: impl FnMut(&Gc<T>)) {
        for item in self.inner.borrow().iter() {
            f(&item.0);
        }
    }

    /// Explicitly destroy every element, then clear.
    pub fn destroy_elements(&self) {
        let mut inner = self.inner.borrow_mut();
        for item in inner.iter() {
            if let Some(header) = item.0.header() {
                header.destroy();
            }
        }
        inner.clear();
    }
}
