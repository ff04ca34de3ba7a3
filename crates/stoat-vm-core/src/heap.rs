//! The object sets and heap accounting.
//!
//! Two sets partition every live allocation: the **regular** set of
//! collectible objects and the **root** set of pinned ones (protected and
//! eternal marks). Membership in exactly one set is an invariant; pin and
//! unpin move an object between the sets under the objects lock, which
//! makes them atomic with respect to sweep selection.
//!
//! The same lock guards the finalization queue and the weak-reference
//! table, so everything a sweep touches moves in one critical section.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::object::{ObjPtr, ObjRef, MARK_ETERNAL, MARK_PROTECTED, MARK_START};

/// Everything guarded by the objects lock.
pub struct HeapState {
    /// Collectible objects.
    pub regular: FxHashSet<ObjPtr>,
    /// Pinned objects: protected and eternal marks.
    pub roots: FxHashSet<ObjPtr>,
    /// Objects selected by a sweep, awaiting the finalizer thread.
    pub finalize_queue: Vec<ObjPtr>,
    /// Referent to weak-reference holders.
    pub weak_table: FxHashMap<ObjPtr, Vec<ObjPtr>>,
}

/// The objects lock and the state it guards.
pub fn heap() -> &'static Mutex<HeapState> {
    static HEAP: OnceLock<Mutex<HeapState>> = OnceLock::new();
    HEAP.get_or_init(|| {
        Mutex::new(HeapState {
            regular: FxHashSet::default(),
            roots: FxHashSet::default(),
            finalize_queue: Vec::new(),
            weak_table: FxHashMap::default(),
        })
    })
}

static HEAP_USAGE: AtomicI64 = AtomicI64::new(0);
static ALLOCATIONS_SINCE_COLLECTION: AtomicI64 = AtomicI64::new(0);
static LAST_COLLECTION_USAGE: AtomicI64 = AtomicI64::new(0);

/// Current managed heap usage in bytes, monitors and native buffers
/// included.
pub fn heap_usage() -> i64 {
    HEAP_USAGE.load(Ordering::Relaxed)
}

/// Adjust the heap-usage counter. Native code uses this for buffers whose
/// lifetime is tied to a managed object (array data, for one).
pub fn adjust_heap_usage(amount: i64) {
    HEAP_USAGE.fetch_add(amount, Ordering::Relaxed);
}

/// Allocations since the last collection finished.
pub fn allocations_since_collection() -> i64 {
    ALLOCATIONS_SINCE_COLLECTION.load(Ordering::Relaxed)
}

pub(crate) fn count_allocation() {
    ALLOCATIONS_SINCE_COLLECTION.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn reset_allocation_count() {
    ALLOCATIONS_SINCE_COLLECTION.store(0, Ordering::Relaxed);
}

/// Heap usage recorded at the end of the last collection.
pub fn last_collection_usage() -> i64 {
    LAST_COLLECTION_USAGE.load(Ordering::Relaxed)
}

pub(crate) fn record_collection_usage() {
    LAST_COLLECTION_USAGE.store(heap_usage(), Ordering::Relaxed);
}

/// Insert a freshly allocated object into the set matching its mark.
pub(crate) fn insert_object(object: ObjRef, mark: i32) {
    let mut heap = heap().lock();
    if mark == MARK_START {
        heap.regular.insert(ObjPtr(object));
    } else {
        heap.roots.insert(ObjPtr(object));
    }
}

/// Move an object into the root set under `mark`, unless it is already
/// there with that mark.
fn make_root(object: ObjRef, mark: i32) -> ObjRef {
    let mut heap = heap().lock();
    // SAFETY: caller holds a live reference; header reads are under the
    // objects lock.
    let header = unsafe { &*object };
    if header.mark() == mark {
        return object;
    }
    header.set_mark(mark);
    heap.regular.remove(&ObjPtr(object));
    heap.roots.insert(ObjPtr(object));
    object
}

/// Move an object back into the regular set if it currently carries
/// `expected` (one of the pinned marks), resetting the mark to the start of
/// the regular band.
fn make_regular(object: ObjRef, expected: i32) -> ObjRef {
    let mut heap = heap().lock();
    // SAFETY: as in make_root.
    let header = unsafe { &*object };
    if header.mark() != expected {
        return object;
    }
    header.set_mark(MARK_START);
    heap.roots.remove(&ObjPtr(object));
    heap.regular.insert(ObjPtr(object));
    object
}

/// Permanently exclude an object from collection.
pub fn make_eternal(object: ObjRef) -> ObjRef {
    make_root(object, MARK_ETERNAL)
}

/// Undo [`make_eternal`], returning the object to the collectible set.
pub fn make_ephemeral(object: ObjRef) -> ObjRef {
    make_regular(object, MARK_ETERNAL)
}

/// Pin an object while native code constructs around it. Eternal objects
/// stay eternal.
pub fn protect_object(object: ObjRef) -> ObjRef {
    // SAFETY: caller holds a live reference.
    if unsafe { &*object }.mark() == MARK_ETERNAL {
        return object;
    }
    make_root(object, MARK_PROTECTED)
}

/// Release a pin taken with [`protect_object`].
pub fn unprotect_object(object: ObjRef) -> ObjRef {
    make_regular(object, MARK_PROTECTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectHeader;

    fn fake_object(mark: i32) -> ObjRef {
        Box::into_raw(Box::new(ObjectHeader::new(
            std::ptr::null(),
            mark,
            std::ptr::null(),
            std::ptr::null_mut(),
        )))
    }

    fn in_regular(obj: ObjRef) -> bool {
        heap().lock().regular.contains(&ObjPtr(obj))
    }

    fn in_roots(obj: ObjRef) -> bool {
        heap().lock().roots.contains(&ObjPtr(obj))
    }

    #[test]
    fn pin_and_unpin_move_between_sets() {
        let obj = fake_object(MARK_START);
        insert_object(obj, MARK_START);
        assert!(in_regular(obj) && !in_roots(obj));

        protect_object(obj);
        assert!(!in_regular(obj) && in_roots(obj));
        // SAFETY: obj is live for the duration of the test.
        assert_eq!(unsafe { &*obj }.mark(), MARK_PROTECTED);

        unprotect_object(obj);
        assert!(in_regular(obj) && !in_roots(obj));
        // Back in the regular band, not a collected mark.
        assert_eq!(unsafe { &*obj }.mark(), MARK_START);
    }

    #[test]
    fn protect_keeps_eternal_objects_eternal() {
        let obj = fake_object(MARK_ETERNAL);
        insert_object(obj, MARK_ETERNAL);
        protect_object(obj);
        assert_eq!(unsafe { &*obj }.mark(), MARK_ETERNAL);
        assert!(in_roots(obj));
        // Unprotect on an eternal object is a no-op as well.
        unprotect_object(obj);
        assert!(in_roots(obj) && !in_regular(obj));
    }

    #[test]
    fn usage_counters_accumulate() {
        let before = heap_usage();
        adjust_heap_usage(128);
        assert_eq!(heap_usage(), before + 128);
        adjust_heap_usage(-128);
        assert_eq!(heap_usage(), before);
    }
}
