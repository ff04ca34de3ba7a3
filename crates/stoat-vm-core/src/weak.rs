//! The weak-reference table.
//!
//! A multimap from referent to the weak references holding it, guarded by
//! the objects lock. Entries are added when a weak reference is
//! constructed and removed either when the weak reference is finalized or
//! when its referent enters finalization, whichever comes first. Clearing
//! happens strictly before the referent's finalize hook runs, so weak
//! reads from a finalizer observe the cleared state.

use std::sync::atomic::Ordering;

use crate::alloc;
use crate::builtin::{self, WeakRefObject};
use crate::context::VmContext;
use crate::heap::{self, HeapState};
use crate::object::{ObjPtr, ObjRef};
use crate::throw::VmResult;

/// Allocate a weak reference to `referent` and index it in the table.
pub fn create_weak(ctx: &VmContext, referent: ObjRef) -> VmResult<*mut WeakRefObject> {
    let object = alloc::alloc(ctx, builtin::builtins().weak_reference)?;
    let weak = object as *mut WeakRefObject;
    // SAFETY: freshly allocated, zeroed weak record.
    unsafe { (*weak).referent.store(referent, Ordering::Release) };
    register_weak(weak);
    Ok(weak)
}

/// Index an existing weak reference under its referent.
pub fn register_weak(weak: *mut WeakRefObject) {
    // SAFETY: caller passes a live weak reference.
    let referent = unsafe { (*weak).referent.load(Ordering::Acquire) };
    if referent.is_null() {
        return;
    }
    heap::heap()
        .lock()
        .weak_table
        .entry(ObjPtr(referent))
        .or_default()
        .push(ObjPtr(weak as ObjRef));
}

/// Remove a weak reference from the table. No-op when the referent has
/// already been cleared (its entry went with it).
pub fn deregister_weak(weak: *mut WeakRefObject) {
    // SAFETY: caller passes a live weak reference.
    let referent = unsafe { (*weak).referent.load(Ordering::Acquire) };
    if referent.is_null() {
        return;
    }
    let mut heap = heap::heap().lock();
    if let Some(holders) = heap.weak_table.get_mut(&ObjPtr(referent)) {
        holders.retain(|holder| holder.0 != weak as ObjRef);
        if holders.is_empty() {
            heap.weak_table.remove(&ObjPtr(referent));
        }
    }
}

/// Read the referent, or null once it has been selected for collection.
pub fn weak_get(weak: *mut WeakRefObject) -> ObjRef {
    // SAFETY: caller passes a live weak reference.
    unsafe { (*weak).referent.load(Ordering::Acquire) }
}

/// Clear every weak reference holding `referent`. Runs in the finalization
/// phase, under the objects lock, before the referent's finalize hook.
pub(crate) fn clear_weaks_for(heap: &mut HeapState, referent: ObjRef) {
    if let Some(holders) = heap.weak_table.remove(&ObjPtr(referent)) {
        for holder in holders {
            let weak = holder.0 as *mut WeakRefObject;
            // SAFETY: weak references in the table are either live or in
            // the same finalization batch, whose storage is still intact.
            unsafe {
                (*weak)
                    .referent
                    .store(std::ptr::null_mut(), Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_tracks_and_clears_referent() {
        let builtins = builtin::builtins();
        let ctx = VmContext::new();
        let referent = alloc::alloc(&ctx, builtins.object).unwrap();
        let weak = create_weak(&ctx, referent).unwrap();

        assert_eq!(weak_get(weak), referent);
        assert!(heap::heap()
            .lock()
            .weak_table
            .contains_key(&ObjPtr(referent)));

        {
            let mut heap = heap::heap().lock();
            clear_weaks_for(&mut heap, referent);
            assert!(!heap.weak_table.contains_key(&ObjPtr(referent)));
        }
        assert!(weak_get(weak).is_null());
        VmContext::unregister(&ctx);
    }

    #[test]
    fn deregister_is_idempotent_after_clear() {
        let builtins = builtin::builtins();
        let ctx = VmContext::new();
        let referent = alloc::alloc(&ctx, builtins.object).unwrap();
        let weak = create_weak(&ctx, referent).unwrap();

        deregister_weak(weak);
        assert!(!heap::heap()
            .lock()
            .weak_table
            .contains_key(&ObjPtr(referent)));
        // Second removal finds nothing and does not disturb the table.
        deregister_weak(weak);
        assert_eq!(weak_get(weak), referent);
        VmContext::unregister(&ctx);
    }

    #[test]
    fn two_weaks_share_one_referent_entry() {
        let builtins = builtin::builtins();
        let ctx = VmContext::new();
        let referent = alloc::alloc(&ctx, builtins.object).unwrap();
        let w1 = create_weak(&ctx, referent).unwrap();
        let w2 = create_weak(&ctx, referent).unwrap();

        assert_eq!(
            heap::heap().lock().weak_table[&ObjPtr(referent)].len(),
            2
        );
        {
            let mut heap = heap::heap().lock();
            clear_weaks_for(&mut heap, referent);
        }
        assert!(weak_get(w1).is_null());
        assert!(weak_get(w2).is_null());
        VmContext::unregister(&ctx);
    }
}
