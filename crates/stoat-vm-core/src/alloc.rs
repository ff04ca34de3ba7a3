//! The allocator.
//!
//! `alloc` is the sole entry point for managed storage. The caller must be
//! at a safepoint: crossing a collection threshold runs the collector
//! synchronously on the allocating thread before the new object exists.
//!
//! Three spellings choose the initial mark: regular (collectible),
//! protected (caller unpins after construction), eternal.

use std::alloc::Layout;

use crate::class::Class;
use crate::collector;
use crate::config;
use crate::context::VmContext;
use crate::heap;
use crate::monitor::Monitor;
use crate::object::{ObjRef, ObjectHeader, MARK_ETERNAL, MARK_PROTECTED, MARK_START};
use crate::throw::{self, VmResult};

use std::sync::atomic::Ordering;

/// Allocate a collectible instance of `class`.
pub fn alloc(ctx: &VmContext, class: &'static Class) -> VmResult<ObjRef> {
    alloc_object(ctx, class, MARK_START)
}

/// Allocate a pinned instance; the caller unpins once every reference is
/// safely stored. Prefer keeping references on a stack frame.
pub fn alloc_protected(ctx: &VmContext, class: &'static Class) -> VmResult<ObjRef> {
    alloc_object(ctx, class, MARK_PROTECTED)
}

/// Allocate an instance that is never collected.
pub fn alloc_eternal(ctx: &VmContext, class: &'static Class) -> VmResult<ObjRef> {
    alloc_object(ctx, class, MARK_ETERNAL)
}

fn alloc_object(ctx: &VmContext, class: &'static Class, mark: i32) -> VmResult<ObjRef> {
    // Collection triggers: total heap, growth since the last cycle, and
    // allocation count. Collecting on every allocation is a useful setting
    // for flushing out reachability bugs.
    if heap::heap_usage() > config::heap_threshold()
        || heap::heap_usage() - heap::last_collection_usage() > config::mem_threshold()
        || heap::allocations_since_collection() > config::object_threshold()
    {
        collector::collect(ctx)?;
    }

    if heap::heap_usage() > config::oom_threshold() && !ctx.oom_reporting.load(Ordering::Relaxed) {
        // The flag suppresses recursive out-of-memory while the error
        // object itself is being constructed.
        ctx.oom_reporting.store(true, Ordering::Relaxed);
        let unwind = throw::throw_out_of_memory(ctx);
        ctx.oom_reporting.store(false, Ordering::Relaxed);
        return Err(unwind);
    }

    let size = class.size.max(std::mem::size_of::<ObjectHeader>());
    let layout = Layout::from_size_align(size, 8).unwrap();
    // SAFETY: layout is non-zero sized.
    let object = unsafe { std::alloc::alloc_zeroed(layout) } as ObjRef;
    if object.is_null() {
        std::alloc::handle_alloc_error(layout);
    }

    heap::adjust_heap_usage((size + std::mem::size_of::<Monitor>()) as i64);
    heap::count_allocation();

    // SAFETY: object is a fresh allocation of at least header size.
    unsafe {
        object.write(ObjectHeader::new(
            class,
            mark,
            class.vtable.as_ptr(),
            Box::into_raw(Box::new(Monitor::new())),
        ));
    }

    heap::insert_object(object, mark);
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin;
    use crate::object::ObjPtr;

    #[test]
    fn fresh_objects_join_the_regular_set_at_mark_start() {
        let builtins = builtin::builtins();
        let ctx = VmContext::new();
        let before = heap::heap_usage();

        let obj = alloc(&ctx, builtins.object).unwrap();
        // SAFETY: obj is live, nothing collects in this test.
        let header = unsafe { &*obj };
        assert_eq!(header.mark(), MARK_START);
        assert!(std::ptr::eq(header.class, builtins.object));
        assert!(heap::heap()
            .lock()
            .regular
            .contains(&ObjPtr(obj)));
        assert!(heap::heap_usage() > before);
        VmContext::unregister(&ctx);
    }

    #[test]
    fn pinned_spellings_join_the_root_set() {
        let builtins = builtin::builtins();
        let ctx = VmContext::new();

        let protected = alloc_protected(&ctx, builtins.object).unwrap();
        let eternal = alloc_eternal(&ctx, builtins.object).unwrap();
        let heap = heap::heap().lock();
        assert!(heap.roots.contains(&ObjPtr(protected)));
        assert!(heap.roots.contains(&ObjPtr(eternal)));
        assert!(!heap.regular.contains(&ObjPtr(protected)));
        drop(heap);
        // SAFETY: both objects are live.
        unsafe {
            assert_eq!((*protected).mark(), MARK_PROTECTED);
            assert_eq!((*eternal).mark(), MARK_ETERNAL);
        }
        VmContext::unregister(&ctx);
    }

    #[test]
    fn payload_is_zeroed() {
        let builtins = builtin::builtins();
        let ctx = VmContext::new();
        let obj = alloc(&ctx, builtins.string).unwrap();
        let string = obj as *mut builtin::StringObject;
        // SAFETY: a string payload follows the header; freshly zeroed.
        unsafe {
            assert!((*string).value.is_null());
            assert_eq!((*string).count, 0);
        }
        VmContext::unregister(&ctx);
    }
}
