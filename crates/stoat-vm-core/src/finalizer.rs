//! Background finalization.
//!
//! A dedicated thread drains the finalization queue: for each selected
//! object it clears the weak references holding it, runs the finalize hook
//! (absorbing any managed exception), then in a second pass removes the
//! object from the regular set, releases the monitor, poisons the header,
//! and frees the storage.
//!
//! The finalizer is an ordinary mutator with its own context, so finalize
//! hooks may allocate, and the thread reaches a safepoint every iteration
//! so a collection can hold it like any other thread.

use std::alloc::Layout;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::builtin::{self, ThreadObject};
use crate::config::FINALIZER_POLL_MS;
use crate::context::{self, FrameGuard, FrameInfo, VmContext};
use crate::heap;
use crate::monitor::Monitor;
use crate::object::{ObjPtr, ObjectHeader, MARK_DESTROYED, MARK_FINALIZED};
use crate::safepoint;
use crate::throw::{self, VmResult};
use crate::weak;

static FINALIZER_FRAME_INFO: FrameInfo = FrameInfo {
    method: "stoat/GC.finalize",
    size: 0,
    locations: &[],
    exception_scopes: &[],
};

/// Entry point of the finalizer thread. Returns when shutdown unwinds it.
pub(crate) fn finalizer_main(ctx: Arc<VmContext>) {
    context::attach_thread(ctx.clone());
    let _ = run(&ctx);

    let thread = ctx.thread() as *mut ThreadObject;
    if !thread.is_null() {
        // SAFETY: thread records are eternal.
        unsafe { (*thread).alive.store(false, Ordering::Release) };
    }
    ctx.set_dead();
    ctx.set_suspended(true);
    context::detach_thread();
    tracing::debug!(target: "stoat::vm", "finalizer thread stopped");
}

fn run(ctx: &VmContext) -> VmResult<()> {
    let _frame = FrameGuard::enter(ctx, &FINALIZER_FRAME_INFO, std::ptr::null_mut())?;
    let mut batch: Vec<ObjPtr> = Vec::new();

    loop {
        {
            let mut heap_state = heap::heap().lock();
            if !heap_state.finalize_queue.is_empty() {
                batch = std::mem::take(&mut heap_state.finalize_queue);
                // SAFETY: queued objects stay allocated until destroyed
                // below.
                if unsafe { &*batch[0].0 }.vtable.is_null() {
                    // Corrupt queue entry: core invariant violation.
                    std::process::abort();
                }
            }
        }

        if !batch.is_empty() {
            finalize_batch(ctx, &batch)?;
            destroy_batch(&batch);
            tracing::trace!(
                target: "stoat::gc",
                count = batch.len(),
                heap_bytes = heap::heap_usage(),
                "finalization batch complete"
            );
            batch.clear();
        }

        std::thread::sleep(Duration::from_millis(FINALIZER_POLL_MS));
        safepoint::safepoint(ctx)?;
    }
}

/// Clear weak references and run finalize hooks. Exceptions thrown by a
/// finalizer are discarded; the exit sentinel propagates.
fn finalize_batch(ctx: &VmContext, batch: &[ObjPtr]) -> VmResult<()> {
    for object in batch {
        {
            let mut heap_state = heap::heap().lock();
            weak::clear_weaks_for(&mut heap_state, object.0);
        }
        // SAFETY: the object stays allocated until destroy_batch.
        let finalize = unsafe { builtin::finalize_fn_of(object.0) };
        throw::try_catch(
            ctx,
            Some(builtin::builtins().throwable),
            || finalize(ctx, object.0),
            |_discarded| Ok(()),
        )?;
        // SAFETY: as above.
        unsafe { (*object.0).set_mark(MARK_FINALIZED) };
    }
    Ok(())
}

/// Release storage for a finalized batch.
fn destroy_batch(batch: &[ObjPtr]) {
    for object in batch {
        {
            heap::heap().lock().regular.remove(object);
        }

        // SAFETY: the object is finalized but still allocated; this thread
        // is the only one destroying it.
        let (size, monitor) = unsafe {
            let header = &*object.0;
            let class = header.class();
            (
                class.size.max(std::mem::size_of::<ObjectHeader>()),
                header.monitor,
            )
        };

        heap::adjust_heap_usage(-((size + std::mem::size_of::<Monitor>()) as i64));

        // SAFETY: the monitor was boxed by the allocator and is unowned
        // now that the object is dead.
        unsafe { drop(Box::from_raw(monitor)) };

        // Poison the header so stale reads fail loudly, then free.
        // SAFETY: exclusive access as above; layout matches the allocation.
        unsafe {
            object.0.write(ObjectHeader::new(
                1 as *const _,
                MARK_DESTROYED,
                2 as *const _,
                3 as *mut _,
            ));
            std::alloc::dealloc(
                object.0 as *mut u8,
                Layout::from_size_align(size, 8).unwrap(),
            );
        }
    }
}
