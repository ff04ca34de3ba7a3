//! The garbage collector.
//!
//! Non-moving, tri-partitioned mark-and-sweep. A cycle stops the world,
//! rotates the current mark through the regular band, traces the root set,
//! class statics, and every thread's frames and reference lists, drains the
//! deep-mark list, and finally sweeps the regular set: anything carrying a
//! stale regular-band mark moves to the finalization queue. The background
//! finalizer does the actual destruction.
//!
//! Mark callbacks recurse through object graphs; past [`MAX_MARK_DEPTH`]
//! they defer to an iterative worklist instead, which bounds native stack
//! use on long chains.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::class;
use crate::config::MAX_MARK_DEPTH;
use crate::context::{self, FrameGuard, FrameInfo, VmContext};
use crate::heap::{self, HeapState};
use crate::object::{ObjPtr, ObjRef, DEPTH_ALWAYS, MARK_COLLECTED, MARK_END, MARK_START};
use crate::safepoint::StopTheWorld;
use crate::throw::VmResult;

static RUNNING: AtomicBool = AtomicBool::new(false);
static CURRENT_MARK: AtomicI32 = AtomicI32::new(MARK_START);
static DEEP_LIST: Mutex<Vec<ObjPtr>> = Mutex::new(Vec::new());

/// The mark value of the cycle in progress (or the last one).
pub fn current_mark() -> i32 {
    CURRENT_MARK.load(Ordering::Relaxed)
}

/// Common prologue for mark callbacks: band filtering, deep-mark deferral,
/// and the mark stamp. Returns whether the callback should go on to trace
/// the object's fields.
///
/// At [`DEPTH_ALWAYS`] the band filter is bypassed so pinned objects get
/// their fields traced without losing their special mark.
pub fn should_mark(object: ObjRef, mark: i32, depth: i32) -> bool {
    // SAFETY: mark callbacks only run inside a stop-the-world phase, when
    // every candidate object is stable.
    let header = unsafe { &*object };
    let current = header.mark();
    if depth > DEPTH_ALWAYS && (current < MARK_START || current == mark) {
        return false;
    }
    if depth > MAX_MARK_DEPTH {
        mark_deep(object);
        return false;
    }
    if current >= MARK_START {
        header.set_mark(mark);
    }
    true
}

/// Dispatch the mark callback of `object`'s class. Null-tolerant, so mark
/// callbacks can trace optional fields without a check.
pub fn trace(object: ObjRef, mark: i32, depth: i32) {
    if object.is_null() {
        return;
    }
    // SAFETY: see should_mark.
    let class = unsafe { (*object).class() };
    (class.mark_fn)(object, mark, depth);
}

/// Defer `object` to the iterative deep-mark worklist.
pub fn mark_deep(object: ObjRef) {
    DEEP_LIST.lock().push(ObjPtr(object));
}

static GC_FRAME_INFO: FrameInfo = FrameInfo {
    method: "stoat/GC.collect",
    size: 0,
    locations: &[],
    exception_scopes: &[],
};

/// Run a collection cycle on the calling thread. The caller must be at a
/// safepoint. When a cycle is already in progress on another thread, this
/// polls the safepoint instead, so the in-flight cycle can stop this
/// thread rather than spin on it.
pub fn collect(ctx: &VmContext) -> VmResult<()> {
    if RUNNING.swap(true, Ordering::SeqCst) {
        return crate::safepoint::safepoint(ctx);
    }
    let result = run_cycle(ctx);
    RUNNING.store(false, Ordering::SeqCst);
    result
}

fn run_cycle(ctx: &VmContext) -> VmResult<()> {
    let _frame = FrameGuard::enter(ctx, &GC_FRAME_INFO, std::ptr::null_mut())?;
    let started = Instant::now();

    // On the exit sentinel the suspend flag stays raised; every thread is
    // unwinding to its death anyway.
    let stw = StopTheWorld::begin(ctx)?;
    let critical = context::critical_lock();
    let mut heap_state = heap::heap().lock();

    let mark = advance_mark();
    DEEP_LIST.lock().clear();

    tracing::debug!(
        target: "stoat::gc",
        mark,
        heap_bytes = heap::heap_usage(),
        regular = heap_state.regular.len(),
        roots = heap_state.roots.len(),
        "collection cycle starting"
    );

    // Pinned objects keep their special marks but their children are
    // reachable unconditionally.
    for object in heap_state.roots.iter() {
        trace(object.0, mark, DEPTH_ALWAYS);
    }

    // Class statics. A mark callback invoked with a null object marks the
    // class's static fields only.
    for class in class::all_classes() {
        (class.mark_fn)(std::ptr::null_mut(), mark, DEPTH_ALWAYS);
    }

    // Per-thread state: buffered and pending exceptions, global references,
    // bridge-local references, and every frame slot that currently holds a
    // registered collectible object.
    context::each_context(|thread_ctx| {
        trace(thread_ctx.bridge_exception(), mark, 0);
        trace(thread_ctx.current_exception(), mark, 0);
        for global in thread_ctx.global_refs.lock().iter() {
            trace(global.0, mark, 0);
        }
        let frames = thread_ctx.frames.lock();
        for frame in frames.iter() {
            for local_frame in &frame.local_refs {
                for local in local_frame {
                    trace(local.0, mark, 0);
                }
            }
            for index in 0..frame.info.size {
                // SAFETY: the owning thread is suspended or is the
                // collecting thread itself; slots are stable.
                let candidate = unsafe { frame.slot(index).obj };
                if !candidate.is_null() && heap_state.regular.contains(&ObjPtr(candidate)) {
                    trace(candidate, mark, 0);
                }
            }
        }
    });

    // Drain chains that were too deep to mark recursively.
    loop {
        let deep = {
            let mut list = DEEP_LIST.lock();
            if list.is_empty() {
                break;
            }
            std::mem::take(&mut *list)
        };
        for object in deep {
            trace(object.0, mark, 0);
        }
    }

    // Sweep: stale regular-band marks are unreachable this cycle.
    let mut selected = 0usize;
    let HeapState {
        regular,
        finalize_queue,
        ..
    } = &mut *heap_state;
    for object in regular.iter() {
        // SAFETY: set members are live until the finalizer destroys them,
        // which cannot happen while this thread holds the objects lock.
        let header = unsafe { &*object.0 };
        let current = header.mark();
        if current < MARK_START || current == mark {
            continue;
        }
        if header.vtable.is_null() || current <= MARK_COLLECTED {
            // A selected object with a nonsense vtable or an impossible
            // mark means the object model is corrupt.
            std::process::abort();
        }
        header.set_mark(MARK_COLLECTED);
        finalize_queue.push(*object);
        selected += 1;
    }

    heap::reset_allocation_count();

    drop(heap_state);
    drop(critical);
    drop(stw);

    heap::record_collection_usage();

    tracing::debug!(
        target: "stoat::gc",
        mark,
        selected,
        heap_bytes = heap::heap_usage(),
        pause_us = started.elapsed().as_micros() as u64,
        "collection cycle complete"
    );

    Ok(())
}

fn advance_mark() -> i32 {
    let next = match CURRENT_MARK.load(Ordering::Relaxed) {
        m if m >= MARK_END => MARK_START + 1,
        m => m + 1,
    };
    CURRENT_MARK.store(next, Ordering::Relaxed);
    next
}
