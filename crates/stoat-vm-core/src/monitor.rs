//! Per-object monitors.
//!
//! Every managed object owns a monitor: a re-entrant lock plus a condition
//! variable with its own condition mutex. Re-entrance is owner identity and
//! a depth counter over a non-recursive raw lock, the usual fat-monitor
//! construction.
//!
//! The rule that keeps the collector alive: **a thread blocked on a monitor
//! must appear suspended**. Contended acquisition publishes `blocked_by`
//! and raises the suspended flag before blocking, so a collection started
//! by another thread does not wait for this one.

use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};
use std::time::Duration;

use parking_lot::lock_api::RawMutex as RawMutexApi;
use parking_lot::{Condvar, Mutex, RawMutex};

use crate::context::VmContext;
use crate::object::ObjRef;
use crate::safepoint;
use crate::throw::{self, VmResult};

/// Re-entrant mutual exclusion and condition variable for one object.
pub struct Monitor {
    raw: RawMutex,
    owner: AtomicPtr<VmContext>,
    depth: AtomicI32,
    cond: Condvar,
    cond_lock: Mutex<()>,
}

impl Monitor {
    /// A fresh, unowned monitor.
    pub fn new() -> Monitor {
        Monitor {
            raw: RawMutex::INIT,
            owner: AtomicPtr::new(std::ptr::null_mut()),
            depth: AtomicI32::new(0),
            cond: Condvar::new(),
            cond_lock: Mutex::new(()),
        }
    }

    /// Current recursion depth; 0 when unowned.
    pub fn depth(&self) -> i32 {
        self.depth.load(Ordering::Acquire)
    }

    fn owned_by(&self, ctx: &VmContext) -> bool {
        self.owner.load(Ordering::Acquire) == ctx.id() as *mut VmContext
    }

    /// Wake every waiter without an ownership check. Shutdown and interrupt
    /// delivery use this to unblock threads parked in `wait`.
    pub(crate) fn force_notify_all(&self) {
        let _guard = self.cond_lock.lock();
        self.cond.notify_all();
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Monitor::new()
    }
}

/// The monitor of a live object.
///
/// # Safety
/// `object` must reference a live managed object; the monitor pointer is
/// valid until the finalizer destroys the object.
unsafe fn monitor_of(object: ObjRef) -> &'static Monitor {
    // SAFETY: per the function contract.
    unsafe { &*(*object).monitor }
}

/// Acquire `object`'s monitor, blocking on contention. Re-entrant.
pub fn enter(ctx: &VmContext, object: ObjRef) -> VmResult<()> {
    let object = throw::null_check(ctx, object)?;
    // SAFETY: null-checked above; object is live while the caller holds it.
    let monitor = unsafe { monitor_of(object) };
    let me = ctx.id() as *mut VmContext;

    if monitor.owner.load(Ordering::Acquire) == me {
        monitor.depth.fetch_add(1, Ordering::AcqRel);
        return Ok(());
    }
    if monitor.raw.try_lock() {
        monitor.owner.store(me, Ordering::Release);
        monitor.depth.store(1, Ordering::Release);
        return Ok(());
    }

    // Contended: publish what we are blocked on and count as suspended so
    // the collector does not wait for this thread.
    ctx.set_blocked_by(object);
    ctx.set_suspended(true);

    monitor.raw.lock();
    monitor.owner.store(me, Ordering::Release);
    monitor.depth.store(1, Ordering::Release);

    ctx.set_blocked_by(std::ptr::null_mut());
    ctx.set_suspended(false);

    safepoint::safepoint(ctx)
}

/// Release one level of `object`'s monitor. Raises illegal-monitor-state
/// when the calling thread is not the owner.
pub fn exit(ctx: &VmContext, object: ObjRef) -> VmResult<()> {
    let object = throw::null_check(ctx, object)?;
    // SAFETY: null-checked above.
    let monitor = unsafe { monitor_of(object) };
    owner_check(ctx, object)?;
    if monitor.depth.fetch_sub(1, Ordering::AcqRel) - 1 == 0 {
        monitor.owner.store(std::ptr::null_mut(), Ordering::Release);
        // SAFETY: the calling thread holds the raw lock (owner check).
        unsafe { monitor.raw.unlock() };
    }
    Ok(())
}

/// Raise illegal-monitor-state unless the calling thread owns `object`'s
/// monitor.
pub fn owner_check(ctx: &VmContext, object: ObjRef) -> VmResult<()> {
    // SAFETY: callers null-check first.
    let monitor = unsafe { monitor_of(object) };
    if !monitor.owned_by(ctx) {
        return Err(throw::throw_illegal_monitor_state(ctx));
    }
    Ok(())
}

/// Wait on `object`'s condition variable, releasing the monitor's full
/// recursion depth and restoring it on wakeup. Delivers a pending interrupt
/// after reacquisition.
pub fn wait(ctx: &VmContext, object: ObjRef, timeout: Option<Duration>) -> VmResult<()> {
    let object = throw::null_check(ctx, object)?;
    // SAFETY: null-checked above.
    let monitor = unsafe { monitor_of(object) };
    owner_check(ctx, object)?;

    let me = ctx.id() as *mut VmContext;
    let saved_depth = monitor.depth.swap(0, Ordering::AcqRel);

    // Take the condition mutex before releasing the monitor so a notify
    // between release and park cannot be lost.
    let mut guard = monitor.cond_lock.lock();
    monitor.owner.store(std::ptr::null_mut(), Ordering::Release);
    // SAFETY: the calling thread holds the raw lock (owner check).
    unsafe { monitor.raw.unlock() };

    ctx.set_blocked_by(object);
    ctx.set_suspended(true);

    match timeout {
        Some(t) => {
            let _ = monitor.cond.wait_for(&mut guard, t);
        }
        None => monitor.cond.wait(&mut guard),
    }
    drop(guard);

    monitor.raw.lock();
    monitor.owner.store(me, Ordering::Release);
    monitor.depth.store(saved_depth, Ordering::Release);

    ctx.set_blocked_by(std::ptr::null_mut());
    ctx.set_suspended(false);

    safepoint::safepoint(ctx)?;
    throw::interrupted_check(ctx)
}

/// Wake one waiter on `object`'s condition variable. Caller must own the
/// monitor.
pub fn notify(ctx: &VmContext, object: ObjRef) -> VmResult<()> {
    let object = throw::null_check(ctx, object)?;
    owner_check(ctx, object)?;
    // SAFETY: null-checked above.
    let monitor = unsafe { monitor_of(object) };
    let _guard = monitor.cond_lock.lock();
    monitor.cond.notify_one();
    Ok(())
}

/// Wake every waiter on `object`'s condition variable. Caller must own the
/// monitor.
pub fn notify_all(ctx: &VmContext, object: ObjRef) -> VmResult<()> {
    let object = throw::null_check(ctx, object)?;
    owner_check(ctx, object)?;
    // SAFETY: null-checked above.
    let monitor = unsafe { monitor_of(object) };
    let _guard = monitor.cond_lock.lock();
    monitor.cond.notify_all();
    Ok(())
}
