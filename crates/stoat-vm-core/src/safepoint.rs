//! Safepoints and stop-the-world coordination.
//!
//! A single global flag is the stop-the-world trigger. Mutators poll it at
//! frame entry and exit, at monitor acquisition, and on return from the
//! foreign-function bridge; a thread that sees the flag marks itself
//! suspended and spins until the flag clears. Threads that are already
//! suspended (blocked on a monitor, dead, or inside a native prologue) are
//! implicitly at a safepoint, so the coordinator never waits on them.
//!
//! All mutable reads of the object sets, the class registry, and frame data
//! happen either inside a stop-the-world phase, under the objects lock, or
//! both.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::builtin;
use crate::context::{self, VmContext};
use crate::throw::{Unwind, VmResult};

static SUSPEND_VM: AtomicBool = AtomicBool::new(false);
static EXITING: AtomicBool = AtomicBool::new(false);

// Serializes transitions of the suspend flag so overlapping collections and
// shutdown do not interleave set/clear.
static SUSPEND_MUTEX: Mutex<()> = Mutex::new(());

/// Whether a stop-the-world phase has been requested.
#[inline]
pub fn suspend_requested() -> bool {
    SUSPEND_VM.load(Ordering::Acquire)
}

/// Whether the VM is shutting down.
#[inline]
pub fn vm_exiting() -> bool {
    EXITING.load(Ordering::Acquire)
}

/// Enter the shutdown state. Suspended threads unwind with the exit
/// sentinel the next time they poll.
pub fn request_exit() {
    EXITING.store(true, Ordering::Release);
}

pub(crate) fn raise_suspend_flag() {
    let _guard = SUSPEND_MUTEX.lock();
    SUSPEND_VM.store(true, Ordering::Release);
}

/// Poll the stop-the-world flag. Returns the exit sentinel when the VM is
/// shutting down while this thread is held at the safepoint.
#[inline]
pub fn safepoint(ctx: &VmContext) -> VmResult<()> {
    if suspend_requested() {
        suspend_self(ctx)?;
    }
    Ok(())
}

/// Suspend the calling thread until the stop-the-world phase ends.
fn suspend_self(ctx: &VmContext) -> VmResult<()> {
    ctx.set_suspended(true);
    while suspend_requested() {
        if vm_exiting() {
            // Leave the suspended flag set: this thread is unwinding to
            // its death and must keep counting as stopped.
            return Err(Unwind::Exit);
        }
        std::hint::spin_loop();
    }
    ctx.set_suspended(false);
    Ok(())
}

/// An active stop-the-world phase. Constructed by the collector; dropping
/// it releases the mutators.
pub struct StopTheWorld {
    _private: (),
}

impl StopTheWorld {
    /// Raise the suspend flag and wait for every other registered context
    /// to report suspended or dead.
    pub(crate) fn begin(self_ctx: &VmContext) -> VmResult<StopTheWorld> {
        raise_suspend_flag();
        loop {
            if vm_exiting() {
                return Err(Unwind::Exit);
            }
            let mut blocked = false;
            context::each_context(|ctx| {
                if std::ptr::eq(ctx.id(), self_ctx.id()) {
                    return;
                }
                if !ctx.is_suspended() && !ctx.is_dead() && builtin::thread_alive(ctx) {
                    blocked = true;
                }
            });
            if !blocked {
                return Ok(StopTheWorld { _private: () });
            }
            std::thread::yield_now();
        }
    }
}

impl Drop for StopTheWorld {
    fn drop(&mut self) {
        let _guard = SUSPEND_MUTEX.lock();
        SUSPEND_VM.store(false, Ordering::Release);
    }
}
