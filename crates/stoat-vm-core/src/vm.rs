//! VM lifecycle.
//!
//! Initialization registers the built-in descriptors, creates the main
//! context, and starts the finalizer thread. Mutator threads run their
//! entry points through [`thread_entrypoint`], which owns the outermost
//! frame, swallows the shutdown sentinel, and reports uncaught exceptions.
//! Shutdown raises the exiting flag, broadcasts to monitor-blocked
//! threads, and waits a bounded time for everything to die.

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::builtin::{self, StringObject, ThreadObject, ThrowableObject};
use crate::config::SHUTDOWN_TIMEOUT_MS;
use crate::context::{self, FrameGuard, FrameInfo, VmContext};
use crate::error::VmError;
use crate::finalizer;
use crate::intern;
use crate::object::ObjRef;
use crate::safepoint;
use crate::throw::{Unwind, VmResult};

static THREAD_FRAME_INFO: FrameInfo = FrameInfo {
    method: "stoat/Thread.run",
    size: 0,
    locations: &[],
    exception_scopes: &[],
};

/// Initialize the VM: built-in classes, the finalizer thread, and the main
/// context, attached to the calling thread.
pub fn init_vm() -> Arc<VmContext> {
    builtin::builtins();
    start_finalizer();

    let main = VmContext::new();
    let _ = builtin::create_thread_record(&main, "main");
    context::attach_thread(main.clone());
    tracing::info!(target: "stoat::vm", "VM initialized");
    main
}

fn start_finalizer() {
    static STARTED: OnceLock<()> = OnceLock::new();
    STARTED.get_or_init(|| {
        let ctx = VmContext::new();
        let _ = builtin::create_thread_record(&ctx, "finalizer");
        std::thread::Builder::new()
            .name("stoat-finalizer".into())
            .spawn(move || finalizer::finalizer_main(ctx))
            .expect("failed to spawn the finalizer thread");
    });
}

/// Run a mutator entry point on the calling thread: outer frame, uncaught
/// exception reporting, death bookkeeping. The shutdown sentinel is
/// swallowed here and nowhere else.
pub fn thread_entrypoint(
    ctx: &VmContext,
    body: impl FnOnce(&VmContext) -> VmResult<()>,
) -> Result<(), VmError> {
    let result = (|| {
        let _frame = FrameGuard::enter(ctx, &THREAD_FRAME_INFO, std::ptr::null_mut())?;
        body(ctx)
    })();

    let thread = ctx.thread() as *mut ThreadObject;
    if !thread.is_null() {
        // SAFETY: thread records are eternal.
        unsafe { (*thread).alive.store(false, Ordering::Release) };
    }
    ctx.set_dead();
    ctx.set_suspended(true);

    match result {
        Ok(()) | Err(Unwind::Exit) => Ok(()),
        Err(Unwind::Throw) => {
            let exception = ctx.clear_current_exception();
            let (class, message) = describe_throwable(exception);
            let thread = thread_name(ctx);
            tracing::error!(
                target: "stoat::thread",
                thread = %thread,
                class = %class,
                message = %message,
                "uncaught exception"
            );
            Err(VmError::UncaughtException {
                thread,
                class,
                message,
            })
        }
    }
}

/// Spawn a mutator thread with its own context and eternal thread record.
/// Uncaught exceptions in the body are logged, not propagated.
pub fn spawn_thread(
    name: &str,
    body: impl FnOnce(&VmContext) -> VmResult<()> + Send + 'static,
) -> VmResult<Arc<VmContext>> {
    if safepoint::vm_exiting() {
        return Err(Unwind::Exit);
    }
    let ctx = VmContext::new();
    if let Err(unwind) = builtin::create_thread_record(&ctx, name) {
        VmContext::unregister(&ctx);
        return Err(unwind);
    }

    let entry_ctx = ctx.clone();
    tracing::debug!(target: "stoat::thread", name, "spawning mutator thread");
    std::thread::Builder::new()
        .name(format!("stoat-{name}"))
        .spawn(move || {
            context::attach_thread(entry_ctx.clone());
            let _ = thread_entrypoint(&entry_ctx, body);
            context::detach_thread();
        })
        .expect("failed to spawn a mutator thread");
    Ok(ctx)
}

/// Initialize, run `main` on the calling thread, then shut down.
pub fn run_vm(main: impl FnOnce(&VmContext) -> VmResult<()>) -> Result<(), VmError> {
    if safepoint::vm_exiting() {
        return Err(VmError::ShuttingDown);
    }
    let ctx = init_vm();
    let result = thread_entrypoint(&ctx, main);
    shutdown_vm(&ctx);
    result
}

/// Deliver an interrupt: set the target's flag and wake it if it is parked
/// in a monitor wait. The target observes the interrupt at its next
/// checkpoint.
pub fn interrupt(target: &VmContext) {
    let thread = target.thread() as *mut ThreadObject;
    if thread.is_null() {
        return;
    }
    // SAFETY: thread records are eternal.
    unsafe { (*thread).interrupted.store(true, Ordering::SeqCst) };

    let blocked = target.blocked_by();
    if !blocked.is_null() {
        // SAFETY: an object a thread is blocked on is reachable from that
        // thread and therefore live.
        unsafe { (*(*blocked).monitor).force_notify_all() };
    }
}

/// Shut down the VM. Raises the exiting flag, repeatedly broadcasts to
/// monitor-blocked threads, and waits up to the shutdown timeout for every
/// context to die. Threads that never reach a safepoint are abandoned when
/// the bound expires; the process is expected to exit regardless.
pub fn shutdown_vm(ctx: &VmContext) {
    if safepoint::vm_exiting() {
        return;
    }
    safepoint::request_exit();

    ctx.set_dead();
    ctx.set_suspended(true);
    let thread = ctx.thread() as *mut ThreadObject;
    if !thread.is_null() {
        // SAFETY: thread records are eternal.
        unsafe { (*thread).alive.store(false, Ordering::Release) };
    }

    let deadline = Instant::now() + Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
    while Instant::now() < deadline {
        safepoint::raise_suspend_flag();
        let mut done = true;
        context::each_context(|other| {
            if other.is_dead() {
                return;
            }
            done = false;
            let blocked = other.blocked_by();
            if !blocked.is_null() {
                // SAFETY: as in interrupt.
                unsafe { (*(*blocked).monitor).force_notify_all() };
            }
        });
        if done {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    tracing::info!(target: "stoat::vm", "VM shut down");
}

fn thread_name(ctx: &VmContext) -> String {
    let thread = ctx.thread() as *mut ThreadObject;
    if thread.is_null() {
        return "<unattached>".into();
    }
    // SAFETY: thread records are eternal; the name string is reachable
    // through the record.
    let name = unsafe { (*thread).name } as *mut StringObject;
    if name.is_null() {
        return "<unnamed>".into();
    }
    intern::string_to_native(name)
}

fn describe_throwable(exception: ObjRef) -> (String, String) {
    if exception.is_null() {
        return ("<none>".into(), String::new());
    }
    // SAFETY: the pending exception is live; throwables lay out per the
    // built-in contract.
    unsafe {
        let class = (*exception).class().name.to_string();
        let message = (*(exception as *mut ThrowableObject)).message as *mut StringObject;
        (class, intern::string_to_native(message))
    }
}
