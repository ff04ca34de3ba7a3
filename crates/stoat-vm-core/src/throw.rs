//! Exception propagation.
//!
//! A thrown managed exception is two things: the throwable object stored on
//! the context, and the [`Unwind::Throw`] sentinel carried in `Result` so
//! `?` leaves frames the way the native unwind path does in the generated
//! code. A frame that wants to handle the exception calls
//! [`find_exception_handler`] with its current location; a hit tells it
//! which handler scope to dispatch into after resetting its operand stack
//! and pushing the cleared exception.
//!
//! [`Unwind::Exit`] is the internal shutdown sentinel. It must never be
//! caught by generated code; only thread entry points swallow it.

use crate::builtin::{self, ThreadObject, ThrowableObject};
use crate::class::{self, Class};
use crate::context::{self, FrameInfo, VmContext};
use crate::heap;
use crate::intern;
use crate::object::ObjRef;

use std::sync::atomic::Ordering;

/// Unwind sentinel: why the current operation is leaving its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    /// A managed exception is pending on the context.
    Throw,
    /// The VM is shutting down; unwind to the thread entry point.
    Exit,
}

/// Result type used throughout the runtime's unwind-aware paths.
pub type VmResult<T = ()> = Result<T, Unwind>;

/// Store `exception` as the context's pending exception and begin
/// unwinding.
pub fn throw_exception(ctx: &VmContext, exception: ObjRef) -> Unwind {
    ctx.set_current_exception(exception);
    Unwind::Throw
}

/// Take the pending exception off the context, for handler dispatch.
pub fn clear_current_exception(ctx: &VmContext) -> ObjRef {
    ctx.clear_current_exception()
}

/// Find the first handler scope covering `location` whose filter accepts
/// the pending exception. Returns the 1-based scope index, or 0 when the
/// unwind should continue to the caller.
pub fn find_exception_handler(ctx: &VmContext, location: i32, info: &FrameInfo) -> i32 {
    let exception = ctx.current_exception();
    for (index, scope) in info.exception_scopes.iter().enumerate() {
        if location < scope.start || location > scope.end {
            continue;
        }
        if let Some(filter) = scope.class {
            if !class::is_instance(exception, filter) {
                continue;
            }
        }
        return (index + 1) as i32;
    }
    0
}

/// Raise null-pointer unless `object` is non-null.
#[inline]
pub fn null_check(ctx: &VmContext, object: ObjRef) -> VmResult<ObjRef> {
    if object.is_null() {
        return Err(throw_null_pointer(ctx));
    }
    Ok(object)
}

/// The interrupt checkpoint: reads and clears the thread's interrupt flag,
/// raising interrupted-exception when it was set.
pub fn interrupted_check(ctx: &VmContext) -> VmResult<()> {
    let thread = ctx.thread() as *mut ThreadObject;
    if thread.is_null() {
        return Ok(());
    }
    // SAFETY: the thread record is eternal and outlives the context.
    if unsafe { (*thread).interrupted.swap(false, Ordering::SeqCst) } {
        return Err(throw_interrupted(ctx));
    }
    Ok(())
}

/// Build a throwable of `class`, filling its message and stack strings.
/// The object is pinned while its fields are constructed.
pub fn construct_throwable(
    ctx: &VmContext,
    class: &'static Class,
    message: Option<&str>,
) -> VmResult<ObjRef> {
    let object = crate::alloc::alloc_protected(ctx, class)?;
    let throwable = object as *mut ThrowableObject;
    if let Some(text) = message {
        let string = intern::create_string(ctx, text)?;
        // SAFETY: object is live and pinned.
        unsafe { (*throwable).message = string as ObjRef };
    }
    let trace = context::capture_stack_trace(ctx);
    let stack = intern::create_string(ctx, &trace)?;
    // SAFETY: object is live and pinned.
    unsafe { (*throwable).stack = stack as ObjRef };
    heap::unprotect_object(object);
    Ok(object)
}

/// Construct an instance of `class` and throw it.
pub fn throw_new(ctx: &VmContext, class: &'static Class, message: Option<&str>) -> Unwind {
    match construct_throwable(ctx, class, message) {
        Ok(exception) => throw_exception(ctx, exception),
        Err(unwind) => unwind,
    }
}

/// Raise null-pointer.
pub fn throw_null_pointer(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().null_pointer, None)
}

/// Raise class-cast failure.
pub fn throw_class_cast(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().class_cast, None)
}

/// Raise arithmetic failure for an integer division by zero.
pub fn throw_division_by_zero(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().arithmetic, Some("Division by Zero"))
}

/// Raise array-bounds failure.
pub fn throw_index_out_of_bounds(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().index_out_of_bounds, None)
}

/// Raise illegal-argument.
pub fn throw_illegal_argument(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().illegal_argument, None)
}

/// Raise illegal-monitor-state.
pub fn throw_illegal_monitor_state(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().illegal_monitor_state, None)
}

/// Raise no-such-method.
pub fn throw_no_such_method(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().no_such_method, None)
}

/// Raise stack-overflow.
pub fn throw_stack_overflow(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().stack_overflow, None)
}

/// Raise out-of-memory. The allocator's per-thread flag keeps this from
/// recursing while the error object is built.
pub fn throw_out_of_memory(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().out_of_memory, None)
}

/// Raise interrupted-exception.
pub fn throw_interrupted(ctx: &VmContext) -> Unwind {
    throw_new(ctx, builtin::builtins().interrupted, None)
}

/// Raise a plain runtime exception with a message.
pub fn throw_runtime(ctx: &VmContext, message: &str) -> Unwind {
    throw_new(ctx, builtin::builtins().runtime_exception, Some(message))
}

/// Run `body`; when it throws an exception matching `filter` (or any
/// exception when `filter` is `None`), clear it and run `handler` instead.
/// The exit sentinel always propagates.
pub fn try_catch<T>(
    ctx: &VmContext,
    filter: Option<&'static Class>,
    body: impl FnOnce() -> VmResult<T>,
    handler: impl FnOnce(ObjRef) -> VmResult<T>,
) -> VmResult<T> {
    match body() {
        Err(Unwind::Throw) => {
            let exception = ctx.current_exception();
            if let Some(filter) = filter {
                if !class::is_instance(exception, filter) {
                    return Err(Unwind::Throw);
                }
            }
            let exception = ctx.clear_current_exception();
            handler(exception)
        }
        other => other,
    }
}

/// Run `body`, then `cleanup`, propagating `body`'s result. `cleanup` runs
/// on both the normal and the unwinding path.
pub fn try_finally<T>(body: impl FnOnce() -> VmResult<T>, cleanup: impl FnOnce()) -> VmResult<T> {
    let result = body();
    cleanup();
    result
}
