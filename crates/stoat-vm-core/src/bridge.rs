//! The foreign-function bridge contract.
//!
//! Foreign code runs inside [`call_native`]: a bridge frame with a fresh
//! local-reference frame, a cleared exception buffer, and a safepoint on
//! the way out. A managed exception raised by the callee goes through the
//! context's bridge slot and is re-thrown on return.
//!
//! Foreign code that blocks (sleep, I/O) must mark the context suspended
//! for the duration and reach a safepoint afterwards; the bridge clears
//! the suspension flag on entry per that contract.

use crate::context::{FrameGuard, FrameInfo, VmContext};
use crate::object::{ObjPtr, ObjRef};
use crate::safepoint;
use crate::throw::{self, VmResult};

static BRIDGE_FRAME_INFO: FrameInfo = FrameInfo {
    method: "stoat/Bridge.call",
    size: 0,
    locations: &[],
    exception_scopes: &[],
};

/// Invoke foreign code with the bridge protocol around it.
pub fn call_native<R>(ctx: &VmContext, callee: impl FnOnce(&VmContext) -> R) -> VmResult<R> {
    let frame = FrameGuard::enter(ctx, &BRIDGE_FRAME_INFO, std::ptr::null_mut())?;
    ctx.set_bridge_exception(std::ptr::null_mut());
    frame.push_local_frame();
    ctx.set_suspended(false);

    let result = callee(ctx);

    frame.pop_local_frame();
    let pending = ctx.bridge_exception();
    if !pending.is_null() {
        ctx.set_bridge_exception(std::ptr::null_mut());
        return Err(throw::throw_exception(ctx, pending));
    }
    safepoint::safepoint(ctx)?;
    Ok(result)
}

/// Report a managed exception from inside a foreign call. The bridge
/// re-throws it when the call returns.
pub fn raise_in_native(ctx: &VmContext, exception: ObjRef) {
    ctx.set_bridge_exception(exception);
}

/// Track `object` in the innermost local-reference frame so the collector
/// sees it while foreign code holds it.
pub fn add_local_ref(ctx: &VmContext, object: ObjRef) {
    if object.is_null() {
        return;
    }
    if let Some(frame) = ctx.frames.lock().last_mut() {
        if let Some(local) = frame.local_refs.last_mut() {
            local.push(ObjPtr(object));
        }
    }
}

/// Hold `object` reachable until the matching [`delete_global_ref`].
pub fn new_global_ref(ctx: &VmContext, object: ObjRef) {
    if object.is_null() {
        return;
    }
    ctx.global_refs.lock().push(ObjPtr(object));
}

/// Release one global reference to `object`.
pub fn delete_global_ref(ctx: &VmContext, object: ObjRef) {
    let mut globals = ctx.global_refs.lock();
    if let Some(position) = globals.iter().position(|g| g.0 == object) {
        globals.remove(position);
    }
}
