//! Per-thread context and the native stack-frame registry.
//!
//! Every mutator owns a [`VmContext`]: its frame stack, pending exception,
//! suspension state, and reference sets. Contexts are registered in a
//! process-wide list that the collector and the shutdown path walk; the
//! recursive critical lock guarding that list also serializes structural
//! collector phases.
//!
//! Generated methods open a [`FrameGuard`] on entry. The guard records the
//! caller-owned slot array so the collector can scan locals and operands,
//! checks the depth bound, and reaches a safepoint on both entry and exit.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};

use crate::class::Class;
use crate::config::MAX_STACK_DEPTH;
use crate::object::{ObjPtr, ObjRef, ObjectHeader, Slot};
use crate::safepoint;
use crate::throw::{self, VmResult};

/// A source location entry of a frame-info record.
#[derive(Debug, Clone, Copy)]
pub struct FrameLocation {
    /// Source line number.
    pub line: i32,
}

/// One exception-handler scope of a method. Locations are indices into the
/// method's location table; the range is inclusive on both ends.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionScope {
    /// First covered location index.
    pub start: i32,
    /// Last covered location index, inclusive.
    pub end: i32,
    /// Exception class filter; `None` catches everything.
    pub class: Option<&'static Class>,
}

/// Static description of a method's frame, emitted once per method by the
/// code generator.
#[derive(Debug)]
pub struct FrameInfo {
    /// Qualified method name.
    pub method: &'static str,
    /// Number of slots in the frame data array.
    pub size: usize,
    /// Location table, indexed by the frame's current location.
    pub locations: &'static [FrameLocation],
    /// Handler scopes in declaration order.
    pub exception_scopes: &'static [ExceptionScope],
}

/// An active stack frame.
pub struct Frame {
    /// The method's static frame description.
    pub info: &'static FrameInfo,
    data: *mut Slot,
    /// Current location index, or -1 before the first location.
    pub location: i32,
    /// Nested local-reference frames opened by foreign code.
    pub local_refs: Vec<Vec<ObjPtr>>,
}

// SAFETY: the raw slot pointer is dereferenced only by the owning thread or
// by the collector while the owning thread is suspended.
unsafe impl Send for Frame {}

impl Frame {
    /// Read one slot of the frame data.
    ///
    /// # Safety
    /// Caller must be the owning thread, or the owning thread must be
    /// suspended at a safepoint (stop-the-world scan).
    #[inline]
    pub unsafe fn slot(&self, index: usize) -> Slot {
        if self.data.is_null() || index >= self.info.size {
            return Slot::null();
        }
        // SAFETY: in bounds per the check above; stability per the contract.
        unsafe { self.data.add(index).read() }
    }
}

/// Per-thread state owned by the runtime.
pub struct VmContext {
    pub(crate) frames: Mutex<Vec<Frame>>,
    current_exception: AtomicPtr<ObjectHeader>,
    bridge_exception: AtomicPtr<ObjectHeader>,
    thread: AtomicPtr<ObjectHeader>,
    pub(crate) suspended: AtomicBool,
    blocked_by: AtomicPtr<ObjectHeader>,
    dead: AtomicBool,
    pub(crate) global_refs: Mutex<Vec<ObjPtr>>,
    pub(crate) oom_reporting: AtomicBool,
}

impl VmContext {
    /// Create a context and register it in the process-wide list.
    pub fn new() -> Arc<VmContext> {
        let ctx = Arc::new(VmContext {
            frames: Mutex::new(Vec::new()),
            current_exception: AtomicPtr::new(std::ptr::null_mut()),
            bridge_exception: AtomicPtr::new(std::ptr::null_mut()),
            thread: AtomicPtr::new(std::ptr::null_mut()),
            suspended: AtomicBool::new(false),
            blocked_by: AtomicPtr::new(std::ptr::null_mut()),
            dead: AtomicBool::new(false),
            global_refs: Mutex::new(Vec::new()),
            oom_reporting: AtomicBool::new(false),
        });
        let guard = critical_lock();
        guard.borrow_mut().push(ctx.clone());
        ctx
    }

    /// Remove a context from the process-wide list.
    pub fn unregister(ctx: &Arc<VmContext>) {
        let guard = critical_lock();
        guard
            .borrow_mut()
            .retain(|c| !std::ptr::eq(Arc::as_ptr(c), Arc::as_ptr(ctx)));
    }

    /// Stable identity of this context.
    #[inline]
    pub fn id(&self) -> *const VmContext {
        self as *const VmContext
    }

    /// The pending exception, or null.
    #[inline]
    pub fn current_exception(&self) -> ObjRef {
        self.current_exception.load(Ordering::Acquire)
    }

    /// Install the pending exception.
    #[inline]
    pub fn set_current_exception(&self, exception: ObjRef) {
        self.current_exception.store(exception, Ordering::Release);
    }

    /// Take and clear the pending exception.
    pub fn clear_current_exception(&self) -> ObjRef {
        self.current_exception
            .swap(std::ptr::null_mut(), Ordering::AcqRel)
    }

    /// The buffered foreign-call exception, or null.
    #[inline]
    pub fn bridge_exception(&self) -> ObjRef {
        self.bridge_exception.load(Ordering::Acquire)
    }

    /// Set or clear the buffered foreign-call exception.
    #[inline]
    pub fn set_bridge_exception(&self, exception: ObjRef) {
        self.bridge_exception.store(exception, Ordering::Release);
    }

    /// The managed thread record, or null before attach.
    #[inline]
    pub fn thread(&self) -> ObjRef {
        self.thread.load(Ordering::Acquire)
    }

    /// Install the managed thread record.
    pub fn set_thread(&self, thread: ObjRef) {
        self.thread.store(thread, Ordering::Release);
    }

    /// Whether this context counts as stopped for the collector.
    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// The object whose monitor this thread is blocked on, or null.
    #[inline]
    pub fn blocked_by(&self) -> ObjRef {
        self.blocked_by.load(Ordering::Acquire)
    }

    pub(crate) fn set_blocked_by(&self, object: ObjRef) {
        self.blocked_by.store(object, Ordering::Release);
    }

    /// Whether this context has terminated. Dead contexts are skipped by
    /// the stop-the-world coordinator.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Mark this context terminated.
    pub fn set_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Current frame depth.
    pub fn stack_depth(&self) -> usize {
        self.frames.lock().len()
    }
}

static CONTEXTS: ReentrantMutex<RefCell<Vec<Arc<VmContext>>>> =
    ReentrantMutex::new(RefCell::new(Vec::new()));

/// Acquire the recursive critical lock guarding the context list. The
/// collector holds this across its structural phases; context creation and
/// destruction take it for the list update.
pub fn critical_lock() -> ReentrantMutexGuard<'static, RefCell<Vec<Arc<VmContext>>>> {
    CONTEXTS.lock()
}

/// Run `f` over every registered context, under the critical lock.
pub fn each_context(mut f: impl FnMut(&Arc<VmContext>)) {
    let guard = critical_lock();
    for ctx in guard.borrow().iter() {
        f(ctx);
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<VmContext>>> = const { RefCell::new(None) };
}

/// Bind a context to the current OS thread.
pub fn attach_thread(ctx: Arc<VmContext>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(ctx));
}

/// Unbind the current OS thread's context.
pub fn detach_thread() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// The context bound to the current OS thread, if any.
pub fn current_context() -> Option<Arc<VmContext>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// RAII frame registration. Entry reaches a safepoint and enforces the
/// depth bound; exit reaches a safepoint and pops the frame.
pub struct FrameGuard<'a> {
    ctx: &'a VmContext,
}

impl<'a> FrameGuard<'a> {
    /// Push a frame for `info` with the caller-owned slot array `data`
    /// (`data` may be null when `info.size` is zero).
    pub fn enter(
        ctx: &'a VmContext,
        info: &'static FrameInfo,
        data: *mut Slot,
    ) -> VmResult<FrameGuard<'a>> {
        safepoint::safepoint(ctx)?;
        {
            let mut frames = ctx.frames.lock();
            // Equality check leaves headroom so the throw path itself can
            // still push the frames it needs.
            if frames.len() == MAX_STACK_DEPTH - 10 {
                drop(frames);
                return Err(throw::throw_stack_overflow(ctx));
            }
            frames.push(Frame {
                info,
                data,
                location: -1,
                local_refs: Vec::new(),
            });
        }
        Ok(FrameGuard { ctx })
    }

    /// Record the current location index for handler lookup and traces.
    pub fn set_location(&self, location: i32) {
        if let Some(frame) = self.ctx.frames.lock().last_mut() {
            frame.location = location;
        }
    }

    /// The current location index.
    pub fn location(&self) -> i32 {
        self.ctx.frames.lock().last().map_or(-1, |f| f.location)
    }

    /// Open a nested local-reference frame for foreign code.
    pub fn push_local_frame(&self) {
        if let Some(frame) = self.ctx.frames.lock().last_mut() {
            frame.local_refs.push(Vec::new());
        }
    }

    /// Close the innermost local-reference frame.
    pub fn pop_local_frame(&self) {
        if let Some(frame) = self.ctx.frames.lock().last_mut() {
            frame.local_refs.pop();
        }
    }

    /// Track `object` in the innermost local-reference frame so it stays
    /// reachable while foreign code holds it.
    pub fn add_local(&self, object: ObjRef) {
        if object.is_null() {
            return;
        }
        if let Some(frame) = self.ctx.frames.lock().last_mut() {
            if let Some(local) = frame.local_refs.last_mut() {
                local.push(ObjPtr(object));
            }
        }
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        // The exit sentinel is swallowed here; the stack keeps unwinding.
        let _ = safepoint::safepoint(self.ctx);
        let mut frames = self.ctx.frames.lock();
        debug_assert!(!frames.is_empty(), "no stack frame to pop");
        frames.pop();
    }
}

/// Render the context's stack, innermost frame first, as `method:line`
/// lines. Used to fill a throwable's stack string.
pub fn capture_stack_trace(ctx: &VmContext) -> String {
    let frames = ctx.frames.lock();
    let mut out = String::new();
    for frame in frames.iter().rev() {
        let line = if frame.location >= 0 {
            frame
                .info
                .locations
                .get(frame.location as usize)
                .map_or(-1, |l| l.line)
        } else {
            -1
        };
        out.push_str(frame.info.method);
        out.push(':');
        out.push_str(&line.to_string());
        out.push('\n');
    }
    out
}
