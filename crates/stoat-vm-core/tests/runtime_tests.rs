//! Runtime correctness tests.
//!
//! These drive the collector, the finalizer, weak references, monitors,
//! and the exception machinery through the public surface, the way
//! generated code would. Collection needs every other mutator suspended or
//! dead, so the tests serialize on one lock and retire their contexts on
//! the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use stoat_vm_core::builtin::{self, ThrowableObject};
use stoat_vm_core::class::{self, Class, ClassDef};
use stoat_vm_core::context::{self, FrameGuard, FrameInfo, VmContext};
use stoat_vm_core::object::{ObjPtr, ObjRef, ObjectHeader, Slot, MARK_PROTECTED};
use stoat_vm_core::throw::{self, Unwind, VmResult};
use stoat_vm_core::{alloc, collector, config, heap, intern, monitor, vm, weak};

fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Initialize the VM once; the fixture's own main context retires
/// immediately so it never holds up a stop-the-world phase.
fn ensure_vm() {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let main = vm::init_vm();
        main.set_dead();
        VmContext::unregister(&main);
        context::detach_thread();
    });
}

/// Run a test body with a live context and thread record, retiring both
/// afterwards.
fn with_vm<T>(name: &str, body: impl FnOnce(&Arc<VmContext>) -> T) -> T {
    let _guard = test_lock();
    ensure_vm();
    config::reset_thresholds();

    let ctx = VmContext::new();
    builtin::create_thread_record(&ctx, name).unwrap();
    let result = body(&ctx);

    ctx.set_dead();
    VmContext::unregister(&ctx);
    result
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn allocation_triggers_collection() {
    with_vm("alloc-trigger", |ctx| {
        config::set_object_threshold(1000);
        let builtins = builtin::builtins();

        let mut peak = heap::heap_usage();
        for _ in 0..2000 {
            // No references retained: everything here is garbage.
            alloc::alloc(ctx, builtins.object).unwrap();
            peak = peak.max(heap::heap_usage());
        }
        config::reset_thresholds();

        // The allocation counter was reset by a cycle inside the loop.
        assert!(
            heap::allocations_since_collection() < 2000,
            "no collection ran during the loop"
        );
        // Once the finalizer drains, usage falls below the loop's peak.
        wait_until("heap usage to drop below its peak", || {
            heap::heap_usage() < peak
        });
    });
}

#[test]
fn weak_reference_is_cleared_by_collection() {
    with_vm("weak-clear", |ctx| {
        let builtins = builtin::builtins();
        let referent = alloc::alloc(ctx, builtins.object).unwrap();
        let weak = weak::create_weak(ctx, referent).unwrap();
        // Keep the weak reference itself alive across the cycle.
        heap::protect_object(weak as ObjRef);

        assert_eq!(weak::weak_get(weak), referent);
        collector::collect(ctx).unwrap();
        wait_until("the weak reference to clear", || {
            weak::weak_get(weak).is_null()
        });

        heap::unprotect_object(weak as ObjRef);
    });
}

#[test]
fn pinned_object_survives_collection_until_unpinned() {
    with_vm("pin-survives", |ctx| {
        let builtins = builtin::builtins();
        let object = alloc::alloc_protected(ctx, builtins.object).unwrap();
        let watcher = weak::create_weak(ctx, object).unwrap();
        heap::protect_object(watcher as ObjRef);

        collector::collect(ctx).unwrap();
        collector::collect(ctx).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        // Still pinned, still valid.
        // SAFETY: the pin guarantees liveness.
        assert_eq!(unsafe { &*object }.mark(), MARK_PROTECTED);
        assert!(!weak::weak_get(watcher).is_null());

        heap::unprotect_object(object);
        collector::collect(ctx).unwrap();
        wait_until("the unpinned object to be finalized", || {
            weak::weak_get(watcher).is_null()
        });

        heap::unprotect_object(watcher as ObjRef);
    });
}

/// A linked-list node the way generated code would lay one out.
#[repr(C)]
struct Node {
    header: ObjectHeader,
    next: ObjRef,
}

fn mark_node(object: ObjRef, mark: i32, depth: i32) {
    if object.is_null() {
        return;
    }
    if !collector::should_mark(object, mark, depth) {
        return;
    }
    let node = object as *mut Node;
    // SAFETY: mark callbacks run on stable objects.
    collector::trace(unsafe { (*node).next }, mark, depth + 1);
}

fn node_class() -> &'static Class {
    static CLASS: OnceLock<&'static Class> = OnceLock::new();
    *CLASS.get_or_init(|| {
        let builtins = builtin::builtins();
        class::register_class(ClassDef {
            parent: Some(builtins.object),
            vtable: builtins.object.vtable,
            mark_fn: mark_node,
            ..ClassDef::new("test/it/LinkedNode", std::mem::size_of::<Node>())
        })
    })
}

#[test]
fn deep_chain_is_marked_without_deep_recursion() {
    with_vm("deep-chain", |ctx| {
        const CHAIN: usize = 10_000;

        let head = alloc::alloc_protected(ctx, node_class()).unwrap();
        let mut tail = head;
        for _ in 1..CHAIN {
            let node = alloc::alloc(ctx, node_class()).unwrap();
            // SAFETY: tail is reachable from the pinned head.
            unsafe { (*(tail as *mut Node)).next = node };
            tail = node;
        }
        let watcher = weak::create_weak(ctx, tail).unwrap();
        heap::protect_object(watcher as ObjRef);

        // The whole chain is reachable from the pinned head; marking it
        // must not overflow the native stack.
        collector::collect(ctx).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!weak::weak_get(watcher).is_null());

        heap::unprotect_object(head);
        collector::collect(ctx).unwrap();
        wait_until("the dropped chain to be reclaimed", || {
            weak::weak_get(watcher).is_null()
        });

        heap::unprotect_object(watcher as ObjRef);
    });
}

#[test]
fn frame_slots_keep_objects_reachable() {
    with_vm("frame-roots", |ctx| {
        static INFO: FrameInfo = FrameInfo {
            method: "test/it/FrameRoots.run",
            size: 1,
            locations: &[],
            exception_scopes: &[],
        };
        let builtins = builtin::builtins();

        let mut slots = [Slot::null(); 1];
        let object = alloc::alloc(ctx, builtins.object).unwrap();
        slots[0] = Slot::from_obj(object);
        let watcher = weak::create_weak(ctx, object).unwrap();
        heap::protect_object(watcher as ObjRef);

        {
            let _frame = FrameGuard::enter(ctx, &INFO, slots.as_mut_ptr()).unwrap();
            collector::collect(ctx).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            // Held by a live frame slot: not collected.
            assert!(!weak::weak_get(watcher).is_null());
        }

        collector::collect(ctx).unwrap();
        wait_until("the popped frame's object to be reclaimed", || {
            weak::weak_get(watcher).is_null()
        });
        heap::unprotect_object(watcher as ObjRef);
    });
}

#[test]
fn interrupt_wakes_a_monitor_wait() {
    with_vm("interrupt", |ctx| {
        let builtins = builtin::builtins();
        let object = alloc::alloc_eternal(ctx, builtins.object).unwrap();
        let lock = ObjPtr(object);

        let waiting = Arc::new(AtomicBool::new(false));
        let interrupted = Arc::new(AtomicBool::new(false));
        let waiting_flag = waiting.clone();
        let interrupted_flag = interrupted.clone();

        let worker = vm::spawn_thread("waiter", move |worker_ctx| {
            let lock = lock;
            let object = lock.0;
            monitor::enter(worker_ctx, object)?;
            waiting_flag.store(true, Ordering::SeqCst);
            // Bounded wait: the interrupt should arrive long before it
            // expires either way.
            match monitor::wait(worker_ctx, object, Some(Duration::from_secs(5))) {
                Err(Unwind::Throw) => {
                    let pending = worker_ctx.clear_current_exception();
                    if class::is_instance(pending, builtin::builtins().interrupted) {
                        interrupted_flag.store(true, Ordering::SeqCst);
                    }
                }
                other => other?,
            }
            monitor::exit(worker_ctx, object)
        })
        .unwrap();

        wait_until("the worker to start waiting", || {
            waiting.load(Ordering::SeqCst)
        });
        std::thread::sleep(Duration::from_millis(10));
        vm::interrupt(&worker);

        wait_until("the worker to observe the interrupt", || {
            worker.is_dead()
        });
        assert!(interrupted.load(Ordering::SeqCst));
    });
}

/// Drives a hand-written method body through the handler-dispatch protocol
/// generated code uses: on a throw, look up the handler for the current
/// location, reset the operand stack, push the exception, and resume at
/// the handler.
fn dispatch_with_handlers(
    ctx: &VmContext,
    info: &'static FrameInfo,
    location: i32,
    body: impl Fn(&VmContext) -> VmResult<i32>,
) -> VmResult<i32> {
    let mut slots = [Slot::null(); 4];
    let frame = FrameGuard::enter(ctx, info, slots.as_mut_ptr())?;
    frame.set_location(location);
    match body(ctx) {
        Err(Unwind::Throw) => {
            let handler = throw::find_exception_handler(ctx, frame.location(), info);
            if handler == 0 {
                return Err(Unwind::Throw);
            }
            // Operand stack resets to the frame's base; the caught
            // exception is pushed for the handler.
            slots[0] = Slot::from_obj(throw::clear_current_exception(ctx));
            // SAFETY: just written with the cleared exception.
            assert!(!unsafe { slots[0].obj }.is_null());
            Ok(100 + handler)
        }
        other => other,
    }
}

#[test]
fn handler_dispatch_selects_scopes_in_declaration_order() {
    with_vm("handlers", |ctx| {
        let e1 = class::register_class(ClassDef {
            parent: Some(builtin::builtins().throwable),
            vtable: builtin::builtins().throwable.vtable,
            mark_fn: builtin::mark_throwable,
            ..ClassDef::new("test/it/E1", std::mem::size_of::<ThrowableObject>())
        });
        let e2 = class::register_class(ClassDef {
            parent: Some(builtin::builtins().throwable),
            vtable: builtin::builtins().throwable.vtable,
            mark_fn: builtin::mark_throwable,
            ..ClassDef::new("test/it/E2", std::mem::size_of::<ThrowableObject>())
        });
        let info: &'static FrameInfo = Box::leak(Box::new(FrameInfo {
            method: "test/it/Handlers.run",
            size: 4,
            locations: &[],
            exception_scopes: Box::leak(Box::new([
                context::ExceptionScope {
                    start: 0,
                    end: 10,
                    class: Some(e1),
                },
                context::ExceptionScope {
                    start: 5,
                    end: 10,
                    class: Some(e2),
                },
            ])),
        }));

        // E2 at location 7: the E1 filter rejects it, the E2 scope wins.
        let outcome = dispatch_with_handlers(ctx, info, 7, |ctx| {
            Err(throw::throw_new(ctx, e2, None))
        })
        .unwrap();
        assert_eq!(outcome, 102);

        // E1 at the same location resolves to the first scope.
        let outcome = dispatch_with_handlers(ctx, info, 7, |ctx| {
            Err(throw::throw_new(ctx, e1, None))
        })
        .unwrap();
        assert_eq!(outcome, 101);

        // An unrelated throwable propagates out of the method.
        let err = dispatch_with_handlers(ctx, info, 7, |ctx| {
            Err(throw::throw_new(
                ctx,
                builtin::builtins().runtime_exception,
                Some("unhandled"),
            ))
        })
        .unwrap_err();
        assert_eq!(err, Unwind::Throw);
        let pending = ctx.clear_current_exception();
        assert!(class::is_instance(
            pending,
            builtin::builtins().runtime_exception
        ));
    });
}

#[test]
fn eternal_objects_and_the_intern_pool_survive_collections() {
    with_vm("eternal", |ctx| {
        let builtins = builtin::builtins();
        // Intern identity holds across collections: the pool is a root.
        static LITERAL: &str = "persistent-literal";
        let before = intern::intern_literal(ctx, LITERAL).unwrap();
        collector::collect(ctx).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let after = intern::intern_literal(ctx, LITERAL).unwrap();
        assert_eq!(before, after);
        assert_eq!(intern::string_to_native(after), "persistent-literal");

        // An eternal object is never enqueued: its watcher stays set
        // across any number of cycles.
        let eternal = alloc::alloc_eternal(ctx, builtins.object).unwrap();
        let watcher = weak::create_weak(ctx, eternal).unwrap();
        heap::protect_object(watcher as ObjRef);
        collector::collect(ctx).unwrap();
        collector::collect(ctx).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!weak::weak_get(watcher).is_null());
        heap::unprotect_object(watcher as ObjRef);
    });
}
