//! Built-in class descriptors.
//!
//! The core allocates strings, thread records, throwables, and weak
//! references on its own behalf, so their descriptors live here rather
//! than in the class library above. Layouts follow the generated-code
//! contract: a `repr(C)` struct with the object header first, fields after.

use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::OnceLock;

use crate::class::{
    self, access, Class, ClassDef, VtableEntry, METACLASS_NAME, OBJECT_CLASS_NAME,
};
use crate::collector;
use crate::context::VmContext;
use crate::intern;
use crate::object::{ObjRef, ObjectHeader, RawFn};
use crate::throw::VmResult;
use crate::weak;

/// Vtable slot indices dispatched by the core itself. Generated classes
/// append their own slots after these.
pub mod slots {
    /// `finalize()` hook, invoked by the finalizer thread.
    pub const FINALIZE: usize = 0;
    /// `toString()` hook.
    pub const TO_STRING: usize = 1;
    /// Number of core slots.
    pub const COUNT: usize = 2;
}

/// Signature of the finalize vtable slot.
pub type FinalizeFn = fn(&VmContext, ObjRef) -> VmResult<()>;

/// Signature of the to-string vtable slot.
pub type ToStringFn = fn(&VmContext, ObjRef) -> VmResult<ObjRef>;

/// A string instance: a UTF-16 character array and its length.
#[repr(C)]
pub struct StringObject {
    /// Managed header.
    pub header: ObjectHeader,
    /// Backing character array (`[C`).
    pub value: ObjRef,
    /// Character count.
    pub count: i32,
}

/// A managed thread record. Thread records are eternal: the scheduler and
/// the collector read them without caring about collection state.
#[repr(C)]
pub struct ThreadObject {
    /// Managed header.
    pub header: ObjectHeader,
    /// Whether the thread is running. Cleared when the entry point returns.
    pub alive: AtomicBool,
    /// Interrupt flag, consumed by the interrupt checkpoint.
    pub interrupted: AtomicBool,
    /// Thread name.
    pub name: ObjRef,
}

/// A throwable instance: message and captured stack, both strings.
#[repr(C)]
pub struct ThrowableObject {
    /// Managed header.
    pub header: ObjectHeader,
    /// Message string, or null.
    pub message: ObjRef,
    /// Rendered stack trace string, or null.
    pub stack: ObjRef,
}

/// A weak reference. The referent is not traced; the finalization phase
/// clears it when the referent dies.
#[repr(C)]
pub struct WeakRefObject {
    /// Managed header.
    pub header: ObjectHeader,
    /// The referent, cleared to null during its finalization.
    pub referent: AtomicPtr<ObjectHeader>,
}

/// The descriptors the core registers at bootstrap.
pub struct Builtins {
    /// The metaclass; every descriptor is an instance of it.
    pub metaclass: &'static Class,
    /// The root class.
    pub object: &'static Class,
    /// Strings.
    pub string: &'static Class,
    /// Thread records.
    pub thread: &'static Class,
    /// Root of the throwable hierarchy.
    pub throwable: &'static Class,
    /// Weak references.
    pub weak_reference: &'static Class,
    /// Plain runtime exception.
    pub runtime_exception: &'static Class,
    /// Null dereference.
    pub null_pointer: &'static Class,
    /// Failed checked cast.
    pub class_cast: &'static Class,
    /// Arithmetic failure (division by zero).
    pub arithmetic: &'static Class,
    /// Array index out of range.
    pub index_out_of_bounds: &'static Class,
    /// Illegal argument.
    pub illegal_argument: &'static Class,
    /// Monitor operation by a non-owner.
    pub illegal_monitor_state: &'static Class,
    /// Missing interface dispatch target.
    pub no_such_method: &'static Class,
    /// Frame depth bound exceeded.
    pub stack_overflow: &'static Class,
    /// Heap limit exceeded.
    pub out_of_memory: &'static Class,
    /// Interrupt delivery.
    pub interrupted: &'static Class,
    /// Primitive `byte`.
    pub prim_byte: &'static Class,
    /// Primitive `char`.
    pub prim_char: &'static Class,
    /// Primitive `short`.
    pub prim_short: &'static Class,
    /// Primitive `int`.
    pub prim_int: &'static Class,
    /// Primitive `long`.
    pub prim_long: &'static Class,
    /// Primitive `float`.
    pub prim_float: &'static Class,
    /// Primitive `double`.
    pub prim_double: &'static Class,
    /// Primitive `boolean`.
    pub prim_boolean: &'static Class,
    /// Primitive `void`.
    pub prim_void: &'static Class,
}

/// The built-in descriptors, registered on first use.
pub fn builtins() -> &'static Builtins {
    static BUILTINS: OnceLock<Builtins> = OnceLock::new();
    BUILTINS.get_or_init(install)
}

fn make_vtable(finalize: FinalizeFn, to_string: ToStringFn) -> &'static [RawFn] {
    vec![finalize as RawFn, to_string as RawFn].leak()
}

static OBJECT_VTABLE_ENTRIES: [VtableEntry; slots::COUNT] = [
    VtableEntry {
        name: "finalize",
        desc: "()V",
    },
    VtableEntry {
        name: "toString",
        desc: "()Ljava/lang/String;",
    },
];

fn finalize_noop(_ctx: &VmContext, _object: ObjRef) -> VmResult<()> {
    Ok(())
}

fn finalize_weak(_ctx: &VmContext, object: ObjRef) -> VmResult<()> {
    weak::deregister_weak(object as *mut WeakRefObject);
    Ok(())
}

pub(crate) fn to_string_class_name(ctx: &VmContext, object: ObjRef) -> VmResult<ObjRef> {
    // SAFETY: the receiver of a virtual call is live and non-null.
    let class = unsafe { (*object).class() };
    Ok(intern::create_string(ctx, class.name)? as ObjRef)
}

fn to_string_throwable(ctx: &VmContext, object: ObjRef) -> VmResult<ObjRef> {
    let throwable = object as *mut ThrowableObject;
    // SAFETY: the receiver of a virtual call is live and non-null.
    let class = unsafe { (*object).class() };
    let text = match unsafe { (*throwable).message } {
        message if message.is_null() => class.name.to_string(),
        message => format!(
            "{}: {}",
            class.name,
            intern::string_to_native(message as *mut StringObject)
        ),
    };
    Ok(intern::create_string(ctx, &text)? as ObjRef)
}

/// Mark callback for field-less instances.
pub fn mark_object(object: ObjRef, mark: i32, depth: i32) {
    if object.is_null() {
        return;
    }
    collector::should_mark(object, mark, depth);
}

/// Mark callback for strings: traces the backing character array.
pub fn mark_string(object: ObjRef, mark: i32, depth: i32) {
    if object.is_null() {
        return;
    }
    if !collector::should_mark(object, mark, depth) {
        return;
    }
    let string = object as *mut StringObject;
    // SAFETY: live object, scanned under the collector's stability rules.
    collector::trace(unsafe { (*string).value }, mark, depth + 1);
}

/// Mark callback for throwables: traces message and stack strings.
pub fn mark_throwable(object: ObjRef, mark: i32, depth: i32) {
    if object.is_null() {
        return;
    }
    if !collector::should_mark(object, mark, depth) {
        return;
    }
    let throwable = object as *mut ThrowableObject;
    // SAFETY: as in mark_string.
    unsafe {
        collector::trace((*throwable).message, mark, depth + 1);
        collector::trace((*throwable).stack, mark, depth + 1);
    }
}

/// Mark callback for thread records: traces the name string.
pub fn mark_thread(object: ObjRef, mark: i32, depth: i32) {
    if object.is_null() {
        return;
    }
    if !collector::should_mark(object, mark, depth) {
        return;
    }
    let thread = object as *mut ThreadObject;
    // SAFETY: as in mark_string.
    collector::trace(unsafe { (*thread).name }, mark, depth + 1);
}

/// Mark callback for weak references. The referent is deliberately not
/// traced; that is what makes the reference weak.
pub fn mark_weak(object: ObjRef, mark: i32, depth: i32) {
    if object.is_null() {
        return;
    }
    collector::should_mark(object, mark, depth);
}

fn mark_primitive(_object: ObjRef, _mark: i32, _depth: i32) {}

fn primitive(name: &'static str, size: usize) -> &'static Class {
    class::register_class(ClassDef {
        primitive: true,
        access: access::ABSTRACT,
        mark_fn: mark_primitive,
        ..ClassDef::new(name, size)
    })
}

fn install() -> Builtins {
    // The metaclass goes first: it references itself, and every later
    // registration points its header at it.
    let metaclass = class::register_class(ClassDef {
        vtable: make_vtable(finalize_noop, to_string_class_name),
        vtable_entries: &OBJECT_VTABLE_ENTRIES,
        mark_fn: mark_object,
        ..ClassDef::new(METACLASS_NAME, std::mem::size_of::<Class>())
    });

    let object = class::register_class(ClassDef {
        vtable: make_vtable(finalize_noop, to_string_class_name),
        vtable_entries: &OBJECT_VTABLE_ENTRIES,
        mark_fn: mark_object,
        ..ClassDef::new(OBJECT_CLASS_NAME, std::mem::size_of::<ObjectHeader>())
    });

    let string = class::register_class(ClassDef {
        parent: Some(object),
        vtable: make_vtable(finalize_noop, to_string_class_name),
        vtable_entries: &OBJECT_VTABLE_ENTRIES,
        mark_fn: mark_string,
        ..ClassDef::new("java/lang/String", std::mem::size_of::<StringObject>())
    });

    let thread = class::register_class(ClassDef {
        parent: Some(object),
        vtable: make_vtable(finalize_noop, to_string_class_name),
        vtable_entries: &OBJECT_VTABLE_ENTRIES,
        mark_fn: mark_thread,
        ..ClassDef::new("java/lang/Thread", std::mem::size_of::<ThreadObject>())
    });

    let throwable = class::register_class(ClassDef {
        parent: Some(object),
        vtable: make_vtable(finalize_noop, to_string_throwable),
        vtable_entries: &OBJECT_VTABLE_ENTRIES,
        mark_fn: mark_throwable,
        ..ClassDef::new("java/lang/Throwable", std::mem::size_of::<ThrowableObject>())
    });

    let weak_reference = class::register_class(ClassDef {
        parent: Some(object),
        vtable: make_vtable(finalize_weak, to_string_class_name),
        vtable_entries: &OBJECT_VTABLE_ENTRIES,
        mark_fn: mark_weak,
        ..ClassDef::new(
            "java/lang/ref/WeakReference",
            std::mem::size_of::<WeakRefObject>(),
        )
    });

    let exception = |name: &'static str| {
        class::register_class(ClassDef {
            parent: Some(throwable),
            vtable: throwable.vtable,
            vtable_entries: &OBJECT_VTABLE_ENTRIES,
            mark_fn: mark_throwable,
            ..ClassDef::new(name, std::mem::size_of::<ThrowableObject>())
        })
    };

    Builtins {
        metaclass,
        object,
        string,
        thread,
        throwable,
        weak_reference,
        runtime_exception: exception("java/lang/RuntimeException"),
        null_pointer: exception("java/lang/NullPointerException"),
        class_cast: exception("java/lang/ClassCastException"),
        arithmetic: exception("java/lang/ArithmeticException"),
        index_out_of_bounds: exception("java/lang/IndexOutOfBoundsException"),
        illegal_argument: exception("java/lang/IllegalArgumentException"),
        illegal_monitor_state: exception("java/lang/IllegalMonitorStateException"),
        no_such_method: exception("java/lang/NoSuchMethodError"),
        stack_overflow: exception("java/lang/StackOverflowError"),
        out_of_memory: exception("java/lang/OutOfMemoryError"),
        interrupted: exception("java/lang/InterruptedException"),
        prim_byte: primitive("B", 1),
        prim_char: primitive("C", 2),
        prim_short: primitive("S", 2),
        prim_int: primitive("I", 4),
        prim_long: primitive("J", 8),
        prim_float: primitive("F", 4),
        prim_double: primitive("D", 8),
        prim_boolean: primitive("Z", 1),
        prim_void: primitive("V", 0),
    }
}

/// The finalize hook of `object`'s class, out of its vtable.
///
/// # Safety
/// `object` must be live with a vtable installed by the allocator.
pub unsafe fn finalize_fn_of(object: ObjRef) -> FinalizeFn {
    // SAFETY: slot 0 of every vtable is the finalize hook per the
    // generated-code contract.
    unsafe {
        let slot = *(*object).vtable.add(slots::FINALIZE);
        std::mem::transmute::<RawFn, FinalizeFn>(slot)
    }
}

/// Whether the context's managed thread record reports alive. Contexts
/// without a record count as alive so the coordinator stays conservative.
pub fn thread_alive(ctx: &VmContext) -> bool {
    let thread = ctx.thread() as *mut ThreadObject;
    if thread.is_null() {
        return true;
    }
    // SAFETY: thread records are eternal.
    unsafe { (*thread).alive.load(Ordering::Acquire) }
}

/// Create an eternal thread record named `name` and attach it to `ctx`.
pub fn create_thread_record(ctx: &VmContext, name: &str) -> VmResult<*mut ThreadObject> {
    let object = crate::alloc::alloc_eternal(ctx, builtins().thread)?;
    let thread = object as *mut ThreadObject;
    let name = intern::create_string(ctx, name)?;
    // SAFETY: freshly allocated, zeroed record.
    unsafe {
        (*thread).name = name as ObjRef;
        (*thread).alive.store(true, Ordering::Release);
    }
    ctx.set_thread(object);
    Ok(thread)
}
