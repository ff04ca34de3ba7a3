//! Arrays.
//!
//! Array descriptors are created on demand, one per component class and
//! dimension, named by prefixing `[` to the component's name. An array
//! instance owns a separately allocated, separately accounted data buffer;
//! the array's finalize hook returns the buffer's bytes to the heap
//! counter and frees it.

use std::alloc::Layout;
use std::sync::OnceLock;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::alloc;
use crate::builtin::{self, FinalizeFn, ToStringFn};
use crate::class::{self, access, Class, ClassDef, ClassId, VtableEntry};
use crate::collector;
use crate::context::VmContext;
use crate::heap;
use crate::object::{ObjRef, ObjectHeader, RawFn};
use crate::throw::{self, VmResult};

/// An array instance: length plus a pointer to the element buffer. The
/// buffer is null for zero-length arrays.
#[repr(C)]
pub struct ArrayObject {
    /// Managed header.
    pub header: ObjectHeader,
    /// Element count.
    pub length: i32,
    /// Element buffer, or null.
    pub data: *mut u8,
}

/// Typed view of an array's element buffer. `array` must be live and its
/// component size must match `T`.
#[inline]
pub fn data_ptr<T>(array: *mut ArrayObject) -> *mut T {
    // SAFETY: per the liveness contract above.
    unsafe { (*array).data as *mut T }
}

/// Element count of a live array.
#[inline]
pub fn array_length(array: *mut ArrayObject) -> i32 {
    // SAFETY: per the liveness contract above.
    unsafe { (*array).length }
}

/// Raise array-bounds failure unless `index` is inside `array`.
pub fn check_bounds(ctx: &VmContext, array: *mut ArrayObject, index: i32) -> VmResult<()> {
    throw::null_check(ctx, array as ObjRef)?;
    if index < 0 || index >= array_length(array) {
        return Err(throw::throw_index_out_of_bounds(ctx));
    }
    Ok(())
}

/// Mark callback for arrays: traces elements of reference arrays.
pub fn mark_array(object: ObjRef, mark: i32, depth: i32) {
    if object.is_null() {
        return;
    }
    if !collector::should_mark(object, mark, depth) {
        return;
    }
    // SAFETY: mark callbacks run on stable objects.
    let class = unsafe { (*object).class() };
    let Some(component) = class.component else {
        return;
    };
    if component.primitive {
        return;
    }
    let array = object as *mut ArrayObject;
    // SAFETY: reference arrays store ObjRef elements; the buffer length
    // matches the recorded length by construction.
    unsafe {
        let data = (*array).data as *mut ObjRef;
        if data.is_null() {
            return;
        }
        for index in 0..(*array).length as usize {
            collector::trace(*data.add(index), mark, depth + 1);
        }
    }
}

fn buffer_bytes(component: &Class, length: i32) -> usize {
    let element = if component.primitive {
        component.size
    } else {
        std::mem::size_of::<ObjRef>()
    };
    element * length as usize
}

fn finalize_array(_ctx: &VmContext, object: ObjRef) -> VmResult<()> {
    let array = object as *mut ArrayObject;
    // SAFETY: the finalizer owns the object; the buffer was allocated with
    // the layout recomputed here.
    unsafe {
        if (*array).data.is_null() {
            return Ok(());
        }
        let class = (*object).class();
        let Some(component) = class.component else {
            return Ok(());
        };
        let bytes = buffer_bytes(component, (*array).length);
        heap::adjust_heap_usage(-(bytes as i64));
        std::alloc::dealloc((*array).data, Layout::from_size_align(bytes, 8).unwrap());
        (*array).length = 0;
        (*array).data = std::ptr::null_mut();
    }
    Ok(())
}

static ARRAY_VTABLE_ENTRIES: [VtableEntry; 2] = [
    VtableEntry {
        name: "finalize",
        desc: "()V",
    },
    VtableEntry {
        name: "toString",
        desc: "()Ljava/lang/String;",
    },
];

struct SyncRawFnSlice(&'static [RawFn]);
// SAFETY: the wrapped slice holds function pointers only, which are safe
// to share across threads.
unsafe impl Sync for SyncRawFnSlice {}
unsafe impl Send for SyncRawFnSlice {}

fn array_vtable() -> &'static [RawFn] {
    static VTABLE: OnceLock<SyncRawFnSlice> = OnceLock::new();
    VTABLE
        .get_or_init(|| {
            SyncRawFnSlice(
                vec![
                    finalize_array as FinalizeFn as RawFn,
                    builtin::to_string_class_name as ToStringFn as RawFn,
                ]
                .leak(),
            )
        })
        .0
}

fn array_classes() -> &'static Mutex<FxHashMap<ClassId, Vec<&'static Class>>> {
    static CLASSES: OnceLock<Mutex<FxHashMap<ClassId, Vec<&'static Class>>>> = OnceLock::new();
    CLASSES.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// The array class for `dimensions` levels over `component`. Descriptors
/// are registered lazily and cached per component. Never unwinds.
pub fn array_class(component: &'static Class, dimensions: u32) -> &'static Class {
    // Normalize to a non-array component.
    let mut component = component;
    let mut dimensions = dimensions;
    while component.array_dims > 0 {
        let Some(inner) = component.component else {
            break;
        };
        component = inner;
        dimensions += 1;
    }

    let mut cache = array_classes().lock();
    let list = cache.entry(ClassId::of(component)).or_default();
    while (list.len() as u32) < dimensions {
        let inner = list.last().copied().unwrap_or(component);
        let name: &'static str = Box::leak(format!("[{}", inner.name).into_boxed_str());
        let class = class::register_class(ClassDef {
            parent: Some(builtin::builtins().object),
            vtable: array_vtable(),
            vtable_entries: &ARRAY_VTABLE_ENTRIES,
            mark_fn: mark_array,
            array_dims: list.len() as u32 + 1,
            component: Some(inner),
            access: access::ABSTRACT,
            ..ClassDef::new(name, std::mem::size_of::<ArrayObject>())
        });
        list.push(class);
    }
    list[(dimensions - 1) as usize]
}

/// Create a one-dimensional array of `component`.
pub fn create_array(
    ctx: &VmContext,
    component: &'static Class,
    length: i32,
) -> VmResult<*mut ArrayObject> {
    create_multi_array(ctx, component, &[length])
}

/// Create an array and leave it pinned for the caller.
pub fn create_array_protected(
    ctx: &VmContext,
    component: &'static Class,
    length: i32,
) -> VmResult<*mut ArrayObject> {
    let array = create_array(ctx, component, length)?;
    heap::protect_object(array as ObjRef);
    Ok(array)
}

/// Create an array that is never collected.
pub fn create_array_eternal(
    ctx: &VmContext,
    component: &'static Class,
    length: i32,
) -> VmResult<*mut ArrayObject> {
    let array = create_array(ctx, component, length)?;
    heap::make_eternal(array as ObjRef);
    Ok(array)
}

/// Create a possibly multi-dimensional array: `dims[0]` outer elements,
/// nested arrays for the remaining dimensions. Inner reference elements
/// are reachable through the pinned outer array while they are built.
pub fn create_multi_array(
    ctx: &VmContext,
    component: &'static Class,
    dims: &[i32],
) -> VmResult<*mut ArrayObject> {
    let Some(&length) = dims.first() else {
        return Err(throw::throw_illegal_argument(ctx));
    };
    if length < 0 {
        return Err(throw::throw_illegal_argument(ctx));
    }

    let class = array_class(component, dims.len() as u32);
    let object = alloc::alloc_protected(ctx, class)?;
    let array = object as *mut ArrayObject;
    // SAFETY: freshly allocated, pinned array.
    unsafe { (*array).length = length };

    if length > 0 {
        let reference_elements = !component.primitive || dims.len() > 1;
        let bytes = if reference_elements {
            std::mem::size_of::<ObjRef>() * length as usize
        } else {
            component.size * length as usize
        };
        let layout = Layout::from_size_align(bytes, 8).unwrap();
        // SAFETY: layout is non-zero sized (length > 0).
        let data = unsafe { std::alloc::alloc_zeroed(layout) };
        if data.is_null() {
            std::alloc::handle_alloc_error(layout);
        }
        heap::adjust_heap_usage(bytes as i64);
        // SAFETY: pinned array; buffer installed before any child
        // allocation so children stay reachable through it.
        unsafe { (*array).data = data };

        if dims.len() > 1 {
            let rest = &dims[1..];
            for index in 0..length as usize {
                let child = create_multi_array(ctx, component, rest)?;
                // SAFETY: reference buffer of `length` elements.
                unsafe { *(data as *mut ObjRef).add(index) = child as ObjRef };
            }
        }
    }

    heap::unprotect_object(object);
    Ok(array)
}
