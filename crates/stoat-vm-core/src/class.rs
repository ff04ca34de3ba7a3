//! Class descriptors and the process-wide class registry.
//!
//! A class descriptor is immutable after registration. Registration installs
//! the managed header (class = metaclass, mark = eternal), indexes the
//! descriptor by its internal name, and walks the transitive
//! parent-plus-interface closure once to precompute two caches:
//!
//! - the **assignability set**: every ancestor class, including self
//! - the **interface dispatch table**: for each interface in the closure, a
//!   vector mapping the interface's method index to the implementor's
//!   vtable slot, or -1 when there is no matching entry
//!
//! Registration is serialized under a single mutex and never unwinds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::context::VmContext;
use crate::monitor::Monitor;
use crate::object::{ObjRef, ObjectHeader, RawFn, MARK_ETERNAL};
use crate::throw::{self, VmResult};

/// Internal name of the root class.
pub const OBJECT_CLASS_NAME: &str = "java/lang/Object";

/// Internal name of the metaclass.
pub const METACLASS_NAME: &str = "java/lang/Class";

/// Static initializer hook, run once before first use of the class.
pub type StaticInitFn = fn(&VmContext) -> VmResult<()>;

/// Annotation initializer hook, run after the static initializer.
pub type AnnotationInitFn = fn(&VmContext) -> VmResult<()>;

/// Per-class mark callback. Given an object, stamps the mark word and traces
/// referent fields; given a null object, marks the class's static fields.
/// Must not unwind.
pub type MarkFn = fn(ObjRef, i32, i32);

/// Access flags, matching the source bytecode's encoding.
pub mod access {
    /// Static member.
    pub const STATIC: u32 = 0x0008;
    /// Interface class.
    pub const INTERFACE: u32 = 0x0200;
    /// Abstract class or member.
    pub const ABSTRACT: u32 = 0x0400;
}

/// A vtable slot descriptor: the method's name and type descriptor. Used to
/// match interface methods against an implementor's table.
#[derive(Debug, Clone, Copy)]
pub struct VtableEntry {
    /// Method name.
    pub name: &'static str,
    /// Method type descriptor.
    pub desc: &'static str,
}

/// Field metadata carried by a descriptor for the reflection layer above.
#[derive(Debug, Clone, Copy)]
pub struct FieldInfo {
    /// Field name.
    pub name: &'static str,
    /// Field type descriptor.
    pub desc: &'static str,
    /// Byte offset of the field from the object start.
    pub offset: usize,
    /// Access flags.
    pub access: u32,
}

/// Method metadata carried by a descriptor.
#[derive(Debug, Clone, Copy)]
pub struct MethodInfo {
    /// Method name.
    pub name: &'static str,
    /// Method type descriptor.
    pub desc: &'static str,
    /// Access flags.
    pub access: u32,
}

/// Identity key for a class descriptor, usable in hash containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(*const Class);

// SAFETY: a ClassId is an address; descriptors are leaked and never freed.
unsafe impl Send for ClassId {}
unsafe impl Sync for ClassId {}

impl ClassId {
    /// Key for a descriptor.
    #[inline]
    pub fn of(class: &Class) -> ClassId {
        ClassId(class as *const Class)
    }
}

/// A registered class descriptor.
///
/// The descriptor is itself a managed object: its header's class is the
/// metaclass and its mark is permanently eternal. Everything outside the
/// `initialized` flag and the two caches is immutable after registration.
#[repr(C)]
pub struct Class {
    /// Managed header; the descriptor is an instance of the metaclass.
    pub header: ObjectHeader,
    /// Internal name, e.g. `java/lang/String` or `[I`.
    pub name: &'static str,
    /// Parent class, `None` for the root class and primitives.
    pub parent: Option<&'static Class>,
    /// Instance size in bytes, header included; element size for primitives.
    pub size: usize,
    /// Virtual dispatch table.
    pub vtable: &'static [RawFn],
    /// Static initializer hook.
    pub static_init: StaticInitFn,
    /// Annotation initializer hook.
    pub annotation_init: AnnotationInitFn,
    /// Mark callback used by the collector.
    pub mark_fn: MarkFn,
    /// Whether this is a primitive descriptor.
    pub primitive: bool,
    /// Array dimension count, 0 for non-arrays.
    pub array_dims: u32,
    /// Component class for arrays.
    pub component: Option<&'static Class>,
    /// Access flags.
    pub access: u32,
    /// Directly implemented interfaces.
    pub interfaces: &'static [&'static Class],
    /// Field metadata.
    pub fields: &'static [FieldInfo],
    /// Method metadata. For interfaces this is the method index space used
    /// by the dispatch cache.
    pub methods: &'static [MethodInfo],
    /// Descriptors for the vtable slots, parallel to `vtable`.
    pub vtable_entries: &'static [VtableEntry],
    initialized: AtomicBool,
    assignable: OnceLock<FxHashSet<ClassId>>,
    dispatch: OnceLock<FxHashMap<ClassId, Vec<i32>>>,
}

// SAFETY: immutable after registration except atomics and write-once caches;
// raw pointers in the header refer to leaked, never-freed data.
unsafe impl Send for Class {}
unsafe impl Sync for Class {}

impl Class {
    /// Whether this descriptor is an interface.
    #[inline]
    pub fn is_interface(&self) -> bool {
        self.access & access::INTERFACE != 0
    }

    /// View the descriptor as a managed object reference.
    #[inline]
    pub fn as_obj(&'static self) -> ObjRef {
        self as *const Class as ObjRef
    }

    /// The interface dispatch row for `iface`, if `self` implements it.
    pub fn interface_row(&self, iface: &Class) -> Option<&[i32]> {
        self.dispatch
            .get()
            .and_then(|d| d.get(&ClassId::of(iface)))
            .map(Vec::as_slice)
    }
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("primitive", &self.primitive)
            .field("array_dims", &self.array_dims)
            .finish()
    }
}

/// Everything the generated code supplies to register a class. Fields not
/// set explicitly default to empty tables and no-op hooks.
pub struct ClassDef {
    /// Internal name.
    pub name: &'static str,
    /// Parent class.
    pub parent: Option<&'static Class>,
    /// Instance size in bytes.
    pub size: usize,
    /// Virtual dispatch table. Required for instantiable classes.
    pub vtable: &'static [RawFn],
    /// Static initializer hook.
    pub static_init: StaticInitFn,
    /// Annotation initializer hook.
    pub annotation_init: AnnotationInitFn,
    /// Mark callback.
    pub mark_fn: MarkFn,
    /// Primitive descriptor flag.
    pub primitive: bool,
    /// Array dimension count.
    pub array_dims: u32,
    /// Component class for arrays.
    pub component: Option<&'static Class>,
    /// Access flags.
    pub access: u32,
    /// Directly implemented interfaces.
    pub interfaces: &'static [&'static Class],
    /// Field metadata.
    pub fields: &'static [FieldInfo],
    /// Method metadata.
    pub methods: &'static [MethodInfo],
    /// Vtable slot descriptors.
    pub vtable_entries: &'static [VtableEntry],
}

fn init_none(_ctx: &VmContext) -> VmResult<()> {
    Ok(())
}

fn mark_none(_obj: ObjRef, _mark: i32, _depth: i32) {}

impl ClassDef {
    /// A minimal definition; callers fill in what they need.
    pub fn new(name: &'static str, size: usize) -> ClassDef {
        ClassDef {
            name,
            parent: None,
            size,
            vtable: &[],
            static_init: init_none,
            annotation_init: init_none,
            mark_fn: mark_none,
            primitive: false,
            array_dims: 0,
            component: None,
            access: 0,
            interfaces: &[],
            fields: &[],
            methods: &[],
            vtable_entries: &[],
        }
    }
}

fn registry() -> &'static Mutex<FxHashMap<&'static str, &'static Class>> {
    static REGISTRY: OnceLock<Mutex<FxHashMap<&'static str, &'static Class>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Register a class descriptor.
///
/// Installs the managed header, indexes the descriptor under its internal
/// name (last registration wins on duplicates), and builds the assignability
/// and interface dispatch caches. Never unwinds.
pub fn register_class(def: ClassDef) -> &'static Class {
    let mut map = registry().lock();

    let cls: &'static mut Class = Box::leak(Box::new(Class {
        header: ObjectHeader::new(
            std::ptr::null(),
            MARK_ETERNAL,
            std::ptr::null(),
            std::ptr::null_mut(),
        ),
        name: def.name,
        parent: def.parent,
        size: def.size,
        vtable: def.vtable,
        static_init: def.static_init,
        annotation_init: def.annotation_init,
        mark_fn: def.mark_fn,
        primitive: def.primitive,
        array_dims: def.array_dims,
        component: def.component,
        access: def.access,
        interfaces: def.interfaces,
        fields: def.fields,
        methods: def.methods,
        vtable_entries: def.vtable_entries,
        initialized: AtomicBool::new(false),
        assignable: OnceLock::new(),
        dispatch: OnceLock::new(),
    }));

    // The metaclass registers first during bootstrap and references itself.
    let meta: *const Class = map
        .get(METACLASS_NAME)
        .map(|m| *m as *const Class)
        .unwrap_or(cls as *const Class);
    // SAFETY: meta is a leaked descriptor (or cls itself).
    let meta_vtable = unsafe { (*meta).vtable };
    let vtable_ptr = if meta_vtable.is_empty() {
        cls.vtable.as_ptr()
    } else {
        meta_vtable.as_ptr()
    };
    cls.header = ObjectHeader::new(
        meta,
        MARK_ETERNAL,
        vtable_ptr,
        Box::into_raw(Box::new(Monitor::new())),
    );

    let (assignable, dispatch) = build_caches(cls);
    let _ = cls.assignable.set(assignable);
    let _ = cls.dispatch.set(dispatch);

    let cls: &'static Class = cls;
    map.insert(cls.name, cls);
    cls
}

/// Walk the transitive parent-plus-interface closure, collecting ancestors
/// and building one dispatch row per visited interface.
fn build_caches(
    cls: &Class,
) -> (FxHashSet<ClassId>, FxHashMap<ClassId, Vec<i32>>) {
    let mut assignable = FxHashSet::default();
    let mut dispatch = FxHashMap::default();
    let mut visited = FxHashSet::default();

    assignable.insert(ClassId(cls as *const Class));

    let mut worklist: Vec<&'static Class> = Vec::new();
    if let Some(parent) = cls.parent {
        worklist.push(parent);
    }
    worklist.extend_from_slice(cls.interfaces);

    while let Some(current) = worklist.pop() {
        if !visited.insert(ClassId::of(current)) {
            continue;
        }
        assignable.insert(ClassId::of(current));

        if current.is_interface() {
            let mut row = Vec::with_capacity(current.methods.len());
            for method in current.methods {
                if method.access & access::STATIC != 0 {
                    row.push(-1);
                    continue;
                }
                let slot = cls
                    .vtable_entries
                    .iter()
                    .position(|e| e.name == method.name && e.desc == method.desc)
                    .map(|j| j as i32)
                    .unwrap_or(-1);
                row.push(slot);
            }
            dispatch.insert(ClassId::of(current), row);
        }

        if let Some(parent) = current.parent {
            worklist.push(parent);
        }
        worklist.extend_from_slice(current.interfaces);
    }

    (assignable, dispatch)
}

/// Look up a registered class by internal name.
pub fn class_for_name(name: &str) -> Option<&'static Class> {
    registry().lock().get(name).copied()
}

/// Snapshot of every registered descriptor, for the collector.
pub fn all_classes() -> Vec<&'static Class> {
    registry().lock().values().copied().collect()
}

/// Whether a value of class `assignee` can be assigned to a slot of class
/// `class`. Reflexive and transitive; arrays recurse on their components.
pub fn is_assignable_from(class: &'static Class, assignee: &'static Class) -> bool {
    if std::ptr::eq(class, assignee) || class.name == OBJECT_CLASS_NAME {
        return true;
    }
    if class.array_dims > 0 && assignee.array_dims > 0 {
        if let (Some(tc), Some(uc)) = (class.component, assignee.component) {
            return is_assignable_from(tc, uc);
        }
    }
    assignee
        .assignable
        .get()
        .is_some_and(|set| set.contains(&ClassId::of(class)))
}

/// Whether `object` is a non-null instance of `class`.
pub fn is_instance(object: ObjRef, class: &'static Class) -> bool {
    if object.is_null() {
        return false;
    }
    // SAFETY: a non-null object reference carries a registered class.
    is_assignable_from(class, unsafe { (*object).class() })
}

/// Run the class's static initializer chain, parents first, exactly once.
pub fn ensure_initialized(ctx: &VmContext, class: &'static Class) -> VmResult<()> {
    if class.initialized.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    if let Some(parent) = class.parent {
        ensure_initialized(ctx, parent)?;
    }
    (class.static_init)(ctx)?;
    (class.annotation_init)(ctx)
}

/// Resolve an interface method against an object's class, through the
/// dispatch cache built at registration. `method` indexes the interface's
/// own method table. Raises no-such-method when the cache has no row for
/// the interface or the row holds -1.
pub fn resolve_interface_method(
    ctx: &VmContext,
    iface: &'static Class,
    method: usize,
    object: ObjRef,
) -> VmResult<RawFn> {
    let object = throw::null_check(ctx, object)?;
    // SAFETY: non-null object reference carries a registered class.
    let class = unsafe { (*object).class() };
    let slot = class
        .interface_row(iface)
        .and_then(|row| row.get(method))
        .copied()
        .unwrap_or(-1);
    if slot < 0 {
        return Err(throw::throw_no_such_method(ctx));
    }
    class
        .vtable
        .get(slot as usize)
        .copied()
        .ok_or_else(|| throw::throw_no_such_method(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leak_vtable(entries: usize) -> &'static [RawFn] {
        let v: Vec<RawFn> = (0..entries)
            .map(|i| (0x1000 + i * 8) as RawFn)
            .collect();
        Box::leak(v.into_boxed_slice())
    }

    #[test]
    fn assignability_is_reflexive_and_transitive() {
        let a = register_class(ClassDef {
            vtable: leak_vtable(2),
            ..ClassDef::new("test/reg/A", 32)
        });
        let b = register_class(ClassDef {
            parent: Some(a),
            vtable: leak_vtable(2),
            ..ClassDef::new("test/reg/B", 32)
        });
        let c = register_class(ClassDef {
            parent: Some(b),
            vtable: leak_vtable(2),
            ..ClassDef::new("test/reg/C", 32)
        });

        assert!(is_assignable_from(a, a));
        assert!(is_assignable_from(a, b));
        assert!(is_assignable_from(a, c));
        assert!(is_assignable_from(b, c));
        assert!(!is_assignable_from(c, a));
        assert!(!is_assignable_from(b, a));
    }

    #[test]
    fn interface_dispatch_rows_match_by_name_and_desc() {
        static IFACE_METHODS: [MethodInfo; 3] = [
            MethodInfo {
                name: "run",
                desc: "()V",
                access: 0,
            },
            MethodInfo {
                name: "helper",
                desc: "()V",
                access: access::STATIC,
            },
            MethodInfo {
                name: "missing",
                desc: "()I",
                access: 0,
            },
        ];
        let iface = register_class(ClassDef {
            access: access::INTERFACE,
            methods: &IFACE_METHODS,
            ..ClassDef::new("test/reg/Runnable", 0)
        });

        static IMPL_ENTRIES: [VtableEntry; 2] = [
            VtableEntry {
                name: "finalize",
                desc: "()V",
            },
            VtableEntry {
                name: "run",
                desc: "()V",
            },
        ];
        let ifaces: &'static [&'static Class] = Box::leak(vec![iface].into_boxed_slice());
        let imp = register_class(ClassDef {
            vtable: leak_vtable(2),
            vtable_entries: &IMPL_ENTRIES,
            interfaces: ifaces,
            ..ClassDef::new("test/reg/Worker", 32)
        });

        let row = imp.interface_row(iface).expect("dispatch row");
        assert_eq!(row, &[1, -1, -1]);
        assert!(is_assignable_from(iface, imp));
    }

    #[test]
    fn duplicate_registration_last_wins() {
        let first = register_class(ClassDef {
            vtable: leak_vtable(2),
            ..ClassDef::new("test/reg/Dup", 16)
        });
        let second = register_class(ClassDef {
            vtable: leak_vtable(2),
            ..ClassDef::new("test/reg/Dup", 24)
        });
        let found = class_for_name("test/reg/Dup").unwrap();
        assert!(std::ptr::eq(found, second));
        assert!(!std::ptr::eq(found, first));
    }

    #[test]
    fn static_initializers_run_once_parents_first() {
        use parking_lot::Mutex;

        static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
        fn init_base(_ctx: &VmContext) -> VmResult<()> {
            ORDER.lock().push("base");
            Ok(())
        }
        fn init_derived(_ctx: &VmContext) -> VmResult<()> {
            ORDER.lock().push("derived");
            Ok(())
        }

        let base = register_class(ClassDef {
            static_init: init_base,
            vtable: leak_vtable(2),
            ..ClassDef::new("test/reg/InitBase", 16)
        });
        let derived = register_class(ClassDef {
            parent: Some(base),
            static_init: init_derived,
            vtable: leak_vtable(2),
            ..ClassDef::new("test/reg/InitDerived", 16)
        });

        let ctx = VmContext::new();
        ensure_initialized(&ctx, derived).unwrap();
        ensure_initialized(&ctx, derived).unwrap();
        ensure_initialized(&ctx, base).unwrap();
        assert_eq!(*ORDER.lock(), vec!["base", "derived"]);
        crate::context::VmContext::unregister(&ctx);
    }

    #[test]
    fn interface_method_resolution_dispatches_through_the_cache() {
        static IFACE_METHODS: [MethodInfo; 2] = [
            MethodInfo {
                name: "apply",
                desc: "()V",
                access: 0,
            },
            MethodInfo {
                name: "setup",
                desc: "()V",
                access: access::STATIC,
            },
        ];
        let iface = register_class(ClassDef {
            access: access::INTERFACE,
            methods: &IFACE_METHODS,
            ..ClassDef::new("test/reg/Applicable", 0)
        });

        static IMPL_ENTRIES: [VtableEntry; 3] = [
            VtableEntry {
                name: "finalize",
                desc: "()V",
            },
            VtableEntry {
                name: "toString",
                desc: "()Ljava/lang/String;",
            },
            VtableEntry {
                name: "apply",
                desc: "()V",
            },
        ];
        let ifaces: &'static [&'static Class] = Box::leak(vec![iface].into_boxed_slice());
        let imp = register_class(ClassDef {
            parent: Some(crate::builtin::builtins().object),
            vtable: leak_vtable(3),
            vtable_entries: &IMPL_ENTRIES,
            interfaces: ifaces,
            ..ClassDef::new("test/reg/Applier", 32)
        });

        let ctx = VmContext::new();
        let object = crate::alloc::alloc(&ctx, imp).unwrap();

        // Slot 2 holds "apply" per the vtable entries above.
        let resolved = resolve_interface_method(&ctx, iface, 0, object).unwrap();
        assert_eq!(resolved, imp.vtable[2]);

        // Static interface methods never dispatch.
        assert!(resolve_interface_method(&ctx, iface, 1, object).is_err());
        ctx.clear_current_exception();
        // Null receivers raise before the cache is consulted.
        assert!(resolve_interface_method(&ctx, iface, 0, std::ptr::null_mut()).is_err());
        ctx.clear_current_exception();
        crate::context::VmContext::unregister(&ctx);
    }

    #[test]
    fn descriptor_header_is_eternal() {
        let cls = register_class(ClassDef {
            vtable: leak_vtable(2),
            ..ClassDef::new("test/reg/Eternal", 16)
        });
        assert_eq!(cls.header.mark(), MARK_ETERNAL);
        assert!(!cls.header.monitor.is_null());
    }
}
