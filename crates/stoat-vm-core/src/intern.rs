//! String construction and the literal pool.
//!
//! Strings are UTF-16 character arrays behind a small string object. The
//! literal pool canonicalizes by the literal's source pointer: generated
//! code references each literal through one static, so pointer identity is
//! literal identity. Pooled strings and their backing arrays are eternal.

use std::sync::OnceLock;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::alloc;
use crate::arrays::{self, ArrayObject};
use crate::builtin::{self, StringObject};
use crate::context::VmContext;
use crate::heap;
use crate::object::{ObjPtr, ObjRef};
use crate::throw::VmResult;

fn pool() -> &'static Mutex<FxHashMap<usize, ObjPtr>> {
    static POOL: OnceLock<Mutex<FxHashMap<usize, ObjPtr>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(FxHashMap::default()))
}

/// Build a collectible string from native text.
pub fn create_string(ctx: &VmContext, text: &str) -> VmResult<*mut StringObject> {
    create_string_inner(ctx, text, false)
}

/// Build a string and leave it pinned for the caller.
pub fn create_string_protected(ctx: &VmContext, text: &str) -> VmResult<*mut StringObject> {
    create_string_inner(ctx, text, true)
}

/// Build a string that is never collected.
pub fn create_string_eternal(ctx: &VmContext, text: &str) -> VmResult<*mut StringObject> {
    let string = create_string_inner(ctx, text, false)?;
    heap::make_eternal(string as ObjRef);
    // SAFETY: freshly built string, value array installed below it.
    unsafe { heap::make_eternal((*string).value) };
    Ok(string)
}

fn create_string_inner(ctx: &VmContext, text: &str, protect: bool) -> VmResult<*mut StringObject> {
    let units: Vec<u16> = text.encode_utf16().collect();

    let object = alloc::alloc_protected(ctx, builtin::builtins().string)?;
    let string = object as *mut StringObject;
    let array = arrays::create_array(ctx, builtin::builtins().prim_char, units.len() as i32)?;

    // SAFETY: the string is pinned; the array was just created with the
    // requested length.
    unsafe {
        (*string).value = array as ObjRef;
        (*string).count = units.len() as i32;
        if !units.is_empty() {
            let data = arrays::data_ptr::<u16>(array);
            std::ptr::copy_nonoverlapping(units.as_ptr(), data, units.len());
        }
    }

    if !protect {
        heap::unprotect_object(object);
    }
    Ok(string)
}

/// Intern a literal. The first access builds the string and makes it and
/// its backing array eternal; identical source pointers return the same
/// object thereafter.
pub fn intern_literal(ctx: &VmContext, literal: &'static str) -> VmResult<*mut StringObject> {
    let key = literal.as_ptr() as usize;
    if let Some(hit) = pool().lock().get(&key).copied() {
        return Ok(hit.0 as *mut StringObject);
    }

    // Built outside the pool lock: construction may collect, and a thread
    // parked on a mutex does not count as suspended.
    let string = create_string(ctx, literal)?;

    let mut pool = pool().lock();
    if let Some(hit) = pool.get(&key).copied() {
        // Lost the race; the duplicate stays collectible.
        return Ok(hit.0 as *mut StringObject);
    }
    heap::make_eternal(string as ObjRef);
    // SAFETY: string was just built with its array in place.
    unsafe { heap::make_eternal((*string).value) };
    pool.insert(key, ObjPtr(string as ObjRef));
    Ok(string)
}

/// Decode a string object back to native text. `string` must be live; a
/// null reference decodes to the empty string.
pub fn string_to_native(string: *mut StringObject) -> String {
    if string.is_null() {
        return String::new();
    }
    // SAFETY: per the liveness contract above; count matches the backing
    // array's length by construction.
    unsafe {
        let count = (*string).count as usize;
        let array = (*string).value as *mut ArrayObject;
        if array.is_null() || count == 0 {
            return String::new();
        }
        let data = arrays::data_ptr::<u16>(array);
        let units = std::slice::from_raw_parts(data, count);
        String::from_utf16_lossy(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VmContext;
    use crate::object::{MARK_ETERNAL, MARK_START};

    #[test]
    fn ascii_round_trips_through_utf16() {
        let ctx = VmContext::new();
        let text = "runtime core, plain ASCII 0123";
        let string = create_string(&ctx, text).unwrap();
        assert_eq!(string_to_native(string), text);
        // SAFETY: freshly built string.
        unsafe {
            assert_eq!((*string).count as usize, text.len());
            assert_eq!((*string).header.mark(), MARK_START);
        }
        VmContext::unregister(&ctx);
    }

    #[test]
    fn multibyte_text_survives_encoding() {
        let ctx = VmContext::new();
        let text = "sømé tèxt";
        let string = create_string(&ctx, text).unwrap();
        assert_eq!(string_to_native(string), text);
        VmContext::unregister(&ctx);
    }

    #[test]
    fn identical_literals_intern_to_one_object() {
        let ctx = VmContext::new();
        static LITERAL: &str = "interned-literal";
        let first = intern_literal(&ctx, LITERAL).unwrap();
        let second = intern_literal(&ctx, LITERAL).unwrap();
        assert_eq!(first, second);
        // SAFETY: interned strings are eternal.
        unsafe {
            assert_eq!((*first).header.mark(), MARK_ETERNAL);
            assert_eq!((*(*first).value).mark(), MARK_ETERNAL);
        }
        VmContext::unregister(&ctx);
    }

    #[test]
    fn distinct_literals_intern_separately() {
        let ctx = VmContext::new();
        static A: &str = "literal-a";
        static B: &str = "literal-b";
        let a = intern_literal(&ctx, A).unwrap();
        let b = intern_literal(&ctx, B).unwrap();
        assert_ne!(a, b);
        assert_eq!(string_to_native(a), "literal-a");
        assert_eq!(string_to_native(b), "literal-b");
        VmContext::unregister(&ctx);
    }
}
