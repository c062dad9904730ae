// File: src/intern.rs
//
// String interning for the lumen VM. Deduplicates string content so that
// equality between two interned strings reduces to a pointer comparison,
// matching the identity-equality invariant the value model relies on.

use ahash::AHashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// A handle to an interned string. Two handles produced by the same pool for
/// equal byte content are guaranteed to be `Rc::ptr_eq`.
#[derive(Clone)]
pub struct StringHandle(Rc<str>);

impl StringHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for StringHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for StringHandle {}

impl Hash for StringHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash the pointer, not the content: lookups by StringHandle (e.g.
        // globals table keys) only ever compare handles already produced by
        // the same pool, so pointer identity suffices and is O(1).
        (Rc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl fmt::Debug for StringHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for StringHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pool of interned strings, keyed by content.
///
/// Scoped per-[`crate::vm::Vm`] rather than process-wide, so that two VM
/// instances (e.g. successive REPL sessions) don't share state. See the
/// Open Question resolution in DESIGN.md.
#[derive(Default)]
pub struct InternPool {
    table: AHashMap<Box<str>, Rc<str>>,
}

impl InternPool {
    pub fn new() -> Self {
        Self { table: AHashMap::new() }
    }

    /// Intern `s`, returning a handle equal-by-identity to every other
    /// handle this pool has produced for the same content.
    pub fn intern(&mut self, s: &str) -> StringHandle {
        if let Some(existing) = self.table.get(s) {
            return StringHandle(existing.clone());
        }
        let rc: Rc<str> = Rc::from(s);
        self.table.insert(Box::from(s), rc.clone());
        StringHandle(rc)
    }

    pub fn concat(&mut self, a: &str, b: &str) -> StringHandle {
        let mut s = String::with_capacity(a.len() + b.len());
        s.push_str(a);
        s.push_str(b);
        self.intern(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_content_is_identity_equal() {
        let mut pool = InternPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("hello");
        assert_eq!(a, b);
        assert!(Rc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn distinct_content_is_distinct() {
        let mut pool = InternPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("world");
        assert_ne!(a, b);
    }
}
