//! Reference-counted object families
//!
//! Native libraries with intrusive reference counts expose `ref`/`unref`
//! entry points for a root type; every type derived from one of the roots
//! is managed through them.

use super::handler::{ObjectTypeHandler, ProxyInfo};
use super::ProxyFlags;
use core::ffi::c_void;

pub type RefFn = unsafe extern "C" fn(*mut c_void);
pub type RefCountFn = unsafe extern "C" fn(*mut c_void) -> u32;

pub struct RefCountedHandler {
    name: String,
    roots: Vec<String>,
    ref_fn: RefFn,
    unref_fn: RefFn,
    count_fn: Option<RefCountFn>,
}

impl RefCountedHandler {
    pub fn new(name: &str, ref_fn: RefFn, unref_fn: RefFn) -> Self {
        Self {
            name: name.to_string(),
            roots: Vec::new(),
            ref_fn,
            unref_fn,
            count_fn: None,
        }
    }

    /// Manage this type and everything derived from it
    pub fn root(mut self, type_name: &str) -> Self {
        self.roots.push(type_name.to_string());
        self
    }

    pub fn with_refcount(mut self, count_fn: RefCountFn) -> Self {
        self.count_fn = Some(count_fn);
        self
    }

    /// Element arrays are plain storage even when their element type is counted
    fn applies_to(&self, info: &ProxyInfo<'_>) -> bool {
        !info.flags.contains(ProxyFlags::ARRAY)
            && info.lineage.iter().any(|ty| self.roots.iter().any(|root| **ty == **root))
    }
}

impl ObjectTypeHandler for RefCountedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, info: &ProxyInfo<'_>) -> u32 {
        if self.applies_to(info) {
            50
        } else {
            0
        }
    }

    fn ref_object(&self, info: &ProxyInfo<'_>) {
        if info.ptr.is_null() {
            return;
        }
        // SAFETY: the pointer belongs to this handler's object family.
        unsafe { (self.ref_fn)(info.ptr) }
    }

    fn unref_object(&self, info: &ProxyInfo<'_>) {
        if info.ptr.is_null() {
            return;
        }
        // SAFETY: balances the reference taken or transferred at creation.
        unsafe { (self.unref_fn)(info.ptr) }
    }

    fn refcount(&self, info: &ProxyInfo<'_>) -> Option<u32> {
        let count = self.count_fn?;
        if info.ptr.is_null() {
            return Some(0);
        }
        // SAFETY: see `ref_object`.
        Some(unsafe { count(info.ptr) })
    }
}

impl std::fmt::Debug for RefCountedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCountedHandler")
            .field("name", &self.name)
            .field("roots", &self.roots)
            .finish()
    }
}
