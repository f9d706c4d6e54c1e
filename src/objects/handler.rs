//! Memory policies selected per proxy

use super::ProxyFlags;
use core::ffi::c_void;
use std::rc::Rc;

/// What a handler sees of a proxy
#[derive(Debug, Clone)]
pub struct ProxyInfo<'a> {
    pub ptr: *mut c_void,
    pub type_name: &'a str,
    /// Type name and its ancestors, most derived first
    pub lineage: &'a [Rc<str>],
    /// Structure size in bytes, zero when unknown
    pub size: usize,
    pub array_size: usize,
    pub flags: ProxyFlags,
    /// Shares its address with an earlier proxy
    pub is_alias: bool,
}

/// Memory policy for a family of native pointers
pub trait ObjectTypeHandler {
    fn name(&self) -> &str;

    /// Applicability to a newly discovered pointer; zero means never
    fn score(&self, info: &ProxyInfo<'_>) -> u32;

    /// Take a reference on behalf of the new proxy
    fn ref_object(&self, _info: &ProxyInfo<'_>) {}

    /// Release the proxy's reference
    fn unref_object(&self, _info: &ProxyInfo<'_>) {}

    fn refcount(&self, _info: &ProxyInfo<'_>) -> Option<u32> {
        None
    }

    /// Releasing frees the memory itself rather than a shared reference
    fn owns_memory(&self) -> bool {
        false
    }
}

/// No-op policy for borrowed pointers
pub struct PlainHandler;

impl ObjectTypeHandler for PlainHandler {
    fn name(&self) -> &str {
        "plain"
    }

    fn score(&self, _info: &ProxyInfo<'_>) -> u32 {
        1
    }
}

/// Storage from `malloc`/`calloc` owned by the script side
pub struct MallocHandler;

impl ObjectTypeHandler for MallocHandler {
    fn name(&self) -> &str {
        "malloc"
    }

    fn score(&self, info: &ProxyInfo<'_>) -> u32 {
        let owned = info.flags.contains(ProxyFlags::OWNED) && !info.flags.contains(ProxyFlags::ARRAY);
        if owned && !info.is_alias {
            10
        } else {
            0
        }
    }

    fn unref_object(&self, info: &ProxyInfo<'_>) {
        if !info.ptr.is_null() {
            // SAFETY: OWNED proxies only wrap malloc-compatible storage.
            unsafe { libc::free(info.ptr) };
        }
    }

    fn owns_memory(&self) -> bool {
        true
    }
}

/// Fixed-size element arrays from `Engine::new_array`
pub struct ArrayHandler;

impl ObjectTypeHandler for ArrayHandler {
    fn name(&self) -> &str {
        "array"
    }

    fn score(&self, info: &ProxyInfo<'_>) -> u32 {
        if info.flags.contains(ProxyFlags::ARRAY) && !info.is_alias {
            20
        } else {
            0
        }
    }

    fn unref_object(&self, info: &ProxyInfo<'_>) {
        if !info.ptr.is_null() {
            // SAFETY: arrays are allocated with calloc by the engine.
            unsafe { libc::free(info.ptr) };
        }
    }

    fn owns_memory(&self) -> bool {
        true
    }
}
