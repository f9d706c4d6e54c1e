//! Shared libraries backing a module's function table
//!
//! A module either registers symbol addresses directly or carries a
//! `Library`, which resolves names on first lookup. The handle stays open
//! as long as the module that owns it.

use std::ffi::{c_void, CString};
use std::ptr::NonNull;
use thiserror::Error;
use tracing::debug;

pub struct Library {
    handle: NonNull<c_void>,
    label: String,
}

impl Library {
    /// Open a library by file name or path, searching the loader's usual paths
    pub fn load(name: &str) -> Result<Self, LoadError> {
        let cname = CString::new(name).map_err(|_| LoadError::InvalidName(name.to_string()))?;
        Self::open(Some(&cname), name)
    }

    /// Open the first name that loads, e.g. `["libm.so.6", "libm.dylib"]`
    pub fn load_any(names: &[&str]) -> Result<Self, LoadError> {
        let mut failures = Vec::with_capacity(names.len());
        for name in names {
            match Self::load(name) {
                Ok(library) => return Ok(library),
                Err(err) => failures.push(err.to_string()),
            }
        }
        Err(LoadError::LoadFailed(failures.join("; ")))
    }

    /// Symbols of the running executable and everything it has loaded
    #[cfg(unix)]
    pub fn this_process() -> Result<Self, LoadError> {
        Self::open(None, "<process>")
    }

    fn open(path: Option<&CString>, label: &str) -> Result<Self, LoadError> {
        let handle = os::open(path).ok_or_else(|| LoadError::LoadFailed(os::last_error()))?;
        debug!(target: "ffi", event = "library_loaded", library = label);
        Ok(Self { handle, label: label.to_string() })
    }

    pub fn name(&self) -> &str {
        &self.label
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> Result<usize, SymbolError> {
        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName(name.to_string()))?;
        match os::lookup(self.handle, &cname) {
            0 => Err(SymbolError::NotFound { symbol: name.to_string(), library: self.label.clone() }),
            address => Ok(address),
        }
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        os::close(self.handle);
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Library").field(&self.label).finish()
    }
}

#[cfg(unix)]
mod os {
    use std::ffi::{c_void, CStr, CString};
    use std::ptr::NonNull;

    pub fn open(path: Option<&CString>) -> Option<NonNull<c_void>> {
        let path = path.map_or(std::ptr::null(), |p| p.as_ptr());
        // SAFETY: `path` is null or a NUL-terminated string that outlives the call.
        NonNull::new(unsafe { libc::dlopen(path, libc::RTLD_NOW | libc::RTLD_LOCAL) })
    }

    pub fn lookup(handle: NonNull<c_void>, name: &CStr) -> usize {
        // SAFETY: the handle is open until `close`.
        unsafe { libc::dlsym(handle.as_ptr(), name.as_ptr()) as usize }
    }

    pub fn close(handle: NonNull<c_void>) {
        // SAFETY: each handle is closed exactly once, from `Library::drop`.
        unsafe { libc::dlclose(handle.as_ptr()) };
    }

    pub fn last_error() -> String {
        // SAFETY: dlerror returns null or a thread-local C string.
        let message = unsafe { libc::dlerror() };
        if message.is_null() {
            "dlopen failed".to_string()
        } else {
            // SAFETY: checked non-null above.
            unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
        }
    }
}

#[cfg(windows)]
mod os {
    use std::ffi::{c_void, CStr, CString};
    use std::ptr::NonNull;

    extern "system" {
        fn LoadLibraryA(name: *const i8) -> *mut c_void;
        fn GetProcAddress(module: *mut c_void, name: *const i8) -> *mut c_void;
        fn FreeLibrary(module: *mut c_void) -> i32;
        fn GetLastError() -> u32;
    }

    pub fn open(path: Option<&CString>) -> Option<NonNull<c_void>> {
        let path = path?;
        // SAFETY: `path` is NUL-terminated.
        NonNull::new(unsafe { LoadLibraryA(path.as_ptr()) })
    }

    pub fn lookup(handle: NonNull<c_void>, name: &CStr) -> usize {
        // SAFETY: the handle is open until `close`.
        unsafe { GetProcAddress(handle.as_ptr(), name.as_ptr()) as usize }
    }

    pub fn close(handle: NonNull<c_void>) {
        // SAFETY: each handle is freed exactly once, from `Library::drop`.
        unsafe { FreeLibrary(handle.as_ptr()) };
    }

    pub fn last_error() -> String {
        // SAFETY: no preconditions.
        format!("LoadLibrary error {}", unsafe { GetLastError() })
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("invalid library name '{0}'")]
    InvalidName(String),
    #[error("failed to load library: {0}")]
    LoadFailed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SymbolError {
    #[error("invalid symbol name '{0}'")]
    InvalidName(String),
    #[error("symbol '{symbol}' not found in {library}")]
    NotFound { symbol: String, library: String },
}
