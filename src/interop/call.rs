//! Foreign call invocation through libffi
//!
//! A `CallInterface` wraps one prepared `ffi_cif` together with the
//! argument type array it points into. Interfaces are immutable once
//! prepared and shared through `Rc`, so closures can keep the one they
//! were bound with alive for as long as their trampoline exists.

use super::frame::CallFrame;
use super::types::{AbiType, FfiValue};
use crate::error::CallError;
use core::ffi::c_void;
use libffi::low::{self, ffi_abi_FFI_DEFAULT_ABI, ffi_cif, ffi_type, CodePtr};
use lru::LruCache;
use smallvec::SmallVec;
use std::cell::{RefCell, UnsafeCell};
use std::num::NonZeroUsize;
use std::rc::Rc;
use tracing::trace;

/// Cache key: return ABI, argument ABIs and the fixed-argument count
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CifKey {
    ret: AbiType,
    args: SmallVec<[AbiType; 8]>,
    fixed: Option<usize>,
}

impl CifKey {
    pub fn new(ret: AbiType, args: &[AbiType], fixed: Option<usize>) -> Self {
        Self {
            ret,
            args: SmallVec::from_slice(args),
            fixed,
        }
    }
}

/// A prepared native call interface
pub struct CallInterface {
    cif: Box<UnsafeCell<ffi_cif>>,
    // Referenced by `cif`; must not move or change after preparation.
    atypes: Box<[*mut ffi_type]>,
    ret: AbiType,
    args: Box<[AbiType]>,
}

impl CallInterface {
    /// Prepare an interface; `fixed` marks a variadic call with that many
    /// fixed arguments
    pub fn prepare(ret: AbiType, args: &[AbiType], fixed: Option<usize>) -> Result<Self, String> {
        let mut atypes: Box<[*mut ffi_type]> = args.iter().map(|a| a.ffi_type()).collect();
        // SAFETY: an all-zero ffi_cif is the documented pre-preparation state.
        let cif = Box::new(UnsafeCell::new(unsafe { std::mem::zeroed::<ffi_cif>() }));
        let atypes_ptr = if atypes.is_empty() {
            std::ptr::null_mut()
        } else {
            atypes.as_mut_ptr()
        };

        // SAFETY: cif and atypes are heap allocations owned by the returned
        // interface and never move afterwards.
        let status = unsafe {
            match fixed {
                Some(fixed) => low::prep_cif_var(
                    cif.get(),
                    ffi_abi_FFI_DEFAULT_ABI,
                    fixed,
                    args.len(),
                    ret.ffi_type(),
                    atypes_ptr,
                ),
                None => low::prep_cif(cif.get(), ffi_abi_FFI_DEFAULT_ABI, args.len(), ret.ffi_type(), atypes_ptr),
            }
        };
        status.map_err(|err| format!("{err:?} for ({args:?}) -> {ret:?}"))?;

        Ok(Self {
            cif,
            atypes,
            ret,
            args: args.into(),
        })
    }

    #[inline]
    pub fn ret(&self) -> AbiType {
        self.ret
    }

    #[inline]
    pub fn args(&self) -> &[AbiType] {
        &self.args
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.atypes.len()
    }

    pub(crate) fn cif_ptr(&self) -> *mut ffi_cif {
        self.cif.get()
    }

    /// Call `address` with the frame's argument slots, storing the
    /// normalized return value in slot 0
    ///
    /// # Safety
    /// `address` must be a function whose native signature matches this
    /// interface, and every pointer held in the frame's slots must be valid
    /// for what the callee does with it.
    pub unsafe fn invoke(&self, address: usize, frame: &mut CallFrame) {
        let mut values: SmallVec<[*mut c_void; 8]> = frame.slots[1..]
            .iter_mut()
            .map(|slot| slot as *mut FfiValue as *mut c_void)
            .collect();
        let avalue = if values.is_empty() {
            std::ptr::null_mut()
        } else {
            values.as_mut_ptr()
        };
        let code = CodePtr::from_ptr(address as *const c_void);

        let raw = match self.ret {
            AbiType::Void => {
                low::call::<()>(self.cif.get(), code, avalue);
                FfiValue::zeroed()
            }
            AbiType::F32 => {
                let mut v = FfiValue::zeroed();
                v.f32 = low::call::<f32>(self.cif.get(), code, avalue);
                v
            }
            AbiType::F64 => {
                let mut v = FfiValue::zeroed();
                v.f64 = low::call::<f64>(self.cif.get(), code, avalue);
                v
            }
            AbiType::I64 | AbiType::U64 => {
                let mut v = FfiValue::zeroed();
                v.u64 = low::call::<u64>(self.cif.get(), code, avalue);
                v
            }
            // Narrower integral and pointer returns arrive widened to ffi_arg.
            _ => {
                let mut v = FfiValue::zeroed();
                v.u64 = low::call::<usize>(self.cif.get(), code, avalue) as u64;
                v
            }
        };
        frame.slots[0] = FfiValue::normalize_return(raw, self.ret);
    }
}

impl std::fmt::Debug for CallInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallInterface")
            .field("ret", &self.ret)
            .field("args", &self.args)
            .finish()
    }
}

/// LRU cache of prepared interfaces, keyed by ABI shape
pub struct InterfaceCache {
    entries: RefCell<LruCache<CifKey, Rc<CallInterface>>>,
}

impl InterfaceCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RefCell::new(LruCache::new(capacity)),
        }
    }

    /// Cached interface for this shape, prepared on first use
    pub fn get_or_prepare(
        &self,
        function: &str,
        ret: AbiType,
        args: &[AbiType],
        fixed: Option<usize>,
    ) -> Result<Rc<CallInterface>, CallError> {
        let key = CifKey::new(ret, args, fixed);
        if let Some(found) = self.entries.borrow_mut().get(&key) {
            return Ok(found.clone());
        }
        let prepared = CallInterface::prepare(ret, args, fixed).map_err(|detail| CallError::Prepare {
            function: function.to_string(),
            detail,
        })?;
        trace!(event = "cif_prepared", function = function, args = args.len(), "Call interface prepared");
        let prepared = Rc::new(prepared);
        self.entries.borrow_mut().put(key, prepared.clone());
        Ok(prepared)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }
}
