//! Type definitions for FFI interoperability
//!
//! Defines the native ABI tags and the slot union that holds one native
//! value of any fundamental type.

use core::ffi::c_void;
use libffi::low::{ffi_type, types};
use std::os::raw::{c_long, c_ulong};
use std::ptr::addr_of_mut;

/// Native ABI type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AbiType {
    Void,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
}

impl AbiType {
    /// `long` on this platform
    pub const LONG: AbiType = if core::mem::size_of::<c_long>() == 8 {
        AbiType::I64
    } else {
        AbiType::I32
    };

    pub const ULONG: AbiType = if core::mem::size_of::<c_ulong>() == 8 {
        AbiType::U64
    } else {
        AbiType::U32
    };

    pub const USIZE: AbiType = if core::mem::size_of::<usize>() == 8 {
        AbiType::U64
    } else {
        AbiType::U32
    };

    pub const ISIZE: AbiType = if core::mem::size_of::<isize>() == 8 {
        AbiType::I64
    } else {
        AbiType::I32
    };

    /// Get size of type in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Void => 0,
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Pointer => core::mem::size_of::<*const c_void>(),
        }
    }

    /// Get alignment requirement
    #[inline]
    pub const fn align(self) -> usize {
        if self.size() == 0 {
            1
        } else {
            self.size()
        }
    }

    /// Check if type is integral
    #[inline]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::U8 | Self::U16 | Self::U32 | Self::U64
        )
    }

    #[inline]
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// Check if type is floating point
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// libffi type descriptor for this tag
    pub(crate) fn ffi_type(self) -> *mut ffi_type {
        // SAFETY: the libffi type statics are only read by libffi.
        unsafe {
            match self {
                Self::Void => addr_of_mut!(types::void),
                Self::I8 => addr_of_mut!(types::sint8),
                Self::I16 => addr_of_mut!(types::sint16),
                Self::I32 => addr_of_mut!(types::sint32),
                Self::I64 => addr_of_mut!(types::sint64),
                Self::U8 => addr_of_mut!(types::uint8),
                Self::U16 => addr_of_mut!(types::uint16),
                Self::U32 => addr_of_mut!(types::uint32),
                Self::U64 => addr_of_mut!(types::uint64),
                Self::F32 => addr_of_mut!(types::float),
                Self::F64 => addr_of_mut!(types::double),
                Self::Pointer => addr_of_mut!(types::pointer),
            }
        }
    }
}

/// FFI value container (untagged union)
///
/// Values are always written through the field matching their ABI type
/// on top of a zeroed slot, so that the bytes at the slot's address are
/// exactly what the native side reads for that type.
#[repr(C)]
pub union FfiValue {
    pub i8: i8,
    pub i16: i16,
    pub i32: i32,
    pub i64: i64,
    pub u8: u8,
    pub u16: u16,
    pub u32: u32,
    pub u64: u64,
    pub f32: f32,
    pub f64: f64,
    pub ptr: *mut c_void,
}

impl FfiValue {
    #[inline]
    pub const fn zeroed() -> Self {
        Self { u64: 0 }
    }

    /// Create null pointer
    #[inline]
    pub const fn null() -> Self {
        Self::zeroed()
    }

    /// Create from pointer
    #[inline]
    pub fn from_ptr(ptr: *mut c_void) -> Self {
        let mut v = Self::zeroed();
        v.ptr = ptr;
        v
    }

    /// Store an integer, truncating to the width of `abi`
    pub fn from_i64(value: i64, abi: AbiType) -> Self {
        let mut v = Self::zeroed();
        match abi {
            AbiType::I8 => v.i8 = value as i8,
            AbiType::U8 => v.u8 = value as u8,
            AbiType::I16 => v.i16 = value as i16,
            AbiType::U16 => v.u16 = value as u16,
            AbiType::I32 => v.i32 = value as i32,
            AbiType::U32 => v.u32 = value as u32,
            AbiType::I64 => v.i64 = value,
            AbiType::U64 => v.u64 = value as u64,
            AbiType::F32 => v.f32 = value as f32,
            AbiType::F64 => v.f64 = value as f64,
            AbiType::Pointer => v.ptr = value as usize as *mut c_void,
            AbiType::Void => {}
        }
        v
    }

    pub fn from_u64(value: u64, abi: AbiType) -> Self {
        match abi {
            AbiType::U64 => {
                let mut v = Self::zeroed();
                v.u64 = value;
                v
            }
            AbiType::F32 | AbiType::F64 => Self::from_f64(value as f64, abi),
            _ => Self::from_i64(value as i64, abi),
        }
    }

    pub fn from_f64(value: f64, abi: AbiType) -> Self {
        let mut v = Self::zeroed();
        match abi {
            AbiType::F32 => v.f32 = value as f32,
            AbiType::F64 => v.f64 = value,
            _ => return Self::from_i64(value as i64, abi),
        }
        v
    }

    /// Sign- or zero-extended integer view according to `abi`
    pub fn as_i64(&self, abi: AbiType) -> i64 {
        // SAFETY: every bit pattern is a valid integer; the slot is always
        // fully initialized by `zeroed`.
        unsafe {
            match abi {
                AbiType::I8 => self.i8 as i64,
                AbiType::U8 => self.u8 as i64,
                AbiType::I16 => self.i16 as i64,
                AbiType::U16 => self.u16 as i64,
                AbiType::I32 => self.i32 as i64,
                AbiType::U32 => self.u32 as i64,
                AbiType::I64 => self.i64,
                AbiType::U64 => self.u64 as i64,
                AbiType::F32 => self.f32 as i64,
                AbiType::F64 => self.f64 as i64,
                AbiType::Pointer => self.ptr as usize as i64,
                AbiType::Void => 0,
            }
        }
    }

    pub fn as_u64(&self, abi: AbiType) -> u64 {
        match abi {
            // SAFETY: see `as_i64`.
            AbiType::U64 => unsafe { self.u64 },
            _ => self.as_i64(abi) as u64,
        }
    }

    pub fn as_f64(&self, abi: AbiType) -> f64 {
        // SAFETY: see `as_i64`.
        unsafe {
            match abi {
                AbiType::F32 => self.f32 as f64,
                AbiType::F64 => self.f64,
                AbiType::U64 => self.u64 as f64,
                _ => self.as_i64(abi) as f64,
            }
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut c_void {
        // SAFETY: see `as_i64`.
        unsafe { self.ptr }
    }

    /// Read a value of type `abi` from native memory
    ///
    /// # Safety
    /// `src` must be valid for reads of `abi.size()` bytes.
    pub unsafe fn read(src: *const c_void, abi: AbiType) -> Self {
        let mut v = Self::zeroed();
        match abi {
            AbiType::I8 => v.i8 = (src as *const i8).read_unaligned(),
            AbiType::U8 => v.u8 = (src as *const u8).read_unaligned(),
            AbiType::I16 => v.i16 = (src as *const i16).read_unaligned(),
            AbiType::U16 => v.u16 = (src as *const u16).read_unaligned(),
            AbiType::I32 => v.i32 = (src as *const i32).read_unaligned(),
            AbiType::U32 => v.u32 = (src as *const u32).read_unaligned(),
            AbiType::I64 => v.i64 = (src as *const i64).read_unaligned(),
            AbiType::U64 => v.u64 = (src as *const u64).read_unaligned(),
            AbiType::F32 => v.f32 = (src as *const f32).read_unaligned(),
            AbiType::F64 => v.f64 = (src as *const f64).read_unaligned(),
            AbiType::Pointer => v.ptr = (src as *const *mut c_void).read_unaligned(),
            AbiType::Void => {}
        }
        v
    }

    /// Write this value as type `abi` to native memory
    ///
    /// # Safety
    /// `dst` must be valid for writes of `abi.size()` bytes.
    pub unsafe fn write(&self, dst: *mut c_void, abi: AbiType) {
        match abi {
            AbiType::I8 => (dst as *mut i8).write_unaligned(self.i8),
            AbiType::U8 => (dst as *mut u8).write_unaligned(self.u8),
            AbiType::I16 => (dst as *mut i16).write_unaligned(self.i16),
            AbiType::U16 => (dst as *mut u16).write_unaligned(self.u16),
            AbiType::I32 => (dst as *mut i32).write_unaligned(self.i32),
            AbiType::U32 => (dst as *mut u32).write_unaligned(self.u32),
            AbiType::I64 => (dst as *mut i64).write_unaligned(self.i64),
            AbiType::U64 => (dst as *mut u64).write_unaligned(self.u64),
            AbiType::F32 => (dst as *mut f32).write_unaligned(self.f32),
            AbiType::F64 => (dst as *mut f64).write_unaligned(self.f64),
            AbiType::Pointer => (dst as *mut *mut c_void).write_unaligned(self.ptr),
            AbiType::Void => {}
        }
    }

    /// Narrow a raw return buffer to `abi`
    ///
    /// libffi widens integral returns smaller than a register to the full
    /// `ffi_arg` width; the meaningful bits are the low ones.
    pub(crate) fn normalize_return(raw: FfiValue, abi: AbiType) -> Self {
        if abi.is_integral() {
            // SAFETY: the return buffer was zeroed before the call.
            let wide = unsafe { raw.u64 };
            match abi {
                AbiType::U64 => Self::from_u64(wide, abi),
                _ => Self::from_i64(wide as i64, abi),
            }
        } else {
            raw
        }
    }

    /// Store into a closure return buffer, widening small integers
    ///
    /// # Safety
    /// `dst` must point to a libffi closure return buffer.
    pub(crate) unsafe fn write_return(&self, dst: *mut c_void, abi: AbiType) {
        if abi.is_integral() && abi.size() < core::mem::size_of::<usize>() {
            let wide = if abi.is_signed() {
                self.as_i64(abi) as usize
            } else {
                self.as_u64(abi) as usize
            };
            (dst as *mut usize).write_unaligned(wide);
        } else {
            self.write(dst, abi);
        }
    }
}

impl Default for FfiValue {
    #[inline]
    fn default() -> Self {
        Self::zeroed()
    }
}

// Manual implementations for Copy, Clone, and Debug since union doesn't auto-derive
impl Copy for FfiValue {}
impl Clone for FfiValue {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl core::fmt::Debug for FfiValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // SAFETY: the slot is always fully initialized.
        write!(f, "FfiValue({:#018x})", unsafe { self.u64 })
    }
}
