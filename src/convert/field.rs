//! In-place access to native memory at a bit offset

use crate::engine::Engine;
use crate::interop::{AbiType, FfiValue};
use crate::objects::Proxy;
use crate::types::ArgType;
use bitvec::prelude::*;
use core::ffi::c_void;

/// Location and type of one value inside native memory
pub struct FieldContext<'a> {
    pub engine: &'a Engine,
    pub ty: &'a ArgType,
    /// Field or element name, for diagnostics
    pub name: &'a str,
    pub base: *mut u8,
    pub bit_offset: u32,
    /// Zero means the full width of the field's type
    pub bit_length: u32,
    /// Object whose memory `base` points into
    pub owner: Option<&'a Proxy>,
}

impl<'a> FieldContext<'a> {
    /// Whole value of `ty` at `addr`
    pub fn at(engine: &'a Engine, ty: &'a ArgType, name: &'a str, addr: *mut u8) -> Self {
        Self {
            engine,
            ty,
            name,
            base: addr,
            bit_offset: 0,
            bit_length: 0,
            owner: None,
        }
    }

    /// Same location, inside `owner`'s memory
    pub fn within(self, owner: &'a Proxy) -> Self {
        Self {
            owner: Some(owner),
            ..self
        }
    }

    #[inline]
    pub fn abi(&self) -> AbiType {
        self.ty.abi().unwrap_or(AbiType::Pointer)
    }

    #[inline]
    pub fn is_bitfield(&self) -> bool {
        self.bit_length != 0 || self.bit_offset % 8 != 0
    }

    /// Address of the first byte of the field
    #[inline]
    pub fn addr(&self) -> *mut c_void {
        // SAFETY: offsets come from the structure layout of `base`.
        unsafe { self.base.add((self.bit_offset / 8) as usize) as *mut c_void }
    }

    fn bit_span(&self) -> (usize, usize, usize) {
        let width = if self.bit_length == 0 {
            self.abi().size() * 8
        } else {
            (self.bit_length as usize).min(64)
        };
        let start = (self.bit_offset % 8) as usize;
        let bytes = (start + width + 7) / 8;
        (start, width, bytes)
    }

    /// Read the field, sign-extending signed bit-fields
    pub fn read(&self) -> FfiValue {
        let abi = self.abi();
        if !self.is_bitfield() {
            // SAFETY: the field lies within the structure.
            return unsafe { FfiValue::read(self.addr(), abi) };
        }
        let (start, width, bytes) = self.bit_span();
        // SAFETY: the bit-field's bytes lie within the structure.
        let raw = unsafe { std::slice::from_raw_parts(self.addr() as *const u8, bytes) };
        let mut value: u64 = raw.view_bits::<Lsb0>()[start..start + width].load_le();
        if abi.is_signed() && width < 64 && value & (1 << (width - 1)) != 0 {
            value |= !0u64 << width;
        }
        FfiValue::from_u64(value, abi)
    }

    /// Write the field, touching only its own bits
    pub fn write(&self, value: FfiValue) {
        let abi = self.abi();
        if !self.is_bitfield() {
            // SAFETY: the field lies within the structure.
            unsafe { value.write(self.addr(), abi) };
            return;
        }
        let (start, width, bytes) = self.bit_span();
        // SAFETY: the bit-field's bytes lie within the structure.
        let raw = unsafe { std::slice::from_raw_parts_mut(self.addr() as *mut u8, bytes) };
        raw.view_bits_mut::<Lsb0>()[start..start + width].store_le(value.as_u64(abi));
    }

    /// Pointer stored in the field
    #[inline]
    pub fn read_ptr(&self) -> *mut c_void {
        // SAFETY: pointer fields are never bit-fields.
        unsafe { FfiValue::read(self.addr(), AbiType::Pointer).as_ptr() }
    }

    #[inline]
    pub fn write_ptr(&self, ptr: *mut c_void) {
        // SAFETY: pointer fields are never bit-fields.
        unsafe { FfiValue::from_ptr(ptr).write(self.addr(), AbiType::Pointer) }
    }
}
