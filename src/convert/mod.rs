//! Conversion dispatch - script values to native slots and back
//!
//! Design: every fundamental type names a converter id per direction
//! (forward, reverse, field get, field set). Ids index one static table of
//! `Converter` implementations, so a single converter serves many types:
//! all signed widths share `SIGNED`, all unsigned widths share `UNSIGNED`.
//!
//! Architecture:
//! - `scalar.rs` - void, bool, integers, floats, enums and flags
//! - `pointer.rs` - typed and untyped pointers, strings, arrays, output cells
//! - `object.rs` - structure pointers, embedded structures, callbacks
//! - `vararg.rs` - runtime-typed variadic tails
//! - `field.rs` - in-place memory access with bit offsets

mod field;
mod object;
mod pointer;
mod scalar;
mod vararg;

pub use field::FieldContext;

use crate::engine::Engine;
use crate::error::CallError;
use crate::interop::{AbiType, CallFrame, FfiValue};
use crate::script::{ScriptState, Value};
use crate::types::{ArgFlags, ArgType};

/// Index into the converter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConverterId(pub u8);

/// Converter ids referenced by the fundamental table
pub mod ids {
    use super::ConverterId;

    pub const VOID: ConverterId = ConverterId(0);
    pub const BOOL: ConverterId = ConverterId(1);
    pub const SIGNED: ConverterId = ConverterId(2);
    pub const UNSIGNED: ConverterId = ConverterId(3);
    pub const FLOAT: ConverterId = ConverterId(4);
    pub const ENUM: ConverterId = ConverterId(5);
    pub const POINTER: ConverterId = ConverterId(6);
    pub const STRING: ConverterId = ConverterId(7);
    pub const OBJECT: ConverterId = ConverterId(8);
    pub const STRUCT: ConverterId = ConverterId(9);
    pub const CALLBACK: ConverterId = ConverterId(10);
    pub const VARARG: ConverterId = ConverterId(11);
}

static CONVERTERS: [&(dyn Converter + Sync); 12] = [
    &scalar::VOID,
    &scalar::BOOL,
    &scalar::SIGNED,
    &scalar::UNSIGNED,
    &scalar::FLOAT,
    &scalar::ENUM,
    &pointer::PointerConverter,
    &pointer::StringConverter,
    &object::ObjectConverter,
    &object::StructConverter,
    &object::CallbackConverter,
    &vararg::VarargConverter,
];

/// Converter registered under `id`
#[inline]
pub fn converter(id: ConverterId) -> &'static dyn Converter {
    CONVERTERS[id.0 as usize]
}

/// Script values consumed by one forward conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forwarded {
    pub script_values: usize,
}

impl Forwarded {
    pub const ONE: Forwarded = Forwarded { script_values: 1 };
}

/// Outcome of one reverse conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reversed {
    /// Script values pushed
    pub values: usize,
    /// Signature entries consumed, at least one
    pub slots: usize,
}

impl Reversed {
    pub const ONE: Reversed = Reversed { values: 1, slots: 1 };
    pub const NONE: Reversed = Reversed { values: 0, slots: 1 };
}

/// Everything a converter may touch while converting one argument
pub struct ConversionContext<'a> {
    pub engine: &'a Engine,
    pub state: &'a ScriptState,
    pub frame: &'a mut CallFrame,
    pub ty: &'a ArgType,
    pub flags: ArgFlags,
    pub function: &'a str,
    /// Signature entry index; 0 is the return value
    pub arg_index: usize,
    /// Native slot written by forward conversions
    pub slot: usize,
    /// Stack index of the script value for forward conversions
    pub stack_index: usize,
    /// One past the last script argument
    pub stack_end: usize,
    /// Native value for reverse conversions
    pub native: FfiValue,
}

impl<'a> ConversionContext<'a> {
    /// Script value being converted; missing arguments read as nil
    pub fn value(&self) -> Value {
        if self.stack_index < self.stack_end {
            self.state.get(self.stack_index).unwrap_or_default()
        } else {
            Value::Nil
        }
    }

    /// ABI type of the argument; pointer-like kinds default to `Pointer`
    #[inline]
    pub fn abi(&self) -> AbiType {
        self.ty.abi().unwrap_or(AbiType::Pointer)
    }

    #[inline]
    pub fn set_native(&mut self, value: FfiValue) {
        if let Some(slot) = self.frame.slots.get_mut(self.slot) {
            *slot = value;
        }
    }

    /// Flag this argument for the demarshaler
    pub fn mark_output(&mut self) {
        if let Some(record) = self.frame.args.get_mut(self.arg_index) {
            record.is_output = true;
        }
    }

    pub fn type_error(&self, expected: &str, got: &Value) -> CallError {
        CallError::ArgumentType {
            function: self.function.to_string(),
            index: self.arg_index,
            expected: expected.to_string(),
            got: got.type_name(),
        }
    }
}

/// One named conversion unit
///
/// Default implementations report the direction as unsupported.
pub trait Converter: Sync {
    fn name(&self) -> &'static str;

    /// Script value to native slot
    fn forward(&self, ctx: &mut ConversionContext<'_>) -> Result<Forwarded, CallError> {
        Err(CallError::NoForwardConversion {
            function: ctx.function.to_string(),
            ty: ctx.ty.name().to_string(),
            index: ctx.arg_index,
        })
    }

    /// Native value to script values pushed on the state's stack
    fn reverse(&self, ctx: &mut ConversionContext<'_>) -> Result<Reversed, CallError> {
        Err(CallError::UnhandledReturnType {
            function: ctx.function.to_string(),
            ty: ctx.ty.name().to_string(),
        })
    }

    /// Read a value stored in native memory
    fn field_get(&self, ctx: &FieldContext<'_>) -> Result<Value, CallError> {
        Err(CallError::configuration(
            ctx.name.to_string(),
            format!("fields of type '{}' cannot be read", ctx.ty.name()),
        ))
    }

    /// Store a value into native memory
    fn field_set(&self, ctx: &FieldContext<'_>, _value: &Value) -> Result<(), CallError> {
        Err(CallError::configuration(
            ctx.name.to_string(),
            format!("fields of type '{}' are read-only", ctx.ty.name()),
        ))
    }
}

#[cfg(test)]
mod tests;
