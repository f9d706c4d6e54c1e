//! Pointer and string conversions
//!
//! A nil passed for a typed pointer requests an output: the marshaler
//! hands the native side a zeroed cell and the demarshaler reads it back.

use super::{converter, ConversionContext, Converter, FieldContext, Forwarded, Reversed};
use crate::engine::Engine;
use crate::error::CallError;
use crate::interop::{AbiType, FfiValue};
use crate::script::{Table, Value};
use crate::types::{ArgFlags, ArgType};
use core::ffi::c_void;
use std::ffi::{CStr, CString};

pub(super) struct PointerConverter;
pub(super) struct StringConverter;

/// Element size of a native array of `ty`
fn element_size(ty: &ArgType) -> Option<usize> {
    match ty.abi() {
        Some(AbiType::Void) | None => None,
        Some(abi) => Some(abi.size()),
    }
}

/// Store `value` as a `ty` at `addr` through the type's field converter
fn store_element(engine: &Engine, ty: &ArgType, name: &str, addr: *mut u8, value: &Value) -> Result<(), CallError> {
    let id = ty.info().field_set.ok_or_else(|| {
        CallError::configuration(name.to_string(), format!("cannot store values of type '{}'", ty.name()))
    })?;
    converter(id).field_set(&FieldContext::at(engine, ty, name, addr), value)
}

fn load_element(engine: &Engine, ty: &ArgType, name: &str, addr: *mut u8) -> Result<Value, CallError> {
    let id = ty.info().field_get.ok_or_else(|| {
        CallError::configuration(name.to_string(), format!("cannot load values of type '{}'", ty.name()))
    })?;
    converter(id).field_get(&FieldContext::at(engine, ty, name, addr))
}

fn copy_string(ctx: &mut ConversionContext<'_>, text: &str, value: &Value) -> Result<*mut c_void, CallError> {
    let owned = CString::new(text).map_err(|_| ctx.type_error("string without NUL bytes", value))?;
    Ok(ctx.frame.keep_string(owned))
}

/// Element count paired with the array at `ctx.arg_index`
fn paired_count(ctx: &ConversionContext<'_>) -> Result<Option<i64>, CallError> {
    let Some(next) = ctx.frame.args.get(ctx.arg_index + 1) else {
        return Ok(None);
    };
    let Some(slot) = ctx.frame.slots.get(next.slot).copied() else {
        return Ok(None);
    };
    if next.ty.indirection() == 0 && next.ty.fundamental.is_numeric() {
        let abi = next.ty.abi().unwrap_or(AbiType::I64);
        return Ok(Some(slot.as_i64(abi)));
    }
    if next.is_output {
        let count_ty = ctx.engine.modules().pointee(&next.ty)?;
        let abi = count_ty.abi().unwrap_or(AbiType::I64);
        let cell = slot.as_ptr();
        if cell.is_null() {
            return Ok(None);
        }
        // SAFETY: output cells are frame-owned and sized for any scalar.
        return Ok(Some(unsafe { FfiValue::read(cell, abi) }.as_i64(abi)));
    }
    Ok(None)
}

impl Converter for PointerConverter {
    fn name(&self) -> &'static str {
        "pointer"
    }

    fn forward(&self, ctx: &mut ConversionContext<'_>) -> Result<Forwarded, CallError> {
        let value = ctx.value();
        let typed = ctx.ty.is_typed_pointer();
        let ptr = match &value {
            Value::Nil if typed => {
                let cell = ctx.frame.alloc_cell();
                ctx.mark_output();
                cell
            }
            Value::Nil => std::ptr::null_mut(),
            Value::LightPointer(p) => *p as *mut c_void,
            Value::Proxy(proxy) => ctx.engine.proxy_pointer(proxy)?,
            Value::String(s) => copy_string(ctx, s, &value)?,
            Value::Table(table) if typed => {
                let element = ctx.engine.modules().pointee(ctx.ty)?;
                let size = element_size(&element).ok_or_else(|| ctx.type_error("pointer", &value))?;
                let items = table.values();
                let buffer = ctx.frame.alloc_bytes(size * items.len().max(1));
                for (i, item) in items.iter().enumerate() {
                    // SAFETY: the buffer holds `items.len()` elements.
                    let addr = unsafe { buffer.add(i * size) };
                    store_element(ctx.engine, &element, ctx.function, addr, item)?;
                }
                buffer as *mut c_void
            }
            Value::Boolean(_) | Value::Integer(_) | Value::Number(_) if typed => {
                // Input passed by reference.
                let element = ctx.engine.modules().pointee(ctx.ty)?;
                let cell = ctx.frame.alloc_cell();
                store_element(ctx.engine, &element, ctx.function, cell as *mut u8, &value)?;
                cell
            }
            _ => return Err(ctx.type_error("pointer", &value)),
        };
        ctx.set_native(FfiValue::from_ptr(ptr));
        Ok(Forwarded::ONE)
    }

    fn reverse(&self, ctx: &mut ConversionContext<'_>) -> Result<Reversed, CallError> {
        let ptr = ctx.native.as_ptr();
        if !ctx.flags.contains(ArgFlags::ARRAY_LEN_NEXT) {
            ctx.state.push(if ptr.is_null() {
                Value::Nil
            } else {
                Value::LightPointer(ptr as usize)
            });
            return Ok(Reversed::ONE);
        }

        let count = paired_count(ctx)?.unwrap_or(0).max(0) as usize;
        if ptr.is_null() {
            ctx.state.push(Value::Nil);
            return Ok(Reversed { values: 1, slots: 2 });
        }
        let element = ctx.engine.modules().pointee(ctx.ty)?;
        let size = element_size(&element).ok_or_else(|| {
            CallError::configuration(ctx.function.to_string(), format!("array of '{}' has no element size", element.name()))
        })?;
        let table = Table::new();
        for i in 0..count {
            // SAFETY: the callee reported `count` elements.
            let addr = unsafe { (ptr as *mut u8).add(i * size) };
            table.push(load_element(ctx.engine, &element, ctx.function, addr)?);
        }
        if ctx.flags.contains(ArgFlags::OWNED) {
            // SAFETY: ownership of a malloc'd array was transferred to us.
            unsafe { libc::free(ptr) };
        }
        ctx.state.push(Value::Table(table));
        Ok(Reversed { values: 1, slots: 2 })
    }

    fn field_get(&self, ctx: &FieldContext<'_>) -> Result<Value, CallError> {
        let ptr = ctx.read_ptr();
        Ok(if ptr.is_null() {
            Value::Nil
        } else {
            Value::LightPointer(ptr as usize)
        })
    }

    fn field_set(&self, ctx: &FieldContext<'_>, value: &Value) -> Result<(), CallError> {
        let ptr = match value {
            Value::Nil => std::ptr::null_mut(),
            Value::LightPointer(p) => *p as *mut c_void,
            Value::Proxy(proxy) => ctx.engine.proxy_pointer(proxy)?,
            other => {
                return Err(CallError::ArgumentType {
                    function: ctx.name.to_string(),
                    index: 0,
                    expected: "pointer".to_string(),
                    got: other.type_name(),
                })
            }
        };
        ctx.write_ptr(ptr);
        Ok(())
    }
}

/// Copy a NUL-terminated string out of native memory
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn read_c_string(ptr: *const c_void) -> Value {
    if ptr.is_null() {
        return Value::Nil;
    }
    Value::from(CStr::from_ptr(ptr as *const libc::c_char).to_string_lossy().into_owned())
}

impl Converter for StringConverter {
    fn name(&self) -> &'static str {
        "string"
    }

    fn forward(&self, ctx: &mut ConversionContext<'_>) -> Result<Forwarded, CallError> {
        let value = ctx.value();
        let ptr = match &value {
            Value::Nil => std::ptr::null_mut(),
            Value::String(s) => copy_string(ctx, s, &value)?,
            Value::LightPointer(p) => *p as *mut c_void,
            Value::Proxy(proxy) => ctx.engine.proxy_pointer(proxy)?,
            _ => return Err(ctx.type_error("string", &value)),
        };
        ctx.set_native(FfiValue::from_ptr(ptr));
        Ok(Forwarded::ONE)
    }

    fn reverse(&self, ctx: &mut ConversionContext<'_>) -> Result<Reversed, CallError> {
        let ptr = ctx.native.as_ptr();
        // SAFETY: the descriptor declares a C string.
        let value = unsafe { read_c_string(ptr) };
        if !ptr.is_null() && ctx.flags.contains(ArgFlags::OWNED) {
            // SAFETY: ownership of a malloc'd string was transferred to us.
            unsafe { libc::free(ptr) };
        }
        ctx.state.push(value);
        Ok(Reversed::ONE)
    }

    fn field_get(&self, ctx: &FieldContext<'_>) -> Result<Value, CallError> {
        // SAFETY: the field is declared as a C string.
        Ok(unsafe { read_c_string(ctx.read_ptr()) })
    }
}
