//! Variadic tails: native types inferred from runtime script types

use super::{ConversionContext, Converter, Forwarded};
use crate::error::{ArgumentWarning, CallError};
use crate::interop::{AbiType, FfiValue};
use crate::script::{Table, Value};
use core::ffi::c_void;
use std::ffi::CString;

pub(super) struct VarargConverter;

/// Table field selecting how an aggregate is passed
const KIND_FIELD: &str = "kind";

enum Passed {
    Native(AbiType, FfiValue),
    Unhandled,
}

fn integer(i: i64) -> Passed {
    match i32::try_from(i) {
        Ok(small) => Passed::Native(AbiType::I32, FfiValue::from_i64(small as i64, AbiType::I32)),
        Err(_) => Passed::Native(AbiType::I64, FfiValue::from_i64(i, AbiType::I64)),
    }
}

fn pointer(ptr: *mut c_void) -> Passed {
    Passed::Native(AbiType::Pointer, FfiValue::from_ptr(ptr))
}

impl VarargConverter {
    fn infer(ctx: &mut ConversionContext<'_>, value: &Value) -> Result<Passed, CallError> {
        Ok(match value {
            Value::Nil => pointer(std::ptr::null_mut()),
            Value::Boolean(b) => Passed::Native(AbiType::U32, FfiValue::from_i64(*b as i64, AbiType::U32)),
            Value::Integer(i) => integer(*i),
            Value::Number(n) => match value.as_integer() {
                Some(i) => integer(i),
                None => Passed::Native(AbiType::F64, FfiValue::from_f64(*n, AbiType::F64)),
            },
            Value::String(s) => match CString::new(s.as_bytes()) {
                Ok(owned) => pointer(ctx.frame.keep_string(owned)),
                Err(_) => Passed::Unhandled,
            },
            Value::LightPointer(p) => pointer(*p as *mut c_void),
            Value::Proxy(proxy) => pointer(ctx.engine.proxy_pointer(proxy)?),
            Value::Closure(closure) => match closure.code_pointer() {
                Some(code) => pointer(code),
                None => Passed::Unhandled,
            },
            Value::Table(table) => Self::aggregate(ctx, table),
            Value::Function(_) => Passed::Unhandled,
        })
    }

    /// `kind = "strv"` passes a NULL-terminated string array,
    /// `kind = "boxed"` an opaque reference to the `value` field
    fn aggregate(ctx: &mut ConversionContext<'_>, table: &Table) -> Passed {
        match table.field(KIND_FIELD).as_str() {
            Some("strv") => {
                let mut strings = Vec::with_capacity(table.len());
                for item in table.values() {
                    match item.as_str().map(CString::new) {
                        Some(Ok(s)) => strings.push(s),
                        _ => return Passed::Unhandled,
                    }
                }
                pointer(ctx.frame.keep_strv(strings))
            }
            Some("boxed") => pointer(ctx.frame.keep_value(table.field("value"))),
            _ => Passed::Unhandled,
        }
    }
}

impl Converter for VarargConverter {
    fn name(&self) -> &'static str {
        "vararg"
    }

    /// Consumes every remaining script argument, one native slot each
    fn forward(&self, ctx: &mut ConversionContext<'_>) -> Result<Forwarded, CallError> {
        let fixed = ctx.frame.slots.len().saturating_sub(1);
        ctx.frame.fixed_args = Some(fixed);

        let mut consumed = 0;
        for index in ctx.stack_index..ctx.stack_end {
            let value = ctx.state.get(index).unwrap_or_default();
            match Self::infer(ctx, &value)? {
                Passed::Native(abi, native) => {
                    ctx.frame.push_value(abi, native);
                }
                Passed::Unhandled => {
                    ctx.engine.warn(ArgumentWarning::UnhandledVararg {
                        function: ctx.function.to_string(),
                        got: value.type_name(),
                    });
                    ctx.frame.warned = true;
                    ctx.frame.push_value(AbiType::Pointer, FfiValue::null());
                }
            }
            consumed += 1;
        }
        Ok(Forwarded {
            script_values: consumed,
        })
    }
}
