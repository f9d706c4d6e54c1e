//! Structure pointers, embedded structures and callbacks

use super::{ConversionContext, Converter, FieldContext, Forwarded, Reversed};
use crate::engine::Engine;
use crate::error::CallError;
use crate::interop::FfiValue;
use crate::objects::{Proxy, ProxyFlags};
use crate::script::Value;
use crate::types::{ArgFlags, ArgType};
use core::ffi::c_void;

pub(super) struct ObjectConverter;
pub(super) struct StructConverter;
pub(super) struct CallbackConverter;

/// Pointer behind a proxy, checked against the declared structure type
fn checked_pointer(engine: &Engine, proxy: &Proxy, declared: &ArgType) -> Result<Option<*mut c_void>, CallError> {
    let ptr = engine.proxy_pointer(proxy)?;
    let expected = engine.modules().base_type(declared)?;
    let actual = engine.proxy_type(proxy);
    match actual {
        Some(actual) if engine.modules().is_derived(actual, expected.type_ref) => Ok(Some(ptr)),
        _ => Ok(None),
    }
}

fn object_value(engine: &Engine, ptr: *mut c_void, declared: &ArgType, flags: ArgFlags) -> Result<Value, CallError> {
    if ptr.is_null() {
        return Ok(Value::Nil);
    }
    let base = engine.modules().base_type(declared)?;
    let mut proxy_flags = ProxyFlags::empty();
    if flags.contains(ArgFlags::OWNED) {
        proxy_flags |= ProxyFlags::OWNED;
    }
    Ok(engine
        .proxy_for(ptr, &base, proxy_flags)?
        .map(Value::Proxy)
        .unwrap_or_default())
}

impl Converter for ObjectConverter {
    fn name(&self) -> &'static str {
        "object"
    }

    fn forward(&self, ctx: &mut ConversionContext<'_>) -> Result<Forwarded, CallError> {
        let value = ctx.value();
        let ptr = match &value {
            Value::Nil => std::ptr::null_mut(),
            Value::LightPointer(p) => *p as *mut c_void,
            Value::Proxy(proxy) => {
                let expected = ctx.ty.name().to_string();
                checked_pointer(ctx.engine, proxy, ctx.ty)?.ok_or_else(|| ctx.type_error(&expected, &value))?
            }
            _ => return Err(ctx.type_error(ctx.ty.name(), &value)),
        };
        ctx.set_native(FfiValue::from_ptr(ptr));
        Ok(Forwarded::ONE)
    }

    fn reverse(&self, ctx: &mut ConversionContext<'_>) -> Result<Reversed, CallError> {
        let value = object_value(ctx.engine, ctx.native.as_ptr(), ctx.ty, ctx.flags)?;
        ctx.state.push(value);
        Ok(Reversed::ONE)
    }

    fn field_get(&self, ctx: &FieldContext<'_>) -> Result<Value, CallError> {
        object_value(ctx.engine, ctx.read_ptr(), ctx.ty, ArgFlags::empty())
    }

    fn field_set(&self, ctx: &FieldContext<'_>, value: &Value) -> Result<(), CallError> {
        let mismatch = || CallError::ArgumentType {
            function: ctx.name.to_string(),
            index: 0,
            expected: ctx.ty.name().to_string(),
            got: value.type_name(),
        };
        let ptr = match value {
            Value::Nil => std::ptr::null_mut(),
            Value::LightPointer(p) => *p as *mut c_void,
            Value::Proxy(proxy) => checked_pointer(ctx.engine, proxy, ctx.ty)?.ok_or_else(mismatch)?,
            _ => return Err(mismatch()),
        };
        ctx.write_ptr(ptr);
        Ok(())
    }
}

/// Embedded structures are exposed as proxies aliasing the parent's memory
impl Converter for StructConverter {
    fn name(&self) -> &'static str {
        "struct"
    }

    fn field_get(&self, ctx: &FieldContext<'_>) -> Result<Value, CallError> {
        let addr = ctx.addr();
        let view = match ctx.owner {
            Some(owner) => ctx.engine.proxy_within(addr, ctx.ty, owner)?,
            None => ctx.engine.proxy_for(addr, ctx.ty, ProxyFlags::empty())?,
        };
        Ok(view.map(Value::Proxy).unwrap_or_default())
    }
}

impl CallbackConverter {
    fn script_value(engine: &Engine, ptr: *mut c_void) -> Value {
        if ptr.is_null() {
            return Value::Nil;
        }
        engine
            .closure_at(ptr)
            .map(Value::Closure)
            .unwrap_or(Value::LightPointer(ptr as usize))
    }
}

impl Converter for CallbackConverter {
    fn name(&self) -> &'static str {
        "callback"
    }

    fn forward(&self, ctx: &mut ConversionContext<'_>) -> Result<Forwarded, CallError> {
        let value = ctx.value();
        let ptr = match &value {
            Value::Nil => std::ptr::null_mut(),
            Value::LightPointer(p) => *p as *mut c_void,
            Value::Closure(closure) => ctx.engine.bind_closure(closure, ctx.ty)?,
            Value::Function(function) => {
                // Lives until the end of this call.
                let closure = ctx.engine.closure(ctx.state, function.clone());
                let code = ctx.engine.bind_closure(&closure, ctx.ty)?;
                ctx.frame.keep_closure(closure);
                code
            }
            _ => return Err(ctx.type_error("function", &value)),
        };
        ctx.set_native(FfiValue::from_ptr(ptr));
        Ok(Forwarded::ONE)
    }

    fn reverse(&self, ctx: &mut ConversionContext<'_>) -> Result<Reversed, CallError> {
        ctx.state.push(Self::script_value(ctx.engine, ctx.native.as_ptr()));
        Ok(Reversed::ONE)
    }

    fn field_get(&self, ctx: &FieldContext<'_>) -> Result<Value, CallError> {
        Ok(Self::script_value(ctx.engine, ctx.read_ptr()))
    }

    fn field_set(&self, ctx: &FieldContext<'_>, value: &Value) -> Result<(), CallError> {
        let ptr = match value {
            Value::Nil => std::ptr::null_mut(),
            Value::LightPointer(p) => *p as *mut c_void,
            Value::Closure(closure) => ctx.engine.bind_closure(closure, ctx.ty)?,
            other => {
                return Err(CallError::ArgumentType {
                    function: ctx.name.to_string(),
                    index: 0,
                    expected: "closure".to_string(),
                    got: other.type_name(),
                })
            }
        };
        ctx.write_ptr(ptr);
        Ok(())
    }
}
