//! Scalar conversions: void, bool, integers, floats, enums and flags

use super::{ConversionContext, Converter, FieldContext, Forwarded, Reversed};
use crate::engine::Engine;
use crate::error::CallError;
use crate::interop::{AbiType, FfiValue};
use crate::script::Value;
use crate::types::{ArgType, ConstantKind, Fundamental};
use num_traits::ToPrimitive;

/// Value encoding shared by the four directions of a scalar converter
pub(super) trait ScalarCodec: Sync {
    const NAME: &'static str;
    const EXPECTED: &'static str;

    /// `Ok(None)` means the value has the wrong script type
    fn encode(&self, engine: &Engine, value: &Value, ty: &ArgType) -> Result<Option<FfiValue>, CallError>;

    fn decode(&self, native: FfiValue, abi: AbiType) -> Value;
}

/// Adapts a codec to the `Converter` contract
pub(super) struct Scalar<C>(pub C);

impl<C: ScalarCodec> Converter for Scalar<C> {
    fn name(&self) -> &'static str {
        C::NAME
    }

    fn forward(&self, ctx: &mut ConversionContext<'_>) -> Result<Forwarded, CallError> {
        let value = ctx.value();
        let native = self
            .0
            .encode(ctx.engine, &value, ctx.ty)?
            .ok_or_else(|| ctx.type_error(C::EXPECTED, &value))?;
        ctx.set_native(native);
        Ok(Forwarded::ONE)
    }

    fn reverse(&self, ctx: &mut ConversionContext<'_>) -> Result<Reversed, CallError> {
        ctx.state.push(self.0.decode(ctx.native, ctx.abi()));
        Ok(Reversed::ONE)
    }

    fn field_get(&self, ctx: &FieldContext<'_>) -> Result<Value, CallError> {
        Ok(self.0.decode(ctx.read(), ctx.abi()))
    }

    fn field_set(&self, ctx: &FieldContext<'_>, value: &Value) -> Result<(), CallError> {
        let native = self.0.encode(ctx.engine, value, ctx.ty)?.ok_or_else(|| CallError::ArgumentType {
            function: ctx.name.to_string(),
            index: 0,
            expected: C::EXPECTED.to_string(),
            got: value.type_name(),
        })?;
        ctx.write(native);
        Ok(())
    }
}

pub(super) struct VoidConverter;
pub(super) struct BoolCodec;
pub(super) struct SignedCodec;
pub(super) struct UnsignedCodec;
pub(super) struct FloatCodec;
pub(super) struct EnumCodec;

pub(super) const VOID: VoidConverter = VoidConverter;
pub(super) const BOOL: Scalar<BoolCodec> = Scalar(BoolCodec);
pub(super) const SIGNED: Scalar<SignedCodec> = Scalar(SignedCodec);
pub(super) const UNSIGNED: Scalar<UnsignedCodec> = Scalar(UnsignedCodec);
pub(super) const FLOAT: Scalar<FloatCodec> = Scalar(FloatCodec);
pub(super) const ENUM: Scalar<EnumCodec> = Scalar(EnumCodec);

/// `void` produces no script values at all
impl Converter for VoidConverter {
    fn name(&self) -> &'static str {
        "void"
    }

    fn reverse(&self, _ctx: &mut ConversionContext<'_>) -> Result<Reversed, CallError> {
        Ok(Reversed::NONE)
    }
}

impl ScalarCodec for BoolCodec {
    const NAME: &'static str = "bool";
    const EXPECTED: &'static str = "boolean";

    fn encode(&self, _: &Engine, value: &Value, ty: &ArgType) -> Result<Option<FfiValue>, CallError> {
        let abi = ty.abi().unwrap_or(AbiType::U8);
        let flag = match value {
            Value::Nil => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            _ => return Ok(None),
        };
        Ok(Some(FfiValue::from_i64(flag as i64, abi)))
    }

    fn decode(&self, native: FfiValue, abi: AbiType) -> Value {
        Value::Boolean(native.as_i64(abi) != 0)
    }
}

fn integer_of(value: &Value) -> Option<i64> {
    match value {
        Value::Nil => Some(0),
        Value::Boolean(b) => Some(*b as i64),
        other => other.as_integer(),
    }
}

impl ScalarCodec for SignedCodec {
    const NAME: &'static str = "signed";
    const EXPECTED: &'static str = "integer";

    fn encode(&self, _: &Engine, value: &Value, ty: &ArgType) -> Result<Option<FfiValue>, CallError> {
        let abi = ty.abi().unwrap_or(AbiType::I64);
        Ok(integer_of(value).map(|n| FfiValue::from_i64(n, abi)))
    }

    fn decode(&self, native: FfiValue, abi: AbiType) -> Value {
        Value::Integer(native.as_i64(abi))
    }
}

impl ScalarCodec for UnsignedCodec {
    const NAME: &'static str = "unsigned";
    const EXPECTED: &'static str = "integer";

    fn encode(&self, _: &Engine, value: &Value, ty: &ArgType) -> Result<Option<FfiValue>, CallError> {
        let abi = ty.abi().unwrap_or(AbiType::U64);
        let n = match value {
            // Integral numbers beyond i64 still fit the unsigned range.
            Value::Number(n) if n.fract() == 0.0 && *n > i64::MAX as f64 => n.to_u64(),
            other => integer_of(other).map(|i| i as u64),
        };
        Ok(n.map(|n| FfiValue::from_u64(n, abi)))
    }

    /// Values above `i64::MAX` become (possibly inexact) numbers
    fn decode(&self, native: FfiValue, abi: AbiType) -> Value {
        let n = native.as_u64(abi);
        match i64::try_from(n) {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Number(n as f64),
        }
    }
}

impl ScalarCodec for FloatCodec {
    const NAME: &'static str = "float";
    const EXPECTED: &'static str = "number";

    fn encode(&self, _: &Engine, value: &Value, ty: &ArgType) -> Result<Option<FfiValue>, CallError> {
        let abi = ty.abi().unwrap_or(AbiType::F64);
        let n = match value {
            Value::Nil => Some(0.0),
            other => other.as_number(),
        };
        Ok(n.map(|n| FfiValue::from_f64(n, abi)))
    }

    fn decode(&self, native: FfiValue, abi: AbiType) -> Value {
        Value::Number(native.as_f64(abi))
    }
}

impl ScalarCodec for EnumCodec {
    const NAME: &'static str = "enum";
    const EXPECTED: &'static str = "integer or constant name";

    /// Accepts integers or constant names; flags also accept `A|B`
    fn encode(&self, engine: &Engine, value: &Value, ty: &ArgType) -> Result<Option<FfiValue>, CallError> {
        let abi = ty.abi().unwrap_or(AbiType::I32);
        let Value::String(names) = value else {
            return Ok(integer_of(value).map(|n| FfiValue::from_i64(n, abi)));
        };
        let is_flags = ty.fundamental == Fundamental::Flags;
        let mut combined = 0i64;
        for (i, name) in names.split('|').map(str::trim).enumerate() {
            if i > 0 && !is_flags {
                return Ok(None);
            }
            let constant = engine
                .modules()
                .find_constant(name, Some(ty.type_ref.module))
                .ok_or_else(|| CallError::UnknownType {
                    name: format!("{}::{}", ty.name(), name),
                })?;
            if is_flags && constant.kind == ConstantKind::Enum {
                return Ok(None);
            }
            combined |= constant.value;
        }
        Ok(Some(FfiValue::from_i64(combined, abi)))
    }

    fn decode(&self, native: FfiValue, abi: AbiType) -> Value {
        Value::Integer(native.as_i64(abi))
    }
}
