use super::*;
use crate::interop::ArgRecord;
use crate::script::{Function, Table};
use crate::types::{FieldSpec, Fundamental, ModuleBuilder};
use proptest::prelude::*;
use std::ffi::CStr;

/// One engine, one stack, one scratch frame per conversion
struct Harness {
    engine: Engine,
    state: ScriptState,
    frame: CallFrame,
}

impl Harness {
    fn new() -> Self {
        let engine = Engine::with_defaults();
        let mut b = ModuleBuilder::new("conv");
        let void = b.fundamental("void", Fundamental::Void);
        let _ = b.fundamental("bool", Fundamental::Bool);
        let ch = b.fundamental("char", Fundamental::Char);
        let int = b.fundamental("int", Fundamental::Int);
        let _ = b.fundamental("uint8_t", Fundamental::UChar);
        let _ = b.fundamental("unsigned char", Fundamental::UChar);
        let _ = b.fundamental("short", Fundamental::Short);
        let _ = b.fundamental("unsigned short", Fundamental::UShort);
        let _ = b.fundamental("unsigned int", Fundamental::UInt);
        let _ = b.fundamental("long", Fundamental::Long);
        let _ = b.fundamental("unsigned long", Fundamental::ULong);
        let _ = b.fundamental("int64_t", Fundamental::Int64);
        let _ = b.fundamental("uint64_t", Fundamental::UInt64);
        let _ = b.fundamental("size_t", Fundamental::SizeT);
        let _ = b.fundamental("ssize_t", Fundamental::SSizeT);
        let _ = b.fundamental("double", Fundamental::Double);
        let _ = b.fundamental("float", Fundamental::Float);
        let _ = b.fundamental("...", Fundamental::Vararg);
        let color = b.fundamental("Color", Fundamental::Enum);
        let mode = b.fundamental("Mode", Fundamental::Flags);
        let _ = b.pointer(int);
        let _ = b.pointer(ch);
        let _ = b.pointer(void);
        let _ = b.structure("Pair", 8, &[FieldSpec::at("a", int, 0), FieldSpec::at("b", int, 4)]);
        b.enum_value("RED", color, 1)
            .enum_value("GREEN", color, 2)
            .flags_value("READ", mode, 1)
            .flags_value("WRITE", mode, 2);
        engine.register_module(b.build().unwrap()).unwrap();
        Self {
            engine,
            state: ScriptState::new(),
            frame: CallFrame::default(),
        }
    }

    fn ty(&self, name: &str) -> ArgType {
        self.engine.modules().find_type(name).unwrap()
    }

    fn forward(&mut self, name: &str, values: &[Value]) -> Result<(usize, Forwarded), CallError> {
        let ty = self.ty(name);
        self.frame = CallFrame::default();
        let void = self.ty("void");
        self.frame.push_slot(AbiType::Void);
        self.frame.args.push(ArgRecord {
            ty: void,
            flags: ArgFlags::empty(),
            slot: 0,
            is_output: false,
        });
        let slot = match ty.abi() {
            Some(abi) => self.frame.push_slot(abi),
            None => self.frame.slots.len(),
        };
        self.frame.args.push(ArgRecord {
            ty: ty.clone(),
            flags: ArgFlags::empty(),
            slot,
            is_output: false,
        });

        self.state.set_top(0);
        for value in values {
            self.state.push(value.clone());
        }
        let id = ty.info().forward.unwrap();
        let mut ctx = ConversionContext {
            engine: &self.engine,
            state: &self.state,
            frame: &mut self.frame,
            ty: &ty,
            flags: ArgFlags::empty(),
            function: "test_fn",
            arg_index: 1,
            slot,
            stack_index: 0,
            stack_end: values.len(),
            native: FfiValue::zeroed(),
        };
        let forwarded = converter(id).forward(&mut ctx)?;
        Ok((slot, forwarded))
    }

    fn slot(&self, slot: usize) -> FfiValue {
        self.frame.slots[slot]
    }

    fn reverse(&mut self, name: &str, native: FfiValue) -> Result<Value, CallError> {
        let ty = self.ty(name);
        let id = ty.info().reverse.unwrap();
        self.state.set_top(0);
        let mut ctx = ConversionContext {
            engine: &self.engine,
            state: &self.state,
            frame: &mut self.frame,
            ty: &ty,
            flags: ArgFlags::empty(),
            function: "test_fn",
            arg_index: 0,
            slot: 0,
            stack_index: 0,
            stack_end: 0,
            native,
        };
        converter(id).reverse(&mut ctx)?;
        Ok(self.state.pop().unwrap_or_default())
    }
}

#[test]
fn test_converter_sharing_by_id() {
    let h = Harness::new();
    assert_eq!(h.ty("int").info().forward, Some(ids::SIGNED));
    assert_eq!(h.ty("char").info().forward, Some(ids::SIGNED));
    assert_eq!(h.ty("uint8_t").info().forward, Some(ids::UNSIGNED));
    assert_eq!(converter(ids::SIGNED).name(), "signed");
    assert_eq!(h.ty("void").info().forward, None);
}

#[test]
fn test_integer_truncates_to_declared_width() {
    let mut h = Harness::new();
    let (slot, forwarded) = h.forward("uint8_t", &[Value::Integer(0x1ff)]).unwrap();
    assert_eq!(forwarded, Forwarded::ONE);
    assert_eq!(h.slot(slot).as_i64(AbiType::U8), 0xff);

    let (slot, _) = h.forward("int", &[Value::Number(-12.0)]).unwrap();
    assert_eq!(h.slot(slot).as_i64(AbiType::I32), -12);
}

#[test]
fn test_fractional_number_is_not_an_integer() {
    let mut h = Harness::new();
    match h.forward("int", &[Value::Number(1.5)]) {
        Err(CallError::ArgumentType { index, expected, got, .. }) => {
            assert_eq!(index, 1);
            assert_eq!(expected, "integer");
            assert_eq!(got, "number");
        }
        other => panic!("expected type error, got {other:?}"),
    }
}

#[test]
fn test_missing_value_reads_as_nil_default() {
    let mut h = Harness::new();
    let (slot, _) = h.forward("int", &[]).unwrap();
    assert_eq!(h.slot(slot).as_i64(AbiType::I32), 0);
}

#[test]
fn test_bool_conversions() {
    let mut h = Harness::new();
    let (slot, _) = h.forward("bool", &[Value::Integer(2)]).unwrap();
    assert_eq!(h.slot(slot).as_i64(AbiType::U8), 1);
    assert!(h.forward("bool", &[Value::from("yes")]).is_err());
    assert_eq!(h.reverse("bool", FfiValue::from_i64(0, AbiType::U8)).unwrap(), Value::Boolean(false));
}

#[test]
fn test_unsigned_64_beyond_i64_is_lossy_number() {
    let mut h = Harness::new();
    let value = h.reverse("uint64_t", FfiValue::from_u64(u64::MAX, AbiType::U64)).unwrap();
    assert!(matches!(value, Value::Number(n) if n == u64::MAX as f64));

    let big = 1.5 * 9_223_372_036_854_775_808.0;
    let (slot, _) = h.forward("uint64_t", &[Value::Number(big)]).unwrap();
    assert_eq!(h.slot(slot).as_u64(AbiType::U64), 13_835_058_055_282_163_712);

    let exact = h.reverse("uint64_t", FfiValue::from_u64(42, AbiType::U64)).unwrap();
    assert_eq!(exact, Value::Integer(42));
}

#[test]
fn test_float_narrowing() {
    let mut h = Harness::new();
    let (slot, _) = h.forward("float", &[Value::Number(0.1)]).unwrap();
    let back = h.reverse("float", h.slot(slot)).unwrap();
    assert_eq!(back, Value::Number(0.1f32 as f64));
}

#[test]
fn test_enum_accepts_names_and_flags_combine() {
    let mut h = Harness::new();
    let (slot, _) = h.forward("Color", &[Value::from("GREEN")]).unwrap();
    assert_eq!(h.slot(slot).as_i64(AbiType::I32), 2);

    let (slot, _) = h.forward("Mode", &[Value::from("READ | WRITE")]).unwrap();
    assert_eq!(h.slot(slot).as_i64(AbiType::U32), 3);

    // Enums are not combinable; enum values are not flags.
    assert!(h.forward("Color", &[Value::from("RED|GREEN")]).is_err());
    assert!(h.forward("Mode", &[Value::from("RED")]).is_err());
    assert!(matches!(
        h.forward("Color", &[Value::from("PURPLE")]),
        Err(CallError::UnknownType { .. })
    ));
}

#[test]
fn test_nil_typed_pointer_becomes_output_cell() {
    let mut h = Harness::new();
    let (slot, _) = h.forward("int*", &[Value::Nil]).unwrap();
    assert!(!h.slot(slot).as_ptr().is_null());
    assert!(h.frame.args[1].is_output);

    let (slot, _) = h.forward("void*", &[Value::Nil]).unwrap();
    assert!(h.slot(slot).as_ptr().is_null());
    assert!(!h.frame.args[1].is_output);
}

#[test]
fn test_scalar_by_reference_and_input_array() {
    let mut h = Harness::new();
    let (slot, _) = h.forward("int*", &[Value::Integer(9)]).unwrap();
    let cell = h.slot(slot).as_ptr();
    assert_eq!(unsafe { FfiValue::read(cell, AbiType::I32) }.as_i64(AbiType::I32), 9);
    assert!(!h.frame.args[1].is_output);

    let items = Table::from_values([Value::from(4), Value::from(5), Value::from(6)]);
    let (slot, _) = h.forward("int*", &[Value::Table(items)]).unwrap();
    let array = h.slot(slot).as_ptr() as *const i32;
    let copied = unsafe { std::slice::from_raw_parts(array, 3) };
    assert_eq!(copied, &[4, 5, 6]);
}

#[test]
fn test_string_copies_live_in_the_frame() {
    let mut h = Harness::new();
    let (slot, _) = h.forward("char*", &[Value::from("hello")]).unwrap();
    let ptr = h.slot(slot).as_ptr();
    let text = unsafe { CStr::from_ptr(ptr as *const libc::c_char) };
    assert_eq!(text.to_str().unwrap(), "hello");

    let back = h.reverse("char*", FfiValue::from_ptr(ptr)).unwrap();
    assert_eq!(back, Value::from("hello"));
    assert_eq!(h.reverse("char*", FfiValue::null()).unwrap(), Value::Nil);
    assert!(h.forward("char*", &[Value::from("nul\0inside")]).is_err());
}

#[test]
fn test_vararg_infers_native_types() {
    let mut h = Harness::new();
    let noop = Function::new("noop", |_, _| Ok(vec![]));
    let values = [
        Value::Integer(7),
        Value::Integer(1 << 40),
        Value::Number(2.5),
        Value::from("s"),
        Value::Function(noop),
    ];
    let (_, forwarded) = h.forward("...", &values).unwrap();
    assert_eq!(forwarded.script_values, 5);
    assert_eq!(h.frame.fixed_args, Some(0));
    assert_eq!(
        &h.frame.abi_types[1..],
        &[AbiType::I32, AbiType::I64, AbiType::F64, AbiType::Pointer, AbiType::Pointer]
    );
    // The function has no native form.
    assert!(h.frame.slots[5].as_ptr().is_null());
    assert_eq!(h.engine.stats().warnings, 1);
}

#[test]
fn test_vararg_strv_table() {
    let mut h = Harness::new();
    let strv = Table::from_values([Value::from("a"), Value::from("b")]);
    strv.set_field("kind", Value::from("strv"));
    let (_, _) = h.forward("...", &[Value::Table(strv)]).unwrap();
    let vector = h.frame.slots[1].as_ptr() as *const *const libc::c_char;
    unsafe {
        assert_eq!(CStr::from_ptr(*vector).to_str().unwrap(), "a");
        assert_eq!(CStr::from_ptr(*vector.add(1)).to_str().unwrap(), "b");
        assert!((*vector.add(2)).is_null());
    }
}

#[test]
fn test_bitfield_sign_extension_and_isolation() {
    let h = Harness::new();
    let int = h.ty("int");
    let mut buf = [0xffu8; 4];
    buf[0] = 0;
    let ctx = FieldContext {
        engine: &h.engine,
        ty: &int,
        name: "lo",
        base: buf.as_mut_ptr(),
        bit_offset: 3,
        bit_length: 4,
        owner: None,
    };
    ctx.write(FfiValue::from_i64(-3, AbiType::I32));
    assert_eq!(ctx.read().as_i64(AbiType::I32), -3);
    assert_eq!(buf[0], 0b0110_1000);
    assert_eq!(buf[1], 0xff);

    let uint8 = h.ty("uint8_t");
    let ctx = FieldContext {
        engine: &h.engine,
        ty: &uint8,
        name: "hi",
        base: buf.as_mut_ptr(),
        bit_offset: 12,
        bit_length: 3,
        owner: None,
    };
    assert_eq!(ctx.read().as_i64(AbiType::U8), 7);
}

#[test]
fn test_struct_by_value_has_no_forward_conversion() {
    let h = Harness::new();
    let pair = h.ty("Pair");
    assert_eq!(pair.fundamental, Fundamental::Struct);
    assert!(pair.info().forward.is_none());
    assert!(pair.abi().is_none());
}

const INTEGER_TYPES: [&str; 14] = [
    "char",
    "unsigned char",
    "short",
    "unsigned short",
    "int",
    "unsigned int",
    "long",
    "unsigned long",
    "int64_t",
    "uint64_t",
    "size_t",
    "ssize_t",
    "Color",
    "Mode",
];

/// Inclusive value range of an integer ABI type
fn abi_range(abi: AbiType) -> (i128, i128) {
    match abi {
        AbiType::I8 => (i8::MIN as i128, i8::MAX as i128),
        AbiType::U8 => (0, u8::MAX as i128),
        AbiType::I16 => (i16::MIN as i128, i16::MAX as i128),
        AbiType::U16 => (0, u16::MAX as i128),
        AbiType::I32 => (i32::MIN as i128, i32::MAX as i128),
        AbiType::U32 => (0, u32::MAX as i128),
        AbiType::I64 => (i64::MIN as i128, i64::MAX as i128),
        AbiType::U64 => (0, u64::MAX as i128),
        other => panic!("{other:?} is not an integer type"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_integer_round_trip(name in prop::sample::select(INTEGER_TYPES.to_vec()), raw in any::<u128>()) {
        let mut h = Harness::new();
        let abi = h.ty(name).abi().unwrap();
        let (min, max) = abi_range(abi);
        let span = (max - min + 1) as u128;
        let n = min + (raw % span) as i128;

        let input = if n > i64::MAX as i128 {
            Value::Integer(n as u64 as i64)
        } else {
            Value::Integer(n as i64)
        };
        let (slot, forwarded) = h.forward(name, &[input]).unwrap();
        prop_assert_eq!(forwarded, Forwarded::ONE);
        let back = h.reverse(name, h.slot(slot)).unwrap();

        // Only unsigned 64-bit values past i64::MAX leave the integer domain.
        let expected = if n > i64::MAX as i128 {
            Value::Number(n as u64 as f64)
        } else {
            Value::Integer(n as i64)
        };
        prop_assert_eq!(std::mem::discriminant(&back), std::mem::discriminant(&expected));
        prop_assert_eq!(back, expected);
    }

    #[test]
    fn prop_float_round_trip(x in any::<f32>().prop_filter("finite", |x| x.is_finite())) {
        let mut h = Harness::new();
        let (slot, _) = h.forward("float", &[Value::Number(x as f64)]).unwrap();
        prop_assert_eq!(h.reverse("float", h.slot(slot)).unwrap(), Value::Number(x as f64));
    }

    #[test]
    fn prop_double_round_trip(x in any::<f64>().prop_filter("finite", |x| x.is_finite())) {
        let mut h = Harness::new();
        let (slot, _) = h.forward("double", &[Value::Number(x)]).unwrap();
        prop_assert_eq!(h.reverse("double", h.slot(slot)).unwrap(), Value::Number(x));
    }

    #[test]
    fn prop_bool_round_trip(flag in any::<bool>()) {
        let mut h = Harness::new();
        let (slot, _) = h.forward("bool", &[Value::Boolean(flag)]).unwrap();
        prop_assert_eq!(h.reverse("bool", h.slot(slot)).unwrap(), Value::Boolean(flag));
    }
}
