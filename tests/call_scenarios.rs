//! End-to-end foreign calls through the engine

use callgate::{
    ArgFlags, ArgSpec, CallError, Engine, EngineConfig, Fundamental, ModuleBuilder, ScriptState, Table, Value,
};
use proptest::prelude::*;
use std::os::raw::c_char;

// Native side
extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn divmod(a: i32, b: i32, remainder: *mut i32) -> i32 {
    if !remainder.is_null() {
        // SAFETY: non-null outputs are engine-provided cells.
        unsafe { *remainder = a % b };
    }
    a / b
}

extern "C" fn hypot(x: f64, y: f64) -> f64 {
    (x * x + y * y).sqrt()
}

extern "C" fn is_even(n: i64) -> bool {
    n % 2 == 0
}

static PRIMES: [i32; 5] = [2, 3, 5, 7, 11];

extern "C" fn primes(count: *mut i32) -> *const i32 {
    // SAFETY: the engine passes an output cell.
    unsafe { *count = PRIMES.len() as i32 };
    PRIMES.as_ptr()
}

extern "C" fn sum_ints(values: *const i32, count: i32) -> i32 {
    // SAFETY: the engine copies `count` elements into a frame buffer.
    unsafe { std::slice::from_raw_parts(values, count as usize) }.iter().sum()
}

extern "C" fn apply(f: extern "C" fn(i32) -> i32, x: i32) -> i32 {
    f(x)
}

fn engine_with(config: EngineConfig) -> Engine {
    let engine = Engine::new(config);
    let mut b = ModuleBuilder::new("demo");
    let _void = b.fundamental("void", Fundamental::Void);
    let bool_ty = b.fundamental("bool", Fundamental::Bool);
    let ch = b.fundamental("char", Fundamental::Char);
    let int = b.fundamental("int", Fundamental::Int);
    let int64 = b.fundamental("int64_t", Fundamental::Int64);
    let size = b.fundamental("size_t", Fundamental::SizeT);
    let double = b.fundamental("double", Fundamental::Double);
    let vararg = b.fundamental("...", Fundamental::Vararg);
    let int_ptr = b.pointer(int);
    let string = b.pointer(ch);
    let int_map = b.callback("IntMap", int, &[int.into()]);

    b.native("add", add as usize, int, &[int.into(), int.into()]);
    b.native("divmod", divmod as usize, int, &[int.into(), int.into(), int_ptr.into()]);
    b.native("hypot", hypot as usize, double, &[double.into(), double.into()]);
    b.native("is_even", is_even as usize, bool_ty, &[int64.into()]);
    b.native(
        "primes",
        primes as usize,
        ArgSpec::new(int_ptr, ArgFlags::ARRAY_LEN_NEXT),
        &[int_ptr.into()],
    );
    b.native("sum_ints", sum_ints as usize, int, &[int_ptr.into(), int.into()]);
    b.native("apply", apply as usize, int, &[int_map.into(), int.into()]);
    b.native("strlen", libc::strlen as usize, size, &[string.into()]);
    b.native(
        "snprintf",
        libc::snprintf as usize,
        int,
        &[string.into(), size.into(), string.into(), vararg.into()],
    );
    engine.register_module(b.build().unwrap()).unwrap();
    engine
}

fn engine() -> Engine {
    engine_with(EngineConfig::default())
}

#[test]
fn test_add_two_integers() {
    let engine = engine();
    let state = ScriptState::new();
    let results = engine.invoke(&state, "add", &[3.into(), 4.into()]).unwrap();
    assert_eq!(results, vec![Value::Integer(7)]);
    assert_eq!(state.top(), 0);
}

#[test]
fn test_call_replaces_arguments_on_the_stack() {
    let engine = engine();
    let state = ScriptState::new();
    state.push(Value::from("below"));
    state.push(Value::Integer(1));
    state.push(Value::Integer(2));
    let function = engine.function("add").unwrap();
    assert_eq!(engine.call(&state, &function, 1).unwrap(), 1);
    assert_eq!(state.values_from(0), vec![Value::from("below"), Value::Integer(3)]);
}

#[test]
fn test_output_argument_follows_return_value() {
    let engine = engine();
    let state = ScriptState::new();
    let results = engine.invoke(&state, "divmod", &[17.into(), 5.into(), Value::Nil]).unwrap();
    assert_eq!(results, vec![Value::Integer(3), Value::Integer(2)]);
}

#[test]
fn test_missing_argument_warns_and_defaults() {
    let engine = engine();
    let state = ScriptState::new();
    let results = engine.invoke(&state, "add", &[3.into()]).unwrap();
    assert_eq!(results, vec![Value::Integer(3)]);
    assert_eq!(engine.stats().warnings, 1);

    engine.invoke(&state, "add", &[1.into(), 2.into(), 3.into()]).unwrap();
    assert_eq!(engine.stats().warnings, 2);
}

#[test]
fn test_warnings_can_be_disabled() {
    let mut config = EngineConfig::default();
    config.calls.warn_missing_arguments = false;
    config.calls.warn_extra_arguments = false;
    let engine = engine_with(config);
    let state = ScriptState::new();
    engine.invoke(&state, "add", &[]).unwrap();
    engine.invoke(&state, "add", &[1.into(), 2.into(), 3.into()]).unwrap();
    assert_eq!(engine.stats().warnings, 0);
}

#[test]
fn test_type_error_restores_stack() {
    let engine = engine();
    let state = ScriptState::new();
    state.push(Value::from("keep"));
    match engine.invoke(&state, "add", &[Value::from("x"), 1.into()]) {
        Err(CallError::ArgumentType { function, index, .. }) => {
            assert_eq!(function, "add");
            assert_eq!(index, 1);
        }
        other => panic!("expected type error, got {other:?}"),
    }
    assert_eq!(state.top(), 1);

    let error = engine.script_call(&state, "add", &[Value::Nil, Value::from("y")]).unwrap_err();
    assert!(error.message.contains("add"));
    assert!(error.message_id.is_some());
}

#[test]
fn test_unknown_function() {
    let engine = engine();
    let state = ScriptState::new();
    assert!(matches!(
        engine.invoke(&state, "nope", &[]),
        Err(CallError::UnknownFunction { .. })
    ));
}

#[test]
fn test_floats_bools_and_wide_integers() {
    let engine = engine();
    let state = ScriptState::new();
    let r = engine.invoke(&state, "hypot", &[3.0.into(), 4.into()]).unwrap();
    assert_eq!(r, vec![Value::Number(5.0)]);

    let r = engine.invoke(&state, "is_even", &[Value::Integer(1 << 40)]).unwrap();
    assert_eq!(r, vec![Value::Boolean(true)]);
}

#[test]
fn test_returned_array_sized_by_output_count() {
    let engine = engine();
    let state = ScriptState::new();
    let results = engine.invoke(&state, "primes", &[Value::Nil]).unwrap();
    assert_eq!(results.len(), 1);
    let table = results[0].as_table().unwrap();
    let values: Vec<i64> = table.values().iter().filter_map(Value::as_integer).collect();
    assert_eq!(values, vec![2, 3, 5, 7, 11]);
}

#[test]
fn test_table_passed_as_input_array() {
    let engine = engine();
    let state = ScriptState::new();
    let items = Table::from_values([Value::from(1), Value::from(2), Value::from(39)]);
    let r = engine.invoke(&state, "sum_ints", &[Value::Table(items), 3.into()]).unwrap();
    assert_eq!(r, vec![Value::Integer(42)]);
}

#[test]
fn test_strings_and_variadic_tail() {
    let engine = engine();
    let state = ScriptState::new();
    let r = engine.invoke(&state, "strlen", &[Value::from("hello")]).unwrap();
    assert_eq!(r, vec![Value::Integer(5)]);

    let mut buffer = [0 as c_char; 32];
    let args = [
        Value::LightPointer(buffer.as_mut_ptr() as usize),
        Value::Integer(buffer.len() as i64),
        Value::from("%d|%s|%.2f"),
        Value::Integer(42),
        Value::from("x"),
        Value::Number(1.5),
    ];
    let r = engine.invoke(&state, "snprintf", &args).unwrap();
    assert_eq!(r, vec![Value::Integer(9)]);
    let text = unsafe { std::ffi::CStr::from_ptr(buffer.as_ptr()) };
    assert_eq!(text.to_str().unwrap(), "42|x|1.50");
}

#[test]
fn test_script_function_passed_as_callback() {
    let engine = engine();
    let state = ScriptState::new();
    let triple = callgate::Function::new("triple", |_, args| {
        Ok(vec![Value::Integer(args[0].as_integer().unwrap_or(0) * 3)])
    });
    let r = engine.invoke(&state, "apply", &[Value::Function(triple), 14.into()]).unwrap();
    assert_eq!(r, vec![Value::Integer(42)]);
    assert_eq!(engine.stats().callbacks, 1);
    // The temporary closure was released with the call.
    assert_eq!(engine.closures().live_count(), 0);
}

#[test]
fn test_callback_error_propagates_to_caller() {
    let engine = engine();
    let state = ScriptState::new();
    let failing = callgate::Function::new("failing", |_, _| Err(callgate::ScriptError::new("bad input")));
    match engine.invoke(&state, "apply", &[Value::Function(failing), 1.into()]) {
        Err(CallError::Callback { message, .. }) => assert!(message.contains("bad input")),
        other => panic!("expected callback error, got {other:?}"),
    }
    assert!(engine.take_callback_errors().is_empty());
}

#[test]
fn test_frames_are_pooled_across_calls() {
    let engine = engine();
    let state = ScriptState::new();
    for i in 0..10 {
        engine.invoke(&state, "add", &[i.into(), 1.into()]).unwrap();
    }
    let pool = engine.pool_stats();
    assert_eq!(pool.created, 1);
    assert_eq!(pool.reused, 9);
    assert_eq!(pool.in_flight, 0);
    assert_eq!(engine.interfaces().len(), 1);
    assert_eq!(engine.stats().calls, 10);
}

#[test]
fn test_nested_calls_from_callback_use_separate_frames() {
    let engine = engine();
    let state = ScriptState::new();
    let inner = engine.clone();
    let nested = callgate::Function::new("nested", move |state, args| {
        let r = inner
            .invoke(state, "add", &[args[0].clone(), 100.into()])
            .map_err(|e| callgate::ScriptError::new(e.to_string()))?;
        Ok(r)
    });
    let r = engine.invoke(&state, "apply", &[Value::Function(nested), 5.into()]).unwrap();
    assert_eq!(r, vec![Value::Integer(105)]);
    assert_eq!(engine.pool_stats().high_water, 3);
}

proptest! {
    #[test]
    fn prop_add_matches_native(a in any::<i32>(), b in any::<i32>()) {
        let engine = engine();
        let state = ScriptState::new();
        let r = engine.invoke(&state, "add", &[a.into(), b.into()]).unwrap();
        prop_assert_eq!(r, vec![Value::Integer(a.wrapping_add(b) as i64)]);
    }

    #[test]
    fn prop_divmod_reconstructs(a in -10_000i32..10_000, b in 1i32..500) {
        let engine = engine();
        let state = ScriptState::new();
        let r = engine.invoke(&state, "divmod", &[a.into(), b.into(), Value::Nil]).unwrap();
        let q = r[0].as_integer().unwrap();
        let m = r[1].as_integer().unwrap();
        prop_assert_eq!(q * b as i64 + m, a as i64);
    }
}
