//! Script closures called from native code

use callgate::{CallError, ClosureState, Engine, FieldSpec, Function, Fundamental, ModuleBuilder, ScriptState, Value};

type IntMap = extern "C" fn(i32) -> i32;

extern "C" fn apply_twice(f: IntMap, x: i32) -> i32 {
    f(f(x))
}

fn engine() -> Engine {
    let engine = Engine::with_defaults();
    let mut b = ModuleBuilder::new("events");
    let int = b.fundamental("int", Fundamental::Int);
    let double = b.fundamental("double", Fundamental::Double);
    let int_map = b.callback("IntMap", int, &[int.into()]);
    b.callback("Scale", double, &[double.into()]);
    b.structure("Handler", 16, &[FieldSpec::at("on_event", int_map, 0), FieldSpec::at("id", int, 8)]);
    b.native("apply_twice", apply_twice as usize, int, &[int_map.into(), int.into()]);
    engine.register_module(b.build().unwrap()).unwrap();
    engine
}

fn doubler() -> Function {
    Function::new("double", |_, args| {
        Ok(vec![Value::Integer(args[0].as_integer().unwrap_or(0) * 2)])
    })
}

#[test]
fn test_native_code_calls_script_closure() {
    let engine = engine();
    let state = ScriptState::new();
    let closure = engine.closure(&state, doubler());
    let code = engine.bind_closure_as(&closure, "IntMap").unwrap();

    let f: IntMap = unsafe { std::mem::transmute::<*mut std::ffi::c_void, IntMap>(code) };
    assert_eq!(f(21), 42);
}

#[test]
fn test_closure_value_binds_once_across_calls() {
    let engine = engine();
    let state = ScriptState::new();
    let closure = engine.closure(&state, doubler());
    assert_eq!(closure.state(), ClosureState::Unbound);

    let arg = Value::Closure(closure.clone());
    let r = engine.invoke(&state, "apply_twice", &[arg.clone(), 5.into()]).unwrap();
    assert_eq!(r, vec![Value::Integer(20)]);
    let code = closure.code_pointer().unwrap();

    engine.invoke(&state, "apply_twice", &[arg, 1.into()]).unwrap();
    assert_eq!(closure.code_pointer(), Some(code));
    assert_eq!(engine.stats().callbacks, 4);

    // Bound to IntMap, so a different function type is refused.
    assert!(matches!(
        engine.bind_closure_as(&closure, "Scale"),
        Err(CallError::SignatureMismatch { .. })
    ));
}

#[test]
fn test_callback_field_reads_back_as_closure() {
    let engine = engine();
    let state = ScriptState::new();
    let handler = engine.new_struct("Handler").unwrap();
    let closure = engine.closure(&state, doubler());

    engine.set_field(&handler, "on_event", &Value::Closure(closure.clone())).unwrap();
    assert_eq!(engine.get_field(&handler, "on_event").unwrap(), Value::Closure(closure.clone()));

    engine.set_field(&handler, "on_event", &Value::Nil).unwrap();
    assert_eq!(engine.get_field(&handler, "on_event").unwrap(), Value::Nil);
}

#[test]
fn test_finalized_closure_is_stale_not_undefined() {
    let engine = engine();
    let state = ScriptState::new();
    let closure = engine.closure(&state, doubler());
    let code = engine.bind_closure_as(&closure, "IntMap").unwrap();
    let f: IntMap = unsafe { std::mem::transmute::<*mut std::ffi::c_void, IntMap>(code) };
    drop(closure);

    assert_eq!(f(21), 0);
    let errors = engine.take_callback_errors();
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], CallError::StaleClosure { closure } if closure == "double"));
    assert_eq!(errors[0].message_id(), "callgate.stale_closure");
}

#[test]
fn test_float_callback() {
    let engine = engine();
    let state = ScriptState::new();
    let halve = Function::new("halve", |_, args| Ok(vec![Value::Number(args[0].as_number().unwrap_or(0.0) / 2.0)]));
    let closure = engine.closure(&state, halve);
    let code = engine.bind_closure_as(&closure, "Scale").unwrap();
    let f: extern "C" fn(f64) -> f64 = unsafe { std::mem::transmute(code) };
    assert_eq!(f(5.0), 2.5);
}
