//! Call path benchmarks
//!
//! Measures a full marshal/invoke/demarshal round trip for scalar, output
//! and string signatures, plus a native-to-script callback.

use callgate::{Engine, Function, Fundamental, ModuleBuilder, ScriptState, Value};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn divmod(a: i32, b: i32, remainder: *mut i32) -> i32 {
    // SAFETY: the engine always provides an output cell for nil.
    unsafe { *remainder = a % b };
    a / b
}

extern "C" fn apply(f: extern "C" fn(i32) -> i32, x: i32) -> i32 {
    f(x)
}

fn setup() -> Engine {
    let engine = Engine::with_defaults();
    let mut b = ModuleBuilder::new("bench");
    let ch = b.fundamental("char", Fundamental::Char);
    let int = b.fundamental("int", Fundamental::Int);
    let size = b.fundamental("size_t", Fundamental::SizeT);
    let int_ptr = b.pointer(int);
    let string = b.pointer(ch);
    let int_map = b.callback("IntMap", int, &[int.into()]);
    b.native("add", add as usize, int, &[int.into(), int.into()]);
    b.native("divmod", divmod as usize, int, &[int.into(), int.into(), int_ptr.into()]);
    b.native("strlen", libc::strlen as usize, size, &[string.into()]);
    b.native("apply", apply as usize, int, &[int_map.into(), int.into()]);
    if let Err(err) = b.build().and_then(|m| engine.register_module(m)) {
        panic!("bench module: {err}");
    }
    engine
}

fn bench_scalar_calls(c: &mut Criterion) {
    let engine = setup();
    let state = ScriptState::new();
    let mut group = c.benchmark_group("scalar");

    group.bench_function("add", |b| {
        b.iter(|| engine.invoke(&state, "add", black_box(&[Value::Integer(3), Value::Integer(4)])))
    });
    group.bench_function("divmod_output", |b| {
        b.iter(|| engine.invoke(&state, "divmod", black_box(&[Value::Integer(17), Value::Integer(5), Value::Nil])))
    });
    group.finish();
}

fn bench_strings(c: &mut Criterion) {
    let engine = setup();
    let state = ScriptState::new();
    let mut group = c.benchmark_group("strlen");

    for len in [8usize, 256, 4096] {
        let text = Value::from("x".repeat(len));
        group.bench_with_input(BenchmarkId::from_parameter(len), &text, |b, text| {
            b.iter(|| engine.invoke(&state, "strlen", std::slice::from_ref(text)))
        });
    }
    group.finish();
}

fn bench_callback(c: &mut Criterion) {
    let engine = setup();
    let state = ScriptState::new();
    let doubler = Function::new("double", |_, args| {
        Ok(vec![Value::Integer(args[0].as_integer().unwrap_or(0) * 2)])
    });
    let closure = Value::Closure(engine.closure(&state, doubler));

    c.bench_function("callback_round_trip", |b| {
        b.iter(|| engine.invoke(&state, "apply", black_box(&[closure.clone(), Value::Integer(21)])))
    });
}

criterion_group!(benches, bench_scalar_calls, bench_strings, bench_callback);
criterion_main!(benches);
