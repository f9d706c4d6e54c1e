//! Object identity, alias rings and memory policies seen from script code

use callgate::{
    ArgFlags, ArgSpec, CallError, Engine, FieldSpec, FunctionFlags, Fundamental, ModuleBuilder, RefCountedHandler,
    ScriptState, Value,
};
use std::cell::Cell;
use std::ffi::c_void;
use std::rc::Rc;

#[repr(C)]
struct Point {
    x: i32,
    y: i32,
}

#[repr(C)]
struct Node {
    refs: u32,
    value: i32,
}

#[repr(C)]
struct Rect {
    origin: Point,
    size: Point,
    flags: u32,
}

thread_local! {
    static SHARED: *mut Point = Box::into_raw(Box::new(Point { x: 1, y: 2 }));
    static LOANED: Cell<*mut Point> = const { Cell::new(std::ptr::null_mut()) };
}

extern "C" fn shared_point() -> *mut Point {
    SHARED.with(|p| *p)
}

extern "C" fn point_sum(p: *const Point) -> i32 {
    // SAFETY: the engine only passes live Point pointers here.
    unsafe { (*p).x + (*p).y }
}

/// Hands out the same malloc'd point until `give_point` transfers it
extern "C" fn lend_point() -> *mut Point {
    LOANED.with(|slot| {
        if slot.get().is_null() {
            // SAFETY: zeroed allocation, freed by whoever ends up owning it.
            slot.set(unsafe { libc::calloc(1, std::mem::size_of::<Point>()) } as *mut Point);
        }
        slot.get()
    })
}

extern "C" fn give_point() -> *mut Point {
    LOANED.with(|slot| slot.replace(std::ptr::null_mut()))
}

extern "C" fn node_retain(node: *mut Node) -> *mut Node {
    // SAFETY: see `point_sum`.
    unsafe { (*node).refs += 1 };
    node
}

extern "C" fn node_new(value: i32) -> *mut Node {
    Box::into_raw(Box::new(Node { refs: 1, value }))
}

extern "C" fn node_value(node: *const Node) -> i32 {
    // SAFETY: see `point_sum`.
    unsafe { (*node).value }
}

unsafe extern "C" fn node_ref(ptr: *mut c_void) {
    (*(ptr as *mut Node)).refs += 1;
}

unsafe extern "C" fn node_unref(ptr: *mut c_void) {
    let node = ptr as *mut Node;
    (*node).refs -= 1;
    if (*node).refs == 0 {
        drop(Box::from_raw(node));
    }
}

unsafe extern "C" fn node_refs(ptr: *mut c_void) -> u32 {
    (*(ptr as *mut Node)).refs
}

fn engine() -> Engine {
    let engine = Engine::with_defaults();
    let mut b = ModuleBuilder::new("shapes");
    let int = b.fundamental("int", Fundamental::Int);
    let uint = b.fundamental("unsigned int", Fundamental::UInt);
    let point = b.structure("Point", 8, &[FieldSpec::at("x", int, 0), FieldSpec::at("y", int, 4)]);
    b.structure(
        "Rect",
        20,
        &[
            FieldSpec::at("origin", point, 0),
            FieldSpec::at("size", point, 8),
            FieldSpec::at("flags", uint, 16),
            FieldSpec::bits("visible", uint, 16 * 8, 1),
            FieldSpec::bits("layer", int, 16 * 8 + 1, 3),
        ],
    );
    let node = b.structure("Node", 8, &[FieldSpec::at("refs", uint, 0), FieldSpec::at("value", int, 4)]);
    let point_ptr = b.pointer(point);
    let node_ptr = b.pointer(node);

    b.native("shared_point", shared_point as usize, point_ptr, &[]);
    b.native("point_sum", point_sum as usize, int, &[point_ptr.into()]);
    b.function("node_new", FunctionFlags::RETURNS_OWNED, node_ptr, &[int.into()]);
    b.symbol("node_new", node_new as usize);
    b.native("node_value", node_value as usize, int, &[node_ptr.into()]);
    b.native("node_peek", node_value as usize, int, &[ArgSpec::new(node_ptr, ArgFlags::CONST)]);
    b.function("node_retain", FunctionFlags::RETURNS_OWNED, node_ptr, &[node_ptr.into()]);
    b.symbol("node_retain", node_retain as usize);
    b.native("lend_point", lend_point as usize, point_ptr, &[]);
    b.function("give_point", FunctionFlags::RETURNS_OWNED, point_ptr, &[]);
    b.symbol("give_point", give_point as usize);
    engine.register_module(b.build().unwrap()).unwrap();

    let handler = RefCountedHandler::new("node", node_ref, node_unref)
        .root("Node")
        .with_refcount(node_refs);
    engine.register_handler(Rc::new(handler));
    engine
}

fn proxy(value: &Value) -> &callgate::Proxy {
    value.as_proxy().expect("proxy value")
}

#[test]
fn test_same_pointer_yields_same_proxy() {
    let engine = engine();
    let state = ScriptState::new();
    let a = engine.invoke(&state, "shared_point", &[]).unwrap().remove(0);
    let b = engine.invoke(&state, "shared_point", &[]).unwrap().remove(0);
    assert_eq!(a, b);
    assert!(!proxy(&b).is_new());
    assert_eq!(engine.proxy_count(), 1);

    let sum = engine.invoke(&state, "point_sum", &[a.clone()]).unwrap();
    assert_eq!(sum, vec![Value::Integer(3)]);

    drop((a, b));
    assert_eq!(engine.proxy_count(), 0);
}

#[test]
fn test_struct_fields_and_bitfields() {
    let engine = engine();
    let rect = engine.new_struct("Rect").unwrap();
    assert_eq!(proxy_handler(&rect), "malloc");

    engine.set_field(&rect, "flags", &Value::Integer(0)).unwrap();
    engine.set_field(&rect, "visible", &Value::Integer(1)).unwrap();
    engine.set_field(&rect, "layer", &Value::Integer(-2)).unwrap();
    assert_eq!(engine.get_field(&rect, "visible").unwrap(), Value::Integer(1));
    assert_eq!(engine.get_field(&rect, "layer").unwrap(), Value::Integer(-2));
    // visible = 1, layer = 0b110 shifted past it
    assert_eq!(engine.get_field(&rect, "flags").unwrap(), Value::Integer(0b1101));

    assert!(matches!(
        engine.get_field(&rect, "depth"),
        Err(CallError::UnknownField { .. })
    ));
}

fn proxy_handler(p: &callgate::Proxy) -> String {
    p.handler_name().unwrap_or_default()
}

#[test]
fn test_embedded_struct_aliases_parent_memory() {
    let engine = engine();
    let rect = engine.new_struct("Rect").unwrap();
    let origin = engine.get_field(&rect, "origin").unwrap();
    let origin = proxy(&origin).clone();
    assert!(!origin.ptr_eq(&rect));
    assert_eq!(origin.pointer(), rect.pointer());
    assert_eq!(engine.proxies().ring_size(rect.pointer().unwrap()), 2);

    // Same view of the same address resolves to the same alias.
    let again = engine.get_field(&rect, "origin").unwrap();
    assert!(proxy(&again).ptr_eq(&origin));

    engine.set_field(&origin, "x", &Value::Integer(9)).unwrap();
    let raw = rect.pointer().unwrap() as *const Rect;
    assert_eq!(unsafe { (*raw).origin.x }, 9);

    // The memory survives the owner while the alias lives.
    drop(rect);
    drop(again);
    assert_eq!(engine.get_field(&origin, "x").unwrap(), Value::Integer(9));
    assert_eq!(proxy_handler(&origin), "malloc");
    drop(origin);
    assert_eq!(engine.proxy_count(), 0);

    let size = engine.new_struct("Rect").unwrap();
    let inner = engine.get_field(&size, "size").unwrap();
    // Offset 8 is a different address: no ring.
    assert_eq!(engine.proxies().ring_size(size.pointer().unwrap()), 1);
    drop(inner);
}

#[test]
fn test_refcounted_family_and_owned_returns() {
    let engine = engine();
    let state = ScriptState::new();
    let node = engine.invoke(&state, "node_new", &[7.into()]).unwrap().remove(0);
    let node_proxy = proxy(&node).clone();
    assert_eq!(proxy_handler(&node_proxy), "node");
    // The constructor's reference was adopted, not duplicated.
    assert_eq!(engine.refcount(&node_proxy), Some(1));

    let value = engine.invoke(&state, "node_value", &[node.clone()]).unwrap();
    assert_eq!(value, vec![Value::Integer(7)]);
    let peek = engine.invoke(&state, "node_peek", &[node.clone()]).unwrap();
    assert_eq!(peek, vec![Value::Integer(7)]);

    // Type checks use the declared structure.
    assert!(matches!(
        engine.invoke(&state, "point_sum", &[node.clone()]),
        Err(CallError::ArgumentType { .. })
    ));
    drop((node, node_proxy));
    assert_eq!(engine.proxy_count(), 0);
}

#[test]
fn test_invalidated_object_cannot_be_passed() {
    let engine = engine();
    let state = ScriptState::new();
    let point = engine.invoke(&state, "shared_point", &[]).unwrap().remove(0);
    engine.invalidate(proxy(&point));
    assert!(proxy(&point).is_deleted());
    match engine.invoke(&state, "point_sum", &[point]) {
        Err(CallError::DeletedObject { ty }) => assert_eq!(ty, "Point"),
        other => panic!("expected deleted object, got {other:?}"),
    }
}

#[test]
fn test_element_arrays() {
    let engine = engine();
    let array = engine.new_array("int", 4).unwrap();
    assert_eq!(array.array_size(), 4);
    assert_eq!(proxy_handler(&array), "array");
    for i in 0..4 {
        engine.set_element(&array, i, &Value::Integer(i as i64 * 10)).unwrap();
    }
    assert_eq!(engine.get_element(&array, 3).unwrap(), Value::Integer(30));
    assert!(engine.get_element(&array, 4).is_err());

    let points = engine.new_array("Point", 2).unwrap();
    let second = engine.get_element(&points, 1).unwrap();
    engine.set_field(proxy(&second), "y", &Value::Integer(5)).unwrap();
    let raw = points.pointer().unwrap() as *const Point;
    assert_eq!(unsafe { (*raw.add(1)).y }, 5);
}

#[test]
fn test_shutdown_invalidates_live_proxies() {
    let engine = engine();
    let state = ScriptState::new();
    let node = engine.invoke(&state, "node_new", &[1.into()]).unwrap().remove(0);
    engine.shutdown();
    assert!(proxy(&node).is_deleted());
    assert_eq!(engine.proxy_count(), 0);
}

#[test]
fn test_interior_field_keeps_parent_memory_alive() {
    let engine = engine();
    let rect = engine.new_struct("Rect").unwrap();
    let size = engine.get_field(&rect, "size").unwrap();
    let size = proxy(&size).clone();
    assert_ne!(size.pointer(), rect.pointer());

    drop(rect);
    assert!(!size.is_deleted());
    // Parent and view are both still registered.
    assert_eq!(engine.proxy_count(), 2);
    engine.set_field(&size, "x", &Value::Integer(77)).unwrap();
    assert_eq!(engine.get_field(&size, "x").unwrap(), Value::Integer(77));

    drop(size);
    assert_eq!(engine.proxy_count(), 0);
}

#[test]
fn test_invalidated_parent_invalidates_interior_views() {
    let engine = engine();
    let state = ScriptState::new();
    let rect = engine.new_struct("Rect").unwrap();
    let size = engine.get_field(&rect, "size").unwrap();
    // The native side frees the object through its own API.
    let raw = rect.pointer().unwrap();
    engine.invalidate(&rect);
    unsafe { libc::free(raw) };

    assert!(proxy(&size).is_deleted());
    assert!(matches!(
        engine.get_field(proxy(&size), "x"),
        Err(CallError::DeletedObject { .. })
    ));
    assert!(matches!(
        engine.invoke(&state, "point_sum", &[size.clone()]),
        Err(CallError::DeletedObject { .. })
    ));
    assert_eq!(engine.proxy_count(), 0);
}

#[test]
fn test_array_element_keeps_array_alive() {
    let engine = engine();
    let points = engine.new_array("Point", 3).unwrap();
    let last = engine.get_element(&points, 2).unwrap();
    engine.set_field(proxy(&last), "x", &Value::Integer(4)).unwrap();
    drop(points);
    assert_eq!(engine.get_field(proxy(&last), "x").unwrap(), Value::Integer(4));
    drop(last);
    assert_eq!(engine.proxy_count(), 0);
}

#[test]
fn test_owned_return_takes_over_borrowed_proxy() {
    let engine = engine();
    let state = ScriptState::new();
    let borrowed = engine.invoke(&state, "lend_point", &[]).unwrap().remove(0);
    assert_eq!(proxy_handler(proxy(&borrowed)), "plain");

    let owned = engine.invoke(&state, "give_point", &[]).unwrap().remove(0);
    assert_eq!(owned, borrowed);
    assert_eq!(proxy_handler(proxy(&owned)), "malloc");
    assert!(proxy(&owned).flags().contains(callgate::ProxyFlags::OWNED));

    drop((borrowed, owned));
    assert_eq!(engine.proxy_count(), 0);
}

#[test]
fn test_owned_return_of_counted_object_drops_extra_reference() {
    let engine = engine();
    let state = ScriptState::new();
    let node = engine.invoke(&state, "node_new", &[3.into()]).unwrap().remove(0);
    let again = engine.invoke(&state, "node_retain", &[node.clone()]).unwrap().remove(0);
    assert_eq!(again, node);
    assert_eq!(proxy_handler(proxy(&again)), "node");
    assert_eq!(engine.refcount(proxy(&node)), Some(1));
    drop((node, again));
    assert_eq!(engine.proxy_count(), 0);
}
