//! Engine - the service object tying registries, pool and caches together
//!
//! Design: every process-wide table of the call path (modules, proxies,
//! closures, the frame pool, the interface cache) lives in one
//! `EngineInner` behind an `Rc`. `Engine` is a cheap handle to it; the
//! trampolines and proxies hold weak references so an engine can be torn
//! down while script values still exist.
//!
//! Lifecycle: `Engine::new` initializes everything, `Engine::shutdown`
//! invalidates live proxies, frees retired trampolines and drains the pool.

use crate::closure::{Closure, ClosureRegistry};
use crate::config::EngineConfig;
use crate::convert::{converter, FieldContext};
use crate::error::{ArgumentWarning, CallError};
use crate::interop::{demarshal, marshal, AbiType, CallPool, FrameGuard, InterfaceCache, InteropStats, PoolStats};
use crate::logging;
use crate::objects::{ObjectTypeHandler, Proxy, ProxyFlags, ProxyRegistry};
use crate::script::{Function, ScriptError, ScriptState, Value};
use crate::types::{ArgType, FunctionDescriptor, Genus, Module, ModuleId, ModuleRegistry, TypeRef};
use core::ffi::c_void;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, debug_span, info};

/// Bound on parent-chain walks during field lookup
const MAX_FIELD_DEPTH: usize = 64;

pub(crate) struct EngineInner {
    config: EngineConfig,
    modules: ModuleRegistry,
    pool: CallPool,
    interfaces: InterfaceCache,
    proxies: Rc<ProxyRegistry>,
    closures: Rc<ClosureRegistry>,
    functions: RefCell<HashMap<String, Rc<FunctionDescriptor>>>,
    /// Sequence-numbered, oldest first; capped at `closures.retired_limit`
    callback_errors: RefCell<VecDeque<(u64, CallError)>>,
    /// Errors ever queued, including ones dropped by the cap
    errors_queued: Cell<u64>,
    stats: Cell<InteropStats>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.proxies.shutdown();
    }
}

/// Handle to one foreign-call engine
///
/// Confined to the thread that created it.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        info!(
            target: "engine",
            event = "engine_init",
            pool_limit = config.calls.pool_limit,
            interface_cache = config.calls.interface_cache_size,
            "Engine initialized"
        );
        Self {
            inner: Rc::new(EngineInner {
                modules: ModuleRegistry::new(),
                pool: CallPool::new(config.calls.pool_limit),
                interfaces: InterfaceCache::new(config.calls.interface_cache_size),
                proxies: ProxyRegistry::new(config.objects.clone()),
                closures: Rc::new(ClosureRegistry::new(config.closures.retired_limit)),
                functions: RefCell::new(HashMap::new()),
                callback_errors: RefCell::new(VecDeque::new()),
                errors_queued: Cell::new(0),
                stats: Cell::new(InteropStats::default()),
                config,
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    pub(crate) fn from_inner(inner: Rc<EngineInner>) -> Self {
        Self { inner }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    #[inline]
    pub fn modules(&self) -> &ModuleRegistry {
        &self.inner.modules
    }

    #[inline]
    pub fn pool(&self) -> &CallPool {
        &self.inner.pool
    }

    #[inline]
    pub fn interfaces(&self) -> &InterfaceCache {
        &self.inner.interfaces
    }

    #[inline]
    pub fn proxies(&self) -> &Rc<ProxyRegistry> {
        &self.inner.proxies
    }

    #[inline]
    pub fn closures(&self) -> &Rc<ClosureRegistry> {
        &self.inner.closures
    }

    pub fn register_module(&self, module: Module) -> Result<ModuleId, CallError> {
        self.inner.modules.register(module)
    }

    pub fn declare_lazy_module<F>(&self, name: &str, loader: F)
    where
        F: FnOnce() -> Result<Module, CallError> + 'static,
    {
        self.inner.modules.declare_lazy(name, loader);
    }

    /// Add a memory policy; returns its id
    pub fn register_handler(&self, handler: Rc<dyn ObjectTypeHandler>) -> usize {
        self.inner.proxies.register_handler(handler)
    }

    /// Function descriptor by name, cached after the first lookup
    pub fn function(&self, name: &str) -> Result<Rc<FunctionDescriptor>, CallError> {
        if let Some(found) = self.inner.functions.borrow().get(name) {
            return Ok(found.clone());
        }
        let found = Rc::new(self.inner.modules.find_function(name)?);
        self.inner.functions.borrow_mut().insert(name.to_string(), found.clone());
        Ok(found)
    }

    /// Call `function` with the script values `state[base..]`
    ///
    /// On success the arguments are replaced by the results, starting at
    /// `base`, and the number of results is returned. On failure the stack
    /// is truncated to `base`.
    pub fn call(&self, state: &ScriptState, function: &FunctionDescriptor, base: usize) -> Result<usize, CallError> {
        let span = debug_span!(target: "ffi", "ffi_call", function = %function.name);
        let _enter = span.enter();

        let end = state.top();
        logging::log_ffi_call(&function.name, end.saturating_sub(base), self.config().calls.trace_calls);
        let outcome = self.call_frame(state, function, base, end);

        let mut stats = self.inner.stats.get();
        stats.calls += 1;
        self.inner.stats.set(stats);

        match &outcome {
            Ok(results) => logging::log_ffi_return(&function.name, *results),
            Err(err) => {
                logging::log_ffi_error(&function.name, &err.to_string());
                state.set_top(base);
            }
        }
        outcome
    }

    fn call_frame(&self, state: &ScriptState, function: &FunctionDescriptor, base: usize, end: usize) -> Result<usize, CallError> {
        let module = self.inner.modules.module(function.module)?;
        let mut frame = FrameGuard::new(&self.inner.pool);
        frame.state = Some(state.clone());
        frame.function = Some(Rc::from(function.name.as_str()));
        frame.trace = self.config().calls.trace_calls;

        if let Some(hook) = &module.hooks().pre_call {
            hook(function);
        }
        marshal(self, state, &mut frame, function, base, end)?;

        let interface = self.inner.interfaces.get_or_prepare(
            &function.name,
            frame.abi_types[0],
            &frame.abi_types[1..],
            frame.fixed_args,
        )?;
        let pending = self.inner.errors_queued.get();
        // SAFETY: the descriptor is the contract for the native signature;
        // every pointer in the frame stays alive until the guard drops.
        unsafe { interface.invoke(function.address, &mut frame) };

        if self.config().closures.propagate_errors {
            if let Some(err) = self.take_errors_since(pending).into_iter().next() {
                return Err(match err {
                    err @ CallError::Callback { .. } => err,
                    other => CallError::Callback {
                        function: function.name.clone(),
                        message: other.to_string(),
                    },
                });
            }
        }

        let results = demarshal(self, state, &mut frame, function)?;
        let values = state.take_from(end);
        state.set_top(base);
        for value in values {
            state.push(value);
        }
        Ok(results)
    }

    /// Call a function by name with explicit arguments
    pub fn invoke(&self, state: &ScriptState, name: &str, args: &[Value]) -> Result<Vec<Value>, CallError> {
        let function = self.function(name)?;
        let base = state.top();
        for arg in args {
            state.push(arg.clone());
        }
        self.call(state, &function, base)?;
        Ok(state.take_from(base))
    }

    /// `invoke` with errors raised the way script code sees them
    pub fn script_call(&self, state: &ScriptState, name: &str, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
        self.invoke(state, name, args)
            .map_err(|err| err.into_script_error(state.location()))
    }

    // Objects

    /// Allocate a zeroed structure owned by the script side
    pub fn new_struct(&self, type_name: &str) -> Result<Proxy, CallError> {
        let ty = self.inner.modules.find_type(type_name)?;
        let size = ty
            .layout()
            .map(|l| l.size)
            .ok_or_else(|| CallError::configuration(type_name, "not a structure type"))?;
        let ptr = match &ty.module().hooks().allocate {
            Some(allocate) => allocate(ty.descriptor(), size),
            // SAFETY: plain zeroed allocation, released by the malloc policy.
            None => unsafe { libc::calloc(1, size.max(1)) },
        };
        if ptr.is_null() {
            return Err(CallError::configuration(type_name, "allocation failed"));
        }
        self.proxy_for(ptr, &ty, ProxyFlags::OWNED)?
            .ok_or_else(|| CallError::configuration(type_name, "allocation produced no proxy"))
    }

    /// Allocate a zeroed array of `count` elements
    pub fn new_array(&self, element_type: &str, count: usize) -> Result<Proxy, CallError> {
        let ty = self.inner.modules.find_type(element_type)?;
        let size = element_size(&ty)
            .ok_or_else(|| CallError::configuration(element_type, "element type has no size"))?;
        // SAFETY: plain zeroed allocation, released by the array policy.
        let ptr = unsafe { libc::calloc(count.max(1), size) };
        if ptr.is_null() {
            return Err(CallError::configuration(element_type, "allocation failed"));
        }
        self.inner
            .proxies
            .adopt_array(&self.inner.modules, ptr, &ty, count)
            .ok_or_else(|| CallError::configuration(element_type, "allocation produced no proxy"))
    }

    fn element_at(&self, array: &Proxy, index: usize) -> Result<(ArgType, *mut u8), CallError> {
        let ptr = self.proxy_pointer(array)?;
        let ty_name = array.type_name().map(|n| n.to_string()).unwrap_or_default();
        if !array.flags().contains(ProxyFlags::ARRAY) {
            return Err(CallError::configuration(ty_name, "object is not an array"));
        }
        if index >= array.array_size() {
            return Err(CallError::configuration(
                ty_name,
                format!("index {index} out of bounds for length {}", array.array_size()),
            ));
        }
        let type_ref = array
            .type_ref()
            .ok_or_else(|| CallError::DeletedObject { ty: ty_name.clone() })?;
        let ty = self.inner.modules.arg_type(type_ref)?;
        let size = element_size(&ty).ok_or_else(|| CallError::configuration(ty_name, "element type has no size"))?;
        // SAFETY: index is within the allocated element count.
        Ok((ty, unsafe { (ptr as *mut u8).add(index * size) }))
    }

    pub fn get_element(&self, array: &Proxy, index: usize) -> Result<Value, CallError> {
        let (ty, addr) = self.element_at(array, index)?;
        let id = ty
            .info()
            .field_get
            .ok_or_else(|| CallError::configuration(ty.name().to_string(), "elements cannot be read"))?;
        converter(id).field_get(&FieldContext::at(self, &ty, ty.name(), addr).within(array))
    }

    pub fn set_element(&self, array: &Proxy, index: usize, value: &Value) -> Result<(), CallError> {
        let (ty, addr) = self.element_at(array, index)?;
        let id = ty
            .info()
            .field_set
            .ok_or_else(|| CallError::configuration(ty.name().to_string(), "elements are read-only"))?;
        converter(id).field_set(&FieldContext::at(self, &ty, ty.name(), addr).within(array), value)
    }

    /// Field type and bit placement, searching parent structures too
    fn locate_field(&self, object: &Proxy, field: &str) -> Result<(ArgType, u32, u32), CallError> {
        let ty_name = || object.type_name().map(|n| n.to_string()).unwrap_or_default();
        let mut current = object
            .type_ref()
            .ok_or_else(|| CallError::DeletedObject { ty: ty_name() })?;
        for _ in 0..MAX_FIELD_DEPTH {
            let module = self.inner.modules.module(current.module)?;
            let Genus::Struct { layout } = module.type_at(current.index)?.genus else {
                break;
            };
            let Some(layout) = module.layout(layout) else {
                break;
            };
            if let Some(found) = module.fields(layout).iter().find(|f| f.name == field) {
                let ty = self.inner.modules.arg_type(TypeRef::new(module.id(), found.type_index))?;
                return Ok((ty, found.bit_offset, found.bit_length));
            }
            match &layout.parent {
                Some(parent) => current = self.inner.modules.find_type(parent)?.type_ref,
                None => break,
            }
        }
        Err(CallError::UnknownField {
            ty: ty_name(),
            field: field.to_string(),
        })
    }

    pub fn get_field(&self, object: &Proxy, field: &str) -> Result<Value, CallError> {
        let base = self.proxy_pointer(object)? as *mut u8;
        let (ty, bit_offset, bit_length) = self.locate_field(object, field)?;
        let id = ty
            .info()
            .field_get
            .ok_or_else(|| CallError::configuration(field, format!("fields of type '{}' cannot be read", ty.name())))?;
        let ctx = FieldContext {
            engine: self,
            ty: &ty,
            name: field,
            base,
            bit_offset,
            bit_length,
            owner: Some(object),
        };
        converter(id).field_get(&ctx)
    }

    pub fn set_field(&self, object: &Proxy, field: &str, value: &Value) -> Result<(), CallError> {
        let base = self.proxy_pointer(object)? as *mut u8;
        let (ty, bit_offset, bit_length) = self.locate_field(object, field)?;
        let id = ty
            .info()
            .field_set
            .ok_or_else(|| CallError::configuration(field, format!("fields of type '{}' are read-only", ty.name())))?;
        let ctx = FieldContext {
            engine: self,
            ty: &ty,
            name: field,
            base,
            bit_offset,
            bit_length,
            owner: Some(object),
        };
        converter(id).field_set(&ctx, value)
    }

    /// The native object behind `object` was freed elsewhere
    pub fn invalidate(&self, object: &Proxy) {
        self.inner.proxies.invalidate(object);
    }

    pub fn refcount(&self, object: &Proxy) -> Option<u32> {
        self.inner.proxies.refcount(object)
    }

    /// Registered native addresses
    pub fn proxy_count(&self) -> usize {
        self.inner.proxies.registered()
    }

    pub fn proxy_pointer(&self, proxy: &Proxy) -> Result<*mut c_void, CallError> {
        proxy.pointer().ok_or_else(|| CallError::DeletedObject {
            ty: proxy.type_name().map(|n| n.to_string()).unwrap_or_default(),
        })
    }

    pub fn proxy_type(&self, proxy: &Proxy) -> Option<TypeRef> {
        proxy.type_ref()
    }

    /// Proxy for a native pointer viewed as `ty`
    pub fn proxy_for(&self, ptr: *mut c_void, ty: &ArgType, flags: ProxyFlags) -> Result<Option<Proxy>, CallError> {
        self.inner.proxies.get_or_create(&self.inner.modules, ptr, ty, flags)
    }

    /// Proxy for memory inside `parent`, keeping the parent alive
    pub fn proxy_within(&self, ptr: *mut c_void, ty: &ArgType, parent: &Proxy) -> Result<Option<Proxy>, CallError> {
        self.inner.proxies.get_or_create_within(&self.inner.modules, ptr, ty, parent)
    }

    // Closures

    /// Unbound closure over a script function
    pub fn closure(&self, state: &ScriptState, function: Function) -> Closure {
        Closure::new(
            function,
            state,
            Rc::downgrade(&self.inner),
            Rc::downgrade(&self.inner.closures),
        )
    }

    /// Native entry point of `closure` for the function type `ty`
    pub fn bind_closure(&self, closure: &Closure, ty: &ArgType) -> Result<*mut c_void, CallError> {
        closure.bind(self, ty)
    }

    /// Bind by callback type name
    pub fn bind_closure_as(&self, closure: &Closure, type_name: &str) -> Result<*mut c_void, CallError> {
        let ty = self.inner.modules.find_type(type_name)?;
        closure.bind(self, &ty)
    }

    pub fn closure_at(&self, code: *mut c_void) -> Option<Closure> {
        self.inner.closures.lookup(code)
    }

    // Diagnostics

    pub fn warn(&self, warning: ArgumentWarning) {
        logging::log_argument_warning(&warning);
        let mut stats = self.inner.stats.get();
        stats.warnings += 1;
        self.inner.stats.set(stats);
    }

    pub(crate) fn note_callback(&self) {
        let mut stats = self.inner.stats.get();
        stats.callbacks += 1;
        self.inner.stats.set(stats);
    }

    pub(crate) fn note_stale(&self, closure: &str) {
        let mut stats = self.inner.stats.get();
        stats.stale_invocations += 1;
        self.inner.stats.set(stats);
        self.queue_callback_error(CallError::StaleClosure {
            closure: closure.to_string(),
        });
    }

    pub(crate) fn record_callback_error(&self, error: CallError) {
        let mut stats = self.inner.stats.get();
        stats.callback_errors += 1;
        self.inner.stats.set(stats);
        self.queue_callback_error(error);
    }

    /// Append to the error queue, dropping the oldest entry when full
    fn queue_callback_error(&self, error: CallError) {
        let limit = self.config().closures.retired_limit.max(1);
        let mut errors = self.inner.callback_errors.borrow_mut();
        while errors.len() >= limit {
            if let Some((_, dropped)) = errors.pop_front() {
                debug!(target: "closure", event = "callback_error_dropped", error = %dropped);
            }
        }
        let seq = self.inner.errors_queued.get();
        errors.push_back((seq, error));
        self.inner.errors_queued.set(seq + 1);
    }

    /// Errors queued since `mark` that are still held
    fn take_errors_since(&self, mark: u64) -> Vec<CallError> {
        let mut errors = self.inner.callback_errors.borrow_mut();
        let start = errors.partition_point(|(seq, _)| *seq < mark);
        errors.drain(start..).map(|(_, error)| error).collect()
    }

    /// Drain errors raised inside callbacks and not yet re-raised
    pub fn take_callback_errors(&self) -> Vec<CallError> {
        self.inner.callback_errors.borrow_mut().drain(..).map(|(_, error)| error).collect()
    }

    pub fn stats(&self) -> InteropStats {
        self.inner.stats.get()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// Release every engine-held native resource
    pub fn shutdown(&self) {
        let proxies = self.inner.proxies.shutdown();
        let trampolines = self.inner.closures.clear_retired();
        let frames = self.inner.pool.drain();
        self.inner.interfaces.clear();
        self.inner.functions.borrow_mut().clear();
        info!(
            target: "engine",
            event = "engine_shutdown",
            proxies = proxies,
            trampolines = trampolines,
            frames = frames,
            "Engine shut down"
        );
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("modules", &self.inner.modules.modules().len())
            .field("proxies", &self.inner.proxies.registered())
            .field("stats", &self.inner.stats.get())
            .finish()
    }
}

/// Bytes per element for arrays of `ty`
fn element_size(ty: &ArgType) -> Option<usize> {
    if let Some(layout) = ty.layout() {
        return Some(layout.size);
    }
    match ty.abi() {
        Some(AbiType::Void) | None => None,
        Some(abi) => Some(abi.size()),
    }
}
