//! Closures - native-callable trampolines bound to script functions
//!
//! Design: a closure starts unbound and holds only its script function.
//! The first native use fixes its signature: a libffi closure is allocated
//! against a prepared call interface and stays bound to that function type
//! for the rest of its life. Finalization zeroes the trampoline's magic
//! marker and parks it in a bounded graveyard, so a stray native call after
//! finalization is detected instead of touching freed state.
//!
//! Architecture:
//! - `mod.rs` - closure handles, binding, the live/retired registry
//! - `trampoline.rs` - the native entry point and its conversion loop

mod trampoline;

use crate::engine::{Engine, EngineInner};
use crate::error::CallError;
use crate::interop::{AbiType, AuxBlock, CallInterface};
use crate::logging;
use crate::script::{Function, ScriptState, WeakState};
use crate::types::{ArgType, Genus, SignatureCursor, TypeRef};
use core::ffi::c_void;
use libffi::low::{self, ffi_closure, CodePtr};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use trampoline::{TrampolineData, TRAMPOLINE_MAGIC};
use tracing::debug;

/// Lifecycle of a live closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureState {
    Unbound,
    Bound,
}

/// Script function callable from native code
#[derive(Clone)]
pub struct Closure(Rc<ClosureCell>);

pub(crate) struct ClosureCell {
    function: Function,
    state: WeakState,
    engine: Weak<EngineInner>,
    registry: Weak<ClosureRegistry>,
    binding: RefCell<Option<Binding>>,
    // Return-value temporaries of the previous invocation.
    retained: RefCell<Vec<AuxBlock>>,
}

/// Native half of a bound closure
struct Binding {
    type_ref: TypeRef,
    type_name: String,
    raw: *mut ffi_closure,
    code: CodePtr,
    data: Box<TrampolineData>,
    // Referenced by the libffi closure.
    _interface: Rc<CallInterface>,
}

impl Binding {
    fn code_pointer(&self) -> *mut c_void {
        self.code.as_mut_ptr()
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        // SAFETY: `raw` came from `closure_alloc` and is freed exactly once.
        unsafe { low::closure_free(self.raw) };
    }
}

impl Closure {
    pub(crate) fn new(function: Function, state: &ScriptState, engine: Weak<EngineInner>, registry: Weak<ClosureRegistry>) -> Self {
        Self(Rc::new(ClosureCell {
            function,
            state: state.downgrade(),
            engine,
            registry,
            binding: RefCell::new(None),
            retained: RefCell::new(Vec::new()),
        }))
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn function(&self) -> &Function {
        &self.0.function
    }

    pub fn state(&self) -> ClosureState {
        if self.0.binding.borrow().is_some() {
            ClosureState::Bound
        } else {
            ClosureState::Unbound
        }
    }

    /// Native entry point, once bound
    pub fn code_pointer(&self) -> Option<*mut c_void> {
        self.0.binding.borrow().as_ref().map(Binding::code_pointer)
    }

    /// Name of the function type this closure is bound to
    pub fn bound_type(&self) -> Option<String> {
        self.0.binding.borrow().as_ref().map(|b| b.type_name.clone())
    }

    pub(crate) fn cell(&self) -> &Rc<ClosureCell> {
        &self.0
    }

    /// Bind to the function type `ty`, or check an existing binding
    pub(crate) fn bind(&self, engine: &Engine, ty: &ArgType) -> Result<*mut c_void, CallError> {
        if let Some(binding) = self.0.binding.borrow().as_ref() {
            if binding.type_ref.same_type(&ty.type_ref) {
                return Ok(binding.code_pointer());
            }
            return Err(CallError::SignatureMismatch {
                closure: self.0.function.name().to_string(),
                bound: binding.type_name.clone(),
                requested: ty.name().to_string(),
            });
        }

        let name: Rc<str> = Rc::from(self.0.function.name());
        let Genus::Function { signature } = &ty.descriptor().genus else {
            return Err(CallError::configuration(
                name.to_string(),
                format!("'{}' is not a function type", ty.name()),
            ));
        };
        let mut cursor = SignatureCursor::new(ty.type_ref.module, signature)?;
        let modules = engine.modules();

        let (ret_ref, ret_flags) = cursor
            .decode_next()?
            .ok_or_else(|| CallError::configuration(ty.name().to_string(), "callback signature has no return entry"))?;
        let ret = modules.arg_type(ret_ref)?;
        let ret_abi = callback_abi(ty, &ret, 0)?;

        let mut params = Vec::new();
        let mut abis = Vec::new();
        while let Some((param_ref, flags)) = cursor.decode_next()? {
            let param = modules.arg_type(param_ref)?;
            let abi = callback_abi(ty, &param, cursor.entry() - 1)?;
            abis.push(abi);
            params.push((param, flags, abi));
        }

        let interface = engine.interfaces().get_or_prepare(ty.name(), ret_abi, &abis, None)?;
        let data = Box::new(TrampolineData {
            magic: Cell::new(TRAMPOLINE_MAGIC),
            cell: Rc::downgrade(&self.0),
            engine: self.0.engine.clone(),
            name,
            ret: (ret, ret_flags, ret_abi),
            params,
        });

        let (raw, code) = low::closure_alloc();
        if raw.is_null() {
            return Err(CallError::Prepare {
                function: ty.name().to_string(),
                detail: "closure allocation failed".to_string(),
            });
        }
        let userdata = &*data as *const TrampolineData as *mut TrampolineData;
        // SAFETY: the interface and the trampoline data are owned by the
        // binding, which frees the closure before releasing either.
        let prepared = unsafe { low::prep_closure_mut(raw, interface.cif_ptr(), trampoline::entry, userdata, code) };
        if let Err(err) = prepared {
            // SAFETY: allocated above and not yet shared.
            unsafe { low::closure_free(raw) };
            return Err(CallError::Prepare {
                function: ty.name().to_string(),
                detail: format!("{err:?}"),
            });
        }

        let binding = Binding {
            type_ref: ty.type_ref,
            type_name: ty.name().to_string(),
            raw,
            code,
            data,
            _interface: interface,
        };
        let address = binding.code_pointer();
        *self.0.binding.borrow_mut() = Some(binding);
        if let Some(registry) = self.0.registry.upgrade() {
            registry.track(address, &self.0);
        }
        logging::log_closure_bound(self.0.function.name(), ty.name());
        Ok(address)
    }
}

fn callback_abi(callback: &ArgType, ty: &ArgType, index: usize) -> Result<AbiType, CallError> {
    ty.abi().ok_or_else(|| CallError::NoAbiMapping {
        function: callback.name().to_string(),
        ty: ty.name().to_string(),
        index,
    })
}

impl ClosureCell {
    fn keep_return_temporaries(&self, aux: Vec<AuxBlock>) {
        let previous = std::mem::replace(&mut *self.retained.borrow_mut(), aux);
        drop(previous);
    }
}

impl Drop for ClosureCell {
    fn drop(&mut self) {
        let Some(binding) = self.binding.get_mut().take() else {
            return;
        };
        binding.data.magic.set(0);
        match self.registry.upgrade() {
            Some(registry) => registry.retire(binding),
            None => drop(binding),
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bound_type() {
            Some(ty) => write!(f, "Closure({} as {ty})", self.0.function.name()),
            None => write!(f, "Closure({}, unbound)", self.0.function.name()),
        }
    }
}

/// Bound closures by code address, plus the retired trampolines
pub struct ClosureRegistry {
    live: RefCell<HashMap<usize, Weak<ClosureCell>>>,
    retired: RefCell<VecDeque<Binding>>,
    limit: usize,
}

impl ClosureRegistry {
    pub fn new(retired_limit: usize) -> Self {
        Self {
            live: RefCell::new(HashMap::new()),
            retired: RefCell::new(VecDeque::new()),
            limit: retired_limit,
        }
    }

    fn track(&self, address: *mut c_void, cell: &Rc<ClosureCell>) {
        self.live.borrow_mut().insert(address as usize, Rc::downgrade(cell));
    }

    /// Live closure whose trampoline starts at `address`
    pub fn lookup(&self, address: *mut c_void) -> Option<Closure> {
        let live = self.live.borrow();
        live.get(&(address as usize))?.upgrade().map(Closure)
    }

    fn retire(&self, binding: Binding) {
        self.live.borrow_mut().remove(&(binding.code_pointer() as usize));
        debug!(target: "closure", event = "closure_retired", ty = %binding.type_name, "Trampoline retired");
        let evicted: Vec<Binding> = {
            let mut retired = self.retired.borrow_mut();
            retired.push_back(binding);
            let excess = retired.len().saturating_sub(self.limit);
            retired.drain(..excess).collect()
        };
        drop(evicted);
    }

    pub fn live_count(&self) -> usize {
        self.live.borrow().len()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.borrow().len()
    }

    /// Free every retired trampoline; returns how many were freed
    pub fn clear_retired(&self) -> usize {
        let retired = std::mem::take(&mut *self.retired.borrow_mut());
        retired.len()
    }
}
