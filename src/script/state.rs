//! Script execution state: the value stack shared with conversions

use super::{Function, ScriptError, SourceLocation, Value};
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

/// Handle to one script thread's value stack
///
/// Cloning shares the same stack. The state is deliberately `!Send`; the
/// whole engine runs on the thread that owns the script state.
#[derive(Clone)]
pub struct ScriptState {
    inner: Rc<StateInner>,
}

struct StateInner {
    stack: RefCell<Vec<Value>>,
    location: RefCell<Option<SourceLocation>>,
    depth: Cell<usize>,
}

/// Non-owning reference, held by closures to avoid cycles through the stack
#[derive(Clone)]
pub struct WeakState(Weak<StateInner>);

impl WeakState {
    pub fn upgrade(&self) -> Option<ScriptState> {
        self.0.upgrade().map(|inner| ScriptState { inner })
    }
}

impl Default for ScriptState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptState {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(StateInner {
                stack: RefCell::new(Vec::with_capacity(32)),
                location: RefCell::new(None),
                depth: Cell::new(0),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakState {
        WeakState(Rc::downgrade(&self.inner))
    }

    /// Number of values on the stack
    #[inline]
    pub fn top(&self) -> usize {
        self.inner.stack.borrow().len()
    }

    /// Truncate or nil-pad the stack to `top` values
    pub fn set_top(&self, top: usize) {
        let tail = {
            let mut stack = self.inner.stack.borrow_mut();
            if top >= stack.len() {
                stack.resize(top, Value::Nil);
                return;
            }
            stack.split_off(top)
        };
        // Finalizers may run here; the stack borrow is already released.
        drop(tail);
    }

    #[inline]
    pub fn push(&self, value: Value) {
        self.inner.stack.borrow_mut().push(value);
    }

    pub fn pop(&self) -> Option<Value> {
        let value = self.inner.stack.borrow_mut().pop();
        value
    }

    /// Value at an absolute stack index
    pub fn get(&self, index: usize) -> Option<Value> {
        self.inner.stack.borrow().get(index).cloned()
    }

    /// Copy of every value from `base` to the top
    pub fn values_from(&self, base: usize) -> Vec<Value> {
        let stack = self.inner.stack.borrow();
        stack.get(base..).map(<[Value]>::to_vec).unwrap_or_default()
    }

    /// Remove and return every value from `base` to the top
    pub fn take_from(&self, base: usize) -> Vec<Value> {
        let mut stack = self.inner.stack.borrow_mut();
        if base >= stack.len() {
            return Vec::new();
        }
        stack.split_off(base)
    }

    /// Record the source location of the statement currently executing
    pub fn set_location(&self, location: Option<SourceLocation>) {
        *self.inner.location.borrow_mut() = location;
    }

    pub fn location(&self) -> Option<SourceLocation> {
        self.inner.location.borrow().clone()
    }

    /// Current nesting depth of script calls made through this state
    pub fn depth(&self) -> usize {
        self.inner.depth.get()
    }

    /// Unprotected call; errors propagate to the caller
    pub fn call(&self, function: &Function, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
        self.inner.depth.set(self.inner.depth.get() + 1);
        let result = function.invoke(self, args);
        self.inner.depth.set(self.inner.depth.get() - 1);
        result
    }

    /// Protected call: panics inside the function become script errors
    pub fn pcall(&self, function: &Function, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
        let depth = self.inner.depth.get();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.call(function, args)));
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                self.inner.depth.set(depth);
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic in script function".to_string());
                Err(ScriptError::new(format!("{}: {}", function.name(), message)))
            }
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}
