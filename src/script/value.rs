//! Script values as seen by the conversion layer

use super::{ScriptError, ScriptState};
use crate::closure::Closure;
use crate::objects::Proxy;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// A dynamically typed script value
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(Rc<str>),
    Table(Table),
    Function(Function),
    Closure(Closure),
    Proxy(Proxy),
    /// Raw address with no identity or lifetime management
    LightPointer(usize),
}

impl Value {
    /// Script-level type name, used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Integer(_) => "integer",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Table(_) => "table",
            Self::Function(_) => "function",
            Self::Closure(_) => "closure",
            Self::Proxy(_) => "object",
            Self::LightPointer(_) => "lightpointer",
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Integer view; numbers qualify only when they have no fractional part
    pub fn as_integer(&self) -> Option<i64> {
        use num_traits::ToPrimitive;
        match self {
            Self::Integer(i) => Some(*i),
            Self::Number(n) if n.fract() == 0.0 => n.to_i64(),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&Proxy> {
        match self {
            Self::Proxy(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            Self::Closure(c) => Some(c),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Integer(a), Self::Number(b)) | (Self::Number(b), Self::Integer(a)) => {
                *a as f64 == *b
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Table(a), Self::Table(b)) => a.ptr_eq(b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Closure(a), Self::Closure(b)) => a.ptr_eq(b),
            (Self::Proxy(a), Self::Proxy(b)) => a.ptr_eq(b),
            (Self::LightPointer(a), Self::LightPointer(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Number(n) => write!(f, "{n:?}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Table(t) => write!(f, "table({} items)", t.len()),
            Self::Function(func) => write!(f, "function({})", func.name()),
            Self::Closure(c) => write!(f, "{c:?}"),
            Self::Proxy(p) => write!(f, "{p:?}"),
            Self::LightPointer(p) => write!(f, "lightpointer({p:#x})"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(Rc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(Rc::from(v))
    }
}

impl From<Table> for Value {
    fn from(v: Table) -> Self {
        Self::Table(v)
    }
}

/// Shared, mutable script table with an array part and string keys
#[derive(Clone, Default)]
pub struct Table(Rc<RefCell<TableData>>);

#[derive(Default)]
struct TableData {
    array: Vec<Value>,
    fields: HashMap<String, Value>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let table = Self::new();
        table.0.borrow_mut().array.extend(values);
        table
    }

    /// Length of the array part
    pub fn len(&self) -> usize {
        self.0.borrow().array.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Zero-based array read; absent entries read as nil
    pub fn get(&self, index: usize) -> Value {
        self.0.borrow().array.get(index).cloned().unwrap_or_default()
    }

    pub fn push(&self, value: Value) {
        self.0.borrow_mut().array.push(value);
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.borrow().array.clone()
    }

    pub fn field(&self, name: &str) -> Value {
        self.0.borrow().fields.get(name).cloned().unwrap_or_default()
    }

    pub fn set_field(&self, name: &str, value: Value) {
        let old = self.0.borrow_mut().fields.insert(name.to_string(), value);
        drop(old);
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

type FunctionBody = dyn Fn(&ScriptState, &[Value]) -> Result<Vec<Value>, ScriptError>;

/// A callable script function
#[derive(Clone)]
pub struct Function {
    name: Rc<str>,
    body: Rc<FunctionBody>,
}

impl Function {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(&ScriptState, &[Value]) -> Result<Vec<Value>, ScriptError> + 'static,
    {
        Self {
            name: Rc::from(name),
            body: Rc::new(body),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn invoke(&self, state: &ScriptState, args: &[Value]) -> Result<Vec<Value>, ScriptError> {
        (self.body)(state, args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({})", self.name)
    }
}
