//! Script engine surface - values, the value stack, protected calls
//!
//! Design: a minimal stand-in for the host scripting engine. Values are
//! reference counted; dropping the last handle to a proxy or closure is
//! the engine's finalization event.

mod state;
mod value;

pub use state::{ScriptState, WeakState};
pub use value::{Function, Table, Value};

use std::fmt;

/// Source position of the script statement that initiated a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub chunk: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(chunk: impl Into<String>, line: u32) -> Self {
        Self {
            chunk: chunk.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk, self.line)
    }
}

/// Error raised to script code
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub message: String,
    /// Translatable id, present when the error originated in the engine
    pub message_id: Option<&'static str>,
    pub location: Option<SourceLocation>,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            message_id: None,
            location: None,
        }
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{}: {}", loc, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ScriptError {}
