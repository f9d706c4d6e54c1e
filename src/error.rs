//! Error taxonomy for foreign calls
//!
//! Design: every fatal condition is a `CallError` variant carrying the
//! function or type name it concerns, plus a stable message id that host
//! engines can translate. Argument warnings never abort a call; they are
//! logged and counted.

use crate::script::{ScriptError, SourceLocation};
use thiserror::Error;

/// Fatal errors raised while marshaling, invoking or demarshaling
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    /// Malformed or incompatible descriptor data
    #[error("configuration error in {context}: {detail}")]
    Configuration { context: String, detail: String },

    #[error("unresolved type '{name}' (needed by {context})")]
    UnresolvedType { name: String, context: String },

    #[error("{function}: return type '{ty}' has no reverse conversion")]
    UnhandledReturnType { function: String, ty: String },

    #[error("closure '{closure}' is bound to '{bound}', cannot rebind to '{requested}'")]
    SignatureMismatch {
        closure: String,
        bound: String,
        requested: String,
    },

    #[error("{function}: argument {index} of type '{ty}' has no native ABI mapping")]
    NoAbiMapping {
        function: String,
        ty: String,
        index: usize,
    },

    #[error("{function}: argument {index} of type '{ty}' has no forward conversion")]
    NoForwardConversion {
        function: String,
        ty: String,
        index: usize,
    },

    #[error("{function}: argument {index} expected {expected}, got {got}")]
    ArgumentType {
        function: String,
        index: usize,
        expected: String,
        got: &'static str,
    },

    #[error("{function}: failed to prepare call interface: {detail}")]
    Prepare { function: String, detail: String },

    #[error("attempt to use deleted object of type '{ty}'")]
    DeletedObject { ty: String },

    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },

    #[error("{function}: symbol not found in module '{module}'")]
    UnknownSymbol { function: String, module: String },

    #[error("unknown type '{name}'")]
    UnknownType { name: String },

    #[error("type '{ty}' has no field '{field}'")]
    UnknownField { ty: String, field: String },

    #[error("callback '{function}' failed: {message}")]
    Callback { function: String, message: String },

    #[error("native code invoked finalized closure '{closure}'")]
    StaleClosure { closure: String },

    #[error("{0}")]
    Script(String),
}

impl CallError {
    /// Module-qualified message id for translation tables
    pub fn message_id(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "callgate.configuration",
            Self::UnresolvedType { .. } => "callgate.unresolved_type",
            Self::UnhandledReturnType { .. } => "callgate.unhandled_return_type",
            Self::SignatureMismatch { .. } => "callgate.signature_mismatch",
            Self::NoAbiMapping { .. } => "callgate.no_abi_mapping",
            Self::NoForwardConversion { .. } => "callgate.no_forward_conversion",
            Self::ArgumentType { .. } => "callgate.argument_type",
            Self::Prepare { .. } => "callgate.prepare",
            Self::DeletedObject { .. } => "callgate.deleted_object",
            Self::UnknownFunction { .. } => "callgate.unknown_function",
            Self::UnknownSymbol { .. } => "callgate.unknown_symbol",
            Self::UnknownType { .. } => "callgate.unknown_type",
            Self::UnknownField { .. } => "callgate.unknown_field",
            Self::Callback { .. } => "callgate.callback",
            Self::StaleClosure { .. } => "callgate.stale_closure",
            Self::Script(_) => "callgate.script",
        }
    }

    pub(crate) fn configuration(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Configuration {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Convert into a script-visible error, attaching the call site
    pub fn into_script_error(self, location: Option<SourceLocation>) -> ScriptError {
        ScriptError {
            message: self.to_string(),
            message_id: Some(self.message_id()),
            location,
        }
    }
}

impl From<ScriptError> for CallError {
    fn from(err: ScriptError) -> Self {
        Self::Script(err.to_string())
    }
}

/// Non-fatal argument problems; the call proceeds with a substitute
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArgumentWarning {
    #[error("{function}: argument {index} missing, substituting nil")]
    MissingArgument { function: String, index: usize },

    #[error("{function}: {count} extra argument(s) ignored")]
    ExtraArguments { function: String, count: usize },

    #[error("{function}: vararg value of type {got} not convertible, passing null")]
    UnhandledVararg { function: String, got: &'static str },

    #[error("{function}: conversion of argument {index} left {leaked} value(s) on the stack")]
    StackLeak {
        function: String,
        index: usize,
        leaked: isize,
    },
}
