//! callgate - descriptor-driven foreign calls for an embedded script engine
//!
//! Script code calls native functions described by compact type tables;
//! native code calls back into script functions through libffi closures;
//! native pointers surface as proxies with stable identity and a memory
//! policy chosen per object family.

// Core modules
pub mod script;
pub mod types;
pub mod convert;
pub mod interop;
pub mod closure;
pub mod objects;
pub mod engine;

// Ambient services
pub mod config;
pub mod error;
pub mod logging;

// Re-export commonly used items
pub use closure::{Closure, ClosureState};
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use error::{ArgumentWarning, CallError};
pub use interop::{AbiType, FfiValue, InteropStats, Library, PoolStats};
pub use objects::{ObjectTypeHandler, Proxy, ProxyFlags, RefCountedHandler};
pub use script::{Function, ScriptError, ScriptState, SourceLocation, Table, Value};
pub use types::{
    ArgFlags, ArgSpec, FieldSpec, FunctionDescriptor, FunctionFlags, Fundamental, Module, ModuleBuilder,
    ModuleHooks, TypeRef,
};

use tracing_appender::non_blocking::WorkerGuard;

/// Initialize logging from `CALLGATE_LOG_*`; keep the guard alive
pub fn init() -> Option<WorkerGuard> {
    logging::init()
}

/// Initialize logging from the `[logging]` section of an engine config
pub fn init_from(config: &EngineConfig) -> Option<WorkerGuard> {
    logging::init_with_config(logging::LogConfig::from(&config.logging))
}
