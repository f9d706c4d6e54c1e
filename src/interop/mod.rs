//! Interoperability - marshal, invoke and demarshal foreign calls
//!
//! Design: one pooled `CallFrame` per call. The marshaler fills its slots
//! from the script stack, the invoker hands them to libffi, and the
//! demarshaler walks the same signature again to push the results.
//!
//! Architecture:
//! - `types.rs` - ABI tags and the `FfiValue` slot union
//! - `frame.rs` - call frames, the frame pool and its guard
//! - `marshal.rs` - script values to native slots
//! - `call.rs` - libffi call interfaces and their LRU cache
//! - `demarshal.rs` - return value and output arguments to script values
//! - `library.rs` - Dynamic library loading (dlopen/LoadLibrary)

mod call;
mod demarshal;
mod frame;
mod library;
mod marshal;
mod types;

pub use call::{CallInterface, CifKey, InterfaceCache};
pub use frame::{ArgRecord, CallFrame, CallPool, FrameGuard, PoolStats};
pub use library::{Library, LoadError, SymbolError};
pub use types::{AbiType, FfiValue};

pub(crate) use demarshal::demarshal;
pub(crate) use frame::AuxBlock;
pub(crate) use marshal::marshal;

/// Interop statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InteropStats {
    pub calls: usize,
    pub warnings: usize,
    pub callbacks: usize,
    pub callback_errors: usize,
    pub stale_invocations: usize,
}
