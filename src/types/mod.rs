//! Type descriptors - compact type tables shared by all modules
//!
//! Design: each module owns a table of `TypeDescriptor`s addressed by a
//! 15-bit index. Signatures reference those indices through the compact
//! encoding in `signature.rs`; cross-module references are resolved by
//! name hash through the `ModuleRegistry`.
//!
//! Architecture:
//! - `fundamental.rs` - engine-wide fundamental ids and their conversion metadata
//! - `signature.rs` - signature cursor and writer
//! - `module.rs` - module tables, name lookups, hooks and the builder
//! - `registry.rs` - module registration, lazy loading and resolution

mod fundamental;
mod module;
mod registry;
mod signature;

pub use fundamental::{Fundamental, FundamentalInfo};
pub use module::{
    ArgSpec, Constant, ConstantKind, FieldSpec, Module, ModuleBuilder, ModuleHooks, NameLookup,
    NameTable, TypeDetector,
};
pub use registry::{name_hash, ModuleRegistry};
pub use signature::{SignatureCursor, SignatureWriter};

use crate::interop::AbiType;
use bitflags::bitflags;
use std::ops::Range;
use std::rc::Rc;

/// Index of a registered module
pub type ModuleId = u16;

/// Distinguishes enum and flags values sharing one integer encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TypeFlag {
    #[default]
    Plain,
    Enum,
    Flags,
}

/// Module-relative type reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef {
    pub module: ModuleId,
    pub index: u16,
    pub flag: TypeFlag,
}

impl TypeRef {
    pub const fn new(module: ModuleId, index: u16) -> Self {
        Self {
            module,
            index,
            flag: TypeFlag::Plain,
        }
    }

    /// Same table entry, ignoring the enum/flags marker
    #[inline]
    pub fn same_type(&self, other: &TypeRef) -> bool {
        self.module == other.module && self.index == other.index
    }
}

/// Kind of a type table entry
#[derive(Debug, Clone, PartialEq)]
pub enum Genus {
    /// Forward reference to a type owned by another module, by name
    NonNative { module_hint: Option<String> },
    /// Structure or union; the layout lives in the module's layout table
    Struct { layout: u16 },
    /// Function type; callbacks of this type use the embedded signature
    Function { signature: Rc<[u8]> },
    /// Module-local fundamental id, translated through the fundamental map
    Fundamental(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    pub name: String,
    pub genus: Genus,
    pub indirection: u8,
    pub is_const: bool,
    pub is_array: bool,
    /// Entry one indirection level shallower, for pointer types
    pub target: Option<u16>,
}

/// Member layout of a structure type
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructLayout {
    pub size: usize,
    pub fields: Range<usize>,
    /// Name of the parent type in a single-inheritance hierarchy
    pub parent: Option<String>,
}

/// `bit_length == 0` means the field spans its declared type's size
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub bit_offset: u32,
    pub bit_length: u32,
    pub type_index: u16,
}

bitflags! {
    /// Per-function metadata stored in the function blob
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FunctionFlags: u8 {
        /// The returned object is owned by the caller
        const RETURNS_OWNED = 0x01;
    }
}

bitflags! {
    /// Per-argument flags carried by the signature escape byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ArgFlags: u8 {
        const OWNED = 0x01;
        /// Output array whose element count is the next argument's output
        const ARRAY_LEN_NEXT = 0x02;
        const CONST = 0x04;
    }
}

impl ArgFlags {
    /// Bits reserved for module-defined semantics
    pub const MODULE_MASK: u8 = 0xF0;

    #[inline]
    pub fn module_bits(self) -> u8 {
        self.bits() & Self::MODULE_MASK
    }
}

/// Resolved entry point of a foreign function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDescriptor {
    pub name: String,
    pub address: usize,
    pub module: ModuleId,
    pub flags: FunctionFlags,
    /// Length-prefixed signature; entry 0 is the return type
    pub signature: Rc<[u8]>,
}

impl FunctionDescriptor {
    pub fn cursor(&self) -> Result<SignatureCursor<'_>, crate::error::CallError> {
        SignatureCursor::new(self.module, &self.signature)
    }
}

/// A resolved and classified type, ready for conversion dispatch
#[derive(Clone)]
pub struct ArgType {
    pub type_ref: TypeRef,
    pub fundamental: Fundamental,
    module: Rc<Module>,
}

impl ArgType {
    pub(crate) fn new(type_ref: TypeRef, fundamental: Fundamental, module: Rc<Module>) -> Self {
        Self {
            type_ref,
            fundamental,
            module,
        }
    }

    pub fn module(&self) -> &Rc<Module> {
        &self.module
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        // Index validity is checked when the ArgType is created.
        &self.module.types()[self.type_ref.index as usize]
    }

    pub fn name(&self) -> &str {
        &self.descriptor().name
    }

    #[inline]
    pub fn indirection(&self) -> u8 {
        self.descriptor().indirection
    }

    #[inline]
    pub fn info(&self) -> &'static FundamentalInfo {
        self.fundamental.info()
    }

    #[inline]
    pub fn abi(&self) -> Option<AbiType> {
        self.fundamental.info().abi
    }

    /// Pointer whose target is known and not `void`
    pub fn is_typed_pointer(&self) -> bool {
        match (self.indirection(), &self.descriptor().genus) {
            (0, _) => false,
            (1, Genus::Fundamental(local)) => self
                .module
                .fundamental(*local)
                .map_or(false, |f| f != Fundamental::Void),
            _ => true,
        }
    }

    /// Layout of the underlying structure, following pointer levels
    pub fn layout(&self) -> Option<&StructLayout> {
        match self.descriptor().genus {
            Genus::Struct { layout } => self.module.layout(layout),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ArgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArgType")
            .field("name", &self.name())
            .field("fundamental", &self.fundamental)
            .field("type_ref", &self.type_ref)
            .finish()
    }
}
