//! Module tables: types, fields, functions, constants, hooks

use super::signature::{SignatureWriter, MAX_INDEX};
use super::{
    ArgFlags, FieldDescriptor, FunctionDescriptor, FunctionFlags, Fundamental, Genus, ModuleId,
    StructLayout, TypeDescriptor, TypeRef,
};
use crate::error::CallError;
use crate::interop::Library;
use core::ffi::c_void;
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

/// Name to binary blob lookup, typically backed by a perfect hash
pub trait NameLookup {
    fn lookup(&self, name: &[u8]) -> Option<&[u8]>;
}

/// Plain hash map implementation of `NameLookup`
#[derive(Debug, Default, Clone)]
pub struct NameTable {
    entries: HashMap<Box<[u8]>, Box<[u8]>>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, blob: Vec<u8>) {
        self.entries
            .insert(name.as_bytes().into(), blob.into_boxed_slice());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NameLookup for NameTable {
    fn lookup(&self, name: &[u8]) -> Option<&[u8]> {
        self.entries.get(name).map(|b| &b[..])
    }
}

/// Runtime type discovery for polymorphic pointer families
pub trait TypeDetector {
    /// Type names of the object at `ptr`, most derived first
    fn detect(&self, ptr: *mut c_void) -> Vec<String>;
}

type PreCallHook = Box<dyn Fn(&FunctionDescriptor)>;
type AllocateHook = Box<dyn Fn(&TypeDescriptor, usize) -> *mut c_void>;
type ArgFlagHook = Box<dyn Fn(&FunctionDescriptor, usize, ArgFlags)>;

/// Optional per-module callbacks invoked during marshaling
#[derive(Default)]
pub struct ModuleHooks {
    pub pre_call: Option<PreCallHook>,
    /// Allocates zeroed, `libc::free`-compatible storage of the given size
    pub allocate: Option<AllocateHook>,
    /// Receives arguments whose flags carry module-defined bits
    pub arg_flag: Option<ArgFlagHook>,
    pub detector: Option<Box<dyn TypeDetector>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantKind {
    Integer,
    Enum,
    Flags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    pub kind: ConstantKind,
    pub value: i64,
    /// Owning enum or flags type, if any
    pub type_ref: Option<TypeRef>,
}

/// One registered module
pub struct Module {
    pub(crate) id: ModuleId,
    name: String,
    types: Vec<TypeDescriptor>,
    resolved: Vec<Cell<Option<TypeRef>>>,
    layouts: Vec<StructLayout>,
    fields: Vec<FieldDescriptor>,
    functions: Box<dyn NameLookup>,
    constants: Box<dyn NameLookup>,
    fundamental_map: Vec<Fundamental>,
    symbols: HashMap<String, usize>,
    library: Option<Library>,
    hooks: ModuleHooks,
}

impl Module {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn types(&self) -> &[TypeDescriptor] {
        &self.types
    }

    pub fn type_at(&self, index: u16) -> Result<&TypeDescriptor, CallError> {
        self.types.get(index as usize).ok_or_else(|| {
            CallError::configuration(
                self.name.clone(),
                format!("type index {index} out of range ({} entries)", self.types.len()),
            )
        })
    }

    /// Index of a type by exact name
    pub fn find_type(&self, name: &str) -> Option<u16> {
        self.types
            .iter()
            .skip(1)
            .position(|t| t.name == name)
            .map(|i| (i + 1) as u16)
    }

    pub fn layout(&self, index: u16) -> Option<&StructLayout> {
        self.layouts.get(index as usize)
    }

    pub fn fields(&self, layout: &StructLayout) -> &[FieldDescriptor] {
        self.fields.get(layout.fields.clone()).unwrap_or(&[])
    }

    /// Translate a module-local fundamental id
    pub fn fundamental(&self, local: u8) -> Result<Fundamental, CallError> {
        self.fundamental_map
            .get(local as usize)
            .copied()
            .ok_or_else(|| {
                CallError::configuration(
                    self.name.clone(),
                    format!("local fundamental id {local} has no engine mapping"),
                )
            })
    }

    pub fn hooks(&self) -> &ModuleHooks {
        &self.hooks
    }

    pub(crate) fn resolved(&self, index: u16) -> Option<TypeRef> {
        self.resolved.get(index as usize).and_then(Cell::get)
    }

    pub(crate) fn set_resolved(&self, index: u16, target: TypeRef) {
        if let Some(cell) = self.resolved.get(index as usize) {
            cell.set(Some(target));
        }
    }

    /// Look up a function blob and resolve its native address
    pub fn function(&self, name: &str) -> Result<Option<FunctionDescriptor>, CallError> {
        let Some(blob) = self.functions.lookup(name.as_bytes()) else {
            return Ok(None);
        };
        let (&flags, signature) = blob.split_first().ok_or_else(|| {
            CallError::configuration(format!("{}.{}", self.name, name), "empty function blob")
        })?;
        // Validates the length prefix.
        super::SignatureCursor::new(self.id, signature)?;

        let address = match self.symbols.get(name) {
            Some(&addr) => addr,
            None => self
                .library
                .as_ref()
                .and_then(|lib| lib.symbol(name).ok())
                .ok_or_else(|| CallError::UnknownSymbol {
                    function: name.to_string(),
                    module: self.name.clone(),
                })?,
        };

        Ok(Some(FunctionDescriptor {
            name: name.to_string(),
            address,
            module: self.id,
            flags: FunctionFlags::from_bits_retain(flags),
            signature: Rc::from(signature),
        }))
    }

    pub fn constant(&self, name: &str) -> Option<Constant> {
        let blob = self.constants.lookup(name.as_bytes())?;
        if blob.len() < 11 {
            return None;
        }
        let kind = match blob[0] {
            0 => ConstantKind::Integer,
            1 => ConstantKind::Enum,
            2 => ConstantKind::Flags,
            _ => return None,
        };
        let index = u16::from_le_bytes([blob[1], blob[2]]);
        let mut value = [0u8; 8];
        value.copy_from_slice(&blob[3..11]);
        Some(Constant {
            kind,
            value: i64::from_le_bytes(value),
            type_ref: (index != 0).then(|| TypeRef::new(self.id, index)),
        })
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("types", &self.types.len())
            .finish()
    }
}

/// Signature entry used by the builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub ty: u16,
    pub flags: ArgFlags,
}

impl ArgSpec {
    pub fn new(ty: u16, flags: ArgFlags) -> Self {
        Self { ty, flags }
    }
}

impl From<u16> for ArgSpec {
    fn from(ty: u16) -> Self {
        Self {
            ty,
            flags: ArgFlags::empty(),
        }
    }
}

/// Structure member used by the builder
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub ty: u16,
    pub bit_offset: u32,
    pub bit_length: u32,
}

impl FieldSpec {
    /// Whole field at a byte offset
    pub fn at(name: &str, ty: u16, byte_offset: usize) -> Self {
        Self {
            name: name.to_string(),
            ty,
            bit_offset: (byte_offset * 8) as u32,
            bit_length: 0,
        }
    }

    /// Bit-field
    pub fn bits(name: &str, ty: u16, bit_offset: u32, bit_length: u32) -> Self {
        Self {
            name: name.to_string(),
            ty,
            bit_offset,
            bit_length,
        }
    }
}

/// Assembles the tables of one module
pub struct ModuleBuilder {
    name: String,
    types: Vec<TypeDescriptor>,
    layouts: Vec<StructLayout>,
    fields: Vec<FieldDescriptor>,
    functions: NameTable,
    constants: NameTable,
    fundamental_map: Vec<Fundamental>,
    symbols: HashMap<String, usize>,
    library: Option<Library>,
    hooks: ModuleHooks,
    errors: Vec<String>,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        let reserved = TypeDescriptor {
            name: String::new(),
            genus: Genus::Fundamental(0),
            indirection: 0,
            is_const: false,
            is_array: false,
            target: None,
        };
        Self {
            name: name.to_string(),
            types: vec![reserved],
            layouts: Vec::new(),
            fields: Vec::new(),
            functions: NameTable::new(),
            constants: NameTable::new(),
            fundamental_map: vec![Fundamental::Void],
            symbols: HashMap::new(),
            library: None,
            hooks: ModuleHooks::default(),
            errors: Vec::new(),
        }
    }

    fn push_type(&mut self, desc: TypeDescriptor) -> u16 {
        let index = self.types.len();
        if index > MAX_INDEX as usize {
            self.errors.push(format!("type table full at '{}'", desc.name));
        }
        self.types.push(desc);
        index as u16
    }

    fn local_fundamental(&mut self, fundamental: Fundamental) -> u8 {
        match self.fundamental_map.iter().position(|&f| f == fundamental) {
            Some(local) => local as u8,
            None => {
                self.fundamental_map.push(fundamental);
                (self.fundamental_map.len() - 1) as u8
            }
        }
    }

    /// Primitive type mapped onto an engine fundamental
    pub fn fundamental(&mut self, name: &str, fundamental: Fundamental) -> u16 {
        let local = self.local_fundamental(fundamental);
        self.push_type(TypeDescriptor {
            name: name.to_string(),
            genus: Genus::Fundamental(local),
            indirection: 0,
            is_const: false,
            is_array: false,
            target: None,
        })
    }

    /// One more level of indirection over `target`
    pub fn pointer(&mut self, target: u16) -> u16 {
        let Some(base) = self.types.get(target as usize).cloned() else {
            self.errors.push(format!("pointer to unknown type index {target}"));
            return 0;
        };
        self.push_type(TypeDescriptor {
            name: format!("{}*", base.name),
            genus: base.genus,
            indirection: base.indirection.saturating_add(1),
            is_const: false,
            is_array: false,
            target: Some(target),
        })
    }

    /// Pointer type flagged as a C array
    pub fn array(&mut self, element: u16) -> u16 {
        let index = self.pointer(element);
        if let Some(desc) = self.types.get_mut(index as usize) {
            desc.is_array = true;
            desc.name = format!("{}[]", &desc.name[..desc.name.len() - 1]);
        }
        index
    }

    /// Declare a structure; fields may be attached later to allow self reference
    pub fn declare_struct(&mut self, name: &str, size: usize) -> u16 {
        let layout = self.layouts.len() as u16;
        self.layouts.push(StructLayout {
            size,
            fields: 0..0,
            parent: None,
        });
        self.push_type(TypeDescriptor {
            name: name.to_string(),
            genus: Genus::Struct { layout },
            indirection: 0,
            is_const: false,
            is_array: false,
            target: None,
        })
    }

    pub fn set_fields(&mut self, structure: u16, fields: &[FieldSpec]) {
        let Some(Genus::Struct { layout }) = self.types.get(structure as usize).map(|t| t.genus.clone())
        else {
            self.errors.push(format!("type index {structure} is not a structure"));
            return;
        };
        let start = self.fields.len();
        self.fields.extend(fields.iter().map(|f| FieldDescriptor {
            name: f.name.clone(),
            bit_offset: f.bit_offset,
            bit_length: f.bit_length,
            type_index: f.ty,
        }));
        if let Some(l) = self.layouts.get_mut(layout as usize) {
            l.fields = start..self.fields.len();
        }
    }

    pub fn structure(&mut self, name: &str, size: usize, fields: &[FieldSpec]) -> u16 {
        let index = self.declare_struct(name, size);
        self.set_fields(index, fields);
        index
    }

    /// Name the parent of a structure in its type hierarchy
    pub fn set_parent(&mut self, structure: u16, parent: &str) {
        if let Some(Genus::Struct { layout }) = self.types.get(structure as usize).map(|t| t.genus.clone()) {
            if let Some(l) = self.layouts.get_mut(layout as usize) {
                l.parent = Some(parent.to_string());
            }
        }
    }

    /// Function type usable as a callback parameter
    pub fn callback(&mut self, name: &str, ret: impl Into<ArgSpec>, args: &[ArgSpec]) -> u16 {
        let signature = self.signature(name, ret.into(), args);
        self.push_type(TypeDescriptor {
            name: name.to_string(),
            genus: Genus::Function {
                signature: Rc::from(signature),
            },
            indirection: 0,
            is_const: false,
            is_array: false,
            target: None,
        })
    }

    /// Reference to a type owned by another (possibly not yet loaded) module
    pub fn external(&mut self, name: &str, module_hint: Option<&str>) -> u16 {
        self.push_type(TypeDescriptor {
            name: name.to_string(),
            genus: Genus::NonNative {
                module_hint: module_hint.map(str::to_string),
            },
            indirection: 0,
            is_const: false,
            is_array: false,
            target: None,
        })
    }

    fn signature(&mut self, context: &str, ret: ArgSpec, args: &[ArgSpec]) -> Vec<u8> {
        let mut writer = SignatureWriter::new();
        writer.push(ret.ty, ret.flags);
        for arg in args {
            writer.push(arg.ty, arg.flags);
        }
        match writer.finish() {
            Ok(blob) => blob,
            Err(err) => {
                self.errors.push(format!("{context}: {err}"));
                vec![0]
            }
        }
    }

    /// Describe a function; its address comes from `symbol` or the library
    pub fn function(
        &mut self,
        name: &str,
        flags: FunctionFlags,
        ret: impl Into<ArgSpec>,
        args: &[ArgSpec],
    ) -> &mut Self {
        let mut blob = vec![flags.bits()];
        blob.extend(self.signature(name, ret.into(), args));
        self.functions.insert(name, blob);
        self
    }

    pub fn symbol(&mut self, name: &str, address: usize) -> &mut Self {
        self.symbols.insert(name.to_string(), address);
        self
    }

    /// `function` plus `symbol` for an in-process native implementation
    pub fn native(
        &mut self,
        name: &str,
        address: usize,
        ret: impl Into<ArgSpec>,
        args: &[ArgSpec],
    ) -> &mut Self {
        self.function(name, FunctionFlags::empty(), ret, args);
        self.symbol(name, address)
    }

    fn push_constant(&mut self, name: &str, kind: u8, ty: u16, value: i64) -> &mut Self {
        let mut blob = Vec::with_capacity(11);
        blob.push(kind);
        blob.extend_from_slice(&ty.to_le_bytes());
        blob.extend_from_slice(&value.to_le_bytes());
        self.constants.insert(name, blob);
        self
    }

    pub fn constant(&mut self, name: &str, value: i64) -> &mut Self {
        self.push_constant(name, 0, 0, value)
    }

    pub fn enum_value(&mut self, name: &str, ty: u16, value: i64) -> &mut Self {
        self.push_constant(name, 1, ty, value)
    }

    pub fn flags_value(&mut self, name: &str, ty: u16, value: i64) -> &mut Self {
        self.push_constant(name, 2, ty, value)
    }

    pub fn library(&mut self, library: Library) -> &mut Self {
        self.library = Some(library);
        self
    }

    pub fn hooks(&mut self, hooks: ModuleHooks) -> &mut Self {
        self.hooks = hooks;
        self
    }

    /// Finish the module; fails if any table entry was malformed
    pub fn build(self) -> Result<Module, CallError> {
        if let Some(first) = self.errors.first() {
            return Err(CallError::configuration(self.name.clone(), first.clone()));
        }
        let resolved = (0..self.types.len()).map(|_| Cell::new(None)).collect();
        Ok(Module {
            id: 0,
            name: self.name,
            types: self.types,
            resolved,
            layouts: self.layouts,
            fields: self.fields,
            functions: Box::new(self.functions),
            constants: Box::new(self.constants),
            fundamental_map: self.fundamental_map,
            symbols: self.symbols,
            library: self.library,
            hooks: self.hooks,
        })
    }
}
