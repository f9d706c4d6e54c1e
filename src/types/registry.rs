//! Module registration and cross-module type resolution

use super::{ArgType, Constant, FunctionDescriptor, Fundamental, Genus, Module, ModuleId, TypeFlag, TypeRef};
use crate::error::CallError;
use crate::logging;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, info};

type Loader = Box<dyn FnOnce() -> Result<Module, CallError>>;

/// Bound on parent-chain walks, guards against cyclic hierarchies
const MAX_HIERARCHY_DEPTH: usize = 64;

/// 32-bit hash of a type name used by the global name table
pub fn name_hash(name: &str) -> u32 {
    let hash = blake3::hash(name.as_bytes());
    let b = hash.as_bytes();
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// All registered modules plus the process-wide name table
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RefCell<Vec<Rc<Module>>>,
    by_name: RefCell<HashMap<String, ModuleId>>,
    pending: RefCell<HashMap<String, Loader>>,
    names: RefCell<HashMap<u32, Vec<(Rc<str>, TypeRef)>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a loaded module and index its type names
    pub fn register(&self, mut module: Module) -> Result<ModuleId, CallError> {
        if self.by_name.borrow().contains_key(module.name()) {
            return Err(CallError::configuration(
                module.name().to_string(),
                "module registered twice",
            ));
        }
        let id = ModuleId::try_from(self.modules.borrow().len())
            .map_err(|_| CallError::configuration(module.name().to_string(), "too many modules"))?;
        module.id = id;

        {
            let mut names = self.names.borrow_mut();
            for (index, desc) in module.types().iter().enumerate().skip(1) {
                if matches!(desc.genus, Genus::NonNative { .. }) {
                    continue;
                }
                names
                    .entry(name_hash(&desc.name))
                    .or_default()
                    .push((Rc::from(desc.name.as_str()), TypeRef::new(id, index as u16)));
            }
        }

        info!(
            event = "module_registered",
            module = module.name(),
            id = id,
            types = module.types().len() - 1,
            "Module registered"
        );
        self.by_name.borrow_mut().insert(module.name().to_string(), id);
        self.modules.borrow_mut().push(Rc::new(module));
        Ok(id)
    }

    /// Defer loading of a module until one of its types is needed
    pub fn declare_lazy<F>(&self, name: &str, loader: F)
    where
        F: FnOnce() -> Result<Module, CallError> + 'static,
    {
        self.pending.borrow_mut().insert(name.to_string(), Box::new(loader));
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.by_name.borrow().contains_key(name)
    }

    pub fn module(&self, id: ModuleId) -> Result<Rc<Module>, CallError> {
        self.modules
            .borrow()
            .get(id as usize)
            .cloned()
            .ok_or_else(|| CallError::configuration("registry", format!("unknown module id {id}")))
    }

    pub fn module_by_name(&self, name: &str) -> Option<Rc<Module>> {
        let id = *self.by_name.borrow().get(name)?;
        self.modules.borrow().get(id as usize).cloned()
    }

    pub fn modules(&self) -> Vec<Rc<Module>> {
        self.modules.borrow().clone()
    }

    fn lookup_name(&self, name: &str) -> Option<TypeRef> {
        let names = self.names.borrow();
        names
            .get(&name_hash(name))?
            .iter()
            .find(|(n, _)| &**n == name)
            .map(|(_, r)| *r)
    }

    /// Run pending loaders: the hinted one, or all of them without a hint
    fn load_pending(&self, hint: Option<&str>) -> Result<bool, CallError> {
        let loaders: Vec<(String, Loader)> = {
            let mut pending = self.pending.borrow_mut();
            match hint {
                Some(name) => pending.remove(name).map(|l| (name.to_string(), l)).into_iter().collect(),
                None => pending.drain().collect(),
            }
        };
        let loaded = !loaders.is_empty();
        for (name, loader) in loaders {
            debug!(event = "module_lazy_load", module = %name, "Loading module on demand");
            let _timer = logging::perf::track("load_module", name.as_str());
            let module = loader()?;
            self.register(module)?;
        }
        Ok(loaded)
    }

    /// Follow a non-native entry to the TypeRef that defines it
    pub fn resolve(&self, type_ref: TypeRef) -> Result<TypeRef, CallError> {
        let module = self.module(type_ref.module)?;
        let desc = module.type_at(type_ref.index)?;
        let Genus::NonNative { module_hint } = &desc.genus else {
            return Ok(type_ref);
        };
        if let Some(cached) = module.resolved(type_ref.index) {
            return Ok(cached);
        }

        let target = match self.lookup_name(&desc.name) {
            Some(found) => Some(found),
            // One lazy load, one retry.
            None if self.load_pending(module_hint.as_deref())? => self.lookup_name(&desc.name),
            None => None,
        }
        .ok_or_else(|| CallError::UnresolvedType {
            name: desc.name.clone(),
            context: module.name().to_string(),
        })?;

        module.set_resolved(type_ref.index, target);
        Ok(target)
    }

    /// Resolve and classify a signature entry
    pub fn arg_type(&self, type_ref: TypeRef) -> Result<ArgType, CallError> {
        let resolved = self.resolve(type_ref)?;
        let module = self.module(resolved.module)?;
        let desc = module.type_at(resolved.index)?;
        let fundamental = match &desc.genus {
            Genus::NonNative { .. } => {
                return Err(CallError::configuration(
                    module.name().to_string(),
                    format!("'{}' resolved to another forward reference", desc.name),
                ))
            }
            Genus::Function { .. } if desc.indirection <= 1 => Fundamental::Callback,
            Genus::Function { .. } => Fundamental::Pointer,
            Genus::Struct { .. } => match desc.indirection {
                0 => Fundamental::Struct,
                1 => Fundamental::Object,
                _ => Fundamental::Pointer,
            },
            Genus::Fundamental(local) => {
                let base = module.fundamental(*local)?;
                match (base, desc.indirection) {
                    (base, 0) => base,
                    (Fundamental::Char | Fundamental::UChar, 1) => Fundamental::String,
                    _ => Fundamental::Pointer,
                }
            }
        };
        let flag = match fundamental {
            Fundamental::Enum => TypeFlag::Enum,
            Fundamental::Flags => TypeFlag::Flags,
            _ => TypeFlag::Plain,
        };
        Ok(ArgType::new(TypeRef { flag, ..resolved }, fundamental, module))
    }

    /// The type one indirection level shallower
    pub fn pointee(&self, ty: &ArgType) -> Result<ArgType, CallError> {
        let target = ty.descriptor().target.ok_or_else(|| {
            CallError::configuration(ty.module().name().to_string(), format!("'{}' is not a pointer", ty.name()))
        })?;
        self.arg_type(TypeRef::new(ty.type_ref.module, target))
    }

    /// Peel pointer levels down to the underlying type
    pub fn base_type(&self, ty: &ArgType) -> Result<ArgType, CallError> {
        let mut current = ty.clone();
        while current.indirection() > 0 {
            current = self.pointee(&current)?;
        }
        Ok(current)
    }

    /// Find a type by name, loading pending modules once if needed
    pub fn find_type(&self, name: &str) -> Result<ArgType, CallError> {
        let found = match self.lookup_name(name) {
            Some(found) => Some(found),
            None if self.load_pending(None)? => self.lookup_name(name),
            None => None,
        };
        let type_ref = found.ok_or_else(|| CallError::UnknownType { name: name.to_string() })?;
        self.arg_type(type_ref)
    }

    /// Find a function in any module, loading pending modules once if needed
    pub fn find_function(&self, name: &str) -> Result<FunctionDescriptor, CallError> {
        for attempt in 0..2 {
            for module in self.modules() {
                if let Some(function) = module.function(name)? {
                    return Ok(function);
                }
            }
            if attempt == 0 && !self.load_pending(None)? {
                break;
            }
        }
        Err(CallError::UnknownFunction { name: name.to_string() })
    }

    /// Constant by name, preferring the given module
    pub fn find_constant(&self, name: &str, preferred: Option<ModuleId>) -> Option<Constant> {
        if let Some(id) = preferred {
            if let Some(c) = self.module(id).ok().and_then(|m| m.constant(name)) {
                return Some(c);
            }
        }
        self.modules().iter().find_map(|m| m.constant(name))
    }

    fn parent_of(&self, type_ref: TypeRef) -> Option<TypeRef> {
        let module = self.module(type_ref.module).ok()?;
        let desc = module.type_at(type_ref.index).ok()?;
        let Genus::Struct { layout } = desc.genus else {
            return None;
        };
        let parent = module.layout(layout)?.parent.as_deref()?;
        self.lookup_name(parent)
    }

    /// Whether `ty` equals `ancestor` or derives from it
    pub fn is_derived(&self, ty: TypeRef, ancestor: TypeRef) -> bool {
        let mut current = Some(ty);
        for _ in 0..MAX_HIERARCHY_DEPTH {
            match current {
                Some(t) if t.same_type(&ancestor) => return true,
                Some(t) => current = self.parent_of(t),
                None => return false,
            }
        }
        false
    }

    /// Names of `ty` and all its ancestors, most derived first
    pub fn lineage(&self, ty: TypeRef) -> Vec<Rc<str>> {
        let mut names = Vec::new();
        let mut current = Some(ty);
        while let Some(t) = current {
            if names.len() >= MAX_HIERARCHY_DEPTH {
                break;
            }
            let Some(name) = self
                .module(t.module)
                .ok()
                .and_then(|m| m.type_at(t.index).ok().map(|d| Rc::<str>::from(d.name.as_str())))
            else {
                break;
            };
            names.push(name);
            current = self.parent_of(t);
        }
        names
    }

    /// First name in `candidates` that is a registered type
    pub fn first_known(&self, candidates: &[String]) -> Option<TypeRef> {
        candidates.iter().find_map(|name| self.lookup_name(name))
    }
}
