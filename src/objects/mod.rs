//! Object proxies - stable script identity for native pointers
//!
//! Design: proxy records live in a slot-map arena and are addressed by
//! key, never by pointer. Proxies sharing one native address form an alias
//! ring through their `next` keys; the address map points at exactly one
//! member of each ring, its owner. The script-visible `Proxy` is a
//! reference-counted cell holding the key; dropping the last handle is the
//! finalization event.
//!
//! Architecture:
//! - `handler.rs` - the memory-policy trait and the built-in policies
//! - `refcount.rs` - policy for intrusively reference-counted families

mod handler;
mod refcount;

pub use handler::{ArrayHandler, MallocHandler, ObjectTypeHandler, PlainHandler, ProxyInfo};
pub use refcount::{RefCountFn, RefCountedHandler, RefFn};

use crate::config::ObjectsConfig;
use crate::error::CallError;
use crate::logging;
use crate::types::{ArgType, Genus, ModuleRegistry, TypeRef};
use bitflags::bitflags;
use core::ffi::c_void;
use slotmap::{new_key_type, SlotMap};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::error;

new_key_type! {
    /// Arena key of one proxy record
    pub struct ProxyKey;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProxyFlags: u8 {
        /// The script side owns the pointer; no reference is taken
        const OWNED = 0x01;
        /// Element array with a known length
        const ARRAY = 0x02;
        /// Points into the native stack; never registered
        const EPHEMERAL = 0x04;
    }
}

/// Ring or address-map invariant broken
///
/// Fatal in debug builds; logged in release builds.
pub fn consistency_violation(detail: &str) {
    error!(target: "objects", event = "consistency_violation", detail = detail, "Proxy registry inconsistent");
    if cfg!(debug_assertions) {
        panic!("proxy registry inconsistent: {detail}");
    }
}

#[derive(Clone)]
struct ProxyRecord {
    ptr: *mut c_void,
    type_ref: TypeRef,
    type_name: Rc<str>,
    lineage: Rc<[Rc<str>]>,
    size: usize,
    policy: usize,
    is_deleted: bool,
    is_new: bool,
    array_size: usize,
    flags: ProxyFlags,
    is_alias: bool,
    next: ProxyKey,
    cell: Weak<ProxyCell>,
    /// Enclosing object of an interior view; keeps its memory alive
    parent: Option<Proxy>,
}

impl ProxyRecord {
    fn info(&self) -> ProxyInfo<'_> {
        ProxyInfo {
            ptr: self.ptr,
            type_name: &self.type_name,
            lineage: &self.lineage,
            size: self.size,
            array_size: self.array_size,
            flags: self.flags,
            is_alias: self.is_alias,
        }
    }
}

/// Script-visible handle to a native pointer
#[derive(Clone)]
pub struct Proxy(Rc<ProxyCell>);

pub(crate) struct ProxyCell {
    key: ProxyKey,
    registry: Weak<ProxyRegistry>,
}

impl Drop for ProxyCell {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.on_finalize(self.key);
        }
    }
}

impl Proxy {
    pub fn key(&self) -> ProxyKey {
        self.0.key
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn with_record<R>(&self, f: impl FnOnce(&ProxyRecord) -> R) -> Option<R> {
        let registry = self.0.registry.upgrade()?;
        let records = registry.records.borrow();
        records.get(self.0.key).map(f)
    }

    /// Native address; `None` once the object is deleted
    pub fn pointer(&self) -> Option<*mut c_void> {
        if self.is_deleted() {
            return None;
        }
        self.with_record(|r| r.ptr)
    }

    pub fn type_ref(&self) -> Option<TypeRef> {
        self.with_record(|r| r.type_ref)
    }

    pub fn type_name(&self) -> Option<Rc<str>> {
        self.with_record(|r| r.type_name.clone())
    }

    /// True when the registry no longer has a live record, or the object
    /// (or the object it is a view into) was invalidated
    pub fn is_deleted(&self) -> bool {
        match self.with_record(|r| (r.is_deleted, r.parent.clone())) {
            Some((false, Some(parent))) => parent.is_deleted(),
            Some((deleted, _)) => deleted,
            None => true,
        }
    }

    /// Created by the lookup that returned it
    pub fn is_new(&self) -> bool {
        self.with_record(|r| r.is_new).unwrap_or(false)
    }

    pub fn array_size(&self) -> usize {
        self.with_record(|r| r.array_size).unwrap_or(0)
    }

    pub fn flags(&self) -> ProxyFlags {
        self.with_record(|r| r.flags).unwrap_or_default()
    }

    /// Name of the memory policy managing this proxy
    pub fn handler_name(&self) -> Option<String> {
        let registry = self.0.registry.upgrade()?;
        let policy = self.with_record(|r| r.policy)?;
        let name = registry.handler(policy).name().to_string();
        Some(name)
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.with_record(|r| (r.type_name.clone(), r.ptr as usize, r.is_deleted)) {
            Some((ty, addr, false)) => write!(f, "Proxy({ty} @ {addr:#x})"),
            Some((ty, _, true)) => write!(f, "Proxy({ty}, deleted)"),
            None => write!(f, "Proxy(finalized)"),
        }
    }
}

/// Pointer to proxy identity map with alias rings
pub struct ProxyRegistry {
    records: RefCell<SlotMap<ProxyKey, ProxyRecord>>,
    by_address: RefCell<HashMap<usize, ProxyKey>>,
    handlers: RefCell<Vec<Rc<dyn ObjectTypeHandler>>>,
    // Finalizations that arrived while the arena was borrowed.
    pending: RefCell<Vec<ProxyKey>>,
    config: ObjectsConfig,
}

impl ProxyRegistry {
    /// Registry with the plain, malloc and array policies installed
    pub fn new(config: ObjectsConfig) -> Rc<Self> {
        let handlers: Vec<Rc<dyn ObjectTypeHandler>> =
            vec![Rc::new(PlainHandler), Rc::new(MallocHandler), Rc::new(ArrayHandler)];
        Rc::new(Self {
            records: RefCell::new(SlotMap::with_key()),
            by_address: RefCell::new(HashMap::new()),
            handlers: RefCell::new(handlers),
            pending: RefCell::new(Vec::new()),
            config,
        })
    }

    /// Add a policy; returns its id
    pub fn register_handler(&self, handler: Rc<dyn ObjectTypeHandler>) -> usize {
        let mut handlers = self.handlers.borrow_mut();
        handlers.push(handler);
        handlers.len() - 1
    }

    fn handler(&self, policy: usize) -> Rc<dyn ObjectTypeHandler> {
        match self.handlers.borrow().get(policy) {
            Some(handler) => handler.clone(),
            None => Rc::new(PlainHandler),
        }
    }

    /// Highest score wins; ties keep the earliest registered
    fn select_handler(&self, info: &ProxyInfo<'_>) -> usize {
        let handlers = self.handlers.borrow();
        let mut best = (0, 0);
        for (id, handler) in handlers.iter().enumerate() {
            let score = handler.score(info);
            if score > best.1 {
                best = (id, score);
            }
        }
        best.0
    }

    /// Live records, ephemeral and deleted ones included
    pub fn len(&self) -> usize {
        self.records.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses with a registered owner
    pub fn registered(&self) -> usize {
        self.by_address.borrow().len()
    }

    /// Owner of the ring registered for `ptr`
    pub fn lookup(&self, ptr: *mut c_void) -> Option<Proxy> {
        let key = *self.by_address.borrow().get(&(ptr as usize))?;
        let records = self.records.borrow();
        records.get(key)?.cell.upgrade().map(Proxy)
    }

    /// Number of proxies in the ring registered for `ptr`
    pub fn ring_size(&self, ptr: *mut c_void) -> usize {
        let Some(owner) = self.by_address.borrow().get(&(ptr as usize)).copied() else {
            return 0;
        };
        ring_keys(&self.records.borrow(), owner).len()
    }

    fn flush_pending(&self) {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        for key in pending {
            self.on_finalize(key);
        }
    }

    /// Proxy for `ptr` viewed as `ty`, reusing an existing identity when possible
    pub fn get_or_create(
        self: &Rc<Self>,
        modules: &ModuleRegistry,
        ptr: *mut c_void,
        ty: &ArgType,
        flags: ProxyFlags,
    ) -> Result<Option<Proxy>, CallError> {
        if ptr.is_null() {
            return Ok(None);
        }
        self.flush_pending();

        if self.config.detect_stack_pointers
            && !flags.contains(ProxyFlags::OWNED)
            && on_native_stack(ptr, self.config.stack_window)
        {
            let proxy = self.create(modules, ptr, ty.type_ref, flags | ProxyFlags::EPHEMERAL, 0, None);
            return Ok(Some(proxy));
        }

        let owner = self.by_address.borrow().get(&(ptr as usize)).copied();
        if let Some(owner) = owner {
            if let Some(found) = self.find_in_ring(modules, owner, ty.type_ref, flags) {
                return Ok(Some(found));
            }
            return Ok(Some(self.create(modules, ptr, ty.type_ref, flags, 0, Some(owner))));
        }

        let concrete = detect_type(modules, ptr, ty);
        Ok(Some(self.create(modules, ptr, concrete, flags, 0, None)))
    }

    /// Proxy for memory inside `parent`: an embedded structure or an array element
    ///
    /// A view at the parent's own address joins its alias ring. Any other
    /// view holds the parent, so the enclosing memory outlives it.
    pub fn get_or_create_within(
        self: &Rc<Self>,
        modules: &ModuleRegistry,
        ptr: *mut c_void,
        ty: &ArgType,
        parent: &Proxy,
    ) -> Result<Option<Proxy>, CallError> {
        let Some(view) = self.get_or_create(modules, ptr, ty, ProxyFlags::empty())? else {
            return Ok(None);
        };
        if !view.ptr_eq(parent) && parent.pointer() != Some(ptr) {
            let mut records = self.records.borrow_mut();
            if let Some(record) = records.get_mut(view.key()) {
                if record.parent.is_none() {
                    record.parent = Some(parent.clone());
                }
            }
        }
        Ok(Some(view))
    }

    /// Register freshly allocated element storage owned by the script side
    pub fn adopt_array(self: &Rc<Self>, modules: &ModuleRegistry, ptr: *mut c_void, element: &ArgType, count: usize) -> Option<Proxy> {
        if ptr.is_null() {
            return None;
        }
        self.flush_pending();
        let flags = ProxyFlags::OWNED | ProxyFlags::ARRAY;
        Some(self.create(modules, ptr, element.type_ref, flags, count, None))
    }

    fn find_in_ring(&self, modules: &ModuleRegistry, owner: ProxyKey, wanted: TypeRef, flags: ProxyFlags) -> Option<Proxy> {
        let (key, cell) = self.compatible_member(modules, owner, wanted, flags)?;
        if flags.contains(ProxyFlags::OWNED) {
            self.transfer_ownership(owner, key);
        }
        Some(Proxy(cell))
    }

    fn compatible_member(
        &self,
        modules: &ModuleRegistry,
        owner: ProxyKey,
        wanted: TypeRef,
        flags: ProxyFlags,
    ) -> Option<(ProxyKey, Rc<ProxyCell>)> {
        let mut records = self.records.borrow_mut();
        let mut current = owner;
        for _ in 0..=records.len() {
            let record = records.get_mut(current)?;
            let compatible = !record.is_deleted
                && record.flags.contains(ProxyFlags::ARRAY) == flags.contains(ProxyFlags::ARRAY)
                && modules.is_derived(record.type_ref, wanted);
            if compatible {
                if let Some(cell) = record.cell.upgrade() {
                    record.is_new = false;
                    return Some((current, cell));
                }
            }
            current = record.next;
            if current == owner {
                return None;
            }
        }
        consistency_violation("alias ring does not close");
        None
    }

    /// An existing proxy receives the ownership a native call handed over
    ///
    /// A borrowed proxy switches to the policy an owned pointer of its type
    /// would get. A reference-counted family keeps its policy and drops the
    /// extra reference instead.
    fn transfer_ownership(&self, owner: ProxyKey, key: ProxyKey) {
        let mut records = self.records.borrow_mut();
        let already_owned = ring_keys(&records, owner)
            .into_iter()
            .any(|k| self.handler(records[k].policy).owns_memory());
        if already_owned {
            return;
        }
        let Some(record) = records.get_mut(key) else {
            return;
        };
        let owned = ProxyInfo {
            flags: record.flags | ProxyFlags::OWNED,
            is_alias: false,
            ..record.info()
        };
        let candidate = self.select_handler(&owned);
        if self.handler(candidate).owns_memory() {
            record.policy = candidate;
            record.flags |= ProxyFlags::OWNED;
            return;
        }
        let released = record.clone();
        drop(records);
        self.handler(released.policy).unref_object(&released.info());
    }

    fn create(
        self: &Rc<Self>,
        modules: &ModuleRegistry,
        ptr: *mut c_void,
        type_ref: TypeRef,
        flags: ProxyFlags,
        array_size: usize,
        alias_of: Option<ProxyKey>,
    ) -> Proxy {
        let lineage: Rc<[Rc<str>]> = modules.lineage(type_ref).into();
        let type_name = lineage.first().cloned().unwrap_or_else(|| Rc::from("?"));
        let size = struct_size(modules, type_ref);
        let ephemeral = flags.contains(ProxyFlags::EPHEMERAL);

        let mut record = ProxyRecord {
            ptr,
            type_ref,
            type_name,
            lineage,
            size,
            policy: 0,
            is_deleted: false,
            is_new: true,
            array_size,
            flags,
            is_alias: alias_of.is_some(),
            next: ProxyKey::default(),
            cell: Weak::new(),
            parent: None,
        };
        if !ephemeral {
            record.policy = self.select_handler(&record.info());
        }
        let handler = self.handler(record.policy);

        let cell = {
            let mut records = self.records.borrow_mut();
            let key = records.insert_with_key(|key| ProxyRecord {
                next: key,
                ..record.clone()
            });
            let cell = Rc::new(ProxyCell {
                key,
                registry: Rc::downgrade(self),
            });
            records[key].cell = Rc::downgrade(&cell);
            if let Some(owner) = alias_of {
                let after = records[owner].next;
                records[owner].next = key;
                records[key].next = after;
            }
            cell
        };

        if !ephemeral {
            if alias_of.is_none() {
                self.by_address.borrow_mut().insert(ptr as usize, cell.key);
            }
            if !flags.contains(ProxyFlags::OWNED) {
                handler.ref_object(&record.info());
            }
        }
        logging::log_proxy_created(ptr as usize, &record.type_name, handler.name(), alias_of.is_some());
        Proxy(cell)
    }

    /// Mark every proxy at this address, and every view into it, deleted
    pub fn invalidate(&self, proxy: &Proxy) {
        let mut records = self.records.borrow_mut();
        let mut doomed: HashSet<ProxyKey> = ring_keys(&records, proxy.key()).into_iter().collect();
        loop {
            let views: Vec<ProxyKey> = records
                .iter()
                .filter(|(key, r)| {
                    !doomed.contains(key) && r.parent.as_ref().map_or(false, |p| doomed.contains(&p.key()))
                })
                .map(|(key, _)| key)
                .collect();
            if views.is_empty() {
                break;
            }
            for view in views {
                doomed.extend(ring_keys(&records, view));
            }
        }
        for key in &doomed {
            if let Some(record) = records.get_mut(*key) {
                record.ptr = std::ptr::null_mut();
                record.is_deleted = true;
            }
        }
        drop(records);

        self.by_address.borrow_mut().retain(|_, owner| !doomed.contains(owner));
    }

    /// Script-side finalization of one proxy
    fn on_finalize(&self, key: ProxyKey) {
        let Ok(mut records) = self.records.try_borrow_mut() else {
            self.pending.borrow_mut().push(key);
            return;
        };
        let Some(record) = records.remove(key) else {
            return;
        };
        let addr = record.ptr as usize;
        let has_aliases = record.next != key && records.contains_key(record.next);

        if has_aliases {
            let mut prev = record.next;
            let mut steps = 0;
            while let Some(r) = records.get(prev) {
                if r.next == key {
                    break;
                }
                prev = r.next;
                steps += 1;
                if steps > records.len() {
                    consistency_violation("finalized proxy missing from its alias ring");
                    break;
                }
            }
            if let Some(p) = records.get_mut(prev) {
                p.next = record.next;
            }
        }

        if record.is_deleted || record.flags.contains(ProxyFlags::EPHEMERAL) {
            drop(records);
            logging::log_proxy_finalized(addr, &record.type_name, has_aliases);
            return;
        }

        let (policy, released) = if has_aliases {
            {
                let mut map = self.by_address.borrow_mut();
                match map.get(&addr) {
                    Some(&owner) if owner == key => {
                        map.insert(addr, record.next);
                    }
                    Some(_) => {}
                    None => consistency_violation("aliased pointer has no registry entry"),
                }
            }
            if self.handler(record.policy).owns_memory() {
                // The memory outlives this alias; hand the policy on.
                let survivor = &mut records[record.next];
                let previous = std::mem::replace(&mut survivor.policy, record.policy);
                (previous, survivor.clone())
            } else {
                (record.policy, record.clone())
            }
        } else {
            let mut map = self.by_address.borrow_mut();
            match map.get(&addr) {
                Some(&owner) if owner == key => {
                    map.remove(&addr);
                }
                _ => consistency_violation("registered pointer does not map to its last proxy"),
            }
            (record.policy, record.clone())
        };
        drop(records);

        self.handler(policy).unref_object(&released.info());
        logging::log_proxy_finalized(addr, &record.type_name, has_aliases);
    }

    /// Reference count reported by the proxy's policy
    pub fn refcount(&self, proxy: &Proxy) -> Option<u32> {
        let record = self.records.borrow().get(proxy.key()).cloned()?;
        if record.is_deleted {
            return Some(0);
        }
        self.handler(record.policy).refcount(&record.info())
    }

    /// Release every registered object and invalidate all proxies
    pub fn shutdown(&self) -> usize {
        self.flush_pending();
        let released: Vec<ProxyRecord> = {
            let mut records = self.records.borrow_mut();
            let mut released = Vec::new();
            for (_, record) in records.iter_mut() {
                if !record.is_deleted && !record.flags.contains(ProxyFlags::EPHEMERAL) {
                    released.push(record.clone());
                }
                record.ptr = std::ptr::null_mut();
                record.is_deleted = true;
            }
            released
        };
        self.by_address.borrow_mut().clear();
        for record in &released {
            self.handler(record.policy).unref_object(&record.info());
        }
        released.len()
    }
}

/// Members of the ring containing `start`, `start` first
fn ring_keys(records: &SlotMap<ProxyKey, ProxyRecord>, start: ProxyKey) -> Vec<ProxyKey> {
    let mut keys = Vec::new();
    let mut current = start;
    for _ in 0..=records.len() {
        let Some(record) = records.get(current) else {
            break;
        };
        keys.push(current);
        current = record.next;
        if current == start {
            break;
        }
    }
    keys
}

/// Concrete type of a new pointer through the module's detector, if any
fn detect_type(modules: &ModuleRegistry, ptr: *mut c_void, declared: &ArgType) -> TypeRef {
    let Some(detector) = &declared.module().hooks().detector else {
        return declared.type_ref;
    };
    match modules.first_known(&detector.detect(ptr)) {
        Some(found) if modules.is_derived(found, declared.type_ref) => found,
        _ => declared.type_ref,
    }
}

fn struct_size(modules: &ModuleRegistry, type_ref: TypeRef) -> usize {
    let Ok(module) = modules.module(type_ref.module) else {
        return 0;
    };
    match module.type_at(type_ref.index).map(|d| &d.genus) {
        Ok(Genus::Struct { layout }) => module.layout(*layout).map_or(0, |l| l.size),
        _ => 0,
    }
}

/// Heuristic: within `window` bytes of a local of this frame
#[inline(never)]
fn on_native_stack(ptr: *mut c_void, window: usize) -> bool {
    let marker = 0u8;
    let here = std::hint::black_box(&marker) as *const u8 as usize;
    here.abs_diff(ptr as usize) < window
}
