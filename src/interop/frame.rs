//! Call scratch frames and their free-list pool
//!
//! A frame carries the native argument slots, their ABI tags and every
//! temporary allocation made while converting one call. Frames are reset
//! on release but keep their capacity, so steady-state calls allocate
//! nothing for slots or records.

use super::types::{AbiType, FfiValue};
use crate::closure::Closure;
use crate::script::{ScriptState, Value};
use crate::types::{ArgFlags, ArgType};
use core::ffi::c_void;
use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::os::raw::c_char;
use std::rc::Rc;

/// Per-signature-entry bookkeeping shared by both conversion passes
#[derive(Debug, Clone)]
pub struct ArgRecord {
    pub ty: ArgType,
    pub flags: ArgFlags,
    /// First native slot of this entry
    pub slot: usize,
    pub is_output: bool,
}

/// Temporary storage freed when the frame is released
pub(crate) enum AuxBlock {
    Cell(Box<FfiValue>),
    Bytes(Box<[u64]>),
    String(CString),
    Strings(Vec<CString>, Box<[*const c_char]>),
    Value(Box<Value>),
    Closure(Closure),
}

#[derive(Default)]
pub struct CallFrame {
    pub(crate) state: Option<ScriptState>,
    pub(crate) function: Option<Rc<str>>,
    /// Slot 0 holds the return value
    pub(crate) slots: Vec<FfiValue>,
    pub(crate) abi_types: Vec<AbiType>,
    pub(crate) args: Vec<ArgRecord>,
    pub(crate) aux: Vec<AuxBlock>,
    /// Fixed argument count when a variadic tail is present
    pub(crate) fixed_args: Option<usize>,
    pub(crate) warned: bool,
    pub(crate) trace: bool,
}

impl CallFrame {
    fn new() -> Self {
        Self {
            slots: Vec::with_capacity(8),
            abi_types: Vec::with_capacity(8),
            args: Vec::with_capacity(8),
            ..Self::default()
        }
    }

    /// Clear for reuse, keeping allocated capacity
    pub(crate) fn reset(&mut self) {
        self.state = None;
        self.function = None;
        self.slots.clear();
        self.abi_types.clear();
        self.args.clear();
        self.aux.clear();
        self.fixed_args = None;
        self.warned = false;
        self.trace = false;
    }

    pub fn slot_capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn push_slot(&mut self, abi: AbiType) -> usize {
        self.push_value(abi, FfiValue::zeroed())
    }

    pub(crate) fn push_value(&mut self, abi: AbiType, value: FfiValue) -> usize {
        self.slots.push(value);
        self.abi_types.push(abi);
        self.slots.len() - 1
    }

    /// Zeroed cell large enough for any scalar or pointer
    pub(crate) fn alloc_cell(&mut self) -> *mut c_void {
        let mut cell = Box::new(FfiValue::zeroed());
        let ptr = &mut *cell as *mut FfiValue as *mut c_void;
        self.aux.push(AuxBlock::Cell(cell));
        ptr
    }

    /// Zeroed, 8-byte aligned buffer of at least `len` bytes
    pub(crate) fn alloc_bytes(&mut self, len: usize) -> *mut u8 {
        let mut words = vec![0u64; (len + 7) / 8].into_boxed_slice();
        let ptr = words.as_mut_ptr() as *mut u8;
        self.aux.push(AuxBlock::Bytes(words));
        ptr
    }

    pub(crate) fn keep_string(&mut self, s: CString) -> *mut c_void {
        let ptr = s.as_ptr() as *mut c_void;
        self.aux.push(AuxBlock::String(s));
        ptr
    }

    /// NULL-terminated `char**` over copies of `strings`
    pub(crate) fn keep_strv(&mut self, strings: Vec<CString>) -> *mut c_void {
        let mut vector: Box<[*const c_char]> = strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let ptr = vector.as_mut_ptr() as *mut c_void;
        self.aux.push(AuxBlock::Strings(strings, vector));
        ptr
    }

    /// Opaque pointer to a boxed script value
    pub(crate) fn keep_value(&mut self, value: Value) -> *mut c_void {
        let mut boxed = Box::new(value);
        let ptr = &mut *boxed as *mut Value as *mut c_void;
        self.aux.push(AuxBlock::Value(boxed));
        ptr
    }

    pub(crate) fn keep_closure(&mut self, closure: Closure) {
        self.aux.push(AuxBlock::Closure(closure));
    }

    pub(crate) fn take_aux(&mut self) -> Vec<AuxBlock> {
        std::mem::take(&mut self.aux)
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub created: usize,
    pub reused: usize,
    pub in_flight: usize,
    pub high_water: usize,
    pub free: usize,
}

/// Free list of call frames
///
/// Not safe for concurrent use; the engine is confined to one thread.
pub struct CallPool {
    free: RefCell<Vec<CallFrame>>,
    stats: Cell<PoolStats>,
    limit: usize,
}

impl CallPool {
    /// `limit` caps how many idle frames are retained
    pub fn new(limit: usize) -> Self {
        Self {
            free: RefCell::new(Vec::new()),
            stats: Cell::new(PoolStats::default()),
            limit: limit.max(1),
        }
    }

    pub fn acquire(&self) -> CallFrame {
        let mut stats = self.stats.get();
        let frame = match self.free.borrow_mut().pop() {
            Some(frame) => {
                stats.reused += 1;
                frame
            }
            None => {
                stats.created += 1;
                CallFrame::new()
            }
        };
        stats.in_flight += 1;
        stats.high_water = stats.high_water.max(stats.in_flight);
        self.stats.set(stats);
        frame
    }

    pub fn release(&self, mut frame: CallFrame) {
        // Dropping aux blocks may finalize closures; do it before touching the list.
        let aux = frame.take_aux();
        drop(aux);
        frame.reset();

        let mut stats = self.stats.get();
        stats.in_flight = stats.in_flight.saturating_sub(1);
        self.stats.set(stats);

        let mut free = self.free.borrow_mut();
        if free.len() < self.limit {
            free.push(frame);
        }
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats.get();
        stats.free = self.free.borrow().len();
        stats
    }

    /// Largest slot capacity among idle frames
    pub fn max_idle_capacity(&self) -> usize {
        self.free
            .borrow()
            .iter()
            .map(CallFrame::slot_capacity)
            .max()
            .unwrap_or(0)
    }

    /// Drop every idle frame
    pub fn drain(&self) -> usize {
        let frames = std::mem::take(&mut *self.free.borrow_mut());
        frames.len()
    }
}

/// Returns its frame to the pool on every exit path
pub struct FrameGuard<'a> {
    pool: &'a CallPool,
    frame: CallFrame,
}

impl<'a> FrameGuard<'a> {
    pub fn new(pool: &'a CallPool) -> Self {
        Self {
            pool,
            frame: pool.acquire(),
        }
    }

    /// Detach the auxiliary blocks so they outlive the frame
    pub(crate) fn retain_aux(&mut self) -> Vec<AuxBlock> {
        self.frame.take_aux()
    }
}

impl std::ops::Deref for FrameGuard<'_> {
    type Target = CallFrame;

    fn deref(&self) -> &CallFrame {
        &self.frame
    }
}

impl std::ops::DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut CallFrame {
        &mut self.frame
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let frame = std::mem::take(&mut self.frame);
        self.pool.release(frame);
    }
}
