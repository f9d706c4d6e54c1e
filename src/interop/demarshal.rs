//! Return and output demarshaling: native slots back to script values
//!
//! Walks the records left by the marshaler in signature order. The return
//! value always needs a reverse converter; an argument produces a value
//! only when it is a pointer that the marshaler flagged as an output, and
//! it is read back one indirection level shallower than declared.

use super::frame::CallFrame;
use super::types::{AbiType, FfiValue};
use crate::convert::{converter, ConversionContext};
use crate::engine::Engine;
use crate::error::CallError;
use crate::script::ScriptState;
use crate::types::{ArgFlags, ArgType, FunctionDescriptor, FunctionFlags};

/// Push the call's results onto `state`; returns how many were pushed
pub(crate) fn demarshal(
    engine: &Engine,
    state: &ScriptState,
    frame: &mut CallFrame,
    function: &FunctionDescriptor,
) -> Result<usize, CallError> {
    let start = state.top();
    let mut index = 0;

    while index < frame.args.len() {
        let record = frame.args[index].clone();
        let consumed = if index == 0 {
            let mut flags = record.flags;
            if function.flags.contains(FunctionFlags::RETURNS_OWNED) {
                flags |= ArgFlags::OWNED;
            }
            let native = frame.slots[record.slot];
            reverse(engine, state, frame, function, &record.ty, flags, index, record.slot, native)?
        } else if record.is_output && record.ty.indirection() >= 1 {
            let target = engine.modules().pointee(&record.ty)?;
            let abi = target.abi().unwrap_or(AbiType::Pointer);
            let cell = frame.slots[record.slot].as_ptr();
            let native = if cell.is_null() {
                FfiValue::zeroed()
            } else {
                // SAFETY: output cells are frame-owned and sized for any scalar.
                unsafe { FfiValue::read(cell, abi) }
            };
            reverse(engine, state, frame, function, &target, record.flags, index, record.slot, native)?
        } else {
            1
        };
        index += consumed.max(1);
    }

    Ok(state.top() - start)
}

#[allow(clippy::too_many_arguments)]
fn reverse(
    engine: &Engine,
    state: &ScriptState,
    frame: &mut CallFrame,
    function: &FunctionDescriptor,
    ty: &ArgType,
    flags: ArgFlags,
    arg_index: usize,
    slot: usize,
    native: FfiValue,
) -> Result<usize, CallError> {
    let id = ty.info().reverse.ok_or_else(|| CallError::UnhandledReturnType {
        function: function.name.clone(),
        ty: ty.name().to_string(),
    })?;
    let top = state.top();
    let mut ctx = ConversionContext {
        engine,
        state,
        frame,
        ty,
        flags,
        function: &function.name,
        arg_index,
        slot,
        stack_index: top,
        stack_end: top,
        native,
    };
    Ok(converter(id).reverse(&mut ctx)?.slots)
}
