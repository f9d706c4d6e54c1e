//! Native entry point of every bound closure
//!
//! Data flows native to script here, so arguments go through the reverse
//! converters and the script function's results through the forward ones.
//! Nothing may unwind into the native caller: every failure is caught,
//! recorded on the engine and answered with a zeroed return value.

use super::ClosureCell;
use crate::convert::{converter, ConversionContext, FieldContext};
use crate::engine::{Engine, EngineInner};
use crate::error::CallError;
use crate::interop::{AbiType, ArgRecord, FfiValue, FrameGuard};
use crate::logging;
use crate::script::ScriptState;
use crate::types::{ArgFlags, ArgType};
use core::ffi::c_void;
use libffi::low::ffi_cif;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use tracing::error;

/// Marker of a live trampoline; zeroed on finalization
pub(super) const TRAMPOLINE_MAGIC: u32 = 0x7ca1_1b4c;

pub(super) struct TrampolineData {
    pub(super) magic: Cell<u32>,
    pub(super) cell: Weak<ClosureCell>,
    pub(super) engine: Weak<EngineInner>,
    pub(super) name: Rc<str>,
    pub(super) ret: (ArgType, ArgFlags, AbiType),
    pub(super) params: Vec<(ArgType, ArgFlags, AbiType)>,
}

pub(super) unsafe extern "C" fn entry(
    _cif: &ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    data: &mut TrampolineData,
) {
    let result = result as *mut c_void;
    let data: &TrampolineData = data;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| dispatch(data, result, args)));
    if outcome.is_err() {
        error!(target: "closure", event = "callback_panic", function = %data.name, "Panic caught at the native boundary");
        zero_result(data, result);
    }
}

fn zero_result(data: &TrampolineData, result: *mut c_void) {
    let abi = data.ret.2;
    if abi != AbiType::Void {
        // SAFETY: libffi passes a return buffer sized for the return type.
        unsafe { FfiValue::zeroed().write_return(result, abi) };
    }
}

fn dispatch(data: &TrampolineData, result: *mut c_void, args: *const *const c_void) {
    let engine = data.engine.upgrade().map(Engine::from_inner);
    let cell = if data.magic.get() == TRAMPOLINE_MAGIC {
        data.cell.upgrade()
    } else {
        None
    };
    let Some(cell) = cell else {
        logging::log_closure_stale(&data.name);
        if let Some(engine) = &engine {
            engine.note_stale(&data.name);
        }
        zero_result(data, result);
        return;
    };
    let Some(engine) = engine else {
        zero_result(data, result);
        return;
    };
    engine.note_callback();

    let outcome = match cell.state.upgrade() {
        Some(state) => invoke(&engine, &cell, data, &state, result, args),
        None => Err(CallError::Callback {
            function: data.name.to_string(),
            message: "script state no longer exists".to_string(),
        }),
    };
    if let Err(err) = outcome {
        logging::log_ffi_error(&data.name, &err.to_string());
        engine.record_callback_error(err);
        zero_result(data, result);
    }
}

fn invoke(
    engine: &Engine,
    cell: &ClosureCell,
    data: &TrampolineData,
    state: &ScriptState,
    result: *mut c_void,
    args: *const *const c_void,
) -> Result<(), CallError> {
    let mut frame = FrameGuard::new(engine.pool());
    frame.state = Some(state.clone());
    frame.function = Some(data.name.clone());

    let (ret, ret_flags, ret_abi) = &data.ret;
    let slot = frame.push_slot(*ret_abi);
    frame.args.push(ArgRecord {
        ty: ret.clone(),
        flags: *ret_flags,
        slot,
        is_output: false,
    });
    for (i, (ty, flags, abi)) in data.params.iter().enumerate() {
        // SAFETY: libffi passes one pointer per declared parameter.
        let native = unsafe { FfiValue::read(*args.add(i), *abi) };
        let slot = frame.push_value(*abi, native);
        frame.args.push(ArgRecord {
            ty: ty.clone(),
            flags: *flags,
            slot,
            is_output: false,
        });
    }

    let base = state.top();
    let mut index = 1;
    while index < frame.args.len() {
        let record = frame.args[index].clone();
        let id = record.ty.info().reverse.ok_or_else(|| CallError::UnhandledReturnType {
            function: data.name.to_string(),
            ty: record.ty.name().to_string(),
        })?;
        let top = state.top();
        let native = frame.slots[record.slot];
        let mut ctx = ConversionContext {
            engine,
            state,
            frame: &mut *frame,
            ty: &record.ty,
            flags: record.flags,
            function: &data.name,
            arg_index: index,
            slot: record.slot,
            stack_index: top,
            stack_end: top,
            native,
        };
        let reversed = converter(id).reverse(&mut ctx);
        let reversed = match reversed {
            Ok(reversed) => reversed,
            Err(err) => {
                state.set_top(base);
                return Err(err);
            }
        };
        index += reversed.slots.max(1);
    }
    let arguments = state.take_from(base);

    let results = state.pcall(&cell.function, &arguments).map_err(|err| CallError::Callback {
        function: data.name.to_string(),
        message: err.message,
    })?;
    let mut results = results.into_iter();

    if *ret_abi != AbiType::Void {
        let value = results.next().unwrap_or_default();
        let id = ret.info().forward.ok_or_else(|| CallError::NoForwardConversion {
            function: data.name.to_string(),
            ty: ret.name().to_string(),
            index: 0,
        })?;
        let top = state.top();
        state.push(value);
        let mut ctx = ConversionContext {
            engine,
            state,
            frame: &mut *frame,
            ty: ret,
            flags: *ret_flags,
            function: &data.name,
            arg_index: 0,
            slot: 0,
            stack_index: top,
            stack_end: top + 1,
            native: FfiValue::zeroed(),
        };
        let forwarded = converter(id).forward(&mut ctx);
        state.set_top(top);
        forwarded?;
        // SAFETY: libffi passes a return buffer sized for the return type.
        unsafe { frame.slots[0].write_return(result, *ret_abi) };
    }

    // Remaining results fill pointer-to-value arguments in order.
    let outputs = data.params.iter().enumerate().filter(|(_, (ty, _, _))| ty.is_typed_pointer());
    for ((i, (ty, _, _)), value) in outputs.zip(results) {
        let target = frame.slots[i + 1].as_ptr();
        if target.is_null() || value.is_nil() {
            continue;
        }
        let pointee = engine.modules().pointee(ty)?;
        let id = pointee.info().field_set.ok_or_else(|| {
            CallError::configuration(data.name.to_string(), format!("cannot store through '{}'", ty.name()))
        })?;
        converter(id).field_set(&FieldContext::at(engine, &pointee, &data.name, target as *mut u8), &value)?;
    }

    cell.keep_return_temporaries(frame.retain_aux());
    Ok(())
}
