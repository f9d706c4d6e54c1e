//! Argument marshaling: script stack to native slots
//!
//! Walks the signature once. Entry 0 only records the return ABI; every
//! later entry is resolved, checked for an ABI mapping and a forward
//! converter, then converted into a fresh slot.

use super::frame::{ArgRecord, CallFrame};
use super::types::AbiType;
use crate::convert::{converter, ConversionContext, Converter, Forwarded};
use crate::engine::Engine;
use crate::error::{ArgumentWarning, CallError};
use crate::script::ScriptState;
use crate::types::{ArgType, FunctionDescriptor, Fundamental};
use tracing::trace;

/// Convert `state[base..end]` into `frame` according to `function`'s signature
pub(crate) fn marshal(
    engine: &Engine,
    state: &ScriptState,
    frame: &mut CallFrame,
    function: &FunctionDescriptor,
    base: usize,
    end: usize,
) -> Result<(), CallError> {
    let modules = engine.modules();
    let module = modules.module(function.module)?;
    let mut cursor = function.cursor()?;

    let (ret_ref, ret_flags) = cursor
        .decode_next()?
        .ok_or_else(|| CallError::configuration(function.name.clone(), "signature has no return entry"))?;
    let ret = modules.arg_type(ret_ref)?;
    let ret_abi = require_abi(function, &ret, 0)?;
    let slot = frame.push_slot(ret_abi);
    frame.args.push(ArgRecord {
        ty: ret,
        flags: ret_flags,
        slot,
        is_output: false,
    });

    let mut stack_index = base;
    while let Some((type_ref, flags)) = cursor.decode_next()? {
        let arg_index = cursor.entry() - 1;
        let ty = modules.arg_type(type_ref)?;

        if flags.module_bits() != 0 {
            if let Some(hook) = &module.hooks().arg_flag {
                hook(function, arg_index, flags);
            }
        }

        let forward = if ty.fundamental == Fundamental::Vararg {
            // Consumes every remaining value, zero included.
            ty.info().forward
        } else {
            require_abi(function, &ty, arg_index)?;
            if stack_index >= end && engine.config().calls.warn_missing_arguments {
                engine.warn(ArgumentWarning::MissingArgument {
                    function: function.name.clone(),
                    index: arg_index,
                });
                frame.warned = true;
            }
            ty.info().forward
        }
        .ok_or_else(|| CallError::NoForwardConversion {
            function: function.name.clone(),
            ty: ty.name().to_string(),
            index: arg_index,
        })?;

        let slot = match ty.abi() {
            Some(abi) => frame.push_slot(abi),
            None => frame.slots.len(),
        };
        frame.args.push(ArgRecord {
            ty: ty.clone(),
            flags,
            slot,
            is_output: false,
        });

        let mut ctx = ConversionContext {
            engine,
            state,
            frame: &mut *frame,
            ty: &ty,
            flags,
            function: &function.name,
            arg_index,
            slot,
            stack_index,
            stack_end: end,
            native: Default::default(),
        };
        let forwarded = forward_guarded(converter(forward), &mut ctx)?;
        trace!(
            event = "arg_forward",
            function = %function.name,
            index = arg_index,
            ty = ty.name(),
            "Argument converted"
        );
        stack_index += forwarded.script_values;
    }

    if stack_index < end && engine.config().calls.warn_extra_arguments {
        engine.warn(ArgumentWarning::ExtraArguments {
            function: function.name.clone(),
            count: end - stack_index,
        });
        frame.warned = true;
    }
    Ok(())
}

/// Run one forward conversion, restoring the stack depth it was entered at
///
/// A converter that leaves values behind is reported, not trusted; the
/// depth is restored on failure as well.
pub(super) fn forward_guarded(
    conversion: &dyn Converter,
    ctx: &mut ConversionContext<'_>,
) -> Result<Forwarded, CallError> {
    let depth = ctx.state.top();
    let result = conversion.forward(ctx);
    let after = ctx.state.top();
    if after != depth {
        ctx.state.set_top(depth);
        ctx.engine.warn(ArgumentWarning::StackLeak {
            function: ctx.function.to_string(),
            index: ctx.arg_index,
            leaked: after as isize - depth as isize,
        });
    }
    result
}

fn require_abi(function: &FunctionDescriptor, ty: &ArgType, index: usize) -> Result<AbiType, CallError> {
    ty.abi().ok_or_else(|| CallError::NoAbiMapping {
        function: function.name.clone(),
        ty: ty.name().to_string(),
        index,
    })
}
