//! Stack trace adjustments for solc versions starting with 0.6.9.
//!
//! Earlier compilers mapped inline yul helpers and small internal functions
//! to the unmapped (-1) file, so a revert inside a compiler-generated check
//! was easy to recognize. Starting with 0.6.9 those instructions are mapped
//! to the Solidity source that caused their inlining, and such a revert
//! looks like an ordinary revert at the call site. Instead of relying on
//! unmapped reverts, these heuristics start from a complete stack trace and
//! rewrite its last frame when the opcodes around the revert identify a
//! compiler-generated check.

use revm_bytecode::OpCode;
use semver::Version;

use crate::{
    build_model::BytecodeError,
    message_trace::{CreateOrCallMessageRef, EvmStep, MessageTraceStep},
    solidity_stack_trace::StackTraceEntry,
};

const FIRST_SOLC_VERSION_WITH_MAPPED_SMALL_INTERNAL_FUNCTIONS: Version = Version::new(0, 6, 9);

/// Errors that can occur while adjusting a stack trace.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HeuristicsError {
    /// A program counter of the trace does not resolve to an instruction.
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    /// An invariant assumed by the adjustment was violated.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    /// The trace has not been through bytecode identification.
    #[error("Missing contract bytecode")]
    MissingBytecode,
}

pub(crate) fn stack_trace_may_require_adjustments(
    stacktrace: &[StackTraceEntry],
    trace: CreateOrCallMessageRef<'_>,
) -> Result<bool, HeuristicsError> {
    let bytecode = trace.bytecode().ok_or(HeuristicsError::MissingBytecode)?;

    let Some(last_frame) = stacktrace.last() else {
        return Ok(false);
    };

    if let StackTraceEntry::RevertError {
        is_invalid_opcode_error,
        return_data,
        ..
    } = last_frame
    {
        let result = !is_invalid_opcode_error
            && return_data.is_empty()
            && Version::parse(&bytecode.compiler_version)
                .map(|version| version >= FIRST_SOLC_VERSION_WITH_MAPPED_SMALL_INTERNAL_FUNCTIONS)
                .unwrap_or(false);
        return Ok(result);
    }

    Ok(false)
}

pub(crate) fn adjust_stack_trace(
    mut stacktrace: Vec<StackTraceEntry>,
    trace: CreateOrCallMessageRef<'_>,
) -> Result<Vec<StackTraceEntry>, HeuristicsError> {
    let Some(StackTraceEntry::RevertError {
        source_reference, ..
    }) = stacktrace.last()
    else {
        return Err(HeuristicsError::InvariantViolation(
            "Should only be called after checking that the last frame is a revert frame"
                .to_string(),
        ));
    };

    // Replace the last revert frame with an adjusted frame if needed.
    if is_non_contract_account_called_error(trace)? {
        let last_revert_frame_source_reference = source_reference.clone();
        stacktrace.pop();
        stacktrace.push(StackTraceEntry::NoncontractAccountCalledError {
            source_reference: last_revert_frame_source_reference,
        });
        return Ok(stacktrace);
    }

    if is_constructor_invalid_params_error(trace)? {
        let last_revert_frame_source_reference = source_reference.clone();
        stacktrace.pop();
        stacktrace.push(StackTraceEntry::InvalidParamsError {
            source_reference: last_revert_frame_source_reference,
        });
        return Ok(stacktrace);
    }

    if is_call_invalid_params_error(trace)? {
        let last_revert_frame_source_reference = source_reference.clone();
        stacktrace.pop();
        stacktrace.push(StackTraceEntry::InvalidParamsError {
            source_reference: last_revert_frame_source_reference,
        });

        return Ok(stacktrace);
    }

    Ok(stacktrace)
}

fn is_non_contract_account_called_error(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<bool, HeuristicsError> {
    match_opcodes(
        trace,
        -9,
        &[
            OpCode::EXTCODESIZE,
            OpCode::ISZERO,
            OpCode::DUP1,
            OpCode::ISZERO,
        ],
    )
}

fn is_constructor_invalid_params_error(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<bool, HeuristicsError> {
    Ok(match_opcodes(trace, -20, &[OpCode::CODESIZE])?
        && match_opcodes(trace, -15, &[OpCode::CODECOPY])?
        && match_opcodes(trace, -7, &[OpCode::LT, OpCode::ISZERO])?)
}

fn is_call_invalid_params_error(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<bool, HeuristicsError> {
    Ok(match_opcodes(trace, -11, &[OpCode::CALLDATASIZE])?
        && match_opcodes(trace, -7, &[OpCode::LT, OpCode::ISZERO])?)
}

fn match_opcodes(
    trace: CreateOrCallMessageRef<'_>,
    first_step_index: i32,
    opcodes: &[OpCode],
) -> Result<bool, HeuristicsError> {
    let bytecode = trace.bytecode().ok_or(HeuristicsError::MissingBytecode)?;
    let steps = trace.steps();

    // A negative index is counted from the end of the trace.
    let mut index = match first_step_index {
        0.. => first_step_index as usize,
        ..=-1 if first_step_index.abs() < steps.len() as i32 => {
            (steps.len() as i32 + first_step_index) as usize
        }
        // Out of bounds
        _ => return Ok(false),
    };

    for opcode in opcodes {
        let Some(MessageTraceStep::Evm(EvmStep { pc })) = steps.get(index) else {
            return Ok(false);
        };

        let instruction = bytecode.get_instruction(*pc)?;

        if instruction.opcode != *opcode {
            return Ok(false);
        }

        index += 1;
    }

    Ok(true)
}
