use std::{collections::HashSet, mem};

use revm_bytecode::OpCode;
use semver::Version;

use crate::{
    build_model::{
        Bytecode, BytecodeError, ContractFunction, ContractFunctionType, ContractKind, Instruction,
        JumpType, SourceLocation,
    },
    message_trace::{
        CallMessageTrace, CreateMessageTrace, CreateOrCallMessageRef, MessageTrace,
        MessageTraceStep,
    },
    solidity_stack_trace::{
        CONSTRUCTOR_FUNCTION_NAME, FALLBACK_FUNCTION_NAME, RECEIVE_FUNCTION_NAME, SourceReference,
        StackTraceEntry,
    },
};

/// The first solc version that validates the length of constructor arguments
/// before running the constructor.
const FIRST_SOLC_VERSION_CREATE_PARAMS_VALIDATION: Version = Version::new(0, 5, 9);

/// Specifies whether a heuristic was applied and modified the stack trace.
///
/// Think of it as a happy [`Result`]: a [`Heuristic::Hit`] should be
/// propagated to the caller.
#[must_use]
pub(crate) enum Heuristic {
    /// The heuristic was applied and modified the stack trace.
    Hit(Vec<StackTraceEntry>),
    /// The heuristic did not apply; the stack trace is unchanged.
    Miss(Vec<StackTraceEntry>),
}

/// The last inner message of a frame and the stack trace inferred for it.
pub(crate) struct SubmessageData<'a> {
    pub message_trace: &'a MessageTrace,
    pub stacktrace: Vec<StackTraceEntry>,
    pub step_index: u32,
}

/// Errors that can occur during the inference of the stack trace.
///
/// These indicate malformed input traces rather than unsupported Solidity
/// constructs.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InferrerError {
    /// A program counter of the trace does not resolve to an instruction.
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    /// Invalid input or logic error: expected an EVM step.
    #[error("Expected an EVM step")]
    ExpectedEvmStep,
    /// An invariant assumed by the inference was violated.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    /// The trace has not been through bytecode identification.
    #[error("Missing contract bytecode")]
    MissingBytecode,
    /// A call trace jumped into a function without recording its jumpdest.
    #[error("Call trace has no function jumpdest but has already jumped into a function")]
    MissingFunctionJumpdest,
    /// An entry that must carry a source reference could not resolve one.
    #[error("Missing source reference")]
    MissingSourceReference,
}

/// Drops frames that only restate the frame that follows them, e.g. the
/// dispatcher frame of the function a revert already points into.
pub(crate) fn filter_redundant_frames(stacktrace: Vec<StackTraceEntry>) -> Vec<StackTraceEntry> {
    let retained_indices: HashSet<_> = stacktrace
        .iter()
        .enumerate()
        .filter(|&(index, frame)| {
            let Some(next_frame) = stacktrace.get(index + 1) else {
                return true;
            };

            // Frames can only be filtered when both source references are
            // known.
            let (Some(frame_source), Some(next_frame_source)) =
                (frame.source_reference(), next_frame.source_reference())
            else {
                return true;
            };

            // Two frames ahead: solc 0.8.5 emits a redundant callstack frame
            // before a returndata size check.
            if let (
                StackTraceEntry::Callstack {
                    source_reference, ..
                },
                Some(StackTraceEntry::ReturndataSizeError {
                    source_reference: next_next_source_reference,
                    ..
                }),
            ) = (frame, stacktrace.get(index + 2))
                && source_reference.range == next_next_source_reference.range
                && source_reference.line == next_next_source_reference.line
            {
                return false;
            }

            if frame_source.function.as_deref() == Some(CONSTRUCTOR_FUNCTION_NAME)
                && next_frame_source.function.as_deref() != Some(CONSTRUCTOR_FUNCTION_NAME)
            {
                return true;
            }

            // This is probably a recursive call.
            if index > 0
                && mem::discriminant(frame) == mem::discriminant(next_frame)
                && frame_source.range == next_frame_source.range
                && frame_source.line == next_frame_source.line
            {
                return true;
            }

            if frame_source.range.0 <= next_frame_source.range.0
                && frame_source.range.1 >= next_frame_source.range.1
            {
                return false;
            }

            true
        })
        .map(|(index, _)| index)
        .collect();

    stacktrace
        .into_iter()
        .enumerate()
        .filter(|(index, _)| retained_indices.contains(index))
        .map(|(_, frame)| frame)
        .collect()
}

pub(crate) fn infer_after_tracing(
    trace: CreateOrCallMessageRef<'_>,
    stacktrace: Vec<StackTraceEntry>,
    function_jumpdests: &[&Instruction],
    jumped_into_function: bool,
    last_submessage_data: Option<SubmessageData<'_>>,
) -> Result<Vec<StackTraceEntry>, InferrerError> {
    /// Convenience macro to early return the result if a heuristic hits.
    macro_rules! return_if_hit {
        ($heuristic: expr) => {
            match $heuristic {
                Heuristic::Hit(stacktrace) => return Ok(stacktrace),
                Heuristic::Miss(stacktrace) => stacktrace,
            }
        };
    }

    let result = check_last_submessage(trace, stacktrace, last_submessage_data)?;
    let stacktrace = return_if_hit!(result);

    let result = check_failed_last_call(trace, stacktrace)?;
    let stacktrace = return_if_hit!(result);

    let result =
        check_last_instruction(trace, stacktrace, function_jumpdests, jumped_into_function)?;
    let stacktrace = return_if_hit!(result);

    let result = check_non_contract_called(trace, stacktrace)?;
    let stacktrace = return_if_hit!(result);

    other_execution_error_stacktrace(trace, stacktrace)
}

pub(crate) fn infer_before_tracing_call_message(
    trace: &CallMessageTrace,
) -> Result<Option<Vec<StackTraceEntry>>, InferrerError> {
    if is_direct_library_call(trace)? {
        return Ok(Some(get_direct_library_call_error_stack_trace(trace)?));
    }

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    let called_function = contract.get_function_from_selector(calldata_selector(&trace.calldata));

    if let Some(called_function) = called_function
        && is_function_not_payable_error(trace, called_function)?
    {
        return Ok(Some(vec![StackTraceEntry::FunctionNotPayableError {
            source_reference: get_function_start_source_reference(trace.into(), called_function)?,
            value: trace.value(),
        }]));
    }

    let called_function = called_function.map(AsRef::as_ref);

    if is_missing_function_and_fallback_error(trace, called_function)? {
        return Ok(Some(vec![
            StackTraceEntry::UnrecognizedFunctionWithoutFallbackError {
                source_reference: get_contract_start_without_function_source_reference(
                    trace.into(),
                )?,
            },
        ]));
    }

    if is_fallback_not_payable_error(trace, called_function)? {
        return Ok(Some(vec![StackTraceEntry::FallbackNotPayableError {
            source_reference: get_fallback_start_source_reference(trace)?,
            value: trace.value(),
        }]));
    }

    Ok(None)
}

pub(crate) fn infer_before_tracing_create_message(
    trace: &CreateMessageTrace,
) -> Result<Option<Vec<StackTraceEntry>>, InferrerError> {
    if is_constructor_not_payable_error(trace)? {
        return Ok(Some(vec![StackTraceEntry::FunctionNotPayableError {
            source_reference: get_constructor_start_source_reference(trace)?,
            value: trace.value(),
        }]));
    }

    if is_constructor_invalid_arguments_error(trace)? {
        return Ok(Some(vec![StackTraceEntry::InvalidParamsError {
            source_reference: get_constructor_start_source_reference(trace)?,
        }]));
    }

    Ok(None)
}

pub(crate) fn instruction_to_callstack_stack_trace_entry(
    bytecode: &Bytecode,
    inst: &Instruction,
) -> Result<StackTraceEntry, InferrerError> {
    let contract = bytecode.contract.read();

    // Jumps within internal solc functions are normally made from yul code,
    // so they don't map to any Solidity function. Point the frame at the
    // contract itself.
    let inst_location = match &inst.location {
        None => {
            let location = &contract.location;
            let file = location.file().ok_or(InferrerError::MissingSourceReference)?;
            let file = file.read();

            return Ok(StackTraceEntry::Callstack {
                source_reference: SourceReference {
                    source_name: file.source_name.clone(),
                    source_content: file.content.clone(),
                    contract: Some(contract.name.clone()),
                    function: None,
                    line: location.get_starting_line_number(),
                    range: (location.offset, location.offset + location.length),
                },
                function_type: ContractFunctionType::Function,
            });
        }
        Some(inst_location) => inst_location,
    };

    if let Some(func) = inst_location.get_containing_function() {
        let source_reference = source_location_to_source_reference(bytecode, Some(inst_location))
            .ok_or(InferrerError::MissingSourceReference)?;

        return Ok(StackTraceEntry::Callstack {
            source_reference,
            function_type: func.r#type,
        });
    }

    let file = inst_location
        .file()
        .ok_or(InferrerError::MissingSourceReference)?;
    let file = file.read();

    Ok(StackTraceEntry::Callstack {
        source_reference: SourceReference {
            source_name: file.source_name.clone(),
            source_content: file.content.clone(),
            contract: Some(contract.name.clone()),
            function: None,
            line: inst_location.get_starting_line_number(),
            range: (
                inst_location.offset,
                inst_location.offset + inst_location.length,
            ),
        },
        function_type: ContractFunctionType::Function,
    })
}

/// The selector part of the calldata. Short calldata is returned whole.
fn calldata_selector(calldata: &[u8]) -> &[u8] {
    calldata.get(..4).unwrap_or(calldata)
}

fn call_instruction_to_call_failed_to_execute_stack_trace_entry(
    bytecode: &Bytecode,
    call_inst: &Instruction,
) -> Result<StackTraceEntry, InferrerError> {
    // Calls only happen within functions.
    let source_reference =
        source_location_to_source_reference(bytecode, call_inst.location.as_deref())
            .ok_or(InferrerError::MissingSourceReference)?;

    Ok(StackTraceEntry::CallFailedError { source_reference })
}

/// Check if the last call or create the frame made never started executing.
fn check_failed_last_call(
    trace: CreateOrCallMessageRef<'_>,
    stacktrace: Vec<StackTraceEntry>,
) -> Result<Heuristic, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let steps = trace.steps();

    if steps.is_empty() {
        return Ok(Heuristic::Miss(stacktrace));
    }

    for step_index in (0..steps.len() - 1).rev() {
        let (Some(MessageTraceStep::Evm(step)), Some(next_step)) =
            (steps.get(step_index), steps.get(step_index + 1))
        else {
            return Ok(Heuristic::Miss(stacktrace));
        };

        let inst = bytecode.get_instruction(step.pc)?;

        if matches!(inst.opcode, OpCode::CALL | OpCode::CREATE)
            && matches!(next_step, MessageTraceStep::Evm(_))
            && is_call_failed_error(trace, step_index as u32, inst)?
        {
            let mut inferred_stacktrace = stacktrace.clone();
            inferred_stacktrace.push(
                call_instruction_to_call_failed_to_execute_stack_trace_entry(bytecode, inst)?,
            );

            return fix_initial_modifier(trace, inferred_stacktrace).map(Heuristic::Hit);
        }
    }

    Ok(Heuristic::Miss(stacktrace))
}

fn check_last_instruction(
    trace: CreateOrCallMessageRef<'_>,
    stacktrace: Vec<StackTraceEntry>,
    function_jumpdests: &[&Instruction],
    jumped_into_function: bool,
) -> Result<Heuristic, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let steps = trace.steps();

    if steps.is_empty() {
        return Ok(Heuristic::Miss(stacktrace));
    }

    let last_step = match steps.last() {
        Some(MessageTraceStep::Evm(step)) => step,
        _ => {
            return Err(InferrerError::InvariantViolation(
                "The trace ends with a message step".to_string(),
            ));
        }
    };

    let last_instruction = bytecode.get_instruction(last_step.pc)?;

    let revert_or_invalid_stacktrace = check_revert_or_invalid_opcode(
        trace,
        stacktrace,
        last_instruction,
        function_jumpdests,
        jumped_into_function,
    )?;
    let stacktrace = match revert_or_invalid_stacktrace {
        hit @ Heuristic::Hit(..) => return Ok(hit),
        Heuristic::Miss(stacktrace) => stacktrace,
    };

    let (CreateOrCallMessageRef::Call(call), false) = (trace, jumped_into_function) else {
        return Ok(Heuristic::Miss(stacktrace));
    };

    if has_failed_inside_the_fallback_function(call)?
        || has_failed_inside_the_receive_function(call)?
    {
        let frame = instruction_within_function_to_revert_stack_trace_entry(trace, last_instruction)?;

        return Ok(Heuristic::Hit(vec![frame]));
    }

    // Sometimes the execution fails inside a function without ever jumping
    // into it.
    if let Some(location) = &last_instruction.location
        && let Some(failing_function) = location.get_containing_function()
    {
        let frame = StackTraceEntry::RevertError {
            source_reference: get_function_start_source_reference(trace, &failing_function)?,
            return_data: call.return_data().clone(),
            is_invalid_opcode_error: last_instruction.opcode == OpCode::INVALID,
        };

        return Ok(Heuristic::Hit(vec![frame]));
    }

    let contract = bytecode.contract.read();
    let called_function = contract.get_function_from_selector(calldata_selector(&call.calldata));

    if let Some(called_function) = called_function {
        // The dispatcher found the function but bailed before jumping into
        // it, so the calldata cannot have matched the parameters.
        let frame = StackTraceEntry::InvalidParamsError {
            source_reference: get_function_start_source_reference(trace, called_function)?,
        };

        return Ok(Heuristic::Hit(vec![frame]));
    }

    let frame = StackTraceEntry::OtherExecutionError {
        source_reference: Some(get_contract_start_without_function_source_reference(trace)?),
    };

    Ok(Heuristic::Hit(vec![frame]))
}

/// Check if the last submessage can be used to generate the stack trace.
fn check_last_submessage(
    trace: CreateOrCallMessageRef<'_>,
    mut stacktrace: Vec<StackTraceEntry>,
    last_submessage_data: Option<SubmessageData<'_>>,
) -> Result<Heuristic, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let steps = trace.steps();

    let Some(last_submessage_data) = last_submessage_data else {
        return Ok(Heuristic::Miss(stacktrace));
    };

    // Get the instruction before the submessage and add it to the stack
    // trace.
    let call_step = match steps.get(last_submessage_data.step_index as usize - 1) {
        Some(MessageTraceStep::Evm(call_step)) => call_step,
        _ => {
            return Err(InferrerError::InvariantViolation(
                "A message step should be preceded by an EVM step".to_string(),
            ));
        }
    };

    let call_inst = bytecode.get_instruction(call_step.pc)?;
    let call_stack_frame = instruction_to_callstack_stack_trace_entry(bytecode, call_inst)?;
    let call_stack_frame_source_reference = call_stack_frame
        .source_reference()
        .cloned()
        .ok_or_else(|| {
            InferrerError::InvariantViolation(
                "Callstack entry must have a source reference".to_string(),
            )
        })?;

    if last_submessage_data.message_trace.exit_code().is_error() {
        if is_subtrace_error_propagated(trace, last_submessage_data.step_index)?
            || is_proxy_error_propagated(trace, last_submessage_data.step_index)?
        {
            // The submessage error was propagated up; its own stack trace
            // explains the failure.
            stacktrace.push(call_stack_frame);
            stacktrace.extend(last_submessage_data.stacktrace);

            return fix_initial_modifier(trace, stacktrace).map(Heuristic::Hit);
        }
    } else if fails_right_after_call(trace, last_submessage_data.step_index)? {
        // The submessage succeeded but the caller reverted immediately after
        // it: decoding the returned data must have failed.
        stacktrace.push(StackTraceEntry::ReturndataSizeError {
            source_reference: call_stack_frame_source_reference,
        });

        return fix_initial_modifier(trace, stacktrace).map(Heuristic::Hit);
    }

    Ok(Heuristic::Miss(stacktrace))
}

fn check_non_contract_called(
    trace: CreateOrCallMessageRef<'_>,
    mut stacktrace: Vec<StackTraceEntry>,
) -> Result<Heuristic, InferrerError> {
    if is_called_non_contract_account_error(trace)? {
        // There was at least a call instruction, so the source reference is
        // always resolvable.
        let source_reference = get_last_source_reference(trace)?.ok_or_else(|| {
            InferrerError::InvariantViolation("Expected a source reference to be found".to_string())
        })?;

        stacktrace.push(StackTraceEntry::NoncontractAccountCalledError { source_reference });

        Ok(Heuristic::Hit(stacktrace))
    } else {
        Ok(Heuristic::Miss(stacktrace))
    }
}

/// Check if the execution stopped with a revert or an invalid opcode.
fn check_revert_or_invalid_opcode(
    trace: CreateOrCallMessageRef<'_>,
    stacktrace: Vec<StackTraceEntry>,
    last_instruction: &Instruction,
    function_jumpdests: &[&Instruction],
    jumped_into_function: bool,
) -> Result<Heuristic, InferrerError> {
    match last_instruction.opcode {
        OpCode::REVERT | OpCode::INVALID => {}
        _ => return Ok(Heuristic::Miss(stacktrace)),
    }

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let return_data = trace.return_data();
    let is_invalid_opcode_error = last_instruction.opcode == OpCode::INVALID;

    let mut inferred_stacktrace = stacktrace.clone();

    if let Some(location) = &last_instruction.location
        && (jumped_into_function || matches!(trace, CreateOrCallMessageRef::Create(_)))
    {
        // There should always be a function here, but that's not the case
        // with optimizations.
        //
        // If this is a create trace, we already checked the constructor
        // failures before running the steps. If it's a call trace, we
        // already jumped into a function. But optimizations can break both
        // assumptions.
        let failing_function = location.get_containing_function();

        // If the failure is in a modifier, add an entry with the function
        // the modifier belongs to.
        if let Some(func) = &failing_function
            && func.r#type == ContractFunctionType::Modifier
        {
            let frame = get_entry_before_failure_in_modifier(trace, function_jumpdests)?;
            inferred_stacktrace.push(frame);
        }

        if failing_function.is_some() {
            let frame =
                instruction_within_function_to_revert_stack_trace_entry(trace, last_instruction)?;
            inferred_stacktrace.push(frame);
        } else {
            match trace {
                CreateOrCallMessageRef::Call(call) => {
                    let contract = bytecode.contract.read();
                    let function = contract
                        .get_function_from_selector(calldata_selector(&call.calldata));

                    // In general a function should match, but it does not
                    // when viaIR is enabled with aggressive optimizer steps
                    // and the called function is a fallback or receive.
                    let Some(function) = function else {
                        return Ok(Heuristic::Miss(inferred_stacktrace));
                    };

                    inferred_stacktrace.push(StackTraceEntry::RevertError {
                        source_reference: get_function_start_source_reference(trace, function)?,
                        return_data: return_data.clone(),
                        is_invalid_opcode_error,
                    });
                }
                CreateOrCallMessageRef::Create(create) => {
                    inferred_stacktrace.push(StackTraceEntry::RevertError {
                        source_reference: get_constructor_start_source_reference(create)?,
                        return_data: return_data.clone(),
                        is_invalid_opcode_error,
                    });
                }
            }
        }

        return fix_initial_modifier(trace, inferred_stacktrace).map(Heuristic::Hit);
    }

    // If the revert instruction is not mapped but there is return data, add
    // the frame anyway, with the best source reference available.
    if last_instruction.location.is_none() && !return_data.is_empty() {
        inferred_stacktrace.push(StackTraceEntry::RevertError {
            source_reference: get_contract_start_without_function_source_reference(trace)?,
            return_data: return_data.clone(),
            is_invalid_opcode_error,
        });

        return fix_initial_modifier(trace, inferred_stacktrace).map(Heuristic::Hit);
    }

    Ok(Heuristic::Miss(stacktrace))
}

fn fails_right_after_call(
    trace: CreateOrCallMessageRef<'_>,
    call_subtrace_step_index: u32,
) -> Result<bool, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let steps = trace.steps();

    let Some(MessageTraceStep::Evm(last_step)) = steps.last() else {
        return Ok(false);
    };

    let last_inst = bytecode.get_instruction(last_step.pc)?;
    if last_inst.opcode != OpCode::REVERT {
        return Ok(false);
    }

    let call_opcode_step = match steps.get(call_subtrace_step_index as usize - 1) {
        Some(MessageTraceStep::Evm(step)) => step,
        _ => return Err(InferrerError::ExpectedEvmStep),
    };
    let call_inst = bytecode.get_instruction(call_opcode_step.pc)?;

    // Calls are always made from within functions.
    let call_inst_location = call_inst.location.as_deref().ok_or_else(|| {
        InferrerError::InvariantViolation(
            "Expected the call instruction location to be defined".to_string(),
        )
    })?;

    is_last_location(trace, call_subtrace_step_index + 1, call_inst_location)
}

fn fix_initial_modifier(
    trace: CreateOrCallMessageRef<'_>,
    mut stacktrace: Vec<StackTraceEntry>,
) -> Result<Vec<StackTraceEntry>, InferrerError> {
    if let Some(StackTraceEntry::Callstack {
        function_type: ContractFunctionType::Modifier,
        ..
    }) = stacktrace.first()
    {
        let entry_before_initial_modifier =
            get_entry_before_initial_modifier_callstack_entry(trace)?;

        stacktrace.insert(0, entry_before_initial_modifier);
    }

    Ok(stacktrace)
}

fn get_constructor_start_source_reference(
    trace: &CreateMessageTrace,
) -> Result<SourceReference, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();
    let contract_location = &contract.location;

    let line = match &contract.constructor {
        Some(constructor) => constructor.location.get_starting_line_number(),
        None => contract_location.get_starting_line_number(),
    };

    let file = contract_location
        .file()
        .ok_or(InferrerError::MissingSourceReference)?;
    let file = file.read();

    Ok(SourceReference {
        source_name: file.source_name.clone(),
        source_content: file.content.clone(),
        contract: Some(contract.name.clone()),
        function: Some(CONSTRUCTOR_FUNCTION_NAME.to_string()),
        line,
        range: (
            contract_location.offset,
            contract_location.offset + contract_location.length,
        ),
    })
}

fn get_contract_start_without_function_source_reference(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<SourceReference, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    let location = &contract.location;
    let file = location.file().ok_or(InferrerError::MissingSourceReference)?;
    let file = file.read();

    Ok(SourceReference {
        source_name: file.source_name.clone(),
        source_content: file.content.clone(),
        contract: Some(contract.name.clone()),
        function: None,
        line: location.get_starting_line_number(),
        range: (location.offset, location.offset + location.length),
    })
}

fn get_direct_library_call_error_stack_trace(
    trace: &CallMessageTrace,
) -> Result<Vec<StackTraceEntry>, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    let func = contract.get_function_from_selector(calldata_selector(&trace.calldata));

    let source_reference = match func {
        Some(func) => get_function_start_source_reference(trace.into(), func)?,
        None => get_contract_start_without_function_source_reference(trace.into())?,
    };

    Ok(vec![StackTraceEntry::DirectLibraryCallError {
        source_reference,
    }])
}

fn get_entry_before_failure_in_modifier(
    trace: CreateOrCallMessageRef<'_>,
    function_jumpdests: &[&Instruction],
) -> Result<StackTraceEntry, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;

    // If there is a jumpdest, the modifier belongs to the last function that
    // it represents.
    if let Some(last_jumpdest) = function_jumpdests.last() {
        return instruction_to_callstack_stack_trace_entry(bytecode, last_jumpdest);
    }

    let trace = match trace {
        // This function is only called after jumping into the initial
        // function in call traces, so there should always be at least one
        // function jumpdest.
        CreateOrCallMessageRef::Call(_) => return Err(InferrerError::MissingFunctionJumpdest),
        CreateOrCallMessageRef::Create(create) => create,
    };

    // If there is no jumpdest, point to the constructor.
    Ok(StackTraceEntry::Callstack {
        source_reference: get_constructor_start_source_reference(trace)?,
        function_type: ContractFunctionType::Constructor,
    })
}

fn get_entry_before_initial_modifier_callstack_entry(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<StackTraceEntry, InferrerError> {
    let trace = match trace {
        CreateOrCallMessageRef::Create(create) => {
            return Ok(StackTraceEntry::Callstack {
                source_reference: get_constructor_start_source_reference(create)?,
                function_type: ContractFunctionType::Constructor,
            });
        }
        CreateOrCallMessageRef::Call(call) => call,
    };

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    let called_function = if trace.calldata.is_empty() {
        // If there is no selector, it must be a transfer.
        contract.receive.as_ref()
    } else {
        contract.get_function_from_selector(calldata_selector(&trace.calldata))
    };

    let source_reference = match called_function {
        Some(called_function) => get_function_start_source_reference(trace.into(), called_function)?,
        None => get_fallback_start_source_reference(trace)?,
    };

    let function_type = match called_function {
        Some(_) => ContractFunctionType::Function,
        None => ContractFunctionType::Fallback,
    };

    Ok(StackTraceEntry::Callstack {
        source_reference,
        function_type,
    })
}

fn get_fallback_start_source_reference(
    trace: &CallMessageTrace,
) -> Result<SourceReference, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    let func = contract.fallback.as_ref().ok_or_else(|| {
        InferrerError::InvariantViolation(
            "Trying to get a fallback source reference from a contract without fallback"
                .to_string(),
        )
    })?;

    let location = &func.location;
    let file = location.file().ok_or(InferrerError::MissingSourceReference)?;
    let file = file.read();

    Ok(SourceReference {
        source_name: file.source_name.clone(),
        source_content: file.content.clone(),
        contract: Some(contract.name.clone()),
        function: Some(FALLBACK_FUNCTION_NAME.to_string()),
        line: location.get_starting_line_number(),
        range: (location.offset, location.offset + location.length),
    })
}

fn get_function_start_source_reference(
    trace: CreateOrCallMessageRef<'_>,
    func: &ContractFunction,
) -> Result<SourceReference, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    let location = &func.location;
    let file = location.file().ok_or(InferrerError::MissingSourceReference)?;
    let file = file.read();

    Ok(SourceReference {
        source_name: file.source_name.clone(),
        source_content: file.content.clone(),
        contract: Some(contract.name.clone()),
        function: Some(func.name.clone()),
        line: location.get_starting_line_number(),
        range: (location.offset, location.offset + location.length),
    })
}

fn get_last_instruction_with_valid_location_step_index(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<Option<u32>, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;

    for (index, step) in trace.steps().iter().enumerate().rev() {
        let MessageTraceStep::Evm(step) = step else {
            return Ok(None);
        };

        let inst = bytecode.get_instruction(step.pc)?;

        if inst.location.is_some() {
            return Ok(Some(index as u32));
        }
    }

    Ok(None)
}

fn get_last_source_reference(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<Option<SourceReference>, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;

    for step in trace.steps().iter().rev() {
        let MessageTraceStep::Evm(step) = step else {
            continue;
        };

        let inst = bytecode.get_instruction(step.pc)?;

        let Some(location) = &inst.location else {
            continue;
        };

        if let Some(source_reference) =
            source_location_to_source_reference(bytecode, Some(location))
        {
            return Ok(Some(source_reference));
        }
    }

    Ok(None)
}

fn has_failed_inside_the_fallback_function(
    trace: &CallMessageTrace,
) -> Result<bool, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    match &contract.fallback {
        Some(fallback) => has_failed_inside_function(trace, fallback),
        None => Ok(false),
    }
}

fn has_failed_inside_the_receive_function(trace: &CallMessageTrace) -> Result<bool, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    match &contract.receive {
        Some(receive) => has_failed_inside_function(trace, receive),
        None => Ok(false),
    }
}

fn has_failed_inside_function(
    trace: &CallMessageTrace,
    func: &ContractFunction,
) -> Result<bool, InferrerError> {
    let last_step = match trace.steps().last() {
        Some(MessageTraceStep::Evm(step)) => step,
        Some(MessageTraceStep::Message(_)) => return Err(InferrerError::ExpectedEvmStep),
        None => {
            return Err(InferrerError::InvariantViolation(
                "There should be at least one step".to_string(),
            ));
        }
    };

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let last_instruction = bytecode.get_instruction(last_step.pc)?;

    Ok(match &last_instruction.location {
        Some(last_instruction_location) => {
            last_instruction.opcode == OpCode::REVERT
                && func.location.contains(last_instruction_location)
        }
        None => false,
    })
}

fn instruction_within_function_to_revert_stack_trace_entry(
    trace: CreateOrCallMessageRef<'_>,
    inst: &Instruction,
) -> Result<StackTraceEntry, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;

    let source_reference = source_location_to_source_reference(bytecode, inst.location.as_deref())
        .ok_or(InferrerError::MissingSourceReference)?;

    Ok(StackTraceEntry::RevertError {
        source_reference,
        is_invalid_opcode_error: inst.opcode == OpCode::INVALID,
        return_data: trace.return_data().clone(),
    })
}

fn is_called_non_contract_account_error(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<bool, InferrerError> {
    // This could check that the last valid location maps to a call, but that
    // would require resolving the AST node of the location.

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let steps = trace.steps();

    let last_index = match get_last_instruction_with_valid_location_step_index(trace)? {
        None | Some(0) => return Ok(false),
        Some(last_index) => last_index as usize,
    };

    let last_step = match steps.get(last_index) {
        Some(MessageTraceStep::Evm(step)) => step,
        _ => return Err(InferrerError::ExpectedEvmStep),
    };

    let last_inst = bytecode.get_instruction(last_step.pc)?;

    if last_inst.opcode != OpCode::ISZERO {
        return Ok(false);
    }

    let prev_step = match steps.get(last_index - 1) {
        Some(MessageTraceStep::Evm(step)) => step,
        _ => return Err(InferrerError::ExpectedEvmStep),
    };

    let prev_inst = bytecode.get_instruction(prev_step.pc)?;

    Ok(prev_inst.opcode == OpCode::EXTCODESIZE)
}

fn is_call_failed_error(
    trace: CreateOrCallMessageRef<'_>,
    inst_index: u32,
    call_instruction: &Instruction,
) -> Result<bool, InferrerError> {
    let call_location = call_instruction.location.as_deref().ok_or_else(|| {
        InferrerError::InvariantViolation("Expected the call location to be defined".to_string())
    })?;

    is_last_location(trace, inst_index, call_location)
}

fn is_constructor_invalid_arguments_error(
    trace: &CreateMessageTrace,
) -> Result<bool, InferrerError> {
    if !trace.return_data().is_empty() {
        return Ok(false);
    }

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    // This check only matters for contracts with an explicit constructor.
    // The rest are either abstract or take no constructor arguments.
    let Some(constructor) = &contract.constructor else {
        return Ok(false);
    };

    let Ok(version) = Version::parse(&bytecode.compiler_version) else {
        return Ok(false);
    };
    if version < FIRST_SOLC_VERSION_CREATE_PARAMS_VALIDATION {
        return Ok(false);
    }

    let Some(MessageTraceStep::Evm(last_step)) = trace.steps().last() else {
        return Ok(false);
    };

    let last_inst = bytecode.get_instruction(last_step.pc)?;

    if last_inst.opcode != OpCode::REVERT || last_inst.location.is_some() {
        return Ok(false);
    }

    let mut has_read_deployment_code_size = false;
    for step in trace.steps() {
        let MessageTraceStep::Evm(step) = step else {
            return Ok(false);
        };

        let inst = bytecode.get_instruction(step.pc)?;

        if let Some(inst_location) = &inst.location
            && contract.location != *inst_location
            && constructor.location != *inst_location
        {
            return Ok(false);
        }

        if inst.opcode == OpCode::CODESIZE {
            has_read_deployment_code_size = true;
        }
    }

    Ok(has_read_deployment_code_size)
}

fn is_constructor_not_payable_error(trace: &CreateMessageTrace) -> Result<bool, InferrerError> {
    // This error doesn't return data.
    if !trace.return_data().is_empty() {
        return Ok(false);
    }

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    // This check only matters for contracts with an explicit constructor.
    let Some(constructor) = &contract.constructor else {
        return Ok(false);
    };

    if trace.value().is_zero() {
        return Ok(false);
    }

    Ok(constructor.is_payable != Some(true))
}

fn is_direct_library_call(trace: &CallMessageTrace) -> Result<bool, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    Ok(trace.depth() == 0 && contract.r#type == ContractKind::Library)
}

fn is_fallback_not_payable_error(
    trace: &CallMessageTrace,
    called_function: Option<&ContractFunction>,
) -> Result<bool, InferrerError> {
    // This error doesn't return data.
    if !trace.return_data().is_empty() {
        return Ok(false);
    }

    if trace.value().is_zero() {
        return Ok(false);
    }

    // The called function exists in the contract.
    if called_function.is_some() {
        return Ok(false);
    }

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    match &contract.fallback {
        Some(fallback) => Ok(fallback.is_payable != Some(true)),
        None => Ok(false),
    }
}

fn is_function_not_payable_error(
    trace: &CallMessageTrace,
    called_function: &ContractFunction,
) -> Result<bool, InferrerError> {
    // This error doesn't return data.
    if !trace.return_data().is_empty() {
        return Ok(false);
    }

    if trace.value().is_zero() {
        return Ok(false);
    }

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    // Libraries don't have a nonpayable check.
    if contract.r#type == ContractKind::Library {
        return Ok(false);
    }

    Ok(called_function.is_payable != Some(true))
}

fn is_last_location(
    trace: CreateOrCallMessageRef<'_>,
    from_step: u32,
    location: &SourceLocation,
) -> Result<bool, InferrerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;

    for step in trace.steps().iter().skip(from_step as usize) {
        let MessageTraceStep::Evm(step) = step else {
            return Ok(false);
        };

        let step_inst = bytecode.get_instruction(step.pc)?;

        if let Some(step_inst_location) = &step_inst.location
            && **step_inst_location != *location
        {
            return Ok(false);
        }
    }

    Ok(true)
}

fn is_missing_function_and_fallback_error(
    trace: &CallMessageTrace,
    called_function: Option<&ContractFunction>,
) -> Result<bool, InferrerError> {
    // This error doesn't return data.
    if !trace.return_data().is_empty() {
        return Ok(false);
    }

    // The called function exists in the contract.
    if called_function.is_some() {
        return Ok(false);
    }

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let contract = bytecode.contract.read();

    // There is a receive function and no calldata.
    if trace.calldata.is_empty() && contract.receive.is_some() {
        return Ok(false);
    }

    Ok(contract.fallback.is_none())
}

fn is_proxy_error_propagated(
    trace: CreateOrCallMessageRef<'_>,
    call_subtrace_step_index: u32,
) -> Result<bool, InferrerError> {
    let CreateOrCallMessageRef::Call(trace) = trace else {
        return Ok(false);
    };

    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;

    let call_step = match trace.steps().get(call_subtrace_step_index as usize - 1) {
        Some(MessageTraceStep::Evm(step)) => step,
        _ => return Ok(false),
    };

    let call_inst = bytecode.get_instruction(call_step.pc)?;

    if call_inst.opcode != OpCode::DELEGATECALL {
        return Ok(false);
    }

    let subtrace = match trace.steps().get(call_subtrace_step_index as usize) {
        Some(MessageTraceStep::Message(MessageTrace::Call(call))) => {
            CreateOrCallMessageRef::Call(call)
        }
        Some(MessageTraceStep::Message(MessageTrace::Create(create))) => {
            CreateOrCallMessageRef::Create(create)
        }
        _ => return Ok(false),
    };

    // If the implementation is not recognized, better not to treat this as a
    // proxy.
    let Some(subtrace_bytecode) = subtrace.bytecode() else {
        return Ok(false);
    };

    if subtrace_bytecode.contract.read().r#type == ContractKind::Library {
        return Ok(false);
    }

    if trace.return_data().as_ref() != subtrace.return_data().as_ref() {
        return Ok(false);
    }

    for step in trace
        .steps()
        .iter()
        .skip(call_subtrace_step_index as usize + 1)
    {
        let MessageTraceStep::Evm(step) = step else {
            return Ok(false);
        };

        let inst = bytecode.get_instruction(step.pc)?;

        // All the remaining locations should be valid, as they are part of
        // the inline asm of the proxy.
        if inst.location.is_none() {
            return Ok(false);
        }

        if matches!(
            inst.jump_type,
            JumpType::IntoFunction | JumpType::OutofFunction
        ) {
            return Ok(false);
        }
    }

    let last_step = match trace.steps().last() {
        Some(MessageTraceStep::Evm(step)) => step,
        _ => return Err(InferrerError::ExpectedEvmStep),
    };
    let last_inst = bytecode.get_instruction(last_step.pc)?;

    Ok(last_inst.opcode == OpCode::REVERT)
}

fn is_subtrace_error_propagated(
    trace: CreateOrCallMessageRef<'_>,
    call_subtrace_step_index: u32,
) -> Result<bool, InferrerError> {
    let (call_return_data, call_exit) =
        match trace.steps().get(call_subtrace_step_index as usize) {
            Some(MessageTraceStep::Message(message)) => {
                (message.return_data().clone(), message.exit_code())
            }
            _ => {
                return Err(InferrerError::InvariantViolation(
                    "Expected the call step to be a message".to_string(),
                ));
            }
        };

    if trace.return_data().as_ref() != call_return_data.as_ref() {
        return Ok(false);
    }

    if trace.exit_code().is_out_of_gas_error() && call_exit.is_out_of_gas_error() {
        return Ok(true);
    }

    // If the return data is not empty and it is still the same, assume it is
    // being propagated.
    if !call_return_data.is_empty() {
        return Ok(true);
    }

    fails_right_after_call(trace, call_subtrace_step_index)
}

fn other_execution_error_stacktrace(
    trace: CreateOrCallMessageRef<'_>,
    mut stacktrace: Vec<StackTraceEntry>,
) -> Result<Vec<StackTraceEntry>, InferrerError> {
    stacktrace.push(StackTraceEntry::OtherExecutionError {
        source_reference: get_last_source_reference(trace)?,
    });

    Ok(stacktrace)
}

fn source_location_to_source_reference(
    bytecode: &Bytecode,
    location: Option<&SourceLocation>,
) -> Option<SourceReference> {
    let location = location?;

    let func = location.get_containing_function()?;

    let func_name = match func.r#type {
        ContractFunctionType::Constructor => CONSTRUCTOR_FUNCTION_NAME.to_string(),
        ContractFunctionType::Fallback => FALLBACK_FUNCTION_NAME.to_string(),
        ContractFunctionType::Receive => RECEIVE_FUNCTION_NAME.to_string(),
        _ => func.name.clone(),
    };

    let func_location_file = func.location.file()?;
    let func_location_file = func_location_file.read();

    Some(SourceReference {
        function: Some(func_name),
        contract: if func.r#type == ContractFunctionType::FreeFunction {
            None
        } else {
            Some(bytecode.contract.read().name.clone())
        },
        source_name: func_location_file.source_name.clone(),
        source_content: func_location_file.content.clone(),
        line: location.get_starting_line_number(),
        range: (location.offset, location.offset + location.length),
    })
}
