//! Computation of Solidity stack traces from decoded message traces.

use revm_bytecode::OpCode;

use crate::{
    build_model::{BytecodeError, Instruction, JumpType},
    error_inferrer::{
        self, InferrerError, SubmessageData, instruction_to_callstack_stack_trace_entry,
    },
    mapped_inline_internal_functions_heuristics::{
        HeuristicsError, adjust_stack_trace, stack_trace_may_require_adjustments,
    },
    message_trace::{
        CallMessageTrace, CreateMessageTrace, CreateOrCallMessageRef, EvmStep, MessageTrace,
        MessageTraceStep, PrecompileMessageTrace,
    },
    solidity_stack_trace::StackTraceEntry,
};

/// Errors that can occur while computing a stack trace.
#[derive(Debug, thiserror::Error)]
pub enum SolidityTracerError {
    /// A program counter of the trace does not resolve to an instruction.
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    /// The error inference failed.
    #[error(transparent)]
    ErrorInferrer(#[from] InferrerError),
    /// The stack trace adjustment heuristics failed.
    #[error(transparent)]
    Heuristics(#[from] HeuristicsError),
}

/// Computes the stack trace explaining why the execution of `trace` failed.
///
/// Messages that did not fail produce an empty stack trace.
pub fn get_stack_trace(trace: &MessageTrace) -> Result<Vec<StackTraceEntry>, SolidityTracerError> {
    if !trace.exit_code().is_error() {
        return Ok(vec![]);
    }

    match trace {
        MessageTrace::Precompile(precompile) => Ok(get_precompile_message_stack_trace(precompile)),
        MessageTrace::Call(call) if call.bytecode().is_some() => get_call_message_stack_trace(call),
        MessageTrace::Create(create) if create.bytecode().is_some() => {
            get_create_message_stack_trace(create)
        }
        // The bytecode was never identified.
        MessageTrace::Call(call) => get_unrecognized_message_stack_trace(call.into()),
        MessageTrace::Create(create) => get_unrecognized_message_stack_trace(create.into()),
    }
}

fn get_last_subtrace<'a>(trace: CreateOrCallMessageRef<'a>) -> Option<&'a MessageTrace> {
    if trace.number_of_subtraces() == 0 {
        return None;
    }

    trace.steps().iter().rev().find_map(|step| match step {
        MessageTraceStep::Evm(_) => None,
        MessageTraceStep::Message(message) => Some(message),
    })
}

fn get_precompile_message_stack_trace(trace: &PrecompileMessageTrace) -> Vec<StackTraceEntry> {
    vec![StackTraceEntry::PrecompileError {
        precompile: trace.precompile,
    }]
}

fn get_create_message_stack_trace(
    trace: &CreateMessageTrace,
) -> Result<Vec<StackTraceEntry>, SolidityTracerError> {
    if let Some(inferred_error) = error_inferrer::infer_before_tracing_create_message(trace)? {
        return Ok(inferred_error);
    }

    trace_evm_execution(trace.into())
}

fn get_call_message_stack_trace(
    trace: &CallMessageTrace,
) -> Result<Vec<StackTraceEntry>, SolidityTracerError> {
    if let Some(inferred_error) = error_inferrer::infer_before_tracing_call_message(trace)? {
        return Ok(inferred_error);
    }

    trace_evm_execution(trace.into())
}

fn get_unrecognized_message_stack_trace(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<Vec<StackTraceEntry>, SolidityTracerError> {
    if let Some(subtrace) = get_last_subtrace(trace) {
        // Not an exact heuristic, but right most of the time: Solidity
        // reverts when a call fails, and most contracts are written in
        // Solidity.
        if subtrace.exit_code().is_error()
            && trace.return_data().as_ref() == subtrace.return_data().as_ref()
        {
            let unrecognized_entry = match trace {
                CreateOrCallMessageRef::Call(call) => {
                    StackTraceEntry::UnrecognizedContractCallstack {
                        address: call.address,
                    }
                }
                CreateOrCallMessageRef::Create(_) => StackTraceEntry::UnrecognizedCreateCallstack,
            };

            let mut stacktrace = vec![unrecognized_entry];
            stacktrace.extend(get_stack_trace(subtrace)?);

            return Ok(stacktrace);
        }
    }

    let is_invalid_opcode_error = trace.exit_code().is_invalid_opcode_error();

    Ok(match trace {
        CreateOrCallMessageRef::Call(call) => vec![StackTraceEntry::UnrecognizedContractError {
            address: call.address,
            return_data: call.return_data().clone(),
            is_invalid_opcode_error,
        }],
        CreateOrCallMessageRef::Create(create) => vec![StackTraceEntry::UnrecognizedCreateError {
            return_data: create.return_data().clone(),
            is_invalid_opcode_error,
        }],
    })
}

fn trace_evm_execution(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<Vec<StackTraceEntry>, SolidityTracerError> {
    let stack_trace = raw_trace_evm_execution(trace)?;

    if stack_trace_may_require_adjustments(&stack_trace, trace)? {
        return adjust_stack_trace(stack_trace, trace).map_err(SolidityTracerError::from);
    }

    Ok(stack_trace)
}

fn raw_trace_evm_execution(
    trace: CreateOrCallMessageRef<'_>,
) -> Result<Vec<StackTraceEntry>, SolidityTracerError> {
    let bytecode = trace.bytecode().ok_or(InferrerError::MissingBytecode)?;
    let steps = trace.steps();
    let number_of_subtraces = trace.number_of_subtraces();

    let mut stacktrace: Vec<StackTraceEntry> = vec![];

    let mut subtraces_seen = 0;

    // There was a jump into a function according to the source maps.
    let mut jumped_into_function = false;

    let mut function_jumpdests: Vec<&Instruction> = vec![];

    let mut last_submessage_data: Option<SubmessageData<'_>> = None;

    let mut iter = steps.iter().enumerate().peekable();
    while let Some((step_index, step)) = iter.next() {
        match step {
            MessageTraceStep::Evm(EvmStep { pc }) => {
                let inst = bytecode.get_instruction(*pc)?;

                if inst.jump_type == JumpType::IntoFunction
                    && let Some((_, next_step)) = iter.peek()
                {
                    let MessageTraceStep::Evm(next_evm_step) = next_step else {
                        return Err(InferrerError::ExpectedEvmStep.into());
                    };
                    let next_inst = bytecode.get_instruction(next_evm_step.pc)?;

                    if next_inst.opcode == OpCode::JUMPDEST {
                        // The first jump of a call trace is the dispatcher
                        // entering the called function; it has no call site
                        // to point at.
                        if jumped_into_function
                            || matches!(trace, CreateOrCallMessageRef::Create(_))
                        {
                            let frame =
                                instruction_to_callstack_stack_trace_entry(bytecode, inst)?;
                            stacktrace.push(frame);
                        }

                        if next_inst.location.is_some() {
                            jumped_into_function = true;
                        }
                        function_jumpdests.push(next_inst);
                    }
                } else if inst.jump_type == JumpType::OutofFunction {
                    stacktrace.pop();
                    function_jumpdests.pop();
                }
            }
            MessageTraceStep::Message(inner) => {
                subtraces_seen += 1;

                // If there are more subtraces, this one did not terminate
                // the execution.
                if subtraces_seen < number_of_subtraces {
                    continue;
                }

                let submessage_stacktrace = get_stack_trace(inner)?;

                last_submessage_data = Some(SubmessageData {
                    message_trace: inner,
                    stacktrace: submessage_stacktrace,
                    step_index: step_index as u32,
                });
            }
        }
    }

    let stacktrace_with_inferred_error = error_inferrer::infer_after_tracing(
        trace,
        stacktrace,
        &function_jumpdests,
        jumped_into_function,
        last_submessage_data,
    )?;

    Ok(error_inferrer::filter_redundant_frames(
        stacktrace_with_inferred_error,
    ))
}
