//! Stack trace entries for failed Solidity executions.

use alloy_primitives::{Address, Bytes, U256};

use crate::build_model::ContractFunctionType;

pub(crate) const FALLBACK_FUNCTION_NAME: &str = "<fallback>";
pub(crate) const RECEIVE_FUNCTION_NAME: &str = "<receive>";
pub(crate) const CONSTRUCTOR_FUNCTION_NAME: &str = "constructor";
pub(crate) const UNRECOGNIZED_FUNCTION_NAME: &str = "<unrecognized-selector>";
pub(crate) const UNRECOGNIZED_CONTRACT_NAME: &str = "<UnrecognizedContract>";

/// A place in the Solidity sources, resolved down to the line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SourceReference {
    /// The name of the source file.
    pub source_name: String,
    /// The content of the source file.
    pub source_content: String,
    /// The name of the contract, if the reference points inside one.
    pub contract: Option<String>,
    /// The name of the function, if the reference points inside one.
    pub function: Option<String>,
    /// The 1-based line number.
    pub line: u32,
    /// The byte range of the reference within the file.
    pub range: (u32, u32),
}

// The names are self-explanatory.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum StackTraceEntry {
    /// A frame of the reconstructed call stack.
    Callstack {
        source_reference: SourceReference,
        function_type: ContractFunctionType,
    },
    /// A frame for a deployment of an unrecognized bytecode.
    UnrecognizedCreateCallstack,
    /// A frame for a call into an unrecognized contract.
    UnrecognizedContractCallstack { address: Address },
    PrecompileError {
        precompile: u32,
    },
    /// An explicit `revert`/`require`, or an `assert`-style invalid opcode
    /// when `is_invalid_opcode_error` is set.
    RevertError {
        return_data: Bytes,
        source_reference: SourceReference,
        is_invalid_opcode_error: bool,
    },
    FunctionNotPayableError {
        value: U256,
        source_reference: SourceReference,
    },
    InvalidParamsError {
        source_reference: SourceReference,
    },
    FallbackNotPayableError {
        value: U256,
        source_reference: SourceReference,
    },
    UnrecognizedFunctionWithoutFallbackError {
        source_reference: SourceReference,
    },
    /// A call that succeeded but returned less data than the caller expected.
    ReturndataSizeError {
        source_reference: SourceReference,
    },
    NoncontractAccountCalledError {
        source_reference: SourceReference,
    },
    CallFailedError {
        source_reference: SourceReference,
    },
    DirectLibraryCallError {
        source_reference: SourceReference,
    },
    /// A failed deployment of an unrecognized bytecode.
    UnrecognizedCreateError {
        return_data: Bytes,
        is_invalid_opcode_error: bool,
    },
    /// A failed call into an unrecognized contract.
    UnrecognizedContractError {
        address: Address,
        return_data: Bytes,
        is_invalid_opcode_error: bool,
    },
    /// A failure the other heuristics could not pin down further.
    OtherExecutionError {
        source_reference: Option<SourceReference>,
    },
}

impl StackTraceEntry {
    /// The source reference of the entry, for the entries that carry one.
    pub fn source_reference(&self) -> Option<&SourceReference> {
        match self {
            StackTraceEntry::Callstack {
                source_reference, ..
            }
            | StackTraceEntry::RevertError {
                source_reference, ..
            }
            | StackTraceEntry::FunctionNotPayableError {
                source_reference, ..
            }
            | StackTraceEntry::InvalidParamsError {
                source_reference, ..
            }
            | StackTraceEntry::FallbackNotPayableError {
                source_reference, ..
            }
            | StackTraceEntry::UnrecognizedFunctionWithoutFallbackError {
                source_reference, ..
            }
            | StackTraceEntry::ReturndataSizeError {
                source_reference, ..
            }
            | StackTraceEntry::NoncontractAccountCalledError {
                source_reference, ..
            }
            | StackTraceEntry::CallFailedError {
                source_reference, ..
            }
            | StackTraceEntry::DirectLibraryCallError {
                source_reference, ..
            } => Some(source_reference),
            StackTraceEntry::OtherExecutionError {
                source_reference, ..
            } => source_reference.as_ref(),
            StackTraceEntry::UnrecognizedCreateCallstack
            | StackTraceEntry::UnrecognizedContractCallstack { .. }
            | StackTraceEntry::PrecompileError { .. }
            | StackTraceEntry::UnrecognizedCreateError { .. }
            | StackTraceEntry::UnrecognizedContractError { .. } => None,
        }
    }
}
