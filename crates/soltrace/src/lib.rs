#![warn(missing_docs)]

//! Reconstruction of Solidity-level stack traces from raw EVM execution
//! traces.
//!
//! The crate builds a structural model of every compiled contract from solc's
//! standard JSON output, identifies which known contract produced an observed
//! bytecode, and walks per-instruction execution traces to explain EVM-level
//! failures in Solidity terms (file, contract, function, line).

pub mod build_model;

pub mod contracts_identifier;

pub mod artifacts;
pub mod compiler;
pub mod console_log;
pub mod exit_code;
pub mod library_utils;
pub mod message_trace;
pub mod return_data;
pub mod solidity_stack_trace;
pub mod solidity_tracer;
pub mod vm_trace_decoder;

mod bytecode_trie;
mod error_inferrer;
mod mapped_inline_internal_functions_heuristics;
mod source_map;
