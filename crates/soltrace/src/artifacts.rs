//! Artifacts of the Solidity compiler input and output in the standard JSON
//! format, plus the build-info bundle that ties them together.
#![allow(missing_docs)]

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A build-info file: everything needed to recreate a solc run, along with
/// the run's full output.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    #[serde(rename = "_format")]
    pub format: String,
    pub id: String,
    pub solc_version: String,
    pub solc_long_version: String,
    pub input: CompilerInput,
    pub output: CompilerOutput,
}

/// The source code of a single file, as passed to the compiler.
#[derive(Debug, Deserialize, Serialize)]
pub struct Source {
    pub content: String,
}

/// The main input to the Solidity compiler.
#[derive(Debug, Deserialize, Serialize)]
pub struct CompilerInput {
    pub language: String,
    pub sources: HashMap<String, Source>,
    /// Compiler settings (optimizer, output selection, libraries, ...).
    /// Only round-tripped; the model builder never consumes them.
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// The main output of the Solidity compiler.
#[derive(Debug, Deserialize, Serialize)]
pub struct CompilerOutput {
    // Retain the order of the sources as emitted by the compiler.
    // The model builder relies on this order.
    pub sources: IndexMap<String, CompilerOutputSource>,
    /// Source name -> contract name -> contract output.
    pub contracts: HashMap<String, HashMap<String, CompilerOutputContract>>,
}

/// The ID and the AST of one compiled source.
#[derive(Debug, Deserialize, Serialize)]
pub struct CompilerOutputSource {
    pub id: u32,
    pub ast: serde_json::Value,
}

/// The output of one contract compilation.
#[derive(Debug, Deserialize, Serialize)]
pub struct CompilerOutputContract {
    pub evm: CompilerOutputEvm,
}

/// The EVM-specific output of a contract compilation.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerOutputEvm {
    pub bytecode: CompilerOutputBytecode,
    pub deployed_bytecode: CompilerOutputBytecode,
    /// Canonical signature -> hex-encoded 4-byte selector, as computed by
    /// the compiler itself.
    pub method_identifiers: HashMap<String, String>,
}

/// The bytecode output for a given compiled contract.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompilerOutputBytecode {
    pub object: String,
    pub opcodes: String,
    pub source_map: String,
    /// Source name -> library name -> positions of the unlinked address
    /// placeholders.
    pub link_references: HashMap<String, HashMap<String, Vec<LinkReference>>>,
    pub immutable_references: Option<HashMap<String, Vec<ImmutableReference>>>,
}

/// An unlinked library address placeholder inside a bytecode.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LinkReference {
    pub start: u32,
    pub length: u32,
}

/// The byte range an immutable value occupies inside a deployed bytecode.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ImmutableReference {
    pub start: u32,
    pub length: u32,
}
