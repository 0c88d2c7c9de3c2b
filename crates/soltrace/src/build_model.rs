//! The source model over which stack traces are decoded.
//!
//! The model consists of:
//! - [`SourceFile`]s with their name and content
//!   - [`SourceLocation`]s pointing inside the source files
//! - [`Contract`]s with their name, kind and location
//!   - the contract's own and inherited [`ContractFunction`]s
//! - the resolved [`Bytecode`] of each contract
//!   - its decoded [`Instruction`]s and their locations

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, Weak},
};

use alloy_primitives::hex;
use parking_lot::RwLock;
use revm_bytecode::OpCode;
use serde::Serialize;

use crate::artifacts::ImmutableReference;

/// A resolved build model from a Solidity compiler standard JSON output.
#[derive(Debug, Default)]
pub struct BuildModel {
    /// Maps the AST node ID of a contract definition to the contract.
    pub contract_id_to_contract: indexmap::IndexMap<u32, Arc<RwLock<Contract>>>,
    /// Maps the file ID to the source file.
    pub file_id_to_source_file: Arc<BuildModelSources>,
}

/// The source file table shared by a [`BuildModel`] and the locations derived
/// from it.
pub type BuildModelSources = HashMap<u32, Arc<RwLock<SourceFile>>>;

/// A source file.
#[derive(Debug)]
pub struct SourceFile {
    // Grows while the model is resolved; ordered by declaration.
    functions: Vec<Arc<ContractFunction>>,

    /// The name of the source file.
    pub source_name: String,
    /// The content of the source file.
    pub content: String,
}

impl SourceFile {
    /// Creates a new [`SourceFile`] with the provided name and content.
    pub fn new(source_name: String, content: String) -> SourceFile {
        SourceFile {
            functions: Vec::new(),
            source_name,
            content,
        }
    }

    /// Adds a [`ContractFunction`] to the source file.
    ///
    /// Only meant to be called while resolving the source model.
    pub fn add_function(&mut self, function: Arc<ContractFunction>) {
        self.functions.push(function);
    }

    /// Returns the first function, in declaration order, whose range contains
    /// the provided location.
    pub fn get_containing_function(
        &self,
        location: &SourceLocation,
    ) -> Option<&Arc<ContractFunction>> {
        self.functions
            .iter()
            .find(|function| function.location.contains(location))
    }
}

/// A byte range inside a source file.
///
/// Holds a weak reference to the file table; the table is owned by the
/// [`Bytecode`]s built from it, so the reference stays alive for as long as
/// any bytecode using this location does.
#[derive(Clone, Debug)]
pub struct SourceLocation {
    // Lazily computed and cached.
    line: OnceLock<u32>,
    pub(crate) sources: Weak<BuildModelSources>,
    /// The file ID of the source file.
    pub file_id: u32,
    /// Byte offset of the source location.
    pub offset: u32,
    /// Byte length of the source location.
    pub length: u32,
}

impl PartialEq for SourceLocation {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.sources, &other.sources)
            && self.file_id == other.file_id
            && self.offset == other.offset
            && self.length == other.length
    }
}

impl SourceLocation {
    /// Creates a new [`SourceLocation`] inside the given file table.
    pub fn new(
        sources: &Arc<BuildModelSources>,
        file_id: u32,
        offset: u32,
        length: u32,
    ) -> SourceLocation {
        SourceLocation {
            line: OnceLock::new(),
            sources: Arc::downgrade(sources),
            file_id,
            offset,
            length,
        }
    }

    /// Returns the file that contains this location, if the file table is
    /// still alive and the file ID resolves.
    pub fn file(&self) -> Option<Arc<RwLock<SourceFile>>> {
        self.sources
            .upgrade()
            .and_then(|sources| sources.get(&self.file_id).cloned())
    }

    /// Returns the 1-based line number of the start of the location.
    pub fn get_starting_line_number(&self) -> u32 {
        *self.line.get_or_init(|| {
            let Some(file) = self.file() else {
                return 1;
            };

            let file = file.read();
            let newlines = file
                .content
                .bytes()
                .take(self.offset as usize)
                .filter(|byte| *byte == b'\n')
                .count();

            1 + u32::try_from(newlines).unwrap_or(u32::MAX - 1)
        })
    }

    /// Returns the [`ContractFunction`] that contains this location.
    pub fn get_containing_function(&self) -> Option<Arc<ContractFunction>> {
        let file = self.file()?;
        let file = file.read();
        file.get_containing_function(self).cloned()
    }

    /// Returns whether `other` lies entirely within this location.
    pub fn contains(&self, other: &SourceLocation) -> bool {
        Weak::ptr_eq(&self.sources, &other.sources)
            && self.file_id == other.file_id
            && other.offset >= self.offset
            && other.offset + other.length <= self.offset + self.length
    }
}

/// The kind of a contract function.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ContractFunctionType {
    Constructor,
    Function,
    Fallback,
    Receive,
    Getter,
    Modifier,
    FreeFunction,
}

/// The visibility of a contract function.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ContractFunctionVisibility {
    Private,
    Internal,
    Public,
    External,
}

/// A contract function, modifier, getter or free function.
#[derive(Debug)]
pub struct ContractFunction {
    /// The name of the function.
    pub name: String,
    /// The kind of the function.
    pub r#type: ContractFunctionType,
    /// The source location of the whole definition.
    pub location: Arc<SourceLocation>,
    /// The name of the contract the function belongs to, if any.
    pub contract_name: Option<String>,
    /// The visibility of the function, when the AST reports one.
    pub visibility: Option<ContractFunctionVisibility>,
    /// Whether the function is payable; `None` when unknown.
    pub is_payable: Option<bool>,
    /// The 4-byte selector, for public and external functions and getters.
    /// May be patched later by [`Contract::correct_selector`].
    pub selector: RwLock<Option<Vec<u8>>>,
}

/// A decoded EVM instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
    /// The program counter of the instruction within its bytecode.
    pub pc: u32,
    /// The opcode of the instruction.
    pub opcode: OpCode,
    /// The jump classification of the instruction.
    pub jump_type: JumpType,
    /// The operand bytes, for `PUSH*` instructions.
    pub push_data: Option<Vec<u8>>,
    /// The source location the instruction maps to, if any.
    pub location: Option<Arc<SourceLocation>>,
}

/// The jump classification of an instruction, from the source map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, strum::Display)]
pub enum JumpType {
    /// Not a jump.
    NotJump,
    /// A jump into a function.
    IntoFunction,
    /// A jump out of a function.
    OutofFunction,
    /// An intra-function jump, e.g. a loop.
    InternalJump,
}

/// A [`Bytecode`] lookup error.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BytecodeError {
    /// No instruction exists at the provided program counter.
    #[error("Instruction not found at PC {pc}")]
    InstructionNotFound {
        /// The program counter that failed to resolve.
        pc: u32,
    },
}

/// A resolved bytecode: the decoded instructions of one deployment or runtime
/// code, tied to the contract it belongs to.
#[derive(Debug)]
pub struct Bytecode {
    pc_to_instruction: HashMap<u32, Instruction>,

    // Owns the source files transitively referenced by the instruction
    // locations.
    _sources: Arc<BuildModelSources>,
    /// The contract the bytecode belongs to.
    pub contract: Arc<RwLock<Contract>>,
    /// Whether this is a deployment (constructor) bytecode.
    pub is_deployment: bool,
    /// The code with library address slots zeroed out.
    pub normalized_code: Vec<u8>,
    /// Byte positions of the embedded library addresses.
    pub library_address_positions: Vec<u32>,
    /// Byte ranges of the immutable references embedded in the code.
    pub immutable_references: Vec<ImmutableReference>,
    /// The solc version the bytecode was compiled with.
    pub compiler_version: String,
}

impl Bytecode {
    /// Creates a new [`Bytecode`] from decoded instructions.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sources: Arc<BuildModelSources>,
        contract: Arc<RwLock<Contract>>,
        is_deployment: bool,
        normalized_code: Vec<u8>,
        instructions: Vec<Instruction>,
        library_address_positions: Vec<u32>,
        immutable_references: Vec<ImmutableReference>,
        compiler_version: String,
    ) -> Bytecode {
        let pc_to_instruction = instructions
            .into_iter()
            .map(|instruction| (instruction.pc, instruction))
            .collect();

        Bytecode {
            pc_to_instruction,
            _sources: sources,
            contract,
            is_deployment,
            normalized_code,
            library_address_positions,
            immutable_references,
            compiler_version,
        }
    }

    /// Returns the [`Instruction`] at the provided program counter.
    pub fn get_instruction(&self, pc: u32) -> Result<&Instruction, BytecodeError> {
        self.pc_to_instruction
            .get(&pc)
            .ok_or(BytecodeError::InstructionNotFound { pc })
    }

    /// Whether an instruction exists at the provided program counter.
    pub fn has_instruction(&self, pc: u32) -> bool {
        self.pc_to_instruction.contains_key(&pc)
    }
}

/// The kind of a contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum ContractKind {
    /// An ordinary contract.
    Contract,
    /// A library.
    Library,
}

/// A resolved contract.
#[derive(Debug)]
pub struct Contract {
    /// The constructor, if explicitly defined.
    pub constructor: Option<Arc<ContractFunction>>,
    /// The fallback function, if defined locally or inherited.
    pub fallback: Option<Arc<ContractFunction>>,
    /// The receive function, if defined locally or inherited.
    pub receive: Option<Arc<ContractFunction>>,

    local_functions: Vec<Arc<ContractFunction>>,
    selector_hex_to_function: HashMap<String, Arc<ContractFunction>>,

    /// The contract's name.
    pub name: String,
    /// Whether this is a contract or a library.
    pub r#type: ContractKind,
    /// The source location of the contract definition.
    pub location: Arc<SourceLocation>,
}

impl Contract {
    /// Creates a new [`Contract`] with no functions.
    pub fn new(name: String, kind: ContractKind, location: Arc<SourceLocation>) -> Contract {
        Contract {
            constructor: None,
            fallback: None,
            receive: None,
            local_functions: Vec::new(),
            selector_hex_to_function: HashMap::new(),
            name,
            r#type: kind,
            location,
        }
    }

    /// Adds a locally declared function to the contract.
    ///
    /// Only meant to be called while resolving the source model. Public and
    /// external functions and getters must have their selector set.
    pub fn add_local_function(&mut self, function: Arc<ContractFunction>) {
        if matches!(
            function.visibility,
            Some(ContractFunctionVisibility::Public | ContractFunctionVisibility::External)
        ) {
            match function.r#type {
                ContractFunctionType::Function | ContractFunctionType::Getter => {
                    let selector = function.selector.read();
                    let selector_hex = selector
                        .as_deref()
                        .map(hex::encode)
                        .expect("public functions have a selector");

                    self.selector_hex_to_function
                        .insert(selector_hex, function.clone());
                }
                ContractFunctionType::Constructor => {
                    self.constructor = Some(function.clone());
                }
                ContractFunctionType::Fallback => {
                    self.fallback = Some(function.clone());
                }
                ContractFunctionType::Receive => {
                    self.receive = Some(function.clone());
                }
                _ => {}
            }
        }

        self.local_functions.push(function);
    }

    /// Folds the next linearized base contract into this one. Bases must be
    /// applied in C3 order, most derived first, so that derived definitions
    /// win over base ones.
    ///
    /// Only meant to be called while resolving the source model.
    pub fn add_next_linearized_base_contract(&mut self, base: &Contract) {
        if self.fallback.is_none() && base.fallback.is_some() {
            self.fallback.clone_from(&base.fallback);
        }
        if self.receive.is_none() && base.receive.is_some() {
            self.receive.clone_from(&base.receive);
        }

        for base_function in &base.local_functions {
            if !matches!(
                base_function.r#type,
                ContractFunctionType::Function | ContractFunctionType::Getter
            ) {
                continue;
            }

            if !matches!(
                base_function.visibility,
                Some(ContractFunctionVisibility::Public | ContractFunctionVisibility::External)
            ) {
                continue;
            }

            let selector_hex = base_function
                .selector
                .read()
                .as_deref()
                .map(hex::encode)
                .expect("public functions have a selector");

            self.selector_hex_to_function
                .entry(selector_hex)
                .or_insert_with(|| base_function.clone());
        }
    }

    /// Looks up the function with the provided 4-byte selector, searching
    /// this contract and its flattened bases.
    pub fn get_function_from_selector(&self, selector: &[u8]) -> Option<&Arc<ContractFunction>> {
        self.selector_hex_to_function.get(&hex::encode(selector))
    }

    /// Patches the selector of the only function named `function_name` with
    /// the compiler-reported value. Returns whether a unique candidate was
    /// found and patched.
    ///
    /// Selectors are computed from the AST, which cannot always reproduce the
    /// compiler's canonicalization (structs, inherited enums). When
    /// `evm.methodIdentifiers` disagrees, the mismatched selector is fixed up
    /// here; with several same-named candidates (overloading) nothing can be
    /// done.
    pub fn correct_selector(&mut self, function_name: &str, selector: Vec<u8>) -> bool {
        let mut candidates = self
            .selector_hex_to_function
            .values()
            .filter(|function| function.name == function_name)
            .cloned();

        let function = match (candidates.next(), candidates.next()) {
            (Some(function), None) => function,
            _ => return false,
        };

        {
            let mut stored_selector = function.selector.write();
            if let Some(old_selector) = stored_selector.as_deref() {
                let old_selector_hex = hex::encode(old_selector);
                self.selector_hex_to_function.remove(&old_selector_hex);
            }

            *stored_selector = Some(selector.clone());
        }

        self.selector_hex_to_function
            .insert(hex::encode(&selector), function);

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_sources(content: &str) -> Arc<BuildModelSources> {
        let mut sources = HashMap::new();
        sources.insert(
            0,
            Arc::new(RwLock::new(SourceFile::new(
                "contracts/A.sol".to_string(),
                content.to_string(),
            ))),
        );
        Arc::new(sources)
    }

    #[test]
    fn starting_line_number_counts_newlines() {
        let sources = make_sources("line one\nline two\nline three\n");

        let first = SourceLocation::new(&sources, 0, 0, 4);
        let second = SourceLocation::new(&sources, 0, 9, 4);
        let third = SourceLocation::new(&sources, 0, 18, 4);

        assert_eq!(first.get_starting_line_number(), 1);
        assert_eq!(second.get_starting_line_number(), 2);
        assert_eq!(third.get_starting_line_number(), 3);
        // Cached value
        assert_eq!(third.get_starting_line_number(), 3);
    }

    #[test]
    fn location_containment() {
        let sources = make_sources("contract A { function f() public {} }");

        let outer = SourceLocation::new(&sources, 0, 0, 30);
        let inner = SourceLocation::new(&sources, 0, 13, 10);
        let overlapping = SourceLocation::new(&sources, 0, 25, 10);

        assert!(outer.contains(&inner));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&overlapping));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn correct_selector_requires_unique_candidate() {
        let sources = make_sources("contract A {}");
        let location = Arc::new(SourceLocation::new(&sources, 0, 0, 13));

        let mut contract = Contract::new("A".to_string(), ContractKind::Contract, location.clone());

        let function = Arc::new(ContractFunction {
            name: "transfer".to_string(),
            r#type: ContractFunctionType::Function,
            location,
            contract_name: Some("A".to_string()),
            visibility: Some(ContractFunctionVisibility::Public),
            is_payable: Some(false),
            selector: RwLock::new(Some(vec![0xde, 0xad, 0xbe, 0xef])),
        });
        contract.add_local_function(function);

        assert!(!contract.correct_selector("unknown", vec![0xa9, 0x05, 0x9c, 0xbb]));
        assert!(contract.correct_selector("transfer", vec![0xa9, 0x05, 0x9c, 0xbb]));

        let resolved = contract
            .get_function_from_selector(&[0xa9, 0x05, 0x9c, 0xbb])
            .expect("patched selector resolves");
        assert_eq!(resolved.name, "transfer");
        assert!(
            contract
                .get_function_from_selector(&[0xde, 0xad, 0xbe, 0xef])
                .is_none()
        );
    }
}
