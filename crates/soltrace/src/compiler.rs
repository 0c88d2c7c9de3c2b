//! Builds the source model out of the Solidity compiler's standard JSON[^1]
//! input and output, and decodes the emitted bytecodes against it.
//!
//! [^1]: See <https://docs.soliditylang.org/en/latest/using-the-compiler.html#compiler-input-and-output-json-description>.

use std::{collections::HashMap, str::FromStr, sync::Arc};

use alloy_primitives::{hex, keccak256};
use anyhow::Context as _;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::{
    artifacts::{CompilerInput, CompilerOutput, CompilerOutputBytecode},
    build_model::{
        BuildModel, BuildModelSources, Bytecode, Contract, ContractFunction, ContractFunctionType,
        ContractFunctionVisibility, ContractKind, SourceFile, SourceLocation,
    },
    library_utils::{get_library_address_positions, normalize_compiler_output_bytecode},
    source_map::decode_instructions,
};

/// Creates the source model for a compilation, decodes every contract's
/// deployment and runtime bytecode with its source mapping, and links the
/// decoded instructions back to the model.
///
/// The returned bytecodes keep the model alive through their contract and
/// source file references.
pub fn create_models_and_decode_bytecodes(
    solc_version: &str,
    compiler_input: &CompilerInput,
    compiler_output: &CompilerOutput,
) -> anyhow::Result<Vec<Arc<Bytecode>>> {
    let build_model = create_sources_model_from_ast(compiler_output, compiler_input)?;

    let bytecodes = decode_bytecodes(solc_version, compiler_output, &build_model)?;

    correct_selectors(&bytecodes, compiler_output)?;

    Ok(bytecodes)
}

fn string_field<'a>(node: &'a serde_json::Value, field: &str) -> anyhow::Result<&'a str> {
    node[field]
        .as_str()
        .with_context(|| format!("Expected a string `{field}` field in the AST node"))
}

fn array_field<'a>(
    node: &'a serde_json::Value,
    field: &str,
) -> anyhow::Result<&'a Vec<serde_json::Value>> {
    node[field]
        .as_array()
        .with_context(|| format!("Expected an array `{field}` field in the AST node"))
}

fn create_sources_model_from_ast(
    compiler_output: &CompilerOutput,
    compiler_input: &CompilerInput,
) -> anyhow::Result<BuildModel> {
    // The source files have to be in place first so that source locations
    // can be resolved while walking the ASTs.
    let sources: Arc<BuildModelSources> = Arc::new(
        compiler_output
            .sources
            .iter()
            .map(|(source_name, source)| {
                let content = compiler_input
                    .sources
                    .get(source_name)
                    .with_context(|| format!("Missing input source `{source_name}`"))?
                    .content
                    .clone();

                let file = SourceFile::new(source_name.clone(), content);

                Ok((source.id, Arc::new(RwLock::new(file))))
            })
            .collect::<anyhow::Result<HashMap<_, _>>>()?,
    );

    let mut linearized_base_contract_ids = HashMap::new();

    let mut contract_id_to_contract = IndexMap::new();
    for (source_name, source) in &compiler_output.sources {
        let file = sources
            .get(&source.id)
            .with_context(|| format!("Missing source file with ID {}", source.id))?;

        for node in array_field(&source.ast, "nodes")? {
            match string_field(node, "nodeType")? {
                "ContractDefinition" => {
                    // Interfaces have a `contractKind` that we don't model.
                    let Some(kind) = node["contractKind"]
                        .as_str()
                        .and_then(|kind| ContractKind::from_str(kind).ok())
                    else {
                        continue;
                    };

                    let (contract_id, contract) = process_contract_ast_node(
                        file,
                        node,
                        kind,
                        &sources,
                        &mut linearized_base_contract_ids,
                    )
                    .with_context(|| format!("Invalid contract definition in `{source_name}`"))?;

                    contract_id_to_contract.insert(contract_id, contract);
                }
                "FunctionDefinition" => {
                    process_function_definition_ast_node(node, &sources, None, file)?;
                }
                _ => {}
            }
        }
    }

    apply_contracts_inheritance(&contract_id_to_contract, &linearized_base_contract_ids);

    Ok(BuildModel {
        contract_id_to_contract,
        file_id_to_source_file: sources,
    })
}

fn apply_contracts_inheritance(
    contract_id_to_contract: &IndexMap<u32, Arc<RwLock<Contract>>>,
    linearized_base_contract_ids: &HashMap<u32, Vec<u32>>,
) {
    for (contract_id, contract) in contract_id_to_contract {
        let Some(base_ids) = linearized_base_contract_ids.get(contract_id) else {
            continue;
        };

        let mut contract = contract.write();

        for base_id in base_ids {
            if base_id == contract_id {
                continue;
            }

            // The linearization includes interfaces, which are not modeled.
            let Some(base_contract) = contract_id_to_contract.get(base_id) else {
                continue;
            };

            contract.add_next_linearized_base_contract(&base_contract.read());
        }
    }
}

fn process_contract_ast_node(
    file: &Arc<RwLock<SourceFile>>,
    contract_node: &serde_json::Value,
    kind: ContractKind,
    sources: &Arc<BuildModelSources>,
    linearized_base_contract_ids: &mut HashMap<u32, Vec<u32>>,
) -> anyhow::Result<(u32, Arc<RwLock<Contract>>)> {
    let location = ast_src_to_source_location(string_field(contract_node, "src")?, sources)?;

    let contract = Contract::new(
        string_field(contract_node, "name")?.to_string(),
        kind,
        location,
    );
    let contract = Arc::new(RwLock::new(contract));

    let contract_id = contract_node["id"]
        .as_u64()
        .context("Expected a numeric `id` field in the contract node")? as u32;

    linearized_base_contract_ids.insert(
        contract_id,
        array_field(contract_node, "linearizedBaseContracts")?
            .iter()
            .filter_map(|id| id.as_u64().map(|id| id as u32))
            .collect(),
    );

    for node in array_field(contract_node, "nodes")? {
        match string_field(node, "nodeType")? {
            "FunctionDefinition" => {
                process_function_definition_ast_node(node, sources, Some(&contract), file)?;
            }
            "ModifierDefinition" => {
                process_modifier_definition_ast_node(node, sources, &contract, file)?;
            }
            "VariableDeclaration" => {
                process_variable_declaration_ast_node(node, sources, &contract, file)?;
            }
            _ => {}
        }
    }

    Ok((contract_id, contract))
}

fn process_function_definition_ast_node(
    node: &serde_json::Value,
    sources: &Arc<BuildModelSources>,
    contract: Option<&Arc<RwLock<Contract>>>,
    file: &Arc<RwLock<SourceFile>>,
) -> anyhow::Result<()> {
    if node.get("implemented").and_then(serde_json::Value::as_bool) == Some(false) {
        return Ok(());
    }

    let function_type = function_definition_kind_to_function_type(node["kind"].as_str());
    let location = ast_src_to_source_location(string_field(node, "src")?, sources)?;
    let visibility = ast_visibility_to_visibility(string_field(node, "visibility")?);

    let selector = if function_type == ContractFunctionType::Function
        && matches!(
            visibility,
            ContractFunctionVisibility::External | ContractFunctionVisibility::Public
        ) {
        Some(ast_function_definition_to_selector(node)?)
    } else {
        None
    };

    let function = Arc::new(ContractFunction {
        name: string_field(node, "name")?.to_string(),
        r#type: function_type,
        location,
        contract_name: contract.map(|contract| contract.read().name.clone()),
        visibility: Some(visibility),
        is_payable: Some(node["stateMutability"].as_str() == Some("payable")),
        selector: RwLock::new(selector),
    });

    file.write().add_function(function.clone());
    if let Some(contract) = contract {
        contract.write().add_local_function(function);
    }

    Ok(())
}

fn process_modifier_definition_ast_node(
    node: &serde_json::Value,
    sources: &Arc<BuildModelSources>,
    contract: &Arc<RwLock<Contract>>,
    file: &Arc<RwLock<SourceFile>>,
) -> anyhow::Result<()> {
    let location = ast_src_to_source_location(string_field(node, "src")?, sources)?;

    let function = Arc::new(ContractFunction {
        name: string_field(node, "name")?.to_string(),
        r#type: ContractFunctionType::Modifier,
        location,
        contract_name: Some(contract.read().name.clone()),
        visibility: None,
        is_payable: None,
        selector: RwLock::new(None),
    });

    file.write().add_function(function.clone());
    contract.write().add_local_function(function);

    Ok(())
}

fn process_variable_declaration_ast_node(
    node: &serde_json::Value,
    sources: &Arc<BuildModelSources>,
    contract: &Arc<RwLock<Contract>>,
    file: &Arc<RwLock<SourceFile>>,
) -> anyhow::Result<()> {
    let visibility = ast_visibility_to_visibility(string_field(node, "visibility")?);

    // Only public state variables get a getter.
    if visibility != ContractFunctionVisibility::Public {
        return Ok(());
    }

    let location = ast_src_to_source_location(string_field(node, "src")?, sources)?;

    let function = Arc::new(ContractFunction {
        name: string_field(node, "name")?.to_string(),
        r#type: ContractFunctionType::Getter,
        location,
        contract_name: Some(contract.read().name.clone()),
        visibility: Some(visibility),
        is_payable: Some(false),
        selector: RwLock::new(Some(get_public_variable_selector_from_declaration_ast_node(
            node,
        )?)),
    });

    file.write().add_function(function.clone());
    contract.write().add_local_function(function);

    Ok(())
}

fn get_public_variable_selector_from_declaration_ast_node(
    variable_declaration: &serde_json::Value,
) -> anyhow::Result<Vec<u8>> {
    if let Some(function_selector) = variable_declaration["functionSelector"].as_str() {
        return hex::decode(function_selector)
            .with_context(|| format!("Invalid hex selector: {function_selector:?}"));
    }

    // Older compilers don't report the selector, so it has to be derived from
    // the getter's parameters: one per mapping key, plus an index for a
    // trailing array.
    let mut param_types = Vec::new();

    let mut next_type = &variable_declaration["typeName"];
    loop {
        if next_type["nodeType"] == "Mapping" {
            let key_type =
                canonical_abi_type_for_elementary_or_user_defined_types(&next_type["keyType"])
                    .context("Unsupported mapping key type")?;
            param_types.push(key_type);

            next_type = &next_type["valueType"];
        } else {
            if next_type["nodeType"] == "ArrayTypeName" {
                param_types.push("uint256".to_string());
            }

            break;
        }
    }

    Ok(abi_method_id(
        string_field(variable_declaration, "name")?,
        param_types,
    ))
}

fn ast_function_definition_to_selector(
    function_definition: &serde_json::Value,
) -> anyhow::Result<Vec<u8>> {
    if let Some(function_selector) = function_definition["functionSelector"].as_str() {
        return hex::decode(function_selector)
            .with_context(|| format!("Invalid hex selector: {function_selector:?}"));
    }

    let mut param_types = Vec::new();

    for param in array_field(&function_definition["parameters"], "parameters")? {
        if is_contract_type(param) {
            param_types.push("address".to_string());
            continue;
        }

        if is_enum_type(param) {
            // Enums with more than 256 variants would need a wider type, but
            // solc rejects those at compile time.
            param_types.push("uint8".to_string());
            continue;
        }

        let type_name = &param["typeName"];
        let node_type = type_name["nodeType"].as_str();
        if matches!(
            node_type,
            Some("ArrayTypeName" | "FunctionTypeName" | "Mapping")
        ) {
            param_types.push(
                string_field(&type_name["typeDescriptions"], "typeString")?.to_string(),
            );
            continue;
        }

        param_types.push(to_canonical_abi_type(string_field(type_name, "name")?));
    }

    Ok(abi_method_id(
        string_field(function_definition, "name")?,
        param_types,
    ))
}

fn canonical_abi_type_for_elementary_or_user_defined_types(
    key_type: &serde_json::Value,
) -> Option<String> {
    if is_elementary_type(key_type) {
        return key_type["name"].as_str().map(to_canonical_abi_type);
    }

    if is_enum_type(key_type) {
        return Some("uint256".to_string());
    }

    if is_contract_type(key_type) {
        return Some("address".to_string());
    }

    None
}

fn function_definition_kind_to_function_type(kind: Option<&str>) -> ContractFunctionType {
    match kind {
        Some("constructor") => ContractFunctionType::Constructor,
        Some("fallback") => ContractFunctionType::Fallback,
        Some("receive") => ContractFunctionType::Receive,
        Some("freeFunction") => ContractFunctionType::FreeFunction,
        _ => ContractFunctionType::Function,
    }
}

fn ast_visibility_to_visibility(visibility: &str) -> ContractFunctionVisibility {
    ContractFunctionVisibility::from_str(visibility).unwrap_or(ContractFunctionVisibility::External)
}

fn is_user_defined_type(param: &serde_json::Value, type_prefix: &str) -> bool {
    let is_user_defined = param["typeName"]["nodeType"] == "UserDefinedTypeName"
        || param["nodeType"] == "UserDefinedTypeName";

    is_user_defined
        && param["typeDescriptions"]["typeString"]
            .as_str()
            .is_some_and(|type_string| type_string.starts_with(type_prefix))
}

fn is_contract_type(param: &serde_json::Value) -> bool {
    is_user_defined_type(param, "contract ")
}

fn is_enum_type(param: &serde_json::Value) -> bool {
    is_user_defined_type(param, "enum ")
}

fn is_elementary_type(param: &serde_json::Value) -> bool {
    param["nodeType"] == "ElementaryTypeName" || param["type"] == "ElementaryTypeName"
}

fn to_canonical_abi_type(r#type: &str) -> String {
    for (alias, canonical) in [
        ("int", "int256"),
        ("uint", "uint256"),
        ("fixed", "fixed128x128"),
        ("ufixed", "ufixed128x128"),
    ] {
        if r#type == alias {
            return canonical.to_string();
        }
        if let Some(array_suffix) = r#type.strip_prefix(alias) {
            if array_suffix.starts_with('[') {
                return format!("{canonical}{array_suffix}");
            }
        }
    }

    r#type.to_string()
}

fn ast_src_to_source_location(
    src: &str,
    sources: &Arc<BuildModelSources>,
) -> anyhow::Result<Arc<SourceLocation>> {
    let parts: Vec<&str> = src.split(':').collect();
    let [offset, length, file_id] = parts.as_slice() else {
        anyhow::bail!("Expected `offset:length:file` in AST src: {src:?}");
    };

    let offset = offset
        .parse()
        .with_context(|| format!("Invalid offset in AST src: {src:?}"))?;
    let length = length
        .parse()
        .with_context(|| format!("Invalid length in AST src: {src:?}"))?;
    let file_id = file_id
        .parse()
        .with_context(|| format!("Invalid file ID in AST src: {src:?}"))?;

    if !sources.contains_key(&file_id) {
        anyhow::bail!("Missing source file with ID {file_id}");
    }

    Ok(Arc::new(SourceLocation::new(
        sources, file_id, offset, length,
    )))
}

fn correct_selectors(
    bytecodes: &[Arc<Bytecode>],
    compiler_output: &CompilerOutput,
) -> anyhow::Result<()> {
    for bytecode in bytecodes.iter().filter(|bytecode| !bytecode.is_deployment) {
        let mut contract = bytecode.contract.write();

        let Some(source_file) = contract.location.file() else {
            continue;
        };
        let source_name = source_file.read().source_name.clone();

        let Some(method_identifiers) = compiler_output
            .contracts
            .get(&source_name)
            .and_then(|contracts| contracts.get(&contract.name))
            .map(|contract| &contract.evm.method_identifiers)
        else {
            continue;
        };

        for (signature, hex_selector) in method_identifiers {
            let function_name = signature.split('(').next().unwrap_or("");
            let selector = hex::decode(hex_selector)
                .with_context(|| format!("Invalid hex selector: {hex_selector:?}"))?;

            if contract.get_function_from_selector(&selector).is_some() {
                continue;
            }

            // The AST-derived selector can disagree with the compiler's (for
            // example for struct parameters). When the function name is
            // unambiguous the compiler-reported selector wins.
            if !contract.correct_selector(function_name, selector) {
                anyhow::bail!(
                    "Failed to compute the selector of one or more implementations of \
                     {}#{function_name}. This is likely caused by function overloading \
                     combined with parameter types that cannot be derived from the AST.",
                    contract.name,
                );
            }
        }
    }

    Ok(())
}

fn abi_method_id(name: &str, param_types: Vec<impl AsRef<str>>) -> Vec<u8> {
    let signature = format!(
        "{name}({})",
        param_types
            .into_iter()
            .map(|param_type| to_canonical_abi_type(param_type.as_ref()))
            .collect::<Vec<_>>()
            .join(",")
    );

    keccak256(signature.as_bytes())[..4].to_vec()
}

fn decode_evm_bytecode(
    contract: Arc<RwLock<Contract>>,
    solc_version: &str,
    is_deployment: bool,
    compiler_bytecode: &CompilerOutputBytecode,
    sources: &Arc<BuildModelSources>,
) -> anyhow::Result<Bytecode> {
    let library_address_positions = get_library_address_positions(compiler_bytecode);

    let immutable_references = compiler_bytecode
        .immutable_references
        .as_ref()
        .map(|references| references.values().flatten().copied().collect::<Vec<_>>())
        .unwrap_or_default();

    let normalized_code = normalize_compiler_output_bytecode(
        compiler_bytecode.object.clone(),
        &library_address_positions,
    )
    .context("Invalid bytecode object")?;

    let instructions = decode_instructions(
        &normalized_code,
        &compiler_bytecode.source_map,
        sources,
        is_deployment,
    );

    Ok(Bytecode::new(
        sources.clone(),
        contract,
        is_deployment,
        normalized_code,
        instructions,
        library_address_positions,
        immutable_references,
        solc_version.to_string(),
    ))
}

fn decode_bytecodes(
    solc_version: &str,
    compiler_output: &CompilerOutput,
    build_model: &BuildModel,
) -> anyhow::Result<Vec<Arc<Bytecode>>> {
    let mut bytecodes = Vec::new();

    for contract in build_model.contract_id_to_contract.values() {
        let (contract_name, source_name) = {
            let contract = contract.read();

            let Some(source_file) = contract.location.file() else {
                continue;
            };
            let source_name = source_file.read().source_name.clone();

            (contract.name.clone(), source_name)
        };

        let Some(contract_evm_output) = compiler_output
            .contracts
            .get(&source_name)
            .and_then(|contracts| contracts.get(&contract_name))
            .map(|contract| &contract.evm)
        else {
            continue;
        };

        // Abstract contracts have no bytecode.
        if contract_evm_output.bytecode.object.is_empty() {
            continue;
        }

        bytecodes.push(Arc::new(decode_evm_bytecode(
            contract.clone(),
            solc_version,
            true,
            &contract_evm_output.bytecode,
            &build_model.file_id_to_source_file,
        )?));

        bytecodes.push(Arc::new(decode_evm_bytecode(
            contract.clone(),
            solc_version,
            false,
            &contract_evm_output.deployed_bytecode,
            &build_model.file_id_to_source_file,
        )?));
    }

    Ok(bytecodes)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_abi_types() {
        assert_eq!(to_canonical_abi_type("uint"), "uint256");
        assert_eq!(to_canonical_abi_type("uint[4]"), "uint256[4]");
        assert_eq!(to_canonical_abi_type("int[]"), "int256[]");
        assert_eq!(to_canonical_abi_type("fixed"), "fixed128x128");
        assert_eq!(to_canonical_abi_type("ufixed[2]"), "ufixed128x128[2]");
        assert_eq!(to_canonical_abi_type("bytes32"), "bytes32");
        assert_eq!(to_canonical_abi_type("uint256"), "uint256");
    }

    #[test]
    fn method_ids_use_canonical_types() {
        assert_eq!(
            abi_method_id("transfer", vec!["address", "uint"]),
            hex::decode("a9059cbb").unwrap()
        );
    }

    fn fixture_input_and_output() -> (CompilerInput, CompilerOutput) {
        let input = json!({
            "language": "Solidity",
            "sources": {
                "contracts/Token.sol": {
                    "content": "contract Token { /* shortened */ }"
                }
            },
            "settings": {}
        });

        let ast = json!({
            "nodeType": "SourceUnit",
            "nodes": [
                {
                    "nodeType": "ContractDefinition",
                    "id": 10,
                    "name": "Token",
                    "contractKind": "contract",
                    "src": "0:120:0",
                    "linearizedBaseContracts": [10],
                    "nodes": [
                        {
                            "nodeType": "FunctionDefinition",
                            "name": "transfer",
                            "kind": "function",
                            "src": "20:40:0",
                            "visibility": "public",
                            "stateMutability": "nonpayable",
                            "implemented": true,
                            "parameters": {
                                "parameters": [
                                    { "typeName": { "nodeType": "ElementaryTypeName", "name": "address" } },
                                    { "typeName": { "nodeType": "ElementaryTypeName", "name": "uint" } }
                                ]
                            }
                        },
                        {
                            "nodeType": "VariableDeclaration",
                            "name": "balanceOf",
                            "src": "65:40:0",
                            "visibility": "public",
                            "typeName": {
                                "nodeType": "Mapping",
                                "keyType": { "nodeType": "ElementaryTypeName", "name": "address" },
                                "valueType": { "nodeType": "ElementaryTypeName", "name": "uint256" }
                            }
                        }
                    ]
                }
            ]
        });

        let output = json!({
            "sources": {
                "contracts/Token.sol": { "id": 0, "ast": ast }
            },
            "contracts": {
                "contracts/Token.sol": {
                    "Token": {
                        "evm": {
                            "bytecode": {
                                "object": "6080604052fe",
                                "opcodes": "PUSH1 0x80 PUSH1 0x40 MSTORE INVALID",
                                "sourceMap": "0:120:0:-;;",
                                "linkReferences": {}
                            },
                            "deployedBytecode": {
                                "object": "6080604052fe",
                                "opcodes": "PUSH1 0x80 PUSH1 0x40 MSTORE INVALID",
                                "sourceMap": "0:120:0:-;;",
                                "linkReferences": {}
                            },
                            "methodIdentifiers": {
                                "transfer(address,uint256)": "a9059cbb",
                                "balanceOf(address)": "70a08231"
                            }
                        }
                    }
                }
            }
        });

        (
            serde_json::from_value(input).unwrap(),
            serde_json::from_value(output).unwrap(),
        )
    }

    #[test]
    fn model_creation_decodes_both_bytecodes() {
        let (input, output) = fixture_input_and_output();

        let bytecodes = create_models_and_decode_bytecodes("0.8.19", &input, &output).unwrap();

        assert_eq!(bytecodes.len(), 2);
        assert!(bytecodes[0].is_deployment);
        assert!(!bytecodes[1].is_deployment);
        assert!(Arc::ptr_eq(&bytecodes[0].contract, &bytecodes[1].contract));

        let contract = bytecodes[1].contract.read();
        assert_eq!(contract.name, "Token");
    }

    #[test]
    fn selectors_are_derived_from_the_ast() {
        let (input, output) = fixture_input_and_output();

        let bytecodes = create_models_and_decode_bytecodes("0.8.19", &input, &output).unwrap();

        let contract = bytecodes[1].contract.read();

        let transfer = contract
            .get_function_from_selector(&hex::decode("a9059cbb").unwrap())
            .expect("transfer(address,uint256) should be indexed");
        assert_eq!(transfer.name, "transfer");
        assert_eq!(transfer.r#type, ContractFunctionType::Function);

        let getter = contract
            .get_function_from_selector(&hex::decode("70a08231").unwrap())
            .expect("the balanceOf getter should be indexed");
        assert_eq!(getter.name, "balanceOf");
        assert_eq!(getter.r#type, ContractFunctionType::Getter);
    }

    #[test]
    fn mismatched_selectors_are_corrected_from_method_identifiers() {
        let (input, mut output) = fixture_input_and_output();

        // Pretend the compiler canonicalized `transfer` differently than the
        // AST derivation did.
        let identifiers = &mut output
            .contracts
            .get_mut("contracts/Token.sol")
            .unwrap()
            .get_mut("Token")
            .unwrap()
            .evm
            .method_identifiers;
        identifiers.remove("transfer(address,uint256)");
        identifiers.insert("transfer(address,uint128)".to_string(), "11223344".to_string());

        let bytecodes = create_models_and_decode_bytecodes("0.8.19", &input, &output).unwrap();
        let contract = bytecodes[1].contract.read();

        let corrected = contract
            .get_function_from_selector(&hex::decode("11223344").unwrap())
            .expect("the compiler-reported selector should win");
        assert_eq!(corrected.name, "transfer");
    }
}
