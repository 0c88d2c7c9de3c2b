//! Decoding of message traces: resolving the raw bytecode each message
//! executed to a known [`Bytecode`], so the rest of the crate can reason at
//! the Solidity level.

use std::{mem, sync::Arc};

use alloy_primitives::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    artifacts::BuildInfo,
    build_model::{Bytecode, ContractFunctionType},
    compiler::create_models_and_decode_bytecodes,
    contracts_identifier::ContractsIdentifier,
    message_trace::{MessageTrace, MessageTraceStep},
    solidity_stack_trace::{
        FALLBACK_FUNCTION_NAME, RECEIVE_FUNCTION_NAME, UNRECOGNIZED_CONTRACT_NAME,
        UNRECOGNIZED_FUNCTION_NAME,
    },
};

/// Build information the decoder is initialized from, as produced by the
/// compilation pipeline.
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracingConfig {
    /// The build infos to decode bytecodes from.
    pub build_infos: Option<Vec<BuildInfo>>,
    /// Whether contracts whose name starts with `Ignored` should be skipped.
    pub ignore_contracts: Option<bool>,
}

/// Matches the code executed by each message of a trace against the known
/// bytecodes, attaching the resolved [`Bytecode`] to the trace.
#[derive(Default)]
pub struct VmTraceDecoder {
    contracts_identifier: ContractsIdentifier,
}

impl VmTraceDecoder {
    /// Creates a decoder with no known bytecodes.
    pub fn new() -> VmTraceDecoder {
        Self::default()
    }

    /// Registers a bytecode so that later traces can be matched against it.
    pub fn add_bytecode(&mut self, bytecode: Arc<Bytecode>) {
        self.contracts_identifier.add_bytecode(bytecode);
    }

    /// Resolves the `bytecode` of the message and of every submessage,
    /// recursively. Code that matches no known bytecode is left undecoded.
    pub fn try_to_decode_message_trace(&mut self, message_trace: MessageTrace) -> MessageTrace {
        match message_trace {
            precompile @ MessageTrace::Precompile(..) => precompile,
            // NOTE: The branches below only differ in `is_create`.
            MessageTrace::Call(mut call) => {
                call.base.bytecode = self.contracts_identifier.identify(&call.base.code, false);
                call.base.steps = self.decode_steps(mem::take(&mut call.base.steps));

                MessageTrace::Call(call)
            }
            MessageTrace::Create(mut create) => {
                create.base.bytecode = self.contracts_identifier.identify(&create.base.code, true);
                create.base.steps = self.decode_steps(mem::take(&mut create.base.steps));

                MessageTrace::Create(create)
            }
        }
    }

    fn decode_steps(&mut self, steps: Vec<MessageTraceStep>) -> Vec<MessageTraceStep> {
        steps
            .into_iter()
            .map(|step| match step {
                MessageTraceStep::Evm(step) => MessageTraceStep::Evm(step),
                MessageTraceStep::Message(message) => {
                    MessageTraceStep::Message(self.try_to_decode_message_trace(message))
                }
            })
            .collect()
    }

    /// Resolves the names to display for a call to a contract with the given
    /// code. `calldata` should be `None` for create messages; a function name
    /// is only resolved for calls.
    pub fn get_contract_and_function_names_for_call(
        &mut self,
        code: &Bytes,
        calldata: Option<&Bytes>,
    ) -> ContractAndFunctionName {
        let is_create = calldata.is_none();

        let Some(bytecode) = self.contracts_identifier.identify(code, is_create) else {
            return ContractAndFunctionName {
                contract_name: UNRECOGNIZED_CONTRACT_NAME.to_string(),
                function_name: if is_create { None } else { Some(String::new()) },
            };
        };

        let contract = bytecode.contract.read();
        let contract_name = contract.name.clone();

        let Some(calldata) = calldata else {
            return ContractAndFunctionName {
                contract_name,
                function_name: None,
            };
        };

        let selector = calldata.get(..4).unwrap_or(calldata);

        let function_name = match contract.get_function_from_selector(selector) {
            Some(function) => match function.r#type {
                ContractFunctionType::Fallback => FALLBACK_FUNCTION_NAME.to_string(),
                ContractFunctionType::Receive => RECEIVE_FUNCTION_NAME.to_string(),
                _ => function.name.clone(),
            },
            None => UNRECOGNIZED_FUNCTION_NAME.to_string(),
        };

        ContractAndFunctionName {
            contract_name,
            function_name: Some(function_name),
        }
    }
}

/// The names to display for a call, as resolved by
/// [`VmTraceDecoder::get_contract_and_function_names_for_call`].
pub struct ContractAndFunctionName {
    /// The name of the contract, or `<UnrecognizedContract>`.
    pub contract_name: String,
    /// The name of the called function. `None` for create messages.
    pub function_name: Option<String>,
}

/// Registers every bytecode from the build infos in `config` with the
/// decoder.
pub fn initialize_vm_trace_decoder(
    vm_trace_decoder: &mut VmTraceDecoder,
    config: TracingConfig,
) -> anyhow::Result<()> {
    let Some(build_infos) = config.build_infos else {
        return Ok(());
    };

    for build_info in &build_infos {
        let bytecodes = create_models_and_decode_bytecodes(
            &build_info.solc_version,
            &build_info.input,
            &build_info.output,
        )?;

        for bytecode in bytecodes {
            if config.ignore_contracts == Some(true)
                && bytecode.contract.read().name.starts_with("Ignored")
            {
                continue;
            }

            vm_trace_decoder.add_bytecode(bytecode);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use alloy_primitives::{Address, U256};
    use parking_lot::RwLock;

    use super::*;
    use crate::{
        build_model::{
            Contract, ContractFunction, ContractFunctionVisibility, ContractKind, SourceFile,
            SourceLocation,
        },
        exit_code::ExitCode,
        message_trace::{BaseEvmMessageTrace, BaseMessageTrace, CallMessageTrace},
    };

    const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];

    fn make_bytecode(contract_name: &str, code: Vec<u8>) -> Arc<Bytecode> {
        let mut sources = HashMap::new();
        sources.insert(
            0,
            Arc::new(RwLock::new(SourceFile::new(
                "test.sol".to_string(),
                String::new(),
            ))),
        );
        let sources = Arc::new(sources);

        let location = Arc::new(SourceLocation::new(&sources, 0, 0, 0));
        let contract = Arc::new(RwLock::new(Contract::new(
            contract_name.to_string(),
            ContractKind::Contract,
            location.clone(),
        )));

        let transfer = Arc::new(ContractFunction {
            name: "transfer".to_string(),
            r#type: ContractFunctionType::Function,
            location,
            contract_name: Some(contract_name.to_string()),
            visibility: Some(ContractFunctionVisibility::External),
            is_payable: Some(false),
            selector: RwLock::new(Some(TRANSFER_SELECTOR.to_vec())),
        });
        contract.write().add_local_function(transfer);

        Arc::new(Bytecode::new(
            sources,
            contract,
            false,
            code,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            "0.8.19".to_string(),
        ))
    }

    fn call_trace(code: Vec<u8>, steps: Vec<MessageTraceStep>) -> CallMessageTrace {
        let number_of_subtraces = steps
            .iter()
            .filter(|step| matches!(step, MessageTraceStep::Message(_)))
            .count() as u32;

        CallMessageTrace {
            base: BaseEvmMessageTrace {
                base: BaseMessageTrace {
                    value: U256::ZERO,
                    return_data: Bytes::new(),
                    exit_code: ExitCode::Success,
                    gas_used: 0,
                    depth: 0,
                },
                code: code.into(),
                steps,
                bytecode: None,
                number_of_subtraces,
            },
            calldata: Bytes::new(),
            address: Address::repeat_byte(0x11),
            code_address: Address::repeat_byte(0x11),
        }
    }

    #[test]
    fn unknown_code_is_reported_as_unrecognized() {
        let mut decoder = VmTraceDecoder::new();
        let code = Bytes::from_static(&[0xde, 0xad]);

        let names = decoder.get_contract_and_function_names_for_call(&code, None);
        assert_eq!(names.contract_name, UNRECOGNIZED_CONTRACT_NAME);
        assert_eq!(names.function_name, None);

        let names = decoder.get_contract_and_function_names_for_call(&code, Some(&Bytes::new()));
        assert_eq!(names.contract_name, UNRECOGNIZED_CONTRACT_NAME);
        assert_eq!(names.function_name, Some(String::new()));
    }

    #[test]
    fn known_code_resolves_contract_and_function_names() {
        let mut decoder = VmTraceDecoder::new();
        decoder.add_bytecode(make_bytecode("Token", vec![1, 2, 3, 4, 5]));

        let code = Bytes::from_static(&[1, 2, 3, 4, 5]);

        let names = decoder.get_contract_and_function_names_for_call(&code, None);
        assert_eq!(names.contract_name, "Token");
        assert_eq!(names.function_name, None);

        let mut calldata = TRANSFER_SELECTOR.to_vec();
        calldata.extend([0u8; 32]);
        let names =
            decoder.get_contract_and_function_names_for_call(&code, Some(&calldata.into()));
        assert_eq!(names.contract_name, "Token");
        assert_eq!(names.function_name, Some("transfer".to_string()));

        let names = decoder.get_contract_and_function_names_for_call(
            &code,
            Some(&Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef])),
        );
        assert_eq!(names.contract_name, "Token");
        assert_eq!(
            names.function_name,
            Some(UNRECOGNIZED_FUNCTION_NAME.to_string())
        );
    }

    #[test]
    fn decoding_resolves_bytecodes_at_every_depth() {
        let mut decoder = VmTraceDecoder::new();
        let outer = make_bytecode("Outer", vec![1, 2, 3, 4, 5]);
        let inner = make_bytecode("Inner", vec![6, 7, 8, 9, 10]);
        decoder.add_bytecode(outer.clone());
        decoder.add_bytecode(inner.clone());

        let submessage = MessageTrace::Call(call_trace(vec![6, 7, 8, 9, 10], Vec::new()));
        let trace = call_trace(
            vec![1, 2, 3, 4, 5],
            vec![MessageTraceStep::Message(submessage)],
        );

        let decoded = decoder.try_to_decode_message_trace(MessageTrace::Call(trace));

        let MessageTrace::Call(call) = decoded else {
            panic!("expected a call trace");
        };
        let bytecode = call.bytecode().expect("the outer code should be matched");
        assert!(Arc::ptr_eq(bytecode, &outer));

        let [MessageTraceStep::Message(MessageTrace::Call(subcall))] = call.steps() else {
            panic!("expected a single submessage step");
        };
        let bytecode = subcall.bytecode().expect("the inner code should be matched");
        assert!(Arc::ptr_eq(bytecode, &inner));
    }

    #[test]
    fn unmatched_code_is_left_undecoded() {
        let mut decoder = VmTraceDecoder::new();
        decoder.add_bytecode(make_bytecode("Token", vec![1, 2, 3, 4, 5]));

        let trace = call_trace(vec![0xde, 0xad, 0xbe, 0xef], Vec::new());
        let decoded = decoder.try_to_decode_message_trace(MessageTrace::Call(trace));

        let MessageTrace::Call(call) = decoded else {
            panic!("expected a call trace");
        };
        assert!(call.bytecode().is_none());
    }
}
