//! In-memory representation of an EVM execution trace.
//!
//! Hosts record one [`MessageTrace`] per top-level transaction. Inner
//! messages appear both as steps of their parent and in the parent's
//! subtrace count.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, U256};

use crate::{build_model::Bytecode, exit_code::ExitCode};

/// An executed message and everything observed during it.
#[derive(Clone, Debug)]
pub enum MessageTrace {
    /// A contract deployment.
    Create(CreateMessageTrace),
    /// A call to an existing contract account.
    Call(CallMessageTrace),
    /// A call to a precompiled contract.
    Precompile(PrecompileMessageTrace),
}

impl MessageTrace {
    /// The fields common to all message kinds.
    pub fn base(&mut self) -> &mut BaseMessageTrace {
        match self {
            MessageTrace::Create(create) => &mut create.base.base,
            MessageTrace::Call(call) => &mut call.base.base,
            MessageTrace::Precompile(precompile) => &mut precompile.base,
        }
    }

    /// How the message ended.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            MessageTrace::Create(create) => create.base.base.exit_code,
            MessageTrace::Call(call) => call.base.base.exit_code,
            MessageTrace::Precompile(precompile) => precompile.base.exit_code,
        }
    }

    /// The data the message returned or reverted with.
    pub fn return_data(&self) -> &Bytes {
        match self {
            MessageTrace::Create(create) => &create.base.base.return_data,
            MessageTrace::Call(call) => &call.base.base.return_data,
            MessageTrace::Precompile(precompile) => &precompile.base.return_data,
        }
    }
}

/// Fields shared by every message kind.
#[derive(Clone, Debug)]
pub struct BaseMessageTrace {
    /// Value sent along with the message.
    pub value: U256,
    /// Data the message returned or reverted with.
    pub return_data: Bytes,
    /// How the message ended.
    pub exit_code: ExitCode,
    /// Gas consumed by the message.
    pub gas_used: u64,
    /// Message depth, starting at 0 for the transaction itself.
    pub depth: usize,
}

/// A call to a precompiled contract.
#[derive(Clone, Debug)]
pub struct PrecompileMessageTrace {
    /// Fields shared by every message kind.
    pub base: BaseMessageTrace,
    /// Number of the precompile, starting at 1.
    pub precompile: u32,
    /// Calldata the precompile was invoked with.
    pub calldata: Bytes,
}

/// Fields shared by create and call messages.
#[derive(Clone, Debug)]
pub struct BaseEvmMessageTrace {
    /// Fields shared by every message kind.
    pub base: BaseMessageTrace,
    /// The code that was executed.
    pub code: Bytes,
    /// Everything that happened while executing this message, in order: one
    /// entry per executed instruction, and one per spawned inner message.
    pub steps: Vec<MessageTraceStep>,
    /// The known bytecode matching `code`, once identification has run.
    pub bytecode: Option<Arc<Bytecode>>,
    /// Number of inner messages spawned directly by this one.
    pub number_of_subtraces: u32,
}

/// A contract deployment.
#[derive(Clone, Debug)]
pub struct CreateMessageTrace {
    /// Fields shared by create and call messages.
    pub base: BaseEvmMessageTrace,
    /// Address of the deployed contract, when the deployment succeeded.
    pub deployed_contract: Option<Bytes>,
}

impl CreateMessageTrace {
    /// The identified bytecode, if identification has run and succeeded.
    pub fn bytecode(&self) -> Option<&Arc<Bytecode>> {
        self.base.bytecode.as_ref()
    }

    /// The recorded steps.
    pub fn steps(&self) -> &[MessageTraceStep] {
        &self.base.steps
    }

    /// The data the message returned or reverted with.
    pub fn return_data(&self) -> &Bytes {
        &self.base.base.return_data
    }

    /// The value sent along with the message.
    pub fn value(&self) -> U256 {
        self.base.base.value
    }
}

/// A call to an existing contract account.
#[derive(Clone, Debug)]
pub struct CallMessageTrace {
    /// Fields shared by create and call messages.
    pub base: BaseEvmMessageTrace,
    /// Calldata the contract was invoked with.
    pub calldata: Bytes,
    /// Address of the contract receiving the call.
    pub address: Address,
    /// Address the executed code belongs to. Differs from `address` for
    /// `DELEGATECALL` and `CALLCODE`.
    pub code_address: Address,
}

impl CallMessageTrace {
    /// The identified bytecode, if identification has run and succeeded.
    pub fn bytecode(&self) -> Option<&Arc<Bytecode>> {
        self.base.bytecode.as_ref()
    }

    /// The recorded steps.
    pub fn steps(&self) -> &[MessageTraceStep] {
        &self.base.steps
    }

    /// The data the message returned or reverted with.
    pub fn return_data(&self) -> &Bytes {
        &self.base.base.return_data
    }

    /// The value sent along with the message.
    pub fn value(&self) -> U256 {
        self.base.base.value
    }

    /// The message depth, 0 for the transaction-level message.
    pub fn depth(&self) -> usize {
        self.base.base.depth
    }
}

/// One observed event inside a message.
#[derive(Clone, Debug)]
pub enum MessageTraceStep {
    /// An inner message spawned by a `CALL`-family or `CREATE`-family
    /// instruction.
    Message(MessageTrace),
    /// One executed instruction.
    Evm(EvmStep),
}

/// An executed instruction, identified by its program counter.
#[derive(Clone, Copy, Debug)]
pub struct EvmStep {
    /// Program counter of the instruction.
    pub pc: u32,
}

/// Borrowed view over the two message kinds that execute bytecode.
#[derive(Clone, Copy)]
pub(crate) enum CreateOrCallMessageRef<'a> {
    Create(&'a CreateMessageTrace),
    Call(&'a CallMessageTrace),
}

impl<'a> From<&'a CreateMessageTrace> for CreateOrCallMessageRef<'a> {
    fn from(create: &'a CreateMessageTrace) -> CreateOrCallMessageRef<'a> {
        CreateOrCallMessageRef::Create(create)
    }
}

impl<'a> From<&'a CallMessageTrace> for CreateOrCallMessageRef<'a> {
    fn from(call: &'a CallMessageTrace) -> CreateOrCallMessageRef<'a> {
        CreateOrCallMessageRef::Call(call)
    }
}

impl<'a> CreateOrCallMessageRef<'a> {
    pub fn bytecode(&self) -> Option<&'a Arc<Bytecode>> {
        match self {
            CreateOrCallMessageRef::Create(create) => create.base.bytecode.as_ref(),
            CreateOrCallMessageRef::Call(call) => call.base.bytecode.as_ref(),
        }
    }

    pub fn steps(&self) -> &'a [MessageTraceStep] {
        match self {
            CreateOrCallMessageRef::Create(create) => &create.base.steps,
            CreateOrCallMessageRef::Call(call) => &call.base.steps,
        }
    }

    pub fn number_of_subtraces(&self) -> u32 {
        match self {
            CreateOrCallMessageRef::Create(create) => create.base.number_of_subtraces,
            CreateOrCallMessageRef::Call(call) => call.base.number_of_subtraces,
        }
    }

    pub fn return_data(&self) -> &'a Bytes {
        match self {
            CreateOrCallMessageRef::Create(create) => &create.base.base.return_data,
            CreateOrCallMessageRef::Call(call) => &call.base.base.return_data,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            CreateOrCallMessageRef::Create(create) => create.base.base.exit_code,
            CreateOrCallMessageRef::Call(call) => call.base.base.exit_code,
        }
    }

    pub fn value(&self) -> U256 {
        match self {
            CreateOrCallMessageRef::Create(create) => create.base.base.value,
            CreateOrCallMessageRef::Call(call) => call.base.base.value,
        }
    }
}
