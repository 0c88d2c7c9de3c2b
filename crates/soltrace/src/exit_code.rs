//! Exit status of an executed message.

use std::fmt;

/// How the execution of a message ended.
///
/// Hosts map their EVM's halt reasons onto this before handing traces over;
/// anything without a dedicated variant becomes [`ExitCode::InternalError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    /// Execution ran to completion with `STOP`, `RETURN` or `SELFDESTRUCT`.
    Success,
    /// Execution reverted with `REVERT`.
    Revert,
    /// Execution ran out of gas.
    OutOfGas,
    /// Execution reached an `INVALID` or undefined opcode.
    InvalidOpcode,
    /// A stack operation had too few operands.
    StackUnderflow,
    /// The contract being deployed exceeds the code size limit.
    CodesizeExceedsMaximum,
    /// An account already exists at the address being created.
    CreateCollision,
    /// Any other exceptional halt.
    InternalError,
}

impl ExitCode {
    /// Whether the message failed.
    pub fn is_error(self) -> bool {
        !matches!(self, ExitCode::Success)
    }

    /// Whether the message explicitly reverted.
    pub fn is_revert(self) -> bool {
        matches!(self, ExitCode::Revert)
    }

    /// Whether the message ran out of gas.
    pub fn is_out_of_gas_error(self) -> bool {
        matches!(self, ExitCode::OutOfGas)
    }

    /// Whether the message halted on an invalid or undefined opcode.
    pub fn is_invalid_opcode_error(self) -> bool {
        matches!(self, ExitCode::InvalidOpcode)
    }

    /// Whether a deployment failed because the resulting contract would be
    /// too large.
    pub fn is_contract_too_large_error(self) -> bool {
        matches!(self, ExitCode::CodesizeExceedsMaximum)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Success => write!(f, "Success"),
            ExitCode::Revert => write!(f, "Reverted"),
            ExitCode::OutOfGas => write!(f, "Out of gas"),
            ExitCode::InvalidOpcode => write!(f, "Invalid opcode"),
            ExitCode::StackUnderflow => write!(f, "Stack underflow"),
            ExitCode::CodesizeExceedsMaximum => write!(f, "Codesize exceeds maximum"),
            ExitCode::CreateCollision => write!(f, "Create collision"),
            ExitCode::InternalError => write!(f, "Internal error"),
        }
    }
}
