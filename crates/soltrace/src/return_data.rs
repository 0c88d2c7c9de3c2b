//! Decoding of the data a message returned or reverted with.

use alloy_primitives::{Bytes, U256};
use alloy_sol_types::SolError;

// Solidity's built-in error types.
// See <https://docs.soliditylang.org/en/latest/control-structures.html#error-handling-assert-require-revert-and-exceptions>
alloy_sol_types::sol! {
    error Error(string);
    error Panic(uint256);
}

/// Return data of a message, with its 4-byte selector split off when there is
/// one.
pub struct ReturnData {
    /// The raw return data.
    pub value: Bytes,
    selector: Option<[u8; 4]>,
}

impl ReturnData {
    /// Wraps raw return data.
    pub fn new(value: Bytes) -> ReturnData {
        let selector = value.first_chunk::<4>().copied();

        ReturnData { value, selector }
    }

    /// Whether no data was returned at all.
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Whether the return data starts with the provided selector.
    pub fn matches_selector(&self, selector: impl AsRef<[u8]>) -> bool {
        self.selector
            .is_some_and(|value| value == selector.as_ref())
    }

    /// Whether this is an `Error(string)` revert, as produced by `revert` and
    /// `require` with a reason string.
    pub fn is_error_return_data(&self) -> bool {
        self.selector == Some(Error::SELECTOR)
    }

    /// Whether this is a `Panic(uint256)` revert, as produced by `assert` and
    /// checked arithmetic.
    pub fn is_panic_return_data(&self) -> bool {
        self.selector == Some(Panic::SELECTOR)
    }

    /// Decodes the reason string of an `Error(string)` revert.
    pub fn decode_error(&self) -> Result<String, alloy_sol_types::Error> {
        Error::abi_decode(&self.value).map(|error| error.0)
    }

    /// Decodes the error code of a `Panic(uint256)` revert.
    pub fn decode_panic(&self) -> Result<U256, alloy_sol_types::Error> {
        Panic::abi_decode(&self.value).map(|panic| panic.0)
    }
}

/// Renders a `Panic(uint256)` error code the way solc documents them.
pub fn panic_error_code_to_message(error_code: U256) -> String {
    let message = match u64::try_from(error_code) {
        Ok(0x01) => Some("Assertion error"),
        Ok(0x11) => Some("Arithmetic operation overflowed outside of an unchecked block"),
        Ok(0x12) => Some("Division or modulo division by zero"),
        Ok(0x21) => Some("Tried to convert a value into an enum, but the value was too big or negative"),
        Ok(0x22) => Some("Incorrectly encoded storage byte array"),
        Ok(0x31) => Some(".pop() was called on an empty array"),
        Ok(0x32) => Some("Array accessed at an out-of-bounds or negative index"),
        Ok(0x41) => Some("Too much memory was allocated, or an array was too large"),
        Ok(0x51) => Some("Called a zero-initialized variable of internal function type"),
        _ => None,
    };

    match message {
        Some(message) => format!("reverted with panic code {error_code:#x} ({message})"),
        None => format!("reverted with unknown panic code {error_code:#x}"),
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::hex;

    use super::*;

    #[test]
    fn selectors_of_the_builtin_errors() {
        assert_eq!(Error::SELECTOR, hex!("08c379a0"));
        assert_eq!(Panic::SELECTOR, hex!("4e487b71"));
    }

    #[test]
    fn error_reason_round_trips() {
        let encoded = Error("Invalid amount".to_string()).abi_encode();

        let return_data = ReturnData::new(encoded.into());
        assert!(return_data.is_error_return_data());
        assert!(!return_data.is_panic_return_data());
        assert_eq!(return_data.decode_error().unwrap(), "Invalid amount");
    }

    #[test]
    fn panic_code_round_trips() {
        let encoded = Panic(U256::from(0x32)).abi_encode();

        let return_data = ReturnData::new(encoded.into());
        assert!(return_data.is_panic_return_data());
        assert_eq!(return_data.decode_panic().unwrap(), U256::from(0x32));
    }

    #[test]
    fn short_data_has_no_selector() {
        let return_data = ReturnData::new(Bytes::from_static(&[0x08, 0xc3]));

        assert!(!return_data.is_empty());
        assert!(!return_data.matches_selector(hex!("08c379a0")));
    }

    #[test]
    fn panic_messages_cover_the_documented_codes() {
        assert_eq!(
            panic_error_code_to_message(U256::from(0x32)),
            "reverted with panic code 0x32 (Array accessed at an out-of-bounds or negative index)"
        );
        assert_eq!(
            panic_error_code_to_message(U256::from(0x99)),
            "reverted with unknown panic code 0x99"
        );
    }
}
