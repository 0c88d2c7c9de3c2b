//! Helpers for the library address placeholders solc leaves in unlinked
//! bytecode.

use alloy_primitives::hex;
use anyhow::Context;

use crate::artifacts::CompilerOutputBytecode;

/// Decodes a compiler output bytecode object, writing zeros over every
/// library address position so the result can be compared against other
/// instances of the same bytecode regardless of how they were linked.
pub fn normalize_compiler_output_bytecode(
    mut bytecode_object: String,
    address_positions: &[u32],
) -> Result<Vec<u8>, anyhow::Error> {
    const ZERO_ADDRESS: &str = "0000000000000000000000000000000000000000";

    for &position in address_positions {
        bytecode_object = link_hex_string_bytecode(bytecode_object, ZERO_ADDRESS, position)?;
    }

    Ok(hex::decode(bytecode_object)?)
}

/// Collects the byte offsets of every library address placeholder in a
/// compiler output bytecode.
pub fn get_library_address_positions(bytecode_output: &CompilerOutputBytecode) -> Vec<u32> {
    bytecode_output
        .link_references
        .values()
        .flat_map(|file_libraries| {
            file_libraries
                .values()
                .flat_map(|references| references.iter().map(|reference| reference.start))
        })
        .collect()
}

/// Writes an address into a hex bytecode string at the given byte position.
pub fn link_hex_string_bytecode(
    code: String,
    address: &str,
    position: u32,
) -> Result<String, anyhow::Error> {
    let address = address.strip_prefix("0x").unwrap_or(address);
    let char_index = position as usize * 2;

    let mut bytes = code.into_bytes();
    bytes
        .get_mut(char_index..char_index + address.len())
        .with_context(|| format!("Link position {position} is outside of the bytecode"))?
        .copy_from_slice(address.as_bytes());

    String::from_utf8(bytes).context("Bytecode and address must be valid hex strings")
}
