//! Maps the code observed in a message to a known contract bytecode.
//!
//! Lookups go through a trie of normalized bytecodes and tolerate the ways
//! deployed code can differ from the compiler output: appended constructor
//! arguments, linked library addresses, written immutable slots, and a
//! different metadata hash.

use std::{borrow::Cow, collections::HashMap, sync::Arc};

use alloy_primitives::Address;
use revm_bytecode::OpCode;

use crate::{
    build_model::Bytecode,
    bytecode_trie::{BytecodeTrie, TrieSearch},
};

/// Whether the region of `code` before `first_diff_byte` ends with the
/// `REVERT; INVALID` sequence that precedes the metadata hash. When it does,
/// a divergence at `first_diff_byte` or later is confined to the metadata.
fn is_matching_metadata(code: &[u8], first_diff_byte: usize) -> bool {
    let mut byte = 0;

    while byte < first_diff_byte {
        // Unknown opcodes come from code compiled for other chains.
        let Some(opcode) = code.get(byte).copied().and_then(OpCode::new) else {
            return false;
        };

        let next = code.get(byte + 1).copied().and_then(OpCode::new);
        if opcode == OpCode::REVERT && next == Some(OpCode::INVALID) {
            return true;
        }

        byte += 1 + usize::from(opcode.info().immediate_size());
    }

    false
}

/// An index of known bytecodes, searchable by the code a message executed.
pub struct ContractsIdentifier {
    trie: BytecodeTrie,
    cache: HashMap<Vec<u8>, Arc<Bytecode>>,
    enable_cache: bool,
}

impl Default for ContractsIdentifier {
    fn default() -> ContractsIdentifier {
        ContractsIdentifier::new(true)
    }
}

impl ContractsIdentifier {
    /// Creates an empty identifier. Successful lookups are memoized unless
    /// `enable_cache` is false.
    pub fn new(enable_cache: bool) -> ContractsIdentifier {
        ContractsIdentifier {
            trie: BytecodeTrie::new_root(),
            cache: HashMap::new(),
            enable_cache,
        }
    }

    /// Registers a known bytecode.
    pub fn add_bytecode(&mut self, bytecode: Arc<Bytecode>) {
        self.trie.add(bytecode);
        self.cache.clear();
    }

    /// Searches for the known bytecode matching the code of a call or create
    /// message.
    pub fn identify(&mut self, code: &[u8], is_create: bool) -> Option<Arc<Bytecode>> {
        let normalized_code = normalize_library_runtime_bytecode_if_necessary(code);

        if self.enable_cache {
            if let Some(cached) = self.cache.get(normalized_code.as_ref()) {
                return Some(cached.clone());
            }
        }

        let result = Self::search_bytecode_at_depth(is_create, &normalized_code, true, &self.trie, 0);

        if self.enable_cache {
            if let Some(result) = &result {
                self.cache.insert(normalized_code.into_owned(), result.clone());
            }
        }

        result
    }

    fn search_bytecode_at_depth(
        is_create: bool,
        code: &[u8],
        normalize_libraries: bool,
        trie: &BytecodeTrie,
        first_byte: usize,
    ) -> Option<Arc<Bytecode>> {
        let node = match trie.search(code, first_byte)? {
            TrieSearch::ExactHit(bytecode) => return Some(bytecode),
            TrieSearch::LongestPrefixNode(node) => node,
        };

        // Deployment messages carry the abi-encoded constructor arguments
        // after the bytecode. Their length is unknown, since which contract
        // is being deployed is exactly what's being determined here, and the
        // caller may have passed the wrong arguments anyway. A stored
        // deployment bytecode that is a strict prefix of the executed code is
        // taken as the match: real deployment bytecodes end with their
        // metadata hash, so one being a prefix of another doesn't happen.
        if is_create {
            if let Some(prefix_match) = &node.match_ {
                if prefix_match.is_deployment {
                    return Some(prefix_match.clone());
                }
            }
        }

        // Index of the first byte that diverged from the trie.
        let first_diff_byte = node.depth.map_or(0, |depth| depth + 1);

        if normalize_libraries {
            // The divergence may be inside a linked library address or a
            // written immutable slot. Those are zeroed in the stored
            // normalized bytecodes, so zero them in the searched code too and
            // retry, once per candidate layout.
            for candidate in &node.descendants {
                if candidate.library_address_positions.is_empty()
                    && candidate.immutable_references.is_empty()
                {
                    continue;
                }

                let normalized_code = zero_out_linked_parts(code, candidate);

                let result = Self::search_bytecode_at_depth(
                    is_create,
                    &normalized_code,
                    false,
                    node,
                    first_diff_byte,
                );

                if result.is_some() {
                    return result;
                }
            }
        }

        // The whole executable region matched and the divergence starts
        // within the metadata hash. Every descendant is then the same
        // executable code modulo metadata; the most recently added one wins.
        if !node.is_root() && is_matching_metadata(code, first_diff_byte) {
            return node.descendants.last().cloned();
        }

        None
    }
}

fn zero_out_linked_parts(code: &[u8], bytecode: &Bytecode) -> Vec<u8> {
    let mut normalized_code = code.to_vec();

    for &position in &bytecode.library_address_positions {
        let position = position as usize;
        if let Some(address_bytes) =
            normalized_code.get_mut(position..position + Address::len_bytes())
        {
            address_bytes.fill(0);
        }
    }

    for reference in &bytecode.immutable_references {
        let start = reference.start as usize;
        if let Some(slot_bytes) = normalized_code.get_mut(start..start + reference.length as usize)
        {
            slot_bytes.fill(0);
        }
    }

    normalized_code
}

/// Solidity 0.4.20 and later protect libraries from being called directly by
/// comparing the executing address against one hardcoded at deployment time.
/// The runtime code therefore starts with a `PUSH20 <address>`, which the
/// compiler output has zeroed. Zero it here as well before searching.
fn normalize_library_runtime_bytecode_if_necessary(bytecode: &[u8]) -> Cow<'_, [u8]> {
    let mut bytecode = Cow::Borrowed(bytecode);

    if bytecode.first().copied() == Some(OpCode::PUSH20.get()) {
        if let Some(address_bytes) = bytecode.to_mut().get_mut(1..=Address::len_bytes()) {
            address_bytes.fill(0);
        }
    }

    bytecode
}

#[cfg(test)]
mod tests {
    use parking_lot::RwLock;

    use super::*;
    use crate::{
        artifacts::ImmutableReference,
        build_model::{Contract, ContractKind, SourceFile, SourceLocation},
    };

    fn make_sources() -> Arc<HashMap<u32, Arc<RwLock<SourceFile>>>> {
        let mut sources = HashMap::new();
        sources.insert(
            0,
            Arc::new(RwLock::new(SourceFile::new(
                "test.sol".to_string(),
                String::new(),
            ))),
        );

        Arc::new(sources)
    }

    fn make_bytecode(
        code: Vec<u8>,
        is_deployment: bool,
        library_address_positions: Vec<u32>,
        immutable_references: Vec<ImmutableReference>,
    ) -> Arc<Bytecode> {
        let sources = make_sources();
        let location = Arc::new(SourceLocation::new(&sources, 0, 0, 0));
        let contract = Arc::new(RwLock::new(Contract::new(
            "Test".to_string(),
            ContractKind::Contract,
            location,
        )));

        Arc::new(Bytecode::new(
            sources,
            contract,
            is_deployment,
            code,
            Vec::new(),
            library_address_positions,
            immutable_references,
            "0.8.19".to_string(),
        ))
    }

    fn make_runtime_bytecode(code: Vec<u8>) -> Arc<Bytecode> {
        make_bytecode(code, false, Vec::new(), Vec::new())
    }

    fn assert_identifies(found: Option<Arc<Bytecode>>, expected: &Arc<Bytecode>) {
        let found = found.expect("expected the bytecode to be identified");
        assert!(Arc::ptr_eq(&found, expected));
    }

    #[test]
    fn empty_identifier_finds_nothing() {
        let mut identifier = ContractsIdentifier::default();

        assert!(identifier.identify(&[1, 2, 3, 4, 5], false).is_none());
        assert!(identifier.identify(&[1, 2, 3, 4, 5], true).is_none());
    }

    #[test]
    fn exact_runtime_code_is_identified() {
        let mut identifier = ContractsIdentifier::default();
        let bytecode = make_runtime_bytecode(vec![1, 2, 3, 4, 5]);
        identifier.add_bytecode(bytecode.clone());

        assert_identifies(identifier.identify(&[1, 2, 3, 4, 5], false), &bytecode);
        assert!(identifier.identify(&[1, 2, 3, 4, 6], false).is_none());
    }

    #[test]
    fn nested_prefixes_are_told_apart() {
        let mut identifier = ContractsIdentifier::default();
        let short = make_runtime_bytecode(vec![1, 2, 3, 4, 5]);
        let long = make_runtime_bytecode(vec![1, 2, 3, 4, 5, 6, 7, 8]);
        identifier.add_bytecode(short.clone());
        identifier.add_bytecode(long.clone());

        assert_identifies(identifier.identify(&[1, 2, 3, 4, 5], false), &short);
        assert_identifies(identifier.identify(&[1, 2, 3, 4, 5, 6, 7, 8], false), &long);
        assert!(
            identifier
                .identify(&[0, 1, 2, 3, 4, 5, 6, 7, 8], false)
                .is_none()
        );
    }

    #[test]
    fn a_shared_prefix_alone_is_not_a_match() {
        let mut identifier = ContractsIdentifier::default();
        identifier.add_bytecode(make_runtime_bytecode(vec![1, 2, 3, 4, 5]));
        identifier.add_bytecode(make_runtime_bytecode(vec![1, 2, 3, 6, 7]));

        assert!(identifier.identify(&[1, 2, 3], false).is_none());
    }

    #[test]
    fn deployment_code_matches_despite_trailing_constructor_arguments() {
        let mut identifier = ContractsIdentifier::default();
        let deployment = make_bytecode(vec![1, 2, 3, 4, 5], true, Vec::new(), Vec::new());
        identifier.add_bytecode(deployment.clone());

        // Extra bytes after the stored deployment bytecode are constructor
        // arguments, but only for create messages.
        assert_identifies(
            identifier.identify(&[1, 2, 3, 4, 5, 10, 11], true),
            &deployment,
        );
        assert!(identifier.identify(&[1, 2, 3, 4, 5, 10, 11], false).is_none());

        // A runtime bytecode prefix never matches that way.
        let mut identifier = ContractsIdentifier::default();
        identifier.add_bytecode(make_runtime_bytecode(vec![1, 2, 3, 4, 5]));

        assert!(identifier.identify(&[1, 2, 3, 4, 5, 10, 11], true).is_none());
        assert!(identifier.identify(&[1, 2, 3, 4, 5, 10, 11], false).is_none());
    }

    #[test]
    fn linked_library_addresses_are_ignored() {
        let mut identifier = ContractsIdentifier::default();

        let mut code = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20];
        code.extend([0u8; 20]); // the library address slot, zeroed
        code.extend([21, 22, 23, 24, 25]);

        let bytecode = make_bytecode(code, false, vec![20], Vec::new());
        identifier.add_bytecode(bytecode.clone());

        let mut deployed = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20];
        deployed.extend(101..=120); // an actual address was linked in
        deployed.extend([21, 22, 23, 24, 25]);

        assert_identifies(identifier.identify(&deployed, false), &bytecode);
    }

    #[test]
    fn written_immutable_slots_are_ignored() {
        let mut identifier = ContractsIdentifier::default();

        let mut code = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20];
        code.extend([0u8; 10]); // the immutable slot, zeroed
        code.extend([21, 22, 23, 24, 25]);

        let bytecode = make_bytecode(
            code,
            false,
            Vec::new(),
            vec![ImmutableReference {
                start: 20,
                length: 10,
            }],
        );
        identifier.add_bytecode(bytecode.clone());

        let mut deployed = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20];
        deployed.extend(101..=110); // the value the constructor wrote
        deployed.extend([21, 22, 23, 24, 25]);

        assert_identifies(identifier.identify(&deployed, false), &bytecode);
    }

    #[test]
    fn libraries_and_immutables_can_both_be_present() {
        let mut identifier = ContractsIdentifier::default();

        let mut code = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20];
        code.extend([0u8; 10]); // immutable slot at 20
        code.extend([21, 22, 23, 24, 25]);
        code.extend([0u8; 20]); // library address at 35
        code.extend([26, 27, 28, 29, 30]);
        code.extend([0u8; 20]); // another library address at 60
        code.extend([31, 32, 33, 34, 35]);
        code.extend([0u8; 30]); // immutable slot at 85
        code.extend([36, 37, 38, 39, 40]);

        let bytecode = make_bytecode(
            code,
            false,
            vec![35, 60],
            vec![
                ImmutableReference {
                    start: 20,
                    length: 10,
                },
                ImmutableReference {
                    start: 85,
                    length: 30,
                },
            ],
        );
        identifier.add_bytecode(bytecode.clone());

        let mut deployed = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20];
        deployed.extend(101..=110);
        deployed.extend([21, 22, 23, 24, 25]);
        deployed.extend(201..=220);
        deployed.extend([26, 27, 28, 29, 30]);
        deployed.extend(221..=240);
        deployed.extend([31, 32, 33, 34, 35]);
        deployed.extend(111..=140);
        deployed.extend([36, 37, 38, 39, 40]);

        assert_identifies(identifier.identify(&deployed, false), &bytecode);
    }

    #[test]
    fn a_different_metadata_hash_still_matches() {
        let mut identifier = ContractsIdentifier::default();

        let bytecode = make_runtime_bytecode(vec![
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10,
            // REVERT; INVALID; metadata
            0xfd, 0xfe, 11, 12, 13, 14, 15,
        ]);
        identifier.add_bytecode(bytecode.clone());

        let same_code_other_metadata = [
            1, 2, 3, 4, 5, 6, 7, 8, 9, 10, //
            0xfd, 0xfe, 21, 22, 23,
        ];

        assert_identifies(
            identifier.identify(&same_code_other_metadata, false),
            &bytecode,
        );
    }

    #[test]
    fn directly_called_library_runtime_code_is_normalized() {
        let mut identifier = ContractsIdentifier::default();

        let mut code = vec![0x73]; // PUSH20
        code.extend([0u8; 20]); // the address placeholder, zeroed in the output
        code.extend([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        let bytecode = make_runtime_bytecode(code);
        identifier.add_bytecode(bytecode.clone());

        let mut deployed = vec![0x73];
        deployed.extend(21..=40); // the deployed library's own address
        deployed.extend([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        assert_identifies(identifier.identify(&deployed, false), &bytecode);
    }

    #[test]
    fn adding_a_bytecode_invalidates_the_cache() {
        let mut identifier = ContractsIdentifier::default();

        let first = make_runtime_bytecode(vec![1, 2, 3]);
        identifier.add_bytecode(first.clone());
        assert_identifies(identifier.identify(&[1, 2, 3], false), &first);

        // Same code registered again; the trie keeps the newer one, and the
        // cached result must not shadow it.
        let second = make_runtime_bytecode(vec![1, 2, 3]);
        identifier.add_bytecode(second.clone());
        assert_identifies(identifier.identify(&[1, 2, 3], false), &second);
    }

    #[test]
    fn metadata_detection_needs_the_revert_invalid_boundary() {
        assert!(is_matching_metadata(&[0x01, 0xfd, 0xfe, 0x55], 3));
        // No REVERT; INVALID before the divergence.
        assert!(!is_matching_metadata(&[0x01, 0x02, 0x03, 0x04], 3));
        // The boundary is hidden inside PUSH data.
        assert!(!is_matching_metadata(&[0x61, 0xfd, 0xfe, 0x04], 3));
    }
}
