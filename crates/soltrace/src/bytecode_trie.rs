use std::{collections::HashMap, sync::Arc};

use crate::build_model::Bytecode;

/// The result of a trie lookup.
pub enum TrieSearch<'a> {
    /// The searched code matched a stored bytecode exactly.
    ExactHit(Arc<Bytecode>),
    /// No exact match; the node where the search diverged. Search can be
    /// resumed at this node after rewriting the code bytes that follow it.
    LongestPrefixNode(&'a BytecodeTrie),
}

/// A trie of bytecodes with one level per code byte.
///
/// Besides the usual child links, every node keeps the list of all bytecodes
/// stored below it, in insertion order. A failed lookup can then enumerate
/// the candidates sharing the matched prefix, which is what the library
/// address and metadata hash recovery steps work from.
pub struct BytecodeTrie {
    child_nodes: HashMap<u8, Box<BytecodeTrie>>,
    /// Bytecodes that continue past this node, in insertion order.
    pub descendants: Vec<Arc<Bytecode>>,
    /// Set when a stored bytecode ends exactly at this node.
    pub match_: Option<Arc<Bytecode>>,
    /// Index of the code byte that leads into this node. `None` for the root.
    pub depth: Option<usize>,
}

impl BytecodeTrie {
    pub fn new_root() -> BytecodeTrie {
        BytecodeTrie {
            child_nodes: HashMap::new(),
            descendants: Vec::new(),
            match_: None,
            depth: None,
        }
    }

    fn new_node(depth: usize) -> BytecodeTrie {
        BytecodeTrie {
            child_nodes: HashMap::new(),
            descendants: Vec::new(),
            match_: None,
            depth: Some(depth),
        }
    }

    pub fn is_root(&self) -> bool {
        self.depth.is_none()
    }

    pub fn add(&mut self, bytecode: Arc<Bytecode>) {
        let mut cursor = self;

        for (index, byte) in bytecode.normalized_code.iter().copied().enumerate() {
            cursor.descendants.push(bytecode.clone());

            cursor = cursor
                .child_nodes
                .entry(byte)
                .or_insert_with(|| Box::new(BytecodeTrie::new_node(index)));
        }

        // When several contracts have the exact same bytecode, metadata hash
        // included, the last one added wins.
        cursor.match_ = Some(bytecode);
    }

    /// Walks the trie along `code`, starting at `first_byte`.
    ///
    /// Returns an exact hit when a stored bytecode matches the whole code,
    /// the node of the longest shared prefix when the walk diverges, and
    /// `None` when the code runs out before any stored bytecode does.
    pub fn search(&self, code: &[u8], first_byte: usize) -> Option<TrieSearch<'_>> {
        if first_byte > code.len() {
            return None;
        }

        let mut cursor = self;

        for byte in &code[first_byte..] {
            match cursor.child_nodes.get(byte) {
                Some(child) => cursor = child,
                None => return Some(TrieSearch::LongestPrefixNode(cursor)),
            }
        }

        cursor.match_.clone().map(TrieSearch::ExactHit)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::RwLock;

    use super::*;
    use crate::build_model::{Contract, ContractKind, SourceFile, SourceLocation};

    fn make_bytecode(code: Vec<u8>) -> Arc<Bytecode> {
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
            "Test".to_string(),
            ContractKind::Contract,
            location,
        )));

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

    #[test]
    fn empty_trie_matches_nothing() {
        let trie = BytecodeTrie::new_root();

        assert!(trie.search(&[1, 2, 3], 0).is_none());
    }

    #[test]
    fn whole_key_match_is_an_exact_hit() {
        let mut trie = BytecodeTrie::new_root();
        let bytecode = make_bytecode(vec![1, 2, 3]);
        trie.add(bytecode.clone());

        match trie.search(&[1, 2, 3], 0) {
            Some(TrieSearch::ExactHit(found)) => assert!(Arc::ptr_eq(&found, &bytecode)),
            _ => panic!("expected an exact hit"),
        }
    }

    #[test]
    fn diverging_key_returns_the_longest_prefix_node() {
        let mut trie = BytecodeTrie::new_root();
        let bytecode = make_bytecode(vec![1, 2, 3, 4]);
        trie.add(bytecode.clone());

        match trie.search(&[1, 2, 9], 0) {
            Some(TrieSearch::LongestPrefixNode(node)) => {
                // The node was reached through the byte at index 1.
                assert_eq!(node.depth, Some(1));
                assert_eq!(node.descendants.len(), 1);
            }
            _ => panic!("expected a prefix node"),
        }
    }

    #[test]
    fn exhausted_key_without_a_stored_ending_matches_nothing() {
        let mut trie = BytecodeTrie::new_root();
        trie.add(make_bytecode(vec![1, 2, 3, 4]));

        assert!(trie.search(&[1, 2], 0).is_none());
    }

    #[test]
    fn last_added_duplicate_wins() {
        let mut trie = BytecodeTrie::new_root();
        let first = make_bytecode(vec![1, 2, 3]);
        let second = make_bytecode(vec![1, 2, 3]);
        trie.add(first);
        trie.add(second.clone());

        match trie.search(&[1, 2, 3], 0) {
            Some(TrieSearch::ExactHit(found)) => assert!(Arc::ptr_eq(&found, &second)),
            _ => panic!("expected an exact hit"),
        }
    }

    #[test]
    fn stored_prefix_is_reported_with_its_match() {
        let mut trie = BytecodeTrie::new_root();
        let short = make_bytecode(vec![1, 2, 3]);
        let long = make_bytecode(vec![1, 2, 3, 4, 5]);
        trie.add(short.clone());
        trie.add(long);

        // Diverges right after the stored short bytecode ends.
        match trie.search(&[1, 2, 3, 9], 0) {
            Some(TrieSearch::LongestPrefixNode(node)) => {
                assert!(node.match_.as_ref().is_some_and(|m| Arc::ptr_eq(m, &short)));
            }
            _ => panic!("expected a prefix node"),
        }
    }
}
