//! Benchmark for registering bytecodes in a `ContractsIdentifier` and
//! looking traces up against them.
//!
//! The bytecodes are synthetic: the shared dispatcher prologue solc emits,
//! a per-contract body and a metadata tail, so the trie sees the same shape
//! real compiler output produces.

use std::{collections::HashMap, sync::Arc, time::Duration};

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parking_lot::RwLock;
use soltrace::{
    build_model::{Bytecode, Contract, ContractKind, SourceFile, SourceLocation},
    contracts_identifier::ContractsIdentifier,
};

const CONTRACT_COUNT: usize = 100;
const CODE_LEN: usize = 1024;

fn synthetic_bytecodes() -> Vec<Arc<Bytecode>> {
    let mut sources = HashMap::new();
    sources.insert(
        0,
        Arc::new(RwLock::new(SourceFile::new(
            "bench.sol".to_string(),
            String::new(),
        ))),
    );
    let sources = Arc::new(sources);

    (0..CONTRACT_COUNT)
        .map(|index| {
            // The free memory pointer setup every solc contract starts with.
            let mut code = vec![0x60, 0x80, 0x60, 0x40, 0x52];
            code.extend((code.len()..CODE_LEN - 34).map(|offset| (offset * 31 + index * 7) as u8));
            // REVERT; INVALID; metadata.
            code.push(0xfd);
            code.push(0xfe);
            code.extend((0..32).map(|offset| (offset + index) as u8));

            let location = Arc::new(SourceLocation::new(&sources, 0, 0, 0));
            let contract = Arc::new(RwLock::new(Contract::new(
                format!("Contract{index}"),
                ContractKind::Contract,
                location,
            )));

            Arc::new(Bytecode::new(
                sources.clone(),
                contract,
                false,
                code,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                "0.8.19".to_string(),
            ))
        })
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let bytecodes = synthetic_bytecodes();

    c.bench_function("add_bytecodes", |b| {
        b.iter(|| {
            let mut identifier = ContractsIdentifier::new(false);
            for bytecode in &bytecodes {
                identifier.add_bytecode(bytecode.clone());
            }
            identifier
        })
    });

    // The cache stays disabled so that every lookup walks the trie.
    let mut identifier = ContractsIdentifier::new(false);
    for bytecode in &bytecodes {
        identifier.add_bytecode(bytecode.clone());
    }

    c.bench_function("identify_known_code", |b| {
        b.iter(|| {
            for bytecode in &bytecodes {
                black_box(identifier.identify(&bytecode.normalized_code, false));
            }
        })
    });
}

criterion_group!(name = benches; config = Criterion::default().measurement_time(Duration::from_secs(30)); targets = criterion_benchmark);
criterion_main!(benches);
