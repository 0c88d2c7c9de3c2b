//! Decoding of `console.log` calls found in execution traces.

use std::collections::HashMap;

use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{Address, address, hex, keccak256};
use itertools::Itertools as _;

use crate::message_trace::{MessageTrace, MessageTraceStep};

/// The address `console.sol` sends its logging calls to. Spells
/// `console.log` in ASCII.
pub const CONSOLE_ADDRESS: Address = address!("000000000000000000636F6e736F6c652e6c6f67");

/// The argument types behind every `console.sol` entry point, keyed by
/// selector.
///
/// The table covers all `log(...)` combinations of up to four arguments over
/// `uint256`, `string`, `bool` and `address`, the same combinations in the
/// abbreviated `uint` spelling older `console.sol` copies were generated
/// with, and the named single-argument variants (`logUint`, `logBytes3`,
/// ...).
pub struct ConsoleLogger {
    signatures: HashMap<[u8; 4], Vec<DynSolType>>,
}

impl Default for ConsoleLogger {
    fn default() -> ConsoleLogger {
        ConsoleLogger {
            signatures: build_signatures(),
        }
    }
}

impl ConsoleLogger {
    /// Collects the rendered `console.log` invocations found anywhere in the
    /// trace, in execution order.
    pub fn get_decoded_logs(&self, trace: &MessageTrace) -> Vec<String> {
        let mut logs = Vec::new();
        self.collect_logs(&mut logs, trace);
        logs
    }

    fn collect_logs(&self, logs: &mut Vec<String>, trace: &MessageTrace) {
        let steps = match trace {
            MessageTrace::Call(call) => &call.base.steps,
            MessageTrace::Create(create) => &create.base.steps,
            MessageTrace::Precompile(_) => return,
        };

        for step in steps {
            let MessageTraceStep::Message(inner) = step else {
                continue;
            };

            if let MessageTrace::Call(call) = inner {
                if call.address == CONSOLE_ADDRESS {
                    if let Some(log) = self.decode_console_log(&call.calldata) {
                        logs.push(log);
                    }
                    continue;
                }
            }

            self.collect_logs(logs, inner);
        }
    }

    /// Decodes one `console.log` payload. Returns `None` for selectors
    /// outside the table and for malformed argument data.
    fn decode_console_log(&self, calldata: &[u8]) -> Option<String> {
        let selector: &[u8; 4] = calldata.first_chunk()?;
        let types = self.signatures.get(selector)?;

        let decoded = DynSolType::Tuple(types.clone())
            .abi_decode_params(calldata.get(4..)?)
            .ok()?;

        let parts: Vec<String> = match decoded {
            DynSolValue::Tuple(values) => values.iter().map(format_console_value).collect(),
            other => vec![format_console_value(&other)],
        };

        Some(parts.join(" "))
    }
}

/// Renders one decoded argument the way `console.log` prints it.
fn format_console_value(value: &DynSolValue) -> String {
    match value {
        DynSolValue::Bool(value) => value.to_string(),
        DynSolValue::String(value) => value.clone(),
        DynSolValue::Uint(value, _bits) => value.to_string(),
        DynSolValue::Int(value, _bits) => value.to_string(),
        DynSolValue::Address(address) => address.to_string(),
        DynSolValue::Bytes(bytes) => format!("0x{}", hex::encode(bytes)),
        DynSolValue::FixedBytes(word, size) => {
            format!("0x{}", hex::encode(word.get(..*size).unwrap_or(&word[..])))
        }
        DynSolValue::Array(values)
        | DynSolValue::FixedArray(values)
        | DynSolValue::Tuple(values) => {
            format!(
                "[{}]",
                values.iter().map(format_console_value).join(", ")
            )
        }
        DynSolValue::Function(function) => function.to_string(),
    }
}

fn build_signatures() -> HashMap<[u8; 4], Vec<DynSolType>> {
    // Modern and abbreviated spelling of each base type.
    let base_types = [
        ("uint256", "uint", DynSolType::Uint(256)),
        ("string", "string", DynSolType::String),
        ("bool", "bool", DynSolType::Bool),
        ("address", "address", DynSolType::Address),
    ];

    let mut signatures = HashMap::new();

    let mut insert = |signature: String, types: Vec<DynSolType>| {
        let selector: [u8; 4] = keccak256(signature.as_bytes())[..4]
            .try_into()
            .expect("a selector is four bytes");
        signatures.insert(selector, types);
    };

    insert("log()".to_string(), Vec::new());

    for arity in 1..=4 {
        for combination in itertools::repeat_n(base_types.iter(), arity).multi_cartesian_product() {
            let types: Vec<DynSolType> = combination
                .iter()
                .map(|(_, _, r#type)| r#type.clone())
                .collect();

            let modern = combination.iter().map(|(spelling, _, _)| *spelling).join(",");
            insert(format!("log({modern})"), types.clone());

            let abbreviated = combination.iter().map(|(_, spelling, _)| *spelling).join(",");
            if abbreviated != modern {
                insert(format!("log({abbreviated})"), types);
            }
        }
    }

    insert("logUint(uint256)".to_string(), vec![DynSolType::Uint(256)]);
    insert("logUint(uint)".to_string(), vec![DynSolType::Uint(256)]);
    insert("logInt(int256)".to_string(), vec![DynSolType::Int(256)]);
    insert("logInt(int)".to_string(), vec![DynSolType::Int(256)]);
    insert("logString(string)".to_string(), vec![DynSolType::String]);
    insert("logBool(bool)".to_string(), vec![DynSolType::Bool]);
    insert("logAddress(address)".to_string(), vec![DynSolType::Address]);
    insert("logBytes(bytes)".to_string(), vec![DynSolType::Bytes]);

    for size in 1..=32 {
        insert(
            format!("logBytes{size}(bytes{size})"),
            vec![DynSolType::FixedBytes(size)],
        );
    }

    signatures
}
