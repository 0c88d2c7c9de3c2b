//! Decodes solc's compressed source maps into per-instruction records.
//!
//! See <https://docs.soliditylang.org/en/latest/internals/source_mappings.html>
//! for the format.

use std::sync::Arc;

use revm_bytecode::OpCode;

use crate::build_model::{BuildModelSources, Instruction, JumpType, SourceLocation};

#[derive(Clone, Copy, Debug)]
pub struct SourceMapLocation {
    // -1 when the information is missing; non-negative otherwise.
    pub offset: i32,
    pub length: i32,
    pub file: i32,
}

#[derive(Clone, Copy, Debug)]
pub struct SourceMap {
    pub location: SourceMapLocation,
    pub jump_type: JumpType,
}

fn jump_letter_to_jump_type(letter: &str) -> JumpType {
    match letter {
        "i" => JumpType::IntoFunction,
        "o" => JumpType::OutofFunction,
        _ => JumpType::NotJump,
    }
}

fn uncompress_source_maps(compressed: &str) -> Vec<SourceMap> {
    // Entries inherit omitted fields from their predecessor; a first entry
    // with omitted fields inherits from this placeholder.
    const UNMAPPED: SourceMap = SourceMap {
        location: SourceMapLocation {
            offset: 0,
            length: 0,
            file: -1,
        },
        jump_type: JumpType::NotJump,
    };

    let mut mappings: Vec<SourceMap> = Vec::new();

    for (index, entry) in compressed.split(';').enumerate() {
        let parts: Vec<&str> = entry.split(':').collect();
        let field = |i: usize| parts.get(i).copied().filter(|part| !part.is_empty());

        // An incomplete first entry is emitted by some compiler versions for
        // code that has nothing to inherit from.
        // See: https://github.com/nomiclabs/hardhat/issues/593
        let has_every_part = (0..4).all(|i| field(i).is_some());
        if index == 0 && !has_every_part {
            mappings.push(UNMAPPED);
            continue;
        }

        let previous = mappings.last().copied().unwrap_or(UNMAPPED);

        let number = |i: usize, inherited: i32| {
            field(i).map_or(inherited, |part| {
                part.parse().unwrap_or_else(|_| {
                    log::warn!("Unparseable source map field `{part}` at entry {index}");
                    inherited
                })
            })
        };

        mappings.push(SourceMap {
            location: SourceMapLocation {
                offset: number(0, previous.location.offset),
                length: number(1, previous.location.length),
                file: number(2, previous.location.file),
            },
            jump_type: field(3).map_or(previous.jump_type, jump_letter_to_jump_type),
        });
    }

    mappings
}

fn instruction_at(
    bytecode: &[u8],
    pc: usize,
    jump_type_for: impl FnOnce(OpCode) -> JumpType,
) -> Option<Instruction> {
    let opcode = OpCode::new(*bytecode.get(pc)?)?;

    let push_data = if opcode.is_push() {
        let operand_size = opcode.info().immediate_size() as usize;
        Some(bytecode.get(pc..pc + 1 + operand_size)?.to_vec())
    } else {
        None
    };

    Some(Instruction {
        pc: pc as u32,
        opcode,
        jump_type: jump_type_for(opcode),
        push_data,
        location: None,
    })
}

/// Appends the location-less instructions that follow the source-mapped
/// region of a deployment bytecode, up to the `INVALID` opcode that precedes
/// the metadata. Newer compilers place constructor-argument validation code
/// there, and the tracer needs to resolve those program counters.
fn add_unmapped_instructions(instructions: &mut Vec<Instruction>, bytecode: &[u8]) {
    let last_pc = instructions.last().map_or(0, |instruction| instruction.pc);

    let mut bytes_index = last_pc as usize + 1;

    while bytecode.get(bytes_index).copied() != Some(OpCode::INVALID.get()) {
        let Some(mut instruction) = instruction_at(bytecode, bytes_index, |opcode| {
            if matches!(opcode, OpCode::JUMP | OpCode::JUMPI) {
                JumpType::InternalJump
            } else {
                JumpType::NotJump
            }
        }) else {
            // Ran into the metadata or the end of the buffer.
            break;
        };

        instruction.location = None;
        bytes_index += 1 + instruction.opcode.info().immediate_size() as usize;

        instructions.push(instruction);
    }
}

/// Decodes a bytecode into instructions, one per source map entry.
///
/// The source map entry count is the stop condition: solc appends metadata
/// after the code, so the end of the buffer is meaningless. Entries mapped to
/// file `-1` (or to a file missing from the table) produce instructions
/// without a location, which silently degrades the resulting stack traces
/// instead of failing.
pub fn decode_instructions(
    bytecode: &[u8],
    compressed_source_maps: &str,
    sources: &Arc<BuildModelSources>,
    is_deployment: bool,
) -> Vec<Instruction> {
    let source_maps = uncompress_source_maps(compressed_source_maps);

    let mut instructions = Vec::with_capacity(source_maps.len());

    let mut bytes_index = 0;
    while instructions.len() < source_maps.len() {
        let source_map = source_maps[instructions.len()];

        let Some(mut instruction) = instruction_at(bytecode, bytes_index, |opcode| {
            match (opcode, source_map.jump_type) {
                // The compiler classifies loop and `switch` jumps as
                // non-jumps; they are still jumps to the tracer.
                (OpCode::JUMP | OpCode::JUMPI, JumpType::NotJump) => JumpType::InternalJump,
                (_, jump_type) => jump_type,
            }
        }) else {
            log::warn!(
                "Bytecode ended after {} of {} source map entries",
                instructions.len(),
                source_maps.len()
            );
            break;
        };

        instruction.location = if source_map.location.file < 0 {
            None
        } else {
            Some(Arc::new(SourceLocation::new(
                sources,
                source_map.location.file as u32,
                u32::try_from(source_map.location.offset).unwrap_or(0),
                u32::try_from(source_map.location.length).unwrap_or(0),
            )))
        };

        bytes_index += 1 + instruction.opcode.info().immediate_size() as usize;

        instructions.push(instruction);
    }

    if is_deployment {
        add_unmapped_instructions(&mut instructions, bytecode);
    }

    instructions
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn empty_sources() -> Arc<BuildModelSources> {
        Arc::new(HashMap::new())
    }

    #[test]
    fn instruction_count_matches_map_entry_count() {
        // PUSH1 0x01, PUSH2 0x0002, JUMP, JUMPDEST, STOP, then fake metadata
        let bytecode = [
            0x60, 0x01, 0x61, 0x00, 0x02, 0x56, 0x5b, 0x00, 0xa1, 0x65, 0x62,
        ];
        let source_map = "0:5:0:-;5:3:0;;8:1:0:i;9:1:0:o";

        let instructions = decode_instructions(&bytecode, source_map, &empty_sources(), false);

        assert_eq!(instructions.len(), 5);
        assert_eq!(
            instructions.iter().map(|i| i.pc).collect::<Vec<_>>(),
            vec![0, 2, 5, 6, 7]
        );
    }

    #[test]
    fn push_instructions_consume_their_operands() {
        // PUSH3 0xaabbcc, PUSH1 0xff, STOP
        let bytecode = [0x62, 0xaa, 0xbb, 0xcc, 0x60, 0xff, 0x00];
        let source_map = "0:1:0:-;1:1:0;2:1:0";

        let instructions = decode_instructions(&bytecode, source_map, &empty_sources(), false);

        assert_eq!(instructions.len(), 3);
        assert_eq!(
            instructions[0].push_data,
            Some(vec![0x62, 0xaa, 0xbb, 0xcc])
        );
        assert_eq!(instructions[1].push_data, Some(vec![0x60, 0xff]));
        assert_eq!(instructions[2].push_data, None);
    }

    #[test]
    fn compiler_non_jumps_are_reclassified() {
        // JUMP marked "-" in the map is still a jump, just not a call/return.
        let bytecode = [0x56, 0x57, 0x56];
        let source_map = "0:1:0:-;1:1:0:-;2:1:0:i";

        let instructions = decode_instructions(&bytecode, source_map, &empty_sources(), false);

        assert_eq!(instructions[0].jump_type, JumpType::InternalJump);
        assert_eq!(instructions[1].jump_type, JumpType::InternalJump);
        assert_eq!(instructions[2].jump_type, JumpType::IntoFunction);
    }

    #[test]
    fn omitted_fields_inherit_from_the_previous_entry() {
        let maps = uncompress_source_maps("10:20:1:i;;30::0");

        assert_eq!(maps.len(), 3);
        assert_eq!(maps[1].location.offset, 10);
        assert_eq!(maps[1].location.length, 20);
        assert_eq!(maps[1].location.file, 1);
        assert_eq!(maps[1].jump_type, JumpType::IntoFunction);

        assert_eq!(maps[2].location.offset, 30);
        assert_eq!(maps[2].location.length, 20);
        assert_eq!(maps[2].location.file, 0);
        assert_eq!(maps[2].jump_type, JumpType::IntoFunction);
    }

    #[test]
    fn incomplete_first_entry_maps_to_no_file() {
        let maps = uncompress_source_maps("0:10:0;0:10:0");

        assert_eq!(maps[0].location.file, -1);
        assert_eq!(maps[1].location.file, 0);
    }

    #[test]
    fn unmapped_file_ids_produce_no_location() {
        let bytecode = [0x00];
        let instructions = decode_instructions(&bytecode, "-1:-1:-1:-", &empty_sources(), false);

        assert_eq!(instructions.len(), 1);
        assert!(instructions[0].location.is_none());
    }

    #[test]
    fn deployment_bytecodes_decode_past_the_mapped_region() {
        // Mapped: PUSH1 0x00, JUMP. Unmapped: JUMPDEST, CODESIZE, REVERT,
        // then INVALID starts the metadata.
        let bytecode = [0x60, 0x00, 0x56, 0x5b, 0x38, 0xfd, 0xfe, 0x11, 0x22];
        let source_map = "0:2:0:-;2:1:0:-";

        let instructions = decode_instructions(&bytecode, source_map, &empty_sources(), true);

        assert_eq!(instructions.len(), 5);
        assert_eq!(instructions[2].pc, 3);
        assert_eq!(instructions[2].opcode, OpCode::JUMPDEST);
        assert_eq!(instructions[4].opcode, OpCode::REVERT);
        assert!(instructions[4].location.is_none());
    }
}
