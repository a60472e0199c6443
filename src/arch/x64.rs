//! x86_64 implementation backed by iced-x86

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, Instruction, InstructionBlock,
};

use super::Architecture;

/// x86_64 (64-bit) architecture
pub struct X64;

const BITNESS: u32 = 64;

fn decode_all(code: &[u8], address: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(BITNESS, code, address, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    while decoder.can_decode() {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            break;
        }
        instructions.push(instruction);
    }
    instructions
}

impl Architecture for X64 {
    // E9 rel32
    const JMP_REL_SIZE: usize = 5;

    // FF 25 00 00 00 00 + 8-byte addr
    const JMP_ABS_SIZE: usize = 14;

    fn encode_jmp_rel(source: usize, target: usize) -> Option<Vec<u8>> {
        let offset = (target as i64) - (source as i64) - 5;
        if offset < i32::MIN as i64 || offset > i32::MAX as i64 {
            return None;
        }

        let mut bytes = Vec::with_capacity(5);
        bytes.push(0xE9);
        bytes.extend_from_slice(&(offset as i32).to_le_bytes());
        Some(bytes)
    }

    fn encode_jmp_abs(target: usize) -> Vec<u8> {
        // jmp qword ptr [rip+0] followed by the absolute address
        let mut bytes = Vec::with_capacity(14);
        bytes.extend_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&(target as u64).to_le_bytes());
        bytes
    }

    fn encode_nop_sled(size: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(size);
        let mut remaining = size;

        // multi-byte NOPs where possible
        while remaining > 0 {
            match remaining {
                1 => {
                    bytes.push(0x90);
                    remaining -= 1;
                }
                2 => {
                    bytes.extend_from_slice(&[0x66, 0x90]);
                    remaining -= 2;
                }
                3 => {
                    bytes.extend_from_slice(&[0x0F, 0x1F, 0x00]);
                    remaining -= 3;
                }
                4 => {
                    bytes.extend_from_slice(&[0x0F, 0x1F, 0x40, 0x00]);
                    remaining -= 4;
                }
                5 => {
                    bytes.extend_from_slice(&[0x0F, 0x1F, 0x44, 0x00, 0x00]);
                    remaining -= 5;
                }
                6 => {
                    bytes.extend_from_slice(&[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00]);
                    remaining -= 6;
                }
                7 => {
                    bytes.extend_from_slice(&[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00]);
                    remaining -= 7;
                }
                _ => {
                    bytes.extend_from_slice(&[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00]);
                    remaining -= 8;
                }
            }
        }

        bytes
    }

    fn find_instruction_boundary(code: &[u8], required_size: usize) -> Option<usize> {
        let mut total = 0;
        let mut decoder = Decoder::with_ip(BITNESS, code, 0, DecoderOptions::NONE);

        while decoder.can_decode() && total < required_size {
            let instruction = decoder.decode();
            if instruction.is_invalid() {
                return None;
            }
            total += instruction.len();
        }

        if total >= required_size {
            Some(total)
        } else {
            None
        }
    }

    fn relocate_block(code: &[u8], old_address: usize, new_address: usize) -> Option<Vec<u8>> {
        if code.is_empty() {
            return Some(Vec::new());
        }

        let mut instructions = decode_all(code, old_address as u64);
        if instructions.is_empty() {
            return None;
        }

        for instruction in &mut instructions {
            let offset = instruction.ip() - old_address as u64;
            instruction.set_ip(new_address as u64 + offset);
        }

        let block = InstructionBlock::new(&instructions, new_address as u64);
        BlockEncoder::encode(BITNESS, block, BlockEncoderOptions::NONE)
            .ok()
            .map(|encoded| encoded.code_buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_jmp_rel_near() {
        let bytes = X64::encode_jmp_rel(0x1000, 0x1100).unwrap();
        assert_eq!(bytes.len(), 5);
        assert_eq!(bytes[0], 0xE9);
        let offset = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(offset, 0xFB);
    }

    #[test]
    fn encode_jmp_rel_too_far() {
        let result = X64::encode_jmp_rel(0x0000_0000_0000_1000, 0x0000_0001_0000_0000);
        assert!(result.is_none());
    }

    #[test]
    fn encode_jmp_abs_layout() {
        let bytes = X64::encode_jmp_abs(0xDEAD_BEEF_1234_5678);
        assert_eq!(bytes.len(), 14);
        assert_eq!(&bytes[0..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        let addr = u64::from_le_bytes(bytes[6..14].try_into().unwrap());
        assert_eq!(addr, 0xDEAD_BEEF_1234_5678);
    }

    #[test]
    fn nop_sled_sizes() {
        for size in 1..=20 {
            assert_eq!(X64::encode_nop_sled(size).len(), size);
        }
    }

    #[test]
    fn boundary_in_typical_prologue() {
        // push rbp; mov rbp, rsp; sub rsp, 0x28
        let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x28];
        let boundary = X64::find_instruction_boundary(&code, 5).unwrap();
        assert!(boundary >= 5 && boundary <= 8);
    }

    #[test]
    fn relocate_plain_prologue() {
        // no relative operands, block comes back byte-identical
        let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x28];
        let relocated = X64::relocate_block(&code, 0x1000, 0x2000).unwrap();
        assert_eq!(relocated, code);
    }

    #[test]
    fn relocate_rel32_jump() {
        // jmp +0x100 from 0x1000 still targets 0x1105 after the move
        let jmp = [0xE9, 0x00, 0x01, 0x00, 0x00];
        let relocated = X64::relocate_block(&jmp, 0x1000, 0x2000).unwrap();
        assert_eq!(relocated[0], 0xE9);
        let offset = i32::from_le_bytes(relocated[1..5].try_into().unwrap());
        assert_eq!(0x2000 + relocated.len() as i64 + offset as i64, 0x1105);
    }
}
