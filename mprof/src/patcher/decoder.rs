//! Instruction inspection for the patcher, backed by `iced-x86`.
//!
//! Only the properties that decide whether an instruction may be moved are
//! exposed: its length, whether it is a NOP, and whether its meaning depends
//! on where it lives (relative branches, IP-relative memory operands).

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind};

/// Longest legal x86 instruction
pub const MAX_INSTRUCTION_LENGTH: usize = 15;

/// Decoding mode of the running process
#[cfg(target_pointer_width = "64")]
pub const NATIVE_BITNESS: u32 = 64;
#[cfg(not(target_pointer_width = "64"))]
pub const NATIVE_BITNESS: u32 = 32;

/// Position dependence of one decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    /// Bytes can be copied anywhere unchanged
    None,
    /// `jmp rel8`, `jcc rel8`, `loop`, `jrcxz`: 8-bit displacement
    ShortBranch { target: u64 },
    /// `jmp rel32`, `jcc rel32`, `call rel32`: 32-bit displacement
    NearBranch { target: u64 },
    /// Memory operand addressed relative to the instruction pointer
    IpRelative,
}

/// A decoded instruction at a known address.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstruction {
    pub address: u64,
    pub len: usize,
    pub relocation: Relocation,
    instruction: Instruction,
}

impl DecodedInstruction {
    #[must_use]
    pub fn is_nop(&self) -> bool {
        self.instruction.mnemonic() == Mnemonic::Nop
    }

    #[must_use]
    pub fn is_int3(&self) -> bool {
        self.instruction.mnemonic() == Mnemonic::Int3
    }

    #[must_use]
    pub fn is_call(&self) -> bool {
        self.instruction.flow_control() == FlowControl::Call
    }

    /// Whether control never falls through to the next instruction.
    #[must_use]
    pub fn ends_flow(&self) -> bool {
        matches!(
            self.instruction.flow_control(),
            FlowControl::Return | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        )
    }

    #[must_use]
    pub fn end(&self) -> u64 {
        self.address + self.len as u64
    }
}

/// Decode the first instruction of `bytes`, assumed to live at `address`.
///
/// Returns `None` for invalid or truncated encodings.
#[must_use]
pub fn decode(bytes: &[u8], address: u64, bitness: u32) -> Option<DecodedInstruction> {
    let mut decoder = Decoder::with_ip(bitness, bytes, address, DecoderOptions::NONE);

    if !decoder.can_decode() {
        return None;
    }
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return None;
    }
    Some(DecodedInstruction {
        address,
        len: instruction.len(),
        relocation: relocation_of(&instruction),
        instruction,
    })
}

/// Decode consecutive instructions until at least `min_len` bytes are covered.
#[must_use]
pub fn decode_prologue(
    bytes: &[u8],
    address: u64,
    bitness: u32,
    min_len: usize,
) -> Option<Vec<DecodedInstruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0;

    while offset < min_len {
        let instruction = decode(bytes.get(offset..)?, address + offset as u64, bitness)?;
        offset += instruction.len;
        instructions.push(instruction);
    }
    Some(instructions)
}

fn relocation_of(instruction: &Instruction) -> Relocation {
    if instruction.is_ip_rel_memory_operand() {
        return Relocation::IpRelative;
    }
    let branches = (0..instruction.op_count()).any(|i| {
        matches!(instruction.op_kind(i), OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64)
    });
    if !branches {
        return Relocation::None;
    }

    let target = instruction.near_branch_target();
    let short = instruction.is_jmp_short()
        || instruction.is_jcc_short()
        || instruction.is_jcx_short()
        || instruction.is_loop()
        || instruction.is_loopcc();
    if short {
        Relocation::ShortBranch { target }
    } else {
        Relocation::NearBranch { target }
    }
}

/// Length of a NOP-equivalent sequence at the start of `bytes`, if any.
///
/// Recognizes a pair of single-byte `nop`s, `xchg ax, ax`, the multi-byte
/// `0F 1F /0` forms, and (in 32-bit code only) `mov edi, edi`. Sequences
/// shorter than a short jump do not count.
#[must_use]
pub fn nop_prefix_len(bytes: &[u8], bitness: u32) -> Option<usize> {
    match bytes {
        [0x90, 0x90, ..] => Some(2),
        [0x8B, 0xFF, ..] if bitness == 32 => Some(2),
        _ => decode(bytes, 0, bitness).filter(|i| i.is_nop() && i.len >= 2).map(|i| i.len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measures_instruction_lengths() {
        assert_eq!(decode(&[0xF7, 0xF9], 0, 64).map(|i| i.len), Some(2)); // idiv ecx
        assert_eq!(decode(&[0x89, 0x65, 0xF0], 0, 64).map(|i| i.len), Some(3));
        assert_eq!(decode(&[0xB8, 0, 0, 0, 0], 0, 64).map(|i| i.len), Some(5)); // mov eax, 0
        assert_eq!(decode(&[0x48, 0x83, 0xEC, 0x28], 0, 64).map(|i| i.len), Some(4)); // sub rsp, 0x28
    }

    #[test]
    fn test_truncated_encoding_is_rejected() {
        assert!(decode(&[0xB8, 0, 0], 0, 64).is_none());
        assert!(decode(&[], 0, 64).is_none());
    }

    #[test]
    fn test_classifies_relative_branches() {
        let jmp_short = decode(&[0xEB, 0x10], 0x1000, 64).unwrap();
        assert_eq!(jmp_short.relocation, Relocation::ShortBranch { target: 0x1012 });

        let call = decode(&[0xE8, 0x00, 0x01, 0x00, 0x00], 0x1000, 64).unwrap();
        assert_eq!(call.relocation, Relocation::NearBranch { target: 0x1105 });
        assert!(call.is_call());

        let jne_near = decode(&[0x0F, 0x85, 0xFA, 0xFF, 0xFF, 0xFF], 0x1000, 64).unwrap();
        assert_eq!(jne_near.relocation, Relocation::NearBranch { target: 0x1000 });

        let jrcxz = decode(&[0xE3, 0x02], 0x1000, 64).unwrap();
        assert_eq!(jrcxz.relocation, Relocation::ShortBranch { target: 0x1004 });
    }

    #[test]
    fn test_classifies_ip_relative_operands() {
        // mov rax, [rip + 0x10]
        let mov = decode(&[0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00], 0x1000, 64).unwrap();
        assert_eq!(mov.relocation, Relocation::IpRelative);

        // mov rax, [rbx + 0x10]
        let mov = decode(&[0x48, 0x8B, 0x43, 0x10], 0x1000, 64).unwrap();
        assert_eq!(mov.relocation, Relocation::None);
    }

    #[test]
    fn test_recognizes_nop_prefixes() {
        assert_eq!(nop_prefix_len(&[0x90, 0x90, 0xC3], 64), Some(2));
        assert_eq!(nop_prefix_len(&[0x66, 0x90, 0xC3], 64), Some(2));
        assert_eq!(nop_prefix_len(&[0x0F, 0x1F, 0x00, 0xC3], 64), Some(3));
        assert_eq!(nop_prefix_len(&[0x0F, 0x1F, 0x40, 0x08, 0xC3], 64), Some(4));
        assert_eq!(nop_prefix_len(&[0x8B, 0xFF, 0xC3], 32), Some(2));
        assert_eq!(nop_prefix_len(&[0x8B, 0xFF, 0xC3], 64), None);
        assert_eq!(nop_prefix_len(&[0x90, 0xC3], 64), None);
        assert_eq!(nop_prefix_len(&[0xF7, 0xF9], 64), None);
    }

    #[test]
    fn test_decode_prologue_covers_requested_length() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20; ret
        let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, 0xC3];
        let prologue = decode_prologue(&code, 0x4000, 64, 5).unwrap();

        assert_eq!(prologue.len(), 3);
        assert_eq!(prologue.iter().map(|i| i.len).sum::<usize>(), 8);
        assert_eq!(prologue[2].address, 0x4004);
    }
}
