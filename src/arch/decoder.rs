//! Facade over the external length-disassembler.
//!
//! The rewriter consumes instructions through this module only; everything it
//! needs to know about an encoding (length, branch classification, condition
//! code, displacement location) is reported here and nowhere else.

use iced_x86::{Decoder, DecoderOptions, Mnemonic};

#[cfg(target_pointer_width = "32")]
pub const BITNESS: u32 = 32;
#[cfg(target_pointer_width = "64")]
pub const BITNESS: u32 = 64;

/// Longest legal x86 instruction.
pub const MAX_INSN_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsnKind {
    /// No control transfer, no position-dependent operand. Copied verbatim.
    Plain,
    /// ModR/M addressing through the instruction pointer (x86-64 only).
    /// `terminal` is set for `jmp [rip+disp32]`, which ends the function.
    RipRelative { terminal: bool },
    /// `EB rel8` / `E9 rel32`.
    JmpRel,
    /// `E8 rel32`.
    CallRel,
    /// `70..7F rel8` / `0F 80..8F rel32`.
    Jcc,
    /// `LOOPcc` / `JCXZ` / `JECXZ` / `JRCXZ`.
    LoopBranch,
    /// `C3` / `C2 imm16`.
    Ret,
    /// Undecodable bytes.
    Invalid,
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy)]
pub struct Insn {
    pub len: usize,
    pub kind: InsnKind,
    /// Absolute destination for `JmpRel` / `CallRel` / `Jcc` / `LoopBranch`.
    pub branch_target: u64,
    /// Condition nibble for `Jcc` (0x0 = O .. 0xF = G).
    pub cc: u8,
    /// Byte offset of the 32-bit displacement for `RipRelative`.
    pub disp_offset: usize,
}

impl Insn {
    const fn invalid() -> Insn {
        Insn { len: 0, kind: InsnKind::Invalid, branch_target: 0, cc: 0, disp_offset: 0 }
    }
}

/// Decode the first instruction of `bytes` as if it were located at `ip`.
pub fn decode(bytes: &[u8], ip: u64) -> Insn {
    let mut decoder = Decoder::with_ip(BITNESS, bytes, ip, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Insn::invalid();
    }
    let instr = decoder.decode();
    if instr.is_invalid() {
        return Insn::invalid();
    }

    let code = instr.code();
    let mut insn = Insn {
        len: instr.len(),
        kind: InsnKind::Plain,
        branch_target: 0,
        cc: 0,
        disp_offset: 0,
    };

    if instr.mnemonic() == Mnemonic::Ret {
        insn.kind = InsnKind::Ret;
    } else if code.is_jmp_short_or_near() {
        insn.kind = InsnKind::JmpRel;
        insn.branch_target = instr.near_branch_target();
    } else if code.is_call_near() {
        insn.kind = InsnKind::CallRel;
        insn.branch_target = instr.near_branch_target();
    } else if code.is_jcc_short_or_near() {
        insn.kind = InsnKind::Jcc;
        insn.branch_target = instr.near_branch_target();
        // ConditionCode::None is 0 and never applies to Jcc, so the variant
        // index minus one is exactly the x86 condition nibble.
        insn.cc = instr.condition_code() as u8 - 1;
    } else if matches!(
        instr.mnemonic(),
        Mnemonic::Loop | Mnemonic::Loope | Mnemonic::Loopne | Mnemonic::Jcxz | Mnemonic::Jecxz | Mnemonic::Jrcxz
    ) {
        insn.kind = InsnKind::LoopBranch;
        insn.branch_target = instr.near_branch_target();
    } else if instr.is_ip_rel_memory_operand() {
        let offsets = decoder.get_constant_offsets(&instr);
        if !offsets.has_displacement() {
            return Insn::invalid();
        }
        insn.kind = InsnKind::RipRelative { terminal: code.is_jmp_near_indirect() };
        insn.disp_offset = offsets.displacement_offset();
    }

    insn
}

/// Decode one instruction directly from memory.
///
/// # Safety
///
/// `addr` must be readable for [`MAX_INSN_LEN`] + 1 bytes.
pub unsafe fn decode_at(addr: *const u8) -> Insn {
    let bytes = core::ptr::read_unaligned(addr as *const [u8; MAX_INSN_LEN + 1]);
    decode(&bytes, addr as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_instructions() {
        let insn = decode(&[0x90], 0x1000); // nop
        assert_eq!(insn.len, 1);
        assert_eq!(insn.kind, InsnKind::Plain);

        let insn = decode(&[0x55], 0x1000); // push rbp/ebp
        assert_eq!(insn.len, 1);
        assert_eq!(insn.kind, InsnKind::Plain);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn sub_rsp_imm32() {
        let insn = decode(&[0x48, 0x81, 0xEC, 0x80, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(insn.len, 7);
        assert_eq!(insn.kind, InsnKind::Plain);
    }

    #[test]
    fn ret_forms() {
        let insn = decode(&[0xC3], 0x1000);
        assert_eq!(insn.len, 1);
        assert_eq!(insn.kind, InsnKind::Ret);

        let insn = decode(&[0xC2, 0x04, 0x00], 0x1000);
        assert_eq!(insn.len, 3);
        assert_eq!(insn.kind, InsnKind::Ret);
    }

    #[test]
    fn relative_jumps() {
        // jmp +0x100: dest = 0x1000 + 5 + 0x100
        let insn = decode(&[0xE9, 0x00, 0x01, 0x00, 0x00], 0x1000);
        assert_eq!(insn.len, 5);
        assert_eq!(insn.kind, InsnKind::JmpRel);
        assert_eq!(insn.branch_target, 0x1105);

        // jmp short +0x10: dest = 0x1000 + 2 + 0x10
        let insn = decode(&[0xEB, 0x10], 0x1000);
        assert_eq!(insn.len, 2);
        assert_eq!(insn.kind, InsnKind::JmpRel);
        assert_eq!(insn.branch_target, 0x1012);
    }

    #[test]
    fn relative_call() {
        let insn = decode(&[0xE8, 0x00, 0x01, 0x00, 0x00], 0x1000);
        assert_eq!(insn.len, 5);
        assert_eq!(insn.kind, InsnKind::CallRel);
        assert_eq!(insn.branch_target, 0x1105);
    }

    #[test]
    fn conditional_jumps() {
        // je +0x10: cc nibble 4
        let insn = decode(&[0x74, 0x10], 0x1000);
        assert_eq!(insn.len, 2);
        assert_eq!(insn.kind, InsnKind::Jcc);
        assert_eq!(insn.cc, 0x4);
        assert_eq!(insn.branch_target, 0x1012);

        // jo +5: cc nibble 0
        let insn = decode(&[0x70, 0x05], 0x1000);
        assert_eq!(insn.kind, InsnKind::Jcc);
        assert_eq!(insn.cc, 0x0);
        assert_eq!(insn.branch_target, 0x1007);

        // jne rel32: cc nibble 5
        let insn = decode(&[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00], 0x1000);
        assert_eq!(insn.len, 6);
        assert_eq!(insn.kind, InsnKind::Jcc);
        assert_eq!(insn.cc, 0x5);
        assert_eq!(insn.branch_target, 0x1106);
    }

    #[test]
    fn loop_family() {
        let insn = decode(&[0xE2, 0x05], 0x1000); // loop
        assert_eq!(insn.kind, InsnKind::LoopBranch);
        assert_eq!(insn.branch_target, 0x1007);

        let insn = decode(&[0xE3, 0x05], 0x1000); // jcxz/jecxz/jrcxz
        assert_eq!(insn.kind, InsnKind::LoopBranch);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn rip_relative_load() {
        // mov rax, [rip+0x12345678]
        let insn = decode(&[0x48, 0x8B, 0x05, 0x78, 0x56, 0x34, 0x12], 0x1000);
        assert_eq!(insn.len, 7);
        assert_eq!(insn.kind, InsnKind::RipRelative { terminal: false });
        assert_eq!(insn.disp_offset, 3);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn rip_relative_indirect_jmp_is_terminal() {
        // jmp [rip+0x10]
        let insn = decode(&[0xFF, 0x25, 0x10, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(insn.len, 6);
        assert_eq!(insn.kind, InsnKind::RipRelative { terminal: true });
        assert_eq!(insn.disp_offset, 2);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn mov_imm64_is_plain() {
        let insn = decode(&[0x48, 0xB8, 0xEF, 0xBE, 0xAD, 0xDE, 0x00, 0x00, 0x00, 0x00], 0x1000);
        assert_eq!(insn.len, 10);
        assert_eq!(insn.kind, InsnKind::Plain);
    }
}
