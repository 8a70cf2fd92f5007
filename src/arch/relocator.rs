//! Prologue rewriter.
//!
//! Walks the target function instruction by instruction, relocating each one
//! into a trampoline slot until enough bytes are consumed to hold the 5-byte
//! on-target jump, then seals the slot with a tail jump back into the
//! remainder of the target. Position-dependent operands are rewritten so the
//! relocated copy observes the same absolute addresses as the original.

use crate::arch::decoder::{self, InsnKind};
use crate::arch::writer::{self, CodeWriter};
use crate::code::allocator::SLOT_SIZE;
use crate::code::patcher;
use crate::types::HookStatus;

/// Upper bound on relocated instructions (including the tail-jump boundary).
pub const MAX_INSN_PAIRS: usize = 8;

/// Room reserved at the end of each slot for the detour relay.
#[cfg(target_pointer_width = "64")]
const TRAMPOLINE_MAX: usize = SLOT_SIZE - writer::JMP_ABS_LEN;
#[cfg(target_pointer_width = "32")]
const TRAMPOLINE_MAX: usize = SLOT_SIZE;

/// Parallel old-offset/new-offset table mapping instruction boundaries of the
/// target prologue onto the trampoline. Consumed by the thread freezer.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffsetPairs {
    pub old: [u8; MAX_INSN_PAIRS],
    pub new: [u8; MAX_INSN_PAIRS],
    pub count: u8,
}

impl OffsetPairs {
    fn push(&mut self, old: usize, new: usize) -> bool {
        if usize::from(self.count) >= MAX_INSN_PAIRS {
            return false;
        }
        self.old[usize::from(self.count)] = old as u8;
        self.new[usize::from(self.count)] = new as u8;
        self.count += 1;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..usize::from(self.count)).map(|i| (usize::from(self.old[i]), usize::from(self.new[i])))
    }
}

/// A successfully built trampoline.
#[derive(Debug)]
pub struct Trampoline {
    /// Prologue bytes consumed from the target.
    pub consumed: usize,
    /// The 5-byte window does not fit at the target; the full jump goes into
    /// the padding preceding it, with a 2-byte short jump at the target.
    pub patch_above: bool,
    /// Bytes emitted into the slot before the relay.
    pub body_len: usize,
    /// Absolute-jump stub forwarding to the user detour (x86-64), placed at
    /// the end of the slot so the on-target rel32 patch always reaches it.
    /// Null on x86, where the detour is reachable directly.
    pub relay: *mut u8,
    pub pairs: OffsetPairs,
}

fn is_code_padding(bytes: &[u8]) -> bool {
    match bytes.first() {
        Some(&b) if b == 0x00 || b == 0x90 || b == 0xCC => bytes.iter().all(|&x| x == b),
        _ => bytes.is_empty(),
    }
}

/// Build the trampoline for `target` into `slot`, forwarding detoured calls
/// to `detour`.
///
/// # Safety
///
/// `target` must point at decodable machine code readable well past the
/// prologue; `slot` must be a writable [`SLOT_SIZE`]-byte executable slot.
pub unsafe fn build(target: *const u8, detour: *const u8, slot: *mut u8) -> Result<Trampoline, HookStatus> {
    let mut w = CodeWriter::new(slot, TRAMPOLINE_MAX);
    let mut pairs = OffsetPairs::default();
    let window_end = target as u64 + writer::JMP_REL_LEN as u64;

    let mut old_pos = 0usize;
    // Farthest destination of a branch back into the copied window. While the
    // walk sits below it, instruction lengths must not change.
    let mut jmp_dest = 0u64;
    let mut finished = false;

    while !finished {
        let old_inst = target.add(old_pos);
        let old_addr = old_inst as u64;
        let insn = decoder::decode_at(old_inst);
        if insn.kind == InsnKind::Invalid {
            return Err(HookStatus::UnsupportedFunction);
        }

        let new_pos = w.offset();
        // Inside an internal branch the walk may not change any instruction's
        // length, or the branch displacement would turn stale.
        let in_branch = old_addr < jmp_dest;
        let verbatim = core::slice::from_raw_parts(old_inst, insn.len);

        if old_pos >= writer::JMP_REL_LEN {
            // The trampoline is long enough. Seal it with the jump back to
            // the remainder of the target.
            if !pairs.push(old_pos, new_pos) {
                return Err(HookStatus::UnsupportedFunction);
            }
            put_tail_jmp(&mut w, old_addr);
            if !w.ok() {
                return Err(HookStatus::UnsupportedFunction);
            }
            finished = true;
            continue;
        }

        match insn.kind {
            InsnKind::RipRelative { terminal } => {
                if !pairs.push(old_pos, new_pos) {
                    return Err(HookStatus::UnsupportedFunction);
                }
                let mut buf = [0u8; decoder::MAX_INSN_LEN];
                buf[..insn.len].copy_from_slice(verbatim);
                let old_disp =
                    i32::from_le_bytes(buf[insn.disp_offset..insn.disp_offset + 4].try_into().unwrap());
                let abs = old_addr.wrapping_add(insn.len as u64).wrapping_add(old_disp as i64 as u64);
                let new_disp = abs as i64 - (w.pc() as i64 + insn.len as i64);
                if new_disp < i32::MIN as i64 || new_disp > i32::MAX as i64 {
                    return Err(HookStatus::UnsupportedFunction);
                }
                buf[insn.disp_offset..insn.disp_offset + 4]
                    .copy_from_slice(&(new_disp as i32).to_le_bytes());
                w.put_bytes(&buf[..insn.len]);
                // An indirect jump through memory ends the function.
                finished = terminal;
            }
            InsnKind::CallRel => {
                if in_branch && call_stub_len() != insn.len {
                    return Err(HookStatus::UnsupportedFunction);
                }
                if !pairs.push(old_pos, new_pos) {
                    return Err(HookStatus::UnsupportedFunction);
                }
                put_call_stub(&mut w, insn.branch_target);
            }
            InsnKind::JmpRel => {
                let dest = insn.branch_target;
                if (target as u64..window_end).contains(&dest) {
                    // Jump within the copied window: keep the bytes, remember
                    // how far forward the branch reaches.
                    if !pairs.push(old_pos, new_pos) {
                        return Err(HookStatus::UnsupportedFunction);
                    }
                    w.put_bytes(verbatim);
                    if jmp_dest < dest {
                        jmp_dest = dest;
                    }
                } else {
                    if in_branch && jmp_stub_len() != insn.len {
                        return Err(HookStatus::UnsupportedFunction);
                    }
                    if !pairs.push(old_pos, new_pos) {
                        return Err(HookStatus::UnsupportedFunction);
                    }
                    put_jmp_stub(&mut w, dest);
                    // The function ends here unless an internal branch still
                    // reaches past this instruction.
                    finished = old_addr >= jmp_dest;
                }
            }
            InsnKind::Jcc => {
                let dest = insn.branch_target;
                if (target as u64..window_end).contains(&dest) {
                    if !pairs.push(old_pos, new_pos) {
                        return Err(HookStatus::UnsupportedFunction);
                    }
                    w.put_bytes(verbatim);
                    if jmp_dest < dest {
                        jmp_dest = dest;
                    }
                } else {
                    // A function that opens with a conditional branch out of
                    // the patch window has no linear prologue to displace.
                    if old_pos == 0 {
                        return Err(HookStatus::UnsupportedFunction);
                    }
                    if in_branch && jcc_stub_len() != insn.len {
                        return Err(HookStatus::UnsupportedFunction);
                    }
                    if !pairs.push(old_pos, new_pos) {
                        return Err(HookStatus::UnsupportedFunction);
                    }
                    put_jcc_stub(&mut w, insn.cc, dest);
                }
            }
            InsnKind::LoopBranch => {
                let dest = insn.branch_target;
                if !(target as u64..window_end).contains(&dest) {
                    // LOOPcc/JCXZ have no 32-bit-displacement form to widen into.
                    return Err(HookStatus::UnsupportedFunction);
                }
                if !pairs.push(old_pos, new_pos) {
                    return Err(HookStatus::UnsupportedFunction);
                }
                w.put_bytes(verbatim);
                if jmp_dest < dest {
                    jmp_dest = dest;
                }
            }
            InsnKind::Ret => {
                if !pairs.push(old_pos, new_pos) {
                    return Err(HookStatus::UnsupportedFunction);
                }
                w.put_bytes(verbatim);
                finished = old_addr >= jmp_dest;
            }
            InsnKind::Plain => {
                if !pairs.push(old_pos, new_pos) {
                    return Err(HookStatus::UnsupportedFunction);
                }
                w.put_bytes(verbatim);
            }
            InsnKind::Invalid => unreachable!(),
        }

        if !w.ok() {
            return Err(HookStatus::UnsupportedFunction);
        }
        old_pos += insn.len;
    }

    let mut patch_above = false;
    if old_pos < writer::JMP_REL_LEN {
        // The function ended early. A full patch still fits if the bytes up
        // to the window edge are padding; otherwise fall back to a short jump
        // at the target plus the full jump in the padding above it.
        let after = core::slice::from_raw_parts(target.add(old_pos), writer::JMP_REL_LEN - old_pos);
        if !is_code_padding(after) {
            if old_pos < writer::JMP_REL_SHORT_LEN {
                let short_after = core::slice::from_raw_parts(
                    target.add(old_pos),
                    writer::JMP_REL_SHORT_LEN - old_pos,
                );
                if !is_code_padding(short_after) {
                    return Err(HookStatus::UnsupportedFunction);
                }
            }
            let above = target.sub(writer::JMP_REL_LEN);
            if !patcher::is_executable(above as *const core::ffi::c_void) {
                return Err(HookStatus::UnsupportedFunction);
            }
            let above_bytes = core::slice::from_raw_parts(above, writer::JMP_REL_LEN);
            if !is_code_padding(above_bytes) {
                return Err(HookStatus::UnsupportedFunction);
            }
            patch_above = true;
        }
    }

    let body_len = w.offset();

    // x86-64: append the relay so a detour beyond ±2 GiB stays reachable from
    // the 32-bit on-target patch.
    #[cfg(target_pointer_width = "64")]
    let relay = {
        let relay = slot.add(body_len);
        let mut rw = CodeWriter::new(relay, SLOT_SIZE - body_len);
        rw.put_jmp_abs(detour as u64);
        debug_assert!(rw.ok());
        relay
    };
    #[cfg(target_pointer_width = "32")]
    let relay = {
        let _ = detour;
        core::ptr::null_mut()
    };

    Ok(Trampoline { consumed: old_pos, patch_above, body_len, relay, pairs })
}

#[cfg(target_pointer_width = "64")]
fn tail_jmp_len() -> usize {
    writer::JMP_ABS_LEN
}
#[cfg(target_pointer_width = "32")]
fn tail_jmp_len() -> usize {
    writer::JMP_REL_LEN
}

#[cfg(target_pointer_width = "64")]
fn put_tail_jmp(w: &mut CodeWriter, dest: u64) {
    w.put_jmp_abs(dest);
}
#[cfg(target_pointer_width = "32")]
fn put_tail_jmp(w: &mut CodeWriter, dest: u64) {
    w.put_jmp_rel32(dest);
}

#[cfg(target_pointer_width = "64")]
fn jmp_stub_len() -> usize {
    writer::JMP_ABS_LEN
}
#[cfg(target_pointer_width = "32")]
fn jmp_stub_len() -> usize {
    writer::JMP_REL_LEN
}

#[cfg(target_pointer_width = "64")]
fn put_jmp_stub(w: &mut CodeWriter, dest: u64) {
    w.put_jmp_abs(dest);
}
#[cfg(target_pointer_width = "32")]
fn put_jmp_stub(w: &mut CodeWriter, dest: u64) {
    w.put_jmp_rel32(dest);
}

#[cfg(target_pointer_width = "64")]
fn call_stub_len() -> usize {
    writer::CALL_ABS_LEN
}
#[cfg(target_pointer_width = "32")]
fn call_stub_len() -> usize {
    writer::JMP_REL_LEN
}

#[cfg(target_pointer_width = "64")]
fn put_call_stub(w: &mut CodeWriter, dest: u64) {
    w.put_call_abs(dest);
}
#[cfg(target_pointer_width = "32")]
fn put_call_stub(w: &mut CodeWriter, dest: u64) {
    w.put_call_rel32(dest);
}

#[cfg(target_pointer_width = "64")]
fn jcc_stub_len() -> usize {
    writer::JCC_ABS_LEN
}
#[cfg(target_pointer_width = "32")]
fn jcc_stub_len() -> usize {
    writer::JCC_REL32_LEN
}

#[cfg(target_pointer_width = "64")]
fn put_jcc_stub(w: &mut CodeWriter, cc: u8, dest: u64) {
    w.put_jcc_abs(cc, dest);
}
#[cfg(target_pointer_width = "32")]
fn put_jcc_stub(w: &mut CodeWriter, cc: u8, dest: u64) {
    w.put_jcc_rel32(cc, dest);
}
