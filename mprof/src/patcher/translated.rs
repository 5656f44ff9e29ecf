//! Patch for functions a [`super::jumper::Jumper`] cannot handle.
//!
//! The leading instructions covering a `jmp rel32` are moved, whole, into
//! the trampoline allocation and followed by a jump back to the rest of the
//! function. Activation overwrites the function start with `jmp rel32` to
//! the trampoline.
//!
//! The jump is five bytes wide, so it cannot be stored in one go. Threads
//! entering the function meanwhile are parked on a `jmp $` over the first
//! two bytes. Threads already executing inside those five bytes are not
//! protected; callers must not switch a patch under such a thread.
//!
//! ```text
//!   block: [ trampoline ][ moved prologue ][ jmp target+moved ]
//!                         ▲ entry
//!   target (active): [ E9 rel32 → block ][ rest of function ]
//! ```

#![allow(unsafe_code)] // copies and rewrites code through raw pointers

use super::decoder::{decode_prologue, DecodedInstruction, Relocation, MAX_INSTRUCTION_LENGTH, NATIVE_BITNESS};
use super::hooks::InterceptorHandle;
use super::trampoline::{render, TRAMPOLINE_SIZE};
use super::Patch;
use crate::domain::PatchError;
use crate::memory::{ExecutableAllocator, ExecutableBlock};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

/// Length of `jmp rel32`
pub const NEAR_JUMP_SIZE: usize = 5;

const NEAR_JUMP_OPCODE: u8 = 0xE9;

/// `jmp $`
const SPIN_JUMP: [u8; 2] = [0xEB, 0xFE];

/// Store `code` over the first five bytes at `target`. A thread entering the
/// function sees the old bytes, the spin jump, or the new bytes.
///
/// # Safety
/// `target..target + 5` must be writable code.
unsafe fn write_entry(target: *mut u8, code: &[u8; NEAR_JUMP_SIZE]) {
    // SAFETY: forwarded from the caller
    unsafe {
        target.cast::<u16>().write_unaligned(u16::from_le_bytes(SPIN_JUMP));
        fence(Ordering::SeqCst);
        let tail = SPIN_JUMP.len();
        ptr::copy_nonoverlapping(code.as_ptr().add(tail), target.add(tail), NEAR_JUMP_SIZE - tail);
        fence(Ordering::SeqCst);
        target.cast::<u16>().write_unaligned(u16::from_le_bytes([code[0], code[1]]));
    }
}

fn near_jump(from: usize, to: usize) -> Result<[u8; NEAR_JUMP_SIZE], PatchError> {
    let next = from + NEAR_JUMP_SIZE;
    let displacement =
        i32::try_from(to as i64 - next as i64).map_err(|_| PatchError::OutOfRange { from: next, to })?;
    let d = displacement.to_le_bytes();
    Ok([NEAR_JUMP_OPCODE, d[0], d[1], d[2], d[3]])
}

/// Copy `prologue` (decoded at its original place) so that it runs at
/// `destination`.
///
/// Near branches leaving the moved range are re-targeted; anything whose
/// meaning cannot be preserved is rejected.
///
/// # Errors
/// [`PatchError::Untranslatable`] on IP-relative operands, short branches
/// leaving the moved range, or `int3` inside it; [`PatchError::OutOfRange`]
/// when a re-targeted branch no longer reaches.
pub fn move_instructions(
    source: &[u8],
    prologue: &[DecodedInstruction],
    destination: usize,
) -> Result<Vec<u8>, PatchError> {
    let Some(first) = prologue.first() else {
        return Ok(Vec::new());
    };
    let begin = first.address;
    let end = prologue.last().map_or(begin, DecodedInstruction::end);
    let inside = |address: u64| (begin..end).contains(&address);
    let mut moved = Vec::with_capacity((end - begin) as usize);

    for instruction in prologue {
        let address = instruction.address as usize;
        let offset = (instruction.address - begin) as usize;
        let mut bytes = source[offset..offset + instruction.len].to_vec();

        if instruction.is_int3() {
            return Err(PatchError::Untranslatable { address, reason: "debug interrupt inside moved range" });
        }
        match instruction.relocation {
            Relocation::None => {}
            Relocation::IpRelative => {
                return Err(PatchError::Untranslatable { address, reason: "rip-based addressing" });
            }
            Relocation::ShortBranch { target } if !inside(target) => {
                return Err(PatchError::Untranslatable {
                    address,
                    reason: "short relative jump outside the moved range",
                });
            }
            Relocation::ShortBranch { .. } => {}
            Relocation::NearBranch { target } if inside(target) => {}
            Relocation::NearBranch { target } => {
                let next = destination + offset + instruction.len;
                let displacement = i32::try_from(target as i64 - next as i64)
                    .map_err(|_| PatchError::OutOfRange { from: next, to: target as usize })?;
                // rel32 is always the last four bytes of call/jmp/jcc
                let at = bytes.len() - 4;
                bytes[at..].copy_from_slice(&displacement.to_le_bytes());
            }
        }
        moved.extend_from_slice(&bytes);
    }
    Ok(moved)
}

/// Instrumentation that relocates the function's prologue.
pub struct TranslatedFunctionPatch {
    target: *mut u8,
    jump: [u8; NEAR_JUMP_SIZE],
    saved: [u8; NEAR_JUMP_SIZE],
    active: bool,
    block: ExecutableBlock,
    _interceptor: InterceptorHandle,
}

// SAFETY: the patch exclusively owns the bytes it swaps at target; owners
// serialize activate/revert
unsafe impl Send for TranslatedFunctionPatch {}

impl TranslatedFunctionPatch {
    /// Build an inactive patch of the `size`-byte function at `target`.
    ///
    /// # Errors
    /// Fails if the function is shorter than a near jump, its prologue cannot
    /// be moved, or no trampoline memory within reach is available.
    ///
    /// # Safety
    /// `target..target + size` must be a complete function that stays mapped
    /// and readable while the patch lives, and its first five bytes must be
    /// writable whenever the patch is activated, reverted or dropped. No
    /// thread may be executing within those five bytes at those moments.
    pub unsafe fn new(
        target: *mut u8,
        size: usize,
        id: *const c_void,
        interceptor: &InterceptorHandle,
        allocator: &dyn ExecutableAllocator,
    ) -> Result<Self, PatchError> {
        let address = target as usize;
        if size < NEAR_JUMP_SIZE {
            return Err(PatchError::Untranslatable { address, reason: "function too short to be moved" });
        }

        // SAFETY: target..target+size is readable per the caller
        let function = unsafe { std::slice::from_raw_parts(target.cast_const(), size) };
        let window = &function[..size.min(NEAR_JUMP_SIZE + MAX_INSTRUCTION_LENGTH)];
        let prologue = decode_prologue(window, address as u64, NATIVE_BITNESS, NEAR_JUMP_SIZE)
            .ok_or(PatchError::Undecodable(address))?;
        let moved_len: usize = prologue.iter().map(|i| i.len).sum();
        if moved_len > size {
            return Err(PatchError::Untranslatable { address, reason: "prologue runs past the function end" });
        }

        let block = allocator.allocate(TRAMPOLINE_SIZE + moved_len + NEAR_JUMP_SIZE)?;
        let entry = block.address() + TRAMPOLINE_SIZE;
        let mut code = render(block.address(), id, interceptor, entry as *const u8)?;
        code.extend_from_slice(&move_instructions(window, &prologue, entry)?);
        code.extend_from_slice(&near_jump(entry + moved_len, address + moved_len)?);
        let jump = near_jump(address, block.address())?;

        // SAFETY: the block is writable and sized for the code above
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), block.as_ptr(), code.len()) };

        Ok(Self {
            target,
            jump,
            saved: [0; NEAR_JUMP_SIZE],
            active: false,
            block,
            _interceptor: interceptor.clone(),
        })
    }

    #[must_use]
    pub fn target(&self) -> *const u8 {
        self.target
    }

    /// Where the moved prologue starts
    #[must_use]
    pub fn entry(&self) -> *const u8 {
        // SAFETY: the block holds the trampoline followed by the prologue
        unsafe { self.block.as_ptr().add(TRAMPOLINE_SIZE) }
    }
}

impl Patch for TranslatedFunctionPatch {
    fn activate(&mut self) -> Result<bool, PatchError> {
        if self.active {
            return Ok(false);
        }
        // SAFETY: the first five target bytes are writable per new()
        unsafe {
            self.saved = self.target.cast::<[u8; NEAR_JUMP_SIZE]>().read_unaligned();
            write_entry(self.target, &self.jump);
        }
        self.active = true;
        Ok(true)
    }

    fn revert(&mut self) -> Result<bool, PatchError> {
        if !self.active {
            return Ok(false);
        }
        // SAFETY: see activate()
        unsafe { write_entry(self.target, &self.saved) };
        self.active = false;
        Ok(true)
    }

    fn active(&self) -> bool {
        self.active
    }

    fn detach(mut self: Box<Self>) {
        self.active = false;
    }
}

impl Drop for TranslatedFunctionPatch {
    fn drop(&mut self) {
        let _ = self.revert();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prologue_of(code: &[u8], address: u64) -> Vec<DecodedInstruction> {
        decode_prologue(code, address, 64, NEAR_JUMP_SIZE).unwrap()
    }

    #[test]
    fn test_near_jump_encoding() {
        assert_eq!(near_jump(0x1000, 0x1105).unwrap(), [0xE9, 0x00, 0x01, 0x00, 0x00]);
        assert_eq!(near_jump(0x1000, 0x1000).unwrap(), [0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
        assert!(near_jump(0x1000, 0x2_0000_0000).is_err());
    }

    #[test]
    fn test_write_entry_replaces_five_bytes_only() {
        let mut code = [0x55, 0x48, 0x89, 0xE5, 0xB8, 0x07];
        let jump = near_jump(0x1000, 0x2000).unwrap();

        unsafe { write_entry(code.as_mut_ptr(), &jump) };

        assert_eq!(&code[..NEAR_JUMP_SIZE], &jump);
        assert_eq!(code[NEAR_JUMP_SIZE], 0x07);
    }

    #[test]
    fn test_moves_position_independent_prologue_verbatim() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20
        let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
        let moved = move_instructions(&code, &prologue_of(&code, 0x4000), 0x9000).unwrap();

        assert_eq!(moved, code);
    }

    #[test]
    fn test_retargets_near_call_leaving_moved_range() {
        // call +0x100; ret
        let code = [0xE8, 0x00, 0x01, 0x00, 0x00, 0xC3];
        let moved = move_instructions(&code, &prologue_of(&code, 0x4000), 0x5000).unwrap();

        // original target 0x4105, now relative to 0x5005
        assert_eq!(moved, [0xE8, 0x00, 0xF1, 0xFF, 0xFF]);
    }

    #[test]
    fn test_keeps_short_branch_inside_moved_range() {
        // jmp +0; push rbp; mov rbp, rsp
        let code = [0xEB, 0x00, 0x55, 0x48, 0x89, 0xE5];
        let moved = move_instructions(&code, &prologue_of(&code, 0x4000), 0x9000).unwrap();

        assert_eq!(moved, code);
    }

    #[test]
    fn test_rejects_unmovable_instructions() {
        let short_out = [0x74, 0x10, 0x55, 0x48, 0x89, 0xE5]; // je +0x10
        let rip = [0x48, 0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]; // mov rax, [rip + 0x10]
        let int3 = [0x31, 0xC0, 0xC3, 0xCC, 0xCC]; // xor eax, eax; ret; int3; int3

        for code in [&short_out[..], &rip[..], &int3[..]] {
            let result = move_instructions(code, &prologue_of(code, 0x4000), 0x9000);
            assert!(matches!(result, Err(PatchError::Untranslatable { .. })), "{code:02x?}");
        }
    }
}
