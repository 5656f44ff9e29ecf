//! # Jumper
//!
//! Atomically switchable diversion of a function to another address.
//!
//! A jumper never writes more than two bytes over the function itself. The
//! long jump lives in the padding that compilers leave between functions,
//! and the function's first instruction becomes a short jump back into it:
//!
//! ```text
//!   leading NOPs (hot-patchable prologue)
//!
//!     target-14        target        target+n
//!     [jmp [rip] → X]  [nop nop] ... [rest of function]
//!                       └─ EB F0 when active          ▲ entry
//!
//!   any other leading instruction of length L ≥ 2
//!
//!     target-14-L-2    target-L-2            target
//!     [jmp [rip] → X]  [copy of insn][EB L]  [insn] ...
//!                      ▲ entry                └─ EB rel8 when active
//! ```
//!
//! The two-byte short jump is written with a single unaligned 16-bit store,
//! so a thread executing the function sees either the old or the new bytes.
//! Callers are responsible for making the code writable around construction,
//! activation and revert.

#![allow(unsafe_code)] // reads and writes code bytes through raw pointers

use super::decoder::{decode, nop_prefix_len, Relocation, MAX_INSTRUCTION_LENGTH, NATIVE_BITNESS};
use super::template::{absolute_slot, replace_absolute};
use crate::domain::JumperError;
use crate::memory::AddressRange;
use std::ptr;

// =============================================================================
// CONSTANTS
// =============================================================================

const SLOT_DIVERT_TO: u8 = 1;

/// `jmp qword ptr [rip + 0]` followed by its 64-bit target
const JUMPER_TEMPLATE: [u8; JUMPER_SIZE] = {
    let slot = absolute_slot(SLOT_DIVERT_TO);
    [
        0xFF, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp [rip + 0]
        slot[0], slot[1], slot[2], slot[3], slot[4], slot[5], slot[6], slot[7],
    ]
};

/// Bytes of padding the long jump occupies
pub const JUMPER_SIZE: usize = 14;

/// Length of `jmp rel8`
pub const SHORT_JUMP_SIZE: usize = 2;

const SHORT_JUMP_OPCODE: u8 = 0xEB;

// =============================================================================
// JUMPER
// =============================================================================

/// An installed diversion of one function.
///
/// Dropping an inactive or active jumper reverts the target and refills the
/// padding with its original filler byte. [`Jumper::detach`] leaves
/// everything in place instead.
#[derive(Debug)]
pub struct Jumper {
    target: *mut u8,
    entry: *const u8,
    padding: AddressRange,
    filler: u8,
    saved: [u8; SHORT_JUMP_SIZE],
    active: bool,
}

// SAFETY: the jumper exclusively owns the padding it wrote and the two
// target bytes it swaps; owners serialize activate/revert
unsafe impl Send for Jumper {}

impl Jumper {
    /// Prepare a diversion of `target` to `divert_to`. The target itself is
    /// not modified until [`Jumper::activate`].
    ///
    /// # Errors
    /// - [`JumperError::CurrentlyProhibited`] if the leading instruction is a
    ///   relative branch or addresses memory relative to the instruction
    ///   pointer
    /// - [`JumperError::LeadingTooShort`] if it is a single byte or cannot be
    ///   decoded
    /// - [`JumperError::PaddingInsufficient`] if the bytes before the target
    ///   are not one repeated value
    ///
    /// # Safety
    /// `target` must be the start of a function whose preceding padding is
    /// unused, and `target - 32 .. target + 15` must be readable and
    /// writable for as long as the jumper lives.
    pub unsafe fn new(target: *mut u8, divert_to: *const u8) -> Result<Self, JumperError> {
        let address = target as usize;
        // SAFETY: the caller guarantees the leading bytes are readable
        let head = unsafe { std::slice::from_raw_parts(target.cast_const(), MAX_INSTRUCTION_LENGTH) };

        let nops = nop_prefix_len(head, NATIVE_BITNESS);
        let relocated = match nops {
            Some(_) => None,
            None => {
                // an encoding with no measurable length cannot be relocated
                let leading =
                    decode(head, address as u64, NATIVE_BITNESS).ok_or(JumperError::LeadingTooShort(address))?;
                if leading.relocation != Relocation::None {
                    return Err(JumperError::CurrentlyProhibited(address));
                }
                if leading.len < SHORT_JUMP_SIZE {
                    return Err(JumperError::LeadingTooShort(address));
                }
                Some(leading.len)
            }
        };

        let stub_len = JUMPER_SIZE + relocated.map_or(0, |len| len + SHORT_JUMP_SIZE);
        let padding = AddressRange::new(address - stub_len, address);
        // SAFETY: the caller guarantees the padding is readable
        let filler = uniform_filler(unsafe { std::slice::from_raw_parts(padding.start as *const u8, stub_len) })
            .ok_or(JumperError::PaddingInsufficient(address))?;

        let mut stub = JUMPER_TEMPLATE.to_vec();
        replace_absolute(&mut stub, SLOT_DIVERT_TO, divert_to as u64);
        let entry = match relocated {
            Some(len) => {
                stub.extend_from_slice(&head[..len]);
                stub.extend_from_slice(&[SHORT_JUMP_OPCODE, len as u8]);
                (address - len - SHORT_JUMP_SIZE) as *const u8
            }
            None => (address + nops.unwrap_or(0)) as *const u8,
        };

        // SAFETY: stub_len bytes of padding are writable per the caller
        unsafe { ptr::copy_nonoverlapping(stub.as_ptr(), padding.start as *mut u8, stub.len()) };

        Ok(Self { target, entry, padding, filler, saved: [0; SHORT_JUMP_SIZE], active: false })
    }

    /// Where the original behavior of the target can still be invoked.
    #[must_use]
    pub fn entry(&self) -> *const u8 {
        self.entry
    }

    #[must_use]
    pub fn target(&self) -> *const u8 {
        self.target
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.active
    }

    /// Redirect the target into the stub. Returns `false` if already active.
    pub fn activate(&mut self) -> bool {
        if self.active {
            return false;
        }

        let rel8 = (self.padding.start as isize - (self.target as isize + SHORT_JUMP_SIZE as isize)) as i8;
        let jump = u16::from_le_bytes([SHORT_JUMP_OPCODE, rel8 as u8]);

        // SAFETY: the target's first two bytes are writable per new()
        unsafe {
            self.saved = self.target.cast::<[u8; SHORT_JUMP_SIZE]>().read_unaligned();
            self.target.cast::<u16>().write_unaligned(jump);
        }
        self.active = true;
        true
    }

    /// Restore the target's first two bytes. Returns `false` if not active.
    pub fn revert(&mut self) -> bool {
        if !self.active {
            return false;
        }

        // SAFETY: see activate()
        unsafe { self.target.cast::<u16>().write_unaligned(u16::from_le_bytes(self.saved)) };
        self.active = false;
        true
    }

    /// Give up ownership without touching memory.
    #[must_use]
    pub fn detach(self) -> DetachedJumper {
        let this = std::mem::ManuallyDrop::new(self);
        DetachedJumper { target: this.target as usize, entry: this.entry as usize, active: this.active }
    }
}

impl Drop for Jumper {
    fn drop(&mut self) {
        self.revert();
        // SAFETY: the padding is still owned and writable per new()
        unsafe { ptr::write_bytes(self.padding.start as *mut u8, self.filler, self.padding.len()) };
    }
}

/// What is left of a jumper after [`Jumper::detach`]: addresses only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachedJumper {
    target: usize,
    entry: usize,
    active: bool,
}

impl DetachedJumper {
    #[must_use]
    pub fn target(&self) -> usize {
        self.target
    }

    #[must_use]
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Whether the diversion was left in place
    #[must_use]
    pub fn was_active(&self) -> bool {
        self.active
    }
}

fn uniform_filler(padding: &[u8]) -> Option<u8> {
    let (&first, rest) = padding.split_first()?;
    rest.iter().all(|&b| b == first).then_some(first)
}
