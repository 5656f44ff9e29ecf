//! # Trampoline
//!
//! Intercept stub a jumper diverts into (x86-64 System V).
//!
//! ```text
//!   caller ──call──► target ──jumper──► trampoline
//!                                        │ save argument registers
//!                                        │ on_enter(interceptor, &ret, rdtsc, id)
//!                                        │ restore, drop return address
//!                                        │ call entry ─────────► original body
//!                                        │ ◄──────────────ret──┘
//!                                        │ save return registers
//!                                        │ r11 = on_exit(interceptor, &ret, rdtsc)
//!                                        │ restore
//!                                        └ jmp r11 ──► caller
//! ```
//!
//! Dropping the caller's return address before calling the original body
//! keeps the body's stack layout identical to an unpatched call; the
//! interceptor remembers the address and hands it back on exit.

use super::hooks::InterceptorHandle;
use super::template::{replace_absolute, replace_relative};
use crate::domain::PatchError;
use std::ffi::c_void;

// =============================================================================
// CONSTANTS
// =============================================================================

const SLOT_INTERCEPTOR: u8 = 1;
const SLOT_ID: u8 = 2;
const SLOT_ON_ENTER: u8 = 3;
const SLOT_ON_EXIT: u8 = 4;
const SLOT_ENTRY: u8 = 0x85;

/// Filler between the end of the stub and the end of its allocation
pub const TRAMPOLINE_FILLER: u8 = 0xCC;

#[rustfmt::skip]
const TEMPLATE: &[u8] = &[
    // --- entry -----------------------------------------------------------
    0x50,                                           // push rax
    0x57,                                           // push rdi
    0x56,                                           // push rsi
    0x52,                                           // push rdx
    0x51,                                           // push rcx
    0x41, 0x50,                                     // push r8
    0x41, 0x51,                                     // push r9
    0x41, 0x52,                                     // push r10
    0x48, 0x81, 0xEC, 0x88, 0x00, 0x00, 0x00,       // sub rsp, 0x88
    0xF3, 0x0F, 0x7F, 0x44, 0x24, 0x00,             // movdqu [rsp], xmm0
    0xF3, 0x0F, 0x7F, 0x4C, 0x24, 0x10,             // movdqu [rsp + 0x10], xmm1
    0xF3, 0x0F, 0x7F, 0x54, 0x24, 0x20,             // movdqu [rsp + 0x20], xmm2
    0xF3, 0x0F, 0x7F, 0x5C, 0x24, 0x30,             // movdqu [rsp + 0x30], xmm3
    0xF3, 0x0F, 0x7F, 0x64, 0x24, 0x40,             // movdqu [rsp + 0x40], xmm4
    0xF3, 0x0F, 0x7F, 0x6C, 0x24, 0x50,             // movdqu [rsp + 0x50], xmm5
    0xF3, 0x0F, 0x7F, 0x74, 0x24, 0x60,             // movdqu [rsp + 0x60], xmm6
    0xF3, 0x0F, 0x7F, 0x7C, 0x24, 0x70,             // movdqu [rsp + 0x70], xmm7
    0x48, 0x8D, 0xB4, 0x24, 0xC8, 0x00, 0x00, 0x00, // lea rsi, [rsp + 0xC8]
    0x0F, 0x31,                                     // rdtsc
    0x48, 0xC1, 0xE2, 0x20,                         // shl rdx, 32
    0x48, 0x09, 0xC2,                               // or rdx, rax
    0x48, 0xBF,                                     // mov rdi, interceptor
    0x01, 0x00, 0x00, 0x00, 0x26, 0x59, 0x41, 0x31,
    0x48, 0xB9,                                     // mov rcx, id
    0x02, 0x00, 0x00, 0x00, 0x26, 0x59, 0x41, 0x31,
    0x48, 0xB8,                                     // mov rax, on_enter
    0x03, 0x00, 0x00, 0x00, 0x26, 0x59, 0x41, 0x31,
    0xFF, 0xD0,                                     // call rax
    0xF3, 0x0F, 0x6F, 0x44, 0x24, 0x00,             // movdqu xmm0, [rsp]
    0xF3, 0x0F, 0x6F, 0x4C, 0x24, 0x10,             // movdqu xmm1, [rsp + 0x10]
    0xF3, 0x0F, 0x6F, 0x54, 0x24, 0x20,             // movdqu xmm2, [rsp + 0x20]
    0xF3, 0x0F, 0x6F, 0x5C, 0x24, 0x30,             // movdqu xmm3, [rsp + 0x30]
    0xF3, 0x0F, 0x6F, 0x64, 0x24, 0x40,             // movdqu xmm4, [rsp + 0x40]
    0xF3, 0x0F, 0x6F, 0x6C, 0x24, 0x50,             // movdqu xmm5, [rsp + 0x50]
    0xF3, 0x0F, 0x6F, 0x74, 0x24, 0x60,             // movdqu xmm6, [rsp + 0x60]
    0xF3, 0x0F, 0x6F, 0x7C, 0x24, 0x70,             // movdqu xmm7, [rsp + 0x70]
    0x48, 0x81, 0xC4, 0x88, 0x00, 0x00, 0x00,       // add rsp, 0x88
    0x41, 0x5A,                                     // pop r10
    0x41, 0x59,                                     // pop r9
    0x41, 0x58,                                     // pop r8
    0x59,                                           // pop rcx
    0x5A,                                           // pop rdx
    0x5E,                                           // pop rsi
    0x5F,                                           // pop rdi
    0x58,                                           // pop rax

    // --- original body ---------------------------------------------------
    0x48, 0x83, 0xC4, 0x08,                         // add rsp, 8
    0xE8, 0x85, 0x59, 0x41, 0x31,                   // call entry

    // --- exit ------------------------------------------------------------
    0x50,                                           // push rax
    0x52,                                           // push rdx
    0x48, 0x83, 0xEC, 0x20,                         // sub rsp, 0x20
    0xF3, 0x0F, 0x7F, 0x44, 0x24, 0x00,             // movdqu [rsp], xmm0
    0xF3, 0x0F, 0x7F, 0x4C, 0x24, 0x10,             // movdqu [rsp + 0x10], xmm1
    0x0F, 0x31,                                     // rdtsc
    0x48, 0xC1, 0xE2, 0x20,                         // shl rdx, 32
    0x48, 0x09, 0xC2,                               // or rdx, rax
    0x48, 0xBF,                                     // mov rdi, interceptor
    0x01, 0x00, 0x00, 0x00, 0x26, 0x59, 0x41, 0x31,
    0x48, 0x8D, 0x74, 0x24, 0x28,                   // lea rsi, [rsp + 0x28]
    0x48, 0xB8,                                     // mov rax, on_exit
    0x04, 0x00, 0x00, 0x00, 0x26, 0x59, 0x41, 0x31,
    0xFF, 0xD0,                                     // call rax
    0x49, 0x89, 0xC3,                               // mov r11, rax
    0xF3, 0x0F, 0x6F, 0x44, 0x24, 0x00,             // movdqu xmm0, [rsp]
    0xF3, 0x0F, 0x6F, 0x4C, 0x24, 0x10,             // movdqu xmm1, [rsp + 0x10]
    0x48, 0x83, 0xC4, 0x20,                         // add rsp, 0x20
    0x5A,                                           // pop rdx
    0x58,                                           // pop rax
    0x41, 0xFF, 0xE3,                               // jmp r11
];

/// Bytes a trampoline occupies, rounded to 16
pub const TRAMPOLINE_SIZE: usize = (TEMPLATE.len() + 15) & !15;

/// Produce the trampoline for a stub that will live at `base`.
///
/// # Errors
/// Returns [`PatchError::OutOfRange`] if `entry` is not reachable from
/// `base` with a 32-bit displacement.
pub fn render(
    base: usize,
    id: *const c_void,
    interceptor: &InterceptorHandle,
    entry: *const u8,
) -> Result<Vec<u8>, PatchError> {
    let hooks = interceptor.hooks();
    let mut code = TEMPLATE.to_vec();

    replace_absolute(&mut code, SLOT_INTERCEPTOR, interceptor.instance() as u64);
    replace_absolute(&mut code, SLOT_ID, id as u64);
    replace_absolute(&mut code, SLOT_ON_ENTER, hooks.on_enter as usize as u64);
    replace_absolute(&mut code, SLOT_ON_EXIT, hooks.on_exit as usize as u64);
    replace_relative(&mut code, base, SLOT_ENTRY, entry as usize)?;
    code.resize(TRAMPOLINE_SIZE, TRAMPOLINE_FILLER);
    Ok(code)
}
