//! # Function Patching
//!
//! Code generation for diverting native functions through entry/exit hooks.
//!
//! ```text
//!   template ── marker slots filled at patch time
//!   decoder  ── instruction length / position dependence (iced-x86)
//!   jumper   ── 2-byte switch at the target, long jump in the padding
//!   trampoline ── saves registers, calls on_enter / original / on_exit
//!   FunctionPatch ........... trampoline + jumper
//!   TranslatedFunctionPatch . trampoline + moved prologue + jmp rel32
//! ```
//!
//! Only x86-64 System V code generation is provided; the byte-level helpers
//! are portable.

pub mod decoder;
pub mod template;

#[cfg(target_arch = "x86_64")]
pub mod function_patch;
#[cfg(target_arch = "x86_64")]
pub mod hooks;
#[cfg(target_arch = "x86_64")]
pub mod jumper;
#[cfg(target_arch = "x86_64")]
pub mod trampoline;
#[cfg(target_arch = "x86_64")]
pub mod translated;

use crate::domain::PatchError;

#[cfg(target_arch = "x86_64")]
pub use function_patch::FunctionPatch;
#[cfg(target_arch = "x86_64")]
pub use hooks::{Hooks, Interceptor, InterceptorHandle};
#[cfg(target_arch = "x86_64")]
pub use jumper::{DetachedJumper, Jumper};
#[cfg(target_arch = "x86_64")]
pub use translated::TranslatedFunctionPatch;

/// A switchable instrumentation of one function.
pub trait Patch: Send {
    /// Start diverting. Returns `false` if the patch was already active.
    ///
    /// # Errors
    /// Implementation specific; the patch stays inactive on error.
    fn activate(&mut self) -> Result<bool, PatchError>;

    /// Stop diverting. Returns `false` if the patch was not active.
    ///
    /// # Errors
    /// Implementation specific.
    fn revert(&mut self) -> Result<bool, PatchError>;

    fn active(&self) -> bool;

    /// Dispose of the patch without touching the patched code, for when
    /// that code is about to disappear or cannot be made writable.
    fn detach(self: Box<Self>) {
        drop(self);
    }
}
