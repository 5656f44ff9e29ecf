//! Trampoline plus jumper for one function.

#![allow(unsafe_code)] // installs generated code into executable memory

use super::hooks::InterceptorHandle;
use super::jumper::Jumper;
use super::trampoline::{render, TRAMPOLINE_SIZE};
use super::Patch;
use crate::domain::PatchError;
use crate::memory::{ExecutableAllocator, ExecutableBlock};
use std::ffi::c_void;
use std::ptr;

/// Instrumentation of a function whose placement suits a [`Jumper`].
///
/// Field order matters: the jumper is dropped (and the target restored)
/// before the trampoline memory it diverts into is released.
pub struct FunctionPatch {
    jumper: Jumper,
    trampoline: ExecutableBlock,
    _interceptor: InterceptorHandle,
}

impl FunctionPatch {
    /// Build an inactive patch of `target` reporting as `id`.
    ///
    /// # Errors
    /// Fails if no trampoline memory within reach can be allocated or the
    /// target is not suitable for a jumper.
    ///
    /// # Safety
    /// Same contract as [`Jumper::new`].
    pub unsafe fn new(
        target: *mut u8,
        id: *const c_void,
        interceptor: &InterceptorHandle,
        allocator: &dyn ExecutableAllocator,
    ) -> Result<Self, PatchError> {
        let trampoline = allocator.allocate(TRAMPOLINE_SIZE)?;
        // SAFETY: forwarded from the caller
        let jumper = unsafe { Jumper::new(target, trampoline.as_ptr()) }?;
        let code = render(trampoline.address(), id, interceptor, jumper.entry())?;

        // SAFETY: the block is writable and at least TRAMPOLINE_SIZE long
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), trampoline.as_ptr(), code.len()) };

        Ok(Self { jumper, trampoline, _interceptor: interceptor.clone() })
    }

    #[must_use]
    pub fn target(&self) -> *const u8 {
        self.jumper.target()
    }

    #[must_use]
    pub fn trampoline(&self) -> &ExecutableBlock {
        &self.trampoline
    }
}

impl Patch for FunctionPatch {
    fn activate(&mut self) -> Result<bool, PatchError> {
        Ok(self.jumper.activate())
    }

    fn revert(&mut self) -> Result<bool, PatchError> {
        Ok(self.jumper.revert())
    }

    fn active(&self) -> bool {
        self.jumper.active()
    }

    fn detach(self: Box<Self>) {
        let Self { jumper, trampoline, _interceptor } = *self;
        let _ = jumper.detach();
        drop(trampoline);
    }
}
