//! # Patch Management
//!
//! Module-relative instrumentation requests, kept alive across module
//! unload/reload.
//!
//! ```text
//!   apply/revert/query ──► ImagePatchManager ◄── mapped/unmapped ── MappingAccess
//!                              │    ▲
//!                 PatchFactory │    │ lock_module: mapping + RWX guards + allocator
//!                              ▼    │
//!                          Box<dyn Patch> ── VirtualMemoryManager
//! ```

pub mod image_patch_manager;
pub mod mapping;
pub mod module_tracker;

pub use image_patch_manager::{ImagePatchManager, ModuleLock};
pub use mapping::{MappedRegion, Mapping, MappingAccess, MappingEvents, Subscription};
pub use module_tracker::ModuleTracker;

use crate::domain::{FunctionTarget, ModuleId, PatchError};
use crate::memory::ExecutableAllocator;
use crate::patcher::Patch;
use mprof_common::{PatchChangeResult, PatchState};

/// A function about to be instrumented, as handed to a [`PatchFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    /// Absolute address of the function in the locked mapping
    pub address: usize,
    /// Extent of the function in bytes (0 when unknown)
    pub size: u32,
    /// Id of the record the patch backs
    pub id: u32,
}

/// Builds the backing patch for a [`PatchSite`], with an allocator whose
/// blocks are within `rel32` reach of the module.
pub type PatchFactory =
    Box<dyn Fn(PatchSite, &dyn ExecutableAllocator) -> Result<Box<dyn Patch>, PatchError> + Send + Sync>;

/// Instrumentation control surface exposed to a protocol layer.
pub trait PatchManager: Send + Sync {
    /// State of every function ever requested in `module_id`.
    fn query(&self, module_id: ModuleId) -> Vec<PatchState>;

    /// Request instrumentation of `targets`; one result per target, in order.
    fn apply(&self, module_id: ModuleId, targets: &[FunctionTarget]) -> Vec<PatchChangeResult>;

    /// Withdraw instrumentation of `rvas`; one result per RVA, in order.
    fn revert(&self, module_id: ModuleId, rvas: &[u32]) -> Vec<PatchChangeResult>;
}

/// Factory producing [`crate::patcher::FunctionPatch`]es that report to
/// `interceptor`, using the target address as the callee identity.
///
/// Functions a jumper refuses fall back to a
/// [`crate::patcher::TranslatedFunctionPatch`] when their size is known.
#[cfg(target_arch = "x86_64")]
#[must_use]
pub fn function_patch_factory(interceptor: crate::patcher::InterceptorHandle) -> PatchFactory {
    use crate::patcher::{FunctionPatch, TranslatedFunctionPatch};

    Box::new(move |site, allocator| {
        let target = site.address as *mut u8;
        let callee = site.address as *const std::ffi::c_void;

        // SAFETY: the manager only hands out addresses inside a locked,
        // writable module mapping
        #[allow(unsafe_code)]
        let patch = match unsafe { FunctionPatch::new(target, callee, &interceptor, allocator) } {
            Ok(patch) => Box::new(patch) as Box<dyn Patch>,
            Err(PatchError::Jumper(reason)) if site.size > 0 => {
                log::debug!("Patch #{} at {:#x}: {reason}, relocating prologue", site.id, site.address);
                // SAFETY: as above; the caller vouches for the function size
                #[allow(unsafe_code)]
                let translated = unsafe {
                    TranslatedFunctionPatch::new(target, site.size as usize, callee, &interceptor, allocator)
                }?;
                Box::new(translated)
            }
            Err(e) => return Err(e),
        };
        Ok(patch)
    })
}
