//! # Executable Memory and Page Protection
//!
//! Trampolines have to live in executable memory that a `rel32` displacement
//! can reach from the instrumented module, and the module's own code pages
//! have to be made writable for as long as jumpers are being installed.
//! This module defines the two collaborator interfaces the patch manager
//! consumes for that and a Linux implementation of both.
//!
//! ```text
//!   VirtualMemoryManager
//!     ├── create_executable_allocator(reference, distance_order)
//!     │       └──► ExecutableAllocator::allocate(size) ──► ExecutableBlock
//!     └── scoped_protect(region, protection, restore)
//!             └──► ScopedProtection  (restores on drop)
//! ```
//!
//! - [`gap_search`]: free-gap lookup over a sorted allocation list
//! - [`maps`]: `/proc/self/maps` parsing
//! - `native`: `mmap`/`mprotect` backed implementation (Linux only)

// Raw block pointers are handed out to code generators
#![allow(unsafe_code)]

pub mod gap_search;
pub mod maps;
#[cfg(target_os = "linux")]
pub mod native;

use crate::domain::MemoryError;
use bitflags::bitflags;
use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Distance order (in bits) an allocator must satisfy so that `rel32`
/// displacements reach from the reference region into its blocks.
pub const REL32_DISTANCE_ORDER: u32 = 32;

/// Granularity of every executable allocation.
pub const ALLOCATION_ALIGNMENT: usize = 16;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub start: usize,
    pub end: usize,
}

impl AddressRange {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn with_len(start: usize, len: usize) -> Self {
        Self { start, end: start + len }
    }

    /// Check if an address falls within this range
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Smallest range covering every range yielded, or `None` for no ranges.
    pub fn span<I: IntoIterator<Item = AddressRange>>(ranges: I) -> Option<AddressRange> {
        ranges.into_iter().fold(None, |acc, r| match acc {
            None => Some(r),
            Some(a) => Some(AddressRange::new(a.start.min(r.start), a.end.max(r.end))),
        })
    }
}

// =============================================================================
// EXECUTABLE ALLOCATIONS
// =============================================================================

/// A chunk of read-write-execute memory handed out by an allocator.
///
/// Keeps the backing reservation alive: the memory stays mapped until every
/// block carved out of it has been dropped.
pub struct ExecutableBlock {
    ptr: NonNull<u8>,
    len: usize,
    _owner: Arc<dyn Any + Send + Sync>,
}

// SAFETY: the block is a plain span of process memory; the owner that keeps
// it mapped is itself Send + Sync.
unsafe impl Send for ExecutableBlock {}
// SAFETY: see above; all mutation goes through raw pointers whose callers
// serialize access.
unsafe impl Sync for ExecutableBlock {}

impl ExecutableBlock {
    /// Wrap `len` bytes at `ptr` owned by `owner`.
    ///
    /// # Safety
    /// `ptr..ptr + len` must be writable and executable for as long as
    /// `owner` is alive.
    #[must_use]
    pub unsafe fn new(ptr: NonNull<u8>, len: usize, owner: Arc<dyn Any + Send + Sync>) -> Self {
        Self { ptr, len, _owner: owner }
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for ExecutableBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableBlock").field("ptr", &self.ptr).field("len", &self.len).finish()
    }
}

/// Source of executable memory reachable from one reference region.
pub trait ExecutableAllocator: Send + Sync {
    /// Carve out `size` bytes (rounded up to [`ALLOCATION_ALIGNMENT`]).
    ///
    /// # Errors
    /// Returns an error if no memory within reach can be reserved.
    fn allocate(&self, size: usize) -> Result<ExecutableBlock, MemoryError>;
}

// =============================================================================
// PROTECTION GUARD
// =============================================================================

type RestoreFn = Box<dyn FnOnce() + Send + Sync>;

/// RAII guard returned by [`VirtualMemoryManager::scoped_protect`].
///
/// Dropping the guard puts the region back to its restore protection.
#[must_use = "the protection is restored as soon as the guard is dropped"]
pub struct ScopedProtection {
    region: AddressRange,
    restore: Option<RestoreFn>,
}

impl ScopedProtection {
    pub fn new(region: AddressRange, restore: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { region, restore: Some(Box::new(restore)) }
    }

    #[must_use]
    pub fn region(&self) -> AddressRange {
        self.region
    }
}

impl Drop for ScopedProtection {
    fn drop(&mut self) {
        if let Some(restore) = self.restore.take() {
            restore();
        }
    }
}

impl std::fmt::Debug for ScopedProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedProtection").field("region", &self.region).finish_non_exhaustive()
    }
}

/// Platform memory services the patch manager depends on.
pub trait VirtualMemoryManager: Send + Sync {
    /// Create an allocator whose blocks all lie within `2^(distance_order-1)`
    /// bytes of `reference`.
    ///
    /// # Errors
    /// Returns an error if the allocator cannot be set up.
    fn create_executable_allocator(
        &self,
        reference: AddressRange,
        distance_order: u32,
    ) -> Result<Arc<dyn ExecutableAllocator>, MemoryError>;

    /// Switch `region` to `protection` until the returned guard is dropped,
    /// then to `restore`.
    ///
    /// # Errors
    /// Returns an error if the protection change is refused.
    fn scoped_protect(
        &self,
        region: AddressRange,
        protection: Protection,
        restore: Protection,
    ) -> Result<ScopedProtection, MemoryError>;
}
