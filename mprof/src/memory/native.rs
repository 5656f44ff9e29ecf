//! `mmap`/`mprotect` backed memory services.

#![allow(unsafe_code)] // mmap, munmap, mprotect and sysconf are FFI calls

use super::gap_search::{gap_search_down, gap_search_up};
use super::maps::enumerate_allocations;
use super::{
    AddressRange, ExecutableAllocator, ExecutableBlock, MemoryError, Protection, ScopedProtection,
    VirtualMemoryManager, ALLOCATION_ALIGNMENT,
};
use log::{debug, warn};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Size of each reservation an allocator carves trampolines from.
pub const DEFAULT_BLOCK_SIZE: usize = 0x10000;

/// System page size
#[must_use]
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
}

fn to_prot(protection: Protection) -> libc::c_int {
    let mut prot = libc::PROT_NONE;
    if protection.contains(Protection::READ) {
        prot |= libc::PROT_READ;
    }
    if protection.contains(Protection::WRITE) {
        prot |= libc::PROT_WRITE;
    }
    if protection.contains(Protection::EXECUTE) {
        prot |= libc::PROT_EXEC;
    }
    prot
}

fn page_align(region: AddressRange) -> AddressRange {
    let page = page_size();
    AddressRange::new(region.start & !(page - 1), (region.end + page - 1) & !(page - 1))
}

fn mprotect(region: AddressRange, protection: Protection) -> Result<(), MemoryError> {
    // SAFETY: the caller owns the region; mprotect validates the range itself
    let rc = unsafe { libc::mprotect(region.start as *mut libc::c_void, region.len(), to_prot(protection)) };
    if rc == 0 {
        Ok(())
    } else {
        Err(MemoryError::ProtectFailed {
            start: region.start,
            end: region.end,
            source: std::io::Error::last_os_error(),
        })
    }
}

// =============================================================================
// ANONYMOUS PAGES
// =============================================================================

/// Anonymous private mapping released on drop.
pub struct MappedPages {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned; access goes through raw pointers
unsafe impl Send for MappedPages {}
// SAFETY: see above
unsafe impl Sync for MappedPages {}

impl MappedPages {
    /// Map `len` bytes (rounded up to whole pages) anywhere.
    ///
    /// # Errors
    /// Returns an error if the kernel refuses the mapping
    pub fn new(len: usize, protection: Protection) -> Result<Self, MemoryError> {
        Self::map(ptr::null_mut(), len, protection, 0)
    }

    /// Map `len` bytes exactly at `address`, failing if anything is there.
    ///
    /// # Errors
    /// Returns an error if the range is occupied or the kernel refuses it
    pub fn at(address: usize, len: usize, protection: Protection) -> Result<Self, MemoryError> {
        let pages = Self::map(address as *mut libc::c_void, len, protection, libc::MAP_FIXED_NOREPLACE)?;

        // Kernels predating MAP_FIXED_NOREPLACE treat the address as a hint
        if pages.address() != address {
            return Err(MemoryError::OutOfReach { start: address, end: address + len });
        }
        Ok(pages)
    }

    fn map(
        hint: *mut libc::c_void,
        len: usize,
        protection: Protection,
        flags: libc::c_int,
    ) -> Result<Self, MemoryError> {
        let page = page_size();
        let len = (len + page - 1) & !(page - 1);

        // SAFETY: anonymous private mapping; no existing memory is touched
        // unless MAP_FIXED_NOREPLACE lets it through onto free space
        let ptr = unsafe {
            libc::mmap(
                hint,
                len,
                to_prot(protection),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed { size: len, source: std::io::Error::last_os_error() });
        }
        NonNull::new(ptr.cast::<u8>())
            .map(|base| Self { base, len })
            .ok_or(MemoryError::MapFailed { size: len, source: std::io::Error::last_os_error() })
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[must_use]
    pub fn address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn range(&self) -> AddressRange {
        AddressRange::with_len(self.address(), self.len)
    }
}

impl Drop for MappedPages {
    fn drop(&mut self) {
        // SAFETY: base/len describe exactly the mapping created in map()
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

// =============================================================================
// REACHABLE ALLOCATOR
// =============================================================================

struct Reservation {
    pages: MappedPages,
    occupied: AtomicUsize,
}

impl Reservation {
    fn bump(&self, size: usize) -> Option<NonNull<u8>> {
        let offset = self
            .occupied
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |occupied| {
                occupied.checked_add(size).filter(|&end| end <= self.pages.len())
            })
            .ok()?;
        // SAFETY: offset + size is within the mapping
        NonNull::new(unsafe { self.pages.as_ptr().add(offset) })
    }
}

/// Bump allocator over RWX reservations placed near a reference region.
pub struct ReachableAllocator {
    reference: AddressRange,
    distance_order: u32,
    block_size: usize,
    current: Mutex<Option<Arc<Reservation>>>,
}

impl ReachableAllocator {
    #[must_use]
    pub fn new(reference: AddressRange, distance_order: u32, block_size: usize) -> Self {
        Self { reference, distance_order, block_size, current: Mutex::new(None) }
    }

    fn reserve(&self) -> Result<Reservation, MemoryError> {
        let allocations = enumerate_allocations()
            .map_err(|e| MemoryError::Io(std::io::Error::other(e.to_string())))?;
        let reach = 1usize.checked_shl(self.distance_order.saturating_sub(1)).unwrap_or(usize::MAX);
        let reference = page_align(self.reference);
        let size = self.block_size;
        let rwx = Protection::READ | Protection::WRITE | Protection::EXECUTE;

        let above =
            gap_search_up(reference.end, &allocations, size).filter(|&l| within_reach(reference, l, size, reach));
        let below =
            gap_search_down(reference.start, &allocations, size).filter(|&l| within_reach(reference, l, size, reach));

        for location in above.into_iter().chain(below) {
            match MappedPages::at(location, size, rwx) {
                Ok(pages) => {
                    debug!("Reserved executable block {:#x}..{:#x}", location, location + size);
                    return Ok(Reservation { pages, occupied: AtomicUsize::new(0) });
                }
                Err(e) => debug!("Reservation at {location:#x} failed: {e}"),
            }
        }
        Err(MemoryError::OutOfReach { start: self.reference.start, end: self.reference.end })
    }
}

/// Whether the farthest bytes of `reference` and of a block at `location`
/// are less than `reach` apart. A signed 32-bit displacement covers
/// `-2^31 .. 2^31`, so a distance of exactly `reach` is out.
fn within_reach(reference: AddressRange, location: usize, size: usize, reach: usize) -> bool {
    let span = if location >= reference.end { location + size - reference.start } else { reference.end - location };
    span < reach
}

impl ExecutableAllocator for ReachableAllocator {
    fn allocate(&self, size: usize) -> Result<ExecutableBlock, MemoryError> {
        let size = (size.max(1) + ALLOCATION_ALIGNMENT - 1) & !(ALLOCATION_ALIGNMENT - 1);
        if size > self.block_size {
            return Err(MemoryError::TooLarge { requested: size, block_size: self.block_size });
        }

        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(reservation) = current.as_ref() {
            if let Some(ptr) = reservation.bump(size) {
                let owner: Arc<Reservation> = Arc::clone(reservation);
                // SAFETY: ptr..ptr+size lies in the RWX reservation kept alive by owner
                return Ok(unsafe { ExecutableBlock::new(ptr, size, owner) });
            }
        }

        let reservation = Arc::new(self.reserve()?);
        let ptr = reservation
            .bump(size)
            .ok_or(MemoryError::TooLarge { requested: size, block_size: self.block_size })?;
        *current = Some(Arc::clone(&reservation));
        // SAFETY: as above
        Ok(unsafe { ExecutableBlock::new(ptr, size, reservation) })
    }
}

// =============================================================================
// MEMORY MANAGER
// =============================================================================

/// [`VirtualMemoryManager`] for the current process.
pub struct NativeMemoryManager {
    block_size: usize,
}

impl NativeMemoryManager {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self { block_size }
    }
}

impl Default for NativeMemoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl VirtualMemoryManager for NativeMemoryManager {
    fn create_executable_allocator(
        &self,
        reference: AddressRange,
        distance_order: u32,
    ) -> Result<Arc<dyn ExecutableAllocator>, MemoryError> {
        Ok(Arc::new(ReachableAllocator::new(reference, distance_order, self.block_size)))
    }

    fn scoped_protect(
        &self,
        region: AddressRange,
        protection: Protection,
        restore: Protection,
    ) -> Result<ScopedProtection, MemoryError> {
        let region = page_align(region);

        mprotect(region, protection)?;
        Ok(ScopedProtection::new(region, move || {
            if let Err(e) = mprotect(region, restore) {
                warn!("Failed to restore protection: {e}");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rwx() -> Protection {
        Protection::READ | Protection::WRITE | Protection::EXECUTE
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
    }

    #[test]
    fn test_mapped_pages_round_up_to_page() {
        let pages = MappedPages::new(10, Protection::READ | Protection::WRITE).unwrap();

        assert_eq!(pages.len(), page_size());
        assert_eq!(pages.address() % page_size(), 0);
    }

    #[test]
    fn test_allocations_stay_within_reach_and_do_not_overlap() {
        let module = MappedPages::new(0x4000, rwx()).unwrap();
        let manager = NativeMemoryManager::default();
        let allocator = manager.create_executable_allocator(module.range(), 32).unwrap();

        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(7).unwrap();

        assert_eq!(a.len(), 112);
        assert_eq!(b.len(), 16);
        assert!(b.address() >= a.address() + a.len() || a.address() >= b.address() + b.len());
        for block in [&a, &b] {
            let distance = block.address().abs_diff(module.address());
            assert!(distance < 1 << 31, "block {:#x} too far", block.address());
        }
    }

    #[test]
    fn test_reach_excludes_exact_rel32_limit() {
        let reference = AddressRange::new(0x1_0000_0000, 0x1_0000_1000);
        let reach = 1usize << 31;

        // above: farthest byte pair spans location + size - reference.start
        assert!(within_reach(reference, 0x1_0000_0000 + reach - 0x2000, 0x1000, reach));
        assert!(!within_reach(reference, 0x1_0000_0000 + reach - 0x1000, 0x1000, reach));
        // below: spans reference.end - location
        let limit = 0x1_0000_1000 - reach;
        assert!(within_reach(reference, limit + 1, 0x1000, reach));
        assert!(!within_reach(reference, limit, 0x1000, reach));
    }

    #[test]
    fn test_oversized_allocation_is_rejected() {
        let allocator = ReachableAllocator::new(AddressRange::new(0x1000, 0x2000), 32, 0x1000);

        assert!(matches!(allocator.allocate(0x2000), Err(MemoryError::TooLarge { .. })));
    }

    #[test]
    fn test_scoped_protect_restores_protection() {
        let pages = MappedPages::new(page_size(), Protection::READ).unwrap();
        let manager = NativeMemoryManager::default();

        {
            let _guard = manager
                .scoped_protect(pages.range(), Protection::READ | Protection::WRITE, Protection::READ)
                .unwrap();
            // SAFETY: the page is writable while the guard lives
            unsafe { pages.as_ptr().write(0x5A) };
        }

        // SAFETY: still readable after restoration
        assert_eq!(unsafe { pages.as_ptr().read() }, 0x5A);
    }
}
