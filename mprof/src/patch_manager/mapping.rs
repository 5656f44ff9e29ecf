//! Module mappings as seen by the patch manager.

use crate::domain::{MappingId, ModuleId};
use crate::memory::{AddressRange, Protection};
use std::sync::{Arc, Weak};

/// One contiguous region of a mapped module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub range: AddressRange,
    pub protection: Protection,
}

impl MappedRegion {
    #[must_use]
    pub const fn new(range: AddressRange, protection: Protection) -> Self {
        Self { range, protection }
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.protection.contains(Protection::EXECUTE)
    }
}

/// A module's loaded regions at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    pub path: Option<String>,
    /// Load base that RVAs are relative to
    pub base: usize,
    pub regions: Vec<MappedRegion>,
}

impl Mapping {
    pub fn executable_regions(&self) -> impl Iterator<Item = &MappedRegion> {
        self.regions.iter().filter(|r| r.is_executable())
    }

    /// Smallest range covering every executable region
    #[must_use]
    pub fn executable_span(&self) -> Option<AddressRange> {
        AddressRange::span(self.executable_regions().map(|r| r.range))
    }

    /// Absolute address of `rva` in this mapping
    #[must_use]
    pub fn address_of(&self, rva: u32) -> usize {
        self.base + rva as usize
    }
}

/// Receiver of module load/unload notifications.
pub trait MappingEvents: Send + Sync {
    fn mapped(&self, module_id: ModuleId, mapping_id: MappingId, mapping: &Mapping);

    /// Delivered before the mapping's memory is released.
    fn unmapped(&self, mapping_id: MappingId);
}

type CancelFn = Box<dyn FnOnce() + Send + Sync>;

/// Keeps a listener subscribed until dropped.
#[must_use = "the listener is unsubscribed as soon as the subscription is dropped"]
pub struct Subscription {
    cancel: Option<CancelFn>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { cancel: Some(Box::new(cancel)) }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Source of module mappings.
pub trait MappingAccess: Send + Sync {
    /// Pin the mapping so it stays loaded while the returned snapshot is
    /// held. `None` if it is gone or cannot be pinned.
    fn lock_mapping(&self, mapping_id: MappingId) -> Option<Arc<Mapping>>;

    /// Subscribe `listener` to mapping events. Mappings that already exist
    /// are reported to it before this returns.
    fn notify(&self, listener: Weak<dyn MappingEvents>) -> Subscription;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: usize, len: usize, protection: Protection) -> MappedRegion {
        MappedRegion::new(AddressRange::with_len(start, len), protection)
    }

    #[test]
    fn test_executable_span_covers_only_executable_regions() {
        let mapping = Mapping {
            path: None,
            base: 0x1000000,
            regions: vec![
                region(0x1000000, 0x2000, Protection::READ | Protection::WRITE),
                region(0x1002000, 0x2000, Protection::EXECUTE),
                region(0x1008000, 0x3000, Protection::READ),
                region(0x10B0000, 0x1000, Protection::all()),
                region(0x1200000, 0x2000, Protection::WRITE),
            ],
        };

        assert_eq!(mapping.executable_span(), Some(AddressRange::with_len(0x1002000, 0xAF000)));
        assert_eq!(mapping.executable_regions().count(), 2);
    }

    #[test]
    fn test_mapping_without_code_has_no_span() {
        let mapping = Mapping { path: None, base: 0, regions: vec![region(0x1000, 0x1000, Protection::READ)] };

        assert_eq!(mapping.executable_span(), None);
    }

    #[test]
    fn test_address_of_is_base_relative() {
        let mapping = Mapping { base: 0x1910221, ..Mapping::default() };

        assert_eq!(mapping.address_of(0x10010), 0x1910221 + 0x10010);
    }
}
