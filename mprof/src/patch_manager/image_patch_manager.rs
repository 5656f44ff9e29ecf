//! # Image Patch Manager
//!
//! Tracks instrumentation requests per `(module, rva)` and keeps them
//! applied while modules come and go.
//!
//! Each record carries two independent facts: what the client asked for
//! (`desired`) and what currently exists in memory (`backing`). The public
//! [`PatchStatus`] is derived from both:
//!
//! ```text
//!   backing \ desired   Dormant    Active
//!   Absent              dormant    pending
//!   Instantiated        dormant    active | activation_error
//!   Broken              unrecoverable_error
//! ```
//!
//! A single mutex guards the record table and the mapping table; requests
//! and loader notifications may arrive from any thread.

use super::mapping::{Mapping, MappingAccess, MappingEvents, Subscription};
use super::{PatchFactory, PatchManager, PatchSite};
use crate::domain::{FunctionTarget, MappingId, MemoryError, ModuleId};
use crate::memory::{ExecutableAllocator, Protection, ScopedProtection, VirtualMemoryManager, REL32_DISTANCE_ORDER};
use crate::patcher::Patch;
use log::{debug, info, warn};
use mprof_common::{ChangeOutcome, PatchChangeResult, PatchState, PatchStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::{Deref, RangeInclusive};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

// =============================================================================
// RECORDS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Desired {
    Dormant,
    Active,
}

enum Backing {
    Absent,
    /// Instantiation was attempted and failed (or never finished)
    Broken,
    Instantiated(Box<dyn Patch>),
}

struct PatchRecord {
    id: u32,
    rva: u32,
    size: u32,
    desired: Desired,
    backing: Backing,
}

impl PatchRecord {
    fn status(&self) -> PatchStatus {
        match (&self.backing, self.desired) {
            (Backing::Broken, _) => PatchStatus::UnrecoverableError,
            (_, Desired::Dormant) => PatchStatus::Dormant,
            (Backing::Absent, Desired::Active) => PatchStatus::Pending,
            (Backing::Instantiated(patch), Desired::Active) if patch.active() => PatchStatus::Active,
            (Backing::Instantiated(_), Desired::Active) => PatchStatus::ActivationError,
        }
    }

    fn result(&self, result: ChangeOutcome) -> PatchChangeResult {
        PatchChangeResult { id: self.id, rva: self.rva, size: self.size, result }
    }

    fn take_backing(&mut self) -> Option<Box<dyn Patch>> {
        match std::mem::replace(&mut self.backing, Backing::Absent) {
            Backing::Instantiated(patch) => Some(patch),
            Backing::Broken => {
                self.backing = Backing::Broken;
                None
            }
            Backing::Absent => None,
        }
    }
}

struct MappingRecord {
    mapping_id: MappingId,
    allocator: Option<Arc<dyn ExecutableAllocator>>,
}

#[derive(Default)]
struct Tables {
    last_id: u32,
    /// Ordered by module first, so one module's records form a range
    patches: BTreeMap<(ModuleId, u32), PatchRecord>,
    mappings: HashMap<ModuleId, MappingRecord>,
    modules: HashMap<MappingId, ModuleId>,
}

fn module_range(module_id: ModuleId) -> RangeInclusive<(ModuleId, u32)> {
    (module_id, u32::MIN)..=(module_id, u32::MAX)
}

// =============================================================================
// MODULE LOCK
// =============================================================================

/// A module pinned in memory with its code made writable.
///
/// Everything is released when the last reference is dropped.
pub struct ModuleLock {
    _protection: Vec<ScopedProtection>,
    mapping: Arc<Mapping>,
    allocator: Option<Arc<dyn ExecutableAllocator>>,
}

impl ModuleLock {
    #[must_use]
    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Allocator reaching the module's code, if it has any
    #[must_use]
    pub fn allocator(&self) -> Option<&Arc<dyn ExecutableAllocator>> {
        self.allocator.as_ref()
    }
}

impl Deref for ModuleLock {
    type Target = Mapping;

    fn deref(&self) -> &Mapping {
        &self.mapping
    }
}

/// Make every executable region of `mapping` writable until the guards drop.
fn relax_protection(
    memory: &dyn VirtualMemoryManager,
    mapping: &Mapping,
) -> Result<Vec<ScopedProtection>, MemoryError> {
    let rwx = Protection::READ | Protection::WRITE | Protection::EXECUTE;

    mapping.executable_regions().map(|r| memory.scoped_protect(r.range, rwx, r.protection)).collect()
}

fn lock_module_in(
    mapping_access: &dyn MappingAccess,
    memory: &dyn VirtualMemoryManager,
    tables: &Tables,
    module_id: ModuleId,
) -> Option<Arc<ModuleLock>> {
    let record = tables.mappings.get(&module_id)?;
    let mapping = mapping_access.lock_mapping(record.mapping_id)?;

    match relax_protection(memory, &mapping) {
        Ok(protection) => {
            Some(Arc::new(ModuleLock { _protection: protection, mapping, allocator: record.allocator.clone() }))
        }
        Err(e) => {
            warn!("Cannot make {module_id} writable: {e}");
            None
        }
    }
}

/// Create the backing patch if needed and activate it.
fn instantiate_and_activate(
    factory: &PatchFactory,
    record: &mut PatchRecord,
    mapping: &Mapping,
    allocator: Option<&Arc<dyn ExecutableAllocator>>,
) -> ChangeOutcome {
    if matches!(record.backing, Backing::Absent) {
        // Stays broken unless construction completes
        record.backing = Backing::Broken;

        let Some(allocator) = allocator else {
            warn!("Patch #{} at rva {:#x}: module has no executable regions", record.id, record.rva);
            return ChangeOutcome::UnrecoverableError;
        };
        let site = PatchSite { address: mapping.address_of(record.rva), size: record.size, id: record.id };
        match factory(site, allocator.as_ref()) {
            Ok(patch) => record.backing = Backing::Instantiated(patch),
            Err(e) => {
                warn!("Patch #{} at rva {:#x} cannot be created: {e}", record.id, record.rva);
                return ChangeOutcome::UnrecoverableError;
            }
        }
    }

    let Backing::Instantiated(patch) = &mut record.backing else {
        return ChangeOutcome::UnrecoverableError;
    };
    match patch.activate() {
        Ok(_) if patch.active() => {
            debug!("Patch #{} at rva {:#x} active", record.id, record.rva);
            ChangeOutcome::Ok
        }
        Ok(_) => ChangeOutcome::ActivationError,
        Err(e) => {
            warn!("Patch #{} at rva {:#x} failed to activate: {e}", record.id, record.rva);
            ChangeOutcome::ActivationError
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// [`PatchManager`] over module-relative targets.
pub struct ImagePatchManager {
    factory: PatchFactory,
    mapping_access: Arc<dyn MappingAccess>,
    memory: Arc<dyn VirtualMemoryManager>,
    tables: Mutex<Tables>,
    subscription: Mutex<Option<Subscription>>,
}

impl ImagePatchManager {
    /// Create a manager and subscribe it to `mapping_access`. Modules that
    /// are already mapped are learned about before this returns.
    #[must_use]
    pub fn new(
        factory: PatchFactory,
        mapping_access: Arc<dyn MappingAccess>,
        memory: Arc<dyn VirtualMemoryManager>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            factory,
            mapping_access: Arc::clone(&mapping_access),
            memory,
            tables: Mutex::new(Tables::default()),
            subscription: Mutex::new(None),
        });
        let listener: Weak<dyn MappingEvents> = Arc::downgrade(&manager) as Weak<dyn MappingEvents>;
        let subscription = mapping_access.notify(listener);

        *manager.subscription.lock().unwrap_or_else(PoisonError::into_inner) = Some(subscription);
        manager
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pin `module_id` and make its code writable.
    ///
    /// Returns `None` if the module is not mapped or its mapping cannot be
    /// locked.
    #[must_use]
    pub fn lock_module(&self, module_id: ModuleId) -> Option<Arc<ModuleLock>> {
        let tables = self.lock();
        lock_module_in(self.mapping_access.as_ref(), self.memory.as_ref(), &tables, module_id)
    }
}

impl PatchManager for ImagePatchManager {
    fn query(&self, module_id: ModuleId) -> Vec<PatchState> {
        self.lock()
            .patches
            .range(module_range(module_id))
            .map(|(_, r)| PatchState { id: r.id, rva: r.rva, size: r.size, state: r.status() })
            .collect()
    }

    fn apply(&self, module_id: ModuleId, targets: &[FunctionTarget]) -> Vec<PatchChangeResult> {
        let mut tables = self.lock();
        let lock = lock_module_in(self.mapping_access.as_ref(), self.memory.as_ref(), &tables, module_id);
        let Tables { last_id, patches, .. } = &mut *tables;

        targets
            .iter()
            .map(|target| {
                let record = patches.entry((module_id, target.rva)).or_insert_with(|| {
                    *last_id += 1;
                    PatchRecord {
                        id: *last_id,
                        rva: target.rva,
                        size: target.size,
                        desired: Desired::Dormant,
                        backing: Backing::Absent,
                    }
                });

                if matches!(record.backing, Backing::Broken) {
                    return record.result(ChangeOutcome::UnrecoverableError);
                }
                if record.status() == PatchStatus::Active {
                    return record.result(ChangeOutcome::Unchanged);
                }
                record.desired = Desired::Active;

                let Some(lock) = lock.as_deref() else {
                    debug!("{module_id} is not mapped; patch #{} stays pending", record.id);
                    return record.result(ChangeOutcome::ActivationError);
                };
                let outcome = instantiate_and_activate(&self.factory, record, lock.mapping(), lock.allocator());
                record.result(outcome)
            })
            .collect()
    }

    /// A record whose module cannot be locked still turns dormant and reports
    /// `Ok`, but its in-memory patch is left as is, possibly active, until
    /// the module is unmapped and the patch detached.
    fn revert(&self, module_id: ModuleId, rvas: &[u32]) -> Vec<PatchChangeResult> {
        let mut tables = self.lock();
        let lock = lock_module_in(self.mapping_access.as_ref(), self.memory.as_ref(), &tables, module_id);

        rvas.iter()
            .map(|&rva| {
                let Some(record) = tables.patches.get_mut(&(module_id, rva)) else {
                    return PatchChangeResult { id: 0, rva, size: 0, result: ChangeOutcome::Unchanged };
                };

                if matches!(record.backing, Backing::Broken) {
                    return record.result(ChangeOutcome::UnrecoverableError);
                }
                if record.desired == Desired::Dormant {
                    return record.result(ChangeOutcome::Unchanged);
                }
                record.desired = Desired::Dormant;

                if let Some(mut patch) = record.take_backing() {
                    if lock.is_some() {
                        if let Err(e) = patch.revert() {
                            warn!("Patch #{} at rva {rva:#x} failed to revert: {e}", record.id);
                        }
                    } else {
                        // Code is not writable: keep the patch until the module goes away
                        record.backing = Backing::Instantiated(patch);
                    }
                }
                debug!("Patch #{} at rva {rva:#x} dormant", record.id);
                record.result(ChangeOutcome::Ok)
            })
            .collect()
    }
}

impl MappingEvents for ImagePatchManager {
    fn mapped(&self, module_id: ModuleId, mapping_id: MappingId, mapping: &Mapping) {
        let allocator = mapping.executable_span().and_then(|span| {
            self.memory
                .create_executable_allocator(span, REL32_DISTANCE_ORDER)
                .map_err(|e| warn!("No executable allocator for {module_id}: {e}"))
                .ok()
        });

        let mut tables = self.lock();
        tables.mappings.insert(module_id, MappingRecord { mapping_id, allocator: allocator.clone() });
        tables.modules.insert(mapping_id, module_id);

        let wanted = tables
            .patches
            .range(module_range(module_id))
            .filter(|(_, r)| r.desired == Desired::Active && !matches!(r.backing, Backing::Broken))
            .count();
        if wanted == 0 {
            return;
        }

        let _protection = match relax_protection(self.memory.as_ref(), mapping) {
            Ok(protection) => protection,
            Err(e) => {
                warn!("Cannot make {module_id} writable, {wanted} patches stay pending: {e}");
                return;
            }
        };
        let mut activated = 0;
        for (_, record) in tables.patches.range_mut(module_range(module_id)) {
            if record.desired != Desired::Active || matches!(record.backing, Backing::Broken) {
                continue;
            }
            match instantiate_and_activate(&self.factory, record, mapping, allocator.as_ref()) {
                ChangeOutcome::Ok => activated += 1,
                outcome => warn!("Patch #{} at rva {:#x} not restored: {outcome:?}", record.id, record.rva),
            }
        }
        info!("{module_id} mapped at {:#x}, {activated}/{wanted} patches restored", mapping.base);
    }

    fn unmapped(&self, mapping_id: MappingId) {
        let mut tables = self.lock();
        let Some(module_id) = tables.modules.remove(&mapping_id) else {
            return;
        };

        for (_, record) in tables.patches.range_mut(module_range(module_id)) {
            if let Some(patch) = record.take_backing() {
                patch.detach();
            }
        }
        if tables.mappings.get(&module_id).is_some_and(|m| m.mapping_id == mapping_id) {
            tables.mappings.remove(&module_id);
        }
        debug!("{module_id} unmapped ({mapping_id})");
    }
}

impl Drop for ImagePatchManager {
    fn drop(&mut self) {
        // No notifications may arrive while tearing down
        drop(self.subscription.get_mut().unwrap_or_else(PoisonError::into_inner).take());

        let tables = self.tables.get_mut().unwrap_or_else(PoisonError::into_inner);
        let modules: BTreeSet<ModuleId> = tables
            .patches
            .iter()
            .filter(|(_, r)| matches!(r.backing, Backing::Instantiated(_)))
            .map(|((module_id, _), _)| *module_id)
            .collect();

        for module_id in modules {
            let lock = lock_module_in(self.mapping_access.as_ref(), self.memory.as_ref(), tables, module_id);

            for (_, record) in tables.patches.range_mut(module_range(module_id)) {
                let Some(mut patch) = record.take_backing() else {
                    continue;
                };
                if lock.is_some() {
                    if let Err(e) = patch.revert() {
                        warn!("Patch #{} failed to revert on shutdown: {e}", record.id);
                    }
                    drop(patch);
                } else {
                    patch.detach();
                }
            }
        }
    }
}
