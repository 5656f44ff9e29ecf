use mprof::domain::{FunctionTarget, MemoryError, ModuleId, PatchError};
use mprof::memory::{
    AddressRange, ExecutableAllocator, ExecutableBlock, Protection, ScopedProtection, VirtualMemoryManager,
};
use mprof::patch_manager::{
    ImagePatchManager, MappedRegion, Mapping, MappingAccess, ModuleTracker, PatchFactory, PatchManager,
};
use mprof::patcher::Patch;
use mprof_common::{ChangeOutcome, PatchStatus};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const MODULE: ModuleId = ModuleId(7);
const BASE: usize = 0x7f00_0000_0000;

/// Factory refuses to build a patch here
const BROKEN_RVA: u32 = 0xBAD0;
/// Patch is built but never becomes active
const STUBBORN_RVA: u32 = 0x5700;

type Log = Arc<Mutex<Vec<String>>>;

struct FakePatch {
    address: usize,
    active: bool,
    log: Log,
}

impl Patch for FakePatch {
    fn activate(&mut self) -> Result<bool, PatchError> {
        if self.address == BASE + STUBBORN_RVA as usize {
            return Ok(false);
        }
        self.log.lock().unwrap().push(format!("activate {:#x}", self.address));
        let changed = !self.active;
        self.active = true;
        Ok(changed)
    }

    fn revert(&mut self) -> Result<bool, PatchError> {
        self.log.lock().unwrap().push(format!("revert {:#x}", self.address));
        let changed = self.active;
        self.active = false;
        Ok(changed)
    }

    fn active(&self) -> bool {
        self.active
    }

    fn detach(self: Box<Self>) {
        self.log.lock().unwrap().push(format!("detach {:#x}", self.address));
    }
}

struct NoMemory;

impl ExecutableAllocator for NoMemory {
    fn allocate(&self, size: usize) -> Result<ExecutableBlock, MemoryError> {
        Err(MemoryError::TooLarge { requested: size, block_size: 0 })
    }
}

#[derive(Default)]
struct FakeMemory {
    refuse_protect: AtomicBool,
    protected: AtomicUsize,
    restored: Arc<AtomicUsize>,
}

impl VirtualMemoryManager for FakeMemory {
    fn create_executable_allocator(
        &self,
        _reference: AddressRange,
        _distance_order: u32,
    ) -> Result<Arc<dyn ExecutableAllocator>, MemoryError> {
        Ok(Arc::new(NoMemory))
    }

    fn scoped_protect(
        &self,
        region: AddressRange,
        _protection: Protection,
        _restore: Protection,
    ) -> Result<ScopedProtection, MemoryError> {
        if self.refuse_protect.load(Ordering::SeqCst) {
            return Err(MemoryError::ProtectFailed {
                start: region.start,
                end: region.end,
                source: std::io::Error::from_raw_os_error(13),
            });
        }
        self.protected.fetch_add(1, Ordering::SeqCst);
        let restored = Arc::clone(&self.restored);
        Ok(ScopedProtection::new(region, move || {
            restored.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

struct Fixture {
    tracker: Arc<ModuleTracker>,
    memory: Arc<FakeMemory>,
    manager: Arc<ImagePatchManager>,
    log: Log,
    created: Arc<AtomicUsize>,
}

fn factory(log: &Log, created: &Arc<AtomicUsize>) -> PatchFactory {
    let log = Arc::clone(log);
    let created = Arc::clone(created);
    Box::new(move |site, _allocator| {
        let address = site.address;
        if address == BASE + BROKEN_RVA as usize {
            return Err(PatchError::Untranslatable { address, reason: "test refusal" });
        }
        created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePatch { address, active: false, log: Arc::clone(&log) }) as Box<dyn Patch>)
    })
}

fn code_mapping() -> Mapping {
    Mapping {
        path: Some("libtarget.so".to_string()),
        base: BASE,
        regions: vec![
            MappedRegion::new(AddressRange::with_len(BASE, 0x1000), Protection::READ),
            MappedRegion::new(AddressRange::with_len(BASE + 0x1000, 0x10000), Protection::READ | Protection::EXECUTE),
        ],
    }
}

fn fixture() -> Fixture {
    let tracker = Arc::new(ModuleTracker::new());
    let memory = Arc::new(FakeMemory::default());
    let log = Log::default();
    let created = Arc::new(AtomicUsize::new(0));
    let manager = ImagePatchManager::new(
        factory(&log, &created),
        Arc::clone(&tracker) as Arc<dyn MappingAccess>,
        Arc::clone(&memory) as Arc<dyn VirtualMemoryManager>,
    );
    Fixture { tracker, memory, manager, log, created }
}

fn status_of(manager: &ImagePatchManager, rva: u32) -> Option<PatchStatus> {
    manager.query(MODULE).into_iter().find(|p| p.rva == rva).map(|p| p.state)
}

#[test]
fn test_apply_activates_and_is_idempotent() {
    let f = fixture();
    f.tracker.load(MODULE, code_mapping());

    let first = f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 32), FunctionTarget::new(0x1200, 16)]);
    let second = f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 32)]);

    assert_eq!(first.iter().map(|r| r.result).collect::<Vec<_>>(), vec![ChangeOutcome::Ok, ChangeOutcome::Ok]);
    assert_eq!((first[0].id, first[1].id), (1, 2));
    assert_eq!(first[0].size, 32);
    assert_eq!(second[0].result, ChangeOutcome::Unchanged);
    assert_eq!(second[0].id, 1);
    assert_eq!(f.created.load(Ordering::SeqCst), 2);

    let states = f.manager.query(MODULE);
    assert_eq!(states.len(), 2);
    assert!(states.iter().all(|s| s.state == PatchStatus::Active));
    assert!(f.manager.query(ModuleId(99)).is_empty());
}

#[test]
fn test_protection_is_restored_after_each_request() {
    let f = fixture();
    f.tracker.load(MODULE, code_mapping());

    f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 0)]);
    f.manager.revert(MODULE, &[0x1100]);

    let protected = f.memory.protected.load(Ordering::SeqCst);
    assert!(protected >= 2);
    assert_eq!(f.memory.restored.load(Ordering::SeqCst), protected);
}

#[test]
fn test_revert_unknown_and_repeated() {
    let f = fixture();
    f.tracker.load(MODULE, code_mapping());
    f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 0)]);

    let unknown = f.manager.revert(MODULE, &[0x9999]);
    assert_eq!(unknown[0].id, 0);
    assert_eq!(unknown[0].rva, 0x9999);
    assert_eq!(unknown[0].result, ChangeOutcome::Unchanged);

    assert_eq!(f.manager.revert(MODULE, &[0x1100])[0].result, ChangeOutcome::Ok);
    assert_eq!(f.manager.revert(MODULE, &[0x1100])[0].result, ChangeOutcome::Unchanged);
    assert_eq!(status_of(&f.manager, 0x1100), Some(PatchStatus::Dormant));
    assert!(f.log.lock().unwrap().contains(&format!("revert {:#x}", BASE + 0x1100)));

    // Re-applying builds a fresh patch
    assert_eq!(f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 0)])[0].result, ChangeOutcome::Ok);
    assert_eq!(f.created.load(Ordering::SeqCst), 2);
}

#[test]
fn test_apply_before_load_stays_pending_until_mapped() {
    let f = fixture();

    let result = f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 0)]);
    assert_eq!(result[0].result, ChangeOutcome::ActivationError);
    assert_eq!(status_of(&f.manager, 0x1100), Some(PatchStatus::Pending));

    f.tracker.load(MODULE, code_mapping());

    assert_eq!(status_of(&f.manager, 0x1100), Some(PatchStatus::Active));
    assert!(f.log.lock().unwrap().contains(&format!("activate {:#x}", BASE + 0x1100)));
}

#[test]
fn test_unload_and_reload_reactivates() {
    let f = fixture();
    let mapping_id = f.tracker.load(MODULE, code_mapping());
    f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 0)]);

    f.tracker.unload(mapping_id);
    assert_eq!(status_of(&f.manager, 0x1100), Some(PatchStatus::Pending));
    assert!(f.log.lock().unwrap().contains(&format!("detach {:#x}", BASE + 0x1100)));

    f.tracker.load(MODULE, code_mapping());
    assert_eq!(status_of(&f.manager, 0x1100), Some(PatchStatus::Active));
    assert_eq!(f.created.load(Ordering::SeqCst), 2);
}

#[test]
fn test_factory_failure_is_unrecoverable() {
    let f = fixture();
    f.tracker.load(MODULE, code_mapping());

    assert_eq!(f.manager.apply(MODULE, &[FunctionTarget::new(BROKEN_RVA, 0)])[0].result, ChangeOutcome::UnrecoverableError);
    assert_eq!(f.manager.apply(MODULE, &[FunctionTarget::new(BROKEN_RVA, 0)])[0].result, ChangeOutcome::UnrecoverableError);
    assert_eq!(f.manager.revert(MODULE, &[BROKEN_RVA])[0].result, ChangeOutcome::UnrecoverableError);
    assert_eq!(status_of(&f.manager, BROKEN_RVA), Some(PatchStatus::UnrecoverableError));

    // Survives a reload as well
    let mapping_id = f.tracker.mapping_of(MODULE).unwrap();
    f.tracker.unload(mapping_id);
    f.tracker.load(MODULE, code_mapping());
    assert_eq!(status_of(&f.manager, BROKEN_RVA), Some(PatchStatus::UnrecoverableError));
}

#[test]
fn test_patch_refusing_to_activate() {
    let f = fixture();
    f.tracker.load(MODULE, code_mapping());

    let result = f.manager.apply(MODULE, &[FunctionTarget::new(STUBBORN_RVA, 0)]);

    assert_eq!(result[0].result, ChangeOutcome::ActivationError);
    assert_eq!(status_of(&f.manager, STUBBORN_RVA), Some(PatchStatus::ActivationError));
}

#[test]
fn test_unwritable_module_keeps_requests_pending() {
    let f = fixture();
    f.tracker.load(MODULE, code_mapping());
    f.memory.refuse_protect.store(true, Ordering::SeqCst);

    let result = f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 0)]);

    assert_eq!(result[0].result, ChangeOutcome::ActivationError);
    assert_eq!(status_of(&f.manager, 0x1100), Some(PatchStatus::Pending));
    assert_eq!(f.created.load(Ordering::SeqCst), 0);
}

#[test]
fn test_revert_of_unwritable_module_detaches_on_unload() {
    let f = fixture();
    let mapping_id = f.tracker.load(MODULE, code_mapping());
    f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 0)]);
    f.memory.refuse_protect.store(true, Ordering::SeqCst);

    assert_eq!(f.manager.revert(MODULE, &[0x1100])[0].result, ChangeOutcome::Ok);
    assert_eq!(status_of(&f.manager, 0x1100), Some(PatchStatus::Dormant));
    assert!(!f.log.lock().unwrap().iter().any(|e| e.starts_with("revert")));

    f.tracker.unload(mapping_id);
    assert!(f.log.lock().unwrap().contains(&format!("detach {:#x}", BASE + 0x1100)));
}

#[test]
fn test_module_without_code_is_unrecoverable() {
    let f = fixture();
    let data_only = Mapping {
        path: None,
        base: BASE,
        regions: vec![MappedRegion::new(AddressRange::with_len(BASE, 0x1000), Protection::READ | Protection::WRITE)],
    };
    f.tracker.load(MODULE, data_only);

    let result = f.manager.apply(MODULE, &[FunctionTarget::new(0x100, 0)]);

    assert_eq!(result[0].result, ChangeOutcome::UnrecoverableError);
    assert_eq!(f.created.load(Ordering::SeqCst), 0);
}

#[test]
fn test_drop_reverts_live_patches() {
    let f = fixture();
    f.tracker.load(MODULE, code_mapping());
    f.manager.apply(MODULE, &[FunctionTarget::new(0x1100, 0)]);

    let Fixture { manager, log, .. } = f;
    drop(manager);

    assert!(log.lock().unwrap().contains(&format!("revert {:#x}", BASE + 0x1100)));
}

#[test]
fn test_requests_race_with_load_and_unload() {
    let f = fixture();
    let targets: Vec<_> = (0..50).map(|i| FunctionTarget::new(0x1100 + i * 0x10, 16)).collect();
    let rvas: Vec<_> = targets.iter().map(|t| t.rva).collect();

    std::thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..300 {
                let mapping_id = f.tracker.load(MODULE, code_mapping());
                f.tracker.unload(mapping_id);
            }
        });
        s.spawn(|| {
            for _ in 0..300 {
                assert_eq!(f.manager.apply(MODULE, &targets).len(), targets.len());
                assert_eq!(f.manager.revert(MODULE, &rvas).len(), rvas.len());
            }
        });
    });

    f.manager.apply(MODULE, &targets);
    f.tracker.load(MODULE, code_mapping());

    let states = f.manager.query(MODULE);
    assert_eq!(states.len(), targets.len());
    assert!(states.iter().all(|s| s.state == PatchStatus::Active), "{states:?}");
    assert_eq!(f.memory.restored.load(Ordering::SeqCst), f.memory.protected.load(Ordering::SeqCst));
}
