//! In-process [`MappingAccess`] fed by explicit load/unload calls.
//!
//! The embedding application (or a loader hook) reports modules as they come
//! and go; every subscriber sees the events in the order they were reported.

use super::mapping::{Mapping, MappingAccess, MappingEvents, Subscription};
use crate::domain::{MappingId, ModuleId};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

#[derive(Default)]
struct TrackerState {
    next_mapping_id: u32,
    next_listener_id: u64,
    mappings: HashMap<MappingId, (ModuleId, Arc<Mapping>)>,
    listeners: HashMap<u64, Weak<dyn MappingEvents>>,
}

/// Registry of currently mapped modules.
#[derive(Default)]
pub struct ModuleTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl ModuleTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> Vec<Arc<dyn MappingEvents>> {
        self.lock().listeners.values().filter_map(Weak::upgrade).collect()
    }

    /// Report `module_id` as loaded. Any previous mapping of the same module
    /// is reported unloaded first.
    pub fn load(&self, module_id: ModuleId, mapping: Mapping) -> MappingId {
        let previous: Vec<MappingId> = self
            .lock()
            .mappings
            .iter()
            .filter(|(_, (module, _))| *module == module_id)
            .map(|(&id, _)| id)
            .collect();
        for mapping_id in previous {
            self.unload(mapping_id);
        }

        let mapping = Arc::new(mapping);
        let mapping_id = {
            let mut state = self.lock();
            state.next_mapping_id += 1;
            let mapping_id = MappingId(state.next_mapping_id);
            state.mappings.insert(mapping_id, (module_id, Arc::clone(&mapping)));
            mapping_id
        };

        debug!("{module_id} mapped as {mapping_id} at {:#x}", mapping.base);
        for listener in self.listeners() {
            listener.mapped(module_id, mapping_id, &mapping);
        }
        mapping_id
    }

    /// Report a mapping as about to be unloaded. Returns `false` if unknown.
    pub fn unload(&self, mapping_id: MappingId) -> bool {
        if !self.lock().mappings.contains_key(&mapping_id) {
            return false;
        }

        for listener in self.listeners() {
            listener.unmapped(mapping_id);
        }
        self.lock().mappings.remove(&mapping_id);
        debug!("{mapping_id} unmapped");
        true
    }

    /// Current mapping id of `module_id`
    #[must_use]
    pub fn mapping_of(&self, module_id: ModuleId) -> Option<MappingId> {
        self.lock().mappings.iter().find(|(_, (m, _))| *m == module_id).map(|(&id, _)| id)
    }
}

impl MappingAccess for ModuleTracker {
    fn lock_mapping(&self, mapping_id: MappingId) -> Option<Arc<Mapping>> {
        self.lock().mappings.get(&mapping_id).map(|(_, mapping)| Arc::clone(mapping))
    }

    fn notify(&self, listener: Weak<dyn MappingEvents>) -> Subscription {
        let (listener_id, existing) = {
            let mut state = self.lock();
            state.next_listener_id += 1;
            let listener_id = state.next_listener_id;
            state.listeners.insert(listener_id, Weak::clone(&listener));

            let mut existing: Vec<_> =
                state.mappings.iter().map(|(&id, (module, m))| (*module, id, Arc::clone(m))).collect();
            existing.sort_unstable_by_key(|(_, id, _)| *id);
            (listener_id, existing)
        };

        if let Some(listener) = listener.upgrade() {
            for (module_id, mapping_id, mapping) in existing {
                listener.mapped(module_id, mapping_id, &mapping);
            }
        }

        let state = Arc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                state.lock().unwrap_or_else(PoisonError::into_inner).listeners.remove(&listener_id);
            }
        })
    }
}
