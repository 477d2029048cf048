//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Generation-checked arena holding the active fault table."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use crate::types::{FaultConfiguration, FaultId, FaultInjectionResult};

#[derive(Debug)]
pub(crate) struct ActiveFault {
    pub(crate) config: FaultConfiguration,
    pub(crate) result: FaultInjectionResult,
    /// Set once a removal has claimed the fault so reversal runs exactly once.
    pub(crate) removing: bool,
}

#[derive(Debug)]
struct Slot {
    generation: u64,
    entry: Option<ActiveFault>,
}

/// Dense arena of active faults keyed by generation-checked ids.
#[derive(Debug)]
pub(crate) struct FaultRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_generation: u64,
    active: usize,
    instance: u32,
}

impl Default for FaultRegistry {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            next_generation: 1,
            active: 0,
            instance: rand::random(),
        }
    }
}

impl FaultRegistry {
    /// Register a pending result for `config` and return its id.
    pub(crate) fn insert(&mut self, config: &FaultConfiguration) -> FaultId {
        let generation = self.next_generation;
        self.next_generation += 1;
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let id = FaultId {
            slot,
            generation,
            instance: self.instance,
        };
        let cell = &mut self.slots[slot as usize];
        cell.generation = generation;
        cell.entry = Some(ActiveFault {
            config: config.clone(),
            result: FaultInjectionResult::pending(id, config),
            removing: false,
        });
        self.active += 1;
        id
    }

    fn owns(&self, id: FaultId) -> bool {
        id.instance == self.instance
    }

    pub(crate) fn get(&self, id: FaultId) -> Option<&ActiveFault> {
        if !self.owns(id) {
            return None;
        }
        self.slots
            .get(id.slot as usize)
            .filter(|cell| cell.generation == id.generation)
            .and_then(|cell| cell.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: FaultId) -> Option<&mut ActiveFault> {
        if !self.owns(id) {
            return None;
        }
        self.slots
            .get_mut(id.slot as usize)
            .filter(|cell| cell.generation == id.generation)
            .and_then(|cell| cell.entry.as_mut())
    }

    /// Accepts new artifacts only while the fault is live and not being removed.
    pub(crate) fn live_mut(&mut self, id: FaultId) -> Option<&mut FaultInjectionResult> {
        self.get_mut(id)
            .filter(|entry| !entry.removing)
            .map(|entry| &mut entry.result)
    }

    pub(crate) fn remove(&mut self, id: FaultId) -> Option<ActiveFault> {
        if !self.owns(id) {
            return None;
        }
        let cell = self
            .slots
            .get_mut(id.slot as usize)
            .filter(|cell| cell.generation == id.generation)?;
        let entry = cell.entry.take()?;
        self.free.push(id.slot);
        self.active -= 1;
        Some(entry)
    }

    pub(crate) fn ids(&self) -> Vec<FaultId> {
        let mut ids: Vec<FaultId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.entry.is_some())
            .map(|(slot, cell)| FaultId {
                slot: slot as u32,
                generation: cell.generation,
                instance: self.instance,
            })
            .collect();
        ids.sort_by_key(|id| id.generation);
        ids
    }

    pub(crate) fn len(&self) -> usize {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaultType;

    fn config() -> FaultConfiguration {
        FaultConfiguration::new(FaultType::HighLatency, "bridge", 0.5)
    }

    #[test]
    fn stale_id_does_not_resolve_after_slot_reuse() {
        let mut registry = FaultRegistry::default();
        let first = registry.insert(&config());
        assert!(registry.remove(first).is_some());
        let second = registry.insert(&config());

        assert_eq!(first.slot, second.slot);
        assert_ne!(first.generation, second.generation);
        assert!(registry.get(first).is_none());
        assert!(registry.remove(first).is_none());
        assert!(registry.get(second).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn ids_are_listed_in_injection_order() {
        let mut registry = FaultRegistry::default();
        let a = registry.insert(&config());
        let b = registry.insert(&config());
        registry.remove(a);
        let c = registry.insert(&config());
        assert_eq!(registry.ids(), vec![b, c]);
    }

    #[test]
    fn ids_from_another_registry_do_not_resolve() {
        let mut ours = FaultRegistry::default();
        let mut theirs = FaultRegistry {
            instance: ours.instance.wrapping_add(1),
            ..FaultRegistry::default()
        };
        let mine = ours.insert(&config());
        let foreign = theirs.insert(&config());

        assert_eq!((mine.slot, mine.generation), (foreign.slot, foreign.generation));
        assert_ne!(mine, foreign);
        assert_ne!(mine.to_string(), foreign.to_string());
        assert!(ours.get(foreign).is_none());
        assert!(ours.remove(foreign).is_none());
        assert_eq!(ours.len(), 1);
    }

    #[test]
    fn removing_entries_reject_new_artifacts() {
        let mut registry = FaultRegistry::default();
        let id = registry.insert(&config());
        assert!(registry.live_mut(id).is_some());
        registry.get_mut(id).unwrap().removing = true;
        assert!(registry.live_mut(id).is_none());
        assert!(registry.get(id).is_some());
    }
}
