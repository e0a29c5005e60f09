//! The cohort manager tracking every reversible allocation by handle key
//! and by tag.

use super::{MemoryStage, Producer, VirtualAllocation};
use crate::MemoryError;
use crate::driver::MemoryDriver;
use hashbrown::HashMap;
use hashbrown::hash_map::Entry as MapEntry;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct Entry {
    memory: VirtualAllocation,
    tag: String,
}

#[derive(Default)]
struct ManagerState {
    /// Primary index; handle keys are unique.
    entries: HashMap<u64, Entry>,
    /// Secondary index; a tag references many primary entries by key.
    tags: HashMap<String, Vec<u64>>,
    /// Keys of allocations evicted because an operation failed.
    bad_handles: Vec<u64>,
}

impl ManagerState {
    fn insert(&mut self, key: u64, tag: String, memory: VirtualAllocation) -> Result<(), MemoryError> {
        match self.entries.entry(key) {
            MapEntry::Occupied(_) => Err(MemoryError::DuplicateHandle { key }),
            MapEntry::Vacant(slot) => {
                self.tags.entry(tag.clone()).or_default().push(key);
                slot.insert(Entry { memory, tag });
                Ok(())
            }
        }
    }

    fn take(&mut self, key: u64) -> Option<VirtualAllocation> {
        let entry = self.entries.remove(&key)?;
        if let Some(keys) = self.tags.get_mut(&entry.tag) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.tags.remove(&entry.tag);
            }
        }
        Some(entry.memory)
    }

    /// Removes a broken entry from both indexes and records its key.
    ///
    /// The allocation is dropped here; a failed release has already cleared
    /// its handle, and a failed materialize rolls back through drop.
    fn evict(&mut self, key: u64) {
        if self.take(key).is_some() {
            self.bad_handles.push(key);
        }
    }

    fn keys_of(&self, tag: &str) -> Vec<u64> {
        self.tags.get(tag).cloned().unwrap_or_default()
    }
}

/// Tracks reversible allocations and swaps tagged cohorts in and out.
///
/// A single mutex serializes all operations, including the producer and
/// stage code they invoke: the manager sits on a control path, not a data
/// path, and holding the lock through the staged calls means the indexes
/// are never observed mid-operation.
pub struct VirtualMemoryManager {
    driver: Arc<dyn MemoryDriver>,
    state: Mutex<ManagerState>,
}

impl VirtualMemoryManager {
    /// Creates a manager that constructs allocations against `driver`.
    pub fn new(driver: Arc<dyn MemoryDriver>) -> Self {
        Self {
            driver,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// The driver this manager hands to its allocations.
    pub fn driver(&self) -> &Arc<dyn MemoryDriver> {
        &self.driver
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an allocation under a unique handle key and a tag.
    ///
    /// The allocation is stored as-is; this call does not materialize. The
    /// indexes are unchanged when the key is already taken.
    pub fn add(
        &self,
        key: u64,
        tag: impl Into<String>,
        memory: VirtualAllocation,
    ) -> Result<(), MemoryError> {
        self.lock().insert(key, tag.into(), memory)
    }

    /// Builds an allocation from its parts, materializes it, and registers
    /// it.
    ///
    /// When materialization fails the allocation is discarded and its drop
    /// rolls the staged work back; nothing enters the indexes. The key is
    /// checked first so a duplicate never produces memory it could not
    /// register.
    pub fn add_and_materialize(
        &self,
        key: u64,
        tag: impl Into<String>,
        producer: Box<dyn Producer>,
        stages: Vec<Box<dyn MemoryStage>>,
    ) -> Result<(), MemoryError> {
        let mut state = self.lock();
        if state.entries.contains_key(&key) {
            return Err(MemoryError::DuplicateHandle { key });
        }
        let mut memory = VirtualAllocation::new(self.driver.clone(), producer, stages);
        memory.materialize()?;
        state.insert(key, tag.into(), memory)
    }

    /// Removes and returns the allocation registered under `key`, or `None`
    /// for an unknown key. Never fails.
    pub fn remove(&self, key: u64) -> Option<VirtualAllocation> {
        self.lock().take(key)
    }

    /// Releases every allocation tagged `tag`, never stopping early.
    ///
    /// Allocations whose release failed are evicted from the manager and
    /// recorded for [`VirtualMemoryManager::take_bad_handles`]. Returns the
    /// number of selected entries, or the most recent release error; other
    /// errors are logged.
    pub fn release_by_tag(&self, tag: &str) -> Result<usize, MemoryError> {
        let mut state = self.lock();
        let keys = state.keys_of(tag);
        let count = keys.len();

        let mut last_error: Option<MemoryError> = None;
        for key in keys {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            if let Err(err) = entry.memory.release() {
                state.evict(key);
                if let Some(previous) = last_error.replace(err) {
                    log::warn!("further release failure in cohort `{tag}`: {previous}");
                }
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    /// Materializes every allocation tagged `tag`, all-or-nothing.
    ///
    /// On the first failure the already materialized entries are released
    /// again in reverse order. The failing entry, and any entry whose
    /// rollback release failed, is evicted and recorded; entries that
    /// rolled back cleanly stay registered in the released state. Returns
    /// the number of selected entries, or the original materialize error;
    /// rollback errors are logged and never mask it.
    pub fn materialize_by_tag(&self, tag: &str) -> Result<usize, MemoryError> {
        let mut state = self.lock();
        let keys = state.keys_of(tag);
        let count = keys.len();

        let mut materialized: Vec<u64> = Vec::with_capacity(count);
        for key in keys {
            let Some(entry) = state.entries.get_mut(&key) else {
                continue;
            };
            match entry.memory.materialize() {
                Ok(()) => materialized.push(key),
                Err(err) => {
                    state.evict(key);
                    for &rolled in materialized.iter().rev() {
                        let Some(entry) = state.entries.get_mut(&rolled) else {
                            continue;
                        };
                        if let Err(rollback_err) = entry.memory.release() {
                            log::warn!(
                                "rollback release failed in cohort `{tag}`: {rollback_err}"
                            );
                            state.evict(rolled);
                        }
                    }
                    return Err(err);
                }
            }
        }

        Ok(count)
    }

    /// Drains the keys of allocations evicted because an operation failed.
    ///
    /// The returned list has no duplicates, and a drained key is never
    /// reported again; higher layers use it to scrub their own tables.
    pub fn take_bad_handles(&self) -> Vec<u64> {
        mem::take(&mut self.lock().bad_handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::NullDriver;
    use crate::driver::{DriverError, PhysicalHandle};
    use crate::memory::Status;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Producer double handing out distinct handles and counting traffic.
    #[derive(Default)]
    struct CountingProducer {
        produced: Arc<AtomicU64>,
        disposed: Arc<AtomicU64>,
        fail_produce: bool,
    }

    impl Producer for CountingProducer {
        fn produce(&mut self, _: &dyn MemoryDriver) -> Result<PhysicalHandle, MemoryError> {
            if self.fail_produce {
                return Err(DriverError::OutOfMemory { size: 4096 }.into());
            }
            Ok(self.produced.fetch_add(1, Ordering::Relaxed) + 1)
        }

        fn dispose(&mut self, _: &dyn MemoryDriver, _: PhysicalHandle) -> Result<(), MemoryError> {
            self.disposed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    /// Stage double with switchable failures.
    #[derive(Default)]
    struct ToggleStage {
        fail_setup: bool,
        fail_teardown: bool,
        setups: Arc<AtomicU64>,
        teardowns: Arc<AtomicU64>,
    }

    impl MemoryStage for ToggleStage {
        fn setup(&mut self, _: &dyn MemoryDriver, _: PhysicalHandle) -> Result<(), MemoryError> {
            if self.fail_setup {
                return Err(DriverError::Call {
                    op: "setup",
                    reason: "injected".into(),
                }
                .into());
            }
            self.setups.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn teardown(&mut self, _: &dyn MemoryDriver, _: PhysicalHandle) -> Result<(), MemoryError> {
            self.teardowns.fetch_add(1, Ordering::Relaxed);
            if self.fail_teardown {
                return Err(DriverError::Call {
                    op: "teardown",
                    reason: "injected".into(),
                }
                .into());
            }
            Ok(())
        }
    }

    fn manager() -> VirtualMemoryManager {
        VirtualMemoryManager::new(Arc::new(NullDriver))
    }

    fn released_allocation(
        manager: &VirtualMemoryManager,
        stages: Vec<Box<dyn MemoryStage>>,
    ) -> VirtualAllocation {
        VirtualAllocation::new(
            manager.driver().clone(),
            Box::new(CountingProducer::default()),
            stages,
        )
    }

    #[test_log::test]
    fn add_rejects_duplicate_keys() {
        let manager = manager();
        let first = released_allocation(&manager, vec![]);
        let second = released_allocation(&manager, vec![]);

        manager.add(1, "a", first).unwrap();
        assert!(matches!(
            manager.add(1, "b", second),
            Err(MemoryError::DuplicateHandle { key: 1 })
        ));

        // The original entry is still reachable.
        assert!(manager.remove(1).is_some());
        assert!(manager.remove(1).is_none());
    }

    #[test_log::test]
    fn remove_of_unknown_key_returns_none() {
        assert!(manager().remove(42).is_none());
    }

    #[test_log::test]
    fn add_and_materialize_discards_on_failure() {
        let manager = manager();
        let producer = Box::new(CountingProducer {
            fail_produce: true,
            ..Default::default()
        });

        assert!(
            manager
                .add_and_materialize(1, "a", producer, vec![])
                .is_err()
        );
        assert!(manager.remove(1).is_none());
        // Never-registered allocations are not bad handles.
        assert!(manager.take_bad_handles().is_empty());
    }

    #[test_log::test]
    fn release_and_materialize_cycle_a_cohort() {
        let manager = manager();
        let setups = Arc::new(AtomicU64::new(0));
        for key in [1u64, 2, 3] {
            let stages: Vec<Box<dyn MemoryStage>> = vec![Box::new(ToggleStage {
                setups: setups.clone(),
                ..Default::default()
            })];
            manager
                .add_and_materialize(key, "weights", Box::new(CountingProducer::default()), stages)
                .unwrap();
        }
        manager
            .add_and_materialize(9, "other", Box::new(CountingProducer::default()), vec![])
            .unwrap();
        assert_eq!(setups.load(Ordering::Relaxed), 3);

        assert_eq!(manager.release_by_tag("weights").unwrap(), 3);
        assert_eq!(manager.materialize_by_tag("weights").unwrap(), 3);
        assert_eq!(setups.load(Ordering::Relaxed), 6);

        // Unknown tags select nothing.
        assert_eq!(manager.release_by_tag("nothing").unwrap(), 0);
        assert!(manager.take_bad_handles().is_empty());
    }

    #[test_log::test]
    fn materialize_failure_rolls_the_cohort_back() {
        let manager = manager();
        let good = released_allocation(&manager, vec![Box::new(ToggleStage::default())]);
        let bad = released_allocation(&manager, vec![Box::new(ToggleStage {
            fail_setup: true,
            ..Default::default()
        })]);
        manager.add(1, "kv", good).unwrap();
        manager.add(2, "kv", bad).unwrap();

        assert!(manager.materialize_by_tag("kv").is_err());

        // The healthy entry rolled back and stays registered.
        let survivor = manager.remove(1).expect("entry kept after rollback");
        assert_eq!(survivor.status(), Status::Released);
        // The failing entry is gone and reported exactly once.
        assert!(manager.remove(2).is_none());
        assert_eq!(manager.take_bad_handles(), vec![2]);
        assert!(manager.take_bad_handles().is_empty());
    }

    #[test_log::test]
    fn release_failures_are_quarantined_but_complete() {
        let manager = manager();
        let teardowns = Arc::new(AtomicU64::new(0));
        let disposed = Arc::new(AtomicU64::new(0));
        let stages: Vec<Box<dyn MemoryStage>> = vec![
            Box::new(ToggleStage {
                teardowns: teardowns.clone(),
                ..Default::default()
            }),
            Box::new(ToggleStage {
                fail_teardown: true,
                teardowns: teardowns.clone(),
                ..Default::default()
            }),
            Box::new(ToggleStage {
                teardowns: teardowns.clone(),
                ..Default::default()
            }),
        ];
        let memory = VirtualAllocation::new(
            manager.driver().clone(),
            Box::new(CountingProducer {
                disposed: disposed.clone(),
                ..Default::default()
            }),
            stages,
        );
        manager.add(7, "broken", memory).unwrap();
        manager.materialize_by_tag("broken").unwrap();

        assert!(manager.release_by_tag("broken").is_err());

        // All three teardowns and the dispose ran despite the failure.
        assert_eq!(teardowns.load(Ordering::Relaxed), 3);
        assert_eq!(disposed.load(Ordering::Relaxed), 1);
        assert!(manager.remove(7).is_none());
        assert_eq!(manager.take_bad_handles(), vec![7]);
    }

    #[test_log::test]
    fn repeated_release_by_tag_is_safe() {
        let manager = manager();
        manager
            .add_and_materialize(1, "a", Box::new(CountingProducer::default()), vec![])
            .unwrap();

        assert_eq!(manager.release_by_tag("a").unwrap(), 1);
        assert_eq!(manager.release_by_tag("a").unwrap(), 1);
    }
}
