//! Device → owner allocation map.
//!
//! All state sits behind one exclusive lock. Multi-device allocation is
//! all-or-nothing: either every requested ID is free and all are bound to
//! the owner, or nothing changes. The lock is never held across an await
//! or an external call.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("device {device_id} already allocated to {owner:?}")]
    AlreadyAllocated { device_id: String, owner: String },
}

/// Concurrency-safe allocation table.
#[derive(Debug, Default)]
pub struct DeviceAllocator {
    /// Device ID → owner token ("" = allocated, owner unknown).
    allocated: Mutex<HashMap<String, String>>,
}

impl DeviceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.allocated.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind every ID in `ids` to `owner`, or fail without mutating anything.
    pub fn allocate<S: AsRef<str>>(&self, ids: &[S], owner: &str) -> Result<(), AllocatorError> {
        let mut table = self.table();

        if let Some((device_id, current)) = ids
            .iter()
            .find_map(|id| table.get_key_value(id.as_ref()))
        {
            return Err(AllocatorError::AlreadyAllocated {
                device_id: device_id.clone(),
                owner: current.clone(),
            });
        }

        for id in ids {
            table.insert(id.as_ref().to_string(), owner.to_string());
            info!(device = id.as_ref(), owner, "Device allocated");
        }
        Ok(())
    }

    /// Release the given IDs. Absent IDs are ignored. Returns the released IDs.
    pub fn deallocate<S: AsRef<str>>(&self, ids: &[S]) -> Vec<String> {
        let mut table = self.table();
        let mut released = Vec::new();
        for id in ids {
            if let Some(owner) = table.remove(id.as_ref()) {
                info!(device = id.as_ref(), owner = %owner, "Device deallocated");
                released.push(id.as_ref().to_string());
            }
        }
        released
    }

    pub fn is_available(&self, id: &str) -> bool {
        !self.table().contains_key(id)
    }

    /// Owner token of an allocated device, empty when free or unowned.
    pub fn owner(&self, id: &str) -> String {
        self.table().get(id).cloned().unwrap_or_default()
    }

    /// Drop every allocation whose device is no longer discovered.
    pub fn cleanup_orphaned(&self, discovered: &HashSet<String>) -> Vec<String> {
        let mut table = self.table();
        let orphaned: Vec<String> = table
            .keys()
            .filter(|id| !discovered.contains(*id))
            .cloned()
            .collect();
        for id in &orphaned {
            table.remove(id);
            warn!(device = %id, "Cleaned orphaned device");
        }
        orphaned
    }

    /// Copy of the full allocation table.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.table().clone()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn ids(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_allocate_and_conflict() {
        let alloc = DeviceAllocator::new();
        alloc.allocate(&["gpu-0"], "A").unwrap();

        let err = alloc.allocate(&["gpu-0"], "B").unwrap_err();
        assert_eq!(
            err,
            AllocatorError::AlreadyAllocated {
                device_id: "gpu-0".to_string(),
                owner: "A".to_string(),
            }
        );
        assert_eq!(alloc.owner("gpu-0"), "A");
    }

    #[test]
    fn test_conflict_commits_nothing() {
        let alloc = DeviceAllocator::new();
        alloc.allocate(&["gpu-1"], "A").unwrap();

        assert!(alloc.allocate(&["gpu-0", "gpu-1", "gpu-2"], "B").is_err());
        assert!(alloc.is_available("gpu-0"));
        assert!(alloc.is_available("gpu-2"));
        assert_eq!(alloc.len(), 1);
    }

    #[test]
    fn test_deallocate_is_idempotent() {
        let alloc = DeviceAllocator::new();
        alloc.allocate(&["gpu-0", "gpu-1"], "").unwrap();
        assert_eq!(alloc.owner("gpu-0"), "");
        assert!(!alloc.is_available("gpu-0"));

        assert_eq!(alloc.deallocate(&["gpu-0", "gpu-9"]), vec!["gpu-0".to_string()]);
        assert!(alloc.deallocate(&["gpu-0"]).is_empty());
        assert!(alloc.is_available("gpu-0"));
        assert!(!alloc.is_available("gpu-1"));
    }

    #[test]
    fn test_cleanup_keeps_only_discovered() {
        let alloc = DeviceAllocator::new();
        alloc.allocate(&["a", "b", "c", "d"], "owner").unwrap();

        let discovered = ids(&["b", "d", "z"]);
        let mut removed = alloc.cleanup_orphaned(&discovered);
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "c".to_string()]);

        for key in alloc.snapshot().keys() {
            assert!(discovered.contains(key));
        }

        alloc.cleanup_orphaned(&HashSet::new());
        assert!(alloc.is_empty());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let alloc = DeviceAllocator::new();
        alloc.allocate(&["gpu-0"], "A").unwrap();
        let mut snap = alloc.snapshot();
        snap.clear();
        assert_eq!(alloc.len(), 1);
    }

    #[test]
    fn test_concurrent_allocations_single_owner() {
        let alloc = Arc::new(DeviceAllocator::new());
        let devices: Vec<String> = (0..16).map(|i| format!("gpu-{i}")).collect();

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let alloc = alloc.clone();
                let devices = devices.clone();
                std::thread::spawn(move || {
                    let owner = format!("pod-{worker}");
                    let mut won = Vec::new();
                    for round in 0..200 {
                        let a = &devices[(worker * 3 + round) % devices.len()];
                        let b = &devices[(worker * 5 + round * 7) % devices.len()];
                        let pair = if a == b { vec![a.clone()] } else { vec![a.clone(), b.clone()] };
                        if alloc.allocate(&pair, &owner).is_ok() {
                            for id in &pair {
                                assert_eq!(alloc.owner(id), owner);
                            }
                            won.push(pair);
                        }
                        if round % 3 == 0 {
                            if let Some(pair) = won.pop() {
                                alloc.deallocate(&pair);
                            }
                        }
                    }
                    won
                })
            })
            .collect();

        let mut held: HashMap<String, usize> = HashMap::new();
        for h in handles {
            for pair in h.join().unwrap() {
                for id in pair {
                    *held.entry(id).or_default() += 1;
                }
            }
        }

        // Every device still held is held exactly once.
        assert!(held.values().all(|&n| n == 1));
        assert_eq!(held.len(), alloc.len());
    }
}
