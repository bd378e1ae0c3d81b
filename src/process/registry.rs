use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::store::VmName;

/// PIDs of hypervisors launched by this manager instance.
///
/// Only a hint: entries are verified against the process table before use
/// and anything launched by an earlier invocation is found by pattern.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    pids: Mutex<HashMap<VmName, u32>>,
}

impl ProcessRegistry {
    pub fn record(&self, name: &VmName, pid: u32) {
        self.lock().insert(name.clone(), pid);
    }

    pub fn get(&self, name: &VmName) -> Option<u32> {
        self.lock().get(name).copied()
    }

    pub fn forget(&self, name: &VmName) -> Option<u32> {
        self.lock().remove(name)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<VmName, u32>> {
        // The map stays consistent even if a holder panicked.
        self.pids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_forgets_per_name() {
        let registry = ProcessRegistry::default();
        let web1: VmName = "web1".parse().unwrap();
        let web2: VmName = "web2".parse().unwrap();

        registry.record(&web1, 100);
        registry.record(&web2, 200);
        registry.record(&web1, 101);

        assert_eq!(registry.get(&web1), Some(101));
        assert_eq!(registry.forget(&web2), Some(200));
        assert_eq!(registry.get(&web2), None);
    }
}
