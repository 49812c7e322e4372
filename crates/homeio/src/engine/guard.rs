use std::collections::HashSet;
use std::sync::Arc;

use crate::store::Store;
use crate::store::StoreError;

/// Answers "does this device have a command in flight?".
///
/// Nothing is cached: every call goes to the queue, so the answer reflects
/// entries the executor finished a moment ago.
#[derive(Clone)]
pub struct PendingCommandGuard {
    store: Arc<dyn Store>,
}

impl PendingCommandGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn has_pending(&self, device: &str) -> Result<bool, StoreError> {
        self.store.has_pending(device)
    }

    /// Every device with a pending or processing command, fetched in one query.
    pub fn snapshot(&self) -> Result<PendingSet, StoreError> {
        Ok(PendingSet(self.store.pending_devices()?))
    }
}

/// Point-in-time set of devices with an outstanding command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSet(HashSet<String>);

impl PendingSet {
    pub fn contains(&self, device: &str) -> bool {
        self.0.contains(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Command;
    use crate::engine::CommandStatus;
    use crate::engine::NewCommand;
    use crate::engine::PowerState;
    use crate::store::CommandQueue;
    use crate::store::MemoryStore;

    fn turn_on(device: &str) -> NewCommand {
        NewCommand {
            device: device.to_string(),
            model: "H6008".to_string(),
            brand: "govee".to_string(),
            command: Command::Turn(PowerState::On),
        }
    }

    #[test]
    fn test_guard_tracks_outstanding_entries() {
        let store = Arc::new(MemoryStore::new());
        let guard = PendingCommandGuard::new(store.clone());

        let entry = store.enqueue(turn_on("D1")).unwrap();
        store.enqueue(turn_on("D2")).unwrap();
        assert!(guard.has_pending("D1").unwrap());
        assert!(!guard.has_pending("D3").unwrap());

        store.transition(entry.id, CommandStatus::Processing).unwrap();
        assert!(guard.snapshot().unwrap().contains("D1"));

        store.transition(entry.id, CommandStatus::Done).unwrap();
        let pending = guard.snapshot().unwrap();
        assert!(!pending.contains("D1"));
        assert!(pending.contains("D2"));
        assert!(!pending.contains("D3"));
    }
}
