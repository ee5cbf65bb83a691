//! Shared, process-wide message-id counter for both the private and group
//! message stores (`data/msg.id`). One counter backs both stores instead of
//! two independent sequences, so an id is globally unique regardless of
//! which conversation it was allocated for.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::fileutil::{read_counter, write_counter};

pub struct MessageIdAllocator {
    path: PathBuf,
    next: Mutex<u64>,
}

impl MessageIdAllocator {
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join("msg.id");
        let next = read_counter(&path, 1);
        Self {
            path,
            next: Mutex::new(next),
        }
    }

    /// Recovers the counter from the max id observed across existing logs,
    /// raising it if storage already holds ids beyond the persisted counter
    /// (e.g. the counter file itself was lost but the logs survived).
    pub fn observe_existing_max(&self, max_seen: u64) {
        let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
        if max_seen + 1 > *next {
            *next = max_seen + 1;
            let _ = write_counter(&self.path, *next);
        }
    }

    pub fn allocate(&self) -> u64 {
        let mut next = self.next.lock().unwrap_or_else(|p| p.into_inner());
        let id = *next;
        *next += 1;
        let _ = write_counter(&self.path, *next);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocations_are_monotone_and_persist() {
        let dir = tempdir().unwrap();
        let alloc = MessageIdAllocator::new(dir.path());
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert!(b > a);
        drop(alloc);
        let alloc = MessageIdAllocator::new(dir.path());
        let c = alloc.allocate();
        assert!(c > b);
    }

    #[test]
    fn recovery_raises_counter_past_observed_max() {
        let dir = tempdir().unwrap();
        let alloc = MessageIdAllocator::new(dir.path());
        alloc.observe_existing_max(500);
        assert_eq!(alloc.allocate(), 501);
    }
}
