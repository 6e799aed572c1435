//! Epoch-based deferred reclamation.
//!
//! Objects that unlink shared state while transactions may still hold item
//! entries referencing it hand the storage to the reclaimer instead of
//! dropping it. Garbage is binned by the epoch it was retired in and freed
//! once no active transaction entered at or before that epoch.

use std::collections::VecDeque;

use parking_lot::Mutex;

struct Bin {
    epoch: u64,
    garbage: Vec<Box<dyn Send>>,
}

/// Collects retired allocations until every transaction that could have
/// observed them has finished.
#[derive(Default)]
pub(crate) struct Reclaimer {
    bins: Mutex<VecDeque<Bin>>,
}

impl Reclaimer {
    /// Schedules `garbage` for reclamation once every transaction active in
    /// `epoch` has finished.
    pub fn defer_free(&self, epoch: u64, garbage: Box<dyn Send>) {
        let mut bins = self.bins.lock();
        match bins.back_mut() {
            Some(bin) if bin.epoch == epoch => bin.garbage.push(garbage),
            _ => bins.push_back(Bin {
                epoch,
                garbage: vec![garbage],
            }),
        }
    }

    /// Frees every bin retired strictly before `min_active_epoch` and
    /// returns the number of allocations dropped.
    pub fn quiesce(&self, min_active_epoch: u64) -> usize {
        let mut freed = Vec::new();
        {
            let mut bins = self.bins.lock();
            while bins
                .front()
                .map_or(false, |bin| bin.epoch < min_active_epoch)
            {
                freed.push(bins.pop_front().expect("checked front"));
            }
        }
        // Dropped outside the lock; destructors may be arbitrarily heavy.
        freed.iter().map(|bin| bin.garbage.len()).sum()
    }

    /// Returns the number of allocations awaiting reclamation.
    pub fn pending(&self) -> usize {
        self.bins.lock().iter().map(|bin| bin.garbage.len()).sum()
    }
}
