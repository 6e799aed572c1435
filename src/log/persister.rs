use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use super::LogShared;
use crate::error::Error;

/// The persister thread: advances the system-wide durable epoch and
/// publishes it crash-atomically to the `pepoch` marker.
pub(super) struct PersisterThread {
    shared: Arc<LogShared>,
    ticks: flume::Receiver<()>,
}

impl PersisterThread {
    pub fn new(shared: Arc<LogShared>, ticks: flume::Receiver<()>) -> Self {
        Self { shared, ticks }
    }

    pub fn run(self) {
        loop {
            let disconnected = matches!(
                self.ticks.recv_timeout(self.shared.config.tick_interval),
                Err(flume::RecvTimeoutError::Disconnected)
            );
            // Keep advancing while the writers drain their final batches;
            // the very last pass runs after they have all exited.
            let last_pass = disconnected
                || (self.shared.stopping.load(Ordering::Acquire)
                    && self.shared.writers_done.load(Ordering::Acquire));
            self.advance_system_sync_epoch()
                .expect("persist epoch io failure; durability cannot be guaranteed");
            if last_pass {
                break;
            }
        }
    }

    /// Computes the minimum durable epoch over every `(logger, worker)`
    /// slot, arbitrarily advancing fully quiescent workers so an idle
    /// thread does not drag down the persistence of the system.
    fn advance_system_sync_epoch(&self) -> Result<(), Error> {
        let shared = &self.shared;
        let cur_epoch = shared.epoch.current();
        let best_epoch = cur_epoch.saturating_sub(1);

        let mut min_so_far = u64::MAX;
        for (logger, assignment) in shared.assignments.iter().enumerate() {
            for &worker in assignment {
                min_so_far = min_so_far.min(self.slot_epoch(logger, worker, best_epoch));
            }
        }

        assert!(min_so_far < u64::MAX);
        let syssync = shared.system_sync_epoch.load(Ordering::Acquire);
        assert!(syssync <= min_so_far, "durable epoch regressed");

        if syssync < min_so_far {
            self.publish_pepoch(min_so_far)?;
            shared.system_sync_epoch.store(min_so_far, Ordering::Release);
            shared.notify_durable();
        }
        Ok(())
    }

    /// Returns the durable epoch for one `(logger, worker)` slot. A worker
    /// with no sealed or in-flight buffers can be advanced straight to
    /// `best_epoch`: anything it logs next will be in a later epoch. Its
    /// rotation lock is only tried a bounded number of times so a busy
    /// worker never stalls the persister.
    fn slot_epoch(&self, logger: usize, worker: usize, best_epoch: u64) -> u64 {
        let shared = &self.shared;
        let ctx = &shared.ctxs[worker];
        let slot = &shared.per_thread_sync_epochs[logger][worker];

        // A worker still executing a transaction that entered at or before
        // `best_epoch` may yet log records in it; it cannot be advanced.
        let quiescent = ctx.is_quiesced() && shared.active.active_epoch(worker) > best_epoch;
        if quiescent {
            for _ in 0..3 {
                let Some(guard) = ctx.lock.try_lock() else {
                    continue;
                };
                // An outstanding fill buffer holds records; push it to the
                // writer rather than advancing past it.
                ctx.force_current();
                let still_quiescent =
                    ctx.is_quiesced() && shared.active.active_epoch(worker) > best_epoch;
                if still_quiescent && best_epoch > slot.load(Ordering::Acquire) {
                    slot.store(best_epoch, Ordering::Release);
                }
                drop(guard);
                break;
            }
        }

        slot.load(Ordering::Acquire)
    }

    /// Writes `epoch` to `persist_epoch_<N>`, fsyncs it, and renames it
    /// over `pepoch` so the marker update is crash-atomic.
    fn publish_pepoch(&self, epoch: u64) -> Result<(), Error> {
        let root = &self.shared.config.root_folder;
        let staged = root.join(format!("persist_epoch_{epoch}"));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staged)?;
        file.write_u64::<LittleEndian>(epoch)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(staged, root.join("pepoch"))?;
        Ok(())
    }
}
