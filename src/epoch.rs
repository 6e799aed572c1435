//! The process-wide epoch counter, its advancer thread, and per-worker
//! epoch membership.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// The process-wide epoch counter. Epochs group transactions for durability
/// accounting; the advancer thread ticks the counter on a fixed interval.
#[derive(Debug)]
pub(crate) struct EpochState {
    global: AtomicU64,
}

impl EpochState {
    pub fn new() -> Self {
        Self {
            global: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    pub fn advance(&self) -> u64 {
        self.global.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Which epoch each worker's active transaction entered at, plus its
/// start TID. Idle workers hold `u64::MAX` in both slots.
#[derive(Debug)]
pub(crate) struct ActiveTable {
    epochs: Vec<AtomicU64>,
    rtids: Vec<AtomicU64>,
}

impl ActiveTable {
    pub fn new(nworkers: usize) -> Self {
        Self {
            epochs: (0..nworkers).map(|_| AtomicU64::new(u64::MAX)).collect(),
            rtids: (0..nworkers).map(|_| AtomicU64::new(u64::MAX)).collect(),
        }
    }

    pub fn enter(&self, worker: usize, epoch: u64, start_tid: u64) {
        self.epochs[worker].store(epoch, Ordering::Release);
        self.rtids[worker].store(start_tid, Ordering::Release);
    }

    pub fn leave(&self, worker: usize) {
        self.epochs[worker].store(u64::MAX, Ordering::Release);
        self.rtids[worker].store(u64::MAX, Ordering::Release);
    }

    pub fn is_active(&self, worker: usize) -> bool {
        self.epochs[worker].load(Ordering::Acquire) != u64::MAX
    }

    /// The epoch `worker`'s active transaction entered at, or `u64::MAX`
    /// when idle.
    pub fn active_epoch(&self, worker: usize) -> u64 {
        self.epochs[worker].load(Ordering::Acquire)
    }

    /// Returns the oldest epoch any active transaction entered at, or
    /// `current` when every worker is idle.
    pub fn min_active_epoch(&self, current: u64) -> u64 {
        self.epochs
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .min()
            .unwrap_or(u64::MAX)
            .min(current)
    }

    /// Returns the minimum running-read TID across all workers, or
    /// `u64::MAX` when every worker is idle.
    pub fn min_rtid(&self) -> u64 {
        self.rtids
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .min()
            .unwrap_or(u64::MAX)
    }
}

/// The epoch-advancer thread. Ticks [`EpochState`] every `interval` (or
/// when forced, so tests never have to wait) and invokes a runtime-supplied
/// maintenance hook with the new epoch.
pub(crate) struct EpochAdvancer {
    force: flume::Sender<()>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl EpochAdvancer {
    pub fn spawn<F>(
        epoch: Arc<EpochState>,
        interval: Duration,
        on_tick: F,
    ) -> Result<Self, crate::error::Error>
    where
        F: Fn(u64) + Send + 'static,
    {
        let (force, ticks) = flume::bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(String::from("yamadori-epoch"))
            .spawn(move || loop {
                match ticks.recv_timeout(interval) {
                    Ok(()) | Err(flume::RecvTimeoutError::Timeout) => {}
                    Err(flume::RecvTimeoutError::Disconnected) => break,
                }
                if thread_stop.load(Ordering::Acquire) {
                    break;
                }
                let advanced = epoch.advance();
                on_tick(advanced);
            })
            .map_err(crate::error::ErrorKind::message)?;
        Ok(Self {
            force,
            stop,
            handle: Some(handle),
        })
    }

    /// Forces an immediate tick.
    pub fn force_tick(&self) {
        drop(self.force.try_send(()));
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        drop(self.force.try_send(()));
        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }
}

impl Drop for EpochAdvancer {
    fn drop(&mut self) {
        self.stop();
    }
}
