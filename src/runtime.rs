//! The process-lifecycle runtime: the global commit counter, the epoch
//! advancer, the reclaimer, the MVCC registry, and the optional durability
//! pipeline, assembled with an explicit `new(options)`/`stop()` lifecycle
//! instead of module-load side effects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::epoch::{ActiveTable, EpochAdvancer, EpochState};
use crate::error::{Error, ErrorKind, InternalError};
use crate::log::{LogConfig, LogSystem};
use crate::mvcc::MvRegistry;
use crate::reclaim::Reclaimer;
use crate::transaction::{Abort, Transaction};
use crate::version::Tid;

/// Options a [`Runtime`] is assembled from.
#[derive(Debug, Clone)]
#[must_use]
pub struct Options {
    /// The number of worker threads that will run transactions (>= 1).
    pub nworkers: usize,
    /// The epoch-advancer tick interval.
    pub epoch_interval: Duration,
    /// Durability configuration; `None` runs the engine without a log.
    pub durability: Option<LogConfig>,
}

impl Options {
    /// Options for an in-memory (non-durable) runtime.
    pub const fn in_memory(nworkers: usize) -> Self {
        Self {
            nworkers,
            epoch_interval: Duration::from_millis(40),
            durability: None,
        }
    }

    /// Options for a durable runtime logging per `config`.
    pub fn durable(nworkers: usize, config: LogConfig) -> Self {
        Self {
            nworkers,
            epoch_interval: Duration::from_millis(40),
            durability: Some(config),
        }
    }

    /// Overrides the epoch-advancer tick interval.
    pub fn epoch_interval(mut self, interval: Duration) -> Self {
        self.epoch_interval = interval;
        self
    }
}

pub(crate) struct RuntimeShared {
    pub(crate) epoch: Arc<EpochState>,
    pub(crate) active: Arc<ActiveTable>,
    pub(crate) reclaim: Arc<Reclaimer>,
    pub(crate) registry: Arc<MvRegistry>,
    tid_counter: AtomicU64,
    busy: Vec<AtomicBool>,
    log: Option<LogSystem>,
    stopping: AtomicBool,
    nworkers: usize,
}

impl RuntimeShared {
    pub fn current_epoch(&self) -> u64 {
        self.epoch.current()
    }

    pub fn tid_counter(&self) -> &AtomicU64 {
        &self.tid_counter
    }

    pub fn log(&self) -> Option<&LogSystem> {
        self.log.as_ref()
    }

    pub fn end_transaction(&self, worker: usize) {
        self.active.leave(worker);
        self.busy[worker].store(false, Ordering::Release);
    }
}

/// The transactional runtime.
///
/// Owns every background thread the engine needs. [`Runtime::stop`] (also
/// run on drop) performs the clean shutdown sequence: new transactions are
/// refused, in-flight ones drain, the collector stops, and the writers,
/// persister, and epoch advancer are joined.
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    advancer: Mutex<Option<EpochAdvancer>>,
    stopped: AtomicBool,
}

impl Runtime {
    /// Assembles and starts a runtime.
    pub fn new(options: Options) -> Result<Self, Error> {
        if options.nworkers == 0 {
            return Err(ErrorKind::Config(String::from("nworkers must be >= 1")).into());
        }
        let epoch = Arc::new(EpochState::new());
        let active = Arc::new(ActiveTable::new(options.nworkers));
        let reclaim = Arc::new(Reclaimer::default());
        let registry = Arc::new(MvRegistry::new(options.nworkers, active.clone()));

        let log = options
            .durability
            .map(|config| LogSystem::spawn(options.nworkers, config, epoch.clone(), active.clone()))
            .transpose()?;

        let shared = Arc::new(RuntimeShared {
            epoch: epoch.clone(),
            active: active.clone(),
            reclaim: reclaim.clone(),
            registry: registry.clone(),
            tid_counter: AtomicU64::new(0),
            busy: (0..options.nworkers)
                .map(|_| AtomicBool::new(false))
                .collect(),
            log,
            stopping: AtomicBool::new(false),
            nworkers: options.nworkers,
        });

        let advancer = EpochAdvancer::spawn(epoch, options.epoch_interval, move |advanced| {
            let min_active = active.min_active_epoch(advanced);
            reclaim.quiesce(min_active);
            registry.collect_garbage();
        })?;

        Ok(Self {
            shared,
            advancer: Mutex::new(Some(advancer)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Returns the number of configured workers.
    #[must_use]
    pub fn nworkers(&self) -> usize {
        self.shared.nworkers
    }

    /// Returns the current global epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.current()
    }

    /// Returns the system-wide durable epoch, or `None` when the runtime
    /// has no durability pipeline.
    #[must_use]
    pub fn durable_epoch(&self) -> Option<u64> {
        self.shared.log.as_ref().map(LogSystem::durable_epoch)
    }

    /// Returns the MVCC registry.
    #[must_use]
    pub fn registry(&self) -> &MvRegistry {
        &self.shared.registry
    }

    /// Returns the handle for worker `index`.
    pub fn worker(&self, index: usize) -> Result<Worker, Error> {
        if index >= self.shared.nworkers {
            return Err(ErrorKind::Config(format!(
                "worker {index} out of range (nworkers = {})",
                self.shared.nworkers
            ))
            .into());
        }
        Ok(Worker {
            shared: self.shared.clone(),
            index,
        })
    }

    /// Forces an immediate epoch tick plus a writer and persister batch.
    /// A test hook; production threads run on their own intervals.
    pub fn force_tick(&self) {
        if let Some(advancer) = &*self.advancer.lock() {
            advancer.force_tick();
        }
        if let Some(log) = &self.shared.log {
            log.force_tick();
        }
    }

    pub(crate) fn reclaim_handle(&self) -> Arc<Reclaimer> {
        self.shared.reclaim.clone()
    }

    pub(crate) fn epoch_handle(&self) -> Arc<EpochState> {
        self.shared.epoch.clone()
    }

    pub(crate) fn registry_handle(&self) -> Arc<MvRegistry> {
        self.shared.registry.clone()
    }

    /// Stops the runtime: refuses new transactions, waits for in-flight
    /// transactions to drain, stops the collector, and joins every
    /// background thread.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.stopping.store(true, Ordering::Release);
        while self.shared.busy.iter().any(|busy| busy.load(Ordering::Acquire)) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shared.registry.stop();
        if let Some(advancer) = self.advancer.lock().as_mut() {
            advancer.stop();
        }
        if let Some(log) = &self.shared.log {
            log.stop();
        }
        // Everything still deferred is unreachable now.
        self.shared.reclaim.quiesce(u64::MAX);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A per-worker handle: the typed thread context transactional entry
/// points go through. Each worker runs at most one transaction at a time.
#[derive(Clone)]
pub struct Worker {
    shared: Arc<RuntimeShared>,
    index: usize,
}

impl Worker {
    /// Returns this worker's index.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.index
    }

    /// Begins a transaction: stamps the start TID from the global commit
    /// counter and enters the current epoch.
    pub fn begin(&self) -> Result<Transaction, Error> {
        if self.shared.stopping.load(Ordering::Acquire) {
            return Err(ErrorKind::Shutdown.into());
        }
        if self.shared.busy[self.index]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ErrorKind::Internal(InternalError::WorkerBusy).into());
        }
        let epoch = self.shared.epoch.current();
        let start_tid = Tid(self.shared.tid_counter.load(Ordering::Acquire));
        self.shared.active.enter(self.index, epoch, start_tid.0);
        Ok(Transaction::new(
            self.shared.clone(),
            self.index,
            start_tid,
            epoch,
        ))
    }

    /// Runs `body` in a transaction, retrying transparently on abort. In
    /// durable mode the call returns only once the commit is covered by the
    /// durable epoch.
    pub fn run<T, F>(&self, mut body: F) -> Result<T, Error>
    where
        F: FnMut(&mut Transaction) -> Result<T, Abort>,
    {
        loop {
            let mut txn = self.begin()?;
            match body(&mut txn) {
                Ok(value) => {
                    if txn.try_commit()? {
                        let commit_epoch = txn
                            .commit_tid()
                            .map_or_else(|| self.shared.epoch.current(), Tid::epoch);
                        drop(txn);
                        if let Some(log) = self.shared.log() {
                            log.wait_durable(commit_epoch)?;
                        }
                        return Ok(value);
                    }
                }
                Err(Abort) => drop(txn),
            }
        }
    }
}
