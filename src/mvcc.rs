//! Multiversion objects and the registry their garbage collector walks.
//!
//! An [`MvObject`] keeps a chain of committed versions instead of a single
//! in-place value: readers resolve their snapshot against the chain without
//! validation, writers install new versions through the usual commit
//! protocol. The [`MvRegistry`] records every written object per worker and
//! periodically prunes and flattens chains below the minimum running-read
//! TID.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::epoch::ActiveTable;
use crate::object::{LogWrite, Loggable, ObjectId, Transactable};
use crate::runtime::Runtime;
use crate::transaction::{ItemFlags, TransItem, Transaction, TxResult};
use crate::version::{TVersion, Tid, FLAG_MASK};

const MV_KEY: u64 = 0;
const LOCK_SPINS: usize = 100;

/// Collections happen once per this many [`MvRegistry::collect_garbage`]
/// calls.
const CYCLE_LENGTH: u64 = 10;
/// Flattening happens once per this many collections.
const GC_PER_FLATTEN: u64 = 1;

/// A version chain the collector can walk without knowing the value type.
trait MvChain: Send + Sync {
    /// Drops versions no running reader can resolve anymore. Returns how
    /// many were reclaimed.
    fn prune(&self, rtid_inf: u64) -> usize;
    /// Consolidates committed history at or below `rtid_inf` into the base
    /// version. Returns how many versions were merged away.
    fn flatten(&self, rtid_inf: u64) -> usize;
    /// True once the base version is the only one at or below `rtid_inf`.
    fn is_stable(&self, rtid_inf: u64) -> bool;
}

struct MvEntry {
    chain: Weak<dyn MvChain>,
    /// The TID the object was first written at.
    tid: u64,
    /// Set once the base version is stable; the entry's work is done.
    done: Arc<AtomicBool>,
}

/// The per-worker catalog of multiversion objects, walked by the garbage
/// collector and flattener.
pub struct MvRegistry {
    registries: Vec<Mutex<VecDeque<MvEntry>>>,
    enable_gc: AtomicBool,
    is_running: AtomicUsize,
    is_stopping: AtomicBool,
    cycles: AtomicU64,
    active: Arc<ActiveTable>,
}

impl MvRegistry {
    pub(crate) fn new(nworkers: usize, active: Arc<ActiveTable>) -> Self {
        Self {
            registries: (0..nworkers).map(|_| Mutex::new(VecDeque::new())).collect(),
            enable_gc: AtomicBool::new(false),
            is_running: AtomicUsize::new(0),
            is_stopping: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            active,
        }
    }

    /// Enables or disables garbage collection.
    pub fn toggle_gc(&self, enabled: bool) {
        self.enable_gc.store(enabled, Ordering::Release);
    }

    /// The minimum running-read TID across all workers; versions written
    /// before it and superseded are reclaimable.
    #[must_use]
    pub fn rtid_inf(&self) -> u64 {
        self.active.min_rtid()
    }

    /// Returns true when no collection cycle is in progress.
    #[must_use]
    pub fn done(&self) -> bool {
        self.is_running.load(Ordering::Acquire) == 0
    }

    /// Counts a collector tick; every [`CYCLE_LENGTH`] ticks all worker
    /// registries are collected.
    pub fn collect_garbage(&self) {
        if !self.enable_gc.load(Ordering::Acquire) {
            return;
        }
        let cycle = self.cycles.fetch_add(1, Ordering::AcqRel) + 1;
        if cycle % CYCLE_LENGTH != 0 {
            return;
        }
        let flatten = cycle % (CYCLE_LENGTH * GC_PER_FLATTEN) == 0;
        for index in 0..self.registries.len() {
            self.collect_index(index, flatten);
        }
    }

    /// Collects one worker's registry immediately. Callers must not run two
    /// collections of the same index concurrently.
    pub fn collect_garbage_at(&self, index: usize) {
        self.collect_index(index, true);
    }

    fn collect_index(&self, index: usize, flatten: bool) {
        if self.is_stopping.load(Ordering::Acquire) {
            return;
        }
        let rtid_inf = self.rtid_inf();
        self.is_running.fetch_add(1, Ordering::AcqRel);
        if self.is_stopping.load(Ordering::Acquire) {
            self.is_running.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let mut registry = self.registries[index].lock();
        registry.retain(|entry| {
            let Some(chain) = entry.chain.upgrade() else {
                // The object was dropped; nothing left to collect.
                return false;
            };
            if flatten {
                chain.flatten(rtid_inf);
            }
            chain.prune(rtid_inf);
            if chain.is_stable(rtid_inf) && entry.tid < rtid_inf {
                entry.done.store(true, Ordering::Release);
                return false;
            }
            true
        });
        drop(registry);

        self.is_running.fetch_sub(1, Ordering::AcqRel);
    }

    fn register(&self, worker: usize, entry: MvEntry) {
        self.registries[worker].lock().push_back(entry);
    }

    /// Returns the number of live entries across all registries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registries
            .iter()
            .map(|registry| registry.lock().len())
            .sum()
    }

    /// Returns true when no object is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signals shutdown and waits for any in-progress collection to finish.
    pub fn stop(&self) {
        self.is_stopping.store(true, Ordering::Release);
        while self.is_running.load(Ordering::Acquire) > 0 {
            std::hint::spin_loop();
        }
    }
}

struct MvVersion<T> {
    wtid: u64,
    value: T,
}

struct MvInner<T> {
    id: ObjectId,
    /// Newest first. The back entry is the base version.
    versions: Mutex<VecDeque<MvVersion<T>>>,
    /// Guards installs into the chain.
    head_version: TVersion,
    registered: AtomicBool,
    done: Arc<AtomicBool>,
}

/// A multiversion transactional value.
///
/// Reads resolve against the version chain at the transaction's snapshot
/// and need no commit-time validation; writes append a version stamped
/// with the commit TID.
pub struct MvObject<T> {
    inner: Arc<MvInner<T>>,
    registry: Arc<MvRegistry>,
}

impl<T> Clone for MvObject<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<T> MvObject<T>
where
    T: Clone + Loggable + Send + Sync + 'static,
{
    /// Returns a multiversion object holding `initial`, managed by
    /// `runtime`'s registry.
    #[must_use]
    pub fn new(runtime: &Runtime, initial: T) -> Self {
        let mut versions = VecDeque::new();
        versions.push_back(MvVersion {
            wtid: 0,
            value: initial,
        });
        Self {
            inner: Arc::new(MvInner {
                id: ObjectId::next(),
                versions: Mutex::new(versions),
                head_version: TVersion::default(),
                registered: AtomicBool::new(false),
                done: Arc::new(AtomicBool::new(false)),
            }),
            registry: runtime.registry_handle(),
        }
    }

    fn owner(&self) -> Arc<dyn Transactable> {
        self.inner.clone()
    }

    /// Reads the value visible at `txn`'s snapshot.
    pub fn read(&self, txn: &mut Transaction) -> TxResult<T> {
        let start = txn.start_tid().counter_portion();
        let item = txn.item(&self.owner(), MV_KEY);
        if let Some(pending) = item.write_value::<T>() {
            return Ok(pending.clone());
        }
        Ok(self.inner.read_at(start))
    }

    /// Reads the newest committed value outside any transaction.
    #[must_use]
    pub fn read_newest(&self) -> T {
        self.inner.read_at(u64::MAX)
    }

    /// Schedules a write. The object registers itself with the worker's
    /// MVCC registry the first time it is written.
    pub fn write(&self, txn: &mut Transaction, value: T) {
        if !self.inner.registered.swap(true, Ordering::AcqRel) {
            let chain: Arc<dyn MvChain> = self.inner.clone();
            self.registry.register(
                txn.worker_index(),
                MvEntry {
                    chain: Arc::downgrade(&chain),
                    tid: txn.start_tid().counter_portion(),
                    done: self.inner.done.clone(),
                },
            );
        }
        txn.item(&self.owner(), MV_KEY).add_write(value);
    }

    /// Returns the number of versions currently chained.
    #[must_use]
    pub fn version_count(&self) -> usize {
        self.inner.versions.lock().len()
    }
}

impl<T: Clone> MvInner<T> {
    fn read_at(&self, snapshot: u64) -> T {
        let versions = self.versions.lock();
        versions
            .iter()
            .find(|version| version.wtid <= snapshot)
            .or_else(|| versions.back())
            .expect("chain always holds a base version")
            .value
            .clone()
    }
}

impl<T: Send + Sync> MvChain for MvInner<T> {
    fn prune(&self, rtid_inf: u64) -> usize {
        let mut versions = self.versions.lock();
        // Keep everything newer than rtid_inf plus the newest version at or
        // below it, which is the base any running reader resolves to.
        let base = versions.iter().position(|version| version.wtid <= rtid_inf);
        match base {
            Some(base) if base + 1 < versions.len() => {
                let dropped = versions.len() - base - 1;
                versions.truncate(base + 1);
                dropped
            }
            _ => 0,
        }
    }

    fn flatten(&self, rtid_inf: u64) -> usize {
        // Full-value chains consolidate by pruning: merging adjacent
        // committed versions into the base is equivalent to keeping only
        // the newest one a reader can still resolve.
        self.prune(rtid_inf)
    }

    fn is_stable(&self, rtid_inf: u64) -> bool {
        let versions = self.versions.lock();
        versions
            .iter()
            .filter(|version| version.wtid <= rtid_inf)
            .count()
            <= 1
    }
}

impl<T> Transactable for MvInner<T>
where
    T: Clone + Loggable + Send + Sync + 'static,
{
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn lock(&self, item: &mut TransItem) -> bool {
        if !self.head_version.try_lock_spin(LOCK_SPINS) {
            return false;
        }
        item.add_flags(ItemFlags::LOCK_HELD);
        item.note_locked_version(self.head_version.load());
        true
    }

    fn unlock(&self, _item: &mut TransItem) {
        self.head_version.unlock();
    }

    fn check(&self, item: &TransItem) -> bool {
        item.read_version()
            .map_or(true, |read| self.head_version.check(read, item.has_lock()))
    }

    fn install(&self, item: &mut TransItem, commit_tid: Tid) {
        if let Some(value) = item.take_write::<T>() {
            self.versions.lock().push_front(MvVersion {
                wtid: commit_tid.0 & !FLAG_MASK,
                value,
            });
        }
        self.head_version.set_version(commit_tid);
    }

    fn log_write(&self, item: &TransItem) -> Option<LogWrite> {
        let value = item.write_value::<T>()?;
        Some(LogWrite {
            key: self.id.to_string().into_bytes().into(),
            value: value.to_log_bytes(),
        })
    }
}
