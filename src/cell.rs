//! A single versioned transactional value, the smallest [`Transactable`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::{LogWrite, Loggable, ObjectId, Transactable};
use crate::transaction::{Abort, ItemFlags, TransItem, Transaction, TxResult};
use crate::version::{TVersion, Tid, FLAG_MASK, INCREMENT, LOCK_BIT};

const CELL_KEY: u64 = 0;
const LOCK_SPINS: usize = 100;

/// A transactional cell holding one value guarded by one version word.
///
/// By default the cell runs in OCC mode: installs bump the version counter.
/// A cell created with [`TCell::new_generic_stm`] instead publishes the
/// commit TID into the version word and aborts readers whose snapshot the
/// current version postdates, the way a generic STM validates eagerly.
pub struct TCell<T> {
    inner: Arc<CellInner<T>>,
}

impl<T> Clone for TCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct CellInner<T> {
    id: ObjectId,
    version: TVersion,
    value: Mutex<T>,
    generic_stm: bool,
}

impl<T> TCell<T>
where
    T: Clone + Loggable + Send + Sync + 'static,
{
    /// Returns a cell holding `value` in OCC mode.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::build(value, false)
    }

    /// Returns a cell holding `value` in generic-STM mode.
    #[must_use]
    pub fn new_generic_stm(value: T) -> Self {
        Self::build(value, true)
    }

    fn build(value: T, generic_stm: bool) -> Self {
        // A generic-STM cell's version is a TID; the initial value must
        // predate every transaction's snapshot.
        let initial = if generic_stm { 0 } else { INCREMENT };
        Self {
            inner: Arc::new(CellInner {
                id: ObjectId::next(),
                version: TVersion::new(initial),
                value: Mutex::new(value),
                generic_stm,
            }),
        }
    }

    fn owner(&self) -> Arc<dyn Transactable> {
        self.inner.clone()
    }

    /// Reads the cell, returning the pending write when this transaction
    /// already wrote it.
    pub fn read(&self, txn: &mut Transaction) -> TxResult<T> {
        let start_tid = txn.start_tid();
        let item = txn.item(&self.owner(), CELL_KEY);
        if let Some(pending) = item.write_value::<T>() {
            return Ok(pending.clone());
        }
        let (version, value) = self.inner.atomic_read();
        if self.inner.generic_stm
            && ((version & !FLAG_MASK) > start_tid.counter_portion() || version & LOCK_BIT != 0)
        {
            return Err(Abort);
        }
        item.add_read(version);
        Ok(value)
    }

    /// Reads the cell outside any transaction.
    #[must_use]
    pub fn read_nontrans(&self) -> T {
        self.inner.atomic_read().1
    }

    /// Schedules a write of `value`.
    pub fn write(&self, txn: &mut Transaction, value: T) {
        txn.item(&self.owner(), CELL_KEY).add_write(value);
    }
}

impl<T> CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A consistent unlocked snapshot: re-reads until the version is stable
    /// across the value read.
    fn atomic_read(&self) -> (u64, T) {
        loop {
            let before = self.version.load();
            let value = self.value.lock().clone();
            let after = self.version.load();
            if before == after {
                return (before, value);
            }
            std::hint::spin_loop();
        }
    }
}

impl<T> Transactable for CellInner<T>
where
    T: Clone + Loggable + Send + Sync + 'static,
{
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn lock(&self, item: &mut TransItem) -> bool {
        if !self.version.try_lock_spin(LOCK_SPINS) {
            return false;
        }
        item.add_flags(ItemFlags::LOCK_HELD);
        item.note_locked_version(self.version.load());
        if let Some(read) = item.read_version() {
            // The reader snapshot is already stale; abort before validation.
            if !self.version.check(read, true) {
                return false;
            }
        }
        true
    }

    fn unlock(&self, _item: &mut TransItem) {
        self.version.unlock();
    }

    fn check(&self, item: &TransItem) -> bool {
        item.read_version()
            .map_or(true, |read| self.version.check(read, item.has_lock()))
    }

    fn install(&self, item: &mut TransItem, commit_tid: Tid) {
        if let Some(value) = item.take_write::<T>() {
            *self.value.lock() = value;
        }
        if self.generic_stm {
            self.version.set_version(commit_tid);
        } else {
            self.version.inc_invalid_version();
        }
    }

    fn log_write(&self, item: &TransItem) -> Option<LogWrite> {
        let value = item.write_value::<T>()?;
        Some(LogWrite {
            key: self.id.to_string().into_bytes().into(),
            value: value.to_log_bytes(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Options, Runtime};

    #[test]
    fn read_your_writes() {
        let runtime = Runtime::new(Options::in_memory(1)).unwrap();
        let worker = runtime.worker(0).unwrap();
        let cell = TCell::new(10_u64);

        let observed = worker
            .run(|txn| {
                let before = cell.read(txn)?;
                cell.write(txn, before + 5);
                cell.read(txn)
            })
            .unwrap();
        assert_eq!(observed, 15);
        assert_eq!(cell.read_nontrans(), 15);
    }

    #[test]
    fn conflicting_read_aborts_at_validation() {
        let runtime = Runtime::new(Options::in_memory(2)).unwrap();
        let cell = TCell::new(0_u64);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        let read = cell.read(&mut t1).unwrap();
        assert_eq!(read, 0);
        cell.write(&mut t1, read + 1);

        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        let read = cell.read(&mut t2).unwrap();
        cell.write(&mut t2, read + 1);
        assert!(t2.try_commit().unwrap());

        // t1's read of 0 no longer matches.
        assert!(!t1.try_commit().unwrap());
        assert_eq!(cell.read_nontrans(), 1);
    }

    #[test]
    fn blind_writes_do_not_conflict() {
        let runtime = Runtime::new(Options::in_memory(2)).unwrap();
        let cell = TCell::new(0_u64);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        cell.write(&mut t1, 7);
        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        cell.write(&mut t2, 8);

        assert!(t2.try_commit().unwrap());
        assert!(t1.try_commit().unwrap());
        assert_eq!(cell.read_nontrans(), 7);
    }

    #[test]
    fn generic_stm_mode_aborts_future_reads() {
        let runtime = Runtime::new(Options::in_memory(2)).unwrap();
        let w0 = runtime.worker(0).unwrap();
        let w1 = runtime.worker(1).unwrap();
        let cell = TCell::new_generic_stm(1_u64);

        // An old snapshot must not observe a version installed after it
        // started.
        let mut t1 = w0.begin().unwrap();
        w1.run(|txn| {
            cell.write(txn, 2);
            Ok(())
        })
        .unwrap();
        assert_eq!(cell.read(&mut t1), Err(Abort));
        t1.abort();

        // A fresh snapshot reads the committed value.
        let observed = w0.run(|txn| cell.read(txn)).unwrap();
        assert_eq!(observed, 2);
    }

    #[test]
    fn aborted_transactions_leave_no_trace() {
        let runtime = Runtime::new(Options::in_memory(1)).unwrap();
        let worker = runtime.worker(0).unwrap();
        let cell = TCell::new(String::from("initial"));

        let mut txn = worker.begin().unwrap();
        cell.write(&mut txn, String::from("speculative"));
        txn.abort();

        assert_eq!(cell.read_nontrans(), "initial");
        let observed = worker.run(|txn| cell.read(txn)).unwrap();
        assert_eq!(observed, "initial");
    }
}
