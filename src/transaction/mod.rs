//! Per-thread transaction contexts and the optimistic commit protocol.

mod item;

use std::fmt::{self, Debug, Display};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub use self::item::{ItemFlags, TransItem};
use crate::error::Error;
use crate::object::Transactable;
use crate::runtime::RuntimeShared;
use crate::version::{Tid, FLAG_MASK, INCREMENT};

/// The recoverable transaction failure.
///
/// An abort is the only error transactional code observes. It unwinds all
/// speculative state and returns control to the retry loop; callers above
/// the transactional closure never see it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Abort;

impl Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("transaction aborted")
    }
}

impl std::error::Error for Abort {}

/// The result type of transactional operations.
pub type TxResult<T> = Result<T, Abort>;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// A per-thread transaction context.
///
/// Created by [`Worker::begin`](crate::Worker::begin); at most one
/// transaction is active per worker at a time. Shared objects append items
/// through [`item`](Self::item) during execution; [`try_commit`](Self::try_commit)
/// runs the two-phase commit protocol. Dropping an active transaction
/// aborts it.
pub struct Transaction {
    shared: Arc<RuntimeShared>,
    worker: usize,
    start_tid: Tid,
    epoch: u64,
    items: Vec<TransItem>,
    state: TxnState,
    commit_tid: Option<Tid>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<RuntimeShared>, worker: usize, start_tid: Tid, epoch: u64) -> Self {
        Self {
            shared,
            worker,
            start_tid,
            epoch,
            items: Vec::new(),
            state: TxnState::Active,
            commit_tid: None,
        }
    }

    /// Returns the snapshot point this transaction started at.
    #[must_use]
    pub const fn start_tid(&self) -> Tid {
        self.start_tid
    }

    /// Returns the epoch this transaction entered at begin.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) const fn worker_index(&self) -> usize {
        self.worker
    }

    /// Returns the TID assigned at install, if the transaction committed.
    #[must_use]
    pub const fn commit_tid(&self) -> Option<Tid> {
        self.commit_tid
    }

    /// Finds or appends the item for `(owner, key)`.
    pub fn item(&mut self, owner: &Arc<dyn Transactable>, key: u64) -> &mut TransItem {
        let object_id = owner.object_id();
        if let Some(index) = self
            .items
            .iter()
            .position(|item| item.key() == key && item.object_id() == object_id)
        {
            return &mut self.items[index];
        }
        self.items.push(TransItem::new(owner.clone(), key));
        self.items.last_mut().expect("just pushed")
    }

    /// Aborts the transaction, undoing all speculative state.
    pub fn abort(mut self) {
        self.finish(false);
    }

    /// Runs the commit protocol. Returns `Ok(true)` on success and
    /// `Ok(false)` when the transaction aborted and may be retried; fatal
    /// errors (IO against the durability log) surface as `Err`.
    pub fn try_commit(&mut self) -> Result<bool, Error> {
        debug_assert_eq!(self.state, TxnState::Active);

        // Predicate pre-check, before any lock is taken.
        for index in 0..self.items.len() {
            if self.items[index].has_predicate() {
                let owner = self.items[index].owner();
                if !owner.check_predicate(&mut self.items[index], false) {
                    self.finish(false);
                    return Ok(false);
                }
            }
        }

        // Lock the write set in a globally-consistent total order so
        // concurrent committers cannot deadlock.
        let mut writes: Vec<usize> = (0..self.items.len())
            .filter(|&index| self.items[index].has_write())
            .collect();
        writes.sort_unstable_by_key(|&index| {
            let item = &self.items[index];
            (item.object_id(), item.key())
        });

        for &index in &writes {
            let owner = self.items[index].owner();
            if !owner.lock(&mut self.items[index]) {
                self.finish(false);
                return Ok(false);
            }
        }

        let commit_tid = self.generate_commit_tid(&writes);

        // Validate every tracked read against the current versions.
        for index in 0..self.items.len() {
            let owner = self.items[index].owner();
            let valid = if self.items[index].has_predicate() {
                owner.check_predicate(&mut self.items[index], true)
            } else if self.items[index].has_read() {
                owner.check(&self.items[index])
            } else {
                continue;
            };
            if !valid {
                self.finish(false);
                return Ok(false);
            }
        }

        // Point of no return: publish the writes.
        for &index in &writes {
            let owner = self.items[index].owner();
            owner.install(&mut self.items[index], commit_tid);
        }
        self.commit_tid = Some(commit_tid);

        let log_result = self.emit_log_record(&writes, commit_tid);

        self.finish(true);
        log_result?;
        Ok(true)
    }

    /// Computes the commit TID: greater than every read version observed,
    /// every locked write version, and every TID previously handed out, and
    /// stamped with the current global epoch.
    fn generate_commit_tid(&self, writes: &[usize]) -> Tid {
        let counter = self.shared.tid_counter();
        let mut tid = counter.fetch_add(INCREMENT, Ordering::AcqRel) + INCREMENT;
        for item in &self.items {
            if let Some(read) = item.read_version() {
                tid = tid.max(read & !FLAG_MASK);
            }
        }
        for &index in writes {
            if let Some(locked) = self.items[index].locked_version() {
                tid = tid.max(locked & !FLAG_MASK);
            }
        }
        tid += INCREMENT;

        let epoch = self.shared.current_epoch();
        let mut tid = Tid(tid);
        if tid.epoch() < epoch {
            tid = Tid::from_parts(epoch, 1);
        }
        // Keep the counter ahead of the TID we are about to publish so later
        // transactions stay monotonic.
        counter.fetch_max(tid.counter_portion(), Ordering::AcqRel);
        tid
    }

    /// Appends `{commit_tid, (key, value)*}` to the worker's current log
    /// buffer. A transaction whose write set has no log representation emits
    /// nothing.
    fn emit_log_record(&mut self, writes: &[usize], commit_tid: Tid) -> Result<(), Error> {
        let Some(log) = self.shared.log() else {
            return Ok(());
        };
        let records: Vec<_> = writes
            .iter()
            .filter_map(|&index| {
                let item = &self.items[index];
                item.owner().log_write(item)
            })
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        log.append_commit(self.worker, commit_tid, &records)
    }

    /// Unwinds or finalizes the item set and leaves the epoch.
    fn finish(&mut self, committed: bool) {
        if self.state != TxnState::Active {
            return;
        }
        if committed {
            for index in 0..self.items.len() {
                if self.items[index].has_write() || self.items[index].flags().has_user_bits() {
                    let owner = self.items[index].owner();
                    owner.cleanup(&mut self.items[index], true);
                }
            }
        } else {
            // Reverse insertion order: later speculative effects may depend
            // on earlier ones.
            for index in (0..self.items.len()).rev() {
                if self.items[index].has_write() || self.items[index].flags().has_user_bits() {
                    let owner = self.items[index].owner();
                    owner.cleanup(&mut self.items[index], false);
                }
            }
        }
        for index in 0..self.items.len() {
            if self.items[index].has_lock() {
                let owner = self.items[index].owner();
                owner.unlock(&mut self.items[index]);
                self.items[index].clear_flags(ItemFlags::LOCK_HELD);
            }
        }
        self.items.clear();
        self.state = if committed {
            TxnState::Committed
        } else {
            TxnState::Aborted
        };
        self.shared.end_transaction(self.worker);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            self.finish(false);
        }
    }
}

impl Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("worker", &self.worker)
            .field("start_tid", &self.start_tid)
            .field("epoch", &self.epoch)
            .field("items", &self.items.len())
            .field("state", &self.state)
            .finish()
    }
}
