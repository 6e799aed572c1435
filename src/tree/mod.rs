//! A transactional red-black tree.
//!
//! The tree is the canonical complex [`Transactable`]: present reads track
//! node value versions, absent reads track the structural versions of the
//! gap's boundary nodes so a concurrent insert into the gap invalidates
//! them (phantom prevention), and inserts splice insert-marked nodes that
//! stay invisible to other transactions until commit.
//!
//! Traversals are serialized by a coarse tree lock; concurrency between
//! transactions comes entirely from commit-time validation.

mod core;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arc_bytes::ArcBytes;
use parking_lot::Mutex;

use self::core::{NodeHandle, TreeCore};
use crate::epoch::EpochState;
use crate::object::{LogWrite, Loggable, ObjectId, Transactable};
use crate::reclaim::Reclaimer;
use crate::runtime::Runtime;
use crate::transaction::{Abort, ItemFlags, TransItem, Transaction, TxResult};
use crate::version::{TVersion, Tid};

/// Item key for the whole-tree structural version, read by absent lookups
/// against an empty tree.
const TREE_KEY: u64 = 1;
/// Item key for the tree's size offset.
const SIZE_KEY: u64 = 2;
/// Node item keys carry the node id shifted past this tag bit; structural
/// (nodeversion) items set it, value items leave it clear.
const KIND_STRUCT: u64 = 1;

const INSERT_TAG: ItemFlags = ItemFlags::USER0;
const DELETE_TAG: ItemFlags = ItemFlags::USER1;
const LOCK_SPINS: usize = 100;

const fn value_key(id: u64) -> u64 {
    id << 3
}

const fn struct_key(id: u64) -> u64 {
    id << 3 | KIND_STRUCT
}

/// A transactional ordered map backed by a red-black tree.
///
/// All operations run inside a [`Transaction`] and observe the usual STM
/// guarantees: reads validate at commit, writes install atomically, and
/// `Err(Abort)` unwinds to the retry loop.
pub struct TxRbTree<K, V> {
    inner: Arc<TreeInner<K, V>>,
}

impl<K, V> Clone for TxRbTree<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct TreeInner<K, V> {
    id: ObjectId,
    /// The coarse tree lock; every traversal and splice holds it.
    core: Mutex<TreeCore<K, V>>,
    /// Bumped by structural change to an empty tree.
    treeversion: TVersion,
    /// Guards the committed size.
    sizeversion: TVersion,
    size: AtomicI64,
    reclaim: Arc<Reclaimer>,
    epoch: Arc<EpochState>,
}

impl<K, V> TxRbTree<K, V>
where
    K: Ord + Clone + Loggable + Send + Sync + 'static,
    V: Clone + Loggable + Send + Sync + 'static,
{
    /// Returns an empty tree managed by `runtime`.
    #[must_use]
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            inner: Arc::new(TreeInner {
                id: ObjectId::next(),
                core: Mutex::new(TreeCore::new()),
                treeversion: TVersion::default(),
                sizeversion: TVersion::default(),
                size: AtomicI64::new(0),
                reclaim: runtime.reclaim_handle(),
                epoch: runtime.epoch_handle(),
            }),
        }
    }

    fn owner(&self) -> Arc<dyn Transactable> {
        self.inner.clone()
    }

    /// Returns the number of keys visible to `txn`, counting its own
    /// pending inserts and erases.
    pub fn len(&self, txn: &mut Transaction) -> TxResult<usize> {
        // Consistent snapshot of (sizeversion, size).
        let (sizeversion, base) = loop {
            let before = self.inner.sizeversion.load();
            let base = self.inner.size.load(Ordering::Acquire);
            if self.inner.sizeversion.load() == before {
                break (before, base);
            }
            std::hint::spin_loop();
        };
        let item = txn.item(&self.owner(), SIZE_KEY);
        item.add_read(sizeversion);
        let offset = item.write_value::<i64>().copied().unwrap_or(0);
        Ok(usize::try_from(base + offset).unwrap_or(0))
    }

    /// Returns true when [`len`](Self::len) is zero.
    pub fn is_empty(&self, txn: &mut Transaction) -> TxResult<bool> {
        Ok(self.len(txn)? == 0)
    }

    /// Returns 1 if `key` is visible to `txn`, 0 otherwise.
    pub fn count(&self, txn: &mut Transaction, key: &K) -> TxResult<usize> {
        let core = self.inner.core.lock();
        let descent = self.find_or_track(txn, &core, key, false)?;
        let Some(slot) = descent.found else {
            return Ok(0);
        };
        let handle = core.node(slot).handle.clone();
        let inserted = TVersion::is_inserted(handle.version.load());
        drop(core);
        let item = txn.item(&self.owner(), value_key(handle.id));
        if inserted && item.flags().contains(DELETE_TAG) {
            // Read-my-insert-then-delete.
            return Ok(0);
        }
        Ok(1)
    }

    /// Returns the value at `key`, or `None` when absent. Reads this
    /// transaction's own pending write when there is one.
    pub fn get(&self, txn: &mut Transaction, key: &K) -> TxResult<Option<V>> {
        let core = self.inner.core.lock();
        let descent = self.find_or_track(txn, &core, key, false)?;
        let Some(slot) = descent.found else {
            return Ok(None);
        };
        let handle = core.node(slot).handle.clone();
        let inserted = TVersion::is_inserted(handle.version.load());
        let committed_value = core.node(slot).value.clone();
        drop(core);
        let item = txn.item(&self.owner(), value_key(handle.id));
        if item.flags().contains(DELETE_TAG) {
            return Ok(if inserted {
                None
            } else {
                Some(committed_value)
            });
        }
        if let Some(pending) = item.write_value::<V>() {
            return Ok(Some(pending.clone()));
        }
        Ok(Some(committed_value))
    }

    /// Inserts or updates `key`.
    pub fn insert(&self, txn: &mut Transaction, key: K, value: V) -> TxResult<()> {
        let mut core = self.inner.core.lock();
        let descent = self.find_or_track(txn, &core, &key, true)?;

        if let Some(slot) = descent.found {
            let handle = core.node(slot).handle.clone();
            let inserted = TVersion::is_inserted(handle.version.load());
            let item = txn.item(&self.owner(), value_key(handle.id));
            let flags = item.flags();

            if flags.contains(DELETE_TAG) {
                // Insert-my-delete; recover delete-my-insert when the node
                // is still our uncommitted phantom.
                item.clear_flags(DELETE_TAG);
                if inserted {
                    item.add_flags(INSERT_TAG);
                    item.add_write(value.clone());
                    core.node_mut(slot).value = value;
                } else {
                    item.add_write(value);
                }
                drop(core);
                self.change_size_offset(txn, 1);
                return Ok(());
            }

            if flags.contains(INSERT_TAG) {
                // Updating our own phantom: only this transaction can see
                // the node, so write it in place.
                item.add_write(value.clone());
                core.node_mut(slot).value = value;
                return Ok(());
            }

            // Plain update of a committed node: a read-write item.
            item.add_read(handle.version.load());
            item.add_write(value);
            return Ok(());
        }

        // Absent insert: splice an insert-marked node and publish the
        // structural change on the parent so concurrent absent readers of
        // this gap fail validation.
        let handle = core.insert_at(descent.parent, descent.go_right, key, value.clone());
        if let Some(parent) = descent.parent {
            let parent_handle = core.node(parent).handle.clone();
            let (old, new) = parent_handle.nodeversion.increment();
            txn.item(&self.owner(), struct_key(parent_handle.id))
                .update_read(old, new);
        } else {
            txn.item(&self.owner(), TREE_KEY).add_write(());
        }
        txn.item(&self.owner(), value_key(handle.id))
            .set_anchor(handle)
            .add_write(value)
            .add_flags(INSERT_TAG);
        drop(core);
        self.change_size_offset(txn, 1);
        Ok(())
    }

    /// Erases `key`, returning how many entries were removed (0 or 1).
    pub fn erase(&self, txn: &mut Transaction, key: &K) -> TxResult<usize> {
        let core = self.inner.core.lock();
        let descent = self.find_or_track(txn, &core, key, false)?;
        let Some(slot) = descent.found else {
            // Absent erase: the boundary reads added above protect the gap.
            return Ok(0);
        };
        let handle = core.node(slot).handle.clone();
        let inserted = TVersion::is_inserted(handle.version.load());
        drop(core);
        let item = txn.item(&self.owner(), value_key(handle.id));
        let flags = item.flags();

        if inserted {
            if flags.contains(INSERT_TAG) {
                // Erase-my-insert: the install path sees only the delete
                // tag and removes the speculative node.
                item.add_write(())
                    .clear_flags(INSERT_TAG)
                    .add_flags(DELETE_TAG);
                self.change_size_offset(txn, -1);
                return Ok(1);
            }
            // Insert-then-delete-then-delete.
            return Ok(0);
        }
        if flags.contains(DELETE_TAG) {
            // Delete-my-delete.
            return Ok(0);
        }
        item.add_write(()).add_flags(DELETE_TAG);
        self.change_size_offset(txn, -1);
        Ok(1)
    }

    /// Visits entries in order (or reverse order), stopping when `callback`
    /// returns false. Every visited value and the structural neighborhood
    /// of the walk are tracked, so neither may change without invalidating
    /// the transaction. A scan interrupted by an abort is not restartable.
    pub fn scan<F>(&self, txn: &mut Transaction, forwards: bool, mut callback: F) -> TxResult<()>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut cursor = {
            let core = self.inner.core.lock();
            if core.is_empty() {
                let treeversion = self.inner.treeversion.load();
                drop(core);
                txn.item(&self.owner(), TREE_KEY).add_read(treeversion);
                return Ok(());
            }
            let edge = if forwards { core.first() } else { core.last() };
            edge.map(|slot| core.node(slot).handle.clone())
        };

        while let Some(handle) = cursor {
            let (nodeversion, version, inserted, next, key, value) = {
                let core = self.inner.core.lock();
                let Some(node) = core.node_checked(handle.slot, handle.id) else {
                    // The node under the cursor was spliced out between
                    // steps; our structural reads can no longer validate.
                    return Err(Abort);
                };
                let next_slot = if forwards {
                    core.next(handle.slot)
                } else {
                    core.prev(handle.slot)
                };
                (
                    handle.nodeversion.load(),
                    handle.version.load(),
                    TVersion::is_inserted(handle.version.load()),
                    next_slot.map(|slot| core.node(slot).handle.clone()),
                    handle.key.clone(),
                    node.value.clone(),
                )
            };

            txn.item(&self.owner(), struct_key(handle.id))
                .set_anchor(handle.clone())
                .add_read(nodeversion);
            if let Some(next) = &next {
                let next_nodeversion = next.nodeversion.load();
                txn.item(&self.owner(), struct_key(next.id))
                    .set_anchor(next.clone())
                    .add_read(next_nodeversion);
            }

            let item = txn.item(&self.owner(), value_key(handle.id));
            item.set_anchor(handle.clone());
            let flags = item.flags();
            let skip = if inserted {
                if flags.contains(INSERT_TAG) || flags.contains(DELETE_TAG) {
                    flags.contains(DELETE_TAG)
                } else {
                    // A phantom of another in-flight transaction.
                    return Err(Abort);
                }
            } else {
                false
            };
            if !skip {
                item.add_read(version);
                let visible = item.write_value::<V>().cloned().unwrap_or(value);
                if !callback(&key, &visible) {
                    return Ok(());
                }
            }
            cursor = next;
        }
        Ok(())
    }

    /// Mirrors `find_or_abort`: resolves `key` under the tree lock and
    /// attaches the reads that make the outcome validate at commit.
    fn find_or_track(
        &self,
        txn: &mut Transaction,
        core: &TreeCore<K, V>,
        key: &K,
        inserting: bool,
    ) -> TxResult<self::core::Descent> {
        let descent = core.descend(key);

        if let Some(slot) = descent.found {
            let handle = core.node(slot).handle.clone();
            let version = handle.version.load();
            let item = txn.item(&self.owner(), value_key(handle.id));
            item.set_anchor(handle.clone());
            if TVersion::is_inserted(version) {
                let ours = item.flags().contains(INSERT_TAG) || item.flags().contains(DELETE_TAG);
                if !ours {
                    // Inserted by another in-flight transaction; invisible.
                    return Err(Abort);
                }
            } else if !inserting {
                item.add_read(version);
            }
            return Ok(descent);
        }

        if inserting {
            // Insertions under a phantom parent are disallowed.
            if let Some(parent) = descent.parent {
                let handle = core.node(parent).handle.clone();
                if TVersion::is_inserted(handle.version.load()) {
                    let item = txn.item(&self.owner(), value_key(handle.id));
                    let ours =
                        item.flags().contains(INSERT_TAG) || item.flags().contains(DELETE_TAG);
                    if !ours {
                        return Err(Abort);
                    }
                }
            }
            return Ok(descent);
        }

        // Absent read: witness the gap. An empty tree is witnessed through
        // the tree version instead.
        if descent.parent.is_none() {
            let treeversion = self.inner.treeversion.load();
            txn.item(&self.owner(), TREE_KEY).add_read(treeversion);
        }
        for boundary in [descent.predecessor, descent.successor] {
            let Some(slot) = boundary else { continue };
            let handle = core.node(slot).handle.clone();
            let nodeversion = handle.nodeversion.load();
            txn.item(&self.owner(), struct_key(handle.id))
                .set_anchor(handle)
                .add_read(nodeversion);
        }
        Ok(descent)
    }

    fn change_size_offset(&self, txn: &mut Transaction, delta: i64) {
        let item = txn.item(&self.owner(), SIZE_KEY);
        let previous = item.write_value::<i64>().copied().unwrap_or(0);
        item.add_write(previous + delta);
    }
}

impl<K, V> TreeInner<K, V>
where
    K: Ord + Clone + Loggable + Send + Sync + 'static,
    V: Clone + Loggable + Send + Sync + 'static,
{
    fn version_for(&self, item: &TransItem) -> Option<VersionRef<'_, K>> {
        match item.key() {
            SIZE_KEY => Some(VersionRef::Tree(&self.sizeversion)),
            TREE_KEY => Some(VersionRef::Tree(&self.treeversion)),
            key if key & KIND_STRUCT != 0 => {
                item.anchor::<NodeHandle<K>>().map(VersionRef::NodeStruct)
            }
            _ => item.anchor::<NodeHandle<K>>().map(VersionRef::NodeValue),
        }
    }
}

enum VersionRef<'a, K> {
    Tree(&'a TVersion),
    NodeValue(Arc<NodeHandle<K>>),
    NodeStruct(Arc<NodeHandle<K>>),
}

impl<K> VersionRef<'_, K> {
    fn version(&self) -> &TVersion {
        match self {
            Self::Tree(version) => version,
            Self::NodeValue(handle) => &handle.version,
            Self::NodeStruct(handle) => &handle.nodeversion,
        }
    }
}

impl<K, V> Transactable for TreeInner<K, V>
where
    K: Ord + Clone + Loggable + Send + Sync + 'static,
    V: Clone + Loggable + Send + Sync + 'static,
{
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn lock(&self, item: &mut TransItem) -> bool {
        debug_assert_eq!(
            item.key() & KIND_STRUCT != 0 && item.key() != TREE_KEY,
            false,
            "structural items are never locked"
        );
        let Some(target) = self.version_for(item) else {
            return false;
        };
        if !target.version().try_lock_spin(LOCK_SPINS) {
            return false;
        }
        item.add_flags(ItemFlags::LOCK_HELD);
        item.note_locked_version(target.version().load());
        if let Some(read) = item.read_version() {
            // The reader snapshot is already stale; no point validating.
            if !target.version().check(read, true) {
                return false;
            }
        }
        true
    }

    fn unlock(&self, item: &mut TransItem) {
        if let Some(target) = self.version_for(item) {
            target.version().unlock();
        }
    }

    fn check(&self, item: &TransItem) -> bool {
        let Some(read) = item.read_version() else {
            return true;
        };
        let Some(target) = self.version_for(item) else {
            return false;
        };
        match target {
            // Structural witnesses compare exactly: any movement of the
            // neighborhood invalidates the read.
            VersionRef::NodeStruct(handle) => handle.nodeversion.load() == read,
            other => other.version().check(read, item.has_lock()),
        }
    }

    fn install(&self, item: &mut TransItem, _commit_tid: Tid) {
        match item.key() {
            TREE_KEY => {
                debug_assert!(self.treeversion.is_locked());
                self.treeversion.inc_invalid_version();
            }
            SIZE_KEY => {
                debug_assert!(self.sizeversion.is_locked());
                let offset = item.write_value::<i64>().copied().unwrap_or(0);
                let size = self.size.fetch_add(offset, Ordering::AcqRel) + offset;
                assert!(size >= 0, "tree size went negative");
                self.sizeversion.inc_invalid_version();
            }
            _ => {
                let Some(handle) = item.anchor::<NodeHandle<K>>() else {
                    return;
                };
                let flags = item.flags();
                if flags.contains(DELETE_TAG) {
                    let mut core = self.core.lock();
                    if core.node_checked(handle.slot, handle.id).is_some() {
                        let node = core.remove(handle.slot);
                        drop(core);
                        handle.version.inc_invalid_version();
                        handle.nodeversion.increment();
                        self.reclaim
                            .defer_free(self.epoch.current(), Box::new(node));
                    }
                } else if flags.contains(INSERT_TAG) {
                    // The value was written in place while the node was our
                    // phantom; publishing is just dropping the insert mark.
                    handle.version.erase_inserted();
                } else if let Some(value) = item.take_write::<V>() {
                    let mut core = self.core.lock();
                    if core.node_checked(handle.slot, handle.id).is_some() {
                        core.node_mut(handle.slot).value = value;
                    }
                    drop(core);
                    handle.version.inc_invalid_version();
                }
            }
        }
    }

    fn cleanup(&self, item: &mut TransItem, committed: bool) {
        if committed {
            return;
        }
        let flags = item.flags();
        if !(flags.contains(INSERT_TAG) || flags.contains(DELETE_TAG)) {
            return;
        }
        if item.key() == TREE_KEY || item.key() == SIZE_KEY || item.key() & KIND_STRUCT != 0 {
            return;
        }
        let Some(handle) = item.anchor::<NodeHandle<K>>() else {
            return;
        };
        // Only a node we speculatively inserted needs to be unwound.
        if !TVersion::is_inserted(handle.version.load()) {
            return;
        }
        let mut core = self.core.lock();
        if core.node_checked(handle.slot, handle.id).is_some() {
            let node = core.remove(handle.slot);
            drop(core);
            handle.version.erase_inserted();
            handle.nodeversion.increment();
            self.reclaim
                .defer_free(self.epoch.current(), Box::new(node));
        }
    }

    fn log_write(&self, item: &TransItem) -> Option<LogWrite> {
        let key = item.key();
        if key == TREE_KEY || key == SIZE_KEY || key & KIND_STRUCT != 0 {
            return None;
        }
        let handle = item.anchor::<NodeHandle<K>>()?;
        let value = if item.flags().contains(DELETE_TAG) {
            ArcBytes::from(Vec::new())
        } else {
            item.write_value::<V>()?.to_log_bytes()
        };
        Some(LogWrite {
            key: handle.key.to_log_bytes(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Options;

    fn runtime(nworkers: usize) -> Runtime {
        Runtime::new(Options::in_memory(nworkers)).unwrap()
    }

    /// Seeds the tree with (1,1), (2,2), (3,3).
    fn reset_tree(runtime: &Runtime, tree: &TxRbTree<u64, u64>) {
        let worker = runtime.worker(0).unwrap();
        let mut init = worker.begin().unwrap();
        for key in 1..=3 {
            tree.insert(&mut init, key, key).unwrap();
        }
        assert!(init.try_commit().unwrap());
    }

    fn snapshot(runtime: &Runtime, tree: &TxRbTree<u64, u64>) -> Vec<(u64, u64)> {
        let worker = runtime.worker(0).unwrap();
        let mut entries = Vec::new();
        let mut txn = worker.begin().unwrap();
        tree.scan(&mut txn, true, |key, value| {
            entries.push((*key, *value));
            true
        })
        .unwrap();
        assert!(txn.try_commit().unwrap());
        entries
    }

    #[test]
    fn single_threaded_operations() {
        let runtime = runtime(1);
        let tree: TxRbTree<u64, u64> = TxRbTree::new(&runtime);
        let worker = runtime.worker(0).unwrap();
        let mut txn = worker.begin().unwrap();

        assert_eq!(tree.len(&mut txn).unwrap(), 0);
        // read_my_inserts
        for i in 0..100 {
            tree.insert(&mut txn, i, i).unwrap();
            assert_eq!(tree.get(&mut txn, &i).unwrap(), Some(i));
            tree.insert(&mut txn, i, 100 - i).unwrap();
            assert_eq!(tree.get(&mut txn, &i).unwrap(), Some(100 - i));
        }
        assert_eq!(tree.len(&mut txn).unwrap(), 100);

        // iteration sees our own writes in key order
        let mut expected = 100;
        tree.scan(&mut txn, true, |key, value| {
            assert_eq!(*value, 100 - key);
            expected -= 1;
            true
        })
        .unwrap();
        assert_eq!(expected, 0);

        // count_my_inserts
        for i in 0..100 {
            assert_eq!(tree.count(&mut txn, &i).unwrap(), 1);
        }
        assert_eq!(tree.len(&mut txn).unwrap(), 100);

        // delete_my_inserts and read_my_deletes
        for i in 0..100 {
            assert_eq!(tree.erase(&mut txn, &i).unwrap(), 1);
            assert_eq!(tree.count(&mut txn, &i).unwrap(), 0);
        }
        assert_eq!(tree.len(&mut txn).unwrap(), 0);

        // delete_my_deletes
        for i in 0..100 {
            assert_eq!(tree.erase(&mut txn, &i).unwrap(), 0);
            assert_eq!(tree.count(&mut txn, &i).unwrap(), 0);
        }
        assert_eq!(tree.len(&mut txn).unwrap(), 0);

        // insert_my_deletes
        for i in 0..100 {
            tree.insert(&mut txn, i, 1).unwrap();
            assert_eq!(tree.count(&mut txn, &i).unwrap(), 1);
        }
        assert_eq!(tree.len(&mut txn).unwrap(), 100);
        assert!(txn.try_commit().unwrap());

        let entries = snapshot(&runtime, &tree);
        assert_eq!(entries.len(), 100);
        assert!(entries.iter().all(|(_, value)| *value == 1));
    }

    #[test]
    fn update_update_conflict() {
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        tree.insert(&mut t1, 55, 56).unwrap();
        tree.insert(&mut t1, 57, 58).unwrap();

        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        assert_eq!(tree.get(&mut t2, &58).unwrap(), None);
        assert!(t2.try_commit().unwrap());
        assert!(t1.try_commit().unwrap());

        assert_eq!(
            snapshot(&runtime, &tree),
            vec![(1, 1), (2, 2), (3, 3), (55, 56), (57, 58)]
        );
    }

    #[test]
    fn erase_count_conflict_t1_first() {
        // t1:count - t1:erase - t2:count - t1:commit - t2:abort
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t1, &1).unwrap(), 1);
        assert_eq!(tree.erase(&mut t1, &1).unwrap(), 1);

        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t2, &1).unwrap(), 1);

        assert!(t1.try_commit().unwrap());
        assert!(!t2.try_commit().unwrap());

        assert_eq!(snapshot(&runtime, &tree), vec![(2, 2), (3, 3)]);
    }

    #[test]
    fn erase_count_conflict_t2_first() {
        // t1:count - t1:erase - t2:count - t2:commit - t1:commit
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t1, &1).unwrap(), 1);
        assert_eq!(tree.erase(&mut t1, &1).unwrap(), 1);

        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t2, &1).unwrap(), 1);
        assert!(t2.try_commit().unwrap());
        assert!(t1.try_commit().unwrap());

        assert_eq!(snapshot(&runtime, &tree), vec![(2, 2), (3, 3)]);
    }

    #[test]
    fn erase_erase_conflict_t2_commits_first() {
        // t1:count - t1:erase - t1:count - t2:erase - t2:commit - t1:abort
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t1, &1).unwrap(), 1);
        assert_eq!(tree.erase(&mut t1, &1).unwrap(), 1);
        assert_eq!(tree.count(&mut t1, &1).unwrap(), 1);

        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        assert_eq!(tree.erase(&mut t2, &1).unwrap(), 1);
        assert!(t2.try_commit().unwrap());
        assert!(!t1.try_commit().unwrap());

        assert_eq!(snapshot(&runtime, &tree), vec![(2, 2), (3, 3)]);
    }

    #[test]
    fn erase_erase_conflict_t1_commits_first() {
        // t1:count - t1:erase - t1:count - t2:erase - t1:commit - t2:abort
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t1, &1).unwrap(), 1);
        assert_eq!(tree.erase(&mut t1, &1).unwrap(), 1);
        assert_eq!(tree.count(&mut t1, &1).unwrap(), 1);

        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        assert_eq!(tree.erase(&mut t2, &1).unwrap(), 1);
        assert!(t1.try_commit().unwrap());
        assert!(!t2.try_commit().unwrap());

        assert_eq!(snapshot(&runtime, &tree), vec![(2, 2), (3, 3)]);
    }

    #[test]
    fn insert_delete_insert_within_txn() {
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        tree.insert(&mut t1, 5, 5).unwrap();
        tree.insert(&mut t1, 4, 4).unwrap();
        assert_eq!(tree.count(&mut t1, &4).unwrap(), 1);
        // insert-then-delete
        assert_eq!(tree.erase(&mut t1, &4).unwrap(), 1);
        assert_eq!(tree.count(&mut t1, &4).unwrap(), 0);
        assert_eq!(tree.erase(&mut t1, &4).unwrap(), 0);
        // insert-delete-insert
        tree.insert(&mut t1, 4, 44).unwrap();
        assert_eq!(tree.get(&mut t1, &4).unwrap(), Some(44));
        assert_eq!(tree.count(&mut t1, &4).unwrap(), 1);
        assert!(t1.try_commit().unwrap());

        assert_eq!(
            snapshot(&runtime, &tree),
            vec![(1, 1), (2, 2), (3, 3), (4, 44), (5, 5)]
        );
    }

    #[test]
    fn absent_reads_survive_own_inserts() {
        let runtime = runtime(1);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        // Absent read of 4 tracks the boundary around the gap.
        assert_eq!(tree.count(&mut t1, &4).unwrap(), 0);
        // Our own insert bumps that boundary, but our tracked read is
        // updated in place, so we stay valid.
        tree.insert(&mut t1, 5, 5).unwrap();
        assert_eq!(tree.count(&mut t1, &4).unwrap(), 0);
        tree.insert(&mut t1, 4, 4).unwrap();
        assert_eq!(tree.count(&mut t1, &4).unwrap(), 1);
        assert!(t1.try_commit().unwrap());

        assert_eq!(
            snapshot(&runtime, &tree),
            vec![(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]
        );
    }

    #[test]
    fn update_loses_to_delete_then_insert() {
        let runtime = runtime(3);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        // t1 updates key 3.
        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        tree.insert(&mut t1, 3, 13).unwrap();

        // t2 deletes key 3 and commits.
        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        assert_eq!(tree.erase(&mut t2, &3).unwrap(), 1);
        assert!(t2.try_commit().unwrap());

        // t3 witnesses the absence and reinserts.
        let mut t3 = runtime.worker(2).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t3, &3).unwrap(), 0);
        tree.insert(&mut t3, 3, 33).unwrap();
        assert!(t3.try_commit().unwrap());

        // t1's read of the old node can no longer validate.
        assert!(!t1.try_commit().unwrap());

        assert_eq!(snapshot(&runtime, &tree), vec![(1, 1), (2, 2), (3, 33)]);
    }

    #[test]
    fn absent_read_invalidated_by_concurrent_insert() {
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t1, &4).unwrap(), 0);

        runtime
            .worker(1)
            .unwrap()
            .run(|txn| tree.insert(txn, 5, 5))
            .unwrap();

        // The insert into the gap bumped the boundary nodeversion.
        assert!(!t1.try_commit().unwrap());

        let mut after = runtime.worker(0).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut after, &4).unwrap(), 0);
        assert_eq!(tree.get(&mut after, &5).unwrap(), Some(5));
        assert!(after.try_commit().unwrap());
    }

    #[test]
    fn phantom_insert_race() {
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        // t1 witnesses the gap at 4 and inserts 5, leaving a phantom in
        // the gap.
        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t1, &4).unwrap(), 0);
        tree.insert(&mut t1, 5, 5).unwrap();

        // t2 wants the same gap: its insert lands under t1's phantom and
        // must abort.
        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t2, &4).unwrap(), 0);
        assert_eq!(tree.insert(&mut t2, 4, 4), Err(Abort));
        t2.abort();

        assert!(t1.try_commit().unwrap());

        // Exactly one of the two insertions landed; the retry brings in
        // the other.
        assert_eq!(
            snapshot(&runtime, &tree),
            vec![(1, 1), (2, 2), (3, 3), (5, 5)]
        );
        runtime
            .worker(1)
            .unwrap()
            .run(|txn| tree.insert(txn, 4, 4))
            .unwrap();
        assert_eq!(
            snapshot(&runtime, &tree),
            vec![(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)]
        );
    }

    #[test]
    fn reads_of_phantom_nodes_abort() {
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        tree.insert(&mut t1, 4, 4).unwrap();

        let mut t2 = runtime.worker(1).unwrap().begin().unwrap();
        assert_eq!(tree.count(&mut t2, &4), Err(Abort));
        t2.abort();
        assert!(t1.try_commit().unwrap());
    }

    #[test]
    fn abort_unwinds_speculative_inserts() {
        let runtime = runtime(1);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut t1 = runtime.worker(0).unwrap().begin().unwrap();
        tree.insert(&mut t1, 10, 10).unwrap();
        tree.insert(&mut t1, 11, 11).unwrap();
        assert_eq!(tree.erase(&mut t1, &2).unwrap(), 1);
        assert_eq!(tree.len(&mut t1).unwrap(), 4);
        t1.abort();

        // All speculative state is gone; committed state is untouched.
        assert_eq!(snapshot(&runtime, &tree), vec![(1, 1), (2, 2), (3, 3)]);
        let mut after = runtime.worker(0).unwrap().begin().unwrap();
        assert_eq!(tree.len(&mut after).unwrap(), 3);
        assert!(after.try_commit().unwrap());
    }

    #[test]
    fn erase_everything() {
        let runtime = runtime(1);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let worker = runtime.worker(0).unwrap();
        worker
            .run(|txn| {
                tree.erase(txn, &1)?;
                tree.erase(txn, &2)?;
                tree.erase(txn, &3)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(snapshot(&runtime, &tree), vec![]);
        let mut after = worker.begin().unwrap();
        assert_eq!(tree.len(&mut after).unwrap(), 0);
        assert!(tree.is_empty(&mut after).unwrap());
        assert!(after.try_commit().unwrap());
    }

    #[test]
    fn reverse_scan_and_early_exit() {
        let runtime = runtime(1);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let mut txn = runtime.worker(0).unwrap().begin().unwrap();
        let mut seen = Vec::new();
        tree.scan(&mut txn, false, |key, _| {
            seen.push(*key);
            seen.len() < 2
        })
        .unwrap();
        assert_eq!(seen, vec![3, 2]);
        assert!(txn.try_commit().unwrap());
    }

    #[test]
    fn size_tracks_concurrent_commits() {
        let runtime = runtime(2);
        let tree = TxRbTree::new(&runtime);
        reset_tree(&runtime, &tree);

        let w0 = runtime.worker(0).unwrap();
        let w1 = runtime.worker(1).unwrap();
        w0.run(|txn| tree.insert(txn, 100, 100)).unwrap();
        w1.run(|txn| {
            tree.erase(txn, &1)?;
            Ok(())
        })
        .unwrap();

        let mut txn = w0.begin().unwrap();
        assert_eq!(tree.len(&mut txn).unwrap(), 3);
        assert!(txn.try_commit().unwrap());
    }
}
