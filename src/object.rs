//! The contract every transactable shared object implements.

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};

use arc_bytes::ArcBytes;

use crate::transaction::TransItem;
use crate::version::Tid;

/// A process-unique identifier assigned to every shared object.
///
/// Identifiers establish the globally-consistent total order the commit
/// protocol locks write items in, which is what prevents lock-order
/// deadlock between concurrent committers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocates the next unused identifier.
    #[must_use]
    pub fn next() -> Self {
        static IDS: AtomicU64 = AtomicU64::new(1);
        Self(IDS.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A committed write surfaced to the durability log: the owning object's
/// byte encodings of the written key and value.
#[derive(Debug, Clone)]
pub struct LogWrite {
    /// The encoded key.
    pub key: ArcBytes<'static>,
    /// The encoded value. Empty for a deletion.
    pub value: ArcBytes<'static>,
}

/// A shared object that transactions can read and write.
///
/// Objects append [`TransItem`]s to the running transaction during
/// execution; the commit protocol calls back through this trait to lock,
/// validate, and publish those items. Every method is invoked with an item
/// this object created, so implementations are free to interpret the item
/// key however they allocated it.
pub trait Transactable: Send + Sync {
    /// Returns this object's unique identifier.
    fn object_id(&self) -> ObjectId;

    /// Acquires the lock guarding `item`'s target, marking the item as
    /// lock-holding on success. Implementations spin a bounded number of
    /// times; returning false makes the transaction abort and retry. An
    /// implementation may also refuse the lock when the item carries a read
    /// whose snapshot is already stale.
    fn lock(&self, item: &mut TransItem) -> bool;

    /// Releases the lock acquired by [`lock`](Self::lock). Called on every
    /// exit path, including aborts that interrupted the lock phase.
    fn unlock(&self, item: &mut TransItem);

    /// Validates `item`'s read: true iff the current version matches the
    /// recorded read version, ignoring the lock bit, and the target is not
    /// locked by another transaction.
    fn check(&self, item: &TransItem) -> bool;

    /// Publishes `item`'s write. The engine guarantees the lock is held and
    /// the read (if any) validated. Implementations update the payload and
    /// either bump the version or set it to `commit_tid`.
    fn install(&self, item: &mut TransItem, commit_tid: Tid);

    /// Finalizes `item` after the transaction ends. With `committed` false
    /// this undoes speculative side effects such as phantom inserts; with
    /// `committed` true it releases any scratch the item was carrying.
    fn cleanup(&self, item: &mut TransItem, committed: bool) {
        let _ = (item, committed);
    }

    /// Re-verifies a predicate recorded on `item` under the object's
    /// current state rather than under exact version equality. Called once
    /// before the lock phase with `committing` false and again during
    /// validation with `committing` true.
    fn check_predicate(&self, item: &mut TransItem, committing: bool) -> bool {
        let _ = (item, committing);
        true
    }

    /// Returns the log encoding of `item`'s write, or `None` when the item
    /// is internal bookkeeping that has no representation in the durability
    /// log.
    fn log_write(&self, item: &TransItem) -> Option<LogWrite> {
        let _ = item;
        None
    }
}

/// A value with a byte encoding suitable for the durability log.
pub trait Loggable {
    /// Returns the log encoding of `self`.
    fn to_log_bytes(&self) -> ArcBytes<'static>;
}

impl Loggable for u64 {
    fn to_log_bytes(&self) -> ArcBytes<'static> {
        ArcBytes::from(self.to_le_bytes().to_vec())
    }
}

impl Loggable for u32 {
    fn to_log_bytes(&self) -> ArcBytes<'static> {
        ArcBytes::from(self.to_le_bytes().to_vec())
    }
}

impl Loggable for i64 {
    fn to_log_bytes(&self) -> ArcBytes<'static> {
        ArcBytes::from(self.to_le_bytes().to_vec())
    }
}

impl Loggable for String {
    fn to_log_bytes(&self) -> ArcBytes<'static> {
        ArcBytes::from(self.as_bytes().to_vec())
    }
}

impl Loggable for Vec<u8> {
    fn to_log_bytes(&self) -> ArcBytes<'static> {
        ArcBytes::from(self.clone())
    }
}
