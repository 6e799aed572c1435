use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::object::{ObjectId, Transactable};

/// The flag bits carried by a [`TransItem`].
///
/// The low byte is reserved for the engine; bits from [`ItemFlags::USER0`]
/// upward belong to the owning object.
#[derive(Default, Clone, Copy, Eq, PartialEq)]
pub struct ItemFlags(u32);

impl ItemFlags {
    /// The item carries a read.
    pub const READ: Self = Self(1);
    /// The item carries a write.
    pub const WRITE: Self = Self(1 << 1);
    /// The engine holds the target's lock on behalf of this item.
    pub const LOCK_HELD: Self = Self(1 << 2);
    /// The item carries a predicate to re-verify at commit time.
    pub const PREDICATE: Self = Self(1 << 3);
    /// First object-defined bit.
    pub const USER0: Self = Self(1 << 8);
    /// Second object-defined bit.
    pub const USER1: Self = Self(1 << 9);

    /// Returns true if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit at or above [`Self::USER0`] is set.
    #[must_use]
    pub const fn has_user_bits(self) -> bool {
        self.0 >= Self::USER0.0
    }

    const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Debug for ItemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemFlags({:#x})", self.0)
    }
}

/// One entry in a transaction's read/write set.
///
/// An item is keyed by `(object, key)`; a transaction holds at most one item
/// per key. The key is an opaque `u64` interpreted only by the owning
/// object. Items may be read-only, write-only, read-write, or flag-only.
pub struct TransItem {
    owner: Arc<dyn Transactable>,
    key: u64,
    flags: ItemFlags,
    read_version: Option<u64>,
    locked_version: Option<u64>,
    write_value: Option<Box<dyn Any + Send>>,
    predicate_value: Option<Box<dyn Any + Send>>,
    anchor: Option<Arc<dyn Any + Send + Sync>>,
}

impl TransItem {
    pub(crate) fn new(owner: Arc<dyn Transactable>, key: u64) -> Self {
        Self {
            owner,
            key,
            flags: ItemFlags::default(),
            read_version: None,
            locked_version: None,
            write_value: None,
            predicate_value: None,
            anchor: None,
        }
    }

    /// Returns the identifier of the object this item targets.
    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        self.owner.object_id()
    }

    pub(crate) fn owner(&self) -> Arc<dyn Transactable> {
        self.owner.clone()
    }

    /// Returns the object-interpreted key.
    #[must_use]
    pub const fn key(&self) -> u64 {
        self.key
    }

    /// Returns the item's current flags.
    #[must_use]
    pub const fn flags(&self) -> ItemFlags {
        self.flags
    }

    /// Returns true if the item carries a read.
    #[must_use]
    pub const fn has_read(&self) -> bool {
        self.flags.contains(ItemFlags::READ)
    }

    /// Returns true if the item carries a write.
    #[must_use]
    pub const fn has_write(&self) -> bool {
        self.flags.contains(ItemFlags::WRITE)
    }

    /// Returns true if the engine holds the target's lock for this item.
    #[must_use]
    pub const fn has_lock(&self) -> bool {
        self.flags.contains(ItemFlags::LOCK_HELD)
    }

    /// Returns true if the item carries a predicate.
    #[must_use]
    pub const fn has_predicate(&self) -> bool {
        self.flags.contains(ItemFlags::PREDICATE)
    }

    /// Records a read of `version`. The first recorded read wins; later
    /// calls for the same item are ignored.
    pub fn add_read(&mut self, version: u64) -> &mut Self {
        if !self.has_read() {
            self.flags = self.flags.with(ItemFlags::READ);
            self.read_version = Some(version);
        }
        self
    }

    /// Replaces a recorded read of `old` with `new`. Used when the owning
    /// object republishes a version the transaction itself bumped, so the
    /// transaction does not invalidate its own structural read.
    pub fn update_read(&mut self, old: u64, new: u64) -> &mut Self {
        if self.read_version == Some(old) {
            self.read_version = Some(new);
        }
        self
    }

    /// Returns the recorded read version, if the item carries a read.
    #[must_use]
    pub const fn read_version(&self) -> Option<u64> {
        self.read_version
    }

    /// Records a write of `value`, replacing any earlier write.
    pub fn add_write<T: Send + 'static>(&mut self, value: T) -> &mut Self {
        self.flags = self.flags.with(ItemFlags::WRITE);
        self.write_value = Some(Box::new(value));
        self
    }

    /// Returns a reference to the pending write, if one of type `T` exists.
    #[must_use]
    pub fn write_value<T: 'static>(&self) -> Option<&T> {
        self.write_value
            .as_deref()
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Removes and returns the pending write of type `T`.
    pub fn take_write<T: 'static>(&mut self) -> Option<T> {
        let value = self.write_value.take()?;
        match value.downcast::<T>() {
            Ok(boxed) => Some(*boxed),
            Err(other) => {
                self.write_value = Some(other);
                None
            }
        }
    }

    /// Records predicate state for commit-time re-verification.
    pub fn set_predicate<T: Send + 'static>(&mut self, value: T) -> &mut Self {
        self.flags = self.flags.with(ItemFlags::PREDICATE);
        self.predicate_value = Some(Box::new(value));
        self
    }

    /// Returns the recorded predicate state, if one of type `T` exists.
    #[must_use]
    pub fn predicate_value<T: 'static>(&self) -> Option<&T> {
        self.predicate_value
            .as_deref()
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Sets `flags` on the item.
    pub fn add_flags(&mut self, flags: ItemFlags) -> &mut Self {
        self.flags = self.flags.with(flags);
        self
    }

    /// Clears `flags` from the item.
    pub fn clear_flags(&mut self, flags: ItemFlags) -> &mut Self {
        self.flags = self.flags.without(flags);
        self
    }

    /// Installs an object-owned handle that pins whatever state the item's
    /// key refers to, so the item never outlives its target.
    pub fn set_anchor<T: Send + Sync + 'static>(&mut self, anchor: Arc<T>) -> &mut Self {
        self.anchor = Some(anchor);
        self
    }

    /// Returns the handle installed by [`set_anchor`](Self::set_anchor).
    #[must_use]
    pub fn anchor<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.anchor.clone()?.downcast().ok()
    }

    /// Records the version observed while acquiring the target's lock.
    /// Called by [`Transactable::lock`] implementations; the engine folds
    /// these into the commit TID.
    pub fn note_locked_version(&mut self, version: u64) {
        self.locked_version = Some(version);
    }

    pub(crate) const fn locked_version(&self) -> Option<u64> {
        self.locked_version
    }
}

impl Debug for TransItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransItem")
            .field("object", &self.object_id())
            .field("key", &self.key)
            .field("flags", &self.flags)
            .field("read_version", &self.read_version)
            .field("has_write", &self.write_value.is_some())
            .finish()
    }
}
