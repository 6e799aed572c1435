//! The 64-bit version word underlying every transactable object, and the
//! transaction-identifier encoding derived from it.

use std::fmt::{self, Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};

/// Bit 0 of a version word: the word is locked by exactly one thread.
pub const LOCK_BIT: u64 = 1;
/// Bit 1 of a version word: reserved for the owning object. The red-black
/// tree uses it to mark nodes inserted but not yet committed.
pub const USER_BIT1: u64 = 1 << 1;
/// Bit 2 of a version word: reserved for the owning object.
pub const USER_BIT2: u64 = 1 << 2;
/// All non-counter bits of a version word.
pub const FLAG_MASK: u64 = LOCK_BIT | USER_BIT1 | USER_BIT2;
/// The step of the monotonic counter portion of a version word.
pub const INCREMENT: u64 = 1 << 3;

const EPOCH_SHIFT: u32 = 40;

/// A transaction identifier. The epoch the transaction committed in occupies
/// the high bits; the low bits hold a monotonic sequence stepped by
/// [`INCREMENT`] so a TID can be stored directly into a version word without
/// disturbing its flag bits.
#[derive(Default, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Tid(pub u64);

impl Tid {
    /// Returns the identifier of the epoch this transaction belongs to.
    #[must_use]
    pub const fn epoch(self) -> u64 {
        self.0 >> EPOCH_SHIFT
    }

    /// Builds a TID from an epoch and a sequence number.
    #[must_use]
    pub const fn from_parts(epoch: u64, sequence: u64) -> Self {
        Self((epoch << EPOCH_SHIFT) | (sequence << 3))
    }

    pub(crate) const fn counter_portion(self) -> u64 {
        self.0 & !FLAG_MASK
    }
}

impl Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({}:{})", self.epoch(), (self.0 & !FLAG_MASK) >> 3)
    }
}

impl Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// A 64-bit atomic version word.
///
/// Layout: bit 0 is the lock bit, bits 1-2 are user-defined flag bits, and
/// the remaining bits form a monotonic version counter. The word is the sole
/// synchronization point for the value it guards: writers hold the lock bit
/// across installation, and readers validate at commit time that the counter
/// portion has not moved since their read.
#[derive(Default)]
pub struct TVersion(AtomicU64);

impl TVersion {
    /// Returns a version word initialized to `value`.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Returns the current value of the word.
    #[must_use]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Returns true if the lock bit is currently set.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.load() & LOCK_BIT != 0
    }

    /// Attempts to acquire the lock bit once.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        let current = self.0.load(Ordering::Relaxed);
        if current & LOCK_BIT != 0 {
            return false;
        }
        self.0
            .compare_exchange(
                current,
                current | LOCK_BIT,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Attempts to acquire the lock bit, spinning up to `spins` times.
    #[must_use]
    pub fn try_lock_spin(&self, spins: usize) -> bool {
        for _ in 0..=spins {
            if self.try_lock() {
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    /// Releases the lock bit. Harmless if the bit is already clear, which
    /// happens when an install published a fresh TID into the word.
    pub fn unlock(&self) {
        self.0.fetch_and(!LOCK_BIT, Ordering::Release);
    }

    /// Returns true iff the word still matches `read`, ignoring the lock
    /// bit, and is not locked by a foreign transaction. `ours` reports
    /// whether the caller's transaction holds the lock.
    #[must_use]
    pub fn check(&self, read: u64, ours: bool) -> bool {
        let current = self.load();
        let same_version = (read ^ current) <= LOCK_BIT;
        let not_locked = current & LOCK_BIT == 0 || ours;
        same_version && not_locked
    }

    /// Bumps the counter portion, leaving flag bits untouched. The resulting
    /// value is not a valid TID; it only needs to differ from every version
    /// previously observed by concurrent readers.
    pub fn inc_invalid_version(&self) {
        self.0.fetch_add(INCREMENT, Ordering::Release);
    }

    /// Publishes `tid` as the new version. TIDs carry no flag bits, so this
    /// also releases the lock.
    pub fn set_version(&self, tid: Tid) {
        debug_assert_eq!(tid.0 & FLAG_MASK, 0);
        self.0.store(tid.0, Ordering::Release);
    }

    /// Sets [`USER_BIT1`].
    pub fn mark_inserted(&self) {
        self.0.fetch_or(USER_BIT1, Ordering::Release);
    }

    /// Clears [`USER_BIT1`].
    pub fn erase_inserted(&self) {
        self.0.fetch_and(!USER_BIT1, Ordering::Release);
    }

    /// Returns true if [`USER_BIT1`] is set in `value`.
    #[must_use]
    pub const fn is_inserted(value: u64) -> bool {
        value & USER_BIT1 != 0
    }

    /// Bumps the counter portion and returns the values before and after
    /// the increment. Used for structural version counters whose readers
    /// compare exact equality.
    pub fn increment(&self) -> (u64, u64) {
        let old = self.0.fetch_add(INCREMENT, Ordering::AcqRel);
        (old, old.wrapping_add(INCREMENT))
    }
}

impl Debug for TVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.load();
        write!(
            f,
            "TVersion({:#x}{}{})",
            value & !FLAG_MASK,
            if value & LOCK_BIT != 0 { ", locked" } else { "" },
            if Self::is_inserted(value) {
                ", inserted"
            } else {
                ""
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_cycle() {
        let v = TVersion::default();
        assert!(!v.is_locked());
        assert!(v.try_lock());
        assert!(v.is_locked());
        assert!(!v.try_lock());
        assert!(!v.try_lock_spin(8));
        v.unlock();
        assert!(!v.is_locked());
        assert!(v.try_lock_spin(0));
        v.unlock();
    }

    #[test]
    fn check_ignores_lock_bit_only() {
        let v = TVersion::new(INCREMENT * 5);
        let read = v.load();
        assert!(v.check(read, false));

        // A locked word still validates for the lock owner.
        assert!(v.try_lock());
        assert!(v.check(read, true));
        assert!(!v.check(read, false));
        v.unlock();

        // Any counter movement invalidates the read.
        v.inc_invalid_version();
        assert!(!v.check(read, false));
    }

    #[test]
    fn user_bits_invalidate_reads() {
        let v = TVersion::new(INCREMENT);
        let read = v.load();
        v.mark_inserted();
        assert!(!v.check(read, false));
        v.erase_inserted();
        assert!(v.check(read, false));
    }

    #[test]
    fn set_version_releases_lock() {
        let v = TVersion::default();
        assert!(v.try_lock());
        v.set_version(Tid::from_parts(3, 17));
        assert!(!v.is_locked());
        assert_eq!(Tid(v.load()).epoch(), 3);
    }

    #[test]
    fn tid_round_trips_epoch() {
        let tid = Tid::from_parts(42, 9000);
        assert_eq!(tid.epoch(), 42);
        assert_eq!(tid.0 & FLAG_MASK, 0);
        assert!(Tid::from_parts(43, 0) > tid);
        assert!(Tid::from_parts(42, 9001) > tid);
    }
}
