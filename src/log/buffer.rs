use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::object::LogWrite;
use crate::version::Tid;

/// The byte length of a buffer header: `{u64 nentries, u64 last_tid}`.
pub(crate) const HEADER_LEN: usize = 16;

/// A log buffer: a header, a contiguous record payload, and the bookkeeping
/// that moves it through the scratch pool, the persist queue, and a writer's
/// in-flight batch. A buffer is owned by exactly one of those stages at a
/// time.
pub(crate) struct LogBuffer {
    data: Vec<u8>,
    capacity: usize,
    nentries: u64,
    last_tid: Tid,
    pub io_scheduled: bool,
    pub thread_id: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize, thread_id: usize) -> Self {
        let mut buffer = Self {
            data: Vec::with_capacity(capacity),
            capacity,
            nentries: 0,
            last_tid: Tid::default(),
            io_scheduled: false,
            thread_id,
        };
        buffer.reset();
        buffer
    }

    /// Returns the buffer to its empty state for reuse.
    pub fn reset(&mut self) {
        self.data.clear();
        self.data.resize(HEADER_LEN, 0);
        self.nentries = 0;
        self.last_tid = Tid::default();
        self.io_scheduled = false;
    }

    pub const fn is_empty(&self) -> bool {
        self.nentries == 0
    }

    pub const fn nentries(&self) -> u64 {
        self.nentries
    }

    pub const fn last_tid(&self) -> Tid {
        self.last_tid
    }

    /// The filled length. Scheduled iovecs always cover exactly this many
    /// bytes.
    pub fn cur_offset(&self) -> usize {
        self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Returns the encoded size of a record holding `writes`.
    pub fn record_len(writes: &[LogWrite]) -> usize {
        12 + writes
            .iter()
            .map(|write| 16 + write.key.len() + write.value.len())
            .sum::<usize>()
    }

    /// Appends `{commit_tid, nwrites, [key_len, key, val_len, val]*}`.
    /// The caller has verified the record fits.
    pub fn append_record(&mut self, commit_tid: Tid, writes: &[LogWrite]) {
        debug_assert!(Self::record_len(writes) <= self.remaining());
        self.data.extend_from_slice(&commit_tid.0.to_le_bytes());
        self.data
            .extend_from_slice(&(writes.len() as u32).to_le_bytes());
        for write in writes {
            self.data
                .extend_from_slice(&(write.key.len() as u64).to_le_bytes());
            self.data.extend_from_slice(&write.key);
            self.data
                .extend_from_slice(&(write.value.len() as u64).to_le_bytes());
            self.data.extend_from_slice(&write.value);
        }
        self.nentries += 1;
        self.last_tid = commit_tid;
    }

    /// Patches the header with the final entry count and last TID. Called
    /// exactly once, when the buffer leaves the fill stage.
    pub fn seal(&mut self) {
        self.data[..8].copy_from_slice(&self.nentries.to_le_bytes());
        self.data[8..HEADER_LEN].copy_from_slice(&self.last_tid.0.to_le_bytes());
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// The per-worker durability context: a scratch pool of buffers the worker
/// fills, a queue of sealed buffers ready for its writer thread, and the
/// rotation lock that serializes buffer rotation against flush forcing by
/// the persister.
pub(crate) struct PersistCtx {
    /// Serializes buffer rotation against the persister's flush forcing.
    pub lock: Mutex<()>,
    /// Scratch pool; the front buffer is the one currently being filled.
    pub all_buffers: Mutex<VecDeque<Box<LogBuffer>>>,
    /// Sealed buffers awaiting the writer.
    pub persist_buffers: Mutex<VecDeque<Box<LogBuffer>>>,
    /// Signaled when the writer returns buffers to the scratch pool.
    pub returned: Condvar,
    /// Buffers taken by the writer but not yet durable. A worker counts as
    /// quiescent only when its persist queue is empty and this is zero.
    pub outstanding_io: AtomicUsize,
    /// Lifecycle bit, set on first append.
    pub init: AtomicBool,
    /// The owning worker.
    pub thread_id: usize,
}

impl PersistCtx {
    pub fn new(thread_id: usize, pool: usize, capacity: usize) -> Self {
        let all_buffers = (0..pool)
            .map(|_| Box::new(LogBuffer::new(capacity, thread_id)))
            .collect();
        Self {
            lock: Mutex::new(()),
            all_buffers: Mutex::new(all_buffers),
            persist_buffers: Mutex::new(VecDeque::new()),
            returned: Condvar::new(),
            outstanding_io: AtomicUsize::new(0),
            init: AtomicBool::new(false),
            thread_id,
        }
    }

    /// Moves a non-empty fill buffer to the persist queue. The caller must
    /// hold [`Self::lock`].
    pub fn force_current(&self) {
        let mut all = self.all_buffers.lock();
        if all.front().map_or(false, |buffer| !buffer.is_empty()) {
            let mut buffer = all.pop_front().expect("checked front");
            drop(all);
            buffer.seal();
            self.persist_buffers.lock().push_back(buffer);
        }
    }

    /// Returns true when no sealed or in-flight buffer holds unpersisted
    /// records.
    pub fn is_quiesced(&self) -> bool {
        self.persist_buffers.lock().is_empty() && self.outstanding_io.load(Ordering::Acquire) == 0
    }
}
