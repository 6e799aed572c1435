use std::fs::{File, OpenOptions};
use std::io::{IoSlice, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{LogBuffer, LogShared};
use crate::error::Error;

/// The most buffers scheduled into a single vectored write.
const IOV_BATCH: usize = 1024;

/// A writer thread: drains the persist queues of its assigned workers,
/// batches eligible buffers into vectored writes against one log file, and
/// raises the per-worker durable-epoch prefixes it is responsible for.
pub(super) struct WriterThread {
    id: usize,
    logdir: PathBuf,
    assignment: Vec<usize>,
    shared: Arc<LogShared>,
    ticks: flume::Receiver<()>,
    file: Option<File>,
    min_epoch_so_far: u64,
    max_epoch_so_far: u64,
    epoch_prefixes: Vec<u64>,
}

impl WriterThread {
    pub fn new(
        id: usize,
        logdir: PathBuf,
        assignment: Vec<usize>,
        shared: Arc<LogShared>,
        ticks: flume::Receiver<()>,
    ) -> Self {
        let nworkers = shared.nworkers;
        Self {
            id,
            logdir,
            assignment,
            shared,
            ticks,
            file: None,
            min_epoch_so_far: 0,
            max_epoch_so_far: 0,
            epoch_prefixes: vec![0; nworkers],
        }
    }

    pub fn run(mut self) {
        loop {
            let disconnected = matches!(
                self.ticks.recv_timeout(self.shared.config.tick_interval),
                Err(flume::RecvTimeoutError::Disconnected)
            );
            let stopping = disconnected || self.shared.stopping.load(Ordering::Acquire);
            if stopping {
                // Seal whatever the assigned workers were still filling so
                // the final pass flushes it.
                for &worker in &self.assignment {
                    let ctx = &self.shared.ctxs[worker];
                    let _rotation = ctx.lock.lock();
                    ctx.force_current();
                }
            }
            self.pass(stopping)
                .expect("log writer io failure; durability cannot be guaranteed");
            if stopping {
                break;
            }
        }
    }

    /// One batch pass over the assigned workers.
    fn pass(&mut self, stopping: bool) -> Result<(), Error> {
        self.ensure_file()?;
        let cur_sync_epoch_ex = self.shared.system_sync_epoch.load(Ordering::Acquire) + 1;
        let max_lag = self.shared.config.max_lag_epochs;
        let fake_writes = self.shared.config.fake_writes;

        let mut total_written = 0_usize;
        let mut scheduled_per_worker = vec![0_usize; self.shared.nworkers];

        for &worker in &self.assignment {
            let ctx = &self.shared.ctxs[worker];
            let mut batch: Vec<Box<LogBuffer>> = Vec::new();
            {
                let mut queue = ctx.persist_buffers.lock();
                while let Some(front) = queue.front() {
                    if batch.len() == IOV_BATCH {
                        break;
                    }
                    if !stopping && front.last_tid().epoch() >= cur_sync_epoch_ex + max_lag {
                        // Logger max log wait: do not stream further ahead
                        // of the durable epoch.
                        break;
                    }
                    let mut buffer = queue.pop_front().expect("peeked front");
                    assert!(!buffer.io_scheduled, "buffer scheduled twice");
                    assert!(!buffer.is_empty());
                    assert_eq!(buffer.thread_id, worker);
                    buffer.io_scheduled = true;
                    ctx.outstanding_io.fetch_add(1, Ordering::AcqRel);
                    batch.push(buffer);
                }
            }
            if batch.is_empty() {
                continue;
            }
            debug_assert!(
                ctx.init.load(Ordering::Acquire),
                "records from an uninitialized worker context"
            );

            let last_epoch = batch
                .last()
                .expect("batch is non-empty")
                .last_tid()
                .epoch();
            self.epoch_prefixes[worker] =
                self.epoch_prefixes[worker].max(last_epoch.saturating_sub(1));
            self.max_epoch_so_far = self.max_epoch_so_far.max(last_epoch);

            if !fake_writes {
                let file = self.file.as_mut().expect("file opened above");
                write_vectored_all(file, &batch)?;
            }

            // After the vectored write the buffer memory can be returned to
            // the worker immediately; outstanding_io stays raised until the
            // fsync below makes the records durable.
            total_written += batch.len();
            scheduled_per_worker[worker] = batch.len();
            let mut all = ctx.all_buffers.lock();
            for mut buffer in batch {
                assert!(buffer.io_scheduled);
                buffer.reset();
                all.push_back(buffer);
            }
            drop(all);
            ctx.returned.notify_all();
        }

        if total_written == 0 {
            return Ok(());
        }

        if self.shared.config.call_fsync && !fake_writes {
            self.file
                .as_mut()
                .expect("file opened above")
                .sync_all()?;
        }

        for &worker in &self.assignment {
            if scheduled_per_worker[worker] > 0 {
                self.shared.ctxs[worker]
                    .outstanding_io
                    .fetch_sub(scheduled_per_worker[worker], Ordering::AcqRel);
            }
            let slot = &self.shared.per_thread_sync_epochs[self.id][worker];
            let prefix = self.epoch_prefixes[worker];
            if prefix > slot.load(Ordering::Acquire) {
                slot.store(prefix, Ordering::Release);
            }
        }

        Ok(())
    }

    /// Opens the active log file, rotating it out first once its active
    /// range exceeds the configured epoch span.
    fn ensure_file(&mut self) -> Result<(), Error> {
        let span = self.max_epoch_so_far - self.min_epoch_so_far;
        if self.file.is_some() && span <= self.shared.config.rotation_epochs {
            return Ok(());
        }
        let active = self.logdir.join("data.log");
        if self.file.take().is_some() {
            let archive = self
                .logdir
                .join(format!("old_data{}", self.max_epoch_so_far));
            std::fs::rename(&active, archive)?;
        }
        self.file = Some(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(active)?,
        );
        self.min_epoch_so_far = self.max_epoch_so_far;
        Ok(())
    }
}

/// Issues one `writev`-style write covering every buffer in `batch`,
/// finishing any partially written tail with sequential writes. Each iovec
/// covers exactly the buffer's filled length.
fn write_vectored_all(file: &mut File, batch: &[Box<LogBuffer>]) -> std::io::Result<()> {
    let slices: Vec<IoSlice<'_>> = batch
        .iter()
        .map(|buffer| IoSlice::new(buffer.bytes()))
        .collect();
    let total: usize = batch.iter().map(|buffer| buffer.cur_offset()).sum();
    let mut written = file.write_vectored(&slices)?;
    if written == total {
        return Ok(());
    }
    for buffer in batch {
        let bytes = buffer.bytes();
        if written >= bytes.len() {
            written -= bytes.len();
            continue;
        }
        file.write_all(&bytes[written..])?;
        written = 0;
    }
    Ok(())
}
