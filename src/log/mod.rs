//! The durability pipeline: per-worker log buffers, writer threads that
//! batch buffers to log files with vectored IO, and the persister thread
//! that advances the system-wide durable epoch.
//!
//! A transaction that committed with TID in epoch `e` is acknowledged only
//! once `system_sync_epoch >= e`, at which point every record it logged is
//! on stable storage and the on-disk `pepoch` marker covers it.

mod buffer;
mod persister;
mod writer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub(crate) use self::buffer::{LogBuffer, PersistCtx, HEADER_LEN};
use self::persister::PersisterThread;
use self::writer::WriterThread;
use crate::epoch::{ActiveTable, EpochState};
use crate::error::{Error, ErrorKind};
use crate::object::LogWrite;
use crate::version::Tid;

/// The maximum number of writer threads (and therefore log files).
pub const MAX_LOGGERS: usize = 32;

/// Configuration of the durability pipeline.
#[derive(Debug, Clone)]
#[must_use]
pub struct LogConfig {
    /// One output directory per writer thread (1..=32 entries). Each holds
    /// a `data.log` plus rotated archives.
    pub logfiles: Vec<PathBuf>,
    /// Optional worker-to-logger partition. Defaults to a block partition
    /// of `0..nworkers` across the log files.
    pub assignments: Option<Vec<Vec<usize>>>,
    /// Whether writers fsync after each vectored write.
    pub call_fsync: bool,
    /// Reserves one buffer per worker as compression scratch. The codec is
    /// left to a future implementation; only the buffer accounting changes.
    pub use_compression: bool,
    /// Skip actual IO. Buffers still flow through the pipeline and epochs
    /// still advance.
    pub fake_writes: bool,
    /// Upper bound on epochs a writer may stream ahead of the system sync
    /// epoch.
    pub max_lag_epochs: u64,
    /// Ring depth of the per-worker buffer pool.
    pub perthread_buffers: usize,
    /// Byte capacity of each log buffer.
    pub buffer_capacity: usize,
    /// A writer rotates its log file once its active range exceeds this
    /// many epochs.
    pub rotation_epochs: u64,
    /// Lower bound on the writer/persister wakeup interval. Tests force
    /// ticks instead of shortening this.
    pub tick_interval: Duration,
    /// Directory holding the `pepoch` marker.
    pub root_folder: PathBuf,
}

impl LogConfig {
    /// Returns a configuration writing to `logfiles` with the defaults the
    /// pipeline was tuned with.
    pub fn new<I, P>(logfiles: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            logfiles: logfiles.into_iter().map(Into::into).collect(),
            assignments: None,
            call_fsync: true,
            use_compression: false,
            fake_writes: false,
            max_lag_epochs: 64,
            perthread_buffers: 8,
            buffer_capacity: 4 * 1024 * 1024,
            rotation_epochs: 200,
            tick_interval: Duration::from_millis(100),
            root_folder: PathBuf::from("/silo_log"),
        }
    }

    /// Sets the directory holding the `pepoch` marker.
    pub fn root_folder<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root_folder = root.into();
        self
    }

    /// Sets whether writers fsync after each vectored write.
    pub fn call_fsync(mut self, fsync: bool) -> Self {
        self.call_fsync = fsync;
        self
    }

    /// Skips actual IO while keeping the pipeline flowing.
    pub fn fake_writes(mut self, fake: bool) -> Self {
        self.fake_writes = fake;
        self
    }

    /// Sets the byte capacity of each log buffer.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    fn validate(&self, nworkers: usize) -> Result<Vec<Vec<usize>>, Error> {
        if nworkers == 0 {
            return Err(ErrorKind::Config(String::from("nworkers must be >= 1")).into());
        }
        if self.logfiles.is_empty() || self.logfiles.len() > MAX_LOGGERS {
            return Err(ErrorKind::Config(format!(
                "between 1 and {MAX_LOGGERS} logfiles required"
            ))
            .into());
        }
        if self.use_compression && self.perthread_buffers < 2 {
            return Err(ErrorKind::Config(String::from(
                "compression requires at least 2 buffers per worker",
            ))
            .into());
        }
        if self.perthread_buffers == 0 {
            return Err(ErrorKind::Config(String::from(
                "at least 1 buffer per worker required",
            ))
            .into());
        }
        if self.buffer_capacity <= HEADER_LEN {
            return Err(ErrorKind::Config(String::from("buffer capacity too small")).into());
        }

        let assignments = match &self.assignments {
            Some(given) => {
                let mut seen = vec![false; nworkers];
                for worker in given.iter().flatten() {
                    if *worker >= nworkers || seen[*worker] {
                        return Err(ErrorKind::Config(String::from(
                            "assignments must partition the worker set",
                        ))
                        .into());
                    }
                    seen[*worker] = true;
                }
                if !seen.iter().all(|seen| *seen) || given.len() > self.logfiles.len() {
                    return Err(ErrorKind::Config(String::from(
                        "assignments must partition the worker set",
                    ))
                    .into());
                }
                given.clone()
            }
            None => block_partition(nworkers, self.logfiles.len()),
        };
        Ok(assignments)
    }
}

/// The default worker-to-logger partition: one worker per logger when
/// workers are scarce, otherwise contiguous blocks with the remainder on
/// the last logger.
fn block_partition(nworkers: usize, nloggers: usize) -> Vec<Vec<usize>> {
    if nworkers <= nloggers {
        (0..nworkers).map(|worker| vec![worker]).collect()
    } else {
        let per_logger = nworkers / nloggers;
        (0..nloggers)
            .map(|logger| {
                let start = logger * per_logger;
                let end = if logger + 1 == nloggers {
                    nworkers
                } else {
                    start + per_logger
                };
                (start..end).collect()
            })
            .collect()
    }
}

pub(crate) struct LogShared {
    pub config: LogConfig,
    pub nworkers: usize,
    pub assignments: Vec<Vec<usize>>,
    pub epoch: Arc<EpochState>,
    /// Epoch membership of in-flight transactions; the persister never
    /// advances a worker past an epoch it is still executing in.
    pub active: Arc<ActiveTable>,
    pub ctxs: Vec<PersistCtx>,
    /// `[logger][worker]`: records up to this epoch are durable.
    pub per_thread_sync_epochs: Vec<Vec<AtomicU64>>,
    /// The system-wide durable epoch: the minimum over all slots above.
    pub system_sync_epoch: AtomicU64,
    pub stopping: AtomicBool,
    pub writers_done: AtomicBool,
    durable_mutex: Mutex<()>,
    durable_cv: Condvar,
}

impl LogShared {
    pub fn notify_durable(&self) {
        let _guard = self.durable_mutex.lock();
        self.durable_cv.notify_all();
    }
}

/// The running durability pipeline: one writer thread per log file plus the
/// persister. Spawned by the runtime when a [`LogConfig`] is supplied.
pub(crate) struct LogSystem {
    shared: Arc<LogShared>,
    writer_ticks: Vec<flume::Sender<()>>,
    persister_tick: flume::Sender<()>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LogSystem {
    pub fn spawn(
        nworkers: usize,
        config: LogConfig,
        epoch: Arc<EpochState>,
        active: Arc<ActiveTable>,
    ) -> Result<Self, Error> {
        let assignments = config.validate(nworkers)?;

        std::fs::create_dir_all(&config.root_folder)?;
        for logfile in &config.logfiles {
            std::fs::create_dir_all(logfile)?;
        }

        let pool = config.perthread_buffers - usize::from(config.use_compression);
        let ctxs = (0..nworkers)
            .map(|worker| PersistCtx::new(worker, pool, config.buffer_capacity))
            .collect();
        let per_thread_sync_epochs = (0..assignments.len())
            .map(|_| (0..nworkers).map(|_| AtomicU64::new(0)).collect())
            .collect();

        let shared = Arc::new(LogShared {
            config,
            nworkers,
            assignments,
            epoch,
            active,
            ctxs,
            per_thread_sync_epochs,
            system_sync_epoch: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
            writers_done: AtomicBool::new(false),
            durable_mutex: Mutex::new(()),
            durable_cv: Condvar::new(),
        });

        let mut threads = Vec::new();
        let mut writer_ticks = Vec::new();
        for (logger, assignment) in shared.assignments.iter().enumerate() {
            let (tick_sender, ticks) = flume::bounded(1);
            let writer = WriterThread::new(
                logger,
                shared.config.logfiles[logger].clone(),
                assignment.clone(),
                shared.clone(),
                ticks,
            );
            threads.push(
                std::thread::Builder::new()
                    .name(format!("yamadori-writer-{logger}"))
                    .spawn(move || writer.run())
                    .map_err(ErrorKind::message)?,
            );
            writer_ticks.push(tick_sender);
        }

        let (persister_tick, ticks) = flume::bounded(1);
        let persister = PersisterThread::new(shared.clone(), ticks);
        threads.push(
            std::thread::Builder::new()
                .name(String::from("yamadori-persist"))
                .spawn(move || persister.run())
                .map_err(ErrorKind::message)?,
        );

        Ok(Self {
            shared,
            writer_ticks,
            persister_tick,
            threads: Mutex::new(threads),
        })
    }

    /// The current system-wide durable epoch.
    pub fn durable_epoch(&self) -> u64 {
        self.shared.system_sync_epoch.load(Ordering::Acquire)
    }

    /// Appends a commit record to `worker`'s current log buffer, rotating
    /// to a fresh buffer when the current one is full. Blocks while the
    /// scratch pool is exhausted.
    pub fn append_commit(
        &self,
        worker: usize,
        commit_tid: Tid,
        writes: &[LogWrite],
    ) -> Result<(), Error> {
        let ctx = &self.shared.ctxs[worker];
        ctx.init.store(true, Ordering::Release);
        let record_len = LogBuffer::record_len(writes);
        if record_len + HEADER_LEN > self.shared.config.buffer_capacity {
            return Err(ErrorKind::RecordTooLarge.into());
        }

        loop {
            let mut rotate = false;
            {
                let mut all = ctx.all_buffers.lock();
                match all.front_mut() {
                    Some(front) if front.remaining() >= record_len => {
                        front.append_record(commit_tid, writes);
                        return Ok(());
                    }
                    Some(_) => rotate = true,
                    None => {
                        // Scratch pool exhausted; wait for the writer to
                        // return buffers.
                        ctx.returned
                            .wait_for(&mut all, Duration::from_millis(10));
                        if self.shared.stopping.load(Ordering::Acquire) {
                            return Err(ErrorKind::Shutdown.into());
                        }
                    }
                }
            }
            if rotate {
                let _rotation = ctx.lock.lock();
                ctx.force_current();
            }
        }
    }

    /// Blocks until the durable epoch reaches `epoch`.
    pub fn wait_durable(&self, epoch: u64) -> Result<(), Error> {
        let shared = &self.shared;
        let mut guard = shared.durable_mutex.lock();
        while shared.system_sync_epoch.load(Ordering::Acquire) < epoch {
            if shared.stopping.load(Ordering::Acquire) {
                return Err(ErrorKind::Shutdown.into());
            }
            shared
                .durable_cv
                .wait_for(&mut guard, Duration::from_millis(50));
        }
        Ok(())
    }

    /// Forces every writer and the persister to run a batch immediately.
    pub fn force_tick(&self) {
        for tick in &self.writer_ticks {
            drop(tick.try_send(()));
        }
        drop(self.persister_tick.try_send(()));
    }

    /// Stops the pipeline: writers flush what they have and fsync, the
    /// persister publishes a final durable epoch, and all threads are
    /// joined.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        let mut threads = self.threads.lock();
        let persister = threads.pop();

        for tick in &self.writer_ticks {
            drop(tick.try_send(()));
        }
        for writer in threads.drain(..) {
            drop(writer.join());
        }
        self.shared.writers_done.store(true, Ordering::Release);

        drop(self.persister_tick.try_send(()));
        if let Some(persister) = persister {
            drop(persister.join());
        }
        self.shared.notify_durable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_partition_shapes() {
        assert_eq!(block_partition(2, 4), vec![vec![0], vec![1]]);
        assert_eq!(block_partition(4, 2), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(block_partition(5, 2), vec![vec![0, 1], vec![2, 3, 4]]);
    }

    #[test]
    fn validation_rejects_bad_configurations() {
        let config = LogConfig::new(Vec::<PathBuf>::new());
        assert!(matches!(
            config.validate(1).unwrap_err().kind,
            ErrorKind::Config(_)
        ));

        let mut config = LogConfig::new(["log"]);
        config.use_compression = true;
        config.perthread_buffers = 1;
        assert!(matches!(
            config.validate(1).unwrap_err().kind,
            ErrorKind::Config(_)
        ));

        let mut config = LogConfig::new(["log"]);
        config.assignments = Some(vec![vec![0, 0]]);
        assert!(matches!(
            config.validate(1).unwrap_err().kind,
            ErrorKind::Config(_)
        ));

        let mut config = LogConfig::new(["a", "b"]);
        config.assignments = Some(vec![vec![1], vec![0, 2]]);
        assert!(config.validate(3).is_ok());
    }

    use std::io::Read;
    use std::time::Instant;

    use byteorder::{LittleEndian, ReadBytesExt};

    use crate::runtime::{Options, Runtime};
    use crate::test_util::TestDirectory;
    use crate::TCell;

    type DecodedRecord = (u64, Vec<(Vec<u8>, Vec<u8>)>);

    /// Reads an append-only log file the way recovery would: buffer headers
    /// in sequence, each followed by its records.
    fn decode_log(path: &std::path::Path) -> Vec<DecodedRecord> {
        let mut bytes = Vec::new();
        std::fs::File::open(path)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        let mut cursor = &bytes[..];
        let mut records = Vec::new();
        while !cursor.is_empty() {
            let nentries = cursor.read_u64::<LittleEndian>().unwrap();
            let _last_tid = cursor.read_u64::<LittleEndian>().unwrap();
            for _ in 0..nentries {
                let tid = cursor.read_u64::<LittleEndian>().unwrap();
                let nwrites = cursor.read_u32::<LittleEndian>().unwrap();
                let mut writes = Vec::new();
                for _ in 0..nwrites {
                    let key_len = cursor.read_u64::<LittleEndian>().unwrap();
                    let (key, rest) = cursor.split_at(usize::try_from(key_len).unwrap());
                    cursor = rest;
                    let value_len = cursor.read_u64::<LittleEndian>().unwrap();
                    let (value, rest) = cursor.split_at(usize::try_from(value_len).unwrap());
                    cursor = rest;
                    writes.push((key.to_vec(), value.to_vec()));
                }
                records.push((tid, writes));
            }
        }
        records
    }

    fn read_pepoch(root: &std::path::Path) -> Option<u64> {
        let bytes = std::fs::read(root.join("pepoch")).ok()?;
        Some(u64::from_le_bytes(bytes[..8].try_into().unwrap()))
    }

    fn durable_runtime(dir: &TestDirectory) -> Runtime {
        let mut config = LogConfig::new([dir.join("log0")])
            .root_folder(dir.join("root"))
            .buffer_capacity(4096)
            .call_fsync(true);
        config.tick_interval = Duration::from_millis(10);
        Runtime::new(
            Options::durable(1, config).epoch_interval(Duration::from_millis(10)),
        )
        .unwrap()
    }

    fn wait_for<F: FnMut() -> bool>(runtime: &Runtime, mut condition: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition never became true");
            runtime.force_tick();
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn durable_commit_is_covered_by_pepoch() {
        let dir = TestDirectory::new("yamadori-durable-commit");
        let runtime = durable_runtime(&dir);
        let worker = runtime.worker(0).unwrap();
        let cell = TCell::new(0_u64);

        // Let the system reach a later epoch first, as a transaction in a
        // mid-stream epoch would.
        wait_for(&runtime, || runtime.epoch() >= 7);

        let mut txn = worker.begin().unwrap();
        cell.write(&mut txn, 41);
        assert!(txn.try_commit().unwrap());
        let commit_epoch = txn.commit_tid().unwrap().epoch();
        drop(txn);
        assert!(commit_epoch >= 7);

        wait_for(&runtime, || {
            runtime.durable_epoch().unwrap_or(0) >= commit_epoch
        });
        let pepoch = read_pepoch(&dir.join("root")).expect("pepoch written");
        assert!(pepoch >= commit_epoch);
        // The marker never runs ahead of the published durable epoch.
        assert!(pepoch <= runtime.durable_epoch().unwrap());

        runtime.stop();
        let records = decode_log(&dir.join("log0").join("data.log"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1.len(), 1);
        assert_eq!(records[0].1[0].1, 41_u64.to_le_bytes().to_vec());
    }

    #[test]
    fn run_blocks_until_durable() {
        let dir = TestDirectory::new("yamadori-durable-ack");
        let runtime = durable_runtime(&dir);
        let worker = runtime.worker(0).unwrap();
        let cell = TCell::new(0_u64);

        for value in 1..=3_u64 {
            worker
                .run(|txn| {
                    cell.write(txn, value);
                    Ok(())
                })
                .unwrap();
            // The acknowledged commit is already covered on disk. Read the
            // marker first: the durable epoch read afterwards can only be
            // at or past it.
            let pepoch = read_pepoch(&dir.join("root")).expect("pepoch written");
            let durable = runtime.durable_epoch().unwrap();
            assert!(pepoch >= 1);
            assert!(durable >= pepoch);
        }

        runtime.stop();
        let records = decode_log(&dir.join("log0").join("data.log"));
        assert_eq!(records.len(), 3);
        let tids: Vec<u64> = records.iter().map(|(tid, _)| *tid).collect();
        let mut sorted = tids.clone();
        sorted.sort_unstable();
        assert_eq!(tids, sorted, "single-worker records appear in TID order");
    }

    #[test]
    fn buffers_rotate_and_concatenate_without_padding() {
        let dir = TestDirectory::new("yamadori-durable-rotation");
        let runtime = {
            let mut config = LogConfig::new([dir.join("log0")])
                .root_folder(dir.join("root"))
                // Small buffers so a handful of records spans several.
                .buffer_capacity(96);
            config.tick_interval = Duration::from_millis(10);
            Runtime::new(
                Options::durable(1, config).epoch_interval(Duration::from_millis(10)),
            )
            .unwrap()
        };
        let worker = runtime.worker(0).unwrap();
        let cell = TCell::new(0_u64);

        for value in 0..20_u64 {
            worker
                .run(|txn| {
                    cell.write(txn, value);
                    Ok(())
                })
                .unwrap();
        }
        runtime.stop();

        let records = decode_log(&dir.join("log0").join("data.log"));
        assert_eq!(records.len(), 20);
        assert_eq!(
            records.last().unwrap().1[0].1,
            19_u64.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn fake_writes_advance_epochs_without_io() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = {
            let mut config = LogConfig::new([dir.path().join("log0")])
                .root_folder(dir.path().join("root"))
                .buffer_capacity(4096)
                .fake_writes(true);
            config.tick_interval = Duration::from_millis(10);
            Runtime::new(
                Options::durable(1, config).epoch_interval(Duration::from_millis(10)),
            )
            .unwrap()
        };
        let worker = runtime.worker(0).unwrap();
        let cell = TCell::new(0_u64);

        worker
            .run(|txn| {
                cell.write(txn, 9);
                Ok(())
            })
            .unwrap();

        // Buffers were recycled without touching the file.
        let data = std::fs::metadata(dir.path().join("log0").join("data.log")).unwrap();
        assert_eq!(data.len(), 0);
        // The pepoch marker is still maintained.
        assert!(read_pepoch(&dir.path().join("root")).expect("pepoch written") >= 1);
        runtime.stop();
    }

    #[test]
    fn durable_epoch_is_monotonic() {
        let dir = TestDirectory::new("yamadori-durable-monotonic");
        let runtime = durable_runtime(&dir);
        let worker = runtime.worker(0).unwrap();
        let cell = TCell::new(0_u64);

        let mut last = 0;
        for value in 0..5_u64 {
            worker
                .run(|txn| {
                    cell.write(txn, value);
                    Ok(())
                })
                .unwrap();
            let durable = runtime.durable_epoch().unwrap();
            assert!(durable >= last);
            last = durable;
        }
        runtime.stop();
    }

    #[test]
    fn shutdown_flushes_partial_buffers() {
        let dir = TestDirectory::new("yamadori-durable-shutdown");
        let runtime = durable_runtime(&dir);
        let worker = runtime.worker(0).unwrap();
        let cell = TCell::new(0_u64);

        // Commit without waiting for durability, then stop immediately:
        // the writer's final pass must flush the partial buffer.
        let mut txn = worker.begin().unwrap();
        cell.write(&mut txn, 7);
        assert!(txn.try_commit().unwrap());
        drop(txn);
        runtime.stop();

        let records = decode_log(&dir.join("log0").join("data.log"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1[0].1, 7_u64.to_le_bytes().to_vec());
    }
}
