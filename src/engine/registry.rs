//! # Handle Registry
//!
//! Single authority for "is this newsgroup's overview file currently
//! mapped, and by whom". All open and close traffic flows through two
//! fixed-size thread pools that drain bounded request channels; requests
//! embed a reply channel, so callers never touch the registry map directly.
//!
//! ## Entry State Machine
//!
//! ```text
//!              get_open                   park
//!   (absent) ----------> Worker(id) -------------> Idle
//!       ^                    |  ^                    |
//!       |        force close |  | get_open (reuse)   | sweeper try_lock
//!       |                    v  +--------------------+
//!       +------------------ Closing <----------------+
//! ```
//!
//! `Worker(id)` means the mapped file is checked out to that worker and the
//! entry holds only bookkeeping; `Idle` means the file is parked inside the
//! entry, still mapped, waiting to be reused or swept. `Flushing`/`Closing`
//! mark a closer operating on the entry.
//!
//! ## Invariants
//!
//! - A file is checked out to at most one worker; the per-hash resource
//!   lock is held from `get_open` until the matching close request
//!   completes, which also wakes the next FIFO waiter.
//! - The registry mutex is held only for O(1) map operations, never across
//!   file I/O.
//! - An entry observed in an impossible state (foreign owner on park, hash
//!   mismatch) is an unrecoverable protocol violation: the registry raises
//!   the engine-wide shutdown flag.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use eyre::{ensure, eyre, Result};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::storage::{unix_secs, OverviewFile, OV_RESERVE_END};

use super::lock::GroupLockTable;

/// Sweeper sleep bounds in milliseconds; the loop tunes itself between
/// them based on registry load.
const SWEEP_SLEEP_MIN_MS: u64 = 25;
const SWEEP_SLEEP_MAX_MS: u64 = 250;

/// Backoff while an entry is in a transitional state.
const RETRY_SLEEP: Duration = Duration::from_millis(1);

/// Request to open (or reuse) the mapped file for one group hash.
pub struct OpenRequest {
    pub worker: usize,
    pub hash: String,
    pub path: PathBuf,
    pub reply: Sender<Result<OverviewFile>>,
}

/// Request to park, flush, or close a checked-out file.
pub struct CloseRequest {
    pub file: OverviewFile,
    pub force: bool,
    pub reply: Option<Sender<Result<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Idle,
    Worker(usize),
    Flushing,
    Closing,
}

struct HandleEntry {
    file: Option<OverviewFile>,
    owner: Owner,
    preopen: bool,
    open: bool,
    idle_since: i64,
}

impl HandleEntry {
    fn unassigned() -> Self {
        Self {
            file: None,
            owner: Owner::Idle,
            preopen: false,
            open: false,
            idle_since: 0,
        }
    }
}

/// Counters for observing registry behavior; also the hook tests use to
/// verify that N concurrent logical opens share one physical mapping.
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub files_opened: AtomicU64,
    pub files_closed: AtomicU64,
    pub parks: AtomicU64,
    pub reuses: AtomicU64,
    pub flushes: AtomicU64,
    pub forced_closes: AtomicU64,
}

pub struct HandleRegistry {
    entries: Mutex<HashMap<String, HandleEntry>>,
    locks: GroupLockTable,
    open_files: AtomicUsize,
    max_open_files: usize,
    flush_interval_secs: i64,
    initial_pages: u64,
    shutdown: Arc<AtomicBool>,
    pub stats: RegistryStats,
}

impl HandleRegistry {
    pub fn new(
        max_open_files: usize,
        flush_interval_secs: i64,
        initial_pages: u64,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(max_open_files)),
            locks: GroupLockTable::new(),
            open_files: AtomicUsize::new(0),
            max_open_files,
            flush_interval_secs,
            initial_pages,
            shutdown,
            stats: RegistryStats::default(),
        }
    }

    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn locks(&self) -> &GroupLockTable {
        &self.locks
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Unrecoverable protocol violation: request engine-wide shutdown.
    fn kill(&self, who: &str) {
        error!(who, "registry invariant violated, requesting shutdown");
        self.shutdown.store(true, Ordering::Release);
    }

    /// Acquires the per-hash resource lock and returns the mapped file for
    /// `hash`, opening or creating it as needed. The resource lock stays
    /// held until the matching close request is processed.
    pub fn get_open(&self, worker: usize, path: &Path, hash: &str) -> Result<OverviewFile> {
        ensure!(hash.len() == 64, "group hash '{}' is not 64 chars", hash);
        self.locks.lock(hash);

        match self.get_open_locked(worker, path, hash) {
            Ok(file) => Ok(file),
            Err(e) => {
                // The caller never saw the file; release the hash so the
                // next waiter is not stranded.
                self.clear_failed_open(worker, hash);
                Err(e)
            }
        }
    }

    fn get_open_locked(&self, worker: usize, path: &Path, hash: &str) -> Result<OverviewFile> {
        loop {
            {
                let mut entries = self.entries.lock();
                let entry = entries
                    .entry(hash.to_string())
                    .or_insert_with(HandleEntry::unassigned);

                match entry.owner {
                    Owner::Flushing | Owner::Closing => {}
                    Owner::Worker(current) if current != worker => {}
                    _ => {
                        if entry.open && !entry.preopen {
                            let file = entry
                                .file
                                .take()
                                .ok_or_else(|| eyre!("open entry without a parked file"))?;
                            entry.owner = Owner::Worker(worker);
                            entry.idle_since = -1;
                            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                            return Ok(file);
                        }
                        entry.owner = Owner::Worker(worker);
                        entry.preopen = true;
                        break;
                    }
                }
            }
            // Transitional state; the holder resolves it in microseconds.
            ensure!(
                !self.shutting_down(),
                "get_open aborted by shutdown for hash '{}'",
                hash
            );
            std::thread::sleep(RETRY_SLEEP);
        }

        if !path.exists() {
            OverviewFile::create(path, hash, self.initial_pages)?;
        }
        let file = OverviewFile::open(path, hash)?;

        let open_now = self.open_files.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.files_opened.fetch_add(1, Ordering::Relaxed);
        if open_now > self.max_open_files {
            warn!(open_now, max = self.max_open_files, "open map budget exceeded");
        }

        let mut entries = self.entries.lock();
        match entries.get_mut(hash) {
            Some(entry) if entry.owner == Owner::Worker(worker) && entry.preopen => {
                entry.preopen = false;
                entry.open = true;
                entry.idle_since = -1;
                Ok(file)
            }
            _ => {
                self.kill("get_open");
                Err(eyre!("registry entry for '{}' changed under preopen", hash))
            }
        }
    }

    /// Rolls back a failed open attempt and releases the hash.
    fn clear_failed_open(&self, worker: usize, hash: &str) {
        let mut entries = self.entries.lock();
        let removable = matches!(
            entries.get(hash),
            Some(entry) if (entry.owner == Owner::Worker(worker) || entry.owner == Owner::Idle)
                && entry.file.is_none()
                && !entry.open
        );
        if removable {
            entries.remove(hash);
        }
        drop(entries);
        self.locks.unlock(hash);
    }

    /// Discards a checked-out file whose handle was lost to a failed
    /// append/grow: the entry is dropped, the counter decremented, and the
    /// hash released.
    pub fn discard(&self, worker: usize, hash: &str) {
        let mut entries = self.entries.lock();
        let ours = matches!(
            entries.get(hash),
            Some(entry) if entry.owner == Owner::Worker(worker)
        );
        if !ours {
            drop(entries);
            self.kill("discard");
            return;
        }
        entries.remove(hash);
        drop(entries);
        self.open_files.fetch_sub(1, Ordering::AcqRel);
        self.stats.files_closed.fetch_add(1, Ordering::Relaxed);
        self.locks.unlock(hash);
    }

    /// Returns a checked-out file into its entry without closing it.
    fn park(&self, file: OverviewFile) -> Result<()> {
        let hash = file.hash().to_string();
        let mut entries = self.entries.lock();
        let parked = match entries.get_mut(&hash) {
            Some(entry)
                if matches!(entry.owner, Owner::Worker(_) | Owner::Flushing)
                    && entry.open
                    && !entry.preopen =>
            {
                entry.file = Some(file);
                entry.owner = Owner::Idle;
                entry.idle_since = unix_secs();
                true
            }
            _ => false,
        };
        drop(entries);

        if parked {
            self.stats.parks.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            self.kill("park");
            Err(eyre!("park on entry in invalid state for '{}'", hash))
        }
    }

    /// Processes one close request: park, flush-and-park, or really close,
    /// per the staleness policy. Always releases the hash at the end.
    pub fn process_close(&self, closer: usize, request: CloseRequest) -> bool {
        let CloseRequest {
            mut file,
            force,
            reply,
        } = request;
        let hash = file.hash().to_string();

        let mut force = force
            || self.shutting_down()
            || self.open_files.load(Ordering::Acquire) >= self.max_open_files;

        let mut result: Result<()> = Ok(());
        if !force {
            if let Some(entry) = self.entries.lock().get_mut(&hash) {
                entry.owner = Owner::Flushing;
            }
            let since_flush = unix_secs() - file.time_flush();
            if since_flush >= self.flush_interval_secs {
                if file.written() <= OV_RESERVE_END {
                    // Nothing but footer rewrites since the last flush; not
                    // worth keeping the map around.
                    force = true;
                } else {
                    result = file.update_footer().and_then(|_| file.flush());
                    match &result {
                        Ok(()) => {
                            self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => self.kill("close flush"),
                    }
                }
            }
        }

        let parked = if !force && result.is_ok() {
            match self.park(file) {
                Ok(()) => true,
                Err(e) => {
                    result = Err(e);
                    // The file was consumed by the failed park; fall through
                    // to unlock below.
                    self.open_files.fetch_sub(1, Ordering::AcqRel);
                    false
                }
            }
        } else {
            let close_result = file.close(true);
            if let Err(e) = &close_result {
                error!(closer, hash = %hash, "close failed: {e:#}");
            }
            if result.is_ok() {
                result = close_result;
            }
            self.open_files.fetch_sub(1, Ordering::AcqRel);
            self.stats.files_closed.fetch_add(1, Ordering::Relaxed);
            if force {
                self.stats.forced_closes.fetch_add(1, Ordering::Relaxed);
            }
            self.entries.lock().remove(&hash);
            false
        };

        debug!(closer, hash = %hash, parked, force, "close request done");
        self.locks.unlock(&hash);

        let ok = result.is_ok();
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        ok
    }

    /// Background sweep: flush/close parked maps whose last flush is older
    /// than the flush interval, and drain everything on shutdown. Sleep
    /// self-tunes between [`SWEEP_SLEEP_MIN_MS`] and [`SWEEP_SLEEP_MAX_MS`]
    /// based on load.
    pub fn check_idle(&self, close_tx: &Sender<CloseRequest>) {
        let mut sleep_ms = SWEEP_SLEEP_MAX_MS;
        let mut stalled = 0u32;
        loop {
            let len = self.len();
            if len < self.max_open_files / 2 {
                sleep_ms = (sleep_ms + 1).min(SWEEP_SLEEP_MAX_MS);
            } else {
                sleep_ms = sleep_ms.saturating_sub(2).max(SWEEP_SLEEP_MIN_MS);
            }

            let stopping = self.shutting_down();
            if stopping && len == 0 {
                debug!("idle sweeper drained, exiting");
                return;
            }
            std::thread::sleep(Duration::from_millis(if stopping { 1 } else { sleep_ms }));

            match self.pick_idle(stopping) {
                Some(request) => {
                    stalled = 0;
                    if close_tx.send(request).is_err() {
                        warn!("close channel gone, idle sweeper exiting");
                        return;
                    }
                }
                None if stopping => {
                    // Entries still checked out (or leaked by a protocol
                    // violation) cannot be swept; do not hang the shutdown
                    // on them forever.
                    stalled += 1;
                    if stalled > 10_000 {
                        warn!(left = self.len(), "idle sweeper giving up on drain");
                        return;
                    }
                }
                None => {}
            }
        }
    }

    /// Finds one sweepable entry, claims its resource lock without
    /// queueing, and converts it into a forced close request.
    fn pick_idle(&self, stopping: bool) -> Option<CloseRequest> {
        let now = unix_secs();
        let mut entries = self.entries.lock();

        let mut victim = None;
        let mut mismatch = false;
        for (hash, entry) in entries.iter() {
            if entry.owner != Owner::Idle || entry.file.is_none() {
                continue;
            }
            let file = entry.file.as_ref().expect("checked above");
            if file.hash() != hash {
                mismatch = true;
                break;
            }
            let since_flush = now - file.time_flush();
            if (stopping || since_flush > self.flush_interval_secs) && self.locks.try_lock(hash) {
                victim = Some(hash.clone());
                break;
            }
        }
        if mismatch {
            drop(entries);
            self.kill("check_idle hash mismatch");
            return None;
        }

        let hash = victim?;
        let entry = entries.get_mut(&hash).expect("victim entry exists");
        entry.owner = Owner::Closing;
        let file = entry.file.take().expect("victim holds a file");
        Some(CloseRequest {
            file,
            force: true,
            reply: None,
        })
    }
}

/// Opener pool body: drains open requests until the channel closes.
pub fn run_opener(registry: Arc<HandleRegistry>, opener: usize, rx: Receiver<OpenRequest>) {
    debug!(opener, "opener started");
    while let Ok(request) = rx.recv() {
        let result = registry.get_open(request.worker, &request.path, &request.hash);
        if let Err(e) = &result {
            warn!(opener, hash = %request.hash, "open failed: {e:#}");
        }
        let _ = request.reply.send(result);
    }
    debug!(opener, "opener exiting");
}

/// Closer pool body: drains close requests until the channel closes.
pub fn run_closer(registry: Arc<HandleRegistry>, closer: usize, rx: Receiver<CloseRequest>) {
    debug!(closer, "closer started");
    let mut errors = 0u64;
    while let Ok(request) = rx.recv() {
        if !registry.process_close(closer, request) {
            errors += 1;
        }
    }
    if errors > 0 {
        warn!(closer, errors, "closer exiting with errors");
    } else {
        debug!(closer, "closer exiting");
    }
}
