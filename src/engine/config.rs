//! Engine configuration.

use std::path::PathBuf;

use eyre::{ensure, Result};

/// Seconds a parked map may sit unflushed before the sweeper closes it.
pub const DEFAULT_FLUSH_INTERVAL_SECS: i64 = 15;
/// Body kibibytes allocated when a missing overview file is created.
pub const DEFAULT_INITIAL_PAGES: u64 = 3;

/// Tunables for [`crate::engine::Engine`].
///
/// `workers` drain the record intake; `openers`/`closers` size the pools
/// behind the open/close request channels and are floored to the worker
/// count; `max_open_files` bounds concurrently mapped overview files and is
/// the capacity of the admission token channel.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub base_dir: PathBuf,
    pub workers: usize,
    pub queue_size: usize,
    pub max_open_files: usize,
    pub openers: usize,
    pub closers: usize,
    pub flush_interval_secs: i64,
    pub initial_pages: u64,
    /// Fan a multi-group record out on transient threads instead of
    /// sequentially.
    pub fanout_threads: bool,
    pub index_group_cap: usize,
    pub index_offset_cap: usize,
}

impl EngineConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let workers = 4;
        Self {
            base_dir: base_dir.into(),
            workers,
            queue_size: workers * 2,
            max_open_files: 64,
            openers: workers,
            closers: workers,
            flush_interval_secs: DEFAULT_FLUSH_INTERVAL_SECS,
            initial_pages: DEFAULT_INITIAL_PAGES,
            fanout_threads: true,
            index_group_cap: crate::index::DEFAULT_GROUP_CAP,
            index_offset_cap: crate::index::DEFAULT_OFFSET_CAP,
        }
    }

    /// Applies the lower bounds the engine relies on and validates the
    /// base directory.
    pub fn validated(mut self) -> Result<Self> {
        ensure!(
            self.base_dir.is_dir(),
            "overview base directory '{}' does not exist",
            self.base_dir.display()
        );
        self.workers = self.workers.max(1);
        self.queue_size = self.queue_size.max(1);
        self.max_open_files = self.max_open_files.max(2);
        self.openers = self.openers.max(self.workers);
        self.closers = self.closers.max(self.workers);
        self.flush_interval_secs = self.flush_interval_secs.max(1);
        self.initial_pages = self.initial_pages.max(1);
        self.index_group_cap = self.index_group_cap.max(2);
        self.index_offset_cap = self.index_offset_cap.max(2);
        Ok(self)
    }
}
