//! The engine context: owns every moving part and its shutdown order.
//!
//! There is no package-level state anywhere in this crate. The registry,
//! lock table, index cache, and every channel are constructed by
//! [`Engine::start`], passed where they are needed, and torn down by
//! [`Engine::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use eyre::{ensure, eyre, Result};
use tracing::{debug, info, warn};

use crate::index::{run_auto_indexer, AutoIndexRequest, OverviewIndex};
use crate::record::{GroupResult, OverviewRecord};

use super::config::EngineConfig;
use super::pipeline::{run_worker, Job, WorkerCtx};
use super::registry::{run_closer, run_opener, CloseRequest, HandleRegistry, OpenRequest};

pub struct Engine {
    config: EngineConfig,
    registry: Arc<HandleRegistry>,
    index: Arc<OverviewIndex>,
    shutdown: Arc<AtomicBool>,
    jobs_tx: Option<Sender<Job>>,
    open_tx: Option<Sender<OpenRequest>>,
    close_tx: Option<Sender<CloseRequest>>,
    auto_tx: Option<Sender<AutoIndexRequest>>,
    workers: Vec<JoinHandle<()>>,
    openers: Vec<JoinHandle<()>>,
    closers: Vec<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    indexer: Option<JoinHandle<()>>,
}

impl Engine {
    /// Validates the configuration, builds the lock table, registry, index
    /// cache and channels, and spawns the worker, opener, closer, sweeper
    /// and auto-indexer threads.
    pub fn start(config: EngineConfig) -> Result<Self> {
        let config = config.validated()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(HandleRegistry::new(
            config.max_open_files,
            config.flush_interval_secs,
            config.initial_pages,
            Arc::clone(&shutdown),
        ));
        let index = Arc::new(OverviewIndex::with_capacity(
            config.index_group_cap,
            config.index_offset_cap,
        ));

        let (jobs_tx, jobs_rx) = bounded::<Job>(config.queue_size);
        let (open_tx, open_rx) = bounded::<OpenRequest>(config.max_open_files);
        let (close_tx, close_rx) = bounded::<CloseRequest>(config.max_open_files);
        let (auto_tx, auto_rx) = bounded::<AutoIndexRequest>(config.max_open_files);

        // Admission tokens: one per allowed concurrently-mapped file.
        let (slots_tx, slots_rx) = bounded::<()>(config.max_open_files);
        for _ in 0..config.max_open_files {
            slots_tx
                .send(())
                .map_err(|_| eyre!("failed to seed admission tokens"))?;
        }

        let ctx = Arc::new(WorkerCtx {
            registry: Arc::clone(&registry),
            open_tx: open_tx.clone(),
            close_tx: close_tx.clone(),
            slots_tx,
            slots_rx,
            base_dir: config.base_dir.clone(),
            fanout_threads: config.fanout_threads,
        });

        let workers = (0..config.workers)
            .map(|worker| {
                let ctx = Arc::clone(&ctx);
                let rx = jobs_rx.clone();
                std::thread::spawn(move || run_worker(ctx, worker, rx))
            })
            .collect();
        let openers = (0..config.openers)
            .map(|opener| {
                let registry = Arc::clone(&registry);
                let rx = open_rx.clone();
                std::thread::spawn(move || run_opener(registry, opener, rx))
            })
            .collect();
        let closers = (0..config.closers)
            .map(|closer| {
                let registry = Arc::clone(&registry);
                let rx = close_rx.clone();
                std::thread::spawn(move || run_closer(registry, closer, rx))
            })
            .collect();

        let sweeper = {
            let registry = Arc::clone(&registry);
            let close_tx = close_tx.clone();
            Some(std::thread::spawn(move || registry.check_idle(&close_tx)))
        };
        let indexer = {
            let index = Arc::clone(&index);
            Some(std::thread::spawn(move || run_auto_indexer(index, auto_rx)))
        };

        info!(
            workers = config.workers,
            max_open_files = config.max_open_files,
            base_dir = %config.base_dir.display(),
            "overview engine started"
        );

        Ok(Self {
            config,
            registry,
            index,
            shutdown,
            jobs_tx: Some(jobs_tx),
            open_tx: Some(open_tx),
            close_tx: Some(close_tx),
            auto_tx: Some(auto_tx),
            workers,
            openers,
            closers,
            sweeper,
            indexer,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn index(&self) -> &Arc<OverviewIndex> {
        &self.index
    }

    /// Sender used by read paths to request background index builds.
    pub fn auto_index_sender(&self) -> Option<&Sender<AutoIndexRequest>> {
        self.auto_tx.as_ref()
    }

    /// Queues one record for fan-out and returns the receiver its
    /// per-group results arrive on. Blocks while the intake is full.
    pub fn submit(&self, record: OverviewRecord) -> Result<Receiver<Vec<GroupResult>>> {
        ensure!(
            !self.shutdown.load(Ordering::Acquire),
            "engine is shutting down"
        );
        ensure!(
            !record.newsgroups.is_empty(),
            "record '{}' has no target newsgroups",
            record.message_id
        );

        let (reply_tx, reply_rx) = bounded(1);
        self.jobs_tx
            .as_ref()
            .ok_or_else(|| eyre!("engine intake is closed"))?
            .send(Job {
                record,
                reply: reply_tx,
            })
            .map_err(|_| eyre!("engine workers are gone"))?;
        Ok(reply_rx)
    }

    /// Reads records of `group` in `[from, to]` (`to == 0` means to the
    /// end) through the engine's index cache; a sidecar miss queues a
    /// background index build. Bypasses the registry, like every read path.
    pub fn scan(
        &self,
        group: &str,
        from: u64,
        to: u64,
        field: crate::scan::ScanField,
        sink: Option<&mut dyn std::io::Write>,
    ) -> Result<Vec<String>> {
        let hash = crate::record::group_hash(group);
        let path = self.config.base_dir.join(format!(
            "{}.{}",
            hash,
            crate::storage::OVERVIEW_EXTENSION
        ));
        crate::scan::scan_overview_indexed(
            &path,
            group,
            from,
            to,
            field,
            sink,
            Some(self.index.as_ref()),
            self.auto_tx.as_ref(),
        )
    }

    /// Orderly shutdown: close the intake, join the workers, then let the
    /// sweeper drain every parked map through the closers before the pools
    /// are joined. In-flight writes complete; nothing is interrupted
    /// mid-append.
    pub fn shutdown(mut self) -> Result<()> {
        debug!("engine shutdown: closing intake");
        self.jobs_tx.take();
        for handle in self.workers.drain(..) {
            handle.join().map_err(|_| eyre!("a worker panicked"))?;
        }

        self.shutdown.store(true, Ordering::Release);
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.join().map_err(|_| eyre!("the sweeper panicked"))?;
        }

        self.auto_tx.take();
        if let Some(indexer) = self.indexer.take() {
            indexer.join().map_err(|_| eyre!("the indexer panicked"))?;
        }

        self.open_tx.take();
        self.close_tx.take();
        for handle in self.openers.drain(..) {
            handle.join().map_err(|_| eyre!("an opener panicked"))?;
        }
        for handle in self.closers.drain(..) {
            handle.join().map_err(|_| eyre!("a closer panicked"))?;
        }

        if !self.registry.is_empty() {
            warn!(left = self.registry.len(), "registry not empty after drain");
        }
        info!(
            opened = self.registry.stats.files_opened.load(Ordering::Relaxed),
            closed = self.registry.stats.files_closed.load(Ordering::Relaxed),
            "overview engine stopped"
        );
        Ok(())
    }
}
