//! Fan-out write pipeline.
//!
//! A fixed pool of workers drains the bounded record intake. Each record is
//! serialized once, then appended to every target newsgroup's overview
//! file, one branch per group. A branch acquires an admission token (the
//! global bound on concurrently mapped files), routes its open through the
//! opener pool, appends exactly one line, checkpoints the footer, and
//! hands the file to the closer pool, which parks or really closes it.
//!
//! A failed branch reports `ok = false` and is never retried here; the
//! other branches of the same record proceed. Partial success across a
//! multi-group post is expected.

use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use eyre::{eyre, Result};
use tracing::{debug, warn};

use crate::record::{group_hash, serialize_fields, GroupResult, OverviewRecord, MAX_NEWSGROUPS};
use crate::storage::{OVERVIEW_EXTENSION, XREF_PREFIX};

use super::registry::{CloseRequest, HandleRegistry, OpenRequest};

/// One queued record plus the channel its per-group results go back on.
pub struct Job {
    pub record: OverviewRecord,
    pub reply: Sender<Vec<GroupResult>>,
}

/// Everything a worker branch needs, shared across the pool.
pub struct WorkerCtx {
    pub registry: Arc<HandleRegistry>,
    pub open_tx: Sender<OpenRequest>,
    pub close_tx: Sender<CloseRequest>,
    /// Admission semaphore: recv = acquire, send = release.
    pub slots_tx: Sender<()>,
    pub slots_rx: Receiver<()>,
    pub base_dir: PathBuf,
    pub fanout_threads: bool,
}

/// Returns the admission token on drop so error paths cannot leak a slot.
struct SlotToken<'a> {
    tx: &'a Sender<()>,
}

impl Drop for SlotToken<'_> {
    fn drop(&mut self) {
        let _ = self.tx.send(());
    }
}

/// Worker pool body: drains jobs until the intake closes.
pub fn run_worker(ctx: Arc<WorkerCtx>, worker: usize, jobs: Receiver<Job>) {
    debug!(worker, "overview worker started");
    while let Ok(job) = jobs.recv() {
        let results = process_record(&ctx, worker, &job.record);
        let _ = job.reply.send(results);
    }
    debug!(worker, "overview worker done");
}

/// Serializes the record once and fans it out to every target group.
pub fn process_record(ctx: &WorkerCtx, worker: usize, record: &OverviewRecord) -> Vec<GroupResult> {
    let groups: Vec<&str> = record
        .newsgroups
        .iter()
        .take(MAX_NEWSGROUPS)
        .map(String::as_str)
        .collect();

    let fields = match serialize_fields(record) {
        Ok(fields) => fields,
        Err(e) => {
            warn!(worker, msgid = %record.message_id, "unserializable record: {e:#}");
            return groups
                .iter()
                .map(|g| GroupResult::failed(g, &group_hash(g)))
                .collect();
        }
    };

    let fields: &str = &fields;
    if ctx.fanout_threads && groups.len() > 1 {
        std::thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|&group| scope.spawn(move || append_one(ctx, worker, group, fields)))
                .collect();
            handles
                .into_iter()
                .zip(&groups)
                .map(|(handle, group)| {
                    handle
                        .join()
                        .unwrap_or_else(|_| GroupResult::failed(group, &group_hash(group)))
                })
                .collect()
        })
    } else {
        groups
            .iter()
            .map(|&group| append_one(ctx, worker, group, fields))
            .collect()
    }
}

/// Appends one record line to one newsgroup's overview file.
fn append_one(ctx: &WorkerCtx, worker: usize, group: &str, fields: &str) -> GroupResult {
    let hash = group_hash(group);
    let path = ctx
        .base_dir
        .join(format!("{}.{}", hash, OVERVIEW_EXTENSION));

    if ctx.slots_rx.recv().is_err() {
        return GroupResult::failed(group, &hash);
    }
    let _token = SlotToken { tx: &ctx.slots_tx };

    match append_locked(ctx, worker, group, &hash, path, fields) {
        Ok(article) => GroupResult {
            ok: true,
            article,
            group: group.to_string(),
            hash,
        },
        Err(e) => {
            warn!(worker, group, "append failed: {e:#}");
            GroupResult::failed(group, &hash)
        }
    }
}

fn append_locked(
    ctx: &WorkerCtx,
    worker: usize,
    group: &str,
    hash: &str,
    path: PathBuf,
    fields: &str,
) -> Result<u64> {
    let (reply_tx, reply_rx) = bounded(1);
    ctx.open_tx
        .send(OpenRequest {
            worker,
            hash: hash.to_string(),
            path,
            reply: reply_tx,
        })
        .map_err(|_| eyre!("opener pool is gone"))?;
    let mut file = reply_rx
        .recv()
        .map_err(|_| eyre!("opener dropped the reply"))??;

    if file.last() == 0 {
        file.set_last(1);
    }
    let article = file.last();
    let line = format!(
        "{}\t{}\t{} {}:{}\n",
        article, fields, XREF_PREFIX, group, article
    );

    // From here the handle must always reach the registry again; a lost
    // handle would strand the resource lock.
    let mut file = match file.append_line(line.as_bytes()) {
        Ok(file) => file,
        Err(e) => {
            ctx.registry.discard(worker, hash);
            return Err(e);
        }
    };
    if let Err(e) = file.update_footer() {
        let _ = close_roundtrip(ctx, file, true);
        return Err(e);
    }
    file.set_last(article + 1);

    close_roundtrip(ctx, file, false)?;
    Ok(article)
}

/// Sends a close request and waits for the closer's verdict.
fn close_roundtrip(
    ctx: &WorkerCtx,
    file: crate::storage::OverviewFile,
    force: bool,
) -> Result<()> {
    let (reply_tx, reply_rx) = bounded(1);
    ctx.close_tx
        .send(CloseRequest {
            file,
            force,
            reply: Some(reply_tx),
        })
        .map_err(|_| eyre!("closer pool is gone"))?;
    reply_rx
        .recv()
        .map_err(|_| eyre!("closer dropped the reply"))?
}
