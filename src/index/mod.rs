//! # Sparse Offset Index
//!
//! Random lookup by article number would otherwise mean a linear scan from
//! the body start. The index is sparse on purpose: one entry per hundred
//! article numbers is enough to land a scan within ~100 records of its
//! target, and keeps the cache small enough to hold thousands of groups.
//!
//! Two layers:
//!
//! - **In-memory cache** ([`OverviewIndex`]): `(group, floor(n/100)*100)`
//!   → byte offset, capped in both dimensions. Group eviction drops the
//!   oldest-inserted group (unless it is the one just re-touched); offset
//!   eviction drops one arbitrary entry.
//! - **On-disk sidecar** (`<file>.Index`): append-only lines
//!   `|fromArticle|toArticle|fromOffset|toOffset|`, written by the
//!   index-building scan and consulted before any linear walk. A missing
//!   sidecar is built lazily by the auto-index worker.

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};
use eyre::{bail, Result, WrapErr};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::storage::unix_secs;

/// Articles per index entry; offsets exist only for multiples of this.
pub const INDEX_STEP: u64 = 100;
/// Default maximum number of groups tracked by the cache.
pub const DEFAULT_GROUP_CAP: usize = 4096;
/// Default maximum offsets kept per group.
pub const DEFAULT_OFFSET_CAP: usize = 4096;
/// File name suffix of the on-disk sidecar.
pub const INDEX_SUFFIX: &str = ".Index";

/// One cached byte offset and its insertion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedOffset {
    pub offset: u64,
    pub created: i64,
}

/// One sidecar line: a block of up to [`INDEX_STEP`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpan {
    pub from_article: u64,
    pub to_article: u64,
    pub from_offset: u64,
    pub to_offset: u64,
}

struct Inner {
    map: HashMap<String, HashMap<u64, CachedOffset>>,
    order: VecDeque<String>,
}

pub struct OverviewIndex {
    inner: RwLock<Inner>,
    group_cap: usize,
    offset_cap: usize,
}

impl Default for OverviewIndex {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_GROUP_CAP, DEFAULT_OFFSET_CAP)
    }
}

impl OverviewIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(group_cap: usize, offset_cap: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            group_cap,
            offset_cap,
        }
    }

    /// Unconditionally stores the offset for a floored article number.
    pub fn set(&self, group: &str, floored: u64, offset: u64) {
        let mut inner = self.inner.write();

        if inner.map.len() >= self.group_cap && !inner.map.contains_key(group) {
            // Drop the oldest-inserted group, unless it is the group being
            // touched right now, which instead moves to the back.
            for _ in 0..inner.order.len() {
                let old = match inner.order.pop_front() {
                    Some(old) => old,
                    None => break,
                };
                if old == group {
                    inner.order.push_back(old);
                    continue;
                }
                let removed = inner.map.remove(&old).is_some();
                if removed {
                    break;
                }
            }
        }

        let offset_cap = self.offset_cap;
        let offsets = inner.map.entry(group.to_string()).or_default();
        if offsets.len() >= offset_cap && !offsets.contains_key(&floored) {
            if let Some(&evict) = offsets.keys().next() {
                offsets.remove(&evict);
            }
        }
        offsets.insert(
            floored,
            CachedOffset {
                offset,
                created: unix_secs(),
            },
        );
        inner.order.push_back(group.to_string());
    }

    /// Returns the best known offset at or below `article`, flooring to the
    /// nearest hundred and falling back one step. Articles at or below
    /// [`INDEX_STEP`] always scan from the body start.
    pub fn get(&self, group: &str, article: u64) -> Option<u64> {
        if article <= INDEX_STEP {
            return None;
        }
        let floored = article / INDEX_STEP * INDEX_STEP;

        let inner = self.inner.read();
        let offsets = inner.map.get(group)?;
        if let Some(cached) = offsets.get(&floored) {
            return Some(cached.offset);
        }
        if floored >= 2 * INDEX_STEP {
            if let Some(cached) = offsets.get(&(floored - INDEX_STEP)) {
                return Some(cached.offset);
            }
        }
        None
    }

    /// Drops one cached offset, or a group's whole cache when `floored` is
    /// zero.
    pub fn drop_entry(&self, group: &str, floored: u64) {
        let mut inner = self.inner.write();
        if floored == 0 {
            inner.map.remove(group);
            inner.order.retain(|g| g != group);
        } else if let Some(offsets) = inner.map.get_mut(group) {
            offsets.remove(&floored);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn groups(&self) -> usize {
        self.inner.read().map.len()
    }
}

/// Path of the sidecar for an overview file.
pub fn index_path(overview: &Path) -> PathBuf {
    let mut name = overview.as_os_str().to_os_string();
    name.push(INDEX_SUFFIX);
    PathBuf::from(name)
}

/// Appends one span line to a sidecar file, creating it when missing.
pub fn append_span(index_file: &Path, span: &IndexSpan) -> Result<()> {
    let mut fh = OpenOptions::new()
        .append(true)
        .create(true)
        .open(index_file)
        .wrap_err_with(|| format!("failed to open index '{}'", index_file.display()))?;
    writeln!(
        fh,
        "|{}|{}|{}|{}|",
        span.from_article, span.to_article, span.from_offset, span.to_offset
    )
    .wrap_err_with(|| format!("failed to append to index '{}'", index_file.display()))?;
    Ok(())
}

fn parse_span(line: &str) -> Result<IndexSpan> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 6 || !parts[0].is_empty() || !parts[5].is_empty() {
        bail!("malformed index line '{}'", line);
    }
    Ok(IndexSpan {
        from_article: parts[1].parse()?,
        to_article: parts[2].parse()?,
        from_offset: parts[3].parse()?,
        to_offset: parts[4].parse()?,
    })
}

/// Looks up a starting offset for `article` in the sidecar of `overview`,
/// populating the cache with every span read on the way. Returns `None`
/// when no sidecar exists (optionally queueing an auto-index build) or no
/// span covers the article.
pub fn lookup_offset(
    overview: &Path,
    group: &str,
    article: u64,
    cache: &OverviewIndex,
    autoindex: Option<&Sender<AutoIndexRequest>>,
) -> Result<Option<u64>> {
    if let Some(offset) = cache.get(group, article) {
        return Ok(Some(offset));
    }

    let sidecar = index_path(overview);
    let fh = match std::fs::File::open(&sidecar) {
        Ok(fh) => fh,
        Err(_) => {
            if let Some(tx) = autoindex {
                let request = AutoIndexRequest {
                    overview: overview.to_path_buf(),
                    group: group.to_string(),
                };
                if tx.try_send(request).is_ok() {
                    debug!(group, "queued auto-index build");
                }
            }
            return Ok(None);
        }
    };

    let reader = BufReader::new(fh);
    for line in reader.lines() {
        let line = line.wrap_err_with(|| format!("read error in '{}'", sidecar.display()))?;
        if line.is_empty() {
            break;
        }
        let span = parse_span(&line)
            .wrap_err_with(|| format!("bad line in '{}'", sidecar.display()))?;

        if article < span.from_article {
            continue;
        }
        // A span starting at k*100+1 serves lookups flooring to k*100; a
        // span ending exactly on a hundred serves its own block. Offsets
        // for a cached key never point past the keyed article.
        if span.from_article > INDEX_STEP {
            cache.set(
                group,
                (span.from_article - 1) / INDEX_STEP * INDEX_STEP,
                span.from_offset,
            );
        }
        if span.to_article % INDEX_STEP == 0 {
            cache.set(group, span.to_article, span.to_offset);
        }

        if article >= span.from_article && article <= span.to_article {
            return Ok(Some(span.from_offset));
        }
    }
    Ok(None)
}

/// Request to build a missing sidecar in the background.
#[derive(Debug, Clone)]
pub struct AutoIndexRequest {
    pub overview: PathBuf,
    pub group: String,
}

/// Auto-index worker body: builds sidecars until the channel closes.
pub fn run_auto_indexer(cache: std::sync::Arc<OverviewIndex>, rx: Receiver<AutoIndexRequest>) {
    debug!("auto-indexer started");
    while let Ok(request) = rx.recv() {
        match crate::scan::build_index(&request.overview, &request.group, &cache) {
            Ok(spans) => debug!(group = %request.group, spans, "auto-index built"),
            Err(e) => warn!(group = %request.group, "auto-index failed: {e:#}"),
        }
    }
    debug!("auto-indexer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn get_floors_to_hundreds() {
        let index = OverviewIndex::new();
        index.set("g", 200, 5000);

        assert_eq!(index.get("g", 200), Some(5000));
        assert_eq!(index.get("g", 251), Some(5000));
        assert_eq!(index.get("g", 299), Some(5000));
        // One-step fallback from the 300 block.
        assert_eq!(index.get("g", 300), Some(5000));
        assert_eq!(index.get("g", 407), None);
    }

    #[test]
    fn get_below_step_misses() {
        let index = OverviewIndex::new();
        index.set("g", 100, 4000);
        assert_eq!(index.get("g", 50), None);
        assert_eq!(index.get("g", 100), None);
        assert_eq!(index.get("g", 101), Some(4000));
    }

    #[test]
    fn get_never_returns_unset_keys() {
        let index = OverviewIndex::new();
        assert_eq!(index.get("nope", 500), None);
        index.set("g", 200, 5000);
        assert_eq!(index.get("other", 200), None);
    }

    #[test]
    fn set_overwrites() {
        let index = OverviewIndex::new();
        index.set("g", 200, 1111);
        index.set("g", 200, 2222);
        assert_eq!(index.get("g", 222), Some(2222));
    }

    #[test]
    fn group_eviction_is_fifo() {
        let index = OverviewIndex::with_capacity(2, 16);
        index.set("first", 200, 1);
        index.set("second", 200, 2);
        index.set("third", 200, 3);

        assert_eq!(index.get("first", 200), None);
        assert_eq!(index.get("second", 200), Some(2));
        assert_eq!(index.get("third", 200), Some(3));
        assert_eq!(index.groups(), 2);
    }

    #[test]
    fn offset_eviction_keeps_cap() {
        let index = OverviewIndex::with_capacity(4, 3);
        for block in 1..=6u64 {
            index.set("g", block * 100, block * 1000);
        }
        let inner = index.inner.read();
        assert!(inner.map.get("g").unwrap().len() <= 3);
    }

    #[test]
    fn drop_entry_and_clear() {
        let index = OverviewIndex::new();
        index.set("g", 200, 5000);
        index.set("g", 300, 6000);
        index.drop_entry("g", 300);
        assert_eq!(index.get("g", 311), Some(5000)); // fallback to 200
        index.drop_entry("g", 0);
        assert_eq!(index.get("g", 222), None);
        index.set("h", 200, 1);
        index.clear();
        assert_eq!(index.groups(), 0);
    }

    #[test]
    fn sidecar_roundtrip() {
        let dir = tempdir().unwrap();
        let overview = dir.path().join("abc.overview");
        let sidecar = index_path(&overview);

        append_span(
            &sidecar,
            &IndexSpan {
                from_article: 1,
                to_article: 100,
                from_offset: 128,
                to_offset: 9000,
            },
        )
        .unwrap();
        append_span(
            &sidecar,
            &IndexSpan {
                from_article: 101,
                to_article: 200,
                from_offset: 9100,
                to_offset: 18000,
            },
        )
        .unwrap();

        let cache = OverviewIndex::new();
        let offset = lookup_offset(&overview, "g", 150, &cache, None).unwrap();
        assert_eq!(offset, Some(9100));

        // The read populated the cache for later hits.
        assert_eq!(cache.get("g", 150), Some(9100));
    }

    #[test]
    fn missing_sidecar_returns_none() {
        let dir = tempdir().unwrap();
        let overview = dir.path().join("abc.overview");
        let cache = OverviewIndex::new();
        assert_eq!(lookup_offset(&overview, "g", 150, &cache, None).unwrap(), None);
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(parse_span("|1|2|3|").is_err());
        assert!(parse_span("1|2|3|4").is_err());
        assert!(parse_span("|a|2|3|4|").is_err());
    }
}
