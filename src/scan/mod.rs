//! # Read-Side Scans
//!
//! Scans walk an overview file outside the live registry: a private
//! read-only mapping, no resource lock, no handle state. The write path
//! guarantees that everything before the footer's cursor is stable, and a
//! scan never looks past the first NUL byte of the free region.
//!
//! A scan seeks close to its lower bound through the sparse index (memory
//! cache first, `.Index` sidecar second) and walks records forward from
//! there, projecting one output line per record in range. With a sink the
//! output is streamed and terminated by a single `.` line, the way an NNTP
//! responder hands lines to a connection.

mod rescan;

pub use rescan::{rescan, RescanMode, RescanReport};

use std::io::Write;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::Mmap;
use tracing::debug;

use crossbeam_channel::Sender;

use crate::index::{
    append_span, index_path, lookup_offset, AutoIndexRequest, IndexSpan, OverviewIndex, INDEX_STEP,
};
use crate::storage::{
    check_header, OVERVIEW_FIELDS, OV_RESERVE_BEG, OV_RESERVE_END,
};

/// Which projection of each record a scan emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanField {
    /// The whole raw record line.
    All,
    /// The message-id field alone.
    MessageId,
    Subject,
    From,
    Date,
    References,
    Bytes,
    Lines,
    Xref,
}

impl ScanField {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "all" => Self::All,
            "message-id" | "messageid" | "msgid" => Self::MessageId,
            "subject" => Self::Subject,
            "from" => Self::From,
            "date" => Self::Date,
            "references" => Self::References,
            "bytes" => Self::Bytes,
            "lines" => Self::Lines,
            "xref" => Self::Xref,
            _ => return None,
        })
    }

    fn project(&self, article: u64, fields: &[&str]) -> String {
        match self {
            Self::All => fields.join("\t"),
            Self::MessageId => fields[4].to_string(),
            Self::Subject => format!("{} {}", article, fields[1]),
            Self::From => format!("{} {}", article, fields[2]),
            Self::Date => format!("{} {}", article, fields[3]),
            Self::References => format!("{} {}", article, fields[5]),
            Self::Bytes => format!("{} {}", article, fields[6]),
            Self::Lines => format!("{} {}", article, fields[7]),
            Self::Xref => format!("{} {}", article, fields[8]),
        }
    }
}

fn map_readonly(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
    // SAFETY: Mmap::map is unsafe because the file could change under the
    // mapping. This is safe because:
    // 1. The write path only appends past the cursor and rewrites the
    //    footer; the scanned prefix is never rewritten in place
    // 2. The scan stops at the first NUL byte and never reads the footer
    //    region as record data
    let mmap = unsafe {
        Mmap::map(&file).wrap_err_with(|| format!("failed to map '{}'", path.display()))?
    };
    Ok(mmap)
}

/// Scans `group`'s overview file for articles in `[from, to]` (`to == 0`
/// means to the end), projecting each record per `field`.
///
/// With a sink the projected lines are streamed, terminated by a single
/// `.` line, and the returned buffer is empty; otherwise the lines are
/// buffered and returned. The cache, when given, is consulted for the
/// starting offset and fed while walking.
pub fn scan_overview(
    path: &Path,
    group: &str,
    from: u64,
    to: u64,
    field: ScanField,
    mut sink: Option<&mut dyn Write>,
    cache: Option<&OverviewIndex>,
) -> Result<Vec<String>> {
    scan_overview_indexed(path, group, from, to, field, sink.take(), cache, None)
}

/// [`scan_overview`] with an auto-index trigger: a sidecar miss queues a
/// background index build on `autoindex`.
#[allow(clippy::too_many_arguments)]
pub fn scan_overview_indexed(
    path: &Path,
    group: &str,
    from: u64,
    to: u64,
    field: ScanField,
    mut sink: Option<&mut dyn Write>,
    cache: Option<&OverviewIndex>,
    autoindex: Option<&Sender<AutoIndexRequest>>,
) -> Result<Vec<String>> {
    let from = from.max(1);
    ensure!(to == 0 || to >= from, "scan range {}..{} is empty", from, to);

    let mmap = map_readonly(path)?;
    let len = mmap.len();
    ensure!(
        len as u64 >= OV_RESERVE_BEG + OV_RESERVE_END + 1,
        "'{}' is too small to be an overview file",
        path.display()
    );
    ensure!(
        check_header(&mmap[..OV_RESERVE_BEG as usize]),
        "bad header tags in '{}'",
        path.display()
    );

    let body_end = len - OV_RESERVE_END as usize;
    let mut pos = OV_RESERVE_BEG as usize;
    if from > INDEX_STEP {
        if let Some(cache) = cache {
            if let Some(offset) = lookup_offset(path, group, from, cache, autoindex)? {
                let offset = offset as usize;
                if offset >= pos && offset < body_end && mmap[offset] != 0 {
                    pos = offset;
                }
            }
        }
    }

    let mut out = Vec::new();
    let mut emitted = 0usize;
    while pos < body_end && mmap[pos] != 0 {
        let nl = match memchr::memchr(b'\n', &mmap[pos..body_end]) {
            Some(nl) => pos + nl,
            None => break,
        };
        let line = &mmap[pos..nl];
        let text = std::str::from_utf8(line)
            .map_err(|e| eyre::eyre!("non-utf8 record at offset {}: {}", pos, e))?;

        let fields: Vec<&str> = text.split('\t').collect();
        ensure!(
            fields.len() == OVERVIEW_FIELDS,
            "record at offset {} has {} fields, expected {}",
            pos,
            fields.len(),
            OVERVIEW_FIELDS
        );
        let article: u64 = fields[0]
            .parse()
            .map_err(|e| eyre::eyre!("bad article number at offset {}: {}", pos, e))?;

        if let Some(cache) = cache {
            if article % INDEX_STEP == 0 {
                cache.set(group, article, pos as u64);
            }
        }

        if to != 0 && article > to {
            break;
        }
        if article >= from {
            let projected = field.project(article, &fields);
            match sink.as_deref_mut() {
                Some(sink) => {
                    sink.write_all(projected.as_bytes())?;
                    sink.write_all(b"\n")?;
                }
                None => out.push(projected),
            }
            emitted += 1;
        }
        pos = nl + 1;
    }

    if let Some(sink) = sink.as_deref_mut() {
        sink.write_all(b".\n")?;
    }
    debug!(group, from, to, emitted, "scan done");
    Ok(out)
}

/// Builds the `.Index` sidecar for an overview file by walking every
/// record, one span per [`INDEX_STEP`] articles plus a final partial span.
/// Returns the number of spans written. Refuses to overwrite an existing
/// sidecar.
pub fn build_index(path: &Path, group: &str, cache: &OverviewIndex) -> Result<usize> {
    let sidecar = index_path(path);
    ensure!(
        !sidecar.exists(),
        "index '{}' already exists",
        sidecar.display()
    );

    let mmap = map_readonly(path)?;
    let len = mmap.len();
    ensure!(
        len as u64 >= OV_RESERVE_BEG + OV_RESERVE_END + 1 && check_header(&mmap[..OV_RESERVE_BEG as usize]),
        "'{}' is not a valid overview file",
        path.display()
    );

    let body_end = len - OV_RESERVE_END as usize;
    let mut pos = OV_RESERVE_BEG as usize;
    let mut spans = 0usize;
    let mut open: Option<IndexSpan> = None;

    while pos < body_end && mmap[pos] != 0 {
        let nl = match memchr::memchr(b'\n', &mmap[pos..body_end]) {
            Some(nl) => pos + nl,
            None => break,
        };
        let line = &mmap[pos..nl];
        let field = line.split(|&b| b == b'\t').next().unwrap_or_default();
        let article: u64 = std::str::from_utf8(field)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| eyre::eyre!("bad article number at offset {}", pos))?;

        let span = open.get_or_insert(IndexSpan {
            from_article: article,
            to_article: article,
            from_offset: pos as u64,
            to_offset: pos as u64,
        });
        span.to_article = article;
        span.to_offset = pos as u64;

        if article % INDEX_STEP == 0 {
            append_span(&sidecar, span)?;
            cache.set(group, article, pos as u64);
            spans += 1;
            open = None;
        }
        pos = nl + 1;
    }

    if let Some(span) = open {
        append_span(&sidecar, &span)?;
        spans += 1;
    }
    if spans == 0 {
        bail!("'{}' has no records to index", path.display());
    }
    Ok(spans)
}
