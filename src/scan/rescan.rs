//! Offline overview verifier and footer repair.
//!
//! Rescan replays the byte format from scratch against a raw mapping,
//! bypassing the live registry entirely: header tag, record framing
//! (newline/tab accounting), per-field semantics in the deep modes, and a
//! cross-check of the footer checkpoint against what the walk derived
//! independently. Non-repair modes never mutate the file; repair mode
//! zero-fills a dangling partial record and reconstructs the footer in
//! place.

use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::{debug, info, warn};

use crate::record::{is_valid_group_name, is_valid_msgid};
use crate::storage::{
    build_footer, check_footer, check_header, parse_footer, unix_nanos, OVERVIEW_FIELDS,
    OVERVIEW_TABS, OV_RESERVE_BEG, OV_RESERVE_END, XREF_PREFIX,
};

/// Verification depth / repair selector. The numeric codes are the CLI
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescanMode {
    /// 0: full walk with field-level verification, footer checked both
    /// before and after.
    FullVerify,
    /// 1: header tags only.
    HeaderOnly,
    /// 2: footer tags only.
    FooterOnly,
    /// 3: header + footer tags + record framing and line counting.
    CountLines,
    /// 4: full field-level walk, footer cross-checked only after the walk.
    VerifyThenFooter,
    /// 997: framing walk returning the last article, for fast external
    /// rebuilds.
    RebuildFast,
    /// 998: field-verifying walk returning the last article, for deep
    /// external rebuilds.
    RebuildDeep,
    /// 999: like 4, but a dangling partial record is truncated and the
    /// footer rebuilt in place.
    RepairFooter,
}

impl RescanMode {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::FullVerify,
            1 => Self::HeaderOnly,
            2 => Self::FooterOnly,
            3 => Self::CountLines,
            4 => Self::VerifyThenFooter,
            997 => Self::RebuildFast,
            998 => Self::RebuildDeep,
            999 => Self::RepairFooter,
            _ => return None,
        })
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::FullVerify => 0,
            Self::HeaderOnly => 1,
            Self::FooterOnly => 2,
            Self::CountLines => 3,
            Self::VerifyThenFooter => 4,
            Self::RebuildFast => 997,
            Self::RebuildDeep => 998,
            Self::RepairFooter => 999,
        }
    }

    fn is_repair(&self) -> bool {
        matches!(self, Self::RepairFooter)
    }

    fn checks_fields(&self) -> bool {
        matches!(
            self,
            Self::FullVerify | Self::VerifyThenFooter | Self::RebuildDeep | Self::RepairFooter
        )
    }

    /// Modes that tag-check the footer before walking the body.
    fn early_footer(&self) -> bool {
        matches!(
            self,
            Self::FullVerify | Self::FooterOnly | Self::CountLines | Self::RebuildFast | Self::RebuildDeep
        )
    }
}

/// Outcome of a rescan: structural validity plus the last article number
/// the walk confirmed, a known-good resume point for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RescanReport {
    pub ok: bool,
    pub last_article: u64,
}

impl RescanReport {
    fn bad(last_article: u64) -> Self {
        Self {
            ok: false,
            last_article,
        }
    }

    fn good(last_article: u64) -> Self {
        Self {
            ok: true,
            last_article,
        }
    }
}

/// Validates (and in mode 999 repairs) one overview file.
///
/// `Err` means the file could not be opened or mapped at all; structural
/// violations are reported through `RescanReport::ok` so the caller keeps
/// the last valid article number.
pub fn rescan(path: &Path, group: &str, mode: RescanMode, debug: bool) -> Result<RescanReport> {
    info!(path = %path.display(), group, mode = mode.code(), "rescan start");

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(mode.is_repair())
        .open(path)
        .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
    let len = file.metadata()?.len() as usize;
    ensure!(
        len as u64 >= OV_RESERVE_BEG + OV_RESERVE_END + 1,
        "'{}' is too small ({} bytes) to be an overview file",
        path.display(),
        len
    );

    // SAFETY: map_copy gives a private copy-on-write view for the read-only
    // modes, so nothing this walk does can reach the file; repair mode maps
    // shared, and the offline contract is that nothing else has the file
    // open. Either way the mapping lives only for this call.
    let mut mmap = unsafe {
        if mode.is_repair() {
            MmapMut::map_mut(&file)
        } else {
            memmap2::MmapOptions::new().map_copy(&file)
        }
    }
    .wrap_err_with(|| format!("failed to map '{}'", path.display()))?;

    // Header tags.
    if !matches!(mode, RescanMode::FooterOnly) {
        if !check_header(&mmap[..OV_RESERVE_BEG as usize]) {
            warn!(path = %path.display(), "header tags invalid");
            return Ok(RescanReport::bad(0));
        }
    }
    if matches!(mode, RescanMode::HeaderOnly) {
        return Ok(RescanReport::good(0));
    }

    // Early footer tag check.
    if mode.early_footer() && !check_footer(&mmap[len - OV_RESERVE_END as usize..]) {
        warn!(path = %path.display(), "footer tags invalid");
        return Ok(RescanReport::bad(0));
    }
    if matches!(mode, RescanMode::FooterOnly) {
        return Ok(RescanReport::good(0));
    }

    let walk = match walk_body(&mmap, group, mode, debug) {
        Ok(walk) => walk,
        Err(e) => {
            warn!(path = %path.display(), "body walk failed: {e:#}");
            return Ok(RescanReport::bad(0));
        }
    };
    if debug {
        debug!(
            lines = walk.lines,
            last_article = walk.last_article,
            findex = walk.findex,
            dangling = walk.dangling_len,
            "body walk done"
        );
    }

    let footer_ok = check_walked_footer(&mmap, len, &walk, path);
    let clean = footer_ok && walk.dangling_len == 0 && walk.gibberish == 0;

    if clean {
        info!(path = %path.display(), last_article = walk.last_article, "rescan ok");
        return Ok(RescanReport::good(walk.last_article));
    }
    if !mode.is_repair() {
        warn!(
            path = %path.display(),
            footer_ok,
            dangling = walk.dangling_len,
            gibberish = walk.gibberish,
            "rescan found structural violations"
        );
        return Ok(RescanReport::bad(walk.last_article));
    }

    // Repair: zero everything past the last complete record, rebuild the
    // footer from the derived values, and re-validate.
    let body_end = len - OV_RESERVE_END as usize;
    mmap[walk.findex as usize..body_end].fill(0);
    let last = if walk.lines == 0 { 0 } else { walk.last_article + 1 };
    let footer = build_footer(
        unix_nanos(),
        last,
        walk.findex,
        body_end as u64,
        len as u64,
    )?;
    mmap[body_end..].copy_from_slice(&footer);
    mmap.flush()
        .wrap_err_with(|| format!("failed to flush repaired '{}'", path.display()))?;
    info!(
        path = %path.display(),
        last,
        findex = walk.findex,
        truncated = walk.dangling_len + walk.gibberish,
        "footer repaired"
    );
    Ok(RescanReport::good(walk.last_article))
}

struct BodyWalk {
    lines: u64,
    last_article: u64,
    /// Derived write cursor: one past the last complete record.
    findex: u64,
    /// Bytes of an unterminated trailing record.
    dangling_len: usize,
    /// Non-NUL bytes found inside the free region.
    gibberish: usize,
}

/// Walks the body region record by record, enforcing framing and, in the
/// deep modes, field semantics.
fn walk_body(buf: &[u8], group: &str, mode: RescanMode, debug: bool) -> Result<BodyWalk> {
    let body_end = buf.len() - OV_RESERVE_END as usize;
    let mut pos = OV_RESERVE_BEG as usize;
    let mut lines = 0u64;
    let mut last_article = 0u64;
    let mut seen_msgids = std::collections::HashSet::new();

    let (findex, dangling_len, gibberish) = loop {
        if pos >= body_end {
            // Body packed to the brim; the cursor sits on the boundary.
            break (pos as u64, 0, 0);
        }
        if buf[pos] == 0 {
            // Free region. Everything up to the footer must be NUL.
            let gibberish = buf[pos..body_end].iter().filter(|&&b| b != 0).count();
            break (pos as u64, 0, gibberish);
        }

        let nl = match memchr::memchr(b'\n', &buf[pos..body_end]) {
            Some(nl) => pos + nl,
            None => {
                // Unterminated trailing record.
                let end = memchr::memchr(0, &buf[pos..body_end])
                    .map(|i| pos + i)
                    .unwrap_or(body_end);
                let gibberish = buf[end..body_end].iter().filter(|&&b| b != 0).count();
                break (pos as u64, end - pos, gibberish);
            }
        };

        let line = &buf[pos..nl];
        let text = std::str::from_utf8(line)
            .map_err(|e| eyre::eyre!("non-utf8 record at offset {}: {}", pos, e))?;
        let tabs = line.iter().filter(|&&b| b == b'\t').count();
        ensure!(
            tabs == OVERVIEW_TABS,
            "record at offset {} has {} tabs, expected {}",
            pos,
            tabs,
            OVERVIEW_TABS
        );

        let fields: Vec<&str> = text.split('\t').collect();
        ensure!(fields.len() == OVERVIEW_FIELDS, "field split mismatch");
        let article: u64 = fields[0]
            .parse()
            .map_err(|e| eyre::eyre!("bad article number at offset {}: {}", pos, e))?;
        ensure!(
            article == last_article + 1,
            "article {} at offset {} breaks sequence after {}",
            article,
            pos,
            last_article
        );

        if mode.checks_fields() {
            verify_fields(&fields, article, group, pos)?;
            let msgid = fields[4].to_string();
            ensure!(
                seen_msgids.insert(msgid),
                "duplicate message-id '{}' at offset {}",
                fields[4],
                pos
            );
        }
        if debug && article % 1000 == 0 {
            debug!(article, pos, "walked");
        }

        last_article = article;
        lines += 1;
        pos = nl + 1;
    };

    Ok(BodyWalk {
        lines,
        last_article,
        findex,
        dangling_len,
        gibberish,
    })
}

/// Field-level semantic checks applied by the deep modes.
fn verify_fields(fields: &[&str], article: u64, group: &str, pos: usize) -> Result<()> {
    ensure!(
        is_valid_msgid(fields[4]),
        "invalid message-id '{}' at offset {}",
        fields[4],
        pos
    );
    let bytes: u64 = fields[6]
        .parse()
        .map_err(|e| eyre::eyre!("bad byte count at offset {}: {}", pos, e))?;
    let line_count: u64 = fields[7]
        .parse()
        .map_err(|e| eyre::eyre!("bad line count at offset {}: {}", pos, e))?;
    ensure!(
        bytes > 0 && line_count > 0,
        "zero byte/line count at offset {}",
        pos
    );

    let xrefs: Vec<&str> = fields[8].split(' ').collect();
    ensure!(
        xrefs.len() >= 2 && xrefs[0] == XREF_PREFIX,
        "xref at offset {} does not start with '{}'",
        pos,
        XREF_PREFIX
    );
    for (i, xref) in xrefs[1..].iter().enumerate() {
        let (xgroup, xarticle) = xref
            .split_once(':')
            .ok_or_else(|| eyre::eyre!("malformed xref '{}' at offset {}", xref, pos))?;
        ensure!(
            is_valid_group_name(xgroup),
            "invalid xref group '{}' at offset {}",
            xgroup,
            pos
        );
        if i == 0 && !group.is_empty() {
            ensure!(
                xgroup == group,
                "xref group '{}' at offset {} does not match '{}'",
                xgroup,
                pos,
                group
            );
        }
        let xarticle: u64 = xarticle
            .parse()
            .map_err(|e| eyre::eyre!("bad xref article at offset {}: {}", pos, e))?;
        ensure!(
            xarticle == article,
            "xref article {} at offset {} does not match {}",
            xarticle,
            pos,
            article
        );
    }
    Ok(())
}

/// Cross-checks the stored footer against what the walk derived.
fn check_walked_footer(buf: &[u8], len: usize, walk: &BodyWalk, path: &Path) -> bool {
    let foot = match parse_footer(&buf[len - OV_RESERVE_END as usize..]) {
        Ok(foot) => foot,
        Err(e) => {
            warn!(path = %path.display(), "footer parse failed: {e:#}");
            return false;
        }
    };

    let expected_last = if walk.lines == 0 {
        0
    } else {
        walk.last_article + 1
    };
    if foot.last != expected_last {
        warn!(
            path = %path.display(),
            stored = foot.last,
            derived = expected_last,
            "footer last mismatch"
        );
        return false;
    }
    if foot.findex != walk.findex {
        warn!(
            path = %path.display(),
            stored = foot.findex,
            derived = walk.findex,
            "footer Findex mismatch"
        );
        return false;
    }
    if foot.fend - foot.bodyend != OV_RESERVE_END
        || foot.bodyend != (len as u64 - OV_RESERVE_END)
        || foot.fend != len as u64
    {
        warn!(
            path = %path.display(),
            bodyend = foot.bodyend,
            fend = foot.fend,
            len,
            "footer boundary mismatch"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::OverviewFile;
    use tempfile::tempdir;

    fn test_hash() -> String {
        "ef".repeat(32)
    }

    fn build_file(dir: &Path, count: u64) -> std::path::PathBuf {
        let hash = test_hash();
        let path = dir.join(format!("{}.overview", hash));
        OverviewFile::create(&path, &hash, 4).unwrap();
        let mut ov = OverviewFile::open(&path, &hash).unwrap();
        for _ in 0..count {
            if ov.last() == 0 {
                ov.set_last(1);
            }
            let n = ov.last();
            let line = format!(
                "{}\tSubject {}\tposter@example.com\tThu, 01 Jan 2026 00:00:00 +0000\t<{}@example>\t\t100\t4\tnntp misc.test:{}\n",
                n, n, n, n
            );
            ov = ov.append_line(line.as_bytes()).unwrap();
            ov.update_footer().unwrap();
            ov.set_last(n + 1);
        }
        ov.close(true).unwrap();
        path
    }

    // Appends a partial record (no trailing newline) at the cursor without
    // updating the footer, simulating a crash mid-append.
    fn truncate_last_line(path: &Path) {
        let hash = test_hash();
        let ov = OverviewFile::open(path, &hash).unwrap();
        let findex = ov.findex() as usize;
        ov.close(false).unwrap();

        let mut data = std::fs::read(path).unwrap();
        let partial = b"999\tSubject partial\tposter@exa";
        data[findex..findex + partial.len()].copy_from_slice(partial);
        std::fs::write(path, &data).unwrap();
    }

    #[test]
    fn clean_file_passes_all_read_modes() {
        let dir = tempdir().unwrap();
        let path = build_file(dir.path(), 30);

        for code in [0u32, 1, 2, 3, 4, 997, 998] {
            let mode = RescanMode::from_code(code).unwrap();
            let report = rescan(&path, "misc.test", mode, false).unwrap();
            assert!(report.ok, "mode {} failed", code);
        }

        let report = rescan(&path, "misc.test", RescanMode::FullVerify, false).unwrap();
        assert_eq!(report.last_article, 30);
    }

    #[test]
    fn fresh_file_is_valid() {
        let dir = tempdir().unwrap();
        let hash = test_hash();
        let path = dir.path().join(format!("{}.overview", hash));
        OverviewFile::create(&path, &hash, 4).unwrap();

        let report = rescan(&path, "misc.test", RescanMode::FullVerify, false).unwrap();
        assert!(report.ok);
        assert_eq!(report.last_article, 0);
    }

    #[test]
    fn truncated_line_fails_then_repairs() {
        let dir = tempdir().unwrap();
        let path = build_file(dir.path(), 20);
        truncate_last_line(&path);

        // Mode 0 rejects the dangling record but reports the resume point.
        let report = rescan(&path, "misc.test", RescanMode::FullVerify, false).unwrap();
        assert!(!report.ok);
        assert_eq!(report.last_article, 20);

        // Mode 999 truncates and rebuilds the footer.
        let report = rescan(&path, "misc.test", RescanMode::RepairFooter, false).unwrap();
        assert!(report.ok);
        assert_eq!(report.last_article, 20);

        // The repaired file passes mode 0 and opens for writing again.
        let report = rescan(&path, "misc.test", RescanMode::FullVerify, false).unwrap();
        assert!(report.ok);
        let ov = OverviewFile::open(&path, &test_hash()).unwrap();
        assert_eq!(ov.last(), 21);
        ov.close(false).unwrap();
    }

    #[test]
    fn footer_last_mismatch_fails_closed() {
        let dir = tempdir().unwrap();
        let path = build_file(dir.path(), 10);

        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        let footer = build_footer(
            unix_nanos(),
            99,
            parse_footer(&data[len - OV_RESERVE_END as usize..]).unwrap().findex,
            (len as u64) - OV_RESERVE_END,
            len as u64,
        )
        .unwrap();
        data[len - OV_RESERVE_END as usize..].copy_from_slice(&footer);
        std::fs::write(&path, &data).unwrap();

        let report = rescan(&path, "misc.test", RescanMode::FullVerify, false).unwrap();
        assert!(!report.ok);
        assert_eq!(report.last_article, 10);
    }

    #[test]
    fn wrong_xref_group_fails_deep_modes_only() {
        let dir = tempdir().unwrap();
        let path = build_file(dir.path(), 5);

        let report = rescan(&path, "misc.other", RescanMode::CountLines, false).unwrap();
        assert!(report.ok);

        let report = rescan(&path, "misc.other", RescanMode::FullVerify, false).unwrap();
        assert!(!report.ok);
    }

    #[test]
    fn read_modes_never_mutate() {
        let dir = tempdir().unwrap();
        let path = build_file(dir.path(), 12);
        truncate_last_line(&path);
        let before = std::fs::read(&path).unwrap();

        for code in [0u32, 3, 4, 997, 998] {
            let mode = RescanMode::from_code(code).unwrap();
            let _ = rescan(&path, "misc.test", mode, false).unwrap();
        }
        assert_eq!(before, std::fs::read(&path).unwrap());
    }

    #[test]
    fn repair_reports_failure_on_malformed_complete_line() {
        let dir = tempdir().unwrap();
        let path = build_file(dir.path(), 5);

        // Break a tab in a complete mid-body record; repair cannot fix it.
        let mut data = std::fs::read(&path).unwrap();
        let body = OV_RESERVE_BEG as usize;
        let text = String::from_utf8_lossy(&data[body..]).to_string();
        let third = text.find("3\tSubject").unwrap() + body;
        let tab = data[third..].iter().position(|&b| b == b'\t').unwrap() + third;
        data[tab] = b' ';
        std::fs::write(&path, &data).unwrap();

        let report = rescan(&path, "misc.test", RescanMode::RepairFooter, false).unwrap();
        assert!(!report.ok);
    }
}
