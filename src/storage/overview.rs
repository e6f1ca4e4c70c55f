//! `OverviewFile`: one live memory-mapped overview file.
//!
//! The handle owns the OS file and the writable mapping. It is moved, never
//! shared: the engine's per-hash resource lock decides *who* may hold it,
//! and the type system guarantees that whoever does is alone. `append_line`
//! and `grow` consume and return the handle because growth replaces the
//! mapping (unmap, extend on disk, remap); a caller can therefore never
//! retain a reference into a stale map.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use tracing::debug;

use super::{
    build_footer, build_header, check_footer, check_header, grow_block_size, parse_footer,
    replay_tail, unix_nanos, unix_secs, CREATE_PAGE_BYTES, OV_RESERVE_BEG, OV_RESERVE_END,
};

#[derive(Debug)]
pub struct OverviewFile {
    path: PathBuf,
    hash: String,
    file: File,
    mmap: MmapMut,
    findex: u64,
    last: u64,
    written: u64,
    time_open: i64,
    time_flush: i64,
}

impl OverviewFile {
    /// Creates a new overview file with an empty body of `pages` kibibytes.
    ///
    /// Refuses to overwrite an existing file. The file is written with
    /// buffered I/O and not mapped; call [`OverviewFile::open`] afterwards.
    pub fn create(path: &Path, hash: &str, pages: u64) -> Result<()> {
        ensure!(
            !path.exists(),
            "overview file '{}' already exists",
            path.display()
        );

        let body_size = pages.max(1) * CREATE_PAGE_BYTES;
        let bodyend = OV_RESERVE_BEG + body_size;
        let header = build_header(hash, unix_secs())?;
        let footer = build_footer(
            unix_nanos(),
            0,
            OV_RESERVE_BEG,
            bodyend,
            bodyend + OV_RESERVE_END,
        )?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create overview file '{}'", path.display()))?;
        let mut w = BufWriter::new(file);
        w.write_all(&header)?;
        w.write_all(&vec![0u8; body_size as usize])?;
        w.write_all(&footer)?;
        w.flush()
            .wrap_err_with(|| format!("failed to write overview file '{}'", path.display()))?;

        debug!(path = %path.display(), body_size, "created overview file");
        Ok(())
    }

    /// Opens and maps an existing overview file, validating the header and
    /// footer tags, the checkpoint invariants, and the body tail.
    pub fn open(path: &Path, hash: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open overview file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();
        ensure!(
            len >= OV_RESERVE_BEG + OV_RESERVE_END + 1,
            "overview file '{}' is too small ({} bytes)",
            path.display(),
            len
        );

        // SAFETY: MmapMut::map_mut is unsafe because the file could be
        // modified externally. This is safe because:
        // 1. The engine's per-hash resource lock admits one holder at a time
        // 2. Overview files are not modified by external processes
        // 3. The mapping's lifetime is tied to this OverviewFile
        // 4. All access goes through bounds-checked slices of the mapping
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        ensure!(
            check_header(&mmap[..OV_RESERVE_BEG as usize]),
            "bad header tags in '{}'",
            path.display()
        );
        let foot = parse_footer(&mmap[(len - OV_RESERVE_END) as usize..])
            .wrap_err_with(|| format!("bad footer in '{}'", path.display()))?;

        ensure!(
            foot.fend == len && foot.bodyend == len - OV_RESERVE_END,
            "footer boundaries bodyend={} fend={} do not match file length {} in '{}'",
            foot.bodyend,
            foot.fend,
            len,
            path.display()
        );
        ensure!(
            foot.findex >= OV_RESERVE_BEG && foot.findex <= foot.bodyend,
            "footer Findex={} outside body [{}, {}] in '{}'",
            foot.findex,
            OV_RESERVE_BEG,
            foot.bodyend,
            path.display()
        );
        ensure!(
            !(foot.findex > OV_RESERVE_BEG && foot.last == 0),
            "footer last=0 with Findex={} in '{}'",
            foot.findex,
            path.display()
        );

        let now = unix_secs();
        let mut ovfh = Self {
            path: path.to_path_buf(),
            hash: hash.to_string(),
            file,
            mmap,
            findex: foot.findex,
            last: foot.last,
            written: 0,
            time_open: now,
            time_flush: now,
        };

        // A fresh file has nothing to replay.
        if !(ovfh.last == 0 && ovfh.findex == OV_RESERVE_BEG) {
            let replay = replay_tail(&ovfh.mmap, ovfh.findex)
                .wrap_err_with(|| format!("tail replay failed for '{}'", path.display()))?;
            ensure!(
                replay.last_article == ovfh.last - 1,
                "tail article {} does not match footer last={} in '{}'",
                replay.last_article,
                ovfh.last,
                path.display()
            );
            ovfh.findex = replay.findex;
        }

        Ok(ovfh)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.last == 0
    }

    /// First byte past the writable body region.
    pub fn bodyend(&self) -> u64 {
        self.len() - OV_RESERVE_END
    }

    pub fn findex(&self) -> u64 {
        self.findex
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    pub fn set_last(&mut self, last: u64) {
        self.last = last;
    }

    /// Bytes written (body and footer) since the last flush.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn time_open(&self) -> i64 {
        self.time_open
    }

    pub fn time_flush(&self) -> i64 {
        self.time_flush
    }

    pub fn free_body_space(&self) -> u64 {
        self.bodyend() - self.findex
    }

    /// Appends one record line at the write cursor, growing first when the
    /// body is (nearly) full. Consumes and returns the handle because a
    /// grow replaces the mapping.
    pub fn append_line(mut self, line: &[u8]) -> Result<Self> {
        ensure!(!line.is_empty(), "refusing to append an empty line");
        ensure!(
            line.ends_with(b"\n"),
            "record line must end with a newline"
        );

        while self.free_body_space() <= 1 || self.findex + line.len() as u64 >= self.bodyend() {
            self = self.grow()?;
        }

        let start = self.findex as usize;
        self.mmap[start..start + line.len()].copy_from_slice(line);
        self.findex += line.len() as u64;
        self.written += line.len() as u64;
        Ok(self)
    }

    /// Rewrites the footer checkpoint from the current cursor and article
    /// counter. Never moves the write cursor.
    pub fn update_footer(&mut self) -> Result<()> {
        ensure!(
            self.findex >= OV_RESERVE_BEG && self.last > 0,
            "refusing footer update with Findex={} last={}",
            self.findex,
            self.last
        );
        let footer = build_footer(unix_nanos(), self.last, self.findex, self.bodyend(), self.len())?;
        let start = (self.len() - OV_RESERVE_END) as usize;
        self.mmap[start..].copy_from_slice(&footer);
        self.written += OV_RESERVE_END;
        Ok(())
    }

    /// Grows the file: checkpoint the footer, zero it out, unmap, extend on
    /// disk with a zero block and a fresh footer, remap.
    ///
    /// Each step's failure is independently observable through the error
    /// context. Growth is never in place.
    pub fn grow(mut self) -> Result<Self> {
        // 1. Checkpoint and verify both fixed regions before giving up the map.
        if self.last > 0 {
            self.update_footer().wrap_err("grow: footer checkpoint failed")?;
        }
        ensure!(
            check_header(&self.mmap[..OV_RESERVE_BEG as usize]),
            "grow: bad header tags in '{}'",
            self.path.display()
        );
        ensure!(
            check_footer(&self.mmap[(self.len() - OV_RESERVE_END) as usize..]),
            "grow: bad footer tags in '{}'",
            self.path.display()
        );

        // 2. The old footer region becomes body free space.
        let foot_start = (self.len() - OV_RESERVE_END) as usize;
        self.mmap[foot_start..].fill(0);
        self.mmap.flush().wrap_err("grow: flush before unmap failed")?;

        let old_len = self.len();
        let body_size = old_len - OV_RESERVE_BEG - OV_RESERVE_END;
        let block = grow_block_size(body_size);
        let Self {
            path,
            hash,
            file,
            mmap,
            findex,
            last,
            ..
        } = self;

        // 3. Unmap and close before touching the file on disk.
        drop(mmap);
        drop(file);

        // 4. Extend with a zero block and a fresh footer carrying the new
        //    boundaries.
        let bodyend = old_len + block;
        let fend = bodyend + OV_RESERVE_END;
        let footer = build_footer(unix_nanos(), last, findex, bodyend, fend)?;
        let fh = OpenOptions::new()
            .append(true)
            .open(&path)
            .wrap_err_with(|| format!("grow: failed to reopen '{}' for extension", path.display()))?;
        let mut w = BufWriter::new(fh);
        w.write_all(&vec![0u8; block as usize])?;
        w.write_all(&footer)?;
        w.flush()
            .wrap_err_with(|| format!("grow: failed to extend '{}'", path.display()))?;

        debug!(path = %path.display(), old_len, block, "grew overview file");

        // 5. Remap.
        Self::open(&path, &hash).wrap_err("grow: remap failed")
    }

    /// Flushes the mapping and resets the write accounting.
    pub fn flush(&mut self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to flush '{}'", self.path.display()))?;
        self.time_flush = unix_secs();
        self.written = 0;
        Ok(())
    }

    /// One-shot health check: a full open (header, footer, tail replay)
    /// followed by a clean close. The hash is taken from the file name.
    pub fn verify(path: &Path) -> Result<()> {
        let hash = super::hash_from_path(path)?;
        let ovfh = Self::open(path, &hash)?;
        ovfh.close(false)
    }

    /// Flushes and unmaps the file, optionally rewriting the footer first.
    /// A file that never assigned an article keeps its creation footer.
    pub fn close(mut self, update_footer: bool) -> Result<()> {
        if update_footer && self.last > 0 {
            self.update_footer()?;
        }
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to flush '{}' on close", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_hash() -> String {
        "ab".repeat(32)
    }

    fn record_line(article: u64, group: &str) -> String {
        format!(
            "{}\tHello\ta@example.com\tThu, 01 Jan 2026 00:00:00 +0000\t<{}@example>\t\t512\t10\tnntp {}:{}\n",
            article, article, group, article
        )
    }

    fn append_records(path: &std::path::Path, hash: &str, count: u64) {
        let mut ov = OverviewFile::open(path, hash).unwrap();
        for _ in 0..count {
            if ov.last() == 0 {
                ov.set_last(1);
            }
            let n = ov.last();
            ov = ov.append_line(record_line(n, "misc.test").as_bytes()).unwrap();
            ov.update_footer().unwrap();
            ov.set_last(n + 1);
        }
        ov.close(true).unwrap();
    }

    #[test]
    fn create_writes_fixed_regions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));

        OverviewFile::create(&path, &test_hash(), 3).unwrap();

        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len, OV_RESERVE_BEG + 3 * CREATE_PAGE_BYTES + OV_RESERVE_END);

        let ov = OverviewFile::open(&path, &test_hash()).unwrap();
        assert_eq!(ov.findex(), OV_RESERVE_BEG);
        assert_eq!(ov.last(), 0);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        OverviewFile::create(&path, &test_hash(), 1).unwrap();
        assert!(OverviewFile::create(&path, &test_hash(), 1).is_err());
    }

    #[test]
    fn append_then_reopen_replays_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        OverviewFile::create(&path, &test_hash(), 3).unwrap();

        append_records(&path, &test_hash(), 5);

        let ov = OverviewFile::open(&path, &test_hash()).unwrap();
        assert_eq!(ov.last(), 6);
        assert!(ov.findex() > OV_RESERVE_BEG);
        assert!(ov.findex() <= ov.bodyend());
    }

    #[test]
    fn replay_succeeds_after_every_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        OverviewFile::create(&path, &test_hash(), 3).unwrap();

        for n in 1..=8u64 {
            append_records(&path, &test_hash(), 1);
            let ov = OverviewFile::open(&path, &test_hash()).unwrap();
            assert_eq!(ov.last(), n + 1);
            ov.close(false).unwrap();
        }
    }

    #[test]
    fn grow_preserves_existing_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        // One page: ~1 KiB of body forces growth after a handful of records.
        OverviewFile::create(&path, &test_hash(), 1).unwrap();

        append_records(&path, &test_hash(), 40);

        let ov = OverviewFile::open(&path, &test_hash()).unwrap();
        assert_eq!(ov.last(), 41);
        assert!(ov.len() > OV_RESERVE_BEG + CREATE_PAGE_BYTES + OV_RESERVE_END);

        // Every record must still be present, in order.
        let data = std::fs::read(&path).unwrap();
        let body = &data[OV_RESERVE_BEG as usize..ov.findex() as usize];
        let lines: Vec<&[u8]> = body.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 40);
        for (i, line) in lines.iter().enumerate() {
            let expect = format!("{}\t", i + 1);
            assert!(line.starts_with(expect.as_bytes()));
        }
    }

    #[test]
    fn findex_stays_inside_reserved_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        OverviewFile::create(&path, &test_hash(), 1).unwrap();

        let hash = test_hash();
        let mut ov = OverviewFile::open(&path, &hash).unwrap();
        for _ in 0..30 {
            if ov.last() == 0 {
                ov.set_last(1);
            }
            let n = ov.last();
            ov = ov.append_line(record_line(n, "misc.test").as_bytes()).unwrap();
            ov.update_footer().unwrap();
            ov.set_last(n + 1);
            assert!(ov.findex() >= OV_RESERVE_BEG);
            assert!(ov.findex() <= ov.len() - OV_RESERVE_END);
        }
        ov.close(true).unwrap();
    }

    #[test]
    fn open_rejects_corrupt_footer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        OverviewFile::create(&path, &test_hash(), 1).unwrap();

        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data[len - 3] = b'X';
        std::fs::write(&path, &data).unwrap();

        assert!(OverviewFile::open(&path, &test_hash()).is_err());
    }

    #[test]
    fn open_rejects_tail_article_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        OverviewFile::create(&path, &test_hash(), 3).unwrap();
        append_records(&path, &test_hash(), 3);

        // Rewrite the footer claiming a different last article.
        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        let ov = OverviewFile::open(&path, &test_hash()).unwrap();
        let footer = build_footer(unix_nanos(), 9, ov.findex(), ov.bodyend(), ov.len()).unwrap();
        ov.close(false).unwrap();
        data[len - OV_RESERVE_END as usize..].copy_from_slice(&footer);
        std::fs::write(&path, &data).unwrap();

        assert!(OverviewFile::open(&path, &test_hash()).is_err());
    }

    #[test]
    fn verify_checks_open_close_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        OverviewFile::create(&path, &test_hash(), 3).unwrap();
        append_records(&path, &test_hash(), 3);

        assert!(OverviewFile::verify(&path).is_ok());

        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data[len - 3] = b'X';
        std::fs::write(&path, &data).unwrap();
        assert!(OverviewFile::verify(&path).is_err());
    }

    #[test]
    fn update_footer_requires_assigned_article() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("{}.overview", test_hash()));
        OverviewFile::create(&path, &test_hash(), 1).unwrap();

        let mut ov = OverviewFile::open(&path, &test_hash()).unwrap();
        assert!(ov.update_footer().is_err());
        ov.set_last(1);
        assert!(ov.update_footer().is_ok());
    }
}
