//! Growth and crash-recovery behavior on real files.

use ovdb::record::group_hash;
use ovdb::scan::{rescan, scan_overview, RescanMode, ScanField};
use ovdb::storage::{OverviewFile, OV_RESERVE_BEG, OV_RESERVE_END};
use tempfile::tempdir;

fn line(article: u64, group: &str) -> String {
    format!(
        "{}\tGrowth subject {}\tposter@example.com\tThu, 01 Jan 2026 00:00:00 +0000\t<g{}@example>\t\t300\t12\tnntp {}:{}\n",
        article, article, article, group, article
    )
}

fn append_n(path: &std::path::Path, hash: &str, group: &str, count: u64) {
    let mut ov = OverviewFile::open(path, hash).unwrap();
    for _ in 0..count {
        if ov.last() == 0 {
            ov.set_last(1);
        }
        let n = ov.last();
        ov = ov.append_line(line(n, group).as_bytes()).unwrap();
        ov.update_footer().unwrap();
        ov.set_last(n + 1);
    }
    ov.close(true).unwrap();
}

#[test]
fn growth_never_loses_records() {
    let dir = tempdir().unwrap();
    let group = "growth.test";
    let hash = group_hash(group);
    let path = dir.path().join(format!("{}.overview", hash));

    // 1 KiB body: a few records trigger the first grow, hundreds trigger
    // several more.
    OverviewFile::create(&path, &hash, 1).unwrap();

    let mut before_sizes = Vec::new();
    for round in 1..=6u64 {
        append_n(&path, &hash, group, 50);
        before_sizes.push(std::fs::metadata(&path).unwrap().len());

        // After each round, the whole prefix is intact.
        let lines =
            scan_overview(&path, group, 1, 0, ScanField::All, None, None).unwrap();
        assert_eq!(lines.len(), (round * 50) as usize);
        for (i, l) in lines.iter().enumerate() {
            assert!(l.starts_with(&format!("{}\t", i + 1)));
        }
    }

    assert!(before_sizes.windows(2).all(|w| w[0] <= w[1]));

    let report = rescan(&path, group, RescanMode::FullVerify, false).unwrap();
    assert!(report.ok);
    assert_eq!(report.last_article, 300);
}

#[test]
fn cursor_stays_within_reserved_regions_across_growth() {
    let dir = tempdir().unwrap();
    let group = "growth.bounds";
    let hash = group_hash(group);
    let path = dir.path().join(format!("{}.overview", hash));
    OverviewFile::create(&path, &hash, 1).unwrap();

    append_n(&path, &hash, group, 120);

    let ov = OverviewFile::open(&path, &hash).unwrap();
    assert!(ov.findex() >= OV_RESERVE_BEG);
    assert!(ov.findex() <= ov.len() - OV_RESERVE_END);
    assert_eq!(ov.bodyend(), ov.len() - OV_RESERVE_END);
    assert_eq!(ov.last(), 121);
    ov.close(false).unwrap();
}

#[test]
fn crash_between_append_and_footer_is_repairable() {
    let dir = tempdir().unwrap();
    let group = "crash.test";
    let hash = group_hash(group);
    let path = dir.path().join(format!("{}.overview", hash));
    OverviewFile::create(&path, &hash, 4).unwrap();
    append_n(&path, &hash, group, 10);

    // Simulate a crash mid-append: record bytes land after the cursor but
    // the footer still checkpoints the old state.
    let ov = OverviewFile::open(&path, &hash).unwrap();
    let findex = ov.findex() as usize;
    ov.close(false).unwrap();
    let mut data = std::fs::read(&path).unwrap();
    let partial = b"11\tlost subject\tposter@exa";
    data[findex..findex + partial.len()].copy_from_slice(partial);
    std::fs::write(&path, &data).unwrap();

    // The engine-side open must refuse the file outright.
    assert!(OverviewFile::open(&path, &hash).is_err());

    // Offline repair truncates the partial record and rebuilds the footer.
    let report = rescan(&path, group, RescanMode::RepairFooter, false).unwrap();
    assert!(report.ok);
    assert_eq!(report.last_article, 10);

    // The file serves writes again and continues the sequence.
    append_n(&path, &hash, group, 2);
    let lines = scan_overview(&path, group, 1, 0, ScanField::All, None, None).unwrap();
    assert_eq!(lines.len(), 12);
    assert!(lines.last().unwrap().starts_with("12\t"));
}

#[test]
fn reopen_after_every_growth_round_replays_cleanly() {
    let dir = tempdir().unwrap();
    let group = "growth.reopen";
    let hash = group_hash(group);
    let path = dir.path().join(format!("{}.overview", hash));
    OverviewFile::create(&path, &hash, 1).unwrap();

    for round in 1..=10u64 {
        append_n(&path, &hash, group, 7);
        let ov = OverviewFile::open(&path, &hash).unwrap();
        assert_eq!(ov.last(), round * 7 + 1);
        ov.close(false).unwrap();
    }
}
