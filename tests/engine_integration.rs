//! End-to-end engine tests: fan-out writes, parking and reuse, partial
//! failure, ordering under contention, and orderly shutdown.

use std::sync::atomic::Ordering;

use ovdb::record::group_hash;
use ovdb::scan::{rescan, scan_overview, RescanMode, ScanField};
use ovdb::storage::OverviewFile;
use ovdb::{Engine, EngineConfig, OverviewRecord};
use tempfile::tempdir;

fn record(msgid: &str, groups: &[&str]) -> OverviewRecord {
    OverviewRecord {
        subject: format!("Subject {}", msgid),
        from: "poster@example.com".into(),
        date: "Thu, 01 Jan 2026 00:00:00 +0000".into(),
        message_id: msgid.to_string(),
        references: Default::default(),
        bytes: 256,
        lines: 8,
        xref: String::new(),
        newsgroups: groups.iter().map(|g| g.to_string()).collect(),
    }
}

#[test]
fn multi_group_fanout_and_persistence() {
    let dir = tempdir().unwrap();
    let engine = Engine::start(EngineConfig::new(dir.path())).unwrap();

    let reply = engine
        .submit(record("<a@example>", &["alpha.one", "alpha.two", "alpha.three"]))
        .unwrap();
    let results = reply.recv().unwrap();
    assert_eq!(results.len(), 3);
    for result in &results {
        assert!(result.ok, "branch failed: {:?}", result);
        assert_eq!(result.article, 1);
        assert_eq!(result.hash, group_hash(&result.group));
    }

    let reply = engine
        .submit(record("<b@example>", &["alpha.one", "alpha.two"]))
        .unwrap();
    let results = reply.recv().unwrap();
    assert!(results.iter().all(|r| r.ok && r.article == 2));

    engine.shutdown().unwrap();

    // Every file reopens cleanly with the expected article counter.
    for (group, expect_last) in [("alpha.one", 3), ("alpha.two", 3), ("alpha.three", 2)] {
        let hash = group_hash(group);
        let path = dir.path().join(format!("{}.overview", hash));
        let ov = OverviewFile::open(&path, &hash).unwrap();
        assert_eq!(ov.last(), expect_last, "group {}", group);
        ov.close(false).unwrap();
    }
}

#[test]
fn failed_branch_reports_zero_and_leaves_others() {
    let dir = tempdir().unwrap();
    let engine = Engine::start(EngineConfig::new(dir.path())).unwrap();

    let bad_hash = group_hash("beta.bad");
    std::fs::write(
        dir.path().join(format!("{}.overview", bad_hash)),
        b"this is not an overview file",
    )
    .unwrap();

    let reply = engine
        .submit(record("<c@example>", &["beta.one", "beta.bad", "beta.two"]))
        .unwrap();
    let results = reply.recv().unwrap();

    let by_group = |g: &str| results.iter().find(|r| r.group == g).unwrap();
    assert!(by_group("beta.one").ok);
    assert_eq!(by_group("beta.one").article, 1);
    assert!(!by_group("beta.bad").ok);
    assert_eq!(by_group("beta.bad").article, 0);
    assert!(by_group("beta.two").ok);
    assert_eq!(by_group("beta.two").article, 1);

    engine.shutdown().unwrap();

    // The good groups advanced, the bad file is untouched.
    for group in ["beta.one", "beta.two"] {
        let hash = group_hash(group);
        let path = dir.path().join(format!("{}.overview", hash));
        let ov = OverviewFile::open(&path, &hash).unwrap();
        assert_eq!(ov.last(), 2);
        ov.close(false).unwrap();
    }
    let bad = std::fs::read(dir.path().join(format!("{}.overview", bad_hash))).unwrap();
    assert_eq!(bad, b"this is not an overview file");
}

#[test]
fn contended_group_assigns_sequential_articles() {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.workers = 8;
    config.queue_size = 32;
    let engine = Engine::start(config).unwrap();

    let replies: Vec<_> = (0..40)
        .map(|i| {
            engine
                .submit(record(&format!("<n{}@example>", i), &["gamma.hot"]))
                .unwrap()
        })
        .collect();

    let mut articles = Vec::new();
    for reply in replies {
        let results = reply.recv().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].ok);
        articles.push(results[0].article);
    }

    // Monotonic per file with no gaps: every number 1..=40 exactly once.
    articles.sort_unstable();
    assert_eq!(articles, (1..=40).collect::<Vec<u64>>());

    // A hot group should be parked and reused, not reopened per append.
    let opened = engine.registry().stats.files_opened.load(Ordering::Relaxed);
    let reused = engine.registry().stats.reuses.load(Ordering::Relaxed);
    assert!(opened < 40, "opened {} times for 40 appends", opened);
    assert!(reused > 0);

    engine.shutdown().unwrap();

    let hash = group_hash("gamma.hot");
    let path = dir.path().join(format!("{}.overview", hash));
    let report = rescan(&path, "gamma.hot", RescanMode::FullVerify, false).unwrap();
    assert!(report.ok);
    assert_eq!(report.last_article, 40);
}

#[test]
fn write_scan_rescan_roundtrip() {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.workers = 4;
    config.queue_size = 16;
    let engine = Engine::start(config).unwrap();

    let replies: Vec<_> = (0..250)
        .map(|i| {
            engine
                .submit(record(&format!("<r{}@example>", i), &["delta.big"]))
                .unwrap()
        })
        .collect();
    for reply in replies {
        assert!(reply.recv().unwrap()[0].ok);
    }
    engine.shutdown().unwrap();

    let hash = group_hash("delta.big");
    let path = dir.path().join(format!("{}.overview", hash));

    let lines = scan_overview(&path, "delta.big", 200, 200, ScanField::All, None, None).unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("200\t"));
    assert!(lines[0].ends_with("nntp delta.big:200"));

    let report = rescan(&path, "delta.big", RescanMode::RebuildDeep, false).unwrap();
    assert!(report.ok);
    assert_eq!(report.last_article, 250);
}

#[test]
fn single_group_submit_then_clean_shutdown() {
    let dir = tempdir().unwrap();
    let engine = Engine::start(EngineConfig::new(dir.path())).unwrap();
    let reply = engine.submit(record("<z@example>", &["eps.one"])).unwrap();
    assert!(reply.recv().unwrap()[0].ok);
    engine.shutdown().unwrap();
    // Shutdown drained the registry; the parked map was flushed and closed.
    let hash = group_hash("eps.one");
    let path = dir.path().join(format!("{}.overview", hash));
    let report = rescan(&path, "eps.one", RescanMode::FullVerify, false).unwrap();
    assert!(report.ok);
    assert_eq!(report.last_article, 1);
}

#[test]
fn engine_scan_triggers_auto_index() {
    let dir = tempdir().unwrap();
    let mut config = EngineConfig::new(dir.path());
    config.workers = 4;
    config.queue_size = 16;
    let engine = Engine::start(config).unwrap();

    let replies: Vec<_> = (0..150)
        .map(|i| {
            engine
                .submit(record(&format!("<ai{}@example>", i), &["zeta.indexed"]))
                .unwrap()
        })
        .collect();
    for reply in replies {
        assert!(reply.recv().unwrap()[0].ok);
    }

    // First indexed read: sidecar missing, miss queues a background build.
    let lines = engine
        .scan("zeta.indexed", 120, 120, ScanField::All, None)
        .unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("120\t"));

    let hash = group_hash("zeta.indexed");
    let sidecar = dir
        .path()
        .join(format!("{}.overview{}", hash, ovdb::index::INDEX_SUFFIX));
    let mut waited = 0;
    while !sidecar.exists() && waited < 5000 {
        std::thread::sleep(std::time::Duration::from_millis(10));
        waited += 10;
    }
    assert!(sidecar.exists(), "auto-index did not build the sidecar");

    // Later reads hit the sidecar-fed cache.
    let lines = engine
        .scan("zeta.indexed", 140, 141, ScanField::MessageId, None)
        .unwrap();
    assert_eq!(lines.len(), 2);

    engine.shutdown().unwrap();
}

#[test]
fn empty_newsgroups_rejected() {
    let dir = tempdir().unwrap();
    let engine = Engine::start(EngineConfig::new(dir.path())).unwrap();
    assert!(engine.submit(record("<e@example>", &[])).is_err());
    engine.shutdown().unwrap();
}
