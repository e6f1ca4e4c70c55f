//! # ovdb - Overview Storage Engine
//!
//! ovdb is an append-only storage engine for NNTP "overview" data: per
//! newsgroup logs of article metadata (subject, from, date, message-id,
//! references, byte/line counts, cross-reference), each backed by one
//! memory-mapped file with a fixed header, a growable tab-delimited body,
//! and a fixed trailing footer that serves as the durable checkpoint.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ovdb::{Engine, EngineConfig, OverviewRecord};
//!
//! let engine = Engine::start(EngineConfig::new("./overviews"))?;
//!
//! let reply = engine.submit(OverviewRecord {
//!     subject: "Hello".into(),
//!     from: "a@example.com".into(),
//!     date: "Thu, 01 Jan 2026 00:00:00 +0000".into(),
//!     message_id: "<one@example>".into(),
//!     bytes: 512,
//!     lines: 10,
//!     newsgroups: vec!["misc.test".into()],
//!     ..Default::default()
//! })?;
//! for result in reply.recv()? {
//!     println!("{}: article {}", result.group, result.article);
//! }
//!
//! engine.shutdown()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │   Engine (submit / shutdown)         │
//! ├──────────────────────────────────────┤
//! │   Write Pipeline (worker pool,       │
//! │   per-group fan-out)                 │
//! ├───────────────────┬──────────────────┤
//! │  Handle Registry  │  Sparse Index    │
//! │  (opener/closer   │  (offset cache + │
//! │   pools, sweeper) │   .Index files)  │
//! ├───────────────────┴──────────────────┤
//! │   Per-Hash FIFO Resource Lock        │
//! ├──────────────────────────────────────┤
//! │   File-Format Primitives             │
//! │   (mmap, grow, footer, replay)       │
//! └──────────────────────────────────────┘
//! ```
//!
//! The read side (`scan`, `scan::rescan`) sits directly on the file-format
//! primitives and bypasses the registry.
//!
//! ## Guarantees
//!
//! - One writer per mapped file, enforced by a per-hash FIFO lock and by
//!   ownership of the handle itself.
//! - Crash between writes is survivable: the footer checkpoint plus a
//!   backward byte-scan recover the write cursor, and the offline
//!   rescanner repairs a file caught mid-append.
//! - Per newsgroup, article numbers are assigned in lock-grant order and
//!   increase without gaps.

pub mod engine;
pub mod index;
pub mod record;
pub mod scan;
pub mod storage;

pub use engine::{Engine, EngineConfig};
pub use index::OverviewIndex;
pub use record::{GroupResult, OverviewRecord};
pub use scan::{rescan, scan_overview, scan_overview_indexed, RescanMode, RescanReport, ScanField};
pub use storage::OverviewFile;
