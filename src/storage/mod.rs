//! # Storage Module
//!
//! Foundational storage layer for ovdb: one memory-mapped, append-only
//! overview file per newsgroup, identified by the SHA-256 content hash of
//! the group name.
//!
//! ## File Layout
//!
//! ```text
//! +-----------------------------+  offset 0
//! |  Header (128 bytes)         |  "#ov_init=<secs>,group=<hash>,zeropad=...,EOH\n"
//! +-----------------------------+  offset OV_RESERVE_BEG
//! |                             |
//! |  Body (growable)            |  tab-delimited records, one per line,
//! |                             |  zero-filled free space at the tail
//! +-----------------------------+  offset len - OV_RESERVE_END
//! |  Footer (128 bytes)         |  "\nEOV\ntime=...,last=...,Findex=...,EOF\n"
//! +-----------------------------+  offset len
//! ```
//!
//! The footer is the durable checkpoint: it records the write cursor
//! (`Findex`), the next article number to assign (`last`), and the body/file
//! boundaries. It is rewritten after every body append and before every
//! close. On open, the cursor is re-validated by a backward byte-scan over
//! the body tail (see [`replay_tail`]).
//!
//! ## Body Records
//!
//! Every body line carries exactly [`OVERVIEW_FIELDS`] tab-separated fields:
//!
//! ```text
//! <article#>\t<subject>\t<from>\t<date>\t<message-id>\t<references>\t<bytes>\t<lines>\t<xref>\n
//! ```
//!
//! ## Growth
//!
//! The body never grows in place. Growth is an explicit
//! checkpoint-footer / unmap / extend-on-disk / remap protocol; see
//! [`OverviewFile::grow`]. The appended block size is banded by the current
//! body size (see [`grow_block_size`]).
//!
//! ## Concurrency
//!
//! These primitives perform no locking. An [`OverviewFile`] is owned by
//! exactly one caller at a time; the engine layer serializes access per
//! group hash. Ownership moves make holding a stale mapping impossible.
//!
//! ## Module Organization
//!
//! - `format`: header/footer text format, zero-fill padding, growth bands
//! - `replay`: backward-scan crash recovery over the body tail
//! - `overview`: [`OverviewFile`], the live memory-mapped handle

mod format;
mod overview;
mod replay;

pub use format::{
    build_footer, build_header, check_footer, check_header, grow_block_size, hash_from_path,
    parse_footer, FooterFields,
};
pub use overview::OverviewFile;
pub use replay::{replay_tail, TailReplay};

/// Reserved byte count at the beginning of every overview file.
pub const OV_RESERVE_BEG: u64 = 128;
/// Reserved byte count at the end of every overview file.
pub const OV_RESERVE_END: u64 = 128;

/// Fields per body record.
pub const OVERVIEW_FIELDS: usize = 9;
/// Tabs per body record.
pub const OVERVIEW_TABS: usize = OVERVIEW_FIELDS - 1;
/// Comma-separated parts of a footer line.
pub const FOOTER_PARTS: usize = 7;

pub const HEADER_BEG: &str = "#ov_init=";
pub const HEADER_END: &str = "EOH\n";
pub const BODY_END: &str = "\nEOV\n";
pub const FOOTER_BEG: &str = "\nEOV\ntime=";
pub const FOOTER_END: &str = "\nEOF\n";

/// Placeholder token replaced by NUL padding when a header or footer line is
/// expanded to its reserved size.
pub const ZERO_PATTERN: &str = "zerofill";

/// Prefix of every cross-reference field.
pub const XREF_PREFIX: &str = "nntp";

/// File name extension of overview files.
pub const OVERVIEW_EXTENSION: &str = "overview";

/// Body bytes allocated per page at file creation.
pub const CREATE_PAGE_BYTES: u64 = 1024;

pub(crate) fn unix_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn unix_nanos() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
