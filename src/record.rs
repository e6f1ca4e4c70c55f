//! Overview records and their tab-delimited projection.
//!
//! An [`OverviewRecord`] is produced by the external article parser and
//! consumed once by the write pipeline; only its serialized form is
//! durable. The validators at the bottom are the syntactic checks the deep
//! rescanner applies to stored fields.

use eyre::{ensure, Result};
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

/// Upper bound on newsgroups a single record fans out to.
pub const MAX_NEWSGROUPS: usize = 25;
/// Upper bound on stored references per record.
pub const MAX_REFERENCES: usize = 25;
/// Upper bound on the total byte length of the stored references field.
pub const MAX_REFERENCES_BYTES: usize = 4096;

/// One parsed article, bound for every newsgroup it was posted to.
#[derive(Debug, Clone, Default)]
pub struct OverviewRecord {
    pub subject: String,
    pub from: String,
    pub date: String,
    pub message_id: String,
    pub references: SmallVec<[String; 4]>,
    pub bytes: u64,
    pub lines: u64,
    pub xref: String,
    /// Deduplicated, order-preserving target groups.
    pub newsgroups: Vec<String>,
}

/// Per-newsgroup outcome of one fan-out write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupResult {
    pub ok: bool,
    pub article: u64,
    pub group: String,
    pub hash: String,
}

impl GroupResult {
    pub fn failed(group: &str, hash: &str) -> Self {
        Self {
            ok: false,
            article: 0,
            group: group.to_string(),
            hash: hash.to_string(),
        }
    }
}

/// Serializes the fixed fields of a record: everything between the article
/// number and the cross-reference, both of which are per-group.
///
/// References are capped by count and total length; each kept reference is
/// joined with a leading space. Fields may not contain bytes that would
/// break the record framing.
pub fn serialize_fields(record: &OverviewRecord) -> Result<String> {
    let mut references = String::new();
    for reference in record.references.iter().take(MAX_REFERENCES) {
        if references.len() + reference.len() + 1 > MAX_REFERENCES_BYTES {
            break;
        }
        references.push(' ');
        references.push_str(reference);
    }

    let fields = format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{}",
        record.subject,
        record.from,
        record.date,
        record.message_id,
        references,
        record.bytes,
        record.lines
    );
    ensure!(
        !fields.bytes().any(|b| b == b'\n' || b == 0),
        "record fields for '{}' contain framing bytes",
        record.message_id
    );
    ensure!(
        fields.bytes().filter(|&b| b == b'\t').count() == 6,
        "record fields for '{}' contain stray tabs",
        record.message_id
    );
    Ok(fields)
}

/// Lowercase hex SHA-256 of a newsgroup name; the overview file stem.
pub fn group_hash(group: &str) -> String {
    let digest = Sha256::digest(group.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// A message-id is either all digits or an `<...>` token.
pub fn is_valid_msgid(msgid: &str) -> bool {
    if msgid.is_empty() {
        return false;
    }
    if msgid.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    msgid.starts_with('<') && msgid.ends_with('>') && msgid.len() > 2
}

/// A group name starts with a lowercase letter or digit and continues with
/// lowercase letters, digits, or `.` `_` `-` `+` `&`.
pub fn is_valid_group_name(group: &str) -> bool {
    let mut bytes = group.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_lowercase() || b.is_ascii_digit() => {}
        _ => return false,
    }
    bytes.all(|b| {
        b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-' | b'+' | b'&')
    })
}
