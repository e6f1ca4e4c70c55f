//! Header and footer text format for overview files.
//!
//! Both regions are fixed-size, human-readable lines expanded to their
//! reserved byte count by replacing a placeholder token with NUL padding.
//! The footer embeds the `\nEOV\n` end-of-body sentinel that replay and
//! rescan search for, so "where the body ends" and "where the checkpoint
//! starts" are the same byte sequence.

use std::path::Path;

use eyre::{bail, ensure, Result};

use super::{
    FOOTER_BEG, FOOTER_END, FOOTER_PARTS, HEADER_BEG, HEADER_END, OVERVIEW_EXTENSION,
    OV_RESERVE_BEG, OV_RESERVE_END, ZERO_PATTERN,
};

/// Parsed footer checkpoint values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FooterFields {
    pub time_ns: i64,
    pub last: u64,
    pub findex: u64,
    pub bodyend: u64,
    pub fend: u64,
    /// Length of the NUL padding run inside the footer.
    pub zeropad: usize,
}

/// Expands `text` to exactly `fill_to` bytes by replacing the first
/// occurrence of [`ZERO_PATTERN`] with NUL bytes.
fn zerofill(text: &str, fill_to: usize) -> Result<Vec<u8>> {
    let at = match text.find(ZERO_PATTERN) {
        Some(at) => at,
        None => bail!("zerofill: no '{}' token in '{}'", ZERO_PATTERN, text),
    };
    let fixed = text.len() - ZERO_PATTERN.len();
    ensure!(
        fixed < fill_to,
        "zerofill: fixed content {} does not fit in {} bytes",
        fixed,
        fill_to
    );

    let mut out = Vec::with_capacity(fill_to);
    out.extend_from_slice(text[..at].as_bytes());
    out.resize(at + (fill_to - fixed), 0);
    out.extend_from_slice(text[at + ZERO_PATTERN.len()..].as_bytes());
    Ok(out)
}

/// Builds the fixed-size header region written once at file creation.
pub fn build_header(hash: &str, created_secs: i64) -> Result<Vec<u8>> {
    let text = format!(
        "{}{},group={},zeropad={},{}",
        HEADER_BEG, created_secs, hash, ZERO_PATTERN, HEADER_END
    );
    zerofill(&text, OV_RESERVE_BEG as usize)
}

/// Builds the fixed-size footer region from the current checkpoint values.
pub fn build_footer(time_ns: i64, last: u64, findex: u64, bodyend: u64, fend: u64) -> Result<Vec<u8>> {
    let text = format!(
        "{}{},last={},Findex={},bodyend={},fend={},zeropad={},{}",
        FOOTER_BEG, time_ns, last, findex, bodyend, fend, ZERO_PATTERN, FOOTER_END
    );
    zerofill(&text, OV_RESERVE_END as usize)
}

/// Verifies the header region tags.
pub fn check_header(header: &[u8]) -> bool {
    header.len() == OV_RESERVE_BEG as usize
        && header.starts_with(HEADER_BEG.as_bytes())
        && header.ends_with(HEADER_END.as_bytes())
}

/// Verifies the footer region tags.
pub fn check_footer(footer: &[u8]) -> bool {
    let mut tail = Vec::with_capacity(FOOTER_END.len() + 1);
    tail.push(b',');
    tail.extend_from_slice(FOOTER_END.as_bytes());
    footer.len() == OV_RESERVE_END as usize
        && footer.starts_with(FOOTER_BEG.as_bytes())
        && footer.ends_with(&tail)
}

/// Parses a footer region into its checkpoint values. Fail-closed: any
/// missing key, wrong part count, or non-numeric value is an error.
pub fn parse_footer(footer: &[u8]) -> Result<FooterFields> {
    ensure!(check_footer(footer), "footer tags invalid");

    // Strip the leading body-end sentinel; the remainder is a plain
    // comma-separated line.
    let inner = &footer[super::BODY_END.len()..];
    let text = std::str::from_utf8(inner)
        .map_err(|e| eyre::eyre!("footer is not valid utf-8: {}", e))?;

    let parts: Vec<&str> = text.split(',').collect();
    ensure!(
        parts.len() == FOOTER_PARTS,
        "footer has {} parts, expected {}",
        parts.len(),
        FOOTER_PARTS
    );

    let time_ns: i64 = footer_value(parts[0], "time")?
        .parse()
        .map_err(|e| eyre::eyre!("footer time: {}", e))?;
    let last: u64 = footer_value(parts[1], "last")?
        .parse()
        .map_err(|e| eyre::eyre!("footer last: {}", e))?;
    let findex: u64 = footer_value(parts[2], "Findex")?
        .parse()
        .map_err(|e| eyre::eyre!("footer Findex: {}", e))?;
    let bodyend: u64 = footer_value(parts[3], "bodyend")?
        .parse()
        .map_err(|e| eyre::eyre!("footer bodyend: {}", e))?;
    let fend: u64 = footer_value(parts[4], "fend")?
        .parse()
        .map_err(|e| eyre::eyre!("footer fend: {}", e))?;
    let zeropad = footer_value(parts[5], "zeropad")?.len();
    ensure!(zeropad > 0, "footer zeropad is empty");
    ensure!(time_ns > 0, "footer time is zero");

    Ok(FooterFields {
        time_ns,
        last,
        findex,
        bodyend,
        fend,
        zeropad,
    })
}

fn footer_value<'a>(part: &'a str, key: &str) -> Result<&'a str> {
    match part.split_once('=') {
        Some((k, v)) if k == key => Ok(v),
        _ => bail!("footer key '{}' not found in '{}'", key, part),
    }
}

/// Zero-block size appended by one grow step, banded by current body size.
pub fn grow_block_size(body_size: u64) -> u64 {
    match body_size {
        s if s < 256 * 1024 => 4 * 1024,
        s if s < 4 * 1024 * 1024 => 16 * 1024,
        s if s < 32 * 1024 * 1024 => 64 * 1024,
        _ => 128 * 1024,
    }
}

/// Extracts and validates the 64-hex-char group hash from a
/// `<hash>.overview` file path.
pub fn hash_from_path(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| eyre::eyre!("invalid overview path '{}'", path.display()))?;

    let stem = match name.strip_suffix(&format!(".{}", OVERVIEW_EXTENSION)) {
        Some(stem) => stem,
        None => bail!("'{}' is not an .{} file", name, OVERVIEW_EXTENSION),
    };

    ensure!(
        stem.len() == 64 && stem.bytes().all(|b| b.is_ascii_hexdigit()),
        "'{}' is not a 64-char hex group hash",
        stem
    );
    Ok(stem.to_ascii_lowercase())
}
