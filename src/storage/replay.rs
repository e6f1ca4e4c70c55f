//! Backward-scan crash recovery over the body tail.
//!
//! After a crash the footer may checkpoint a write cursor that sits past a
//! zero-filled, truncated record. Replay walks backward from the cursor and
//! reconstructs the true end of data: a contiguous run of NUL bytes, then
//! the newline terminating the last complete record, then exactly
//! [`OVERVIEW_TABS`] tabs before the previous newline. The walk is a small
//! state machine over a plain byte slice so it can be exercised without any
//! memory mapping.
//!
//! Any shape other than the one described above means the file is corrupt
//! and must not be opened for writing.

use eyre::{bail, ensure, Result};
use tracing::warn;

use super::{OVERVIEW_TABS, OV_RESERVE_BEG};

/// Result of a successful tail replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailReplay {
    /// Corrected write cursor. Equal to the input cursor unless the NUL run
    /// was longer than the single free byte left by a normal append.
    pub findex: u64,
    /// Leading article number of the last complete record.
    pub last_article: u64,
}

enum State {
    NulRun,
    FirstNewline,
    SecondNewline,
}

/// Walks backward from `findex` and validates the body tail.
///
/// `buf` is the entire file image. `findex` must point at the first
/// unwritten byte, inside `[OV_RESERVE_BEG, buf.len())`.
pub fn replay_tail(buf: &[u8], findex: u64) -> Result<TailReplay> {
    let start = findex as usize;
    ensure!(
        start >= OV_RESERVE_BEG as usize && start < buf.len(),
        "replay: cursor {} outside body range [{}, {})",
        start,
        OV_RESERVE_BEG,
        buf.len()
    );

    let mut state = State::NulRun;
    let mut nul_run = 0usize;
    let mut tabs = 0usize;
    // Byte after the last complete record's terminating newline.
    let mut line_end = 0usize;
    let mut line_start = 0usize;

    let mut idx = start;
    let floor = OV_RESERVE_BEG as usize - 1;
    loop {
        let c = buf[idx];
        match state {
            State::NulRun => match c {
                0 => nul_run += 1,
                b'\n' => {
                    ensure!(nul_run > 0, "replay: cursor does not point at free space");
                    line_end = idx;
                    state = State::FirstNewline;
                }
                _ => bail!(
                    "replay: unexpected byte 0x{:02x} at offset {} before record end",
                    c,
                    idx
                ),
            },
            State::FirstNewline => match c {
                0 => bail!("replay: NUL inside record at offset {}", idx),
                b'\t' => {
                    tabs += 1;
                    ensure!(
                        tabs <= OVERVIEW_TABS,
                        "replay: {} tabs in last record, expected {}",
                        tabs,
                        OVERVIEW_TABS
                    );
                }
                b'\n' => {
                    line_start = idx + 1;
                    state = State::SecondNewline;
                }
                _ => {}
            },
            State::SecondNewline => break,
        }

        if matches!(state, State::SecondNewline) {
            break;
        }
        if idx == floor {
            bail!("replay: ran into the header without finding the record boundary");
        }
        idx -= 1;
    }

    ensure!(
        tabs == OVERVIEW_TABS,
        "replay: last record has {} tabs, expected {}",
        tabs,
        OVERVIEW_TABS
    );
    ensure!(line_end > line_start, "replay: empty last record");

    let line = &buf[line_start..line_end];
    let field = line.split(|&b| b == b'\t').next().unwrap_or_default();
    let last_article = std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| {
            eyre::eyre!(
                "replay: last record has no numeric article field at offset {}",
                line_start
            )
        })?;
    ensure!(last_article > 0, "replay: article number is zero");

    let mut corrected = findex;
    if nul_run > 1 {
        let excess = (nul_run - 1) as u64;
        corrected -= excess;
        warn!(
            findex,
            corrected, nul_run, "pulled write cursor back over zero-filled tail"
        );
    }

    Ok(TailReplay {
        findex: corrected,
        last_article,
    })
}
