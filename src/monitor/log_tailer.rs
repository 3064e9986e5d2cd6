use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::prelude::*;

/// Literal text a monitored process writes when it self-detects an
/// internal stall.
pub const HANG_MARKER: &str = "POSSIBLE HANG DETECTED";

/// Log target used for echoed child output.
pub const TAIL_TARGET: &str = "tail";

#[derive(Debug, Default)]
pub struct TailOutcome {
    /// Complete lines consumed by this poll, in file order.
    pub lines: Vec<String>,
    pub hang_detected: bool,
}

/// Read the unread suffix of `path` starting at `*offset`, consuming only
/// complete (newline-terminated) lines; a trailing partial line is left
/// for the next poll so an echoed prefix is never injected mid-line.
/// Advances `*offset` past the last fully-consumed line; the offset never
/// decreases, and re-invoking on an unchanged file is a no-op.
pub fn tail_log(
    path: &Path,
    offset: &mut u64,
    uid: &str,
    stream_tag: Option<&str>,
    echo: bool,
    suppress_hang_scan: bool,
) -> Result<TailOutcome> {
    let mut outcome = TailOutcome::default();
    if !path.exists() {
        return Ok(outcome);
    }
    let mut file =
        File::open(path).with_context(|| format!("failed to open log {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("failed to stat log {}", path.display()))?
        .len();
    if len <= *offset {
        return Ok(outcome);
    }
    file.seek(SeekFrom::Start(*offset))
        .with_context(|| format!("failed to seek log {}", path.display()))?;
    let mut buffer = Vec::with_capacity((len - *offset) as usize);
    file.read_to_end(&mut buffer)
        .with_context(|| format!("failed to read log {}", path.display()))?;

    // Only act on bytes up to and including the last newline.
    let Some(last_newline) = buffer.iter().rposition(|&b| b == b'\n') else {
        return Ok(outcome);
    };
    let consumed = &buffer[..=last_newline];

    let mut raw_lines: Vec<&[u8]> = consumed.split(|&b| b == b'\n').collect();
    // `consumed` ends with a newline, so the final element is an empty
    // artifact of the split, not a blank line.
    raw_lines.pop();
    for raw_line in raw_lines {
        let line = String::from_utf8_lossy(raw_line)
            .trim_end_matches('\r')
            .to_string();
        if echo {
            match stream_tag {
                Some(tag) => info!(target: TAIL_TARGET, "{uid} {tag} {line}"),
                None => info!(target: TAIL_TARGET, "{uid} {line}"),
            }
        }
        if !suppress_hang_scan && line.contains(HANG_MARKER) {
            outcome.hang_detected = true;
        }
        outcome.lines.push(line);
    }

    *offset += (last_newline + 1) as u64;
    Ok(outcome)
}
