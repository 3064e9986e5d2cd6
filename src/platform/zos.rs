use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use super::{
    ABORT_CORE_SIGNAL, APPLICATION_DUMP_SIGNAL, Platform, SECONDARY_DUMP_SIGNAL, send_signal,
};
use crate::dumps::join::join_parts;
use crate::helpers::external_command::ExternalCommand;
use crate::prelude::*;
use crate::process::{DumpKind, DumpRecord, ProcessHandle};

/// Marker the dump writer substitutes with a three-digit part index in
/// multi-part transaction dump dataset names.
pub const MULTIPART_MARKER: &str = "&DS";

const DATASET_MOVE_TIMEOUT: Duration = Duration::from_secs(120);

lazy_static! {
    static ref EXTRA_PATTERNS: Vec<(DumpKind, Regex)> =
        vec![(DumpKind::Ceedump, Regex::new(r"^CEEDUMP").unwrap())];
    // Transaction dumps are announced in the log rather than appearing
    // under a predictable filename.
    static ref TDUMP_SUCCESS_RE: Regex =
        Regex::new(r"IEATDUMP SUCCESS.*DSN=(?:'([^']+)'|([A-Z0-9.&$#@]+))").unwrap();
    static ref TDUMP_FAILURE_RE: Regex = Regex::new(r"IEATDUMP FAILURE").unwrap();
}

/// z/OS: CEEDUMP files, log-announced transaction dumps that must be
/// moved out of dataset storage, and a superkill at the end of the kill
/// ladder.
pub struct ZosPlatform {
    join_tdump_parts: bool,
}

enum MoveOutcome {
    Moved,
    Missing,
    StorageExhausted,
    Failed(String),
}

impl ZosPlatform {
    pub fn new(join_tdump_parts: bool) -> Self {
        Self { join_tdump_parts }
    }

    /// Move a dump dataset into the filesystem.
    fn move_dataset(&self, dsn: &str, target: &Path) -> Result<MoveOutcome> {
        let output = ExternalCommand::new("mv")
            .arg(format!("//'{dsn}'"))
            .arg(target.to_string_lossy().into_owned())
            .timeout(DATASET_MOVE_TIMEOUT)
            .run()?;
        if output.success() {
            return Ok(MoveOutcome::Moved);
        }
        let stderr = output.stderr.to_lowercase();
        if stderr.contains("no space") || stderr.contains("edc5133i") {
            Ok(MoveOutcome::StorageExhausted)
        } else if stderr.contains("no such file")
            || stderr.contains("not found")
            || stderr.contains("edc5129i")
        {
            Ok(MoveOutcome::Missing)
        } else {
            Ok(MoveOutcome::Failed(output.stderr.trim().to_string()))
        }
    }

    fn collect_tdump(&self, uid: &str, dsn: &str, log_dir: &Path) -> Result<Vec<DumpRecord>> {
        if dsn.contains(MULTIPART_MARKER) {
            return self.collect_multipart_tdump(uid, dsn, log_dir);
        }
        let target = log_dir.join(dsn);
        match self.move_dataset(dsn, &target)? {
            MoveOutcome::Moved => Ok(vec![DumpRecord::new(DumpKind::Tdump, target)]),
            MoveOutcome::StorageExhausted => {
                error!("{uid}: no space left to collect dump {dsn}; giving up on this dump");
                Ok(Vec::new())
            }
            MoveOutcome::Missing => {
                warn!("{uid}: announced dump {dsn} was not found");
                Ok(Vec::new())
            }
            MoveOutcome::Failed(message) => {
                warn!("{uid}: failed to move dump {dsn}: {message}");
                Ok(Vec::new())
            }
        }
    }

    /// Multi-part dumps use the `.X&DS` suffix convention: part n is the
    /// base name with the marker replaced by a zero-padded index.
    fn collect_multipart_tdump(
        &self,
        uid: &str,
        dsn: &str,
        log_dir: &Path,
    ) -> Result<Vec<DumpRecord>> {
        let mut parts: Vec<PathBuf> = Vec::new();
        for index in 1u32.. {
            let part_dsn = dsn.replace(MULTIPART_MARKER, &format!("{index:03}"));
            let target = log_dir.join(&part_dsn);
            match self.move_dataset(&part_dsn, &target)? {
                MoveOutcome::Moved => parts.push(target),
                // Past the last part.
                MoveOutcome::Missing => break,
                // Terminal for this collection attempt, no further retries.
                MoveOutcome::StorageExhausted => {
                    error!(
                        "{uid}: no space left while collecting {dsn}; stopping after {} parts",
                        parts.len()
                    );
                    break;
                }
                MoveOutcome::Failed(message) => {
                    warn!("{uid}: failed to move dump part {part_dsn}: {message}");
                    break;
                }
            }
        }
        if parts.is_empty() {
            return Ok(Vec::new());
        }
        if self.join_tdump_parts && parts.len() > 1 {
            let base = dsn
                .strip_suffix(&format!(".X{MULTIPART_MARKER}"))
                .unwrap_or(dsn);
            let joined = log_dir.join(format!("{base}.tdump"));
            match join_parts(&parts, &joined) {
                Ok(total) => {
                    info!(
                        "{uid}: joined {} dump parts into {} ({total} bytes)",
                        parts.len(),
                        joined.display()
                    );
                    return Ok(vec![DumpRecord::new(DumpKind::Tdump, joined)]);
                }
                Err(err) => {
                    warn!("{uid}: failed to join dump parts: {err:#}; keeping individual parts");
                }
            }
        }
        Ok(parts
            .into_iter()
            .map(|part| DumpRecord::new(DumpKind::Tdump, part))
            .collect())
    }
}

fn dataset_name(line: &str) -> Option<&str> {
    let captures = TDUMP_SUCCESS_RE.captures(line)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .map(|m| m.as_str())
}

impl Platform for ZosPlatform {
    fn name(&self) -> &'static str {
        "zos"
    }

    fn extra_file_patterns(&self) -> &[(DumpKind, Regex)] {
        &EXTRA_PATTERNS
    }

    fn scan_log_dumps(
        &self,
        handle: &ProcessHandle,
        new_lines: &[String],
        log_dir: &Path,
    ) -> Result<Vec<DumpRecord>> {
        let mut records = Vec::new();
        for line in new_lines {
            if let Some(dsn) = dataset_name(line) {
                info!("{}: transaction dump announced: {dsn}", handle.uid);
                records.extend(self.collect_tdump(&handle.uid, dsn, log_dir)?);
            } else if TDUMP_FAILURE_RE.is_match(line) {
                warn!("{}: transaction dump generation failed: {line}", handle.uid);
            }
        }
        Ok(records)
    }

    fn request_application_dump(&self, pid: u32) -> Result<bool> {
        send_signal(pid, APPLICATION_DUMP_SIGNAL)
    }

    fn force_core_dump(&self, pid: u32) -> Result<()> {
        send_signal(pid, ABORT_CORE_SIGNAL).map(|_| ())
    }

    fn secondary_dump_escalation(&self, pid: u32) -> Result<()> {
        send_signal(pid, SECONDARY_DUMP_SIGNAL).map(|_| ())
    }

    fn stop(&self, pid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            send_signal(pid, libc::SIGTERM).map(|_| ())
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            bail!("graceful stop is not supported on this platform");
        }
    }

    fn forced_kill(&self, pid: u32) -> Option<ExternalCommand> {
        // The superkill only works once the preceding forceful kill has
        // been delivered, hence the settle delay before it runs.
        Some(
            ExternalCommand::new("kill")
                .arg("-K")
                .arg(pid.to_string())
                .timeout(Duration::from_secs(30)),
        )
    }
}
