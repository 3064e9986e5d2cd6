use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use regex::Regex;

use crate::helpers::retry::RetryPolicy;
use crate::platform::Platform;
use crate::prelude::*;
use crate::process::{DumpKind, DumpRecord, ProcessHandle};

pub mod collector;
pub mod join;

/// Marker line recorded in a process's dump ledger for every detected
/// dump, so a later re-scan of the same directory does not re-report it.
/// The ledger is a monitor-owned sidecar file: the child writes its logs
/// through its own descriptors and would overwrite anything appended to
/// them.
pub const DUMP_MARKER_PREFIX: &str = "MONITOR DUMP FOUND:";

lazy_static! {
    static ref BASE_PATTERNS: Vec<(DumpKind, Regex)> = vec![
        (DumpKind::Javacore, Regex::new(r"^javacore").unwrap()),
        (DumpKind::Core, Regex::new(r"^core.*dmp$").unwrap()),
        (DumpKind::Heap, Regex::new(r"^heapdump").unwrap()),
        (DumpKind::Snap, Regex::new(r"^Snap").unwrap()),
    ];
}

/// Rename newly found dumps to embed a timestamp, retrying while a
/// writer may still be holding the file open.
#[derive(Debug, Clone)]
pub struct RenamePolicy {
    pub enabled: bool,
    pub retry: RetryPolicy,
}

impl Default for RenamePolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            retry: RetryPolicy::new(90, Duration::from_secs(10)),
        }
    }
}

/// Platform-aware scan for newly-created crash-diagnostic files in a
/// process's log directory.
pub struct DumpDetector<'p> {
    platform: &'p dyn Platform,
    rename: RenamePolicy,
}

impl<'p> DumpDetector<'p> {
    pub fn new(platform: &'p dyn Platform, rename: RenamePolicy) -> Self {
        Self { platform, rename }
    }

    /// Fold marker lines already present in the dump ledger into the
    /// handle's known set, so dumps detected by an earlier invocation
    /// over the same directory are not re-reported.
    pub fn prime(&self, handle: &mut ProcessHandle) -> Result<()> {
        let Ok(content) = fs::read_to_string(&handle.dumps_path) else {
            return Ok(());
        };
        for line in content.lines() {
            let Some(rest) = line.strip_prefix(DUMP_MARKER_PREFIX) else {
                continue;
            };
            let Some((label, path)) = rest.trim_start().split_once(' ') else {
                continue;
            };
            let Some(kind) = DumpKind::from_label(label) else {
                continue;
            };
            handle
                .known_dumps
                .entry(kind)
                .or_default()
                .insert(PathBuf::from(path));
        }
        Ok(())
    }

    /// Detect dumps created since the last check: filename-pattern scan
    /// of the log directory plus platform-specific log-announced dumps
    /// from the lines consumed by this poll. Previously known paths are
    /// never re-reported.
    pub fn scan(
        &self,
        handle: &mut ProcessHandle,
        stdout_lines: &[String],
        stderr_lines: &[String],
    ) -> Result<Vec<DumpRecord>> {
        let log_dir = handle
            .stdout_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut found = Vec::new();

        if let Ok(entries) = fs::read_dir(&log_dir) {
            for entry in entries.flatten() {
                if !entry.file_type().is_ok_and(|t| t.is_file()) {
                    continue;
                }
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some(kind) = self.match_kind(&file_name) else {
                    continue;
                };
                let path = entry.path();
                if handle.knows_dump(kind, &path) {
                    continue;
                }
                let path = if self.rename.enabled {
                    self.rename_dump(&path)
                } else {
                    path
                };
                if handle.knows_dump(kind, &path) {
                    continue;
                }
                self.record(handle, DumpRecord::new(kind, path), &mut found)?;
            }
        }

        for lines in [stdout_lines, stderr_lines] {
            for record in self.platform.scan_log_dumps(handle, lines, &log_dir)? {
                if handle.knows_dump(record.kind, &record.path) {
                    continue;
                }
                self.record(handle, record, &mut found)?;
            }
        }
        Ok(found)
    }

    fn record(
        &self,
        handle: &mut ProcessHandle,
        record: DumpRecord,
        found: &mut Vec<DumpRecord>,
    ) -> Result<()> {
        info!(
            "{}: found {} dump {}",
            handle.uid,
            record.kind.label(),
            record.path.display()
        );
        self.append_marker(handle, &record)?;
        handle.add_dump(record.clone());
        found.push(record);
        Ok(())
    }

    fn match_kind(&self, file_name: &str) -> Option<DumpKind> {
        BASE_PATTERNS
            .iter()
            .chain(self.platform.extra_file_patterns())
            .find(|(_, pattern)| pattern.is_match(file_name))
            .map(|(kind, _)| *kind)
    }

    /// Atomically rename a newly found dump to embed a timestamp. The
    /// writer may still hold the file open, so the rename is retried up
    /// to the policy's budget; past it, the dump is reported under its
    /// original name.
    fn rename_dump(&self, path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        let target = path.with_file_name(format!("{file_name}.{timestamp}"));
        let renamed = self.rename.retry.run(|attempt| match fs::rename(path, &target) {
            Ok(()) => Some(()),
            Err(err) => {
                debug!(
                    "rename attempt {attempt} of {} failed: {err}",
                    path.display()
                );
                None
            }
        });
        if renamed.is_some() {
            target
        } else {
            warn!(
                "could not rename dump {} after {} attempts; reporting it under its original name",
                path.display(),
                self.rename.retry.max_attempts
            );
            path.to_path_buf()
        }
    }

    fn append_marker(&self, handle: &ProcessHandle, record: &DumpRecord) -> Result<()> {
        let mut ledger = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&handle.dumps_path)
            .with_context(|| {
                format!("failed to open dump ledger {}", handle.dumps_path.display())
            })?;
        writeln!(
            ledger,
            "{DUMP_MARKER_PREFIX} {} {}",
            record.kind.label(),
            record.path.display()
        )
        .with_context(|| format!("failed to write marker to {}", handle.dumps_path.display()))?;
        Ok(())
    }
}
