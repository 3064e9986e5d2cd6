use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant, SystemTime};

use crate::prelude::*;
use crate::report::Verdict;

mod expected_outcome;
pub use expected_outcome::ExpectedOutcome;

/// Lifecycle of one monitored process. Transitions are forward-only:
/// Unstarted -> Started -> Completed | Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unstarted,
    Started,
    Completed,
    Error,
}

/// Kinds of crash-diagnostic artifacts a process can leave behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DumpKind {
    Javacore,
    Core,
    Heap,
    Snap,
    Ceedump,
    Tdump,
    DrWatson,
}

impl DumpKind {
    pub fn label(&self) -> &'static str {
        match self {
            DumpKind::Javacore => "javacore",
            DumpKind::Core => "core",
            DumpKind::Heap => "heap",
            DumpKind::Snap => "snap",
            DumpKind::Ceedump => "ceedump",
            DumpKind::Tdump => "tdump",
            DumpKind::DrWatson => "drwatson",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "javacore" => Some(DumpKind::Javacore),
            "core" => Some(DumpKind::Core),
            "heap" => Some(DumpKind::Heap),
            "snap" => Some(DumpKind::Snap),
            "ceedump" => Some(DumpKind::Ceedump),
            "tdump" => Some(DumpKind::Tdump),
            "drwatson" => Some(DumpKind::DrWatson),
            _ => None,
        }
    }
}

/// One discovered dump artifact, owned by the process it belongs to.
#[derive(Debug, Clone)]
pub struct DumpRecord {
    pub kind: DumpKind,
    pub path: PathBuf,
    pub found_at: SystemTime,
}

impl DumpRecord {
    pub fn new(kind: DumpKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            found_at: SystemTime::now(),
        }
    }
}

/// Exit information captured when the OS process completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    pub return_code: i32,
    pub signal_exit_code: i32,
}

impl ProcessResult {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal_exit_code = {
            use std::os::unix::process::ExitStatusExt;
            status.signal().unwrap_or(0)
        };
        #[cfg(not(unix))]
        let signal_exit_code = 0;
        Self {
            return_code: status.code().unwrap_or(0),
            signal_exit_code,
        }
    }

    /// The explicit signal/platform code overrides the raw return code
    /// only when it is non-zero: a forced kill can leave the return code
    /// misleadingly unchanged. Expected-outcome tests depend on this
    /// exact rule.
    pub fn effective_exit_code(&self) -> i32 {
        if self.signal_exit_code != 0 {
            self.signal_exit_code
        } else {
            self.return_code
        }
    }
}

/// The record of one launched process and its mutable runtime state.
pub struct ProcessHandle {
    pub uid: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Monitor-owned ledger of detected dumps, kept separate from the
    /// child's own log files so the child cannot overwrite it.
    pub dumps_path: PathBuf,
    pub stdout_offset: u64,
    pub stderr_offset: u64,
    pub state: ProcessState,
    pub start_time: Option<Instant>,
    pub runtime_limit: Option<Duration>,
    pub expected_outcome: ExpectedOutcome,
    /// The monitor's own control process: hang-marker scanning is
    /// suppressed for its logs to avoid self-triggered false positives.
    pub control_process: bool,
    pub dump_found: bool,
    pub hung: bool,
    pub timed_out: bool,
    pub killed: bool,
    pub triaged: bool,
    pub result: Option<ProcessResult>,
    /// Discovered dump paths keyed by dump type. Only ever grows.
    pub known_dumps: BTreeMap<DumpKind, BTreeSet<PathBuf>>,
    pub dumps: Vec<DumpRecord>,
    pub verdict: Option<Verdict>,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn new(
        uid: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        log_dir: &Path,
    ) -> Self {
        let uid = uid.into();
        // Each process gets its own directory so dump scans are
        // attributed to exactly one process.
        let process_dir = log_dir.join(&uid);
        let stdout_path = process_dir.join(format!("{uid}.stdout"));
        let stderr_path = process_dir.join(format!("{uid}.stderr"));
        let dumps_path = process_dir.join(format!("{uid}.dumps"));
        Self {
            uid,
            command: command.into(),
            args,
            cwd: None,
            stdout_path,
            stderr_path,
            dumps_path,
            stdout_offset: 0,
            stderr_offset: 0,
            state: ProcessState::Unstarted,
            start_time: None,
            runtime_limit: None,
            expected_outcome: ExpectedOutcome::default(),
            control_process: false,
            dump_found: false,
            hung: false,
            timed_out: false,
            killed: false,
            triaged: false,
            result: None,
            known_dumps: BTreeMap::new(),
            dumps: Vec::new(),
            verdict: None,
            child: None,
        }
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.command.clone()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }

    /// Spawn the OS process with stdout/stderr redirected to freshly
    /// truncated log files.
    pub fn launch(&mut self) -> Result<()> {
        if self.state != ProcessState::Unstarted {
            bail!("{}: process launched twice", self.uid);
        }
        let spawn = || -> Result<Child> {
            if let Some(process_dir) = self.stdout_path.parent() {
                std::fs::create_dir_all(process_dir).with_context(|| {
                    format!("failed to create log directory {}", process_dir.display())
                })?;
            }
            let stdout = File::create(&self.stdout_path).with_context(|| {
                format!("failed to create log file {}", self.stdout_path.display())
            })?;
            let stderr = File::create(&self.stderr_path).with_context(|| {
                format!("failed to create log file {}", self.stderr_path.display())
            })?;
            let mut command = Command::new(&self.command);
            command
                .args(&self.args)
                .stdin(Stdio::null())
                .stdout(Stdio::from(stdout))
                .stderr(Stdio::from(stderr));
            if let Some(cwd) = &self.cwd {
                command.current_dir(cwd);
            } else if let Some(process_dir) = self.stdout_path.parent() {
                // Crash artifacts land in the child's cwd; keep them in
                // the directory the dump detector scans.
                command.current_dir(process_dir);
            }
            command.spawn().context("failed to spawn the process")
        };

        debug!("{}: launching {}", self.uid, self.command_line());
        match spawn() {
            Ok(child) => {
                self.child = Some(child);
                self.start_time = Some(Instant::now());
                self.state = ProcessState::Started;
                Ok(())
            }
            Err(err) => {
                self.state = ProcessState::Error;
                Err(err).with_context(|| format!("{}: launch failed", self.uid))
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.start_time.map(|start| start.elapsed())
    }

    /// Check whether the OS process has exited, capturing its result and
    /// moving the handle to Completed on the first observation.
    pub fn poll_exit(&mut self) -> Result<Option<ProcessResult>> {
        if self.state != ProcessState::Started {
            return Ok(self.result);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(None);
        };
        match child
            .try_wait()
            .with_context(|| format!("{}: failed to poll the process", self.uid))?
        {
            Some(status) => {
                let result = ProcessResult::from_status(status);
                debug!(
                    "{}: exited with return code {} (signal code {})",
                    self.uid, result.return_code, result.signal_exit_code
                );
                self.result = Some(result);
                self.state = ProcessState::Completed;
                self.child = None;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Started
    }

    /// Forceful OS-level kill (SIGKILL on unix). The next `poll_exit`
    /// observes the resulting completion.
    pub fn force_kill(&mut self) -> Result<()> {
        if let Some(child) = self.child.as_mut() {
            child
                .kill()
                .with_context(|| format!("{}: failed to kill the process", self.uid))?;
        }
        Ok(())
    }

    pub fn knows_dump(&self, kind: DumpKind, path: &Path) -> bool {
        self.known_dumps
            .get(&kind)
            .is_some_and(|paths| paths.contains(path))
    }

    pub fn add_dump(&mut self, record: DumpRecord) {
        self.known_dumps
            .entry(record.kind)
            .or_default()
            .insert(record.path.clone());
        self.dump_found = true;
        self.dumps.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(dir: &Path) -> ProcessHandle {
        ProcessHandle::new("T1", "true", vec![], dir)
    }

    #[test]
    fn test_log_paths_follow_uid() {
        let h = handle(Path::new("/logs"));
        assert_eq!(h.stdout_path, Path::new("/logs/T1/T1.stdout"));
        assert_eq!(h.stderr_path, Path::new("/logs/T1/T1.stderr"));
        assert_eq!(h.dumps_path, Path::new("/logs/T1/T1.dumps"));
    }

    #[test]
    #[cfg(unix)]
    fn test_default_cwd_is_the_process_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = ProcessHandle::new(
            "CW1",
            "sh",
            vec!["-c".into(), ": > here".into()],
            dir.path(),
        );
        h.launch().unwrap();
        while h.poll_exit().unwrap().is_none() {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(h.stdout_path.parent().unwrap().join("here").exists());
    }

    #[test]
    fn test_known_dumps_only_grow() {
        let mut h = handle(Path::new("/logs"));
        let path = PathBuf::from("/logs/javacore.123.txt");
        assert!(!h.knows_dump(DumpKind::Javacore, &path));
        h.add_dump(DumpRecord::new(DumpKind::Javacore, path.clone()));
        assert!(h.knows_dump(DumpKind::Javacore, &path));
        assert!(h.dump_found);
        // Same path under a different kind is a distinct entry.
        assert!(!h.knows_dump(DumpKind::Core, &path));
    }

    #[test]
    fn test_effective_exit_code_prefers_nonzero_signal_code() {
        let result = ProcessResult {
            return_code: 0,
            signal_exit_code: 9,
        };
        assert_eq!(result.effective_exit_code(), 9);
        let result = ProcessResult {
            return_code: 5,
            signal_exit_code: 0,
        };
        assert_eq!(result.effective_exit_code(), 5);
    }

    #[test]
    #[cfg(unix)]
    fn test_launch_and_poll_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = ProcessHandle::new("SH1", "sh", vec!["-c".into(), "exit 7".into()], dir.path());
        h.launch().unwrap();
        assert_eq!(h.state, ProcessState::Started);
        let result = loop {
            if let Some(result) = h.poll_exit().unwrap() {
                break result;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(h.state, ProcessState::Completed);
        assert_eq!(result.effective_exit_code(), 7);
        assert!(h.stdout_path.exists());
        assert!(h.stderr_path.exists());
    }

    #[test]
    fn test_launch_failure_moves_to_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = ProcessHandle::new(
            "NO1",
            "definitely-not-a-real-binary",
            vec![],
            dir.path(),
        );
        assert!(h.launch().is_err());
        assert_eq!(h.state, ProcessState::Error);
    }
}
