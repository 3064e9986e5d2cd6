use itertools::Itertools;

use crate::prelude::*;
use crate::process::{ExpectedOutcome, ProcessHandle, ProcessState};

/// The pass/fail judgement of one process against its expected outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass(String),
    Fail(String),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            Verdict::Pass(reason) | Verdict::Fail(reason) => reason,
        }
    }
}

/// Judge a process's final state against its expected outcome. The
/// checks run in a fixed order and the first match wins; the dump
/// expectations are checked first and unconditionally short-circuit the
/// code-based checks.
pub fn evaluate(handle: &ProcessHandle) -> Verdict {
    if handle.state == ProcessState::Error {
        return Verdict::Fail("failed to start".to_string());
    }
    if handle.state == ProcessState::Unstarted {
        return Verdict::Fail("was never started".to_string());
    }

    let expected_crash = handle.expected_outcome == ExpectedOutcome::Crashes;
    match (handle.dump_found, expected_crash) {
        (true, false) => return Verdict::Fail("crashed unexpectedly".to_string()),
        (false, true) => {
            return Verdict::Fail("expected to crash but no dumps were found".to_string());
        }
        (true, true) => return Verdict::Pass("crashed as expected".to_string()),
        (false, false) => {}
    }

    if handle.expected_outcome == ExpectedOutcome::Never
        && handle.state == ProcessState::Completed
    {
        return Verdict::Fail("ended unexpectedly".to_string());
    }
    if handle.timed_out {
        return Verdict::Fail("timed out".to_string());
    }
    if handle.hung {
        return Verdict::Fail("hang reported in log".to_string());
    }
    if handle.killed {
        return Verdict::Fail("required forced termination".to_string());
    }

    if handle.state == ProcessState::Started {
        return if handle.expected_outcome == ExpectedOutcome::Never {
            Verdict::Pass("running as expected".to_string())
        } else {
            Verdict::Fail("still running".to_string())
        };
    }

    // Completed.
    let effective = handle
        .result
        .map(|result| result.effective_exit_code())
        .unwrap_or(0);
    match &handle.expected_outcome {
        ExpectedOutcome::ExitValue(codes) => {
            if codes.contains(&effective) {
                Verdict::Pass(format!("completed with expected exit code {effective}"))
            } else {
                let codes = codes.iter().map(i32::to_string).join(", ");
                Verdict::Fail(format!(
                    "exit code {effective} is not in the expected set {{{codes}}}"
                ))
            }
        }
        _ => {
            if effective == 0 {
                Verdict::Pass("completed cleanly".to_string())
            } else {
                Verdict::Fail(format!("completed with unexpected exit code {effective}"))
            }
        }
    }
}

/// One-time triage of a completed process: computes and caches the
/// verdict on the first observation of completion.
pub fn triage(handle: &mut ProcessHandle) {
    if handle.state != ProcessState::Completed || handle.triaged {
        return;
    }
    let verdict = evaluate(handle);
    match &verdict {
        Verdict::Pass(reason) => info!("{}: {reason}", handle.uid),
        Verdict::Fail(reason) => warn!("{}: {reason}", handle.uid),
    }
    handle.verdict = Some(verdict);
    handle.triaged = true;
}

/// Emit the aggregate report, one precedence-ordered verdict line per
/// handle in uid order, and return whether every handle passed. Two runs
/// over the same outcomes produce byte-for-byte identical output.
pub fn emit_report(handles: &[ProcessHandle]) -> bool {
    let mut sorted: Vec<&ProcessHandle> = handles.iter().collect();
    sorted.sort_by(|a, b| a.uid.cmp(&b.uid));
    let uid_width = sorted.iter().map(|h| h.uid.len()).max().unwrap_or(0);

    println!();
    println!("Process results:");
    let mut all_passed = true;
    for handle in sorted {
        let verdict = handle
            .verdict
            .clone()
            .unwrap_or_else(|| evaluate(handle));
        if !verdict.passed() {
            all_passed = false;
        }
        let tag = if verdict.passed() { "PASS" } else { "FAIL" };
        println!(
            "  {tag} {:uid_width$}  {}",
            handle.uid,
            verdict.reason()
        );
    }
    println!(
        "Overall result: {}",
        if all_passed { "PASSED" } else { "FAILED" }
    );
    all_passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{DumpKind, DumpRecord, ProcessResult};
    use rstest::rstest;
    use std::collections::BTreeSet;
    use std::path::Path;

    fn completed_handle(return_code: i32, signal_exit_code: i32) -> ProcessHandle {
        let mut handle = ProcessHandle::new("R1", "true", vec![], Path::new("/logs"));
        handle.state = ProcessState::Completed;
        handle.result = Some(ProcessResult {
            return_code,
            signal_exit_code,
        });
        handle
    }

    fn with_dump(mut handle: ProcessHandle) -> ProcessHandle {
        handle.add_dump(DumpRecord::new(
            DumpKind::Core,
            "/logs/core.1.dmp".into(),
        ));
        handle
    }

    #[test]
    fn test_unexpected_dump_beats_clean_exit() {
        let handle = with_dump(completed_handle(0, 0));
        let verdict = evaluate(&handle);
        assert_eq!(verdict, Verdict::Fail("crashed unexpectedly".to_string()));
    }

    #[test]
    fn test_expected_crash_without_dump_fails() {
        let mut handle = completed_handle(134, 0);
        handle.expected_outcome = ExpectedOutcome::Crashes;
        let verdict = evaluate(&handle);
        assert!(!verdict.passed());
        assert_eq!(verdict.reason(), "expected to crash but no dumps were found");
    }

    #[test]
    fn test_expected_crash_with_dump_passes_despite_exit_code() {
        let mut handle = with_dump(completed_handle(134, 6));
        handle.expected_outcome = ExpectedOutcome::Crashes;
        assert!(evaluate(&handle).passed());
    }

    #[test]
    fn test_never_that_completes_fails() {
        let mut handle = completed_handle(0, 0);
        handle.expected_outcome = ExpectedOutcome::Never;
        assert_eq!(evaluate(&handle).reason(), "ended unexpectedly");
    }

    #[test]
    fn test_never_still_running_passes() {
        let mut handle = ProcessHandle::new("R1", "true", vec![], Path::new("/logs"));
        handle.state = ProcessState::Started;
        handle.expected_outcome = ExpectedOutcome::Never;
        assert_eq!(evaluate(&handle).reason(), "running as expected");
    }

    #[test]
    fn test_timeout_beats_hang_and_kill() {
        let mut handle = completed_handle(0, 9);
        handle.timed_out = true;
        handle.hung = true;
        handle.killed = true;
        assert_eq!(evaluate(&handle).reason(), "timed out");
    }

    #[test]
    fn test_hang_beats_kill() {
        let mut handle = completed_handle(0, 9);
        handle.hung = true;
        handle.killed = true;
        assert_eq!(evaluate(&handle).reason(), "hang reported in log");
    }

    #[test]
    fn test_killed_process_fails() {
        let mut handle = completed_handle(0, 9);
        handle.killed = true;
        assert_eq!(evaluate(&handle).reason(), "required forced termination");
    }

    #[rstest]
    #[case(&[0, 2], 0, 0, true)]
    #[case(&[0, 2], 2, 0, true)]
    #[case(&[0, 2], 3, 0, false)]
    #[case(&[134], 0, 134, true)]
    // The non-zero signal code overrides an unchanged return code.
    #[case(&[0], 0, 9, false)]
    fn test_exit_value_sets(
        #[case] codes: &[i32],
        #[case] return_code: i32,
        #[case] signal_exit_code: i32,
        #[case] expect_pass: bool,
    ) {
        let mut handle = completed_handle(return_code, signal_exit_code);
        handle.expected_outcome =
            ExpectedOutcome::ExitValue(BTreeSet::from_iter(codes.iter().copied()));
        assert_eq!(evaluate(&handle).passed(), expect_pass);
    }

    #[test]
    fn test_clean_run_requires_exit_zero() {
        assert!(evaluate(&completed_handle(0, 0)).passed());
        assert!(!evaluate(&completed_handle(1, 0)).passed());
    }

    #[test]
    fn test_triage_runs_exactly_once() {
        let mut handle = completed_handle(0, 0);
        triage(&mut handle);
        assert!(handle.triaged);
        let first = handle.verdict.clone();
        // Later flag changes must not alter the cached verdict.
        handle.killed = true;
        triage(&mut handle);
        assert_eq!(handle.verdict, first);
    }

    #[test]
    fn test_triage_ignores_running_process() {
        let mut handle = ProcessHandle::new("R2", "true", vec![], Path::new("/logs"));
        handle.state = ProcessState::Started;
        triage(&mut handle);
        assert!(!handle.triaged);
        assert!(handle.verdict.is_none());
    }
}
