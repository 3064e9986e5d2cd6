//! End-to-end monitoring scenarios driving real `/bin/sh` children.
#![cfg(unix)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use loadtest_runner::dumps::RenamePolicy;
use loadtest_runner::dumps::collector::CollectorPolicy;
use loadtest_runner::helpers::retry::RetryPolicy;
use loadtest_runner::monitor::{Monitor, MonitorEnd, MonitorSettings};
use loadtest_runner::platform::default_platform;
use loadtest_runner::process::{ExpectedOutcome, ProcessHandle, ProcessState};
use loadtest_runner::report::evaluate;
use loadtest_runner::terminator;
use tempfile::TempDir;

fn sh(uid: &str, script: &str, dir: &Path) -> ProcessHandle {
    ProcessHandle::new(uid, "sh", vec!["-c".into(), script.into()], dir)
}

fn fast_monitor() -> Monitor {
    let settings = MonitorSettings {
        echo: false,
        heartbeat_period: Duration::from_millis(200),
        rename: RenamePolicy {
            enabled: false,
            retry: RetryPolicy::new(1, Duration::ZERO),
        },
        collector: CollectorPolicy {
            attempts: 1,
            flush_pause: Duration::from_millis(20),
        },
    };
    Monitor::new(default_platform(), settings)
}

fn run_monitor(handles: &mut [ProcessHandle]) -> MonitorEnd {
    let cancel = AtomicBool::new(false);
    fast_monitor().run(handles, &cancel).unwrap()
}

#[test]
fn clean_run_passes() {
    let dir = TempDir::new().unwrap();
    let mut handles = vec![sh("CL", "echo working; exit 0", dir.path())];
    handles[0].launch().unwrap();

    let end = run_monitor(&mut handles);
    assert_eq!(end, MonitorEnd::AllCompleted);
    assert_eq!(handles[0].state, ProcessState::Completed);
    assert!(handles[0].triaged);
    assert!(handles[0].verdict.as_ref().unwrap().passed());
}

#[test]
fn exit_value_set_accepts_any_member() {
    let dir = TempDir::new().unwrap();
    let mut handle = sh("EV", "exit 2", dir.path());
    handle.expected_outcome = "exitValue:0,2".parse().unwrap();
    handle.launch().unwrap();
    let mut handles = vec![handle];

    let end = run_monitor(&mut handles);
    assert_eq!(end, MonitorEnd::AllCompleted);
    let verdict = handles[0].verdict.as_ref().unwrap();
    assert!(verdict.passed(), "got: {}", verdict.reason());
}

#[test]
fn expected_crash_without_dump_fails() {
    let dir = TempDir::new().unwrap();
    let mut handle = sh("CR", "exit 0", dir.path());
    handle.expected_outcome = ExpectedOutcome::Crashes;
    handle.launch().unwrap();
    let mut handles = vec![handle];

    run_monitor(&mut handles);
    let verdict = handles[0].verdict.as_ref().unwrap();
    assert!(!verdict.passed());
    assert_eq!(verdict.reason(), "expected to crash but no dumps were found");
}

#[test]
fn expected_crash_with_artifact_passes() {
    let dir = TempDir::new().unwrap();
    // With no explicit cwd the child runs inside the per-process log
    // directory, so its crash artifact lands where the detector scans.
    let mut handle = sh(
        "CR",
        "echo dump > javacore.001.txt; sleep 1; exit 1",
        dir.path(),
    );
    handle.expected_outcome = ExpectedOutcome::Crashes;
    handle.launch().unwrap();
    let mut handles = vec![handle];

    run_monitor(&mut handles);
    let verdict = handles[0].verdict.as_ref().unwrap();
    assert!(verdict.passed(), "got: {}", verdict.reason());
    assert_eq!(verdict.reason(), "crashed as expected");
}

#[test]
fn never_ending_process_that_exits_fails() {
    let dir = TempDir::new().unwrap();
    let mut handle = sh("NV", "exit 0", dir.path());
    handle.expected_outcome = ExpectedOutcome::Never;
    handle.launch().unwrap();
    // A Never handle does not hold the monitor open, so make sure the
    // exit has happened before the first poll observes it.
    std::thread::sleep(Duration::from_millis(500));
    let mut handles = vec![handle];

    run_monitor(&mut handles);
    let verdict = handles[0].verdict.as_ref().unwrap();
    assert_eq!(verdict.reason(), "ended unexpectedly");
}

#[test]
fn monitor_returns_while_never_handle_still_runs() {
    let dir = TempDir::new().unwrap();
    let mut never = sh("NV", "sleep 30", dir.path());
    never.expected_outcome = ExpectedOutcome::Never;
    never.launch().unwrap();
    let mut clean = sh("CL", "exit 0", dir.path());
    clean.launch().unwrap();
    let mut handles = vec![never, clean];

    let started = Instant::now();
    let end = run_monitor(&mut handles);
    assert_eq!(end, MonitorEnd::AllCompleted);
    assert!(started.elapsed() < Duration::from_secs(10));

    // Sorted by uid: CL first.
    assert_eq!(handles[0].uid, "CL");
    assert_eq!(handles[0].state, ProcessState::Completed);
    assert_eq!(handles[1].uid, "NV");
    assert!(handles[1].is_running());
    assert_eq!(evaluate(&handles[1]).reason(), "running as expected");

    // Cleanup is the caller's job, not the monitor's.
    let platform = default_platform();
    assert!(terminator::terminate(&mut handles[1], platform.as_ref(), false).unwrap());
    assert!(!handles[1].is_running());
}

#[test]
fn runtime_limit_trips_timeout_and_short_circuits() {
    let dir = TempDir::new().unwrap();
    let mut slow = sh("TO", "sleep 30", dir.path());
    slow.runtime_limit = Some(Duration::from_millis(200));
    slow.launch().unwrap();
    // A second healthy handle shows the fail-fast short-circuit: the
    // monitor does not wait for it.
    let mut other = sh("OK", "sleep 30", dir.path());
    other.expected_outcome = ExpectedOutcome::Never;
    other.launch().unwrap();
    let mut handles = vec![slow, other];

    let started = Instant::now();
    let end = run_monitor(&mut handles);
    assert_eq!(
        end,
        MonitorEnd::Fatal {
            uid: "TO".to_string()
        }
    );
    assert!(started.elapsed() < Duration::from_secs(10));

    let timed_out = handles.iter().find(|h| h.uid == "TO").unwrap();
    assert!(timed_out.timed_out);
    assert_eq!(evaluate(timed_out).reason(), "timed out");

    for handle in handles.iter_mut() {
        if handle.is_running() {
            let platform = default_platform();
            terminator::terminate(handle, platform.as_ref(), false).unwrap();
        }
    }
}

#[test]
fn hang_marker_in_log_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut handle = sh("HG", "echo POSSIBLE HANG DETECTED; sleep 30", dir.path());
    handle.launch().unwrap();
    let mut handles = vec![handle];

    let end = run_monitor(&mut handles);
    assert_eq!(
        end,
        MonitorEnd::Fatal {
            uid: "HG".to_string()
        }
    );
    assert!(handles[0].hung);
    assert_eq!(evaluate(&handles[0]).reason(), "hang reported in log");

    let platform = default_platform();
    terminator::terminate(&mut handles[0], platform.as_ref(), false).unwrap();
}

#[test]
fn hang_marker_in_trailing_output_is_judged() {
    let dir = TempDir::new().unwrap();
    let mut handle = sh("HT", "echo POSSIBLE HANG DETECTED; exit 0", dir.path());
    handle.launch().unwrap();
    // Let the process finish before monitoring starts, so the marker is
    // only ever seen by the final drain pass.
    while handle.poll_exit().unwrap().is_none() {
        std::thread::sleep(Duration::from_millis(10));
    }
    let mut handles = vec![handle];

    let end = run_monitor(&mut handles);
    assert_eq!(end, MonitorEnd::AllCompleted);
    assert!(handles[0].hung);
    assert_eq!(
        handles[0].verdict.as_ref().unwrap().reason(),
        "hang reported in log"
    );
}

#[test]
fn hang_marker_from_control_process_is_ignored() {
    let dir = TempDir::new().unwrap();
    let mut handle = sh("CT", "echo POSSIBLE HANG DETECTED; exit 0", dir.path());
    handle.control_process = true;
    handle.launch().unwrap();
    let mut handles = vec![handle];

    let end = run_monitor(&mut handles);
    assert_eq!(end, MonitorEnd::AllCompleted);
    assert!(!handles[0].hung);
    assert!(handles[0].verdict.as_ref().unwrap().passed());
}

#[test]
fn cancellation_flag_stops_the_loop() {
    let dir = TempDir::new().unwrap();
    let mut handle = sh("CA", "sleep 30", dir.path());
    handle.launch().unwrap();
    let mut handles = vec![handle];

    let cancel = AtomicBool::new(false);
    cancel.store(true, Ordering::Relaxed);
    let end = fast_monitor().run(&mut handles, &cancel).unwrap();
    assert_eq!(end, MonitorEnd::Cancelled);

    let platform = default_platform();
    terminator::terminate(&mut handles[0], platform.as_ref(), false).unwrap();
}

#[test]
fn duplicate_uids_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut handles = vec![sh("DU", "exit 0", dir.path()), sh("DU", "exit 1", dir.path())];
    let cancel = AtomicBool::new(false);
    assert!(fast_monitor().run(&mut handles, &cancel).is_err());
}

#[test]
fn trailing_output_is_drained_after_completion() {
    let dir = TempDir::new().unwrap();
    let mut handles = vec![sh("DR", "printf 'one\\ntwo\\nthree\\n'; exit 0", dir.path())];
    handles[0].launch().unwrap();

    run_monitor(&mut handles);
    // Every complete line was consumed by the final drain pass.
    let log_len = std::fs::metadata(&handles[0].stdout_path).unwrap().len();
    assert_eq!(handles[0].stdout_offset, log_len);
}
