use std::thread;
use std::time::Duration;

use crate::helpers::retry::RetryPolicy;
use crate::monitor::tail_log;
use crate::platform::Platform;
use crate::prelude::*;
use crate::process::ProcessHandle;

/// How long to wait for a process to disappear after each rung of the
/// kill ladder.
const EXIT_WAIT: RetryPolicy = RetryPolicy::new(10, Duration::from_millis(500));

/// Escalating shutdown of a single process: graceful stop, forceful
/// terminate, then the platform's forced kill if it has one. Escalates
/// only as far as necessary; invoking it on an already-stopped process
/// succeeds without escalation. Returns true when the process is gone.
pub fn terminate(
    handle: &mut ProcessHandle,
    platform: &dyn Platform,
    echo: bool,
) -> Result<bool> {
    let result = run_ladder(handle, platform);
    // Whatever happened, drain any remaining unread log output.
    drain_logs(handle, echo);
    result
}

fn run_ladder(handle: &mut ProcessHandle, platform: &dyn Platform) -> Result<bool> {
    if handle.poll_exit()?.is_some() || !handle.is_running() {
        return Ok(true);
    }
    let Some(pid) = handle.pid() else {
        return Ok(true);
    };

    info!("{}: stopping (graceful)", handle.uid);
    if let Err(err) = platform.stop(pid) {
        warn!("{}: graceful stop failed: {err:#}", handle.uid);
    }
    if wait_for_exit(handle)? {
        handle.killed = true;
        return Ok(true);
    }

    info!("{}: terminating (forceful)", handle.uid);
    handle.force_kill()?;
    if wait_for_exit(handle)? {
        handle.killed = true;
        return Ok(true);
    }

    if let Some(forced_kill) = platform.forced_kill(pid) {
        // The forced kill requires the prior forceful kill to have
        // already taken effect.
        thread::sleep(platform.forced_kill_settle());
        info!("{}: invoking platform forced kill", handle.uid);
        let output = forced_kill.run()?;
        if !output.success() {
            warn!(
                "{}: forced kill reported failure: {}",
                handle.uid,
                output.stderr.trim()
            );
        }
        if wait_for_exit(handle)? {
            handle.killed = true;
            return Ok(true);
        }
    }

    error!(
        "{}: could not be terminated; manual cleanup required",
        handle.uid
    );
    Ok(false)
}

fn wait_for_exit(handle: &mut ProcessHandle) -> Result<bool> {
    let mut poll_error = None;
    let exited = EXIT_WAIT
        .run(|_| match handle.poll_exit() {
            Ok(Some(_)) => Some(true),
            Ok(None) => None,
            Err(err) => {
                poll_error = Some(err);
                Some(false)
            }
        })
        .unwrap_or(false);
    match poll_error {
        Some(err) => Err(err),
        None => Ok(exited),
    }
}

fn drain_logs(handle: &mut ProcessHandle, echo: bool) {
    let suppress = handle.control_process;
    let mut hang_detected = false;
    for (path, offset, tag) in [
        (
            handle.stdout_path.clone(),
            &mut handle.stdout_offset,
            None,
        ),
        (
            handle.stderr_path.clone(),
            &mut handle.stderr_offset,
            Some("[stderr]"),
        ),
    ] {
        match tail_log(&path, offset, &handle.uid, tag, echo, suppress) {
            Ok(outcome) => hang_detected |= outcome.hang_detected,
            Err(err) => warn!("failed to drain log {}: {err:#}", path.display()),
        }
    }
    if hang_detected && !handle.hung {
        warn!("{}: hang marker observed in trailing output", handle.uid);
        handle.hung = true;
    }
}
