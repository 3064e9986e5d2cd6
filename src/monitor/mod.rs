use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::dumps::collector::{CollectorPolicy, collect_diagnostics};
use crate::dumps::{DumpDetector, RenamePolicy};
use crate::platform::Platform;
use crate::prelude::*;
use crate::process::{ExpectedOutcome, ProcessHandle, ProcessState};
use crate::report;

mod log_tailer;
pub use log_tailer::{HANG_MARKER, TAIL_TARGET, TailOutcome, tail_log};

pub const POLL_SLEEP_FLOOR: Duration = Duration::from_millis(5);
pub const POLL_SLEEP_CEILING: Duration = Duration::from_millis(500);
pub const POLL_SLEEP_FALLBACK: Duration = Duration::from_secs(1);

/// Inter-poll sleep: target 1% of the longest elapsed runtime, clamped
/// to balance CPU spin on short runs against check latency on long
/// ones. Without a start instant to measure from, fall back to a fixed
/// one-second sleep.
pub fn adaptive_poll_delay(longest_elapsed: Option<Duration>) -> Duration {
    match longest_elapsed {
        Some(elapsed) => (elapsed / 100).clamp(POLL_SLEEP_FLOOR, POLL_SLEEP_CEILING),
        None => POLL_SLEEP_FALLBACK,
    }
}

/// Per-invocation monitoring context carrying the next-heartbeat
/// deadline.
struct MonitorSession {
    next_heartbeat: Instant,
    period: Duration,
}

impl MonitorSession {
    fn new(period: Duration) -> Self {
        Self {
            next_heartbeat: Instant::now() + period,
            period,
        }
    }

    fn heartbeat_due(&mut self, now: Instant) -> bool {
        if now >= self.next_heartbeat {
            self.next_heartbeat = now + self.period;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEnd {
    /// Every handle not expected to run forever has completed.
    AllCompleted,
    /// A fatal condition (hang or timeout) short-circuited the loop.
    Fatal { uid: String },
    /// The caller's stop flag was raised.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Echo complete child log lines while polling.
    pub echo: bool,
    pub heartbeat_period: Duration,
    pub rename: RenamePolicy,
    pub collector: CollectorPolicy,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            echo: true,
            heartbeat_period: Duration::from_secs(30),
            rename: RenamePolicy::default(),
            collector: CollectorPolicy::default(),
        }
    }
}

/// The polling loop driving log tailing, dump detection and
/// timeout/heartbeat checks across a set of processes. Observation is
/// sequential per poll cycle, in stable uid order; concurrency comes
/// from the monitored OS processes themselves.
pub struct Monitor {
    platform: Box<dyn Platform>,
    settings: MonitorSettings,
}

impl Monitor {
    pub fn new(platform: Box<dyn Platform>, settings: MonitorSettings) -> Self {
        Self { platform, settings }
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// Block until a fatal condition is detected on any handle, every
    /// handle not expected to run forever has completed, or `cancel` is
    /// raised. Handles expected to never complete are still polled for
    /// hangs, dumps and the heartbeat, but excluded from the "all done"
    /// test.
    pub fn run(&self, handles: &mut [ProcessHandle], cancel: &AtomicBool) -> Result<MonitorEnd> {
        handles.sort_by(|a, b| a.uid.cmp(&b.uid));
        for pair in handles.windows(2) {
            if pair[0].uid == pair[1].uid {
                bail!("duplicate process uid `{}`", pair[0].uid);
            }
        }

        let detector = DumpDetector::new(self.platform.as_ref(), self.settings.rename.clone());
        for handle in handles.iter_mut() {
            detector.prime(handle)?;
        }

        let mut session = MonitorSession::new(self.settings.heartbeat_period);
        let end = loop {
            if cancel.load(Ordering::Relaxed) {
                info!("monitoring cancelled");
                break MonitorEnd::Cancelled;
            }

            let mut fatal = None;
            for handle in handles.iter_mut() {
                if handle.state != ProcessState::Started {
                    continue;
                }
                if self.poll_handle(handle, &detector)? {
                    fatal = Some(handle.uid.clone());
                    break;
                }
            }
            if let Some(uid) = fatal {
                // Fail fast: stop polling the other handles rather than
                // waiting out an already-doomed run.
                break MonitorEnd::Fatal { uid };
            }

            let all_done = handles.iter().all(|handle| {
                handle.expected_outcome == ExpectedOutcome::Never
                    || handle.state != ProcessState::Started
            });
            if all_done {
                break MonitorEnd::AllCompleted;
            }

            let running: Vec<&ProcessHandle> = handles
                .iter()
                .filter(|handle| handle.state == ProcessState::Started)
                .collect();
            if session.heartbeat_due(Instant::now()) {
                let status = running
                    .iter()
                    .map(|handle| {
                        let elapsed = handle.elapsed().unwrap_or_default();
                        format!(
                            "{} ({})",
                            handle.uid,
                            humantime::format_duration(Duration::from_secs(elapsed.as_secs()))
                        )
                    })
                    .join(", ");
                info!("heartbeat: still monitoring {status}");
            }

            let longest_elapsed = running.iter().filter_map(|handle| handle.elapsed()).max();
            thread::sleep(adaptive_poll_delay(longest_elapsed));
        };

        // One final drain pass so no trailing output is lost, then triage
        // anything that completed without being observed in the loop.
        for handle in handles.iter_mut() {
            if let Err(err) = handle.poll_exit() {
                warn!("{}: final exit poll failed: {err:#}", handle.uid);
            }
            self.drain_logs(handle);
            report::triage(handle);
        }
        Ok(end)
    }

    /// One poll of one started handle. Returns true when a fatal
    /// condition fired for it.
    fn poll_handle(&self, handle: &mut ProcessHandle, detector: &DumpDetector) -> Result<bool> {
        let echo = self.settings.echo;
        let suppress = handle.control_process;
        let stdout = tail_log(
            &handle.stdout_path,
            &mut handle.stdout_offset,
            &handle.uid,
            None,
            echo,
            suppress,
        )?;
        let stderr = tail_log(
            &handle.stderr_path,
            &mut handle.stderr_offset,
            &handle.uid,
            Some("[stderr]"),
            echo,
            suppress,
        )?;
        if (stdout.hang_detected || stderr.hang_detected) && !handle.hung {
            warn!("{}: hang marker observed in log", handle.uid);
            handle.hung = true;
        }

        detector.scan(handle, &stdout.lines, &stderr.lines)?;

        if handle.poll_exit()?.is_some() {
            report::triage(handle);
            return Ok(false);
        }

        if let (Some(limit), Some(elapsed)) = (handle.runtime_limit, handle.elapsed()) {
            if elapsed > limit && !handle.timed_out {
                warn!(
                    "{}: runtime limit {} exceeded (elapsed {})",
                    handle.uid,
                    humantime::format_duration(limit),
                    humantime::format_duration(Duration::from_secs(elapsed.as_secs()))
                );
                handle.timed_out = true;
            }
        }

        if handle.hung || handle.timed_out {
            collect_diagnostics(handle, self.platform.as_ref(), &self.settings.collector)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn drain_logs(&self, handle: &mut ProcessHandle) {
        let echo = self.settings.echo;
        let suppress = handle.control_process;
        let mut hang_detected = false;
        for (path, offset, tag) in [
            (handle.stdout_path.clone(), &mut handle.stdout_offset, None),
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Duration::ZERO, POLL_SLEEP_FLOOR)]
    #[case(Duration::from_millis(100), POLL_SLEEP_FLOOR)]
    // 1% of the elapsed time once inside the clamp window.
    #[case(Duration::from_secs(10), Duration::from_millis(100))]
    #[case(Duration::from_secs(50), POLL_SLEEP_CEILING)]
    #[case(Duration::from_secs(100_000), POLL_SLEEP_CEILING)]
    fn test_adaptive_poll_delay_is_clamped(
        #[case] elapsed: Duration,
        #[case] expected: Duration,
    ) {
        assert_eq!(adaptive_poll_delay(Some(elapsed)), expected);
    }

    #[test]
    fn test_adaptive_poll_delay_fallback() {
        assert_eq!(adaptive_poll_delay(None), POLL_SLEEP_FALLBACK);
    }

    #[test]
    fn test_heartbeat_is_periodic() {
        let mut session = MonitorSession::new(Duration::from_millis(50));
        let start = Instant::now();
        assert!(!session.heartbeat_due(start));
        assert!(session.heartbeat_due(start + Duration::from_millis(60)));
        // Deadline rescheduled from the observation time.
        assert!(!session.heartbeat_due(start + Duration::from_millis(80)));
        assert!(session.heartbeat_due(start + Duration::from_millis(120)));
    }
}
