use std::thread;
use std::time::Duration;

use crate::platform::Platform;
use crate::prelude::*;
use crate::process::ProcessHandle;

/// How hard to push a process for diagnostics before escalating.
#[derive(Debug, Clone, Copy)]
pub struct CollectorPolicy {
    /// Application-level dump attempts before the OS-level escalation.
    pub attempts: u32,
    /// Pause after each attempt so the diagnostic can be flushed to disk.
    pub flush_pause: Duration,
}

impl Default for CollectorPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            flush_pause: Duration::from_secs(30),
        }
    }
}

/// Drive diagnostic generation for a process caught hanging or running
/// past its limit: application-level dump requests with bounded
/// attempts, then an OS-level abort to force a core dump, then one last
/// secondary escalation for a wedged diagnostic handler. Aborts early if
/// the process exits in the meantime.
pub fn collect_diagnostics(
    handle: &mut ProcessHandle,
    platform: &dyn Platform,
    policy: &CollectorPolicy,
) -> Result<()> {
    let Some(pid) = handle.pid() else {
        return Ok(());
    };

    let mut delivered = false;
    for attempt in 1..=policy.attempts {
        if handle.poll_exit()?.is_some() {
            debug!("{}: exited before diagnostics were requested", handle.uid);
            return Ok(());
        }
        info!(
            "{}: requesting application dump (attempt {attempt}/{})",
            handle.uid, policy.attempts
        );
        match platform.request_application_dump(pid) {
            Ok(true) => {
                delivered = true;
                thread::sleep(policy.flush_pause);
                break;
            }
            Ok(false) => {
                debug!("{}: application dump request was not delivered", handle.uid);
            }
            Err(err) => {
                warn!("{}: application dump request failed: {err:#}", handle.uid);
            }
        }
        thread::sleep(policy.flush_pause);
    }

    if !delivered && handle.poll_exit()?.is_none() {
        warn!(
            "{}: application dump attempts exhausted, forcing an OS-level core dump",
            handle.uid
        );
        platform.force_core_dump(pid)?;
        thread::sleep(policy.flush_pause);
        if handle.poll_exit()?.is_none() {
            warn!("{}: escalating to the secondary dump signal", handle.uid);
            platform.secondary_dump_escalation(pid)?;
        }
    }
    Ok(())
}
