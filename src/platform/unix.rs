use super::{
    ABORT_CORE_SIGNAL, APPLICATION_DUMP_SIGNAL, Platform, SECONDARY_DUMP_SIGNAL, send_signal,
};
use crate::prelude::*;

/// Generic unix-like platform. Diagnostics are driven entirely by
/// signals and the kill ladder ends at the ordinary forceful kill.
pub struct UnixPlatform;

impl Platform for UnixPlatform {
    fn name(&self) -> &'static str {
        "unix"
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
}
