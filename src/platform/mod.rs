use std::path::Path;
use std::time::Duration;

use regex::Regex;

use crate::helpers::external_command::ExternalCommand;
use crate::prelude::*;
use crate::process::{DumpKind, DumpRecord, ProcessHandle};

mod unix;
mod windows;
mod zos;

pub use unix::UnixPlatform;
pub use windows::WindowsPlatform;
pub use zos::ZosPlatform;

/// Diagnostic signal numbers (non-Windows).
pub const APPLICATION_DUMP_SIGNAL: i32 = 3;
pub const ABORT_CORE_SIGNAL: i32 = 6;
pub const SECONDARY_DUMP_SIGNAL: i32 = 24;

/// Platform-specific capabilities of the monitor: extra dump sources,
/// diagnostic-generation signals, and the tail of the kill ladder.
/// A concrete implementation is chosen once at construction.
pub trait Platform {
    fn name(&self) -> &'static str;

    /// Dump filename patterns scanned in addition to the base set.
    fn extra_file_patterns(&self) -> &[(DumpKind, Regex)] {
        &[]
    }

    /// Dumps whose presence is inferred from log lines rather than a
    /// filename glob. Returns the artifacts newly landed in `log_dir`.
    fn scan_log_dumps(
        &self,
        _handle: &ProcessHandle,
        _new_lines: &[String],
        _log_dir: &Path,
    ) -> Result<Vec<DumpRecord>> {
        Ok(Vec::new())
    }

    /// Ask the process for an application-level diagnostic. Returns
    /// false when the request could not be delivered.
    fn request_application_dump(&self, pid: u32) -> Result<bool>;

    /// Force an OS-level core dump.
    fn force_core_dump(&self, pid: u32) -> Result<()>;

    /// Last-resort escalation for a wedged diagnostic handler.
    fn secondary_dump_escalation(&self, pid: u32) -> Result<()>;

    /// Graceful stop, the first rung of the kill ladder.
    fn stop(&self, pid: u32) -> Result<()>;

    /// Platform-specific forced kill beyond the ordinary forceful
    /// terminate, if the platform has one.
    fn forced_kill(&self, _pid: u32) -> Option<ExternalCommand> {
        None
    }

    /// Settle delay before the forced kill may fire: the mechanism
    /// requires the prior forceful kill to have already taken effect.
    fn forced_kill_settle(&self) -> Duration {
        Duration::from_secs(2)
    }
}

/// The platform the monitor itself is running on.
pub fn default_platform() -> Box<dyn Platform> {
    if cfg!(windows) {
        Box::new(WindowsPlatform)
    } else {
        Box::new(UnixPlatform)
    }
}

/// Explicit platform selection, e.g. from the scenario file.
pub fn platform_by_name(name: &str, join_tdump_parts: bool) -> Result<Box<dyn Platform>> {
    match name {
        "unix" => Ok(Box::new(UnixPlatform)),
        "windows" => Ok(Box::new(WindowsPlatform)),
        "zos" => Ok(Box::new(ZosPlatform::new(join_tdump_parts))),
        _ => bail!("unknown platform `{name}`"),
    }
}

#[cfg(unix)]
pub(crate) fn send_signal(pid: u32, signal: i32) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let signal =
        Signal::try_from(signal).with_context(|| format!("invalid signal number {signal}"))?;
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(true),
        // The process is already gone; nothing to deliver to.
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => {
            Err(err).with_context(|| format!("failed to deliver {signal} to pid {pid}"))
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn send_signal(_pid: u32, signal: i32) -> Result<bool> {
    bail!("signal {signal} delivery is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_by_name() {
        assert_eq!(platform_by_name("unix", false).unwrap().name(), "unix");
        assert_eq!(
            platform_by_name("windows", false).unwrap().name(),
            "windows"
        );
        assert_eq!(platform_by_name("zos", true).unwrap().name(), "zos");
        assert!(platform_by_name("beos", false).is_err());
    }

    #[test]
    fn test_default_platform_matches_host() {
        let platform = default_platform();
        if cfg!(windows) {
            assert_eq!(platform.name(), "windows");
        } else {
            assert_eq!(platform.name(), "unix");
        }
    }
}
