use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;

use super::Platform;
use crate::helpers::external_command::ExternalCommand;
use crate::prelude::*;
use crate::process::DumpKind;

lazy_static! {
    /// The crash dialog writes a `drwtsn32` log next to the process logs.
    static ref EXTRA_PATTERNS: Vec<(DumpKind, Regex)> =
        vec![(DumpKind::DrWatson, Regex::new(r"^drwtsn32").unwrap())];
}

const TASKKILL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WindowsPlatform;

impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn extra_file_patterns(&self) -> &[(DumpKind, Regex)] {
        &EXTRA_PATTERNS
    }

    fn request_application_dump(&self, pid: u32) -> Result<bool> {
        debug!("no application-level dump mechanism for pid {pid} on windows");
        Ok(false)
    }

    fn force_core_dump(&self, _pid: u32) -> Result<()> {
        warn!("no OS-level core dump escalation available on windows");
        Ok(())
    }

    fn secondary_dump_escalation(&self, _pid: u32) -> Result<()> {
        Ok(())
    }

    fn stop(&self, pid: u32) -> Result<()> {
        let pid_arg = pid.to_string();
        let output = ExternalCommand::new("taskkill")
            .args(["/PID", pid_arg.as_str()])
            .timeout(TASKKILL_TIMEOUT)
            .run()?;
        if !output.success() {
            debug!("taskkill did not stop pid {pid}: {}", output.stderr.trim());
        }
        Ok(())
    }

    fn forced_kill(&self, pid: u32) -> Option<ExternalCommand> {
        let pid_arg = pid.to_string();
        Some(
            ExternalCommand::new("taskkill")
                .args(["/F", "/PID", pid_arg.as_str()])
                .timeout(TASKKILL_TIMEOUT),
        )
    }
}
