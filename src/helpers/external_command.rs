use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::prelude::*;

/// An external command described as an explicit argument list, with an
/// optional wall-clock timeout and captured output. No shell is involved,
/// so arguments are never re-quoted or re-split.
#[derive(Debug, Clone)]
pub struct ExternalCommand {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

#[derive(Debug)]
pub struct ExternalOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ExternalOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0) && !self.timed_out
    }
}

impl ExternalCommand {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns the command line as a string for logging/testing purposes
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }

    /// Run the command to completion, killing it if the timeout elapses
    /// first. Output is captured in both cases.
    pub fn run(&self) -> Result<ExternalOutput> {
        debug!("running external command: {}", self.command_line());
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn `{}`", self.command_line()))?;

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut timed_out = false;
        loop {
            let exited = child
                .try_wait()
                .with_context(|| format!("failed to poll `{}`", self.command_line()))?
                .is_some();
            if exited {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    warn!(
                        "external command `{}` exceeded its timeout, killing it",
                        self.command_line()
                    );
                    timed_out = true;
                    let _ = child.kill();
                    break;
                }
            }
            thread::sleep(Duration::from_millis(20));
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to collect output of `{}`", self.command_line()))?;
        Ok(ExternalOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_quotes_arguments() {
        let cmd = ExternalCommand::new("mv").arg("-f").arg("a b");
        assert_eq!(cmd.command_line(), "mv -f 'a b'");
    }

    #[test]
    #[cfg(unix)]
    fn test_captures_output_and_status() {
        let out = ExternalCommand::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .run()
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[test]
    #[cfg(unix)]
    fn test_timeout_kills_the_command() {
        let out = ExternalCommand::new("sleep")
            .arg("30")
            .timeout(Duration::from_millis(100))
            .run()
            .unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
    }
}
