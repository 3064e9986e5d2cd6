use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::prelude::*;

/// The contract a test declares for one monitored process. Parsed once
/// from its configuration string at handle-construction time; evaluation
/// never re-parses.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExpectedOutcome {
    /// The process is expected to complete with exit code 0.
    #[default]
    CleanRun,
    /// The process is expected to produce a dump before ending.
    Crashes,
    /// The process is expected to still be running when monitoring ends.
    Never,
    /// The process is expected to complete with one of these exit codes.
    ExitValue(BTreeSet<i32>),
}

impl FromStr for ExpectedOutcome {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(ExpectedOutcome::CleanRun);
        }
        if value.eq_ignore_ascii_case("never") {
            return Ok(ExpectedOutcome::Never);
        }
        if value.eq_ignore_ascii_case("crashes") {
            return Ok(ExpectedOutcome::Crashes);
        }
        if let Some(codes) = value.strip_prefix("exitValue:") {
            let codes = codes
                .split(',')
                .map(|code| {
                    code.trim()
                        .parse::<i32>()
                        .with_context(|| format!("invalid exit code `{}`", code.trim()))
                })
                .collect::<Result<BTreeSet<i32>>>()?;
            if codes.is_empty() {
                bail!("exitValue expects at least one exit code");
            }
            return Ok(ExpectedOutcome::ExitValue(codes));
        }
        bail!("unrecognized expected outcome `{value}`");
    }
}

impl fmt::Display for ExpectedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedOutcome::CleanRun => write!(f, "clean run"),
            ExpectedOutcome::Crashes => write!(f, "crashes"),
            ExpectedOutcome::Never => write!(f, "never ends"),
            ExpectedOutcome::ExitValue(codes) => {
                let codes: Vec<String> = codes.iter().map(i32::to_string).collect();
                write!(f, "exit value in {{{}}}", codes.join(", "))
            }
        }
    }
}
