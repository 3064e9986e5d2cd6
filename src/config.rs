use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dumps::RenamePolicy;
use crate::monitor::MonitorSettings;
use crate::platform::{Platform, default_platform, platform_by_name};
use crate::prelude::*;
use crate::process::ProcessHandle;

/// A scenario file: the declarative description of the processes to
/// launch and how to monitor them.
#[derive(Debug, Deserialize)]
pub struct Scenario {
    pub processes: Vec<ProcessSpec>,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Deserialize)]
pub struct ProcessSpec {
    /// Short human-readable identifier; instances are numbered when
    /// `count > 1`.
    pub mnemonic: String,
    #[serde(default = "default_count")]
    pub count: u32,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Humantime duration, e.g. "10s" or "2h". Absent means no limit is
    /// enforced.
    #[serde(default)]
    pub runtime_limit: Option<String>,
    /// `never` | `crashes` | `exitValue:<code>[,<code>]*`; absent means
    /// a clean run (exit 0).
    #[serde(default)]
    pub expected_outcome: Option<String>,
    #[serde(default)]
    pub control_process: bool,
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_echo")]
    pub echo: bool,
    #[serde(default)]
    pub heartbeat_period: Option<String>,
    #[serde(default)]
    pub rename_dumps: bool,
    #[serde(default)]
    pub join_dump_parts: bool,
    /// Platform override: `unix` | `windows` | `zos`. Absent means the
    /// platform the monitor is running on.
    #[serde(default)]
    pub platform: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            echo: true,
            heartbeat_period: None,
            rename_dumps: false,
            join_dump_parts: false,
            platform: None,
        }
    }
}

fn default_count() -> u32 {
    1
}

fn default_echo() -> bool {
    true
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario file {}", path.display()))?;
        let scenario: Scenario = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse scenario file {}", path.display()))?;
        if scenario.processes.is_empty() {
            bail!("scenario {} declares no processes", path.display());
        }
        Ok(scenario)
    }

    /// Construct the process handles, disambiguating uids from the
    /// mnemonic and instance count. Every expected-outcome string is
    /// parsed here, once.
    pub fn build_handles(&self, log_dir: &Path) -> Result<Vec<ProcessHandle>> {
        let mut handles: Vec<ProcessHandle> = Vec::new();
        for spec in &self.processes {
            if spec.count == 0 {
                bail!("process `{}` has a zero instance count", spec.mnemonic);
            }
            for instance in 1..=spec.count {
                let uid = if spec.count == 1 {
                    spec.mnemonic.clone()
                } else {
                    format!("{}{instance}", spec.mnemonic)
                };
                if handles.iter().any(|handle| handle.uid == uid) {
                    bail!("duplicate process uid `{uid}`");
                }
                let mut handle =
                    ProcessHandle::new(uid, spec.command.clone(), spec.args.clone(), log_dir);
                handle.cwd = spec.cwd.clone();
                handle.control_process = spec.control_process;
                if let Some(limit) = &spec.runtime_limit {
                    let limit = humantime::parse_duration(limit).with_context(|| {
                        format!("invalid runtime limit `{limit}` for `{}`", handle.uid)
                    })?;
                    handle.runtime_limit = Some(limit);
                }
                if let Some(expected) = &spec.expected_outcome {
                    handle.expected_outcome = expected.parse().with_context(|| {
                        format!("invalid expected outcome for `{}`", handle.uid)
                    })?;
                }
                handles.push(handle);
            }
        }
        Ok(handles)
    }

    pub fn monitor_settings(&self) -> Result<MonitorSettings> {
        let mut settings = MonitorSettings {
            echo: self.monitor.echo,
            ..MonitorSettings::default()
        };
        if let Some(period) = &self.monitor.heartbeat_period {
            settings.heartbeat_period = humantime::parse_duration(period)
                .with_context(|| format!("invalid heartbeat period `{period}`"))?;
        }
        settings.rename = RenamePolicy {
            enabled: self.monitor.rename_dumps,
            ..RenamePolicy::default()
        };
        Ok(settings)
    }

    pub fn platform(&self) -> Result<Box<dyn Platform>> {
        match &self.monitor.platform {
            Some(name) => platform_by_name(name, self.monitor.join_dump_parts),
            None => Ok(default_platform()),
        }
    }
}
