//! Resolution of runner settings from the config file and CLI overrides.

use anyhow::Context;
use flakestat_types::{
    ConfigFile, RunnerConfig, DEFAULT_CONCURRENCY, DEFAULT_OUTPUT_CAP_BYTES,
    DEFAULT_RECORD_ATTEMPTS, DEFAULT_RECORD_TIMEOUT, DEFAULT_RUNNER_COMMAND, DEFAULT_TRIALS,
    DEFAULT_WAIT_TIMEOUT,
};
use std::path::PathBuf;
use std::time::Duration;

pub fn parse_config(text: &str) -> anyhow::Result<ConfigFile> {
    toml::from_str(text).context("parse config TOML")
}

/// CLI-level overrides. `None` defers to the config file, then to the defaults.
#[derive(Debug, Clone, Default)]
pub struct RunnerOverrides {
    pub command: Option<Vec<String>>,
    pub cwd: Option<PathBuf>,
    pub trials: Option<u32>,
    pub concurrency: Option<usize>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    /// argv prefix; the test path is appended per invocation.
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub trials: u32,
    pub concurrency: usize,
    pub wait_timeout: Duration,
    pub record_timeout: Duration,
    pub record_attempts: u32,
    pub output_cap_bytes: usize,
}

impl RunnerSettings {
    /// `--timeout` overrides whichever wait applies to the command being run,
    /// so it is applied to both the trial and the record timeout.
    pub fn resolve(config: &RunnerConfig, overrides: RunnerOverrides) -> anyhow::Result<Self> {
        let command = overrides
            .command
            .or_else(|| config.command.clone())
            .unwrap_or_else(|| DEFAULT_RUNNER_COMMAND.iter().map(|s| s.to_string()).collect());
        if command.is_empty() {
            anyhow::bail!("runner command must not be empty");
        }

        let concurrency = overrides
            .concurrency
            .or(config.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }

        let wait_timeout = match overrides.timeout {
            Some(t) => t,
            None => parse_duration(config.wait_timeout.as_deref(), DEFAULT_WAIT_TIMEOUT)
                .context("runner.wait_timeout")?,
        };
        let record_timeout = match overrides.timeout {
            Some(t) => t,
            None => parse_duration(config.record_timeout.as_deref(), DEFAULT_RECORD_TIMEOUT)
                .context("runner.record_timeout")?,
        };

        Ok(Self {
            command,
            cwd: overrides.cwd.or_else(|| config.cwd.as_ref().map(PathBuf::from)),
            trials: overrides.trials.or(config.trials).unwrap_or(DEFAULT_TRIALS),
            concurrency,
            wait_timeout,
            record_timeout,
            record_attempts: config.record_attempts.unwrap_or(DEFAULT_RECORD_ATTEMPTS),
            output_cap_bytes: config.output_cap_bytes.unwrap_or(DEFAULT_OUTPUT_CAP_BYTES),
        })
    }

    pub(crate) fn argv_for(&self, test: &str) -> Vec<String> {
        let mut argv = self.command.clone();
        argv.push(test.to_string());
        argv
    }
}

fn parse_duration(value: Option<&str>, default: &str) -> anyhow::Result<Duration> {
    let s = value.unwrap_or(default);
    humantime::parse_duration(s).with_context(|| format!("invalid duration {s:?}"))
}
