//! Repeated trial execution (baseline and replay).

use crate::RunnerSettings;
use anyhow::Context;
use flakestat_adapters::{ArtifactStore, CommandSpec, ProcessRunner, RunResult};
use flakestat_domain::{
    output_name_collisions, timeout_key, trial_output_name, trial_output_stem,
};
use flakestat_types::{RR_CHANNEL_ENV, RR_RECORD_FILE_ENV};
use std::path::{Path, PathBuf};

pub const TIMEOUT_FILE_NAME: &str = "timeout_file";

pub fn timeout_file(output_dir: &Path) -> PathBuf {
    output_dir.join(TIMEOUT_FILE_NAME)
}

/// `<dir>/<stem>.record`
pub fn record_file(dir: &Path, test: &str) -> PathBuf {
    dir.join(format!("{}.record", trial_output_stem(test)))
}

/// `<dir>/<stem>.record_fail`
pub fn record_fail_file(dir: &Path, test: &str) -> PathBuf {
    dir.join(format!("{}.record_fail", trial_output_stem(test)))
}

/// Spawn every spec at once and wait for all of them. Results are in spec order.
pub(crate) fn run_batch<R: ProcessRunner>(
    runner: &R,
    specs: &[CommandSpec],
) -> anyhow::Result<Vec<RunResult>> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = specs
            .iter()
            .map(|spec| scope.spawn(move || runner.run(spec)))
            .collect();

        handles
            .into_iter()
            .zip(specs)
            .map(|(handle, spec)| {
                let result = handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("runner thread panicked: {:?}", spec.argv))?;
                result.with_context(|| format!("failed to run {:?}", spec.argv))
            })
            .collect()
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialMode {
    Baseline,

    /// Only tests with `<record_dir>/<stem>.record` are run.
    Replay { record_dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct TrialRunRequest {
    pub tests: Vec<String>,
    pub output_dir: PathBuf,
    pub mode: TrialMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrialRunOutcome {
    pub spawned: u32,

    /// Trials whose output file already existed.
    pub skipped_existing: u32,

    /// Replay only: tests without a recording.
    pub unrecorded: Vec<String>,

    /// `<test><i>` keys appended to the timeout file by this run.
    pub timed_out: Vec<String>,
}

struct Job {
    test: String,
    output: PathBuf,
    spec: CommandSpec,
    key: String,
}

pub struct TrialRunUseCase<R: ProcessRunner, S: ArtifactStore> {
    runner: R,
    store: S,
    settings: RunnerSettings,
}

impl<R: ProcessRunner, S: ArtifactStore> TrialRunUseCase<R, S> {
    pub fn new(runner: R, store: S, settings: RunnerSettings) -> Self {
        Self {
            runner,
            store,
            settings,
        }
    }

    pub fn execute(&self, req: TrialRunRequest) -> anyhow::Result<TrialRunOutcome> {
        let clashes =
            output_name_collisions(req.tests.iter().map(String::as_str), self.settings.trials);
        if !clashes.is_empty() {
            anyhow::bail!("trials would share output files: {}", clashes.join(", "));
        }

        self.store.create_dir_all(&req.output_dir)?;
        let timeouts = timeout_file(&req.output_dir);
        // analyse-output requires the file even when nothing timed out.
        if !self.store.exists(&timeouts) {
            self.store.write(&timeouts, b"")?;
        }

        let mut outcome = TrialRunOutcome::default();
        let mut jobs: Vec<Job> = Vec::new();

        for test in &req.tests {
            let mut env = Vec::new();
            if let TrialMode::Replay { record_dir } = &req.mode {
                let record = record_file(record_dir, test);
                if !self.store.exists(&record) {
                    tracing::warn!(test = %test, record = %record.display(), "no recording; skipping");
                    outcome.unrecorded.push(test.clone());
                    continue;
                }
                env.push((RR_CHANNEL_ENV.to_string(), "replay".to_string()));
                env.push((
                    RR_RECORD_FILE_ENV.to_string(),
                    record.to_string_lossy().into_owned(),
                ));
            }

            tracing::info!(test = %test, trials = self.settings.trials, "queueing test");
            for i in 0..self.settings.trials {
                let output = req.output_dir.join(trial_output_name(test, i));
                if self.store.exists(&output) {
                    tracing::debug!(output = %output.display(), "output exists; skipping");
                    outcome.skipped_existing += 1;
                    continue;
                }
                jobs.push(Job {
                    test: test.clone(),
                    output,
                    spec: CommandSpec {
                        argv: self.settings.argv_for(test),
                        cwd: self.settings.cwd.clone(),
                        env: env.clone(),
                        timeout: Some(self.settings.wait_timeout),
                        output_cap_bytes: self.settings.output_cap_bytes,
                    },
                    key: timeout_key(test, i),
                });
            }
        }

        for batch in jobs.chunks(self.settings.concurrency.max(1)) {
            let specs: Vec<CommandSpec> = batch.iter().map(|j| j.spec.clone()).collect();
            tracing::info!(processes = specs.len(), "spawning batch");
            let results = run_batch(&self.runner, &specs)?;

            for (job, result) in batch.iter().zip(results) {
                outcome.spawned += 1;
                self.store.write(&job.output, &result.stdout)?;
                if result.timed_out {
                    tracing::warn!(test = %job.test, key = %job.key, "test timed out");
                    self.store.append_line(&timeouts, &job.key)?;
                    outcome.timed_out.push(job.key.clone());
                }
            }
        }

        Ok(outcome)
    }
}
