//! Recording tests under rr so that they can later be replayed.

use crate::run::{record_fail_file, record_file, run_batch};
use crate::RunnerSettings;
use flakestat_adapters::{ArtifactStore, CommandSpec, ProcessRunner};
use flakestat_domain::trial_output_stem;
use flakestat_types::{RR_CHANNEL_ENV, RR_RECORD_FILE_ENV};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub tests: Vec<String>,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordOutcome {
    pub recorded: Vec<String>,

    /// Already had a `.record` or `.record_fail` file.
    pub skipped: Vec<String>,

    /// Still failing after every attempt.
    pub never_recorded: Vec<String>,
}

pub struct RecordUseCase<R: ProcessRunner, S: ArtifactStore> {
    runner: R,
    store: S,
    settings: RunnerSettings,
}

impl<R: ProcessRunner, S: ArtifactStore> RecordUseCase<R, S> {
    pub fn new(runner: R, store: S, settings: RunnerSettings) -> Self {
        Self {
            runner,
            store,
            settings,
        }
    }

    pub fn execute(&self, req: RecordRequest) -> anyhow::Result<RecordOutcome> {
        self.store.create_dir_all(&req.output_dir)?;
        let mut outcome = RecordOutcome::default();

        let mut pending: Vec<&String> = Vec::new();
        for test in &req.tests {
            if self.store.exists(&record_file(&req.output_dir, test))
                || self.store.exists(&record_fail_file(&req.output_dir, test))
            {
                tracing::info!(test = %test, "already recorded; skipping");
                outcome.skipped.push(test.clone());
            } else {
                pending.push(test);
            }
        }

        for chunk in pending.chunks(self.settings.concurrency.max(1)) {
            let mut batch: Vec<&String> = chunk.to_vec();

            for attempt in 0..self.settings.record_attempts {
                if batch.is_empty() {
                    break;
                }
                tracing::info!(attempt, tests = batch.len(), "recording batch");

                let specs: Vec<CommandSpec> = batch
                    .iter()
                    .map(|test| self.record_spec(&req.output_dir, test))
                    .collect();
                let results = run_batch(&self.runner, &specs)?;

                let mut still_failing = Vec::new();
                for (test, result) in batch.into_iter().zip(results) {
                    let output = req.output_dir.join(trial_output_stem(test));
                    self.store.write(&output, &result.stdout)?;

                    let record = record_file(&req.output_dir, test);
                    let record_fail = record_fail_file(&req.output_dir, test);

                    if result.succeeded() {
                        tracing::info!(test = %test, "record succeeded");
                        self.store.remove(&record_fail)?;
                        outcome.recorded.push(test.clone());
                    } else {
                        if result.timed_out {
                            tracing::warn!(test = %test, "recording timed out");
                        }
                        tracing::info!(test = %test, exit_code = result.exit_code, "record failed");
                        self.store.remove(&record)?;
                        self.store.write(&record_fail, b"failed")?;
                        still_failing.push(test);
                    }
                }
                batch = still_failing;
            }

            for test in batch {
                tracing::warn!(
                    test = %test,
                    attempts = self.settings.record_attempts,
                    "unable to record"
                );
                outcome.never_recorded.push(test.clone());
            }
        }

        Ok(outcome)
    }

    fn record_spec(&self, output_dir: &std::path::Path, test: &str) -> CommandSpec {
        let record = record_file(output_dir, test);
        CommandSpec {
            argv: self.settings.argv_for(test),
            cwd: self.settings.cwd.clone(),
            env: vec![
                (RR_CHANNEL_ENV.to_string(), "record".to_string()),
                (
                    RR_RECORD_FILE_ENV.to_string(),
                    record.to_string_lossy().into_owned(),
                ),
            ],
            timeout: Some(self.settings.record_timeout),
            output_cap_bytes: self.settings.output_cap_bytes,
        }
    }
}
