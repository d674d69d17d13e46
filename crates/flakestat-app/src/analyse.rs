//! Post-hoc analysis of the per-trial runner output left by `run-baseline`
//! and `run-replay`.

use crate::run::timeout_file;
use crate::Clock;
use anyhow::Context;
use flakestat_adapters::ArtifactStore;
use flakestat_domain::{
    aggregate, classify_runner_output, output_name_collisions, timeout_key,
    trial_from_run_outcome, trial_output_name,
};
use flakestat_types::{RunOutcome, RunTally, TallyReport, ToolInfo, TrialRecord, TALLY_SCHEMA_V1};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AnalyseRequest {
    pub tests: Vec<String>,
    pub output_dir: PathBuf,
    pub trials: u32,

    /// Also fold the outcomes through the aggregator.
    pub summary: bool,
}

#[derive(Debug, Clone)]
pub struct AnalyseOutcome {
    pub report: TallyReport,

    /// Expected trial outputs that were not found.
    pub missing_outputs: Vec<PathBuf>,
}

pub struct AnalyseOutputUseCase<S: ArtifactStore, C: Clock> {
    store: S,
    clock: C,
    tool: ToolInfo,
}

impl<S: ArtifactStore, C: Clock> AnalyseOutputUseCase<S, C> {
    pub fn new(store: S, clock: C, tool: ToolInfo) -> Self {
        Self { store, clock, tool }
    }

    pub fn execute(&self, req: AnalyseRequest) -> anyhow::Result<AnalyseOutcome> {
        let clashes = output_name_collisions(req.tests.iter().map(String::as_str), req.trials);
        if !clashes.is_empty() {
            anyhow::bail!("trials share output files: {}", clashes.join(", "));
        }

        let timeouts_path = timeout_file(&req.output_dir);
        if !self.store.exists(&timeouts_path) {
            anyhow::bail!(
                "timeout file {} does not exist; run run-baseline first",
                timeouts_path.display()
            );
        }
        let timeouts = self
            .store
            .read(&timeouts_path)
            .with_context(|| format!("read {}", timeouts_path.display()))?;
        let timeouts: BTreeSet<String> = String::from_utf8_lossy(&timeouts)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let mut tallies = Vec::with_capacity(req.tests.len());
        let mut groups: BTreeMap<String, Vec<TrialRecord>> = BTreeMap::new();
        let mut missing_outputs = Vec::new();

        for test in &req.tests {
            let mut tally = RunTally::new(test.clone());

            for i in 0..req.trials {
                let path = req.output_dir.join(trial_output_name(test, i));
                if !self.store.exists(&path) {
                    tracing::warn!(path = %path.display(), "no such output; skipping");
                    missing_outputs.push(path);
                    continue;
                }

                let outcome = if timeouts.contains(&timeout_key(test, i)) {
                    RunOutcome::RigTimeout
                } else {
                    let bytes = self.store.read(&path)?;
                    let outcome = classify_runner_output(test, &bytes);
                    if outcome == RunOutcome::Unknown {
                        tracing::info!(path = %path.display(), "unrecognized runner output");
                    }
                    outcome
                };

                tally.record(outcome);
                if req.summary {
                    groups
                        .entry(test.clone())
                        .or_default()
                        .push(trial_from_run_outcome(test, outcome, None));
                }
            }

            tallies.push(tally);
        }

        let summaries = if req.summary {
            Some(aggregate(&groups).context("aggregate runner outcomes")?)
        } else {
            None
        };

        Ok(AnalyseOutcome {
            report: TallyReport {
                schema: TALLY_SCHEMA_V1.to_string(),
                tool: self.tool.clone(),
                generated_at: self.clock.now_rfc3339(),
                output_dir: req.output_dir.to_string_lossy().into_owned(),
                trials: req.trials,
                tallies,
                summaries,
            },
            missing_outputs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingReason {
    DoesNotExist,
    NeverRun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingTest {
    pub test: String,
    pub reason: MissingReason,
}

/// Finds tests whose first trial either never ran or reported that the path
/// matches no test.
pub struct MissingTestsUseCase<S: ArtifactStore> {
    store: S,
}

impl<S: ArtifactStore> MissingTestsUseCase<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn execute(&self, tests: &[String], output_dir: &Path) -> anyhow::Result<Vec<MissingTest>> {
        let mut out = Vec::new();
        for test in tests {
            let path = output_dir.join(trial_output_name(test, 0));
            if !self.store.exists(&path) {
                out.push(MissingTest {
                    test: test.clone(),
                    reason: MissingReason::NeverRun,
                });
                continue;
            }
            let bytes = self.store.read(&path)?;
            if classify_runner_output(test, &bytes) == RunOutcome::DoesNotExist {
                out.push(MissingTest {
                    test: test.clone(),
                    reason: MissingReason::DoesNotExist,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FixedClock, MemStore};

    const OK: &str = "Running\n1 test\nOK\n\ndone\n";
    const FAIL: &str = "Running\n1 test\nFAIL /a.html\n\ndone\n";
    const GONE: &str = "Running\n ERROR Unable to find any tests at the path(s):\n/x\n";

    fn tool() -> ToolInfo {
        ToolInfo {
            name: "flakestat".into(),
            version: "0.1.0".into(),
        }
    }

    fn request(tests: &[&str], trials: u32, summary: bool) -> AnalyseRequest {
        AnalyseRequest {
            tests: tests.iter().map(|s| s.to_string()).collect(),
            output_dir: PathBuf::from("out"),
            trials,
            summary,
        }
    }

    #[test]
    fn timeout_file_is_required() {
        let uc = AnalyseOutputUseCase::new(MemStore::default(), FixedClock, tool());
        let err = uc.execute(request(&["/a.html"], 1, false)).unwrap_err();
        assert!(err.to_string().contains("timeout_file"));
    }

    #[test]
    fn ambiguous_output_names_are_refused() {
        let store = MemStore::default().with("out/timeout_file", "");
        let uc = AnalyseOutputUseCase::new(store, FixedClock, tool());
        let err = uc
            .execute(request(&["/a/b.html", "/a_b.html"], 1, false))
            .unwrap_err();
        assert!(err.to_string().contains("_a_b.html0"), "{err}");
    }

    #[test]
    fn tallies_each_trial_once_in_test_list_order() {
        let store = MemStore::default()
            .with("out/timeout_file", "/a.html2\n")
            .with("out/_a.html0", OK)
            .with("out/_a.html1", FAIL)
            .with("out/_a.html2", OK)
            .with("out/_b.html0", GONE)
            .with("out/_b.html1", "garbage");
        let uc = AnalyseOutputUseCase::new(store, FixedClock, tool());

        let out = uc.execute(request(&["/b.html", "/a.html"], 3, false)).unwrap();
        let tallies = &out.report.tallies;

        assert_eq!(tallies[0].name, "/b.html");
        assert_eq!(tallies[0].does_not_exist, 1);
        assert_eq!(tallies[0].unknown, 1);
        assert_eq!(tallies[0].total, 2);

        assert_eq!(tallies[1].name, "/a.html");
        assert_eq!(tallies[1].succeeded, 1);
        assert_eq!(tallies[1].failed, 1);
        assert_eq!(tallies[1].rig_timeout, 1);
        assert_eq!(tallies[1].unknown, 0);
        assert_eq!(tallies[1].total, 3);

        assert_eq!(out.missing_outputs, vec![PathBuf::from("out/_b.html2")]);
        assert!(out.report.summaries.is_none());
        assert_eq!(out.report.schema, TALLY_SCHEMA_V1);
    }

    #[test]
    fn summary_folds_outcomes_through_the_aggregator() {
        let store = MemStore::default()
            .with("out/timeout_file", "/a.html2\n")
            .with("out/_a.html0", OK)
            .with("out/_a.html1", FAIL)
            .with("out/_a.html2", OK);
        let uc = AnalyseOutputUseCase::new(store, FixedClock, tool());

        let out = uc.execute(request(&["/a.html"], 3, true)).unwrap();
        let summaries = out.report.summaries.unwrap();

        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!((s.expected, s.unexpected, s.timeout), (1, 1, 1));
        assert_eq!(s.expected_runtime_ms, 0);
    }

    #[test]
    fn missing_reports_never_run_and_nonexistent_tests() {
        let store = MemStore::default()
            .with("out/_gone.html0", GONE)
            .with("out/_ok.html0", OK);
        let uc = MissingTestsUseCase::new(store);

        let tests: Vec<String> = ["/gone.html", "/ok.html", "/new.html"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = uc.execute(&tests, Path::new("out")).unwrap();

        assert_eq!(
            out,
            vec![
                MissingTest {
                    test: "/gone.html".into(),
                    reason: MissingReason::DoesNotExist
                },
                MissingTest {
                    test: "/new.html".into(),
                    reason: MissingReason::NeverRun
                },
            ]
        );
    }
}
