//! Application layer for flakestat.
//!
//! The app layer coordinates adapters and domain logic.
//! It does not parse CLI flags and it does not write reports anywhere.

mod analyse;
mod config;
mod record;
mod run;

#[cfg(test)]
mod fakes;

pub use analyse::{
    AnalyseOutcome, AnalyseOutputUseCase, AnalyseRequest, MissingReason, MissingTest,
    MissingTestsUseCase,
};
pub use config::{parse_config, RunnerOverrides, RunnerSettings};
pub use record::{RecordOutcome, RecordRequest, RecordUseCase};
pub use run::{
    record_fail_file, record_file, timeout_file, TrialMode, TrialRunOutcome, TrialRunRequest,
    TrialRunUseCase, TIMEOUT_FILE_NAME,
};

use anyhow::Context;
use flakestat_adapters::ReportSource;
use flakestat_domain::{
    aggregate, check_uniform_counts, count_unexpected_statuses, find_intermittents, group_trials,
    subtest_breakdown, trial_from_raw, DomainError, Grouping,
};
use flakestat_types::{
    CrashRecord, RunTally, SummaryReport, SummarySource, TestSummary, ToolInfo, TrialStatus,
    SUMMARY_SCHEMA_V1,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub trait Clock: Send + Sync {
    fn now_rfc3339(&self) -> String;
}

#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_rfc3339(&self) -> String {
        use time::format_description::well_known::Rfc3339;
        time::OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AggregateRequest {
    pub input_dir: PathBuf,
    pub file_pattern: String,

    /// When set, only these identities are kept.
    pub allow_list: Option<BTreeSet<String>>,

    /// Fail when the results files disagree on their number of entries.
    pub strict_counts: bool,

    /// Attach the per-subtest breakdown of OK trials.
    pub subtests: bool,
}

/// Trials read from a results directory, grouped by test.
#[derive(Debug, Clone)]
pub struct Ingested {
    pub files_read: usize,
    pub grouping: Grouping,
}

pub struct AggregateUseCase<S: ReportSource, C: Clock> {
    source: S,
    clock: C,
    tool: ToolInfo,
}

impl<S: ReportSource, C: Clock> AggregateUseCase<S, C> {
    pub fn new(source: S, clock: C, tool: ToolInfo) -> Self {
        Self {
            source,
            clock,
            tool,
        }
    }

    pub fn ingest(&self, req: &AggregateRequest) -> anyhow::Result<Ingested> {
        let loaded = self
            .source
            .load(&req.input_dir, &req.file_pattern)
            .with_context(|| format!("load results from {}", req.input_dir.display()))?;
        tracing::info!(files = loaded.len(), dir = %req.input_dir.display(), "read results files");

        if req.strict_counts {
            let counts: Vec<usize> = loaded.iter().map(|r| r.report.results.len()).collect();
            if let Err(e) = check_uniform_counts(&counts) {
                let path = match &e {
                    DomainError::NonUniformCounts { file, .. } => loaded
                        .get(*file)
                        .map(|r| r.path.display().to_string())
                        .unwrap_or_default(),
                    _ => String::new(),
                };
                return Err(anyhow::Error::new(e).context(format!("strict counts: {path}")));
            }
        }

        let files_read = loaded.len();
        let mut records = Vec::new();
        // Unlisted entries are dropped unread: a status or name the allow-list
        // excludes must not abort the run.
        let mut unlisted: BTreeMap<String, usize> = BTreeMap::new();
        for file in loaded {
            let path = file.path;
            for raw in file.report.results {
                if let Some(allowed) = &req.allow_list {
                    if !allowed.contains(&raw.test) {
                        *unlisted.entry(raw.test).or_insert(0) += 1;
                        continue;
                    }
                }
                let record = trial_from_raw(raw).with_context(|| format!("in {}", path.display()))?;
                records.push(record);
            }
        }

        let mut grouping = group_trials(records, req.allow_list.as_ref());
        for (test, entries) in unlisted {
            *grouping.dropped.entry(test).or_insert(0) += entries;
        }
        for (test, entries) in &grouping.dropped {
            tracing::info!(test = %test, entries, "dropped by allow-list");
        }
        for test in &grouping.missing {
            tracing::warn!(test = %test, "allow-listed test not found in results");
        }

        Ok(Ingested {
            files_read,
            grouping,
        })
    }

    pub fn execute(&self, req: &AggregateRequest) -> anyhow::Result<SummaryReport> {
        let ingested = self.ingest(req)?;
        let groups = &ingested.grouping.groups;

        let summaries = aggregate(groups).context("aggregate trials")?;
        let subtests = req.subtests.then(|| subtest_breakdown(groups));

        Ok(SummaryReport {
            schema: SUMMARY_SCHEMA_V1.to_string(),
            tool: self.tool.clone(),
            generated_at: self.clock.now_rfc3339(),
            source: SummarySource {
                input_dir: req.input_dir.to_string_lossy().into_owned(),
                file_pattern: req.file_pattern.clone(),
                files_read: ingested.files_read,
            },
            summaries,
            dropped: ingested.grouping.dropped.into_keys().collect(),
            missing: ingested.grouping.missing.into_iter().collect(),
            subtests,
        })
    }

    pub fn intermittents(&self, req: &AggregateRequest) -> anyhow::Result<Vec<TestSummary>> {
        let report = self.execute(req)?;
        let found = find_intermittents(&report.summaries);
        tracing::info!(
            intermittent = found.len(),
            tests = report.summaries.len(),
            "intermittent scan done"
        );
        Ok(found)
    }

    pub fn unexpected_counts(
        &self,
        req: &AggregateRequest,
    ) -> anyhow::Result<BTreeMap<TrialStatus, u32>> {
        let ingested = self.ingest(req)?;
        Ok(count_unexpected_statuses(
            ingested.grouping.groups.values().flatten(),
        ))
    }
}

// ----------------------------
// Rendering helpers
// ----------------------------

pub const SUMMARY_CSV_HEADER: &str =
    "NAME, EXPECTED, UNEXPECTED, CRASH, TIMEOUT, SKIP, ERROR, EXPECTED_RUNTIME";

pub const TALLY_CSV_HEADER: &str =
    "name, does_not_exist, failed, succeeded, timedout, unknown, rig_timeout, total";

pub fn render_summary_csv(summaries: &[TestSummary], include_runtime: bool) -> String {
    let mut out = String::new();
    if include_runtime {
        out.push_str(SUMMARY_CSV_HEADER);
    } else {
        out.push_str(SUMMARY_CSV_HEADER.trim_end_matches(", EXPECTED_RUNTIME"));
    }
    out.push('\n');

    for s in summaries {
        let mut fields = vec![s.test_name.clone()];
        fields.extend(s.counters().iter().map(u32::to_string));
        if include_runtime {
            fields.push(s.expected_runtime_ms.to_string());
        }
        out.push_str(&fields.join(", "));
        out.push('\n');
    }
    out
}

pub fn render_tally_csv(tallies: &[RunTally]) -> String {
    let mut out = String::from(TALLY_CSV_HEADER);
    out.push('\n');
    for t in tallies {
        out.push_str(&format!(
            "{}, {}, {}, {}, {}, {}, {}, {}\n",
            t.name,
            t.does_not_exist,
            t.failed,
            t.succeeded,
            t.timed_out,
            t.unknown,
            t.rig_timeout,
            t.total
        ));
    }
    out
}

pub fn render_unexpected_counts(counts: &BTreeMap<TrialStatus, u32>) -> String {
    let mut out = String::from("Unexpected test statuses\n");
    for (status, count) in counts {
        out.push_str(&format!("{status}: {count}\n"));
    }
    out
}

/// Crash blocks separated by blank lines.
pub fn render_crash_records(records: &[CrashRecord]) -> String {
    let mut out = String::new();
    for r in records {
        out.push_str(&r.text());
        out.push_str("\n\n");
    }
    out
}

pub fn render_missing(missing: &[MissingTest]) -> String {
    let mut out = String::new();
    for m in missing {
        let what = match m.reason {
            MissingReason::DoesNotExist => "does not exist",
            MissingReason::NeverRun => "never run",
        };
        out.push_str(&format!("{what}: {}\n", m.test));
    }
    out
}
