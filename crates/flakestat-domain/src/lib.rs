//! Domain logic for flakestat.
//!
//! This crate is intentionally I/O-free: it classifies trials and folds them into summaries.

pub mod outcome;
pub mod scrape;

pub use outcome::{
    classify_runner_output, output_name_collisions, timeout_key, trial_output_name,
    trial_output_stem,
};
pub use scrape::{scrape_crash_log, ScrapeOutcome};

use flakestat_types::{
    RawTrialEntry, RunOutcome, SubtestBreakdown, SubtestCounts, SubtestRecord, TestSummary,
    TrialRecord, TrialStatus, UnknownStatus,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("trial entry has an empty test name")]
    EmptyTestName,

    #[error("test {test}: {source}")]
    UnknownStatus {
        test: String,
        #[source]
        source: UnknownStatus,
    },

    #[error("test {test} trial {trial}: expected {status} to have no subtests, found {count}")]
    UnexpectedSubtests {
        test: String,
        trial: usize,
        status: TrialStatus,
        count: usize,
    },

    #[error("test {test} trial {trial}: expected OK to have subtests")]
    MissingSubtests { test: String, trial: usize },

    #[error("different amount of tests per file: expected {expected}, found {found} in file #{file}")]
    NonUniformCounts {
        expected: usize,
        found: usize,
        file: usize,
    },
}

/// Build a trial record from one raw harness entry.
///
/// `matched_expectation` is decided here, once, from the presence of the `expected` key.
pub fn trial_from_raw(raw: RawTrialEntry) -> Result<TrialRecord, DomainError> {
    if raw.test.is_empty() {
        return Err(DomainError::EmptyTestName);
    }

    let matched_expectation = !raw.has_expected_marker();
    let status = raw
        .status
        .parse::<TrialStatus>()
        .map_err(|source| DomainError::UnknownStatus {
            test: raw.test.clone(),
            source,
        })?;

    let subtests = raw
        .subtests
        .into_iter()
        .map(|s| SubtestRecord {
            matched_expectation: !s.has_expected_marker(),
            name: s.name,
            status: s.status,
        })
        .collect();

    Ok(TrialRecord {
        test_name: raw.test,
        status,
        duration_ms: raw.duration,
        subtests,
        matched_expectation,
    })
}

/// Bridge a runner-level outcome into the trial model so it can be aggregated.
pub fn trial_from_run_outcome(
    test_name: &str,
    outcome: RunOutcome,
    duration_ms: Option<u64>,
) -> TrialRecord {
    let (status, matched_expectation) = match outcome {
        RunOutcome::Succeeded => (TrialStatus::Pass, true),
        RunOutcome::Failed => (TrialStatus::Fail, false),
        RunOutcome::TimedOut | RunOutcome::RigTimeout => (TrialStatus::Timeout, true),
        RunOutcome::Unknown => (TrialStatus::Error, true),
        RunOutcome::DoesNotExist => (TrialStatus::Skip, true),
    };

    TrialRecord {
        test_name: test_name.to_string(),
        status,
        duration_ms,
        subtests: Vec::new(),
        matched_expectation,
    }
}

/// Trials grouped by test identity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grouping {
    /// Trial order within a group is input order.
    pub groups: BTreeMap<String, Vec<TrialRecord>>,

    /// Identities removed by the allow-list, with the number of entries dropped.
    pub dropped: BTreeMap<String, usize>,

    /// Allow-listed identities that never appeared.
    pub missing: BTreeSet<String>,
}

pub fn group_trials<I>(records: I, allow_list: Option<&BTreeSet<String>>) -> Grouping
where
    I: IntoIterator<Item = TrialRecord>,
{
    let mut grouping = Grouping::default();

    for record in records {
        if let Some(allowed) = allow_list {
            if !allowed.contains(&record.test_name) {
                *grouping.dropped.entry(record.test_name).or_insert(0) += 1;
                continue;
            }
        }
        grouping
            .groups
            .entry(record.test_name.clone())
            .or_default()
            .push(record);
    }

    if let Some(allowed) = allow_list {
        grouping.missing = allowed
            .iter()
            .filter(|name| !grouping.groups.contains_key(*name))
            .cloned()
            .collect();
    }

    grouping
}

/// Which counter a single trial lands in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Classification {
    Expected,
    Unexpected,
    Crash,
    Timeout,
    Skip,
    Error,
}

/// Classify one trial. `index` is its position in the test's trial sequence
/// and only used for diagnostics.
pub fn classify_trial(trial: &TrialRecord, index: usize) -> Result<Classification, DomainError> {
    let expect_no_subtests = || {
        if trial.subtests.is_empty() {
            Ok(())
        } else {
            Err(DomainError::UnexpectedSubtests {
                test: trial.test_name.clone(),
                trial: index,
                status: trial.status,
                count: trial.subtests.len(),
            })
        }
    };

    let split = |matched: bool| {
        if matched {
            Classification::Expected
        } else {
            Classification::Unexpected
        }
    };

    match trial.status {
        TrialStatus::Pass | TrialStatus::Fail => {
            expect_no_subtests()?;
            Ok(split(trial.matched_expectation))
        }
        TrialStatus::Crash => {
            expect_no_subtests()?;
            Ok(Classification::Crash)
        }
        TrialStatus::Ok => {
            if trial.subtests.is_empty() {
                return Err(DomainError::MissingSubtests {
                    test: trial.test_name.clone(),
                    trial: index,
                });
            }
            // One unexpected subtest condemns the whole trial.
            Ok(split(trial.subtests.iter().all(|s| s.matched_expectation)))
        }
        TrialStatus::Timeout => Ok(Classification::Timeout),
        TrialStatus::Error => Ok(Classification::Error),
        TrialStatus::Skip => {
            expect_no_subtests()?;
            Ok(Classification::Skip)
        }
    }
}

/// Fold a test's trials, in order, into `summary`.
///
/// Stops at the first format violation; `summary` must then be discarded.
pub fn aggregate_trials(summary: &mut TestSummary, trials: &[TrialRecord]) -> Result<(), DomainError> {
    for (index, trial) in trials.iter().enumerate() {
        match classify_trial(trial, index)? {
            Classification::Expected => {
                summary.expected += 1;
                // Durations come straight from the harness; clamp instead of wrapping.
                summary.expected_runtime_ms = summary
                    .expected_runtime_ms
                    .saturating_add(trial.duration_ms.unwrap_or(0));
            }
            Classification::Unexpected => summary.unexpected += 1,
            Classification::Crash => summary.crash += 1,
            Classification::Timeout => summary.timeout += 1,
            Classification::Skip => summary.skip += 1,
            Classification::Error => summary.error += 1,
        }
    }
    Ok(())
}

/// Aggregate every group. Output is sorted by test name; any violation aborts the whole pass.
pub fn aggregate(
    groups: &BTreeMap<String, Vec<TrialRecord>>,
) -> Result<Vec<TestSummary>, DomainError> {
    let mut summaries = Vec::with_capacity(groups.len());
    for (name, trials) in groups {
        let mut summary = TestSummary::new(name.clone());
        aggregate_trials(&mut summary, trials)?;
        summaries.push(summary);
    }
    Ok(summaries)
}

/// Union two summary sets, adding counters where identities coincide.
pub fn merge_summaries(a: Vec<TestSummary>, b: Vec<TestSummary>) -> Vec<TestSummary> {
    let mut merged: BTreeMap<String, TestSummary> = BTreeMap::new();
    for s in a.into_iter().chain(b) {
        match merged.get_mut(&s.test_name) {
            Some(acc) => {
                acc.expected = acc.expected.saturating_add(s.expected);
                acc.unexpected = acc.unexpected.saturating_add(s.unexpected);
                acc.crash = acc.crash.saturating_add(s.crash);
                acc.timeout = acc.timeout.saturating_add(s.timeout);
                acc.skip = acc.skip.saturating_add(s.skip);
                acc.error = acc.error.saturating_add(s.error);
                acc.expected_runtime_ms = acc
                    .expected_runtime_ms
                    .saturating_add(s.expected_runtime_ms);
            }
            None => {
                merged.insert(s.test_name.clone(), s);
            }
        }
    }
    merged.into_values().collect()
}

/// A test is intermittent when its trials landed in more than one counter.
pub fn is_intermittent(summary: &TestSummary) -> bool {
    summary.counters().iter().filter(|c| **c > 0).count() > 1
}

pub fn find_intermittents(summaries: &[TestSummary]) -> Vec<TestSummary> {
    summaries
        .iter()
        .filter(|s| is_intermittent(s))
        .cloned()
        .collect()
}

/// Count top-level statuses over every trial that did not match its expectation.
pub fn count_unexpected_statuses<'a, I>(records: I) -> BTreeMap<TrialStatus, u32>
where
    I: IntoIterator<Item = &'a TrialRecord>,
{
    let mut counts = BTreeMap::new();
    for record in records.into_iter().filter(|r| !r.matched_expectation) {
        *counts.entry(record.status).or_insert(0) += 1;
    }
    counts
}

/// Subtest-level view over OK trials. Tests without OK trials are omitted.
pub fn subtest_breakdown(groups: &BTreeMap<String, Vec<TrialRecord>>) -> Vec<SubtestBreakdown> {
    groups
        .iter()
        .filter_map(|(name, trials)| {
            let mut statuses: BTreeMap<String, SubtestCounts> = BTreeMap::new();
            for trial in trials.iter().filter(|t| t.status == TrialStatus::Ok) {
                for subtest in &trial.subtests {
                    let counts = statuses.entry(subtest.status.clone()).or_default();
                    if subtest.matched_expectation {
                        counts.expected += 1;
                    } else {
                        counts.unexpected += 1;
                    }
                }
            }
            (!statuses.is_empty()).then(|| SubtestBreakdown {
                test_name: name.clone(),
                statuses,
            })
        })
        .collect()
}

/// Every results file of one experiment should hold the same number of entries.
pub fn check_uniform_counts(counts: &[usize]) -> Result<(), DomainError> {
    let Some(&expected) = counts.first() else {
        return Ok(());
    };
    for (file, &found) in counts.iter().enumerate() {
        if found != expected {
            return Err(DomainError::NonUniformCounts {
                expected,
                found,
                file,
            });
        }
    }
    Ok(())
}
