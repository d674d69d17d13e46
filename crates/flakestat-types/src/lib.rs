//! Shared types for flakestat.
//!
//! Design goal: versioned, explicit, boring.
//! The raw wire types mirror the `--log-wptreport` JSON written by the test
//! harness; everything else is what flakestat produces from it.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const SUMMARY_SCHEMA_V1: &str = "flakestat.summary.v1";
pub const TALLY_SCHEMA_V1: &str = "flakestat.tally.v1";

/// Key whose presence in a raw entry marks an unexpected result.
pub const EXPECTED_MARKER: &str = "expected";

pub const RR_CHANNEL_ENV: &str = "RR_CHANNEL";
pub const RR_RECORD_FILE_ENV: &str = "RR_RECORD_FILE";

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

// ----------------------------
// Raw wire format (input)
// ----------------------------

/// One results file as written by the harness.
///
/// Only `results` is interpreted; `run_info`, `time_start` and friends are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WptReport {
    pub results: Vec<RawTrialEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawTrialEntry {
    pub status: String,

    /// Milliseconds. Must be present; `null` means unknown.
    #[serde(deserialize_with = "required_nullable")]
    pub duration: Option<u64>,

    pub test: String,

    pub subtests: Vec<RawSubtestEntry>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawTrialEntry {
    /// The harness only writes `expected` when the observed status differs from it.
    pub fn has_expected_marker(&self) -> bool {
        self.extra.contains_key(EXPECTED_MARKER)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawSubtestEntry {
    #[serde(default)]
    pub name: Option<String>,

    pub status: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RawSubtestEntry {
    pub fn has_expected_marker(&self) -> bool {
        self.extra.contains_key(EXPECTED_MARKER)
    }
}

fn required_nullable<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<u64>::deserialize(deserializer)
}

// ----------------------------
// Trial records
// ----------------------------

#[derive(
    Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrialStatus {
    Pass,
    Fail,
    Crash,
    Ok,
    Timeout,
    Error,
    Skip,
}

impl TrialStatus {
    pub const ALL: [TrialStatus; 7] = [
        TrialStatus::Pass,
        TrialStatus::Fail,
        TrialStatus::Crash,
        TrialStatus::Ok,
        TrialStatus::Timeout,
        TrialStatus::Error,
        TrialStatus::Skip,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TrialStatus::Pass => "PASS",
            TrialStatus::Fail => "FAIL",
            TrialStatus::Crash => "CRASH",
            TrialStatus::Ok => "OK",
            TrialStatus::Timeout => "TIMEOUT",
            TrialStatus::Error => "ERROR",
            TrialStatus::Skip => "SKIP",
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unrecognized top-level status {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for TrialStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrialStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SubtestRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Free-form; subtests report statuses the top level never uses.
    pub status: String,

    pub matched_expectation: bool,
}

/// One observed execution of a test.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct TrialRecord {
    pub test_name: String,
    pub status: TrialStatus,

    /// `None` when the harness did not know the duration.
    pub duration_ms: Option<u64>,

    pub subtests: Vec<SubtestRecord>,

    /// False iff the raw entry carried an `expected` key.
    pub matched_expectation: bool,
}

// ----------------------------
// Summaries and reports (output)
// ----------------------------

/// Aggregated outcome of every trial of one test.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct TestSummary {
    pub test_name: String,
    pub expected: u32,
    pub unexpected: u32,
    pub crash: u32,
    pub timeout: u32,
    pub skip: u32,
    pub error: u32,

    /// Sum of known durations of trials classified as expected.
    pub expected_runtime_ms: u64,
}

impl TestSummary {
    pub fn new(test_name: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            expected: 0,
            unexpected: 0,
            crash: 0,
            timeout: 0,
            skip: 0,
            error: 0,
            expected_runtime_ms: 0,
        }
    }

    /// Number of trials folded into this summary.
    pub fn total(&self) -> u32 {
        self.counters().iter().fold(0u32, |acc, n| acc.saturating_add(*n))
    }

    /// Counters in report column order.
    pub fn counters(&self) -> [u32; 6] {
        [
            self.expected,
            self.unexpected,
            self.crash,
            self.timeout,
            self.skip,
            self.error,
        ]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct SubtestCounts {
    pub expected: u32,
    pub unexpected: u32,
}

/// Per-subtest-status counts over the OK trials of one test.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SubtestBreakdown {
    pub test_name: String,
    pub statuses: BTreeMap<String, SubtestCounts>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SummarySource {
    pub input_dir: String,
    pub file_pattern: String,
    pub files_read: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct SummaryReport {
    pub schema: String,
    pub tool: ToolInfo,
    pub generated_at: String,
    pub source: SummarySource,

    /// Sorted by test name.
    pub summaries: Vec<TestSummary>,

    /// Identities removed by the allow-list.
    #[serde(default)]
    pub dropped: Vec<String>,

    /// Allow-listed identities that never appeared in the input.
    #[serde(default)]
    pub missing: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtests: Option<Vec<SubtestBreakdown>>,
}

// ----------------------------
// Orchestration outcomes
// ----------------------------

/// What one execution of the external runner amounted to.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    DoesNotExist,
    Failed,
    Succeeded,
    /// The runner itself reported the test as timed out.
    TimedOut,
    Unknown,
    /// The process was killed at the orchestration wait timeout.
    RigTimeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RunTally {
    pub name: String,
    pub does_not_exist: u32,
    pub failed: u32,
    pub succeeded: u32,
    pub timed_out: u32,
    pub unknown: u32,
    pub rig_timeout: u32,
    pub total: u32,
}

impl RunTally {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            does_not_exist: 0,
            failed: 0,
            succeeded: 0,
            timed_out: 0,
            unknown: 0,
            rig_timeout: 0,
            total: 0,
        }
    }

    pub fn record(&mut self, outcome: RunOutcome) {
        self.total += 1;
        match outcome {
            RunOutcome::DoesNotExist => self.does_not_exist += 1,
            RunOutcome::Failed => self.failed += 1,
            RunOutcome::Succeeded => self.succeeded += 1,
            RunOutcome::TimedOut => self.timed_out += 1,
            RunOutcome::Unknown => self.unknown += 1,
            RunOutcome::RigTimeout => self.rig_timeout += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct TallyReport {
    pub schema: String,
    pub tool: ToolInfo,
    pub generated_at: String,
    pub output_dir: String,
    pub trials: u32,

    /// In test-list order.
    pub tallies: Vec<RunTally>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summaries: Option<Vec<TestSummary>>,
}

/// One crash block scraped from a harness log.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct CrashRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,

    /// Header, body and footer lines, without line terminators.
    pub lines: Vec<String>,
}

impl CrashRecord {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

// ----------------------------
// Optional config file schema
// ----------------------------

pub const DEFAULT_TRIALS: u32 = 100;
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_WAIT_TIMEOUT: &str = "30s";
pub const DEFAULT_RECORD_TIMEOUT: &str = "20s";
pub const DEFAULT_RECORD_ATTEMPTS: u32 = 100;
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_FILE_PATTERN: &str = "*.json";
pub const DEFAULT_RUNNER_COMMAND: [&str; 4] = ["./mach", "test-wpt", "--headless", "--release"];

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct RunnerConfig {
    /// argv prefix; the test path is appended (no shell parsing).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub trials: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,

    /// Duration string parseable by humantime, e.g. "30s".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_attempts: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_cap_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct IngestConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_pattern: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_marker_is_detected_by_presence_only() {
        let unexpected: RawTrialEntry = serde_json::from_str(
            r#"{"status":"FAIL","duration":10,"test":"/a.html","subtests":[],"expected":null}"#,
        )
        .unwrap();
        assert!(unexpected.has_expected_marker());

        let matched: RawTrialEntry = serde_json::from_str(
            r#"{"status":"FAIL","duration":10,"test":"/a.html","subtests":[],"message":"x"}"#,
        )
        .unwrap();
        assert!(!matched.has_expected_marker());
    }

    #[test]
    fn duration_must_be_present_but_may_be_null() {
        let missing = serde_json::from_str::<RawTrialEntry>(
            r#"{"status":"PASS","test":"/a.html","subtests":[]}"#,
        );
        assert!(missing.is_err());

        let null: RawTrialEntry = serde_json::from_str(
            r#"{"status":"PASS","duration":null,"test":"/a.html","subtests":[]}"#,
        )
        .unwrap();
        assert_eq!(null.duration, None);
    }

    #[test]
    fn missing_subtests_field_is_rejected() {
        let res =
            serde_json::from_str::<RawTrialEntry>(r#"{"status":"PASS","duration":1,"test":"/a"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn subtest_marker_is_independent_of_parent() {
        let entry: RawTrialEntry = serde_json::from_str(
            r#"{"status":"OK","duration":5,"test":"/a.html","subtests":[
                {"name":"one","status":"FAIL","expected":"PASS"},
                {"name":"two","status":"PASS"}
            ]}"#,
        )
        .unwrap();
        assert!(!entry.has_expected_marker());
        assert!(entry.subtests[0].has_expected_marker());
        assert!(!entry.subtests[1].has_expected_marker());
    }

    #[test]
    fn wpt_report_ignores_sibling_fields() {
        let report: WptReport = serde_json::from_str(
            r#"{"run_info":{"os":"linux"},"time_start":1,"time_end":2,"results":[]}"#,
        )
        .unwrap();
        assert!(report.results.is_empty());
    }

    #[test]
    fn trial_status_rejects_unknown_values() {
        assert_eq!("PASS".parse::<TrialStatus>(), Ok(TrialStatus::Pass));
        assert_eq!(
            "NOTRUN".parse::<TrialStatus>(),
            Err(UnknownStatus("NOTRUN".to_string()))
        );
        assert!("pass".parse::<TrialStatus>().is_err());
    }

    #[test]
    fn trial_status_serde_is_uppercase() {
        let json = serde_json::to_string(&TrialStatus::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
    }

    #[test]
    fn run_tally_counts_every_outcome_once() {
        let mut tally = RunTally::new("/a.html");
        tally.record(RunOutcome::Succeeded);
        tally.record(RunOutcome::RigTimeout);
        tally.record(RunOutcome::Unknown);
        assert_eq!(tally.total, 3);
        assert_eq!(tally.succeeded, 1);
        assert_eq!(tally.rig_timeout, 1);
        assert_eq!(tally.unknown, 1);
    }

    #[test]
    fn config_file_parses_partial_toml() {
        let cfg: ConfigFile = toml::from_str(
            r#"
            [runner]
            command = ["./mach", "test-wpt"]
            trials = 5
            wait_timeout = "10s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.runner.trials, Some(5));
        assert_eq!(cfg.runner.concurrency, None);
        assert_eq!(cfg.ingest, IngestConfig::default());
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn status_strategy() -> impl Strategy<Value = TrialStatus> {
        proptest::sample::select(TrialStatus::ALL.to_vec())
    }

    fn outcome_strategy() -> impl Strategy<Value = RunOutcome> {
        prop_oneof![
            Just(RunOutcome::DoesNotExist),
            Just(RunOutcome::Failed),
            Just(RunOutcome::Succeeded),
            Just(RunOutcome::TimedOut),
            Just(RunOutcome::Unknown),
            Just(RunOutcome::RigTimeout),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Display and FromStr agree for every valid status.
        #[test]
        fn status_display_parses_back(status in status_strategy()) {
            prop_assert_eq!(status.to_string().parse::<TrialStatus>(), Ok(status));
        }

        /// The tally total is the number of recorded outcomes and equals the sum of its buckets.
        #[test]
        fn tally_total_matches_buckets(outcomes in proptest::collection::vec(outcome_strategy(), 0..50)) {
            let mut tally = RunTally::new("t");
            for o in &outcomes {
                tally.record(*o);
            }
            let buckets = tally.does_not_exist + tally.failed + tally.succeeded
                + tally.timed_out + tally.unknown + tally.rig_timeout;
            prop_assert_eq!(tally.total as usize, outcomes.len());
            prop_assert_eq!(buckets, tally.total);
        }
    }
}
