//! Integration tests for `flakestat aggregate`, `intermittents` and `unexpected-counts`.

#![allow(deprecated)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

fn fixtures() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures")
}

fn flakestat() -> Command {
    Command::cargo_bin("flakestat").expect("failed to find flakestat binary")
}

const SUMMARY_CSV: &str = "\
NAME, EXPECTED, UNEXPECTED, CRASH, TIMEOUT, SKIP, ERROR, EXPECTED_RUNTIME
/css/a.html, 2, 0, 0, 0, 0, 0, 120
/dom/b.html, 1, 1, 0, 0, 0, 0, 100
/dom/c.html, 0, 0, 1, 1, 0, 0, 0
";

#[test]
fn aggregate_prints_sorted_csv() {
    flakestat()
        .arg("aggregate")
        .arg(fixtures().join("results"))
        .assert()
        .success()
        .stdout(SUMMARY_CSV);
}

#[test]
fn aggregate_without_runtime_column() {
    flakestat()
        .arg("aggregate")
        .arg(fixtures().join("results"))
        .arg("--no-runtime")
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "NAME, EXPECTED, UNEXPECTED, CRASH, TIMEOUT, SKIP, ERROR\n/css/a.html, 2, 0, 0, 0, 0, 0\n",
        ));
}

#[test]
fn aggregate_writes_csv_and_json_files() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let csv_path = temp_dir.path().join("out/summary.csv");
    let json_path = temp_dir.path().join("out/summary.json");

    flakestat()
        .arg("aggregate")
        .arg(fixtures().join("results"))
        .arg("--out")
        .arg(&csv_path)
        .arg("--json")
        .arg(&json_path)
        .arg("--pretty")
        .arg("--subtests")
        .assert()
        .success()
        .stdout("");

    assert_eq!(fs::read_to_string(&csv_path).unwrap(), SUMMARY_CSV);

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).expect("valid JSON");
    assert_eq!(report["schema"], "flakestat.summary.v1");
    assert_eq!(report["tool"]["name"], "flakestat");
    assert_eq!(report["source"]["files_read"], 2);
    assert_eq!(report["summaries"].as_array().unwrap().len(), 3);
    assert_eq!(report["summaries"][0]["expected_runtime_ms"], 120);
    assert_eq!(report["subtests"][0]["test_name"], "/dom/b.html");
    assert_eq!(report["subtests"][0]["statuses"]["FAIL"]["unexpected"], 1);
}

#[test]
fn allow_list_filters_and_reports_misses() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let json_path = temp_dir.path().join("summary.json");

    flakestat()
        .arg("aggregate")
        .arg(fixtures().join("results"))
        .arg("--allow-list")
        .arg(fixtures().join("allow_list.txt"))
        .arg("--json")
        .arg(&json_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("/css/a.html, 2, 0"))
        .stdout(predicate::str::contains("/dom/b.html").not());

    let report: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
    assert_eq!(
        report["dropped"],
        serde_json::json!(["/dom/b.html", "/dom/c.html"])
    );
    assert_eq!(report["missing"], serde_json::json!(["/dom/missing.html"]));
}

#[test]
fn pass_with_subtests_is_fatal_and_writes_nothing() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let results = temp_dir.path().join("results");
    fs::create_dir(&results).unwrap();
    fs::write(
        results.join("r0.json"),
        r#"{"results":[{"test":"/bad.html","status":"PASS","duration":1,"subtests":[{"status":"PASS"}]}]}"#,
    )
    .unwrap();
    let out = temp_dir.path().join("summary.csv");

    flakestat()
        .arg("aggregate")
        .arg(&results)
        .arg("--out")
        .arg(&out)
        .assert()
        .failure()
        .code(1)
        .stdout("")
        .stderr(predicate::str::contains("/bad.html"))
        .stderr(predicate::str::contains("trial 0"));

    assert!(!out.exists(), "no report should be written on a format violation");
}

#[test]
fn malformed_results_file_is_named() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    fs::write(temp_dir.path().join("broken.json"), r#"{"results":[{"test":"/x.html"}]}"#).unwrap();

    flakestat()
        .arg("aggregate")
        .arg(temp_dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("broken.json"));
}

#[test]
fn pattern_selects_results_files() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    fs::copy(
        fixtures().join("results/run0.json"),
        temp_dir.path().join("wpt-0.log.json"),
    )
    .unwrap();
    fs::write(temp_dir.path().join("other.json"), "not json").unwrap();

    flakestat()
        .arg("aggregate")
        .arg(temp_dir.path())
        .arg("--pattern")
        .arg("wpt-*.json")
        .assert()
        .success()
        .stdout(predicate::str::contains("/css/a.html, 1, 0, 0, 0, 0, 0, 50"));
}

#[test]
fn pattern_can_come_from_config() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    let results = temp_dir.path().join("results");
    fs::create_dir(&results).unwrap();
    fs::copy(fixtures().join("results/run1.json"), results.join("a.wpt")).unwrap();
    fs::write(results.join("b.json"), "garbage").unwrap();
    let config = temp_dir.path().join("flakestat.toml");
    fs::write(&config, "[ingest]\nfile_pattern = \"*.wpt\"\n").unwrap();

    flakestat()
        .arg("--config")
        .arg(&config)
        .arg("aggregate")
        .arg(&results)
        .assert()
        .success()
        .stdout(predicate::str::contains("/css/a.html, 1, 0, 0, 0, 0, 0, 70"));
}

#[test]
fn strict_counts_rejects_uneven_files() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    fs::copy(fixtures().join("results/run0.json"), temp_dir.path().join("a.json")).unwrap();
    fs::write(
        temp_dir.path().join("b.json"),
        r#"{"results":[{"test":"/css/a.html","status":"PASS","duration":1,"subtests":[]}]}"#,
    )
    .unwrap();

    flakestat()
        .arg("aggregate")
        .arg(temp_dir.path())
        .assert()
        .success();

    flakestat()
        .arg("aggregate")
        .arg(temp_dir.path())
        .arg("--strict-counts")
        .assert()
        .failure()
        .stderr(predicate::str::contains("b.json"));
}

#[test]
fn intermittents_lists_only_mixed_tests() {
    flakestat()
        .arg("intermittents")
        .arg(fixtures().join("results"))
        .assert()
        .success()
        .stdout(predicate::str::contains("/dom/b.html, 1, 1"))
        .stdout(predicate::str::contains("/dom/c.html, 0, 0, 1, 1"))
        .stdout(predicate::str::contains("/css/a.html").not());
}

#[test]
fn unexpected_counts_by_top_level_status() {
    flakestat()
        .arg("unexpected-counts")
        .arg(fixtures().join("results"))
        .assert()
        .success()
        .stdout(predicate::str::contains("CRASH: 1"))
        .stdout(predicate::str::contains("TIMEOUT: 1"))
        .stdout(predicate::str::contains("PASS").not());
}

#[test]
fn missing_input_dir_fails() {
    let temp_dir = tempdir().expect("failed to create temp dir");
    flakestat()
        .arg("aggregate")
        .arg(temp_dir.path().join("nope"))
        .assert()
        .failure()
        .code(1);
}
