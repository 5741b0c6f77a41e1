//! Integration test: every built-in scenario passes and its log validates.
//!
//! Run: cargo test -p safepool-harness --test scenarios_test

use std::path::PathBuf;

use safepool_harness::scenarios;
use safepool_harness::structured_log::{LogEmitter, validate_log_file};
use safepool_harness::{HarnessError, ScenarioReport, ScenarioRunner};
use safepool_membrane::ViolationKind;

fn temp_log(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("safepool-{}-{name}.jsonl", std::process::id()))
}

#[test]
fn all_scenarios_pass() {
    let mut log = LogEmitter::sink("all");
    let results = ScenarioRunner::default().run(None, &mut log).expect("run");
    assert_eq!(results.len(), scenarios::all().len());
    for r in &results {
        assert!(r.passed(), "{} failed: {:?}", r.id, r.failure);
    }
}

#[test]
fn expected_violations_are_recorded_per_scenario() {
    let mut log = LogEmitter::sink("kinds");
    let results = ScenarioRunner::default().run(None, &mut log).expect("run");
    let kinds = |id: &str| {
        results
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.violations.clone())
            .expect("scenario present")
    };
    assert!(kinds("allocation-coherence").is_empty());
    assert_eq!(kinds("end-to-end"), vec![ViolationKind::DanglingPointer]);
    assert_eq!(kinds("temporal-reuse"), vec![ViolationKind::TemporalViolation]);
    assert_eq!(kinds("one-past-end-strict"), vec![ViolationKind::OutOfBounds]);
}

#[test]
fn structured_log_of_a_run_validates() {
    let path = temp_log("validate");
    {
        let mut log = LogEmitter::to_file(&path, "ci").expect("log file");
        let results = ScenarioRunner::default()
            .run(Some("one-past-end"), &mut log)
            .expect("run");
        assert_eq!(results.len(), 2);
    }
    let (lines, errors) = validate_log_file(&path).expect("read log");
    // start + end per scenario, plus one violation each.
    assert_eq!(lines, 6);
    assert!(errors.is_empty(), "{errors:?}");

    let content = std::fs::read_to_string(&path).expect("read log");
    assert!(content.contains("\"event\":\"violation\""));
    assert!(content.contains("\"violation_kind\":\"out_of_bounds\""));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn unknown_filter_is_an_error() {
    let mut log = LogEmitter::sink("none");
    let err = ScenarioRunner::default()
        .run(Some("no-such-scenario"), &mut log)
        .expect_err("nothing selected");
    assert!(matches!(err, HarnessError::UnknownScenario(_)));
}

#[test]
fn report_summarizes_a_run() {
    let mut log = LogEmitter::sink("report");
    let results = ScenarioRunner::default()
        .run(Some("metadata"), &mut log)
        .expect("run");
    let report = ScenarioReport::new("t", "2026-01-01T00:00:00.000Z", "report", results);
    assert_eq!(report.summary.total, 1);
    assert!(report.summary.all_passed());
    assert!(report.to_markdown().contains("| metadata-round-trip |"));
}
