//! Report generation for scenario runs.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::scenarios::ScenarioResult;

/// Pass/fail counts of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub violations_observed: usize,
}

impl ScenarioSummary {
    #[must_use]
    pub fn from_results(results: &[ScenarioResult]) -> Self {
        let passed = results.iter().filter(|r| r.passed()).count();
        Self {
            total: results.len(),
            passed,
            failed: results.len() - passed,
            violations_observed: results.iter().map(|r| r.violations.len()).sum(),
        }
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// A digested artifact the report refers to, such as the JSONL log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactDigest {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Scenario report in markdown and JSON form.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub title: String,
    pub timestamp: String,
    pub run_id: String,
    pub summary: ScenarioSummary,
    pub results: Vec<ScenarioResult>,
    /// SHA-256 of the serialized `results`.
    pub results_sha256: String,
    pub artifacts: Vec<ArtifactDigest>,
}

impl ScenarioReport {
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        timestamp: impl Into<String>,
        run_id: impl Into<String>,
        results: Vec<ScenarioResult>,
    ) -> Self {
        let encoded = serde_json::to_vec(&results).unwrap_or_default();
        Self {
            title: title.into(),
            timestamp: timestamp.into(),
            run_id: run_id.into(),
            summary: ScenarioSummary::from_results(&results),
            results_sha256: sha256_hex(&encoded),
            results,
            artifacts: Vec::new(),
        }
    }

    /// Record an artifact by its content.
    pub fn add_artifact(&mut self, path: impl Into<String>, content: &[u8]) {
        self.artifacts.push(ArtifactDigest {
            path: path.into(),
            sha256: sha256_hex(content),
            size_bytes: content.len() as u64,
        });
    }

    /// Render the report as markdown.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("# {}\n\n", self.title));
        out.push_str(&format!("- Run: {}\n", self.run_id));
        out.push_str(&format!("- Timestamp: {}\n", self.timestamp));
        out.push_str(&format!("- Total: {}\n", self.summary.total));
        out.push_str(&format!("- Passed: {}\n", self.summary.passed));
        out.push_str(&format!("- Failed: {}\n", self.summary.failed));
        out.push_str(&format!("- Results SHA-256: `{}`\n\n", self.results_sha256));

        out.push_str("| Scenario | Indexing | Status | Violations | Time (us) |\n");
        out.push_str("|----------|----------|--------|------------|-----------|\n");
        for r in &self.results {
            let status = if r.passed() { "PASS" } else { "FAIL" };
            let kinds = if r.violations.is_empty() {
                "-".to_string()
            } else {
                r.violations
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                r.id,
                r.indexing.as_str(),
                status,
                kinds,
                r.duration_us
            ));
        }

        let failures: Vec<_> = self
            .results
            .iter()
            .filter_map(|r| r.failure.as_ref().map(|f| (&r.id, f)))
            .collect();
        if !failures.is_empty() {
            out.push_str("\n## Failures\n\n");
            for (id, reason) in failures {
                out.push_str(&format!("- `{id}`: {reason}\n"));
            }
        }

        if !self.artifacts.is_empty() {
            out.push_str("\n## Artifacts\n\n");
            for a in &self.artifacts {
                out.push_str(&format!("- `{}` ({} bytes) sha256 `{}`\n", a.path, a.size_bytes, a.sha256));
            }
        }
        out
    }

    /// Render the report as JSON.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(&mut out, "{b:02x}");
    }
    out
}

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex_lower(&Sha256::digest(data))
}
