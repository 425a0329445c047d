//! Scan result diffing: compare a baseline and a current result to
//! identify new, resolved, and unchanged findings.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::scanner::{Finding, ScanResult, Verdict};

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanDiff {
    pub new_findings: Vec<Finding>,
    pub resolved_findings: Vec<Finding>,
    pub unchanged_findings: Vec<Finding>,
    pub score_delta: f64,
    pub baseline_verdict: Verdict,
    pub current_verdict: Verdict,
    pub summary: String,
}

/// Findings are matched by (rule, file, line); severity or snippet churn
/// with the same location is treated as unchanged.
fn key(finding: &Finding) -> (String, String, Option<usize>) {
    (
        finding.rule.clone(),
        finding.file.clone(),
        finding.line,
    )
}

/// Compare two scan results.
pub fn diff_scans(baseline: &ScanResult, current: &ScanResult) -> ScanDiff {
    let baseline_keys: HashSet<_> = baseline.findings.iter().map(key).collect();
    let current_keys: HashSet<_> = current.findings.iter().map(key).collect();

    let mut new_findings = Vec::new();
    let mut unchanged_findings = Vec::new();
    for finding in &current.findings {
        if baseline_keys.contains(&key(finding)) {
            unchanged_findings.push(finding.clone());
        } else {
            new_findings.push(finding.clone());
        }
    }

    let resolved_findings: Vec<Finding> = baseline
        .findings
        .iter()
        .filter(|f| !current_keys.contains(&key(f)))
        .cloned()
        .collect();

    let score_delta = current.score - baseline.score;
    let summary = format!(
        "{} new, {} resolved, {} unchanged (score: {} -> {}, {}{})",
        new_findings.len(),
        resolved_findings.len(),
        unchanged_findings.len(),
        baseline.score,
        current.score,
        if score_delta >= 0.0 { "+" } else { "" },
        score_delta,
    );

    ScanDiff {
        new_findings,
        resolved_findings,
        unchanged_findings,
        score_delta,
        baseline_verdict: baseline.verdict,
        current_verdict: current.verdict,
        summary,
    }
}
