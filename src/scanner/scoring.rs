use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Finding, Verdict};
use crate::signatures::{Phase, Severity, ALL_PHASES};

/// Per-phase rollup for presentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseSummary {
    pub findings: usize,
    /// Sum of weighted contributions from this phase.
    pub weight: f64,
    pub max_severity: Option<Severity>,
}

/// Aggregate risk score: each finding contributes
/// `finding.weight * phase multiplier`.
pub fn calculate_score(findings: &[Finding]) -> f64 {
    findings
        .iter()
        .map(|f| f.weight * f.phase.multiplier())
        .sum()
}

/// Map findings and score to the overall verdict.
///
/// Thresholds:
/// - **Clean**: score 0 (no findings)
/// - **LowRisk**: score below 10
/// - **MediumRisk**: 10 to below 25
/// - **HighRisk**: 25 to below 50
/// - **Critical**: 50 and above
///
/// Override: a Critical-severity install-hook finding forces at least
/// HighRisk; with rule weight >= 10 it forces Critical outright.
pub fn determine_verdict(findings: &[Finding], score: f64) -> Verdict {
    let by_score = if score <= 0.0 {
        Verdict::Clean
    } else if score < 10.0 {
        Verdict::LowRisk
    } else if score < 25.0 {
        Verdict::MediumRisk
    } else if score < 50.0 {
        Verdict::HighRisk
    } else {
        Verdict::Critical
    };

    let mut floor = Verdict::Clean;
    for f in findings {
        if f.phase == Phase::InstallHooks && f.severity == Severity::Critical {
            floor = if f.weight >= 10.0 {
                Verdict::Critical
            } else {
                floor.max(Verdict::HighRisk)
            };
            if floor == Verdict::Critical {
                break;
            }
        }
    }

    by_score.max(floor)
}

/// Per-phase counts and weighted contributions, keyed by canonical phase
/// name. Every phase appears, so consumers see a stable shape.
pub fn phase_rollups(findings: &[Finding]) -> BTreeMap<String, PhaseSummary> {
    let mut rollups: BTreeMap<String, PhaseSummary> = ALL_PHASES
        .iter()
        .map(|p| {
            (
                p.canonical_name().to_string(),
                PhaseSummary {
                    findings: 0,
                    weight: 0.0,
                    max_severity: None,
                },
            )
        })
        .collect();

    for f in findings {
        let entry = rollups
            .get_mut(f.phase.canonical_name())
            .expect("all phases pre-seeded");
        entry.findings += 1;
        entry.weight += f.weight * f.phase.multiplier();
        entry.max_severity = Some(match entry.max_severity {
            Some(s) => s.max(f.severity),
            None => f.severity,
        });
    }

    rollups
}
