//! Result encoding and presentation: the persisted plain-text report, the
//! machine-readable JSON result, SARIF 2.1.0, and colored terminal output.

use std::collections::HashSet;
use std::str::FromStr;

use colored::Colorize;

use crate::errors::{Result, SigilError};
use crate::quarantine::{QuarantineItem, QuarantineState};
use crate::scanner::{Finding, ScanResult, Verdict};
use crate::signatures::{Severity, ALL_PHASES};

/// Output encodings selectable with `--format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Sarif,
}

impl FromStr for OutputFormat {
    type Err = SigilError;

    fn from_str(s: &str) -> Result<OutputFormat> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "sarif" => Ok(OutputFormat::Sarif),
            other => Err(SigilError::Config(format!(
                "unknown format '{}' (expected text, json, or sarif)",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Plain-text report (persisted to reports/<id>_report.txt)
// ---------------------------------------------------------------------------

const BOX_WIDTH: usize = 38;

/// Render the human-readable report. No color codes; this goes to a file.
pub fn render_text(result: &ScanResult, quarantine_id: Option<&str>) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Sigil scan report\nTarget: {} ({})\nScanned: {}\nFiles scanned: {}\nSignatures: {}\nContent digest: {}\n",
        result.target,
        result.target_type,
        result.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        result.files_scanned,
        result.signatures_version,
        result.content_digest,
    ));
    if result.truncated {
        out.push_str("NOTE: scan truncated by a resource cap; findings are a lower bound\n");
    }
    out.push('\n');

    for phase in ALL_PHASES {
        let findings: Vec<&Finding> =
            result.findings.iter().filter(|f| f.phase == phase).collect();
        if findings.is_empty() {
            continue;
        }
        out.push_str(&format!("=== Phase {}: {} ===\n", phase.number(), phase));

        let mut last_rule = "";
        for f in findings {
            if f.rule != last_rule {
                out.push_str(&format!("[{}] {}:\n", f.severity, f.description));
                last_rule = &f.rule;
            }
            match f.line {
                Some(line) => out.push_str(&format!("  {}:{}: {}\n", f.file, line, f.snippet)),
                None => out.push_str(&format!("  {}: {}\n", f.file, f.snippet)),
            }
        }
        out.push('\n');
    }

    let border = format!("+{}+\n", "-".repeat(BOX_WIDTH));
    out.push_str(&border);
    out.push_str(&box_line(&format!("VERDICT: {}", result.verdict)));
    out.push_str(&box_line(&format!(
        "Risk Score: {}",
        format_score(result.score)
    )));
    out.push_str(&box_line(advice(result.verdict)));
    out.push_str(&border);

    if let Some(id) = quarantine_id {
        out.push_str(&format!("Quarantine ID: {}\n", id));
    }

    out
}

fn box_line(text: &str) -> String {
    let text: String = text.chars().take(BOX_WIDTH - 3).collect();
    format!("|  {:<width$}|\n", text, width = BOX_WIDTH - 2)
}

fn advice(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::Clean => "No known malicious patterns detected",
        Verdict::LowRisk => "Review the findings before use",
        Verdict::MediumRisk => "Review carefully before approving",
        Verdict::HighRisk => "Do not approve without manual review",
        Verdict::Critical => "DO NOT install or execute this code",
    }
}

/// Integer-looking scores print without a fraction.
fn format_score(score: f64) -> String {
    if score.fract() == 0.0 {
        format!("{}", score as i64)
    } else {
        format!("{:.1}", score)
    }
}

// ---------------------------------------------------------------------------
// JSON (persisted to reports/<id>.json and printed with --format json)
// ---------------------------------------------------------------------------

pub fn render_json(result: &ScanResult) -> Result<String> {
    serde_json::to_string_pretty(result)
        .map_err(|e| SigilError::Config(format!("cannot serialize result: {}", e)))
}

pub fn parse_json(data: &str) -> std::result::Result<ScanResult, String> {
    serde_json::from_str(data).map_err(|e| e.to_string())
}

// ---------------------------------------------------------------------------
// SARIF 2.1.0
// ---------------------------------------------------------------------------

/// Encode results as SARIF 2.1.0, consumable by GitHub Code Scanning and
/// SARIF viewers.
pub fn render_sarif(result: &ScanResult) -> String {
    let sarif = serde_json::json!({
        "$schema": "https://raw.githubusercontent.com/oasis-tcs/sarif-spec/main/sarif-2.1/schema/sarif-schema-2.1.0.json",
        "version": "2.1.0",
        "runs": [{
            "tool": {
                "driver": {
                    "name": "Sigil",
                    "version": env!("CARGO_PKG_VERSION"),
                    "informationUri": "https://github.com/NOMARJ/sigil",
                    "rules": sarif_rules(&result.findings)
                }
            },
            "results": result.findings.iter().map(|f| {
                serde_json::json!({
                    "ruleId": f.rule,
                    "level": sarif_level(f.severity),
                    "message": {
                        "text": format!("{}: {}", f.description, f.snippet)
                    },
                    "locations": [{
                        "physicalLocation": {
                            "artifactLocation": {
                                "uri": f.file,
                                "uriBaseId": "%SRCROOT%"
                            },
                            "region": {
                                "startLine": f.line.unwrap_or(1),
                                "startColumn": 1
                            }
                        }
                    }],
                    "properties": {
                        "phase": f.phase.canonical_name(),
                        "weight": f.weight
                    }
                })
            }).collect::<Vec<_>>(),
            "invocations": [{
                "executionSuccessful": true,
                "properties": {
                    "riskScore": result.score,
                    "verdict": format!("{:?}", result.verdict),
                    "filesScanned": result.files_scanned,
                    "durationMs": result.duration_ms,
                    "truncated": result.truncated
                }
            }],
            "artifacts": [{
                "location": {
                    "uri": result.target,
                    "uriBaseId": "%SRCROOT%"
                }
            }]
        }]
    });

    serde_json::to_string_pretty(&sarif).unwrap_or_default()
}

fn sarif_level(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "note",
        Severity::Medium => "warning",
        Severity::High | Severity::Critical => "error",
    }
}

/// Rule descriptors deduplicated by id.
fn sarif_rules(findings: &[Finding]) -> Vec<serde_json::Value> {
    let mut seen = HashSet::new();
    findings
        .iter()
        .filter_map(|f| {
            seen.insert(f.rule.clone()).then(|| {
                serde_json::json!({
                    "id": f.rule,
                    "shortDescription": { "text": f.description },
                    "defaultConfiguration": { "level": sarif_level(f.severity) },
                    "properties": { "phase": f.phase.canonical_name() }
                })
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Terminal rendering (text format on stdout)
// ---------------------------------------------------------------------------

/// Print a summary with scan statistics.
pub fn print_scan_summary(result: &ScanResult) {
    println!();
    println!(
        "  {} Scan complete in {}ms",
        "sigil".bold().cyan(),
        result.duration_ms
    );
    println!("  {} files scanned", result.files_scanned);
    println!("  {} findings", result.findings.len());
    println!("  Risk score: {}", colored_score(result.score));
    if result.truncated {
        println!(
            "  {} scan truncated by a resource cap; findings are a lower bound",
            "note:".bold().yellow()
        );
    }

    if result.findings.is_empty() {
        return;
    }

    let mut counts = [0u32; 4];
    for f in &result.findings {
        match f.severity {
            Severity::Critical => counts[0] += 1,
            Severity::High => counts[1] += 1,
            Severity::Medium => counts[2] += 1,
            Severity::Low => counts[3] += 1,
        }
    }
    println!(
        "  Breakdown: {} critical, {} high, {} medium, {} low",
        if counts[0] > 0 {
            counts[0].to_string().red().bold().to_string()
        } else {
            "0".to_string()
        },
        if counts[1] > 0 {
            counts[1].to_string().red().to_string()
        } else {
            "0".to_string()
        },
        if counts[2] > 0 {
            counts[2].to_string().yellow().to_string()
        } else {
            "0".to_string()
        },
        counts[3]
    );
}

/// Print findings grouped by scan phase.
pub fn print_findings(result: &ScanResult) {
    if result.findings.is_empty() {
        println!("{} No findings.", "  [*]".green());
        return;
    }

    for phase in ALL_PHASES {
        let phase_findings: Vec<&Finding> =
            result.findings.iter().filter(|f| f.phase == phase).collect();
        if phase_findings.is_empty() {
            continue;
        }

        println!();
        println!(
            "  {} Phase {}: {} ({} finding{})",
            ">>".bold(),
            phase.number(),
            phase.to_string().bold(),
            phase_findings.len(),
            if phase_findings.len() == 1 { "" } else { "s" }
        );
        println!("  {}", "-".repeat(56));

        for finding in phase_findings {
            let location = match finding.line {
                Some(line) => format!("{}:{}", finding.file, line),
                None => finding.file.clone(),
            };
            println!(
                "  {} [{}] {}",
                colored_severity(finding.severity),
                finding.rule.dimmed(),
                location.bold()
            );
            println!("       {}", finding.description);
            println!("       {}", finding.snippet.dimmed());
        }
    }
}

/// Print the final verdict banner.
pub fn print_verdict(verdict: Verdict) {
    println!();
    let line = "=".repeat(60);

    match verdict {
        Verdict::Clean => {
            println!("{}", line.green());
            println!(
                "{}",
                "  CLEAN -- No known malicious patterns detected"
                    .green()
                    .bold()
            );
            println!("{}", line.green());
        }
        Verdict::LowRisk => {
            println!("{}", line.green());
            println!(
                "{}",
                "  LOW RISK -- Minor findings, review before use"
                    .green()
                    .bold()
            );
            println!("{}", line.green());
        }
        Verdict::MediumRisk => {
            println!("{}", line.yellow());
            println!(
                "{}",
                "  MEDIUM RISK -- Suspicious patterns detected"
                    .yellow()
                    .bold()
            );
            println!("{}", line.yellow());
        }
        Verdict::HighRisk => {
            println!("{}", line.red());
            println!(
                "{}",
                "  HIGH RISK -- Likely malicious patterns found".red().bold()
            );
            println!("{}", line.red());
        }
        Verdict::Critical => {
            println!("{}", line.red().bold());
            println!(
                "{}",
                "  CRITICAL -- Almost certainly malicious!".red().bold()
            );
            println!("{}", "  DO NOT install or execute this code.".red().bold());
            println!("{}", line.red().bold());
        }
    }
    println!();
}

fn colored_severity(severity: Severity) -> String {
    match severity {
        Severity::Low => "LOW     ".dimmed().to_string(),
        Severity::Medium => "MEDIUM  ".yellow().to_string(),
        Severity::High => "HIGH    ".red().to_string(),
        Severity::Critical => "CRITICAL".red().bold().to_string(),
    }
}

/// Format the numeric score with color (thresholds: 0/10/25/50).
fn colored_score(score: f64) -> String {
    let rendered = format_score(score);
    if score == 0.0 {
        rendered.green().bold().to_string()
    } else if score < 10.0 {
        rendered.cyan().bold().to_string()
    } else if score < 25.0 {
        rendered.yellow().bold().to_string()
    } else {
        rendered.red().bold().to_string()
    }
}

// ---------------------------------------------------------------------------
// Quarantine list display
// ---------------------------------------------------------------------------

/// Print the quarantine inventory.
pub fn print_quarantine_list(items: &[QuarantineItem], detailed: bool) {
    println!();
    println!(
        "  {} Quarantined items ({})",
        "sigil".bold().cyan(),
        items.len()
    );
    println!("  {}", "-".repeat(60));

    for item in items {
        let state = match item.state {
            QuarantineState::Pending => "PENDING ".yellow().to_string(),
            QuarantineState::Approved => "APPROVED".green().to_string(),
            QuarantineState::Rejected => "REJECTED".red().to_string(),
        };
        let verdict = item
            .verdict
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unscanned".to_string());
        let score = item
            .score
            .map(format_score)
            .unwrap_or_else(|| "-".to_string());

        println!(
            "  {} [{}] {} ({}, score {})",
            state,
            item.id.dimmed(),
            item.target.bold(),
            verdict,
            score
        );

        if detailed {
            println!("       Path:    {}", item.path.display());
            if let Some(created) = item.created_at {
                println!(
                    "       Created: {}",
                    created.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            if let Some(tt) = item.target_type {
                println!("       Source:  {}", tt);
            }
            println!();
        }
    }
}
