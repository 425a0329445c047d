//! Signature catalog: rule types, validated loading, and set versioning.
//!
//! A store is either entirely valid or unusable: any bad pattern, duplicate
//! id, unknown enum value, or out-of-range weight aborts the load before a
//! single file is scanned. External sets (the optional synced
//! `signatures/current.json`) go through the same validation as the builtin
//! catalog and overlay it by id.

mod builtin;

use std::collections::BTreeMap;
use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{Result, SigilError};

/// The six scan phases, each targeting a different threat category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Phase 1: code that runs during package installation.
    InstallHooks,
    /// Phase 2: runtime code-execution surfaces.
    CodePatterns,
    /// Phase 3: outbound network activity.
    NetworkExfil,
    /// Phase 4: credential store access.
    Credentials,
    /// Phase 5: payload hiding.
    Obfuscation,
    /// Phase 6: metadata red flags.
    Provenance,
}

pub const ALL_PHASES: [Phase; 6] = [
    Phase::InstallHooks,
    Phase::CodePatterns,
    Phase::NetworkExfil,
    Phase::Credentials,
    Phase::Obfuscation,
    Phase::Provenance,
];

impl Phase {
    /// Intrinsic score multiplier applied to every finding in this phase.
    /// Provenance rules carry per-rule weights (1-3) over a 1x multiplier.
    pub fn multiplier(self) -> f64 {
        match self {
            Phase::InstallHooks => 10.0,
            Phase::CodePatterns => 5.0,
            Phase::NetworkExfil => 3.0,
            Phase::Credentials => 2.0,
            Phase::Obfuscation => 5.0,
            Phase::Provenance => 1.0,
        }
    }

    /// 1-based position in the report ordering.
    pub fn number(self) -> usize {
        ALL_PHASES.iter().position(|p| *p == self).unwrap() + 1
    }

    fn parse(value: &str) -> Option<Phase> {
        match value.to_lowercase().as_str() {
            "install-hooks" | "install_hooks" | "installhooks" => Some(Phase::InstallHooks),
            "code-patterns" | "code_patterns" | "codepatterns" => Some(Phase::CodePatterns),
            "network-exfil" | "network_exfil" | "networkexfil" => Some(Phase::NetworkExfil),
            "credentials" => Some(Phase::Credentials),
            "obfuscation" => Some(Phase::Obfuscation),
            "provenance" => Some(Phase::Provenance),
            _ => None,
        }
    }

    /// Stable snake_case name used in JSON output and rollup keys.
    pub fn canonical_name(self) -> &'static str {
        match self {
            Phase::InstallHooks => "install_hooks",
            Phase::CodePatterns => "code_patterns",
            Phase::NetworkExfil => "network_exfil",
            Phase::Credentials => "credentials",
            Phase::Obfuscation => "obfuscation",
            Phase::Provenance => "provenance",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::InstallHooks => write!(f, "Install Hooks"),
            Phase::CodePatterns => write!(f, "Code Patterns"),
            Phase::NetworkExfil => write!(f, "Network/Exfil"),
            Phase::Credentials => write!(f, "Credentials"),
            Phase::Obfuscation => write!(f, "Obfuscation"),
            Phase::Provenance => write!(f, "Provenance"),
        }
    }
}

/// Severity level for a rule and the findings it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn parse(value: &str) -> Option<Severity> {
        match value.to_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    fn canonical_name(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::High => write!(f, "HIGH"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Rule categories that gate where a rule applies.
///
/// `InstallHooks` rules only run against recognized manifests; a category
/// narrows them further to one manifest family. `Provenance` rules use the
/// category to pick their input: `"path"` rules match relative paths,
/// `"fact"` rules match tree-level fact tags collected by the walker.
pub mod categories {
    pub const PYTHON_MANIFEST: &str = "python-manifest";
    pub const NODE_MANIFEST: &str = "node-manifest";
    pub const MAKE_MANIFEST: &str = "make-manifest";
    pub const CI_MANIFEST: &str = "ci-manifest";
    pub const MCP_MANIFEST: &str = "mcp-manifest";
    pub const PATH: &str = "path";
    pub const FACT: &str = "fact";
}

/// Wire/JSON form of a rule, prior to validation and compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSignature {
    pub id: String,
    pub phase: String,
    pub severity: String,
    pub weight: f64,
    pub pattern: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub language_hints: Option<Vec<String>>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub false_positive_likelihood: Option<String>,
}

/// A set of raw signatures as fetched or read from disk.
///
/// Accepts both the wrapped form (`{"signatures": [...]}`) and a bare array.
#[derive(Debug, Clone, Default)]
pub struct SignatureSet {
    pub signatures: Vec<RawSignature>,
}

impl SignatureSet {
    pub fn from_json(data: &str) -> std::result::Result<SignatureSet, String> {
        #[derive(Deserialize)]
        struct Wrapped {
            signatures: Vec<RawSignature>,
        }
        if let Ok(w) = serde_json::from_str::<Wrapped>(data) {
            return Ok(SignatureSet {
                signatures: w.signatures,
            });
        }
        serde_json::from_str::<Vec<RawSignature>>(data)
            .map(|signatures| SignatureSet { signatures })
            .map_err(|e| e.to_string())
    }
}

/// A validated, compiled rule. Immutable once loaded.
#[derive(Debug)]
pub struct Signature {
    pub id: String,
    pub phase: Phase,
    pub severity: Severity,
    /// Multiplier in [0, 20], combined with the phase multiplier at scoring.
    pub weight: f64,
    pub pattern: Regex,
    pub description: String,
    pub language_hints: Option<Vec<String>>,
    pub category: Option<String>,
    pub false_positive_likelihood: Option<String>,
}

impl Signature {
    /// Whether this rule applies to a file with the given language hint.
    /// Rules without hints apply everywhere; hinted rules require a match.
    pub fn accepts_language(&self, hint: Option<&str>) -> bool {
        match (&self.language_hints, hint) {
            (None, _) => true,
            (Some(hints), Some(h)) => hints.iter().any(|l| l == h),
            (Some(_), None) => false,
        }
    }
}

/// In-memory catalog of compiled rules, deduplicated by id.
#[derive(Debug)]
pub struct SignatureStore {
    rules: BTreeMap<String, Signature>,
    version: String,
}

impl SignatureStore {
    /// Compile the embedded catalog.
    pub fn load_builtin() -> Result<SignatureStore> {
        let mut store = SignatureStore {
            rules: BTreeMap::new(),
            version: String::new(),
        };
        store.merge(builtin::catalog())?;
        Ok(store)
    }

    /// Overlay a set onto the store. Duplicate ids *within* the incoming
    /// set are an error; ids already present in the store are replaced.
    pub fn merge(&mut self, set: SignatureSet) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        let mut compiled = Vec::with_capacity(set.signatures.len());
        for raw in set.signatures {
            if !seen.insert(raw.id.clone()) {
                return Err(SigilError::DuplicateSignature(raw.id));
            }
            compiled.push(compile(raw)?);
        }
        for sig in compiled {
            self.rules.insert(sig.id.clone(), sig);
        }
        self.version = compute_version(&self.rules);
        Ok(())
    }

    /// Monotonic identifier of the current set; changes whenever membership
    /// or any pattern/severity/weight/phase changes.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.rules.values()
    }

    pub fn for_phase(&self, phase: Phase) -> impl Iterator<Item = &Signature> {
        self.rules.values().filter(move |s| s.phase == phase)
    }
}

fn compile(raw: RawSignature) -> Result<Signature> {
    let phase = Phase::parse(&raw.phase).ok_or_else(|| SigilError::UnknownPhase {
        id: raw.id.clone(),
        value: raw.phase.clone(),
    })?;
    let severity = Severity::parse(&raw.severity).ok_or_else(|| SigilError::UnknownSeverity {
        id: raw.id.clone(),
        value: raw.severity.clone(),
    })?;
    if !raw.weight.is_finite() || !(0.0..=20.0).contains(&raw.weight) {
        return Err(SigilError::OutOfRangeWeight {
            id: raw.id,
            value: raw.weight,
        });
    }
    let pattern = RegexBuilder::new(&raw.pattern)
        .case_insensitive(true)
        .multi_line(true)
        .build()
        .map_err(|e| SigilError::InvalidPattern {
            id: raw.id.clone(),
            reason: e.to_string(),
        })?;

    Ok(Signature {
        id: raw.id,
        phase,
        severity,
        weight: raw.weight,
        pattern,
        description: raw.description,
        language_hints: raw.language_hints,
        category: raw.category,
        false_positive_likelihood: raw.false_positive_likelihood,
    })
}

/// Digest of everything that affects scan semantics, in id order.
fn compute_version(rules: &BTreeMap<String, Signature>) -> String {
    let mut hasher = Sha256::new();
    for (id, sig) in rules {
        hasher.update(id.as_bytes());
        hasher.update([0]);
        hasher.update(sig.phase.canonical_name().as_bytes());
        hasher.update([0]);
        hasher.update(sig.severity.canonical_name().as_bytes());
        hasher.update([0]);
        hasher.update(sig.weight.to_bits().to_le_bytes());
        hasher.update(sig.pattern.as_str().as_bytes());
        hasher.update([0]);
    }
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: &str, pattern: &str) -> RawSignature {
        RawSignature {
            id: id.to_string(),
            phase: "code_patterns".to_string(),
            severity: "high".to_string(),
            weight: 2.0,
            pattern: pattern.to_string(),
            description: String::new(),
            language_hints: None,
            category: None,
            false_positive_likelihood: None,
        }
    }

    #[test]
    fn builtin_catalog_loads() {
        let store = SignatureStore::load_builtin().unwrap();
        assert!(store.len() > 50);
        // Every phase must be represented.
        for phase in ALL_PHASES {
            assert!(store.for_phase(phase).next().is_some(), "{phase} is empty");
        }
    }

    #[test]
    fn invalid_pattern_aborts_load() {
        let mut store = SignatureStore::load_builtin().unwrap();
        let set = SignatureSet {
            signatures: vec![raw("BAD-001", "([unclosed")],
        };
        assert!(matches!(
            store.merge(set),
            Err(SigilError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn duplicate_id_within_one_source_is_an_error() {
        let mut store = SignatureStore::load_builtin().unwrap();
        let set = SignatureSet {
            signatures: vec![raw("DUP-001", "a"), raw("DUP-001", "b")],
        };
        assert!(matches!(
            store.merge(set),
            Err(SigilError::DuplicateSignature(_))
        ));
    }

    #[test]
    fn out_of_range_weight_is_rejected() {
        let mut store = SignatureStore::load_builtin().unwrap();
        let mut bad = raw("W-001", "a");
        bad.weight = 21.0;
        assert!(matches!(
            store.merge(SignatureSet {
                signatures: vec![bad]
            }),
            Err(SigilError::OutOfRangeWeight { .. })
        ));
    }

    #[test]
    fn unknown_phase_is_rejected() {
        let mut store = SignatureStore::load_builtin().unwrap();
        let mut bad = raw("P-001", "a");
        bad.phase = "quantum".to_string();
        assert!(matches!(
            store.merge(SignatureSet {
                signatures: vec![bad]
            }),
            Err(SigilError::UnknownPhase { .. })
        ));
    }

    #[test]
    fn merge_replaces_by_id_and_changes_version() {
        let mut store = SignatureStore::load_builtin().unwrap();
        let before = store.version().to_string();
        let count = store.len();

        // Replace an existing builtin rule with a different pattern.
        let mut replacement = raw("CODE-001", r"\bnever_matches_anything\b");
        replacement.severity = "low".to_string();
        store
            .merge(SignatureSet {
                signatures: vec![replacement],
            })
            .unwrap();

        assert_eq!(store.len(), count);
        assert_ne!(store.version(), before);
    }

    #[test]
    fn version_is_stable_for_identical_sets() {
        let a = SignatureStore::load_builtin().unwrap();
        let b = SignatureStore::load_builtin().unwrap();
        assert_eq!(a.version(), b.version());
    }

    #[test]
    fn signature_set_accepts_wrapped_and_bare_json() {
        let bare = r#"[{"id":"X-1","phase":"obfuscation","severity":"low","weight":1.0,"pattern":"x"}]"#;
        let wrapped = format!(r#"{{"signatures":{}}}"#, bare);
        assert_eq!(SignatureSet::from_json(bare).unwrap().signatures.len(), 1);
        assert_eq!(
            SignatureSet::from_json(&wrapped).unwrap().signatures.len(),
            1
        );
    }

    #[test]
    fn language_hints_gate_applicability() {
        let store = SignatureStore::load_builtin().unwrap();
        let pickle = store
            .iter()
            .find(|s| s.id == "CODE-004")
            .expect("builtin pickle rule");
        assert!(pickle.accepts_language(Some("python")));
        assert!(!pickle.accepts_language(Some("javascript")));
        assert!(!pickle.accepts_language(None));
    }
}
