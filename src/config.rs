//! On-disk layout resolution and scan options.
//!
//! Everything sigil persists lives under a single root (`~/.sigil` unless
//! overridden by `$SIGIL_HOME` or `--root`). The root owns five
//! subdirectories: `quarantine/`, `approved/`, `reports/`, `cache/`, and
//! `signatures/`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SigilError};

/// Environment variable overriding the default root directory.
pub const ROOT_ENV: &str = "SIGIL_HOME";

const QUARANTINE_DIR: &str = "quarantine";
const APPROVED_DIR: &str = "approved";
const REPORTS_DIR: &str = "reports";
const CACHE_DIR: &str = "cache";
const SIGNATURES_DIR: &str = "signatures";

/// Resolved base directory with its required subdirectories created.
#[derive(Debug, Clone)]
pub struct SigilRoot {
    root: PathBuf,
}

impl SigilRoot {
    /// Resolve the root directory and create the layout idempotently.
    ///
    /// Precedence: explicit `override_path` (from `--root`), then
    /// `$SIGIL_HOME`, then `~/.sigil`. All directories are created with
    /// owner-only permissions.
    pub fn resolve(override_path: Option<&Path>) -> Result<Self> {
        let root = match override_path {
            Some(p) => p.to_path_buf(),
            None => match env::var_os(ROOT_ENV) {
                Some(v) if !v.is_empty() => PathBuf::from(v),
                _ => dirs::home_dir()
                    .ok_or_else(|| {
                        SigilError::Config("cannot determine home directory".to_string())
                    })?
                    .join(".sigil"),
            },
        };

        let resolved = SigilRoot { root };
        for dir in [
            resolved.root.clone(),
            resolved.quarantine(),
            resolved.approved(),
            resolved.reports(),
            resolved.cache(),
            resolved.signatures(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| SigilError::io_at(&dir, e))?;
            restrict_to_owner(&dir)?;
        }

        Ok(resolved)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn quarantine(&self) -> PathBuf {
        self.root.join(QUARANTINE_DIR)
    }

    pub fn approved(&self) -> PathBuf {
        self.root.join(APPROVED_DIR)
    }

    pub fn reports(&self) -> PathBuf {
        self.root.join(REPORTS_DIR)
    }

    pub fn cache(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn signatures(&self) -> PathBuf {
        self.root.join(SIGNATURES_DIR)
    }

    /// Path to the optional synced signature set.
    pub fn current_signatures_file(&self) -> PathBuf {
        self.signatures().join("current.json")
    }

    /// Path to the persisted configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))
        .map_err(|e| SigilError::io_at(path, e))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Scan options
// ---------------------------------------------------------------------------

/// Tunable limits for one scan. Defaults match the published contract.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Worker pool size for file scanning.
    pub concurrency: usize,
    /// Files larger than this are never read (provenance still sees them).
    pub max_file_bytes: u64,
    /// Traversal stops once this many files were yielded.
    pub max_files: usize,
    /// Wall-clock cap; exceeding it produces a truncated result.
    pub timeout: Duration,
    /// Maximum snippet length in characters.
    pub snippet_len: usize,
    /// Bypass the result cache entirely.
    pub no_cache: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            concurrency: num_cpus::get().min(8),
            max_file_bytes: 2 * 1024 * 1024,
            max_files: 50_000,
            timeout: Duration::from_secs(120),
            snippet_len: 240,
            no_cache: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted configuration file
// ---------------------------------------------------------------------------

/// Operator defaults persisted in `<root>/config.json`.
///
/// Command-line flags always win over these values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Default output format (`text`, `json`, `sarif`).
    pub format: Option<String>,
    /// Default failing-verdict threshold (`low`, `medium`, `high`, `critical`).
    pub threshold: Option<String>,
}

/// Keys the `config` command accepts.
pub const CONFIG_KEYS: &[&str] = &["format", "threshold"];

impl ConfigFile {
    /// Load the config file, falling back to defaults when absent or corrupt.
    pub fn load(root: &SigilRoot) -> ConfigFile {
        let path = root.config_file();
        fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, root: &SigilRoot) -> Result<()> {
        let path = root.config_file();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| SigilError::Config(format!("cannot serialize config: {}", e)))?;
        fs::write(&path, json).map_err(|e| SigilError::io_at(&path, e))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "format" => self.format.as_deref(),
            "threshold" => self.threshold.as_deref(),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "format" => self.format = Some(value.to_string()),
            "threshold" => self.threshold = Some(value.to_string()),
            _ => {
                return Err(SigilError::Config(format!(
                    "unknown config key '{}' (known: {})",
                    key,
                    CONFIG_KEYS.join(", ")
                )))
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let root = SigilRoot::resolve(Some(tmp.path())).unwrap();
        assert!(root.quarantine().is_dir());
        assert!(root.approved().is_dir());
        assert!(root.reports().is_dir());
        assert!(root.cache().is_dir());
        assert!(root.signatures().is_dir());

        // Second resolve over the same tree must succeed unchanged.
        SigilRoot::resolve(Some(tmp.path())).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn root_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let root = SigilRoot::resolve(Some(tmp.path())).unwrap();
        let mode = fs::metadata(root.quarantine()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn config_file_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let root = SigilRoot::resolve(Some(tmp.path())).unwrap();

        let mut cfg = ConfigFile::load(&root);
        assert!(cfg.format.is_none());

        cfg.set("format", "json").unwrap();
        cfg.save(&root).unwrap();

        let reloaded = ConfigFile::load(&root);
        assert_eq!(reloaded.get("format"), Some("json"));
        assert!(reloaded.get("threshold").is_none());
    }

    #[test]
    fn unknown_config_key_is_rejected() {
        let mut cfg = ConfigFile::default();
        assert!(cfg.set("colour", "always").is_err());
    }
}
