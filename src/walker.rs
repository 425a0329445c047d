//! Bounded, symlink-safe enumeration of scannable files.
//!
//! The walker never opens file contents itself; it yields paths, sizes, and
//! language hints, and the scan engine reads bytes from its worker pool.
//! Safety contract: symlinks are never followed (in-root targets are
//! enumerated on their own; escaping targets are rejected by canonical
//! prefix comparison), ignored globs are applied before anything else, and
//! both the per-file byte cap and the per-scan file-count cap are enforced
//! here.

use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::ScanOptions;
use crate::fingerprint::normalized_rel_path;

/// Globs excluded from every scan before user patterns apply.
const DEFAULT_IGNORES: &[&str] = &[".git", ".git/**", ".hg", ".hg/**", ".svn", ".svn/**"];

/// Name of the optional per-tree ignore file, read from the scan root.
pub const IGNORE_FILE: &str = ".sigilignore";

/// Tree-level fact tags consumed by provenance `fact` rules.
pub const FACT_OVERSIZED: &str = "oversized-file";
pub const FACT_SHALLOW_CLONE: &str = "shallow-clone";
pub const FACT_NO_VCS_HISTORY: &str = "no-vcs-history";

/// One file selected for scanning.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the scan root, forward-slash separated.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    /// Language tag derived from the file name, if recognized.
    pub language: Option<&'static str>,
}

/// The outcome of one traversal.
#[derive(Debug, Default)]
pub struct WalkReport {
    /// Included files, sorted by relative path.
    pub files: Vec<FileEntry>,
    /// Tree-level facts for the provenance phase.
    pub facts: Vec<&'static str>,
    /// Relative paths skipped for exceeding the per-file byte cap.
    pub oversized: Vec<String>,
    /// Traversal stopped at the file-count cap.
    pub hit_file_cap: bool,
    /// Recoverable per-path problems (logged, never fatal).
    pub warnings: Vec<String>,
}

/// Ordered glob patterns excluding paths from traversal.
pub struct IgnoreSet {
    set: GlobSet,
}

impl IgnoreSet {
    /// Builtin defaults plus the scan root's `.sigilignore`, if present.
    /// Unparsable user globs are reported as warnings and skipped.
    pub fn for_scan_root(root: &Path) -> (IgnoreSet, Vec<String>) {
        let mut warnings = Vec::new();
        let mut builder = GlobSetBuilder::new();

        for pattern in DEFAULT_IGNORES {
            // Builtin patterns are compile-time constants; a failure here is
            // a programming error.
            builder.add(Glob::new(pattern).expect("builtin ignore glob"));
        }

        if let Ok(contents) = fs::read_to_string(root.join(IGNORE_FILE)) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match Glob::new(line) {
                    Ok(glob) => {
                        builder.add(glob);
                    }
                    Err(e) => warnings.push(format!("{}: bad glob '{}': {}", IGNORE_FILE, line, e)),
                }
            }
        }

        let set = builder.build().unwrap_or_else(|_| GlobSet::empty());
        (IgnoreSet { set }, warnings)
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        self.set.is_match(rel_path)
    }
}

/// Enumerate scannable files under `root` (a directory or a single file).
pub fn walk(root: &Path, options: &ScanOptions, ignore: &IgnoreSet) -> WalkReport {
    let mut report = WalkReport::default();

    if root.is_file() {
        let name = root
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        match root.metadata() {
            Ok(meta) if meta.len() > options.max_file_bytes => report.oversized.push(name),
            Ok(meta) => report.files.push(FileEntry {
                language: language_hint(&name),
                rel_path: name,
                abs_path: root.to_path_buf(),
                size: meta.len(),
            }),
            Err(e) => report.warnings.push(format!("{}: {}", root.display(), e)),
        }
        finish(root, &mut report);
        return report;
    }

    let root_canon = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

    let walker = WalkDir::new(root).follow_links(false).into_iter();
    let mut iter = walker.filter_entry(|e| {
        if e.depth() == 0 {
            return true;
        }
        let rel = normalized_rel_path(root, e.path());
        !ignore.is_ignored(&rel)
    });

    while let Some(entry) = iter.next() {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                report.warnings.push(format!("traversal: {}", e));
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }

        let rel = normalized_rel_path(root, entry.path());

        if entry.path_is_symlink() {
            // Links are never opened. An in-root target will be enumerated
            // as its own entry; an escaping one is refused outright.
            match fs::canonicalize(entry.path()) {
                Ok(target) if target.starts_with(&root_canon) => {}
                Ok(_) => report
                    .warnings
                    .push(format!("{}: symlink escapes scan root, skipped", rel)),
                Err(_) => report.warnings.push(format!("{}: dangling symlink", rel)),
            }
            continue;
        }

        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                report.warnings.push(format!("{}: {}", rel, e));
                continue;
            }
        };

        if size > options.max_file_bytes {
            report.oversized.push(rel);
            continue;
        }

        if report.files.len() >= options.max_files {
            report.hit_file_cap = true;
            break;
        }

        report.files.push(FileEntry {
            language: language_hint(&rel),
            abs_path: entry.into_path(),
            rel_path: rel,
            size,
        });
    }

    finish(root, &mut report);
    report
}

/// Sort for determinism and collect tree-level facts.
fn finish(root: &Path, report: &mut WalkReport) {
    report.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    report.oversized.sort();

    if !report.oversized.is_empty() {
        report.facts.push(FACT_OVERSIZED);
    }

    // The .git directory is excluded from traversal, so history facts are
    // probed directly against the root.
    let git_dir = root.join(".git");
    if git_dir.is_dir() {
        if git_dir.join("shallow").is_file() {
            report.facts.push(FACT_SHALLOW_CLONE);
        }
    } else if ["package.json", "setup.py", "pyproject.toml"]
        .iter()
        .any(|m| root.join(m).is_file())
    {
        report.facts.push(FACT_NO_VCS_HISTORY);
    }
}

/// Map a file name to a language tag used by `language_hints` on rules.
pub fn language_hint(rel_path: &str) -> Option<&'static str> {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    match name {
        "Makefile" | "makefile" | "GNUmakefile" => return Some("make"),
        "Dockerfile" => return Some("docker"),
        _ => {}
    }

    let ext = name.rsplit_once('.').map(|(_, e)| e)?;
    match ext.to_ascii_lowercase().as_str() {
        "py" | "pyi" => Some("python"),
        "js" | "mjs" | "cjs" | "jsx" => Some("javascript"),
        "ts" | "tsx" => Some("typescript"),
        "sh" | "bash" | "zsh" => Some("shell"),
        "rb" => Some("ruby"),
        "go" => Some("go"),
        "rs" => Some("rust"),
        "java" => Some("java"),
        "php" => Some("php"),
        "pl" | "pm" => Some("perl"),
        "ps1" => Some("powershell"),
        "json" => Some("json"),
        "yml" | "yaml" => Some("yaml"),
        "toml" => Some("toml"),
        "cfg" | "ini" => Some("ini"),
        "mk" => Some("make"),
        "md" => Some("markdown"),
        _ => None,
    }
}
