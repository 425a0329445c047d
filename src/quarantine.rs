//! Quarantine lifecycle: stage, scan, list, approve, reject.
//!
//! The manager is the sole writer under the quarantine area. Item state is
//! the filesystem layout itself: a tree under `quarantine/<id>/` is
//! Pending, a tree under `approved/<id>/` is Approved, and a report with no
//! surviving tree is the audit trail of a Rejected item. Acquisition
//! happens through injected fetchers that only ever see a freshly created,
//! empty staging directory.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cache::ScanCache;
use crate::config::{ScanOptions, SigilRoot};
use crate::errors::{Result, SigilError};
use crate::fetchers::{self, GitFetcher, PackageFetcher, PackageManager, UrlFetcher};
use crate::fingerprint::tree_digest;
use crate::report;
use crate::scanner::{CancelFlag, ScanEngine, ScanResult, TargetType, Verdict};
use crate::signatures::SignatureStore;

/// Lifecycle state of a quarantined item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuarantineState {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for QuarantineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuarantineState::Pending => write!(f, "pending"),
            QuarantineState::Approved => write!(f, "approved"),
            QuarantineState::Rejected => write!(f, "rejected"),
        }
    }
}

/// One staged artifact and what is known about it.
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineItem {
    pub id: String,
    /// Staged tree location; for rejected items the (deleted) pending path.
    pub path: PathBuf,
    pub state: QuarantineState,
    /// Echo of the acquisition input, recovered from the report when the
    /// item was staged by an earlier invocation.
    pub target: String,
    pub target_type: Option<TargetType>,
    pub created_at: Option<DateTime<Utc>>,
    pub verdict: Option<Verdict>,
    pub score: Option<f64>,
}

/// Owns the staging lifecycle. Everything else sees read-only views.
pub struct QuarantineManager<'a> {
    root: &'a SigilRoot,
    store: &'a SignatureStore,
    options: ScanOptions,
    cancel: CancelFlag,
}

impl<'a> QuarantineManager<'a> {
    pub fn new(
        root: &'a SigilRoot,
        store: &'a SignatureStore,
        options: ScanOptions,
    ) -> QuarantineManager<'a> {
        QuarantineManager {
            root,
            store,
            options,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> QuarantineManager<'a> {
        self.cancel = cancel;
        self
    }

    // -----------------------------------------------------------------------
    // Staging
    // -----------------------------------------------------------------------

    /// Stage an on-disk directory or file by hard-linking (copying when
    /// linking is not possible) into the quarantine area.
    pub fn stage_local(&self, source: &Path) -> Result<QuarantineItem> {
        if !source.exists() {
            return Err(SigilError::AcquisitionFailed(format!(
                "path does not exist: {}",
                source.display()
            )));
        }
        let target = source.display().to_string();
        let target_type = if source.is_file() {
            TargetType::File
        } else {
            TargetType::Directory
        };
        self.stage(&target, target_type, |dest| {
            if source.is_file() {
                let name = source
                    .file_name()
                    .ok_or_else(|| SigilError::AcquisitionFailed("unnamed file".to_string()))?;
                link_or_copy(source, &dest.join(name))
            } else {
                mirror_tree(source, dest)
            }
        })
    }

    /// Stage a git repository through the injected fetcher.
    pub fn stage_git(
        &self,
        fetcher: &dyn GitFetcher,
        url: &str,
        branch: Option<&str>,
    ) -> Result<QuarantineItem> {
        self.stage(url, TargetType::Git, |dest| {
            fetcher.clone_into(url, branch, dest)
        })
    }

    /// Stage a registry package through the injected fetcher.
    pub fn stage_package(
        &self,
        fetcher: &dyn PackageFetcher,
        manager: PackageManager,
        name: &str,
        version: Option<&str>,
    ) -> Result<QuarantineItem> {
        let target = match version {
            Some(v) => format!("{}@{}", name, v),
            None => name.to_string(),
        };
        let target_type = match manager {
            PackageManager::Pip => TargetType::Pip,
            PackageManager::Npm => TargetType::Npm,
        };
        self.stage(&target, target_type, |dest| {
            fetcher.download(manager, name, version, dest)
        })
    }

    /// Stage an arbitrary URL payload; recognized archives are extracted.
    pub fn stage_url(&self, fetcher: &dyn UrlFetcher, url: &str) -> Result<QuarantineItem> {
        self.stage(url, TargetType::Url, |dest| {
            let download = fetcher.get(url, dest)?;
            let name = download.path.file_name().unwrap_or_default().to_string_lossy();
            if name.ends_with(".zip")
                || name.ends_with(".whl")
                || name.ends_with(".tar.gz")
                || name.ends_with(".tgz")
            {
                fetchers::extract_archives(dest)?;
            }
            Ok(())
        })
    }

    /// Common staging path: mint an id, create an empty directory, hand it
    /// to the acquirer. Failed acquisition never leaves a partial tree.
    fn stage(
        &self,
        target: &str,
        target_type: TargetType,
        populate: impl FnOnce(&Path) -> Result<()>,
    ) -> Result<QuarantineItem> {
        let id = self.mint_id(target);
        let dest = self.root.quarantine().join(&id);
        fs::create_dir_all(&dest).map_err(|e| SigilError::io_at(&dest, e))?;

        if let Err(e) = populate(&dest) {
            let _ = fs::remove_dir_all(&dest);
            return Err(e);
        }

        Ok(QuarantineItem {
            created_at: created_at_from_id(&id),
            id,
            path: dest,
            state: QuarantineState::Pending,
            target: target.to_string(),
            target_type: Some(target_type),
            verdict: None,
            score: None,
        })
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    /// Fingerprint, consult the cache, scan on a miss, and persist both
    /// report files. Interruption discards everything.
    pub fn scan(&self, item: &QuarantineItem) -> Result<ScanResult> {
        let _lock = AdvisoryLock::acquire(&self.root.quarantine(), &item.id)?;

        let digest = tree_digest(&item.path)?;
        let cache = ScanCache::new(self.root.cache());

        let result = match (!self.options.no_cache)
            .then(|| cache.load(&digest, self.store.version()))
            .flatten()
        {
            Some(hit) => hit,
            None => {
                let engine = ScanEngine::with_cancel(
                    self.store,
                    self.options.clone(),
                    self.cancel.clone(),
                );
                let target_type = item.target_type.unwrap_or(TargetType::Directory);
                let fresh = engine.scan_tree(&item.path, &item.target, target_type, &digest)?;
                if !self.options.no_cache {
                    cache.store(&digest, self.store.version(), &fresh)?;
                }
                fresh
            }
        };

        self.write_reports(&item.id, &result)?;
        Ok(result)
    }

    fn write_reports(&self, id: &str, result: &ScanResult) -> Result<()> {
        let reports = self.root.reports();
        let text_path = reports.join(format!("{}_report.txt", id));
        let json_path = reports.join(format!("{}.json", id));
        fs::write(&text_path, report::render_text(result, Some(id)))
            .map_err(|e| SigilError::io_at(&text_path, e))?;
        fs::write(&json_path, report::render_json(result)?)
            .map_err(|e| SigilError::io_at(&json_path, e))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle transitions
    // -----------------------------------------------------------------------

    /// Move a pending tree into the approved area.
    pub fn approve(&self, id: &str) -> Result<QuarantineItem> {
        validate_id(id)?;
        let src = self.root.quarantine().join(id);
        if !src.is_dir() {
            return Err(self.terminal_or_missing(id));
        }

        let _lock = AdvisoryLock::acquire(&self.root.quarantine(), id)?;
        let dest = self.root.approved().join(id);
        fs::rename(&src, &dest).map_err(|e| SigilError::io_at(&dest, e))?;

        let mut item = self.load_item(id, dest, QuarantineState::Approved);
        item.created_at = created_at_from_id(id);
        Ok(item)
    }

    /// Delete a pending tree; the report files remain as the audit trail.
    pub fn reject(&self, id: &str) -> Result<QuarantineItem> {
        validate_id(id)?;
        let src = self.root.quarantine().join(id);
        if !src.is_dir() {
            return Err(self.terminal_or_missing(id));
        }

        let _lock = AdvisoryLock::acquire(&self.root.quarantine(), id)?;
        fs::remove_dir_all(&src).map_err(|e| SigilError::io_at(&src, e))?;

        let mut item = self.load_item(id, src, QuarantineState::Rejected);
        item.created_at = created_at_from_id(id);
        Ok(item)
    }

    fn terminal_or_missing(&self, id: &str) -> SigilError {
        if self.root.approved().join(id).is_dir() {
            SigilError::AlreadyTerminal {
                id: id.to_string(),
                state: QuarantineState::Approved.to_string(),
            }
        } else if self.root.reports().join(format!("{}.json", id)).is_file() {
            SigilError::AlreadyTerminal {
                id: id.to_string(),
                state: QuarantineState::Rejected.to_string(),
            }
        } else {
            SigilError::ItemNotFound(id.to_string())
        }
    }

    // -----------------------------------------------------------------------
    // Enumeration
    // -----------------------------------------------------------------------

    /// Items across all three states, sorted by id (and therefore by
    /// staging time).
    pub fn list(&self) -> Result<Vec<QuarantineItem>> {
        let mut items = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for (area, state) in [
            (self.root.quarantine(), QuarantineState::Pending),
            (self.root.approved(), QuarantineState::Approved),
        ] {
            if !area.exists() {
                continue;
            }
            for entry in fs::read_dir(&area).map_err(|e| SigilError::io_at(&area, e))? {
                let entry = entry.map_err(|e| SigilError::io_at(&area, e))?;
                if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let id = entry.file_name().to_string_lossy().to_string();
                if validate_id(&id).is_err() {
                    continue;
                }
                seen.insert(id.clone());
                let mut item = self.load_item(&id, entry.path(), state);
                item.created_at = created_at_from_id(&id);
                items.push(item);
            }
        }

        // Rejected items survive only as reports.
        let reports = self.root.reports();
        if reports.exists() {
            for entry in fs::read_dir(&reports).map_err(|e| SigilError::io_at(&reports, e))? {
                let entry = entry.map_err(|e| SigilError::io_at(&reports, e))?;
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(id) = name.strip_suffix(".json") else {
                    continue;
                };
                if seen.contains(id) || validate_id(id).is_err() {
                    continue;
                }
                let mut item = self.load_item(
                    id,
                    self.root.quarantine().join(id),
                    QuarantineState::Rejected,
                );
                item.created_at = created_at_from_id(id);
                items.push(item);
            }
        }

        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    /// Build an item, enriching it from its report file when one exists.
    fn load_item(&self, id: &str, path: PathBuf, state: QuarantineState) -> QuarantineItem {
        let mut item = QuarantineItem {
            id: id.to_string(),
            path,
            state,
            target: "-".to_string(),
            target_type: None,
            created_at: None,
            verdict: None,
            score: None,
        };
        let report_path = self.root.reports().join(format!("{}.json", id));
        if let Ok(data) = fs::read_to_string(report_path) {
            if let Ok(result) = serde_json::from_str::<ScanResult>(&data) {
                item.target = result.target;
                item.target_type = Some(result.target_type);
                item.verdict = Some(result.verdict);
                item.score = Some(result.score);
            }
        }
        item
    }

    /// Mint a quarantine id: timestamp prefix plus a slug derived from the
    /// input, suffixed on collision.
    fn mint_id(&self, input: &str) -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let base = format!("{}_{}", stamp, slugify(input));

        let mut id = base.clone();
        let mut n = 2;
        while self.root.quarantine().join(&id).exists()
            || self.root.approved().join(&id).exists()
            || self.root.reports().join(format!("{}.json", &id)).exists()
        {
            id = format!("{}-{}", base, n);
            n += 1;
        }
        id
    }
}

// ---------------------------------------------------------------------------
// Id handling
// ---------------------------------------------------------------------------

/// Validate a quarantine id: fixed shape, closed character set, and a
/// single path component, so an id can never address anything outside the
/// quarantine area.
pub fn validate_id(id: &str) -> Result<()> {
    let re = Regex::new(r"^[0-9]{8}_[0-9]{6}_[a-z0-9][a-z0-9._-]{0,62}$").expect("id pattern");
    let single_component = {
        let mut components = Path::new(id).components();
        matches!(
            (components.next(), components.next()),
            (Some(std::path::Component::Normal(_)), None)
        )
    };
    if re.is_match(id) && single_component && !id.contains("..") {
        Ok(())
    } else {
        Err(SigilError::InvalidQuarantineId(id.to_string()))
    }
}

/// Filesystem-safe slug of an acquisition input: last path-ish segment,
/// lowercased, non-alphanumerics collapsed to dashes.
fn slugify(input: &str) -> String {
    let tail = input
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(input);
    let tail = tail.trim_end_matches(".git");

    let mut slug = String::new();
    let mut last_sep = true;
    for c in tail.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_sep = false;
        } else if matches!(c, '.' | '_' | '-') && !last_sep {
            slug.push(c);
            last_sep = true;
        } else if matches!(c, '@' | '=' | ':' | '+' | ' ') && !last_sep {
            slug.push('-');
            last_sep = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_matches(|c| matches!(c, '-' | '.' | '_')).to_string();
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

fn created_at_from_id(id: &str) -> Option<DateTime<Utc>> {
    let stamp = id.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Advisory lock
// ---------------------------------------------------------------------------

/// Lock file preventing two invocations from scanning or transitioning the
/// same item concurrently. Released on drop.
struct AdvisoryLock {
    path: PathBuf,
}

impl AdvisoryLock {
    fn acquire(quarantine_dir: &Path, id: &str) -> Result<AdvisoryLock> {
        let path = quarantine_dir.join(format!(".{}.lock", id));
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                use std::io::Write;
                let _ = writeln!(file, "{}", std::process::id());
                Ok(AdvisoryLock { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(SigilError::Locked(id.to_string()))
            }
            Err(e) => Err(SigilError::io_at(&path, e)),
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// Tree mirroring
// ---------------------------------------------------------------------------

/// Recreate `source` under `dest` by hard links where possible. Symlinks
/// are recreated as links (never resolved); everything else is linked or
/// copied byte-for-byte.
fn mirror_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(source).follow_links(false) {
        let entry = entry.map_err(|e| {
            SigilError::AcquisitionFailed(format!("cannot read {}: {}", source.display(), e))
        })?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| SigilError::io_at(&target, e))?;
        } else if entry.file_type().is_symlink() {
            recreate_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| SigilError::io_at(parent, e))?;
            }
            link_or_copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn link_or_copy(source: &Path, target: &Path) -> Result<()> {
    if fs::hard_link(source, target).is_ok() {
        return Ok(());
    }
    fs::copy(source, target)
        .map(|_| ())
        .map_err(|e| SigilError::io_at(target, e))
}

#[cfg(unix)]
fn recreate_symlink(source: &Path, target: &Path) -> Result<()> {
    let link = fs::read_link(source).map_err(|e| SigilError::io_at(source, e))?;
    std::os::unix::fs::symlink(link, target).map_err(|e| SigilError::io_at(target, e))
}

#[cfg(not(unix))]
fn recreate_symlink(_source: &Path, _target: &Path) -> Result<()> {
    // Links are skipped on platforms where recreating them needs privileges.
    Ok(())
}
