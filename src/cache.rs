//! Scan result caching keyed on content digest and signature-set version.
//!
//! Entries live at `cache/<digest>.json` and embed the signatures version
//! they were produced with. A version mismatch is a miss, so a signature
//! update lazily invalidates the whole cache; stale entries are only
//! rewritten when their digest is scanned again. A cache file that fails to
//! deserialize is treated as a miss and evicted, never surfaced.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SigilError};
use crate::scanner::ScanResult;

const CACHE_FORMAT_VERSION: u32 = 2;

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    format: u32,
    content_digest: String,
    signatures_version: String,
    result: ScanResult,
}

/// Handle to the cache directory.
pub struct ScanCache {
    dir: PathBuf,
}

impl ScanCache {
    pub fn new(dir: PathBuf) -> ScanCache {
        ScanCache { dir }
    }

    fn entry_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}.json", digest))
    }

    /// Look up a result for this digest produced with this signature set.
    pub fn load(&self, digest: &str, signatures_version: &str) -> Option<ScanResult> {
        let path = self.entry_path(digest);
        let data = fs::read_to_string(&path).ok()?;

        let entry: CacheEntry = match serde_json::from_str(&data) {
            Ok(e) => e,
            Err(_) => {
                // Corrupt entries are evicted on sight.
                let _ = fs::remove_file(&path);
                return None;
            }
        };

        if entry.format == CACHE_FORMAT_VERSION
            && entry.content_digest == digest
            && entry.signatures_version == signatures_version
        {
            Some(entry.result)
        } else {
            None
        }
    }

    /// Persist a result. Written to a temp file first so readers never
    /// observe a partial entry.
    pub fn store(&self, digest: &str, signatures_version: &str, result: &ScanResult) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| SigilError::io_at(&self.dir, e))?;

        let entry = CacheEntry {
            format: CACHE_FORMAT_VERSION,
            content_digest: digest.to_string(),
            signatures_version: signatures_version.to_string(),
            result: result.clone(),
        };
        let json = serde_json::to_string(&entry)
            .map_err(|e| SigilError::Config(format!("cannot serialize cache entry: {}", e)))?;

        let path = self.entry_path(digest);
        let tmp = self.dir.join(format!(".{}.tmp", digest));
        fs::write(&tmp, json).map_err(|e| SigilError::io_at(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| SigilError::io_at(&path, e))?;
        Ok(())
    }

    /// Remove every cached result, returning how many were deleted.
    pub fn clear(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut count = 0;
        for entry in fs::read_dir(&self.dir).map_err(|e| SigilError::io_at(&self.dir, e))? {
            let entry = entry.map_err(|e| SigilError::io_at(&self.dir, e))?;
            if entry.path().extension().is_some_and(|e| e == "json") {
                fs::remove_file(entry.path()).map_err(|e| SigilError::io_at(entry.path(), e))?;
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{TargetType, Verdict};
    use std::collections::BTreeMap;

    fn dummy_result(digest: &str, sig_version: &str) -> ScanResult {
        ScanResult {
            scan_id: "scan-1".to_string(),
            target: "fixture".to_string(),
            target_type: TargetType::Directory,
            content_digest: digest.to_string(),
            files_scanned: 3,
            verdict: Verdict::Clean,
            score: 0.0,
            duration_ms: 5,
            created_at: chrono::Utc::now(),
            signatures_version: sig_version.to_string(),
            truncated: false,
            phases: BTreeMap::new(),
            findings: Vec::new(),
        }
    }

    #[test]
    fn hit_returns_equal_result() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ScanCache::new(tmp.path().to_path_buf());
        let result = dummy_result("d1", "v1");

        cache.store("d1", "v1", &result).unwrap();
        let cached = cache.load("d1", "v1").expect("cache hit");
        assert_eq!(cached.canonical(), result.canonical());
        assert_eq!(cached.scan_id, result.scan_id);
    }

    #[test]
    fn signature_version_change_never_hits() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ScanCache::new(tmp.path().to_path_buf());
        cache.store("d1", "v1", &dummy_result("d1", "v1")).unwrap();
        assert!(cache.load("d1", "v2").is_none());
    }

    #[test]
    fn unknown_digest_misses() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ScanCache::new(tmp.path().to_path_buf());
        assert!(cache.load("nope", "v1").is_none());
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_evicted() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ScanCache::new(tmp.path().to_path_buf());
        let path = tmp.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(cache.load("bad", "v1").is_none());
        assert!(!path.exists(), "corrupt entry should be evicted");
    }

    #[test]
    fn clear_reports_count() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = ScanCache::new(tmp.path().to_path_buf());
        cache.store("d1", "v1", &dummy_result("d1", "v1")).unwrap();
        cache.store("d2", "v1", &dummy_result("d2", "v1")).unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.load("d1", "v1").is_none());
    }
}
