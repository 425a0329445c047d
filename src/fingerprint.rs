//! Deterministic content digest of a directory tree.
//!
//! The digest feeds the result cache and report attestation, so it must be
//! insensitive to timestamps, inode numbers, and filesystem enumeration
//! order. Files are hashed in sorted relative-path order as
//! `len(relpath) || relpath || len(content) || content`; symlinks are
//! recorded by their target string and never followed; empty directories
//! do not participate.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::errors::{Result, SigilError};

/// Compute the SHA-256 tree digest of `root` (a directory or single file).
pub fn tree_digest(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();

    if root.is_file() {
        let name = root
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_default();
        hash_entry(&mut hasher, &name, root)?;
        return Ok(hex::encode(hasher.finalize()));
    }

    let mut entries: Vec<(String, std::path::PathBuf)> = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "walk error"));
            SigilError::io_at(path, io)
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let rel = normalized_rel_path(root, entry.path());
        entries.push((rel, entry.into_path()));
    }

    // Byte-order sort over normalized paths makes the digest independent of
    // readdir ordering across filesystems.
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (rel, abs) in &entries {
        hash_entry(&mut hasher, rel, abs)?;
    }

    Ok(hex::encode(hasher.finalize()))
}

fn hash_entry(hasher: &mut Sha256, rel: &str, abs: &Path) -> Result<()> {
    hasher.update((rel.len() as u64).to_le_bytes());
    hasher.update(rel.as_bytes());

    let meta = abs
        .symlink_metadata()
        .map_err(|e| SigilError::io_at(abs, e))?;

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(abs)
            .map_err(|e| SigilError::io_at(abs, e))?
            .to_string_lossy()
            .into_owned();
        hasher.update((target.len() as u64).to_le_bytes());
        hasher.update(target.as_bytes());
        return Ok(());
    }

    hasher.update(meta.len().to_le_bytes());

    let file = File::open(abs).map_err(|e| SigilError::io_at(abs, e))?;
    let mut reader = BufReader::new(file);
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).map_err(|e| SigilError::io_at(abs, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

/// Relative path under `root` with forward-slash separators (case kept).
pub fn normalized_rel_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn identical_trees_have_equal_digests() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for root in [a.path(), b.path()] {
            write(root, "src/lib.py", "import os\n");
            write(root, "README.md", "docs\n");
        }
        assert_eq!(
            tree_digest(a.path()).unwrap(),
            tree_digest(b.path()).unwrap()
        );
    }

    #[test]
    fn digest_ignores_timestamps() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", "contents");
        let before = tree_digest(tmp.path()).unwrap();

        // Rewrite the same bytes; mtime moves, digest must not.
        std::thread::sleep(std::time::Duration::from_millis(20));
        write(tmp.path(), "a.txt", "contents");
        assert_eq!(before, tree_digest(tmp.path()).unwrap());
    }

    #[test]
    fn digest_changes_with_content() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", "one");
        let before = tree_digest(tmp.path()).unwrap();
        write(tmp.path(), "a.txt", "two");
        assert_ne!(before, tree_digest(tmp.path()).unwrap());
    }

    #[test]
    fn digest_changes_with_path_rename() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", "same");
        let before = tree_digest(tmp.path()).unwrap();
        fs::rename(tmp.path().join("a.txt"), tmp.path().join("b.txt")).unwrap();
        assert_ne!(before, tree_digest(tmp.path()).unwrap());
    }

    #[test]
    fn empty_directories_do_not_participate() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", "x");
        let before = tree_digest(tmp.path()).unwrap();
        fs::create_dir_all(tmp.path().join("empty/nested")).unwrap();
        assert_eq!(before, tree_digest(tmp.path()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recorded_by_target_not_followed() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "a.txt", "x");
        std::os::unix::fs::symlink("a.txt", tmp.path().join("link")).unwrap();
        let before = tree_digest(tmp.path()).unwrap();

        // Retargeting the link changes the digest even though no file
        // content changed.
        fs::remove_file(tmp.path().join("link")).unwrap();
        std::os::unix::fs::symlink("b.txt", tmp.path().join("link")).unwrap();
        assert_ne!(before, tree_digest(tmp.path()).unwrap());
    }

    #[test]
    fn single_file_digest_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "only.py", "print('x')\n");
        let file = tmp.path().join("only.py");
        assert_eq!(
            tree_digest(&file).unwrap(),
            tree_digest(&file).unwrap()
        );
    }
}
