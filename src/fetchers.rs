//! Acquisition collaborators.
//!
//! The quarantine manager never talks to the network or to package tooling
//! itself; it consumes these contracts and verifies that everything lands
//! inside a freshly created staging directory. The default implementations
//! shell out to `git` / `pip` / `npm` with their script execution disabled
//! and fetch URLs over blocking HTTP.

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{Result, SigilError};
use crate::signatures::SignatureSet;

/// Hard ceiling for a single URL payload.
pub const MAX_DOWNLOAD_BYTES: u64 = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pip,
    Npm,
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::Pip => write!(f, "pip"),
            PackageManager::Npm => write!(f, "npm"),
        }
    }
}

/// Clones a repository into `dest` without running any repository-provided
/// hook or script.
pub trait GitFetcher {
    fn clone_into(&self, url: &str, branch: Option<&str>, dest: &Path) -> Result<()>;
}

/// Downloads a package and extracts it into `dest` without executing
/// install-time hooks.
pub trait PackageFetcher {
    fn download(
        &self,
        manager: PackageManager,
        name: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<()>;
}

/// A fetched URL payload.
#[derive(Debug, Clone)]
pub struct Download {
    pub path: PathBuf,
    pub content_type: Option<String>,
}

/// Writes a raw URL payload into `dest`, honoring the size cap.
pub trait UrlFetcher {
    fn get(&self, url: &str, dest: &Path) -> Result<Download>;
}

/// Optional upstream signature pull; `None` means offline.
pub trait SignatureSync {
    fn fetch(&self) -> Result<Option<SignatureSet>>;
}

// ---------------------------------------------------------------------------
// Default implementations
// ---------------------------------------------------------------------------

/// `git clone --depth 1` via the system binary, with `core.hooksPath`
/// pointed at nothing so repository hooks can never run.
pub struct SystemGit;

impl GitFetcher for SystemGit {
    fn clone_into(&self, url: &str, branch: Option<&str>, dest: &Path) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("clone")
            .arg("--depth")
            .arg("1")
            .arg("-c")
            .arg("core.hooksPath=");
        if let Some(b) = branch {
            cmd.arg("--branch").arg(b);
        }
        cmd.arg(url).arg(dest);

        let output = cmd
            .output()
            .map_err(|e| SigilError::AcquisitionFailed(format!("cannot run git: {}", e)))?;
        if !output.status.success() {
            return Err(SigilError::AcquisitionFailed(format!(
                "git clone failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Registry downloads via the system `pip` / `npm` binaries, with install
/// scripts disabled; fetched archives are extracted in place.
pub struct RegistryCli;

impl PackageFetcher for RegistryCli {
    fn download(
        &self,
        manager: PackageManager,
        name: &str,
        version: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let output = match manager {
            PackageManager::Pip => {
                let spec = match version {
                    Some(v) => format!("{}=={}", name, v),
                    None => name.to_string(),
                };
                Command::new("pip")
                    .arg("download")
                    .arg("--no-deps")
                    .arg("--dest")
                    .arg(dest)
                    .arg(&spec)
                    .output()
            }
            PackageManager::Npm => {
                let spec = match version {
                    Some(v) => format!("{}@{}", name, v),
                    None => name.to_string(),
                };
                Command::new("npm")
                    .arg("pack")
                    .arg(&spec)
                    .arg("--ignore-scripts")
                    .current_dir(dest)
                    .output()
            }
        };

        let output = output.map_err(|e| {
            SigilError::AcquisitionFailed(format!("cannot run {}: {}", manager, e))
        })?;
        if !output.status.success() {
            return Err(SigilError::AcquisitionFailed(format!(
                "{} download failed: {}",
                manager,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        extract_archives(dest)
    }
}

/// Blocking HTTP fetcher with a request timeout and the payload size cap.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<HttpFetcher> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(|e| SigilError::AcquisitionFailed(format!("http client: {}", e)))?;
        Ok(HttpFetcher { client })
    }
}

impl UrlFetcher for HttpFetcher {
    fn get(&self, url: &str, dest: &Path) -> Result<Download> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| SigilError::AcquisitionFailed(format!("{}: {}", url, e)))?;
        if !response.status().is_success() {
            return Err(SigilError::AcquisitionFailed(format!(
                "{}: HTTP {}",
                url,
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let filename = url
            .split('?')
            .next()
            .unwrap_or(url)
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty() && !s.contains(':'))
            .unwrap_or("payload.bin")
            .to_string();
        let path = dest.join(filename);

        let mut file = fs::File::create(&path).map_err(|e| SigilError::io_at(&path, e))?;
        let mut limited = response.take(MAX_DOWNLOAD_BYTES + 1);
        let written = std::io::copy(&mut limited, &mut file)
            .map_err(|e| SigilError::AcquisitionFailed(format!("{}: {}", url, e)))?;
        if written > MAX_DOWNLOAD_BYTES {
            let _ = fs::remove_file(&path);
            return Err(SigilError::AcquisitionFailed(format!(
                "{}: payload exceeds {} byte cap",
                url, MAX_DOWNLOAD_BYTES
            )));
        }

        Ok(Download { path, content_type })
    }
}

/// Reads the locally synced set from `signatures/current.json`; absence
/// means offline. A malformed set aborts (signature errors are fatal).
pub struct LocalSignatureFile {
    path: PathBuf,
}

impl LocalSignatureFile {
    pub fn new(path: PathBuf) -> LocalSignatureFile {
        LocalSignatureFile { path }
    }
}

impl SignatureSync for LocalSignatureFile {
    fn fetch(&self) -> Result<Option<SignatureSet>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(d) => d,
            Err(_) => return Ok(None),
        };
        let set = SignatureSet::from_json(&data).map_err(|reason| SigilError::Json {
            path: self.path.clone(),
            reason,
        })?;
        Ok(Some(set))
    }
}

// ---------------------------------------------------------------------------
// Archive extraction
// ---------------------------------------------------------------------------

/// Extract `.whl`/`.zip` and `.tar.gz`/`.tgz` archives found directly in
/// `dir` so the scanner sees actual source files; archives are removed
/// after extraction. Both archive crates refuse entries that would escape
/// the extraction directory.
pub fn extract_archives(dir: &Path) -> Result<()> {
    let entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| SigilError::io_at(dir, e))?
        .filter_map(|e| e.ok())
        .collect();

    for entry in entries {
        let path = entry.path();
        let name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        if name.ends_with(".whl") || name.ends_with(".zip") {
            let file = fs::File::open(&path).map_err(|e| SigilError::io_at(&path, e))?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| SigilError::AcquisitionFailed(format!("{}: {}", name, e)))?;
            let extract_dir = dir.join(name.trim_end_matches(".whl").trim_end_matches(".zip"));
            fs::create_dir_all(&extract_dir).map_err(|e| SigilError::io_at(&extract_dir, e))?;
            archive
                .extract(&extract_dir)
                .map_err(|e| SigilError::AcquisitionFailed(format!("{}: {}", name, e)))?;
            fs::remove_file(&path).map_err(|e| SigilError::io_at(&path, e))?;
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            let file = fs::File::open(&path).map_err(|e| SigilError::io_at(&path, e))?;
            let gz = flate2::read::GzDecoder::new(file);
            let mut archive = tar::Archive::new(gz);
            let extract_dir = dir.join(name.trim_end_matches(".tar.gz").trim_end_matches(".tgz"));
            fs::create_dir_all(&extract_dir).map_err(|e| SigilError::io_at(&extract_dir, e))?;
            archive
                .unpack(&extract_dir)
                .map_err(|e| SigilError::AcquisitionFailed(format!("{}: {}", name, e)))?;
            fs::remove_file(&path).map_err(|e| SigilError::io_at(&path, e))?;
        }
    }

    Ok(())
}
