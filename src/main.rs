use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use colored::Colorize;

use sigil::config::{ConfigFile, ScanOptions, SigilRoot, CONFIG_KEYS};
use sigil::errors::{Result, SigilError};
use sigil::fetchers::{
    HttpFetcher, LocalSignatureFile, PackageManager, RegistryCli, SignatureSync, SystemGit,
};
use sigil::quarantine::{QuarantineItem, QuarantineManager, QuarantineState};
use sigil::report::{self, OutputFormat};
use sigil::scanner::{CancelFlag, ScanResult, Verdict};
use sigil::signatures::SignatureStore;
use sigil::{cache::ScanCache, diff};

/// Sigil -- Automated security auditing for untrusted code.
///
/// Scans source trees, downloaded packages, and cloned repositories for
/// malicious patterns using a quarantine-first workflow.
#[derive(Parser)]
#[command(name = "sigil", version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text, json, sarif)
    #[arg(short, long, global = true)]
    format: Option<String>,

    /// Minimum verdict that produces a nonzero exit (low, medium, high, critical)
    #[arg(short, long, global = true)]
    threshold: Option<String>,

    /// Exit nonzero on any finding (shorthand for --threshold low)
    #[arg(long, global = true)]
    fail_on_findings: bool,

    /// Base directory override (default: $SIGIL_HOME or ~/.sigil)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage an existing directory or file into quarantine and scan it
    Scan {
        /// Path to scan
        path: PathBuf,

        /// Disable the cache (force a fresh scan even if content is unchanged)
        #[arg(long)]
        no_cache: bool,
    },

    /// Clone a git repository into quarantine and scan it
    Clone {
        /// Git repository URL to clone
        url: String,

        /// Branch to clone
        #[arg(short, long)]
        branch: Option<String>,

        /// Automatically approve if the scan verdict is clean or low risk
        #[arg(long)]
        auto_approve: bool,
    },

    /// Download and scan a pip package
    Pip {
        /// Package name (optionally with version, e.g. package==1.0.0)
        package: String,

        /// Specific version to download
        #[arg(short = 'V', long)]
        version: Option<String>,

        /// Automatically approve if the scan verdict is clean or low risk
        #[arg(long)]
        auto_approve: bool,
    },

    /// Download and scan an npm package
    Npm {
        /// Package name (optionally with version, e.g. package@1.0.0)
        package: String,

        /// Specific version to download
        #[arg(short = 'V', long)]
        version: Option<String>,

        /// Automatically approve if the scan verdict is clean or low risk
        #[arg(long)]
        auto_approve: bool,
    },

    /// Download an arbitrary URL payload into quarantine and scan it
    Fetch {
        /// URL to download (recognized archives are extracted)
        url: String,

        /// Automatically approve if the scan verdict is clean or low risk
        #[arg(long)]
        auto_approve: bool,
    },

    /// List quarantined items
    List {
        /// Filter by status (pending, approved, rejected)
        #[arg(short, long)]
        status: Option<String>,

        /// Show detailed information
        #[arg(short, long)]
        detailed: bool,
    },

    /// Approve a quarantined item (moves it to the approved area)
    Approve {
        /// Quarantine ID to approve
        id: String,
    },

    /// Reject a quarantined item (deletes it; the report is retained)
    Reject {
        /// Quarantine ID to reject
        id: String,
    },

    /// Compare two scan result JSON files
    Diff {
        /// Path to the baseline scan result
        baseline: PathBuf,

        /// Path to the current scan result
        current: PathBuf,
    },

    /// Clear all cached scan results
    ClearCache,

    /// View or modify configuration
    Config {
        /// Configuration key to get or set
        key: Option<String>,

        /// Value to set (if omitted, prints the current value)
        value: Option<String>,

        /// List all configuration values
        #[arg(short, long)]
        list: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match try_run(cli) {
        Ok(code) => code,
        Err(SigilError::Interrupted) => {
            eprintln!(
                "{} scan interrupted, partial result discarded",
                "sigil:".bold().cyan()
            );
            130
        }
        Err(err) => {
            eprintln!("{} {}", "error:".bold().red(), err);
            1
        }
    };

    process::exit(exit_code);
}

fn try_run(cli: Cli) -> Result<i32> {
    let root = SigilRoot::resolve(cli.root.as_deref())?;
    let config = ConfigFile::load(&root);

    let format: OutputFormat = cli
        .format
        .as_deref()
        .or(config.get("format"))
        .unwrap_or("text")
        .parse()?;

    let threshold = if cli.fail_on_findings {
        Verdict::LowRisk
    } else {
        parse_threshold(
            cli.threshold
                .as_deref()
                .or(config.get("threshold"))
                .unwrap_or("medium"),
        )?
    };

    if cli.verbose {
        eprintln!("{} verbose mode enabled", "sigil:".bold().cyan());
        eprintln!("root: {}", root.path().display());
    }

    match cli.command {
        Commands::Scan { path, no_cache } => {
            let store = load_signatures(&root, cli.verbose)?;
            let options = ScanOptions {
                no_cache,
                ..ScanOptions::default()
            };
            let manager = scan_manager(&root, &store, options);

            eprintln!(
                "{} scanning {}...",
                "sigil:".bold().cyan(),
                path.display().to_string().bold()
            );
            let item = manager.stage_local(&path)?;
            if cli.verbose {
                eprintln!("quarantine id: {}", item.id);
                eprintln!("quarantine path: {}", item.path.display());
            }

            let result = manager.scan(&item)?;
            emit_result(&result, format)?;
            print_item_id(&item.id, format);
            Ok(exit_code(result.verdict, threshold))
        }

        Commands::Clone {
            url,
            branch,
            auto_approve,
        } => {
            let store = load_signatures(&root, cli.verbose)?;
            let manager = scan_manager(&root, &store, ScanOptions::default());

            eprintln!(
                "{} cloning {} into quarantine...",
                "sigil:".bold().cyan(),
                url.bold()
            );
            let item = manager.stage_git(&SystemGit, &url, branch.as_deref())?;
            finish_acquisition(&manager, &item, format, threshold, auto_approve, cli.verbose)
        }

        Commands::Pip {
            package,
            version,
            auto_approve,
        } => {
            let (name, inline_version) = split_spec(&package, "==");
            let version = version.or(inline_version);
            let store = load_signatures(&root, cli.verbose)?;
            let manager = scan_manager(&root, &store, ScanOptions::default());

            eprintln!(
                "{} downloading pip package {} into quarantine...",
                "sigil:".bold().cyan(),
                package.bold()
            );
            let item = manager.stage_package(
                &RegistryCli,
                PackageManager::Pip,
                &name,
                version.as_deref(),
            )?;
            finish_acquisition(&manager, &item, format, threshold, auto_approve, cli.verbose)
        }

        Commands::Npm {
            package,
            version,
            auto_approve,
        } => {
            let (name, inline_version) = split_spec(&package, "@");
            let version = version.or(inline_version);
            let store = load_signatures(&root, cli.verbose)?;
            let manager = scan_manager(&root, &store, ScanOptions::default());

            eprintln!(
                "{} downloading npm package {} into quarantine...",
                "sigil:".bold().cyan(),
                package.bold()
            );
            let item = manager.stage_package(
                &RegistryCli,
                PackageManager::Npm,
                &name,
                version.as_deref(),
            )?;
            finish_acquisition(&manager, &item, format, threshold, auto_approve, cli.verbose)
        }

        Commands::Fetch { url, auto_approve } => {
            let store = load_signatures(&root, cli.verbose)?;
            let manager = scan_manager(&root, &store, ScanOptions::default());

            eprintln!(
                "{} fetching {} into quarantine...",
                "sigil:".bold().cyan(),
                url.bold()
            );
            let fetcher = HttpFetcher::new()?;
            let item = manager.stage_url(&fetcher, &url)?;
            finish_acquisition(&manager, &item, format, threshold, auto_approve, cli.verbose)
        }

        Commands::List { status, detailed } => {
            let store = SignatureStore::load_builtin()?;
            let manager = QuarantineManager::new(&root, &store, ScanOptions::default());
            let mut items = manager.list()?;

            if let Some(filter) = status.as_deref() {
                let wanted = parse_state(filter)?;
                items.retain(|i| i.state == wanted);
            }

            if items.is_empty() {
                println!("{} no quarantined items found", "sigil:".bold().cyan());
                return Ok(0);
            }
            match format {
                OutputFormat::Text => report::print_quarantine_list(&items, detailed),
                _ => println!("{}", list_json(&items)?),
            }
            Ok(0)
        }

        Commands::Approve { id } => {
            let store = SignatureStore::load_builtin()?;
            let manager = QuarantineManager::new(&root, &store, ScanOptions::default());
            let item = manager.approve(&id)?;
            println!(
                "{} approved {} ({})",
                "sigil:".bold().green(),
                item.id,
                item.target
            );
            Ok(0)
        }

        Commands::Reject { id } => {
            let store = SignatureStore::load_builtin()?;
            let manager = QuarantineManager::new(&root, &store, ScanOptions::default());
            let item = manager.reject(&id)?;
            println!(
                "{} rejected {} ({})",
                "sigil:".bold().red(),
                item.id,
                item.target
            );
            Ok(0)
        }

        Commands::Diff { baseline, current } => cmd_diff(&baseline, &current, format),

        Commands::ClearCache => {
            let cache = ScanCache::new(root.cache());
            let count = cache.clear()?;
            println!(
                "{} cleared {} cached scan result(s)",
                "sigil:".bold().green(),
                count
            );
            Ok(0)
        }

        Commands::Config { key, value, list } => {
            cmd_config(&root, key.as_deref(), value.as_deref(), list)
        }
    }
}

// ---------------------------------------------------------------------------
// Command helpers
// ---------------------------------------------------------------------------

/// Builtin catalog overlaid with the locally synced set, if one exists.
fn load_signatures(root: &SigilRoot, verbose: bool) -> Result<SignatureStore> {
    let mut store = SignatureStore::load_builtin()?;
    let sync = LocalSignatureFile::new(root.current_signatures_file());
    if let Some(set) = sync.fetch()? {
        let count = set.signatures.len();
        store.merge(set)?;
        if verbose {
            eprintln!("merged {} synced signature(s)", count);
        }
    }
    if verbose {
        eprintln!(
            "{} signatures loaded (version {})",
            store.len(),
            store.version()
        );
    }
    Ok(store)
}

/// Manager wired to a ctrl-c cancellation flag.
fn scan_manager<'a>(
    root: &'a SigilRoot,
    store: &'a SignatureStore,
    options: ScanOptions,
) -> QuarantineManager<'a> {
    let cancel = CancelFlag::new();
    let handler_flag = cancel.clone();
    // Registration can only succeed once per process; later calls are
    // harmless no-ops.
    let _ = ctrlc::set_handler(move || handler_flag.cancel());
    QuarantineManager::new(root, store, options).with_cancel(cancel)
}

/// Scan a freshly staged item, render the result, optionally auto-approve.
fn finish_acquisition(
    manager: &QuarantineManager,
    item: &QuarantineItem,
    format: OutputFormat,
    threshold: Verdict,
    auto_approve: bool,
    verbose: bool,
) -> Result<i32> {
    if verbose {
        eprintln!("quarantine id: {}", item.id);
        eprintln!("quarantine path: {}", item.path.display());
    }

    let result = manager.scan(item)?;
    emit_result(&result, format)?;
    print_item_id(&item.id, format);

    if auto_approve && result.verdict <= Verdict::LowRisk {
        manager.approve(&item.id)?;
        println!(
            "{} auto-approved ({})",
            "sigil:".bold().green(),
            result.verdict
        );
    }

    Ok(exit_code(result.verdict, threshold))
}

/// The id trailer stays on stdout for humans but moves to stderr when
/// stdout is a machine-readable document.
fn print_item_id(id: &str, format: OutputFormat) {
    if format == OutputFormat::Text {
        println!("{} quarantine id: {}", "sigil:".bold().cyan(), id);
    } else {
        eprintln!("{} quarantine id: {}", "sigil:".bold().cyan(), id);
    }
}

fn emit_result(result: &ScanResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            report::print_scan_summary(result);
            report::print_findings(result);
            report::print_verdict(result.verdict);
        }
        OutputFormat::Json => println!("{}", report::render_json(result)?),
        OutputFormat::Sarif => println!("{}", report::render_sarif(result)),
    }
    Ok(())
}

fn cmd_diff(baseline_path: &Path, current_path: &Path, format: OutputFormat) -> Result<i32> {
    let baseline = load_result(baseline_path)?;
    let current = load_result(current_path)?;
    let diff_result = diff::diff_scans(&baseline, &current);

    if format != OutputFormat::Text {
        println!(
            "{}",
            serde_json::to_string_pretty(&diff_result)
                .map_err(|e| SigilError::Config(format!("cannot serialize diff: {}", e)))?
        );
    } else {
        println!("\n  {} {}", "Scan Diff:".bold(), diff_result.summary);

        if !diff_result.new_findings.is_empty() {
            println!(
                "\n  {} ({}):",
                "NEW FINDINGS".bold().red(),
                diff_result.new_findings.len()
            );
            for f in &diff_result.new_findings {
                println!(
                    "    {} [{}] {} in {} (line {})",
                    "+".green(),
                    f.rule,
                    f.severity,
                    f.file,
                    f.line.unwrap_or(0)
                );
            }
        }

        if !diff_result.resolved_findings.is_empty() {
            println!(
                "\n  {} ({}):",
                "RESOLVED".bold().green(),
                diff_result.resolved_findings.len()
            );
            for f in &diff_result.resolved_findings {
                println!(
                    "    {} [{}] {} in {} (line {})",
                    "-".red(),
                    f.rule,
                    f.severity,
                    f.file,
                    f.line.unwrap_or(0)
                );
            }
        }

        if diff_result.new_findings.is_empty() && diff_result.resolved_findings.is_empty() {
            println!("  {}", "No changes detected.".dimmed());
        }
    }

    Ok(if diff_result.new_findings.is_empty() {
        0
    } else {
        2
    })
}

fn load_result(path: &Path) -> Result<ScanResult> {
    let data = std::fs::read_to_string(path).map_err(|e| SigilError::io_at(path, e))?;
    report::parse_json(&data).map_err(|reason| SigilError::Json {
        path: path.to_path_buf(),
        reason,
    })
}

fn cmd_config(root: &SigilRoot, key: Option<&str>, value: Option<&str>, list: bool) -> Result<i32> {
    let mut config = ConfigFile::load(root);

    if list {
        for k in CONFIG_KEYS {
            println!("{} = {}", k, config.get(k).unwrap_or("(unset)"));
        }
        return Ok(0);
    }

    let Some(key) = key else {
        eprintln!("{} specify a key or use --list", "sigil:".bold().yellow());
        return Ok(1);
    };

    match value {
        Some(value) => {
            config.set(key, value)?;
            config.save(root)?;
            println!("{} {} = {}", "sigil:".bold().green(), key, value);
            Ok(0)
        }
        None => match config.get(key) {
            Some(v) => {
                println!("{}", v);
                Ok(0)
            }
            None => {
                eprintln!("{} key '{}' is not set", "sigil:".bold().yellow(), key);
                Ok(1)
            }
        },
    }
}

// ---------------------------------------------------------------------------
// Small parsers
// ---------------------------------------------------------------------------

/// Map a verdict to its exit code; verdicts below the failing threshold
/// exit 0. Operational errors exit 1 elsewhere.
fn exit_code(verdict: Verdict, threshold: Verdict) -> i32 {
    if verdict < threshold {
        return 0;
    }
    match verdict {
        Verdict::Clean => 0,
        Verdict::LowRisk => 4,
        Verdict::MediumRisk => 3,
        Verdict::HighRisk => 2,
        Verdict::Critical => 1,
    }
}

fn parse_threshold(value: &str) -> Result<Verdict> {
    match value.to_lowercase().as_str() {
        "low" => Ok(Verdict::LowRisk),
        "medium" => Ok(Verdict::MediumRisk),
        "high" => Ok(Verdict::HighRisk),
        "critical" => Ok(Verdict::Critical),
        other => Err(SigilError::Config(format!(
            "unknown threshold '{}' (expected low, medium, high, or critical)",
            other
        ))),
    }
}

fn parse_state(value: &str) -> Result<QuarantineState> {
    match value.to_lowercase().as_str() {
        "pending" => Ok(QuarantineState::Pending),
        "approved" => Ok(QuarantineState::Approved),
        "rejected" => Ok(QuarantineState::Rejected),
        other => Err(SigilError::Config(format!(
            "unknown status '{}' (expected pending, approved, or rejected)",
            other
        ))),
    }
}

/// Split a `name<sep>version` spec; a leading separator (scoped npm
/// packages) is part of the name.
fn split_spec(spec: &str, sep: &str) -> (String, Option<String>) {
    match spec.get(1..).and_then(|rest| rest.find(sep)) {
        Some(idx) => {
            let at = idx + 1;
            (
                spec[..at].to_string(),
                Some(spec[at + sep.len()..].to_string()),
            )
        }
        None => (spec.to_string(), None),
    }
}

fn list_json(items: &[QuarantineItem]) -> Result<String> {
    serde_json::to_string_pretty(items)
        .map_err(|e| SigilError::Config(format!("cannot serialize list: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, version: Option<&str>) -> (String, Option<String>) {
        (name.to_string(), version.map(|v| v.to_string()))
    }

    #[test]
    fn split_spec_parses_pip_double_equals() {
        assert_eq!(
            split_spec("requests==2.31.0", "=="),
            spec("requests", Some("2.31.0"))
        );
    }

    #[test]
    fn split_spec_parses_unscoped_npm_at() {
        assert_eq!(
            split_spec("left-pad@1.3.0", "@"),
            spec("left-pad", Some("1.3.0"))
        );
    }

    #[test]
    fn split_spec_keeps_scoped_npm_names_intact() {
        assert_eq!(
            split_spec("@babel/core@7.0.0", "@"),
            spec("@babel/core", Some("7.0.0"))
        );
        assert_eq!(split_spec("@scope/pkg", "@"), spec("@scope/pkg", None));
    }

    #[test]
    fn split_spec_leaves_bare_names_unversioned() {
        assert_eq!(split_spec("requests", "=="), spec("requests", None));
        assert_eq!(split_spec("a", "@"), spec("a", None));
    }

    #[test]
    fn exit_codes_map_from_verdict_and_threshold() {
        assert_eq!(exit_code(Verdict::Clean, Verdict::MediumRisk), 0);
        assert_eq!(exit_code(Verdict::LowRisk, Verdict::MediumRisk), 0);
        assert_eq!(exit_code(Verdict::MediumRisk, Verdict::MediumRisk), 3);
        assert_eq!(exit_code(Verdict::HighRisk, Verdict::MediumRisk), 2);
        assert_eq!(exit_code(Verdict::Critical, Verdict::MediumRisk), 1);

        // Lowered threshold surfaces LowRisk as its own code.
        assert_eq!(exit_code(Verdict::LowRisk, Verdict::LowRisk), 4);
        // Raised threshold silences graver verdicts below it.
        assert_eq!(exit_code(Verdict::HighRisk, Verdict::Critical), 0);
    }
}
