//! MergeMend command-line tool.
//!
//! Provides subcommands for generating and validating configuration,
//! scanning files for conflict markers, merging a branch and resolving the
//! conflicts it leaves, and showing where the last run's resolutions landed.

mod highlight;
mod logging;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};

use mergemend_core::config::AppConfig;
use mergemend_core::conflict::{conflict_start_lines, ConflictLocator};
use mergemend_core::oracle::HttpOracle;
use mergemend_core::orchestrator::{CancelToken, Orchestrator, RunReport};
use mergemend_core::vcs::{GitDriver, VcsDriver};

use highlight::TerminalSink;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// MergeMend command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "mergemend",
    version,
    about = "Resolve git merge conflicts with a text-generation oracle"
)]
struct Cli {
    /// Path to the TOML configuration file.
    /// Defaults to the user config directory (`mergemend/config.toml`).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Repository to operate on (overrides `repository.path`).
    #[arg(short, long, global = true)]
    repo: Option<PathBuf>,

    /// Log filter (overrides `logging.level`; `RUST_LOG` overrides both).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the configuration file.
    Validate,

    /// List conflict blocks without resolving them.
    Scan {
        /// Files to scan. Defaults to every conflicted file in the repository.
        files: Vec<PathBuf>,
    },

    /// Merge a branch, then resolve the conflicts it leaves.
    Merge {
        /// Branch to merge into the current one.
        #[arg(short, long)]
        branch: String,

        /// Remote to fetch from (overrides `repository.remote`).
        #[arg(long)]
        remote: Option<String>,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Resolve conflicts in already-conflicted files.
    Resolve {
        /// Files to resolve. Defaults to every conflicted file in the repository.
        files: Vec<PathBuf>,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show a file with the regions written by the last run highlighted.
    Positions {
        /// File to show.
        file: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref(), &cli.command) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            return ExitCode::FAILURE;
        }
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let _log_guard = match logging::init_logging(&level, config.logging.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            return ExitCode::FAILURE;
        }
    };

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let repo = cli.repo.unwrap_or_else(|| config.repository.path.clone());
    match cli.command {
        Commands::Init { output } => cmd_init(output.or(cli.config)),
        Commands::Validate => cmd_validate(&config, cli.config.as_deref()),
        Commands::Scan { files } => cmd_scan(&config, &repo, files),
        Commands::Merge {
            branch,
            remote,
            yes,
            json,
        } => {
            let remote = remote.unwrap_or_else(|| config.repository.remote.clone());
            cmd_merge(&config, &repo, &remote, &branch, yes, json).await
        }
        Commands::Resolve { files, json } => cmd_resolve(&config, &repo, files, json).await,
        Commands::Positions { file } => cmd_positions(&repo, &file),
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mergemend")
        .join("config.toml")
}

/// Load configuration. An explicit `--config` must exist; the default path is
/// optional and falls back to built-in defaults. `init` never loads one.
fn load_config(explicit: Option<&Path>, command: &Commands) -> Result<AppConfig> {
    if matches!(command, Commands::Init { .. }) {
        return Ok(AppConfig::default());
    }

    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let path = default_config_path();
            if !path.exists() {
                let mut config = AppConfig::default();
                config.resolve_env_vars();
                return Ok(config);
            }
            path
        }
    };

    let mut config = AppConfig::load_from_file(&path).context("failed to load configuration file")?;
    config.resolve_env_vars();
    Ok(config)
}

fn open_driver(config: &AppConfig, repo: &Path) -> Result<Arc<GitDriver>> {
    let driver = GitDriver::open(repo, config.repository.token.clone())
        .context("failed to open repository")?;
    Ok(Arc::new(driver))
}

fn build_orchestrator(config: &AppConfig, driver: Arc<GitDriver>) -> Result<Orchestrator> {
    config.validate().context("invalid configuration")?;
    let oracle = HttpOracle::from_config(&config.oracle).context("failed to create oracle client")?;
    Ok(Orchestrator::new(driver, Arc::new(oracle), &config.resolver))
}

/// Resolve relative paths against the working tree.
fn absolutize(driver: &GitDriver, files: Vec<PathBuf>) -> Vec<PathBuf> {
    files
        .into_iter()
        .map(|f| {
            if f.is_absolute() {
                f
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(&f))
                    .unwrap_or_else(|_| driver.workdir().join(&f))
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

const DEFAULT_CONFIG: &str = r#"# MergeMend configuration

[repository]
path = "."
remote = "origin"
# Environment variable holding an HTTPS token for fetching.
# token_env = "MERGEMEND_GIT_TOKEN"

[oracle]
api_url = "https://generativelanguage.googleapis.com/v1beta"
model = "gemini-1.5-flash"
api_key_env = "MERGEMEND_API_KEY"
timeout_secs = 120

[resolver]
# "anchored" rewrites each conflict where it was found;
# "literal" replaces the first occurrence of the conflict text.
strategy = "anchored"
# "strict" rejects resolutions whose line count matches neither side.
line_count_policy = "lenient"
max_concurrent_files = 4

[logging]
level = "warn"
# log_dir = "/tmp/mergemend"
"#;

fn cmd_init(output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(default_config_path);

    if output.exists() {
        let overwrite = Confirm::new()
            .with_prompt(format!("{} already exists. Overwrite?", output.display()))
            .default(false)
            .interact()
            .context("failed to read confirmation")?;
        if !overwrite {
            println!("{}", style::warn("Init cancelled. Existing file was not modified."));
            return Ok(());
        }
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&output, DEFAULT_CONFIG).context("failed to write config file")?;

    println!("{}", style::success(&format!("Configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Set MERGEMEND_API_KEY to your oracle API key");
    println!("  2. Validate with: mergemend validate --config {}", output.display());
    println!("  3. Merge a branch: mergemend merge --branch <name>");
    Ok(())
}

fn cmd_validate(config: &AppConfig, path: Option<&Path>) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    println!("Validating configuration: {}", path.display());
    println!();

    if path.exists() {
        println!("  [OK] TOML structure is valid");
    } else {
        println!("  [--] No file found; using built-in defaults");
    }

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Repository    : {}", config.repository.path.display());
    println!("  Remote        : {}", config.repository.remote);
    println!(
        "  Git token     : {}",
        if config.repository.token.is_some() { "set" } else { "not set" }
    );
    println!("  Oracle URL    : {}", config.oracle.api_url);
    println!("  Model         : {}", config.oracle.model);
    println!(
        "  API key       : {}",
        if config.oracle.api_key.is_some() { "set" } else { "NOT SET" }
    );
    println!("  Strategy      : {:?}", config.resolver.strategy);
    println!("  Line counts   : {:?}", config.resolver.line_count_policy);
    println!("  Concurrency   : {}", config.resolver.max_concurrent_files);
    println!();
    println!("Configuration is valid.");
    Ok(())
}

fn cmd_scan(config: &AppConfig, repo: &Path, files: Vec<PathBuf>) -> Result<()> {
    let driver = open_driver(config, repo)?;
    let files = if files.is_empty() {
        driver
            .list_conflicted_files()
            .context("failed to list conflicted files")?
    } else {
        absolutize(&driver, files)
    };

    if files.is_empty() {
        println!("{}", style::success("No conflicted files"));
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["File", "Line", "Lines", "Incoming", "Ours", "Theirs"]);

    let mut total = 0;
    for file in &files {
        let bytes = match driver.read_file(file) {
            Ok(bytes) => bytes,
            Err(e) => {
                println!("{}", style::warn(&e.to_string()));
                continue;
            }
        };
        let content = String::from_utf8_lossy(&bytes);
        let blocks = ConflictLocator::locate(file, &content);
        let openings = conflict_start_lines(&content).len();
        if openings > blocks.len() {
            println!(
                "{}",
                style::warn(&format!(
                    "{}: {} opening marker(s) not part of a recognized conflict",
                    file.display(),
                    openings - blocks.len()
                ))
            );
        }
        for block in &blocks {
            table.add_row(vec![
                Cell::new(file.display()),
                Cell::new(block.start_line + 1),
                Cell::new(block.line_count()),
                Cell::new(&block.their_ref),
                Cell::new(block.ours.lines().count()),
                Cell::new(block.theirs.lines().count()),
            ]);
        }
        total += blocks.len();
    }

    println!();
    println!("{}", style::header(&format!("Conflicts ({})", total)));
    println!("{}", table);
    Ok(())
}

async fn cmd_merge(
    config: &AppConfig,
    repo: &Path,
    remote: &str,
    branch: &str,
    yes: bool,
    json: bool,
) -> Result<()> {
    let driver = open_driver(config, repo)?;
    let orchestrator = build_orchestrator(config, driver.clone())?;

    if !yes {
        let current = driver.current_branch().context("failed to read current branch")?;
        let proceed = Confirm::new()
            .with_prompt(format!(
                "Merge {remote}/{branch} into {current} and resolve conflicts in place?"
            ))
            .default(true)
            .interact()
            .context("failed to read confirmation")?;
        if !proceed {
            println!("{}", style::warn("Merge cancelled."));
            return Ok(());
        }
    }

    let cancel = cancel_on_ctrl_c();
    let spinner = spinner(&format!("Merging {remote}/{branch} and resolving conflicts..."), json);
    let result = orchestrator.merge_and_resolve(remote, branch, &cancel).await;
    spinner.finish_and_clear();

    let report = result?;
    finish_run(&orchestrator, &report, json)
}

async fn cmd_resolve(
    config: &AppConfig,
    repo: &Path,
    files: Vec<PathBuf>,
    json: bool,
) -> Result<()> {
    let driver = open_driver(config, repo)?;
    let files = absolutize(&driver, files);
    let orchestrator = build_orchestrator(config, driver)?;

    let cancel = cancel_on_ctrl_c();
    let spinner = spinner("Resolving conflicts...", json);
    let result = orchestrator.resolve_paths(files, &cancel).await;
    spinner.finish_and_clear();

    let report = result?;
    finish_run(&orchestrator, &report, json)
}

fn cmd_positions(repo: &Path, file: &Path) -> Result<()> {
    let file = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(file))
            .unwrap_or_else(|_| repo.join(file))
    };

    let tracker = highlight::load_positions(&highlight::default_store_path())?;
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut sink = TerminalSink::new(std::io::stdout().lock());
    let spans = tracker.on_active_file_changed(&file, &mut sink);
    if spans == 0 {
        println!("{}", style::dim("No recorded resolutions for this file."));
    }
    sink.render(&content).context("failed to write output")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Run output
// ---------------------------------------------------------------------------

fn spinner(message: &str, hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner:.blue} {msg}") {
        spinner.set_style(
            template.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Cancel the run on the first Ctrl-C. The in-flight file step finishes.
fn cancel_on_ctrl_c() -> CancelToken {
    let cancel = CancelToken::new();
    let handle = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested");
            handle.cancel();
        }
    });
    cancel
}

fn finish_run(orchestrator: &Orchestrator, report: &RunReport, json: bool) -> Result<()> {
    highlight::save_positions(&orchestrator.tracker(), &highlight::default_store_path())
        .context("failed to save positions")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("failed to serialize report")?
        );
        return Ok(());
    }

    print_report(report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    if let Some(merge) = report.merge {
        println!("  Merge         : {}", merge);
    }
    println!("  Branch        : {}", report.branch);
    println!("  Run           : {}", style::dim(&report.id));

    if !report.files.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["File", "Found", "Resolved", "Skipped", "Error"]);
        for file in &report.files {
            table.add_row(vec![
                Cell::new(file.path.display()),
                Cell::new(file.conflicts_found),
                Cell::new(file.applied.len()),
                Cell::new(file.skipped.len()),
                Cell::new(file.error.as_deref().unwrap_or("")),
            ]);
        }
        println!("{}", table);

        for file in &report.files {
            for skipped in &file.skipped {
                println!(
                    "{}",
                    style::warn(&format!(
                        "{}:{}: {}",
                        file.path.display(),
                        skipped.start_line + 1,
                        skipped.reason
                    ))
                );
            }
        }
    }

    println!();
    let summary = report.summary();
    if report.conflicts_skipped() > 0 || report.file_errors() > 0 || report.cancelled {
        println!("{}", style::warn(&summary));
    } else {
        println!("{}", style::success(&summary));
    }
}
