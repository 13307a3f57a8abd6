//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::auth;
use crate::client::ProductionGmailClient;
use crate::config::{AppPaths, Config};
use crate::engine::{ProcessingEngine, RunOptions, RunOutcome};
use crate::error::{GmailError, Result};
use crate::models::RuleStats;
use crate::report::{FileReportSink, RunReport};
use crate::rules::{Retention, RuleSet};
use crate::usage::RulesUsage;

#[derive(Parser, Debug)]
#[command(name = "gmail-manager")]
#[command(version)]
#[command(about = "Label, flag and archive Gmail Inbox messages with configurable rules", long_about = None)]
pub struct Cli {
    /// Configuration file [default: <config dir>/config.toml, or $GMAIL_MANAGER_CONFIG]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for run reports and rules usage [default: $GMAIL_MANAGER_DATA_DIR]
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// OAuth2 credentials file [default: <config dir>/credentials.json]
    #[arg(long, global = true)]
    pub credentials: Option<PathBuf>,

    /// Token cache file [default: <config dir>/token.json]
    #[arg(long, global = true)]
    pub token_cache: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply every enabled rule to the Inbox
    Run {
        /// Decide and report without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Messages fetched per rule (overrides settings.page_size)
        #[arg(long)]
        page_size: Option<u32>,

        /// Most emails to act on this run, 0 for no cap (overrides settings.limit)
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Print a saved run report
    Report {
        /// processed_*.json file
        file: PathBuf,
    },

    /// Show when each rule last matched
    Usage {
        /// Fold a processed_*.json file into the usage record
        #[arg(long, conflicts_with = "rebuild")]
        update_from: Option<PathBuf>,

        /// Rebuild from every report in the data directory
        #[arg(long)]
        rebuild: bool,
    },

    /// Load and compile the rules without touching the mailbox
    Validate,

    /// Generate example configuration file
    InitConfig {
        /// Where to write it [default: the configuration file path]
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },

    /// Authenticate with Gmail API
    Auth {
        /// Force re-authentication even if token exists
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    /// Environment and platform defaults with command-line overrides applied
    pub fn paths(&self) -> Result<AppPaths> {
        let mut paths = AppPaths::from_env()?;
        if let Some(config) = &self.config {
            paths = paths.with_config_file(config);
        }
        if let Some(dir) = &self.data_dir {
            paths = paths.with_data_dir(dir);
        }
        Ok(paths)
    }

    pub fn credentials_file(&self, paths: &AppPaths) -> PathBuf {
        self.credentials
            .clone()
            .unwrap_or_else(|| paths.credentials_file())
    }

    pub fn token_cache_file(&self, paths: &AppPaths) -> PathBuf {
        self.token_cache
            .clone()
            .unwrap_or_else(|| paths.token_cache())
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi(MultiProgress::new())
    }

    /// Share a MultiProgress with the log writer so log lines print above spinners
    pub fn with_multi(multi: MultiProgress) -> Self {
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        Self {
            multi,
            spinner_style,
        }
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        let _ = self.multi.println(format!("  ✓ {}", msg));
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Load config, authenticate, run every rule and record rules usage.
///
/// Configuration errors surface before authentication.
pub async fn run_rules(
    cli: &Cli,
    dry_run: bool,
    page_size: Option<u32>,
    limit: Option<u32>,
    multi: MultiProgress,
) -> Result<RunOutcome> {
    let reporter = ProgressReporter::with_multi(multi);
    let paths = cli.paths()?;

    let config_spinner = reporter.add_spinner("Loading configuration...");
    let config_file = paths.config_file();
    let mut config = Config::load(&config_file).await?;
    if dry_run {
        config.settings.dry_run = true;
    }
    if let Some(size) = page_size {
        config.settings.page_size = size;
        config.settings.validate()?;
    }
    if let Some(limit) = limit {
        config.settings.limit = limit;
    }
    let rules = config.rule_set()?;
    reporter.finish_spinner(
        &config_spinner,
        &format!("Loaded {} rules from {:?}", rules.len(), config_file),
    );

    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = auth::initialize_gmail_hub(
        &cli.credentials_file(&paths),
        &cli.token_cache_file(&paths),
        false,
    )
    .await?;
    reporter.finish_spinner(&auth_spinner, "Gmail API authenticated successfully");

    let client = ProductionGmailClient::new(hub, config.settings.max_retries);
    let sink = FileReportSink::new(&paths.data_dir);

    let rule_spinner = reporter.add_spinner("Applying rules...");
    let spinner = rule_spinner.clone();
    let engine = ProcessingEngine::new(&client, RunOptions::from_settings(&config.settings))
        .with_progress(Arc::new(move |stats: &RuleStats| {
            spinner.set_message(format!(
                "Rule '{}' done ({} found)",
                stats.name, stats.emails_found
            ));
        }));
    let outcome = engine.run(&rules, &sink).await?;
    reporter.finish_spinner(
        &rule_spinner,
        &format!(
            "Processed {} emails, report saved to {:?}",
            outcome.report.total_emails_processed, outcome.location
        ),
    );

    if !outcome.report.dry_run {
        let usage_path = paths.rules_usage_file();
        let mut usage = RulesUsage::load(&usage_path).await?;
        let updates = usage.update_from_report(&outcome.report);
        usage.save(&usage_path).await?;
        info!("Updated rules usage ({} changes)", updates);
    }

    Ok(outcome)
}

pub async fn load_report(path: &Path) -> Result<RunReport> {
    if !path.exists() {
        return Err(GmailError::ConfigError(format!(
            "Report file {:?} not found",
            path
        )));
    }
    RunReport::load(path).await
}

/// Apply the requested update (if any) and return the current usage record
pub async fn update_usage(
    paths: &AppPaths,
    update_from: Option<&Path>,
    rebuild: bool,
) -> Result<RulesUsage> {
    let usage_path = paths.rules_usage_file();

    if rebuild {
        let (usage, scanned) = RulesUsage::rebuild_from_dir(&paths.data_dir).await?;
        if scanned == 0 {
            return Err(GmailError::ConfigError(format!(
                "No processed_*.json files found in {:?}",
                paths.data_dir
            )));
        }
        usage.save(&usage_path).await?;
        return Ok(usage);
    }

    let mut usage = RulesUsage::load(&usage_path).await?;
    if let Some(file) = update_from {
        let report = load_report(file).await?;
        let updates = usage.update_from_report(&report);
        usage.save(&usage_path).await?;
        info!("Applied {} updates from {:?}", updates, file);
    }
    Ok(usage)
}

pub fn render_usage(usage: &RulesUsage) -> String {
    if usage.is_empty() {
        return "No rules usage recorded yet.".to_string();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:<40} {}", "Rule", "Last matched");
    let _ = writeln!(out, "{}", "-".repeat(70));
    for (rule, date) in usage.iter() {
        let _ = writeln!(out, "{:<40} {}", rule, date.format("%Y-%m-%d %H:%M UTC"));
    }
    out
}

/// Human-readable description of the compiled rules in execution order
pub fn describe_rules(rules: &RuleSet) -> String {
    let (important, other) = rules.partition_by_importance();
    let mut out = String::new();

    let describe = |out: &mut String, r: &crate::rules::CompiledRule| {
        let retention = match r.retention {
            Retention::Never => "never archive".to_string(),
            Retention::Immediately => "archive immediately".to_string(),
            Retention::AfterDays(n) => format!("archive after {} days", n),
        };
        let _ = writeln!(
            out,
            "  - {} [{}] label={} {}",
            r.name,
            r.filter,
            r.label.as_deref().unwrap_or("-"),
            retention
        );
    };

    let _ = writeln!(out, "Importance rules ({}):", important.len());
    for (_, r) in important {
        describe(&mut out, r);
    }
    let _ = writeln!(out, "Other rules ({}):", other.len());
    for (_, r) in other {
        describe(&mut out, r);
    }
    if rules.disabled_count() > 0 {
        let _ = writeln!(out, "Disabled rules: {}", rules.disabled_count());
    }
    out
}

pub async fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(GmailError::ConfigError(format!(
            "{:?} already exists (use --force to overwrite)",
            path
        )));
    }
    Config::create_example(path).await
}
