use anyhow::Result;
use clap::Parser;
use gmail_manager::auth;
use gmail_manager::cli::{self, Cli, Commands, ProgressReporter};
use gmail_manager::config::Config;
use gmail_manager::error::GmailError;
use gmail_manager::report::render_summary;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: gmail-manager --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // aws-lc-rs needs NASM/CMake on Windows, ring does not
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("gmail_manager=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gmail_manager=info"))
    };

    let multi_progress = Arc::new(MultiProgress::new());
    let make_writer = MultiProgressMakeWriter {
        multi: Arc::clone(&multi_progress),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match &cli.command {
        Commands::Run {
            dry_run,
            page_size,
            limit,
        } => {
            let outcome = cli::run_rules(
                &cli,
                *dry_run,
                *page_size,
                *limit,
                (*multi_progress).clone(),
            )
            .await?;
            println!("{}", render_summary(&outcome.report));
            if outcome.report.failed().next().is_some() {
                tracing::warn!(
                    "Some emails could not be processed; see {:?}",
                    outcome.location
                );
            }
        }

        Commands::Report { file } => {
            let report = cli::load_report(file).await?;
            println!("{}", render_summary(&report));
        }

        Commands::Usage {
            update_from,
            rebuild,
        } => {
            let paths = cli.paths()?;
            let usage = cli::update_usage(&paths, update_from.as_deref(), *rebuild).await?;
            println!("{}", cli::render_usage(&usage));
        }

        Commands::Validate => {
            let path = cli.paths()?.config_file();
            let config = Config::load(&path).await?;
            let rules = config.rule_set()?;
            println!("✓ {:?} is valid\n", path);
            println!("{}", cli::describe_rules(&rules));
        }

        Commands::InitConfig { output, force } => {
            let path = match output {
                Some(p) => p.clone(),
                None => cli.paths()?.config_file(),
            };
            cli::init_config(&path, *force).await?;
            println!("✓ Example configuration written to {:?}", path);
            println!("  Edit the rules, then run: gmail-manager validate");
        }

        Commands::Auth { force } => {
            let paths = cli.paths()?;
            let token_cache = cli.token_cache_file(&paths);
            if let Some(parent) = token_cache.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let reporter = ProgressReporter::with_multi((*multi_progress).clone());
            let spinner = reporter.add_spinner("Authenticating with Gmail API...");
            let hub =
                auth::initialize_gmail_hub(&cli.credentials_file(&paths), &token_cache, *force)
                    .await?;

            let (_, profile) = hub
                .users()
                .get_profile("me")
                .add_scope(auth::MODIFY_SCOPE)
                .doit()
                .await
                .map_err(GmailError::from)?;
            reporter.finish_spinner(&spinner, "Authentication successful");
            if let Some(email) = profile.email_address {
                println!("  Connected as {}", email);
            }
            println!("  Token cached at {:?}", token_cache);
        }
    }

    Ok(())
}
