//! Gmail Inbox Rule Engine
//!
//! Applies user-defined rules to a Gmail Inbox: match messages with
//! Gmail-style filters, apply labels, flag importance and archive by age,
//! while messages that are (or become) important are never archived.
//! Every run leaves a JSON audit report behind.
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_manager::{auth, client::ProductionGmailClient, config::Config};
//! use gmail_manager::engine::{ProcessingEngine, RunOptions};
//! use gmail_manager::report::FileReportSink;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let rules = config.rule_set()?;
//!
//!     let hub = auth::initialize_gmail_hub(
//!         "credentials.json".as_ref(),
//!         "token.json".as_ref(),
//!         false,
//!     )
//!     .await?;
//!     let client = ProductionGmailClient::new(hub, config.settings.max_retries);
//!
//!     let sink = FileReportSink::new("reports");
//!     let outcome = ProcessingEngine::new(&client, RunOptions::from_settings(&config.settings))
//!         .run(&rules, &sink)
//!         .await?;
//!     println!("{} emails processed", outcome.report.total_emails_processed);
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`client`] - Mail query/mutation services and the Gmail implementation
//! - [`cli`] - Command-line interface and command handlers
//! - [`config`] - Configuration file and path resolution
//! - [`engine`] - Run state machine
//! - [`error`] - Error types and result aliases
//! - [`filter`] - Filter expression parsing and matching
//! - [`labels`] - Label name/id directory
//! - [`models`] - Messages, actions, records and statistics
//! - [`policy`] - Archival decisions
//! - [`protection`] - Ids protected from archival
//! - [`report`] - Run reports and report sinks
//! - [`rules`] - Rule definitions and validation
//! - [`usage`] - Last-matched dates per rule

pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod filter;
pub mod labels;
pub mod models;
pub mod policy;
pub mod protection;
pub mod report;
pub mod rules;
pub mod usage;

pub use error::{GmailError, Result};

pub use models::{Action, Message, ProcessingRecord, RuleStats};

pub use config::{AppPaths, Config, Settings};

pub use rules::{CompiledRule, Retention, Rule, RuleSet};

pub use filter::{FilterExpr, RuleMatcher};

pub use policy::ArchivalPolicy;
pub use protection::ProtectionSet;

pub use client::{MailMutation, MailQuery, MessagePage, ProductionGmailClient};

pub use engine::{ProcessingEngine, RunOptions, RunOutcome, RunPhase};

pub use report::{FileReportSink, ReportSink, RunReport};

pub use usage::RulesUsage;

pub use cli::{Cli, Commands, ProgressReporter};
