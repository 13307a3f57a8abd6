//! Rule processing engine
//!
//! One run walks a fixed sequence of phases:
//!
//! ```text
//! Init -> FetchProtected -> RunImportanceRules -> RunOtherRules -> Finalize -> Done
//! ```
//!
//! Importance-marking rules run before all others so the messages they flag
//! are protected from archival by any later rule. Within each pass rules run
//! in configuration order. Collaborators are awaited one call at a time.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::client::{MailMutation, MailQuery};
use crate::config::Settings;
use crate::error::{GmailError, Result};
use crate::filter::RuleMatcher;
use crate::labels::{label_key, same_label};
use crate::models::{Action, Message, ProcessingRecord, RuleStats};
use crate::policy::ArchivalPolicy;
use crate::protection::ProtectionSet;
use crate::report::{ReportSink, RunReport};
use crate::rules::{CompiledRule, RuleSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    FetchProtected,
    RunImportanceRules,
    RunOtherRules,
    Finalize,
    Done,
}

impl RunPhase {
    /// The only phase this one may move to
    pub fn next(self) -> Option<RunPhase> {
        match self {
            RunPhase::Init => Some(RunPhase::FetchProtected),
            RunPhase::FetchProtected => Some(RunPhase::RunImportanceRules),
            RunPhase::RunImportanceRules => Some(RunPhase::RunOtherRules),
            RunPhase::RunOtherRules => Some(RunPhase::Finalize),
            RunPhase::Finalize => Some(RunPhase::Done),
            RunPhase::Done => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub page_size: u32,
    pub dry_run: bool,
    pub auto_archive_label: Option<String>,
    pub final_archive_label: Option<String>,
    /// Most distinct messages one run may act on; `None` for no cap
    pub limit: Option<u32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            page_size: settings.page_size,
            dry_run: settings.dry_run,
            auto_archive_label: settings.auto_archive_label.clone(),
            final_archive_label: settings.final_archive_label.clone(),
            limit: (settings.limit > 0).then_some(settings.limit),
        }
    }
}

/// Called after each rule finishes
pub type RuleCallback = Arc<dyn Fn(&RuleStats) + Send + Sync>;

pub struct RunOutcome {
    pub report: RunReport,
    /// Where the report sink stored the report
    pub location: PathBuf,
    /// Final protection set, seed included
    pub protection: ProtectionSet,
}

pub struct ProcessingEngine<'a, C: ?Sized> {
    client: &'a C,
    options: RunOptions,
    now: DateTime<Utc>,
    run_id: String,
    phase: RunPhase,
    protection: ProtectionSet,
    /// Messages archived earlier in this run
    archived: HashSet<String>,
    /// Label keys added earlier in this run, per message
    applied: HashMap<String, HashSet<String>>,
    /// Distinct messages that produced a record, counted against the limit
    evaluated: HashSet<String>,
    limit_reached: bool,
    records: Vec<ProcessingRecord>,
    stats: Vec<RuleStats>,
    on_rule_done: Option<RuleCallback>,
}

impl<'a, C> ProcessingEngine<'a, C>
where
    C: MailQuery + MailMutation + ?Sized,
{
    pub fn new(client: &'a C, options: RunOptions) -> Self {
        Self {
            client,
            options,
            now: Utc::now(),
            run_id: uuid::Uuid::new_v4().to_string(),
            phase: RunPhase::Init,
            protection: ProtectionSet::new(),
            archived: HashSet::new(),
            applied: HashMap::new(),
            evaluated: HashSet::new(),
            limit_reached: false,
            records: Vec::new(),
            stats: Vec::new(),
            on_rule_done: None,
        }
    }

    /// Fix the run clock; all age decisions use this instant
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn with_progress(mut self, callback: RuleCallback) -> Self {
        self.on_rule_done = Some(callback);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn advance(&mut self, to: RunPhase) -> Result<()> {
        if self.phase.next() != Some(to) {
            return Err(GmailError::StateError(format!(
                "cannot move from {:?} to {:?}",
                self.phase, to
            )));
        }
        self.phase = to;
        info!("Phase changed to {:?}", to);
        Ok(())
    }

    /// Execute every enabled rule once and persist the report.
    ///
    /// Failure to fetch the important-message seed aborts before any
    /// mutation. Per-rule and per-message failures are recorded and the run
    /// carries on.
    pub async fn run(mut self, rules: &RuleSet, sink: &dyn ReportSink) -> Result<RunOutcome> {
        let started_at = self.now;
        info!(
            "Starting run {} ({} rules enabled, {} disabled{})",
            self.run_id,
            rules.len() - rules.disabled_count(),
            rules.disabled_count(),
            if self.options.dry_run { ", dry run" } else { "" }
        );

        self.stats = rules
            .enabled()
            .map(|r| RuleStats::new(&r.name, r.filter.source()))
            .collect();
        let (importance_rules, other_rules) = rules.partition_by_importance();

        self.advance(RunPhase::FetchProtected)?;
        let seed = self.client.important_inbox_ids().await.map_err(|e| {
            warn!("Could not fetch important Inbox messages: {}", e);
            e
        })?;
        self.protection.seed(seed);
        info!("Protecting {} important Inbox messages", self.protection.len());

        self.advance(RunPhase::RunImportanceRules)?;
        for (idx, rule) in importance_rules {
            self.run_rule(idx, rule).await;
        }

        self.advance(RunPhase::RunOtherRules)?;
        for (idx, rule) in other_rules {
            self.run_rule(idx, rule).await;
        }

        self.advance(RunPhase::Finalize)?;
        let report = RunReport::new(
            self.run_id.clone(),
            started_at,
            Utc::now().max(started_at),
            self.options.dry_run,
            std::mem::take(&mut self.stats),
            std::mem::take(&mut self.records),
        )
        .with_limit(self.options.limit, self.evaluated.len(), self.limit_reached);
        let location = sink.persist(&report).await?;

        self.advance(RunPhase::Done)?;
        info!(
            "Run {} complete: {} emails processed, {} failed",
            report.run_id,
            report.total_emails_processed,
            report.count(Action::Failed)
        );

        Ok(RunOutcome {
            report,
            location,
            protection: self.protection,
        })
    }

    async fn run_rule(&mut self, idx: usize, rule: &CompiledRule) {
        if self.limit_reached {
            debug!("Rule '{}': not queried, run limit reached", rule.name);
            self.stats[idx].more_available = true;
            self.notify(idx);
            return;
        }

        let matcher = RuleMatcher::new(self.now);
        let policy = ArchivalPolicy::new(self.now);

        let page = match self
            .client
            .query_inbox_messages(&rule.filter, self.options.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                warn!("Rule '{}': query failed: {}", rule.name, e);
                self.stats[idx].errors.push(format!("query failed: {}", e));
                self.notify(idx);
                return;
            }
        };
        self.stats[idx].more_available = page.more_available;
        self.stats[idx].estimated_total = page.result_size_estimate;
        for (id, reason) in &page.skipped {
            self.stats[idx]
                .errors
                .push(format!("{}: could not fetch: {}", id, reason));
        }

        for message in &page.messages {
            if !matcher.matches(message, rule) {
                continue;
            }
            let actionable = message.in_inbox && !self.archived.contains(&message.id);
            if actionable && self.at_limit(&message.id) {
                info!(
                    "Run limit of {} emails reached during rule '{}'",
                    self.evaluated.len(),
                    rule.name
                );
                self.limit_reached = true;
                self.stats[idx].more_available = true;
                break;
            }
            self.stats[idx].emails_found += 1;

            if !actionable {
                debug!("Skipping {}: no longer in the Inbox", message.id);
                continue;
            }

            self.evaluated.insert(message.id.clone());
            let action = policy.decide(message, rule, &mut self.protection);
            debug!("{} ({}): {}", message.id, rule.name, action);

            let record = self.carry_out(message, rule, action).await;
            self.stats[idx].record(&record);
            self.records.push(record);
        }

        let stats = &self.stats[idx];
        info!(
            "Rule '{}': {} found, {} processed, {} labeled, {} important, {} archived{}",
            stats.name,
            stats.emails_found,
            stats.emails_processed,
            stats.emails_labeled,
            stats.emails_marked_important,
            stats.emails_archived,
            if stats.more_available { " (more available)" } else { "" }
        );
        self.notify(idx);
    }

    /// A message not yet acted on would go over the run limit
    fn at_limit(&self, message_id: &str) -> bool {
        match self.options.limit {
            Some(limit) => {
                !self.evaluated.contains(message_id) && self.evaluated.len() >= limit as usize
            }
            None => false,
        }
    }

    fn notify(&self, idx: usize) {
        if let Some(cb) = &self.on_rule_done {
            cb(&self.stats[idx]);
        }
    }

    fn has_label(&self, message: &Message, label: &str) -> bool {
        message.has_label(label)
            || self
                .applied
                .get(&message.id)
                .is_some_and(|set| set.contains(&label_key(label)))
    }

    fn remember_label(&mut self, message_id: &str, label: &str) {
        self.applied
            .entry(message_id.to_string())
            .or_default()
            .insert(label_key(label));
    }

    /// Labels this decision adds, in application order, skipping ones the
    /// message already carries
    fn labels_to_add(&self, message: &Message, rule: &CompiledRule, action: Action) -> Vec<String> {
        let mut labels = Vec::new();
        if let Some(label) = &rule.label {
            labels.push(label.clone());
        }
        if matches!(action, Action::Archived | Action::WillArchiveLater)
            && matches!(rule.retention, crate::rules::Retention::AfterDays(_))
        {
            if let Some(auto) = &self.options.auto_archive_label {
                labels.push(auto.clone());
            }
        }
        labels.retain(|l| !self.has_label(message, l));
        labels.dedup_by(|a, b| same_label(a, b));
        labels
    }

    async fn carry_out(
        &mut self,
        message: &Message,
        rule: &CompiledRule,
        action: Action,
    ) -> ProcessingRecord {
        let mut record = ProcessingRecord::new(message, &rule.name, action);
        let labels = self.labels_to_add(message, rule, action);
        let rule_label_pending = rule
            .label
            .as_ref()
            .is_some_and(|l| labels.iter().any(|p| same_label(p, l)));

        if self.options.dry_run {
            record.labeled = rule_label_pending;
            for label in &labels {
                self.remember_label(&message.id, label);
            }
            if action == Action::Archived {
                self.archived.insert(message.id.clone());
            }
            return record;
        }

        if let Err(e) = self
            .mutate(message, action, &labels, rule_label_pending, &mut record)
            .await
        {
            warn!(
                "{} ({}): {} failed: {}",
                message.id, rule.name, action, e
            );
            record.fail(e);
        }
        record
    }

    /// Importance flag, labels, then archive. Stops at the first failure.
    async fn mutate(
        &mut self,
        message: &Message,
        action: Action,
        labels: &[String],
        rule_label_pending: bool,
        record: &mut ProcessingRecord,
    ) -> Result<()> {
        let id = message.id.as_str();

        if action == Action::MarkedImportant && !message.is_important {
            self.client.mark_important(id).await?;
        }

        // a pending rule label is always first
        for (i, label) in labels.iter().enumerate() {
            self.client.apply_label(id, label).await?;
            self.remember_label(id, label);
            if i == 0 && rule_label_pending {
                record.labeled = true;
            }
        }

        if action == Action::Archived {
            self.client.archive(id).await?;
            self.archived.insert(id.to_string());
            if let Some(done) = self.options.final_archive_label.clone() {
                if !self.has_label(message, &done) {
                    self.client.apply_label(id, &done).await?;
                    self.remember_label(id, &done);
                }
            }
        }
        Ok(())
    }
}
