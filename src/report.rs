//! Per-run audit report and where it is persisted

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{GmailError, Result};
use crate::models::{Action, ProcessingRecord, RuleStats};

pub const REPORT_PREFIX: &str = "processed_";

/// Everything one run decided and did, in processing order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub total_emails_found: usize,
    /// Always equal to `emails.len()`
    pub total_emails_processed: usize,
    #[serde(default)]
    pub more_pages_available: bool,
    /// Sum of Gmail's per-rule match estimates, every page included
    #[serde(default)]
    pub total_estimated_matches: u64,
    /// Cap on distinct emails acted on; `None` when uncapped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Distinct emails that produced at least one record
    #[serde(default)]
    pub emails_evaluated: usize,
    #[serde(default)]
    pub limit_reached: bool,
    #[serde(default)]
    pub rule_statistics: Vec<RuleStats>,
    pub emails: Vec<ProcessingRecord>,
}

impl RunReport {
    pub fn new(
        run_id: String,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        dry_run: bool,
        rule_statistics: Vec<RuleStats>,
        emails: Vec<ProcessingRecord>,
    ) -> Self {
        Self {
            run_id,
            started_at,
            completed_at,
            dry_run,
            total_emails_found: rule_statistics.iter().map(|r| r.emails_found).sum(),
            total_emails_processed: emails.len(),
            more_pages_available: rule_statistics.iter().any(|r| r.more_available),
            total_estimated_matches: rule_statistics
                .iter()
                .map(|r| u64::from(r.estimated_total))
                .sum(),
            limit: None,
            emails_evaluated: 0,
            limit_reached: false,
            rule_statistics,
            emails,
        }
    }

    /// Record the run limit; reaching it means more mail is waiting
    pub fn with_limit(mut self, limit: Option<u32>, emails_evaluated: usize, reached: bool) -> Self {
        self.limit = limit;
        self.emails_evaluated = emails_evaluated;
        self.limit_reached = reached;
        self.more_pages_available |= reached;
        self
    }

    pub fn failed(&self) -> impl Iterator<Item = &ProcessingRecord> {
        self.emails.iter().filter(|e| e.action == Action::Failed)
    }

    pub fn count(&self, action: Action) -> usize {
        self.emails.iter().filter(|e| e.action == action).count()
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            GmailError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read report {:?}: {}", path, e),
            ))
        })?;
        Ok(serde_json::from_str(&json)?)
    }

    /// File name for this run: `processed_<YYYY-MM-DD_HHMMSS>.json` (UTC start)
    pub fn file_name(&self) -> String {
        format!(
            "{}{}.json",
            REPORT_PREFIX,
            self.started_at.format("%Y-%m-%d_%H%M%S")
        )
    }
}

/// Destination for finished run reports
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Store the report and return where it went
    async fn persist(&self, report: &RunReport) -> Result<PathBuf>;
}

/// Writes pretty-printed JSON reports into a directory
#[derive(Debug, Clone)]
pub struct FileReportSink {
    dir: PathBuf,
}

impl FileReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ReportSink for FileReportSink {
    async fn persist(&self, report: &RunReport) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut path = self.dir.join(report.file_name());
        if path.exists() {
            // Two runs started within the same second
            let short_id: String = report.run_id.chars().take(8).collect();
            path = self.dir.join(format!(
                "{}{}_{}.json",
                REPORT_PREFIX,
                report.started_at.format("%Y-%m-%d_%H%M%S"),
                short_id
            ));
        }

        let json = serde_json::to_string_pretty(report)?;
        tokio::fs::write(&path, json).await?;
        info!("Saved run report to {:?}", path);
        Ok(path)
    }
}

/// Every `processed_*.json` in a directory, oldest name first
pub async fn list_report_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_report = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(REPORT_PREFIX) && n.ends_with(".json"));
        if is_report {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

const WIDE: usize = 110;

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_len.saturating_sub(3)).collect::<String>())
    }
}

/// Plain-text rendering for the terminal
pub fn render_summary(report: &RunReport) -> String {
    let mut out = String::new();
    let rule = "=".repeat(WIDE);
    let thin = "-".repeat(WIDE);

    let _ = writeln!(out, "{}", rule);
    if report.dry_run {
        let _ = writeln!(out, "Processing Summary (DRY RUN - no changes were made)");
    } else {
        let _ = writeln!(out, "Processing Summary");
    }
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Run ID:             {}", report.run_id);
    let _ = writeln!(out, "Started:            {}", report.started_at.to_rfc3339());
    let _ = writeln!(out, "Completed:          {}", report.completed_at.to_rfc3339());
    if let Some(limit) = report.limit {
        let _ = writeln!(out, "Limit:              {} emails", limit);
    }
    let _ = writeln!(out, "Emails Evaluated:   {}", report.emails_evaluated);
    let _ = writeln!(out, "Emails Found:       {}", report.total_emails_found);
    let _ = writeln!(
        out,
        "Estimated Matches:  {} (all pages)",
        report.total_estimated_matches
    );
    let _ = writeln!(out, "Emails Processed:   {}", report.total_emails_processed);
    let _ = writeln!(out, "Failed:             {}", report.count(Action::Failed));
    if report.limit_reached {
        let _ = writeln!(
            out,
            "Limit reached:      yes (run again to continue)"
        );
    } else if report.more_pages_available {
        let _ = writeln!(
            out,
            "More pages:         yes (run again to continue with the next page)"
        );
    }

    // Rules with matches first, busiest first; stable for ties
    let mut rules: Vec<&RuleStats> = report.rule_statistics.iter().collect();
    rules.sort_by(|a, b| {
        (b.emails_found > 0)
            .cmp(&(a.emails_found > 0))
            .then(b.emails_found.cmp(&a.emails_found))
    });

    let _ = writeln!(out, "\n{}\nRule Summary\n{}", rule, rule);
    let _ = writeln!(
        out,
        "{:<40} {:<8} {:<10} {:<8} {:<10} {:<10} {:<8} {:<6}",
        "Rule Name", "Found", "Processed", "Labeled", "Important", "Archived", "Est.", "More"
    );
    let _ = writeln!(out, "{}", thin);
    for stats in &rules {
        let _ = writeln!(
            out,
            "{:<40} {:<8} {:<10} {:<8} {:<10} {:<10} {:<8} {:<6}",
            truncate(&stats.name, 39),
            stats.emails_found,
            stats.emails_processed,
            stats.emails_labeled,
            stats.emails_marked_important,
            stats.emails_archived,
            stats.estimated_total,
            if stats.more_available { "yes" } else { "" }
        );
    }
    let _ = writeln!(out, "{}", thin);
    let _ = writeln!(
        out,
        "{:<40} {:<8} {:<10} {:<8} {:<10} {:<10}",
        "TOTAL",
        report.total_emails_found,
        report.total_emails_processed,
        rules.iter().map(|r| r.emails_labeled).sum::<usize>(),
        rules.iter().map(|r| r.emails_marked_important).sum::<usize>(),
        rules.iter().map(|r| r.emails_archived).sum::<usize>(),
    );
    let _ = writeln!(out, "{}", rule);

    let _ = writeln!(out, "\n{}\nProcessed Emails\n{}", rule, rule);
    if report.emails.is_empty() {
        let _ = writeln!(out, "No emails were processed.");
    } else {
        let _ = writeln!(
            out,
            "{:<20} {:<30} {:<35} {:<18} {:<7}",
            "Email ID", "Rule", "Subject", "Action", "Labeled"
        );
        let _ = writeln!(out, "{}", thin);
        for email in &report.emails {
            let _ = writeln!(
                out,
                "{:<20} {:<30} {:<35} {:<18} {:<7}",
                truncate(&email.email_id, 20),
                truncate(&email.rule_name, 29),
                truncate(&email.subject, 34),
                email.action.as_str(),
                if email.labeled { "Yes" } else { "No" }
            );
        }
    }
    let _ = writeln!(out, "{}", rule);

    let failed: Vec<&ProcessingRecord> = report.failed().collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "\n{}\nFailed Emails\n{}", rule, rule);
        let _ = writeln!(
            out,
            "{:<20} {:<30} {:<18} {}",
            "Email ID", "Rule", "Intended", "Error"
        );
        let _ = writeln!(out, "{}", thin);
        for email in failed {
            let _ = writeln!(
                out,
                "{:<20} {:<30} {:<18} {}",
                truncate(&email.email_id, 20),
                truncate(&email.rule_name, 29),
                email.intended_action.map(|a| a.as_str()).unwrap_or("-"),
                truncate(email.error.as_deref().unwrap_or(""), 38)
            );
        }
        let _ = writeln!(out, "{}", rule);
    }

    for stats in report.rule_statistics.iter().filter(|s| !s.errors.is_empty()) {
        for err in &stats.errors {
            let _ = writeln!(out, "! {}: {}", stats.name, err);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use chrono::TimeZone;

    fn started() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 9, 5, 7).unwrap()
    }

    fn record(id: &str, rule: &str, action: Action) -> ProcessingRecord {
        let msg = Message {
            id: id.to_string(),
            thread_id: id.to_string(),
            subject: format!("Subject {}", id),
            sender: "a@example.com".to_string(),
            recipients: vec![],
            snippet: String::new(),
            received_at: started(),
            is_important: false,
            labels: vec![],
            in_inbox: true,
        };
        ProcessingRecord::new(&msg, rule, action)
    }

    fn report() -> RunReport {
        let mut bills = RuleStats::new("Bills", "label:Bills");
        bills.emails_found = 2;
        bills.emails_processed = 2;
        bills.emails_marked_important = 2;
        bills.estimated_total = 2;
        let mut news = RuleStats::new("News", "from:news");
        news.emails_found = 1;
        news.emails_processed = 1;
        news.more_available = true;
        news.estimated_total = 120;
        let idle = RuleStats::new("Idle", "from:nobody");

        let mut failed = record("m3", "News", Action::Archived);
        failed.fail("HTTP 500: Internal Server Error");

        RunReport::new(
            "0f8fad5b-d9cb-469f-a165-70867728950e".to_string(),
            started(),
            started() + chrono::Duration::seconds(4),
            false,
            vec![idle, bills, news],
            vec![
                record("m1", "Bills", Action::MarkedImportant),
                record("m2", "Bills", Action::MarkedImportant),
                failed,
            ],
        )
    }

    #[test]
    fn test_totals_follow_records() {
        let report = report();
        assert_eq!(report.total_emails_processed, 3);
        assert_eq!(report.total_emails_found, 3);
        assert!(report.more_pages_available);
        assert_eq!(report.failed().count(), 1);
        assert_eq!(report.count(Action::MarkedImportant), 2);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(report()).unwrap();
        assert_eq!(json["started_at"], "2024-03-15T09:05:07Z");
        assert_eq!(json["total_emails_processed"], 3);
        assert_eq!(json["emails"][0]["action"], "marked_important");
        assert_eq!(json["emails"][2]["action"], "failed");
        assert_eq!(json["emails"][2]["intended_action"], "archived");
        assert_eq!(json["rule_statistics"][1]["name"], "Bills");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(report().file_name(), "processed_2024-03-15_090507.json");
    }

    #[tokio::test]
    async fn test_file_sink_persists_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileReportSink::new(dir.path().join("data"));
        let report = report();

        let path = sink.persist(&report).await.unwrap();
        assert_eq!(path.file_name().unwrap(), "processed_2024-03-15_090507.json");
        assert_eq!(RunReport::load(&path).await.unwrap(), report);

        // same start second does not overwrite
        let second = sink.persist(&report).await.unwrap();
        assert_ne!(second, path);
        assert!(second
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with("_0f8fad5b.json"));

        let files = list_report_files(sink.dir()).await.unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn test_list_report_files_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("rules_usage.json"), "{}").await.unwrap();
        tokio::fs::write(dir.path().join("processed_2024-01-01_000000.json"), "{}")
            .await
            .unwrap();
        let files = list_report_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);

        assert!(list_report_files(&dir.path().join("missing")).await.unwrap().is_empty());
    }

    #[test]
    fn test_render_summary() {
        let text = render_summary(&report());
        assert!(text.contains("Processing Summary"));
        assert!(text.contains("Emails Processed:   3"));
        assert!(text.contains("Failed Emails"));
        assert!(text.contains("HTTP 500"));

        // busiest rule first, zero-match rules last
        let bills = text.find("Bills ").unwrap();
        let news = text.find("News ").unwrap();
        let idle = text.find("Idle ").unwrap();
        assert!(bills < news && news < idle);
    }

    #[test]
    fn test_estimates_and_limit_are_reported() {
        let report = report();
        assert_eq!(report.total_estimated_matches, 122);
        assert!(report.limit.is_none());
        let text = render_summary(&report);
        assert!(text.contains("Estimated Matches:  122 (all pages)"));
        assert!(!text.contains("Limit:"));

        let mut quiet = report.clone();
        quiet.rule_statistics.iter_mut().for_each(|r| r.more_available = false);
        quiet.more_pages_available = false;
        let capped = quiet.with_limit(Some(2), 2, true);
        assert!(capped.more_pages_available);
        let text = render_summary(&capped);
        assert!(text.contains("Limit:              2 emails"));
        assert!(text.contains("Emails Evaluated:   2"));
        assert!(text.contains("Limit reached:      yes"));

        let json = serde_json::to_value(&capped).unwrap();
        assert_eq!(json["limit"], 2);
        assert_eq!(json["total_estimated_matches"], 122);
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
