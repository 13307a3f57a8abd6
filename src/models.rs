use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::labels::same_label;

/// Read-only view of an Inbox message as the rule engine sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub subject: String,
    pub sender: String,
    /// To, Cc, Bcc and List-Id values
    pub recipients: Vec<String>,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub is_important: bool,
    /// Label names (system labels use their upper-case ids)
    pub labels: Vec<String>,
    pub in_inbox: bool,
}

impl Message {
    /// Label check, case-insensitive like Gmail's own label search
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| same_label(l, name))
    }

    /// Whole days elapsed since the message arrived, floored. Future dates count as 0.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.received_at).num_days().max(0)
    }

    /// All recipients joined for text matching
    pub fn recipients_text(&self) -> String {
        self.recipients.join(" ")
    }
}

/// Outcome recorded for one message under one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    MarkedImportant,
    Archived,
    WillArchiveLater,
    #[serde(rename = "won't_archive")]
    WontArchive,
    None,
    Failed,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::MarkedImportant => "marked_important",
            Action::Archived => "archived",
            Action::WillArchiveLater => "will_archive_later",
            Action::WontArchive => "won't_archive",
            Action::None => "none",
            Action::Failed => "failed",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub email_id: String,
    pub rule_name: String,
    pub subject: String,
    pub sender: String,
    pub date: DateTime<Utc>,
    /// The rule's label was applied during this run
    pub labeled: bool,
    pub action: Action,
    /// Decision that a failed mutation was trying to carry out
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intended_action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessingRecord {
    pub fn new(message: &Message, rule_name: &str, action: Action) -> Self {
        Self {
            email_id: message.id.clone(),
            rule_name: rule_name.to_string(),
            subject: message.subject.clone(),
            sender: message.sender.clone(),
            date: message.received_at,
            labeled: false,
            action,
            intended_action: None,
            error: None,
        }
    }

    /// Downgrade to a failed record, keeping the decision for the audit trail
    pub fn fail(&mut self, error: impl fmt::Display) {
        if self.action != Action::Failed {
            self.intended_action = Some(self.action);
        }
        self.action = Action::Failed;
        self.error = Some(error.to_string());
    }
}

/// Per-rule counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleStats {
    pub name: String,
    pub filter: String,
    pub emails_found: usize,
    pub emails_processed: usize,
    pub emails_labeled: usize,
    pub emails_marked_important: usize,
    pub emails_archived: usize,
    #[serde(default)]
    pub more_available: bool,
    /// Gmail's estimate of all matches for the query, across every page
    #[serde(default)]
    pub estimated_total: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl RuleStats {
    pub fn new(name: &str, filter: &str) -> Self {
        Self {
            name: name.to_string(),
            filter: filter.to_string(),
            ..Default::default()
        }
    }

    /// Fold one record into the counters
    pub fn record(&mut self, record: &ProcessingRecord) {
        self.emails_processed += 1;
        if record.labeled {
            self.emails_labeled += 1;
        }
        match record.action {
            Action::MarkedImportant => self.emails_marked_important += 1,
            Action::Archived => self.emails_archived += 1,
            Action::Failed => {
                if let Some(err) = &record.error {
                    self.errors.push(format!("{}: {}", record.email_id, err));
                }
            }
            _ => {}
        }
    }
}
