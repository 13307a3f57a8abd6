//! Common test utilities and fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use gmail_manager::client::{MailMutation, MailQuery, MessagePage};
use gmail_manager::error::{GmailError, Result};
use gmail_manager::filter::FilterExpr;
use gmail_manager::models::Message;
use gmail_manager::report::{ReportSink, RunReport};
use gmail_manager::rules::{Rule, RuleSet};
use mockall::mock;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

/// Fixed run clock shared by fixtures and engine
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

/// Create a test Inbox message received `age_days` before [`test_now`]
pub fn create_test_message(id: &str, sender: &str, subject: &str, age_days: i64) -> Message {
    Message {
        id: id.to_string(),
        thread_id: format!("thread_{}", id),
        subject: subject.to_string(),
        sender: sender.to_string(),
        recipients: vec!["me@example.com".to_string()],
        snippet: "Email snippet...".to_string(),
        received_at: test_now() - Duration::days(age_days),
        is_important: false,
        labels: vec!["INBOX".to_string()],
        in_inbox: true,
    }
}

pub fn create_important_message(id: &str, sender: &str, subject: &str, age_days: i64) -> Message {
    let mut message = create_test_message(id, sender, subject, age_days);
    message.is_important = true;
    message.labels.push("IMPORTANT".to_string());
    message
}

pub fn create_labeled_message(id: &str, label: &str, age_days: i64) -> Message {
    let mut message = create_test_message(id, "billing@power.example", "Your bill", age_days);
    message.labels.push(label.to_string());
    message
}

pub fn create_rule(
    name: &str,
    filter: &str,
    label: Option<&str>,
    mark_important: bool,
    inbox_days: i64,
) -> Rule {
    Rule {
        name: name.to_string(),
        filter: filter.to_string(),
        label: label.map(str::to_string),
        mark_important,
        inbox_days,
        enabled: true,
    }
}

pub fn rule_set(rules: &[Rule]) -> RuleSet {
    RuleSet::compile(rules).unwrap()
}

/// One mailbox call as seen by [`FakeMailbox`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Query(String),
    ImportantIds,
    ApplyLabel(String, String),
    MarkImportant(String),
    Archive(String),
}

impl Call {
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::ApplyLabel(..) | Call::MarkImportant(_) | Call::Archive(_)
        )
    }
}

#[derive(Default)]
struct FakeState {
    messages: BTreeMap<String, Message>,
    calls: Vec<Call>,
    fail_seed: bool,
    fail_queries: HashSet<String>,
    fail_archive: HashSet<String>,
    fail_labels: HashSet<(String, String)>,
    unreadable: BTreeMap<String, String>,
}

/// In-memory mailbox that evaluates filters itself and applies mutations to
/// its own copy of the messages
pub struct FakeMailbox {
    now: DateTime<Utc>,
    state: Mutex<FakeState>,
}

impl FakeMailbox {
    pub fn new(messages: Vec<Message>) -> Self {
        let state = FakeState {
            messages: messages.into_iter().map(|m| (m.id.clone(), m)).collect(),
            ..FakeState::default()
        };
        Self {
            now: test_now(),
            state: Mutex::new(state),
        }
    }

    pub fn fail_seed(&self) {
        self.state.lock().unwrap().fail_seed = true;
    }

    pub fn fail_query(&self, filter: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_queries
            .insert(filter.to_string());
    }

    pub fn fail_archive(&self, id: &str) {
        self.state.lock().unwrap().fail_archive.insert(id.to_string());
    }

    pub fn fail_label(&self, id: &str, label: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_labels
            .insert((id.to_string(), label.to_string()));
    }

    /// List the message but fail to fetch it, like a per-message 403
    pub fn unreadable(&self, id: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .unreadable
            .insert(id.to_string(), reason.to_string());
    }

    pub fn message(&self, id: &str) -> Message {
        self.state.lock().unwrap().messages[id].clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn mutations_for(&self, id: &str) -> Vec<Call> {
        self.mutations()
            .into_iter()
            .filter(|c| match c {
                Call::ApplyLabel(m, _) | Call::MarkImportant(m) | Call::Archive(m) => m == id,
                _ => false,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

#[async_trait]
impl MailQuery for FakeMailbox {
    async fn query_inbox_messages(
        &self,
        filter: &FilterExpr,
        page_size: u32,
    ) -> Result<MessagePage> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Query(filter.source().to_string()));
        if state.fail_queries.contains(filter.source()) {
            return Err(GmailError::ServerError {
                status: 503,
                message: "backend unavailable".to_string(),
            });
        }

        let matching: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.in_inbox && filter.evaluate(m, self.now))
            .cloned()
            .collect();
        let more_available = matching.len() > page_size as usize;
        let result_size_estimate = matching.len() as u32;
        let (skipped, messages): (Vec<Message>, Vec<Message>) = matching
            .into_iter()
            .take(page_size as usize)
            .partition(|m| state.unreadable.contains_key(&m.id));
        Ok(MessagePage {
            result_size_estimate,
            messages,
            skipped: skipped
                .into_iter()
                .map(|m| {
                    let reason = state.unreadable[&m.id].clone();
                    (m.id, reason)
                })
                .collect(),
            more_available,
        })
    }

    async fn important_inbox_ids(&self) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::ImportantIds);
        if state.fail_seed {
            return Err(GmailError::NetworkError("connection reset".to_string()));
        }
        Ok(state
            .messages
            .values()
            .filter(|m| m.in_inbox && m.is_important)
            .map(|m| m.id.clone())
            .collect())
    }
}

#[async_trait]
impl MailMutation for FakeMailbox {
    async fn apply_label(&self, message_id: &str, label: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(Call::ApplyLabel(message_id.to_string(), label.to_string()));
        if state
            .fail_labels
            .contains(&(message_id.to_string(), label.to_string()))
        {
            return Err(GmailError::LabelError(format!("cannot apply {}", label)));
        }
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| GmailError::MessageNotFound(message_id.to_string()))?;
        if !message.has_label(label) {
            message.labels.push(label.to_string());
        }
        Ok(())
    }

    async fn mark_important(&self, message_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::MarkImportant(message_id.to_string()));
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| GmailError::MessageNotFound(message_id.to_string()))?;
        message.is_important = true;
        if !message.has_label("IMPORTANT") {
            message.labels.push("IMPORTANT".to_string());
        }
        Ok(())
    }

    async fn archive(&self, message_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Archive(message_id.to_string()));
        if state.fail_archive.contains(message_id) {
            return Err(GmailError::ServerError {
                status: 500,
                message: "modify failed".to_string(),
            });
        }
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| GmailError::MessageNotFound(message_id.to_string()))?;
        message.in_inbox = false;
        message.labels.retain(|l| l != "INBOX");
        Ok(())
    }
}

mock! {
    pub Mailbox {}

    #[async_trait]
    impl MailQuery for Mailbox {
        async fn query_inbox_messages(&self, filter: &FilterExpr, page_size: u32) -> Result<MessagePage>;
        async fn important_inbox_ids(&self) -> Result<Vec<String>>;
    }

    #[async_trait]
    impl MailMutation for Mailbox {
        async fn apply_label(&self, message_id: &str, label: &str) -> Result<()>;
        async fn mark_important(&self, message_id: &str) -> Result<()>;
        async fn archive(&self, message_id: &str) -> Result<()>;
    }
}

/// Keeps persisted reports in memory
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<RunReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<RunReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn persist(&self, report: &RunReport) -> Result<PathBuf> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(PathBuf::from("memory").join(report.file_name()))
    }
}
