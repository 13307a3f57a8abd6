//! Mail query and mutation services, with the Gmail API implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use google_gmail1::api::{Label, Message as GmailMessage, ModifyMessageRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{GmailHub, LABELS_SCOPE, MODIFY_SCOPE};
use crate::error::{GmailError, Result};
use crate::filter::FilterExpr;
use crate::labels::{LabelDirectory, LabelInfo, IMPORTANT, INBOX};
use crate::models::Message;

/// One page of Inbox messages for a rule query
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Listed ids that could not be fetched, with the reason
    pub skipped: Vec<(String, String)>,
    /// Gmail's estimate of the total match count
    pub result_size_estimate: u32,
    /// A further page exists; it is reported, never fetched
    pub more_available: bool,
}

/// Read side of the mailbox
#[async_trait]
pub trait MailQuery: Send + Sync {
    /// First page of Inbox messages the filter may match. Callers re-check
    /// each message against the filter.
    async fn query_inbox_messages(&self, filter: &FilterExpr, page_size: u32)
        -> Result<MessagePage>;

    /// Ids of every Inbox message currently flagged important
    async fn important_inbox_ids(&self) -> Result<Vec<String>>;
}

/// Write side of the mailbox; each call fails independently
#[async_trait]
pub trait MailMutation: Send + Sync {
    /// Add a user label by name, creating it if needed
    async fn apply_label(&self, message_id: &str, label: &str) -> Result<()>;

    async fn mark_important(&self, message_id: &str) -> Result<()>;

    /// Remove the message from the Inbox. Never deletes.
    async fn archive(&self, message_id: &str) -> Result<()>;
}

const CALL_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_HEADERS: &[&str] = &["From", "To", "Cc", "Bcc", "List-Id", "Subject", "Date"];

/// Gmail API client with retry, timeouts and lazy label resolution
pub struct ProductionGmailClient {
    hub: GmailHub,
    max_retries: u32,
    labels: Mutex<Option<LabelDirectory>>,
}

impl ProductionGmailClient {
    pub fn new(hub: GmailHub, max_retries: u32) -> Self {
        Self {
            hub,
            max_retries,
            labels: Mutex::new(None),
        }
    }

    fn should_retry(error: &GmailError) -> bool {
        error.is_transient()
    }

    /// Execute an async operation with exponential backoff retry
    ///
    /// The delay starts at `base_delay`, doubles per attempt and is capped at
    /// 30 seconds. Rate-limit errors wait at least their Retry-After.
    async fn with_retry<T, F, Fut>(
        operation_name: &str,
        max_retries: u32,
        base_delay: Duration,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = base_delay;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if Self::should_retry(&e) && attempts <= max_retries => {
                    let wait = match &e {
                        GmailError::RateLimitExceeded { retry_after } => {
                            delay.max(Duration::from_secs(*retry_after))
                        }
                        _ => delay,
                    };
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        attempts,
                        max_retries + 1,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn retry<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        Self::with_retry(operation_name, self.max_retries, Duration::from_secs(1), operation).await
    }

    async fn list_labels(&self) -> Result<Vec<LabelInfo>> {
        self.retry("list_labels", || async {
            let call = self
                .hub
                .users()
                .labels_list("me")
                .add_scope(LABELS_SCOPE)
                .doit();
            let (_, response) = with_timeout("list_labels", call).await??;

            Ok(response
                .labels
                .unwrap_or_default()
                .into_iter()
                .filter_map(|label| match (label.id, label.name) {
                    (Some(id), Some(name)) => Some(LabelInfo { id, name }),
                    _ => None,
                })
                .collect())
        })
        .await
    }

    async fn create_label(&self, name: &str) -> Result<String> {
        self.retry("create_label", || async {
            let label = Label {
                name: Some(name.to_string()),
                message_list_visibility: Some("show".to_string()),
                label_list_visibility: Some("labelShow".to_string()),
                ..Default::default()
            };
            let call = self
                .hub
                .users()
                .labels_create(label, "me")
                .add_scope(LABELS_SCOPE)
                .doit();
            let (_, created) = with_timeout("create_label", call).await??;
            created
                .id
                .ok_or_else(|| GmailError::LabelError("Created label has no ID".to_string()))
        })
        .await
    }

    /// Label directory, fetched on first use
    async fn label_directory(&self) -> Result<tokio::sync::MappedMutexGuard<'_, LabelDirectory>> {
        let mut guard = self.labels.lock().await;
        if guard.is_none() {
            let labels = self.list_labels().await?;
            info!("Loaded {} existing labels", labels.len());
            *guard = Some(LabelDirectory::from_labels(labels));
        }
        Ok(tokio::sync::MutexGuard::map(guard, |dir| {
            dir.get_or_insert_with(LabelDirectory::new)
        }))
    }

    /// Resolve a label name to its id, creating it (and its parents) if missing
    async fn resolve_label(&self, name: &str) -> Result<String> {
        let mut dir = self.label_directory().await?;
        if let Some(id) = dir.id_for(name) {
            return Ok(id.to_string());
        }

        for parent in dir.missing_parents(name) {
            info!("Creating parent label: {}", parent);
            let id = self.create_label(&parent).await?;
            dir.insert(LabelInfo { id, name: parent });
        }

        info!("Creating label: {}", name);
        let id = self.create_label(name).await.map_err(|e| {
            GmailError::LabelError(format!("Failed to create label '{}': {}", name, e))
        })?;
        dir.insert(LabelInfo {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn modify(
        &self,
        operation_name: &str,
        message_id: &str,
        add: Option<Vec<String>>,
        remove: Option<Vec<String>>,
    ) -> Result<()> {
        self.retry(operation_name, || async {
            let request = ModifyMessageRequest {
                add_label_ids: add.clone(),
                remove_label_ids: remove.clone(),
            };
            let call = self
                .hub
                .users()
                .messages_modify(request, "me", message_id)
                .add_scope(MODIFY_SCOPE)
                .doit();
            with_timeout(operation_name, call).await??;
            Ok(())
        })
        .await
    }

    /// Ids from one listing call plus the continuation token
    async fn list_ids(
        &self,
        query: &str,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<(Vec<String>, u32, Option<String>)> {
        self.retry("list_messages", || async {
            let mut call = self
                .hub
                .users()
                .messages_list("me")
                .add_label_ids(INBOX)
                .max_results(max_results);
            if !query.is_empty() {
                call = call.q(query);
            }
            if let Some(token) = page_token {
                call = call.page_token(token);
            }
            let (_, response) =
                with_timeout("list_messages", call.add_scope(MODIFY_SCOPE).doit()).await??;

            let ids = response
                .messages
                .unwrap_or_default()
                .into_iter()
                .filter_map(|m| m.id)
                .collect();
            Ok((
                ids,
                response.result_size_estimate.unwrap_or(0),
                response.next_page_token,
            ))
        })
        .await
    }

    async fn get_message(&self, id: &str) -> Result<GmailMessage> {
        self.retry("get_message", || async {
            let mut call = self
                .hub
                .users()
                .messages_get("me", id)
                .format("metadata");
            for header in METADATA_HEADERS {
                call = call.add_metadata_headers(header);
            }
            let (_, msg) = with_timeout("get_message", call.add_scope(MODIFY_SCOPE).doit()).await??;
            Ok(msg)
        })
        .await
    }
}

/// Fetch listed ids one at a time. A message that fails to load is logged
/// and returned in the skipped list; the rest of the page still loads.
/// Messages deleted since the listing are dropped silently. Auth failures
/// end the page since every later call would fail the same way.
async fn fetch_each<F, Fut>(
    ids: Vec<String>,
    mut fetch: F,
) -> Result<(Vec<Message>, Vec<(String, String)>)>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Message>>,
{
    let mut messages = Vec::with_capacity(ids.len());
    let mut skipped = Vec::new();

    for id in ids {
        match fetch(id.clone()).await {
            Ok(message) => messages.push(message),
            Err(GmailError::MessageNotFound(_)) => {
                debug!("Message {} disappeared before it could be fetched", id);
            }
            Err(e @ GmailError::AuthError(_)) => return Err(e),
            Err(e) => {
                warn!("Skipping message {}: {}", id, e);
                skipped.push((id, e.to_string()));
            }
        }
    }
    Ok((messages, skipped))
}

async fn with_timeout<T>(
    operation_name: &str,
    call: impl Future<Output = std::result::Result<T, google_gmail1::Error>>,
) -> Result<std::result::Result<T, GmailError>> {
    match tokio::time::timeout(CALL_TIMEOUT, call).await {
        Ok(result) => Ok(result.map_err(GmailError::from)),
        Err(_) => {
            warn!("{} timed out after {:?}", operation_name, CALL_TIMEOUT);
            Err(GmailError::NetworkError(format!(
                "API call timed out after {:?}",
                CALL_TIMEOUT
            )))
        }
    }
}

/// Gmail API message into our read-only view
fn parse_message(msg: GmailMessage, labels: &LabelDirectory) -> Result<Message> {
    let id = msg
        .id
        .ok_or_else(|| GmailError::InvalidMessageFormat("Missing message ID".to_string()))?;
    let thread_id = msg.thread_id.unwrap_or_else(|| id.clone());

    let label_ids = msg.label_ids.unwrap_or_default();
    let in_inbox = label_ids.iter().any(|l| l == INBOX);
    let is_important = label_ids.iter().any(|l| l == IMPORTANT);
    let label_names = label_ids
        .iter()
        .map(|l| labels.name_for(l).to_string())
        .collect();

    let mut sender = String::new();
    let mut subject = String::new();
    let mut recipients = Vec::new();
    let mut date_header = None;

    let headers = msg
        .payload
        .as_ref()
        .and_then(|p| p.headers.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();
    for header in headers {
        if let (Some(name), Some(value)) = (&header.name, &header.value) {
            match name.to_lowercase().as_str() {
                "from" => sender = value.clone(),
                "subject" => subject = value.clone(),
                "to" | "cc" | "bcc" | "list-id" => recipients.push(value.clone()),
                "date" => date_header = Some(value.clone()),
                _ => {}
            }
        }
    }

    // internalDate is when Gmail received the message; the Date header is
    // sender-controlled and only a fallback
    let received_at = msg
        .internal_date
        .and_then(DateTime::from_timestamp_millis)
        .or_else(|| date_header.as_deref().and_then(|d| parse_date(d).ok()))
        .ok_or_else(|| {
            GmailError::InvalidMessageFormat(format!("Message {} has no usable date", id))
        })?;

    Ok(Message {
        id,
        thread_id,
        subject,
        sender,
        recipients,
        snippet: msg.snippet.unwrap_or_default(),
        received_at,
        is_important,
        labels: label_names,
        in_inbox,
    })
}

/// RFC 2822 date header, with RFC 3339 as fallback
/// Trailing `(UTC)` style comment some mailers append to Date
static DATE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\([^)]*\)\s*$").unwrap());

fn parse_date(date_str: &str) -> Result<DateTime<Utc>> {
    let trimmed = DATE_COMMENT.replace(date_str.trim(), "");
    DateTime::parse_from_rfc2822(&trimmed)
        .or_else(|_| DateTime::parse_from_rfc3339(&trimmed))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GmailError::InvalidMessageFormat(format!("Invalid date format: {}", e)))
}

#[async_trait]
impl MailQuery for ProductionGmailClient {
    async fn query_inbox_messages(
        &self,
        filter: &FilterExpr,
        page_size: u32,
    ) -> Result<MessagePage> {
        let query = filter.search_query();
        debug!("Listing Inbox with query {:?} (page size {})", query, page_size);

        let (ids, estimate, next) = self.list_ids(&query, page_size, None).await?;

        let (messages, skipped) = fetch_each(ids, |id| async move {
            let raw = self.get_message(&id).await?;
            let dir = self.label_directory().await?;
            parse_message(raw, &dir)
        })
        .await?;

        Ok(MessagePage {
            messages,
            skipped,
            result_size_estimate: estimate,
            more_available: next.is_some(),
        })
    }

    async fn important_inbox_ids(&self) -> Result<Vec<String>> {
        let mut all_ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let (ids, _, next) = self
                .list_ids("is:important", 500, page_token.as_deref())
                .await?;
            all_ids.extend(ids);
            page_token = next;
            if page_token.is_none() {
                break;
            }
        }

        debug!("Found {} important Inbox messages", all_ids.len());
        Ok(all_ids)
    }
}

#[async_trait]
impl MailMutation for ProductionGmailClient {
    async fn apply_label(&self, message_id: &str, label: &str) -> Result<()> {
        let label_id = self.resolve_label(label).await?;
        self.modify("apply_label", message_id, Some(vec![label_id]), None)
            .await
    }

    async fn mark_important(&self, message_id: &str) -> Result<()> {
        self.modify(
            "mark_important",
            message_id,
            Some(vec![IMPORTANT.to_string()]),
            None,
        )
        .await
    }

    async fn archive(&self, message_id: &str) -> Result<()> {
        self.modify("archive", message_id, None, Some(vec![INBOX.to_string()]))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::{MessagePart, MessagePartHeader};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn header(name: &str, value: &str) -> MessagePartHeader {
        MessagePartHeader {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    fn raw_message() -> GmailMessage {
        GmailMessage {
            id: Some("18c1".to_string()),
            thread_id: Some("18c0".to_string()),
            label_ids: Some(vec![
                "INBOX".to_string(),
                "IMPORTANT".to_string(),
                "Label_7".to_string(),
            ]),
            snippet: Some("Your statement is ready".to_string()),
            internal_date: Some(1_700_000_000_000),
            payload: Some(MessagePart {
                headers: Some(vec![
                    header("From", "Bank <alerts@bank.example>"),
                    header("To", "me@example.com"),
                    header("Cc", "partner@example.com"),
                    header("List-Id", "<alerts.bank.example>"),
                    header("Subject", "Statement"),
                    header("Date", "Mon, 24 Nov 2025 10:30:00 +0000"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_should_retry() {
        assert!(ProductionGmailClient::should_retry(&GmailError::ServerError {
            status: 500,
            message: "Internal error".to_string(),
        }));
        assert!(ProductionGmailClient::should_retry(
            &GmailError::RateLimitExceeded { retry_after: 0 }
        ));
        assert!(!ProductionGmailClient::should_retry(&GmailError::AuthError(
            "invalid token".to_string()
        )));
    }

    #[test]
    fn test_parse_message() {
        let dir = LabelDirectory::from_labels([LabelInfo {
            id: "Label_7".to_string(),
            name: "Finance".to_string(),
        }]);
        let msg = parse_message(raw_message(), &dir).unwrap();

        assert_eq!(msg.id, "18c1");
        assert_eq!(msg.thread_id, "18c0");
        assert_eq!(msg.sender, "Bank <alerts@bank.example>");
        assert_eq!(msg.subject, "Statement");
        assert_eq!(msg.recipients.len(), 3);
        assert!(msg.in_inbox);
        assert!(msg.is_important);
        assert!(msg.has_label("finance"));
        assert_eq!(msg.snippet, "Your statement is ready");
        assert_eq!(msg.received_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_message_falls_back_to_date_header() {
        let mut raw = raw_message();
        raw.internal_date = None;
        let msg = parse_message(raw, &LabelDirectory::new()).unwrap();
        assert_eq!(msg.received_at.to_rfc3339(), "2025-11-24T10:30:00+00:00");
        // unknown label ids are kept as-is
        assert!(msg.has_label("Label_7"));
    }

    #[test]
    fn test_parse_message_without_any_date_fails() {
        let mut raw = raw_message();
        raw.internal_date = None;
        raw.payload = None;
        assert!(matches!(
            parse_message(raw, &LabelDirectory::new()),
            Err(GmailError::InvalidMessageFormat(_))
        ));
    }

    #[test]
    fn test_parse_date() {
        assert!(parse_date("Mon, 24 Nov 2025 10:30:00 +0000").is_ok());
        assert!(parse_date("Mon, 24 Nov 2025 10:30:00 +0000 (UTC)").is_ok());
        assert!(parse_date("2025-11-24T10:30:00Z").is_ok());
        assert!(parse_date("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = ProductionGmailClient::with_retry("test_op", 3, Duration::from_millis(1), || {
            let count = Arc::clone(&counter);
            async move {
                if count.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GmailError::NetworkError("Connection timeout".to_string()))
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_fails_on_permanent_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = ProductionGmailClient::with_retry("test_op", 3, Duration::from_millis(1), || {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GmailError::Forbidden("denied".to_string()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_all_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = ProductionGmailClient::with_retry("test_op", 2, Duration::from_millis(1), || {
            let count = Arc::clone(&counter);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(GmailError::RateLimitExceeded { retry_after: 0 })
            }
        })
        .await;

        assert!(result.is_err());
        // initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    fn loaded(id: &str) -> Message {
        Message {
            id: id.to_string(),
            thread_id: id.to_string(),
            subject: String::new(),
            sender: String::new(),
            recipients: vec![],
            snippet: String::new(),
            received_at: Utc::now(),
            is_important: false,
            labels: vec![INBOX.to_string()],
            in_inbox: true,
        }
    }

    #[tokio::test]
    async fn test_fetch_each_keeps_going_past_a_failed_message() {
        let ids = ["a", "b", "gone", "c"].map(String::from).to_vec();
        let (messages, skipped) = fetch_each(ids, |id| async move {
            match id.as_str() {
                "b" => Err(GmailError::Forbidden("no access".to_string())),
                "gone" => Err(GmailError::MessageNotFound(id)),
                _ => Ok(loaded(&id)),
            }
        })
        .await
        .unwrap();

        let loaded_ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(loaded_ids, vec!["a", "c"]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].0, "b");
        assert!(skipped[0].1.contains("no access"));
    }

    #[tokio::test]
    async fn test_fetch_each_stops_on_auth_failure() {
        let ids = ["a", "b"].map(String::from).to_vec();
        let result = fetch_each(ids, |id| async move {
            if id == "a" {
                Err(GmailError::AuthError("token revoked".to_string()))
            } else {
                Ok(loaded(&id))
            }
        })
        .await;

        assert!(matches!(result, Err(GmailError::AuthError(_))));
    }
}
