use chrono::{DateTime, Utc};

use crate::models::{Action, Message};
use crate::protection::ProtectionSet;
use crate::rules::{CompiledRule, Retention};

/// Decides what happens to a matched message
///
/// The clock is fixed when the policy is built so every decision in a run
/// sees the same `now`.
#[derive(Debug, Clone, Copy)]
pub struct ArchivalPolicy {
    now: DateTime<Utc>,
}

impl ArchivalPolicy {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    /// Protection wins over everything, then importance marking, then
    /// retention. An importance-marking match protects the message at once.
    pub fn decide(
        &self,
        message: &Message,
        rule: &CompiledRule,
        protection: &mut ProtectionSet,
    ) -> Action {
        if protection.contains(&message.id) {
            return Action::WontArchive;
        }

        if rule.mark_important {
            protection.add(message.id.as_str());
            return Action::MarkedImportant;
        }

        match rule.retention {
            Retention::Never => Action::None,
            Retention::Immediately => Action::Archived,
            Retention::AfterDays(days) => {
                if message.age_days(self.now) >= i64::from(days) {
                    Action::Archived
                } else {
                    Action::WillArchiveLater
                }
            }
        }
    }
}
