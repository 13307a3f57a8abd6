use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use crate::error::{GmailError, Result};
use crate::filter::FilterExpr;

fn default_inbox_days() -> i64 {
    -1
}

fn default_enabled() -> bool {
    true
}

/// A rule as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub filter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub mark_important: bool,
    /// -1 never archive, 0 archive immediately, N archive after N days
    #[serde(default = "default_inbox_days")]
    pub inbox_days: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// How long a matched message may stay in the Inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    Never,
    Immediately,
    AfterDays(u32),
}

impl Retention {
    pub fn from_inbox_days(days: i64) -> std::result::Result<Self, String> {
        match days {
            -1 => Ok(Retention::Never),
            0 => Ok(Retention::Immediately),
            n if n > 0 => u32::try_from(n)
                .map(Retention::AfterDays)
                .map_err(|_| format!("inbox_days {} is too large", n)),
            n => Err(format!("inbox_days must be -1, 0 or a positive number of days (got {})", n)),
        }
    }
}

impl Rule {
    /// Validate and parse the filter
    pub fn compile(&self) -> Result<CompiledRule> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(GmailError::rule_config("<unnamed>", "name must not be empty"));
        }

        let filter = FilterExpr::parse(&self.filter)
            .map_err(|e| GmailError::rule_config(name, format!("filter: {}", e)))?;

        let label = match &self.label {
            Some(l) if l.trim().is_empty() => {
                return Err(GmailError::rule_config(name, "label must not be empty when set"))
            }
            Some(l) => Some(l.trim().to_string()),
            None => None,
        };

        let retention = Retention::from_inbox_days(self.inbox_days)
            .map_err(|reason| GmailError::rule_config(name, reason))?;

        Ok(CompiledRule {
            name: name.to_string(),
            filter,
            label,
            mark_important: self.mark_important,
            retention,
            enabled: self.enabled,
        })
    }
}

/// A validated rule, ready for the engine
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub filter: FilterExpr,
    pub label: Option<String>,
    pub mark_important: bool,
    pub retention: Retention,
    pub enabled: bool,
}

/// All rules in configuration order
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile every rule; the first invalid one aborts loading
    pub fn compile(rules: &[Rule]) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let rule = rule.compile()?;
            if !seen.insert(rule.name.to_lowercase()) {
                warn!("Duplicate rule name '{}'; statistics will be reported separately", rule.name);
            }
            compiled.push(rule);
        }
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter().filter(|r| r.enabled)
    }

    pub fn disabled_count(&self) -> usize {
        self.rules.iter().filter(|r| !r.enabled).count()
    }

    /// Enabled rules split into (importance-marking, other), each in
    /// configuration order and paired with its position among the enabled
    /// rules
    pub fn partition_by_importance(&self) -> (Vec<(usize, &CompiledRule)>, Vec<(usize, &CompiledRule)>) {
        self.enabled().enumerate().partition(|(_, r)| r.mark_important)
    }
}
