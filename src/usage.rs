//! Most recent matched message date per rule
//!
//! Stored as `rules_usage.json` in the data directory, keyed and sorted by
//! rule name. Useful for spotting rules that no longer match anything.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{GmailError, Result};
use crate::report::{list_report_files, RunReport};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RulesUsage {
    last_matched: BTreeMap<String, DateTime<Utc>>,
}

impl RulesUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A missing file is an empty history
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let json = tokio::fs::read_to_string(path).await?;
        let last_matched = serde_json::from_str(&json).map_err(|e| {
            GmailError::ConfigError(format!("Failed to parse rules usage file {:?}: {}", path, e))
        })?;
        Ok(Self { last_matched })
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&self.last_matched)?;
        tokio::fs::write(path, json).await?;
        debug!("Saved rules usage to {:?}", path);
        Ok(())
    }

    /// Keep the newer of the stored and given dates. Returns true on change.
    pub fn record(&mut self, rule_name: &str, date: DateTime<Utc>) -> bool {
        match self.last_matched.get(rule_name) {
            Some(existing) if *existing >= date => false,
            _ => {
                self.last_matched.insert(rule_name.to_string(), date);
                true
            }
        }
    }

    /// Fold every record of a report in; returns the number of updates
    pub fn update_from_report(&mut self, report: &RunReport) -> usize {
        report
            .emails
            .iter()
            .filter(|e| self.record(&e.rule_name, e.date))
            .count()
    }

    /// Rebuild from every `processed_*.json` in the directory.
    /// Unreadable reports are skipped with a warning.
    pub async fn rebuild_from_dir(dir: &Path) -> Result<(Self, usize)> {
        let mut usage = Self::new();
        let files = list_report_files(dir).await?;
        let mut scanned = 0;
        for file in &files {
            match RunReport::load(file).await {
                Ok(report) => {
                    usage.update_from_report(&report);
                    scanned += 1;
                }
                Err(e) => warn!("Skipping {:?}: {}", file, e),
            }
        }
        info!(
            "Rebuilt rules usage from {} of {} report files",
            scanned,
            files.len()
        );
        Ok((usage, scanned))
    }

    pub fn get(&self, rule_name: &str) -> Option<DateTime<Utc>> {
        self.last_matched.get(rule_name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DateTime<Utc>)> {
        self.last_matched.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.last_matched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_matched.is_empty()
    }
}
