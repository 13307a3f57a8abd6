//! Two-way label name/id lookup
//!
//! Gmail reports labels on messages by id and accepts ids in modify calls,
//! while rules and reports speak label names. System labels (INBOX,
//! IMPORTANT, ...) use the same string for both.

use std::collections::HashMap;

pub const INBOX: &str = "INBOX";
pub const IMPORTANT: &str = "IMPORTANT";

/// Key under which two label names count as the same label.
/// Unicode lower-casing, so "Économie" and "ÉCONOMIE" collide.
pub fn label_key(name: &str) -> String {
    name.to_lowercase()
}

pub fn same_label(a: &str, b: &str) -> bool {
    label_key(a) == label_key(b)
}

#[derive(Debug, Clone)]
pub struct LabelInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Default, Clone)]
pub struct LabelDirectory {
    /// label_key(name) -> id
    by_name: HashMap<String, String>,
    /// id -> display name
    by_id: HashMap<String, String>,
}

impl LabelDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_labels(labels: impl IntoIterator<Item = LabelInfo>) -> Self {
        let mut dir = Self::new();
        for label in labels {
            dir.insert(label);
        }
        dir
    }

    pub fn insert(&mut self, label: LabelInfo) {
        self.by_name.insert(label_key(&label.name), label.id.clone());
        self.by_id.insert(label.id, label.name);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Case-insensitive lookup by name
    pub fn id_for(&self, name: &str) -> Option<&str> {
        self.by_name.get(&label_key(name)).map(String::as_str)
    }

    /// Display name for an id; unknown ids are returned unchanged
    pub fn name_for<'a>(&'a self, id: &'a str) -> &'a str {
        self.by_id.get(id).map(String::as_str).unwrap_or(id)
    }

    /// Ancestors of a nested `A/B/C` name that do not exist yet, outermost first
    pub fn missing_parents(&self, name: &str) -> Vec<String> {
        let parts: Vec<&str> = name.split('/').collect();
        (1..parts.len())
            .map(|i| parts[..i].join("/"))
            .filter(|parent| self.id_for(parent).is_none())
            .collect()
    }
}
