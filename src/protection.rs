//! Message ids that must not be archived during the current run
//!
//! Seeded from the Inbox messages Gmail already flags as important, then
//! grown by every importance-marking rule match. Ids are never removed.

use std::collections::HashSet;

#[derive(Debug, Default, Clone)]
pub struct ProtectionSet {
    ids: HashSet<String>,
}

impl ProtectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from the ids returned by the important-messages query
    pub fn seeded<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        set.seed(ids);
        set
    }

    pub fn seed<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for id in ids {
            self.add(id);
        }
    }

    /// Returns true if the id was not already protected
    pub fn add(&mut self, id: impl Into<String>) -> bool {
        self.ids.insert(id.into())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
