use std::collections::{HashMap, HashSet};

use uuid::Uuid;

/// Per-connection topic interest.
///
/// `messages.subscribe` adds the exact topic of one room;
/// `events.subscribe` accepts patterns. Events are only delivered if they
/// match at least one active subscription.
///
/// Matching rules:
/// - Exact match: `"room.<id>.messages"` matches only that topic.
/// - Prefix match with `*` wildcard: `"room.*"` matches any topic
///   starting with `"room."`.
/// - Bare `"*"` matches all topics.
#[derive(Debug, Default)]
pub struct TopicFilter {
    /// subscription_id → pattern
    subscriptions: HashMap<Uuid, String>,
    prefix_index: HashMap<String, HashSet<Uuid>>,
    exact_index: HashMap<String, HashSet<Uuid>>,
    catch_all: HashSet<Uuid>,
}

impl TopicFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns a subscription ID.
    pub fn subscribe(&mut self, pattern: impl Into<String>) -> Uuid {
        let pattern = pattern.into();
        let sub_id = Uuid::new_v4();

        if pattern == "*" {
            self.catch_all.insert(sub_id);
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            self.prefix_index
                .entry(format!("{prefix}."))
                .or_default()
                .insert(sub_id);
        } else {
            self.exact_index
                .entry(pattern.clone())
                .or_default()
                .insert(sub_id);
        }

        self.subscriptions.insert(sub_id, pattern);
        sub_id
    }

    pub fn unsubscribe(&mut self, sub_id: Uuid) -> bool {
        let Some(pattern) = self.subscriptions.remove(&sub_id) else {
            return false;
        };

        if pattern == "*" {
            self.catch_all.remove(&sub_id);
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            let prefix_with_dot = format!("{prefix}.");
            if let Some(set) = self.prefix_index.get_mut(&prefix_with_dot) {
                set.remove(&sub_id);
                if set.is_empty() {
                    self.prefix_index.remove(&prefix_with_dot);
                }
            }
        } else if let Some(set) = self.exact_index.get_mut(&pattern) {
            set.remove(&sub_id);
            if set.is_empty() {
                self.exact_index.remove(&pattern);
            }
        }

        true
    }

    pub fn matches(&self, topic: &str) -> bool {
        if !self.catch_all.is_empty() {
            return true;
        }
        if self
            .exact_index
            .get(topic)
            .is_some_and(|set| !set.is_empty())
        {
            return true;
        }
        self.prefix_index
            .keys()
            .any(|prefix| topic.starts_with(prefix))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
