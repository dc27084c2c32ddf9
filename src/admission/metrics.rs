//! Admission counters.
//!
//! Counters are mutated only by the manager; readers get an owned snapshot
//! and never touch live state.

use std::collections::HashMap;

use serde::Serialize;

/// Live counters owned by the manager.
#[derive(Debug, Default)]
pub(crate) struct MetricsInner {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub throttled_requests: u64,
    pub queued_requests: u64,
    /// Times each rule throttled a request, keyed by rule id.
    pub rule_triggers: HashMap<String, u64>,
}

impl MetricsInner {
    pub fn register_rule(&mut self, rule_id: &str) {
        self.rule_triggers.entry(rule_id.to_string()).or_insert(0);
    }

    pub fn record_trigger(&mut self, rule_id: &str) {
        *self.rule_triggers.entry(rule_id.to_string()).or_insert(0) += 1;
    }

    pub fn remove_rule(&mut self, rule_id: &str) {
        self.rule_triggers.remove(rule_id);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests,
            allowed_requests: self.allowed_requests,
            throttled_requests: self.throttled_requests,
            queued_requests: self.queued_requests,
            rule_triggers: self.rule_triggers.clone(),
        }
    }

    pub fn reset(&mut self) {
        let rule_ids: Vec<String> = self.rule_triggers.keys().cloned().collect();
        *self = MetricsInner::default();
        for id in rule_ids {
            self.rule_triggers.insert(id, 0);
        }
    }
}

/// A point-in-time copy of the admission counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Requests seen by `check_request`.
    pub total_requests: u64,
    /// Requests admitted without any rule blocking.
    pub allowed_requests: u64,
    /// Requests blocked by at least one rule.
    pub throttled_requests: u64,
    /// Throttled requests dispatched to queue handling.
    pub queued_requests: u64,
    /// Per-rule throttle counts.
    pub rule_triggers: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_a_copy() {
        let mut inner = MetricsInner::default();
        inner.total_requests = 3;
        inner.record_trigger("r1");

        let snapshot = inner.snapshot();
        inner.total_requests = 10;
        inner.record_trigger("r1");

        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.rule_triggers.get("r1"), Some(&1));
    }

    #[test]
    fn test_reset_keeps_registered_rules() {
        let mut inner = MetricsInner::default();
        inner.register_rule("r1");
        inner.total_requests = 5;
        inner.record_trigger("r1");

        inner.reset();
        assert_eq!(inner.total_requests, 0);
        assert_eq!(inner.rule_triggers.get("r1"), Some(&0));
    }
}
