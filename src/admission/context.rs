//! Request context and priority levels.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Priority of a unit of work, highest first.
///
/// The ordering drives both admission-queue bucket selection and the
/// `prioritize` strategy's demotion logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Bucket index used by the admission queue: 0 (critical) through 3 (low).
    pub fn bucket_index(&self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{}", s)
    }
}

/// The input of one admission decision.
///
/// Read-only to the limiter core; only the `degrade` and `prioritize`
/// strategy handlers mutate it (metadata annotation, priority demotion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    /// Unique request identifier.
    pub id: String,
    /// Authenticated user, if any.
    pub user_id: Option<String>,
    /// Source IP address, if known.
    pub source_ip: Option<String>,
    /// Name of the operation being performed.
    pub operation: String,
    /// Request path.
    pub path: String,
    /// HTTP method or equivalent verb, if applicable.
    pub method: Option<String>,
    /// Request priority.
    pub priority: Priority,
    /// Arrival time in monotonic milliseconds.
    pub arrived_at_ms: u64,
    /// Free-form metadata. The `degrade` handler writes `degraded = "true"`
    /// here; the `tenant` scope reads the `tenant` key.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    /// Create a context for `operation` on `path` with a generated id and
    /// medium priority.
    pub fn new(operation: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            source_ip: None,
            operation: operation.into(),
            path: path.into(),
            method: None,
            priority: Priority::Medium,
            arrived_at_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Set the user id.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the source IP.
    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    /// Set the method.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the arrival timestamp.
    pub fn with_arrival(mut self, arrived_at_ms: u64) -> Self {
        self.arrived_at_ms = arrived_at_ms;
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether a degrade handler has flagged this request for the
    /// reduced-cost code path.
    pub fn is_degraded(&self) -> bool {
        self.metadata.get("degraded").map(String::as_str) == Some("true")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_bucket_index_order() {
        assert_eq!(Priority::Critical.bucket_index(), 0);
        assert_eq!(Priority::High.bucket_index(), 1);
        assert_eq!(Priority::Medium.bucket_index(), 2);
        assert_eq!(Priority::Low.bucket_index(), 3);
    }

    #[test]
    fn test_priority_serde_lowercase() {
        let p: Priority = serde_yaml::from_str("critical").unwrap();
        assert_eq!(p, Priority::Critical);
        assert_eq!(serde_yaml::to_string(&Priority::Low).unwrap().trim(), "low");
    }

    #[test]
    fn test_context_builder() {
        let ctx = RequestContext::new("search", "/api/search")
            .with_user("alice")
            .with_source_ip("10.0.0.1")
            .with_method("GET")
            .with_priority(Priority::High)
            .with_metadata("tenant", "acme");

        assert_eq!(ctx.operation, "search");
        assert_eq!(ctx.path, "/api/search");
        assert_eq!(ctx.user_id.as_deref(), Some("alice"));
        assert_eq!(ctx.priority, Priority::High);
        assert_eq!(ctx.metadata.get("tenant").map(String::as_str), Some("acme"));
        assert!(!ctx.id.is_empty());
        assert!(!ctx.is_degraded());
    }
}
