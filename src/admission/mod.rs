//! Admission control: rule matching, rate limiting, queuing, and adaptive
//! throttling.

mod context;
mod limiter;
mod manager;
mod metrics;
mod queue;
mod rule;

pub use context::{Priority, RequestContext};
pub use limiter::{Decision, Limiter};
pub use manager::{AdmissionManager, LoadProvider, RuleStatus};
pub use metrics::MetricsSnapshot;
pub use queue::{AdmissionQueue, DownstreamProcessor, DEFAULT_MAX_QUEUE_SIZE};
pub use rule::{Algorithm, Rule, RuleConditions, RuleLimits, RuleUpdate, Scope, Strategy};
