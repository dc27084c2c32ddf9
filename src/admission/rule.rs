//! Rate limit rules: configuration, matching, and scope-key derivation.
//!
//! Rules are plain serde structs so they can be defined in YAML alongside the
//! rest of the configuration, or registered programmatically at runtime.

use serde::{Deserialize, Serialize};

use super::context::{Priority, RequestContext};

/// The identity a rule's limit is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One shared limit for all traffic.
    Global,
    /// Per authenticated user ("anonymous" when absent).
    User,
    /// Per source IP ("unknown" when absent).
    Ip,
    /// Per operation name.
    Operation,
    /// Per request path.
    Resource,
    /// Per tenant from request metadata ("default" when absent).
    Tenant,
}

/// The rate-limiting algorithm a rule uses.
///
/// `Adaptive` is token-bucket arithmetic whose `requests` limit is
/// periodically rescaled by the manager's feedback loop; it is not a fifth
/// algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    LeakyBucket,
    FixedWindow,
    Adaptive,
}

/// What to do with a request the rule throttles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Deny the request outright.
    Reject,
    /// Hold the request in the priority admission queue.
    Queue,
    /// Admit, but tell the caller to wait `estimated_delay_ms` first.
    Delay,
    /// Admit, flagging the context for a reduced-cost code path.
    Degrade,
    /// Demote the request's priority, then queue it.
    Prioritize,
}

/// Numeric limits for a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleLimits {
    /// Requests allowed per window.
    pub requests: u64,
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Token-bucket burst capacity. Defaults to `requests` when unset.
    #[serde(default)]
    pub burst: Option<u64>,
}

impl RuleLimits {
    /// Effective bucket capacity (`burst` when set, otherwise `requests`).
    pub fn capacity(&self) -> u64 {
        self.burst.unwrap_or(self.requests)
    }
}

/// Optional match conditions narrowing which requests a rule applies to.
///
/// All configured conditions must hold for the rule to apply. An empty list
/// means that condition is not checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConditions {
    /// Path prefixes; the request path must start with one of them.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Methods; the request method must be among them.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Required priority; must equal the request's priority exactly.
    #[serde(default)]
    pub priority: Option<Priority>,
}

/// A single admission-control rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    /// Unique rule identifier.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Identity the limit is keyed on.
    pub scope: Scope,
    /// Rate-limiting algorithm.
    pub algorithm: Algorithm,
    /// What to do with throttled requests.
    pub strategy: Strategy,
    /// Disabled rules never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Numeric limits.
    pub limits: RuleLimits,
    /// Optional match conditions.
    #[serde(default)]
    pub conditions: Option<RuleConditions>,
    /// Evaluation-order priority (lower sorts first). Rules with equal
    /// priority keep insertion order.
    #[serde(default)]
    pub priority: u32,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Whether this rule applies to the given request context.
    ///
    /// A rule applies iff it is enabled and either has no conditions or all
    /// configured conditions hold.
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.enabled {
            return false;
        }

        let Some(conditions) = &self.conditions else {
            return true;
        };

        if !conditions.paths.is_empty()
            && !conditions.paths.iter().any(|p| ctx.path.starts_with(p))
        {
            return false;
        }

        if !conditions.methods.is_empty() {
            match &ctx.method {
                Some(method) if conditions.methods.contains(method) => {}
                _ => return false,
            }
        }

        if let Some(required) = conditions.priority {
            if ctx.priority != required {
                return false;
            }
        }

        true
    }

    /// Derive the scope key for this rule from a request context.
    pub fn scope_key(&self, ctx: &RequestContext) -> String {
        match self.scope {
            Scope::Global => "global".to_string(),
            Scope::User => ctx
                .user_id
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
            Scope::Ip => ctx
                .source_ip
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            Scope::Operation => ctx.operation.clone(),
            Scope::Resource => ctx.path.clone(),
            Scope::Tenant => ctx
                .metadata
                .get("tenant")
                .cloned()
                .unwrap_or_else(|| "default".to_string()),
        }
    }

    /// Whether this rule participates in adaptive limit rescaling.
    pub fn is_adaptive(&self) -> bool {
        self.algorithm == Algorithm::Adaptive
    }
}

/// A partial rule update. `None` fields are left unchanged by
/// `AdmissionManager::update_rule`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub scope: Option<Scope>,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub strategy: Option<Strategy>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub limits: Option<RuleLimits>,
    #[serde(default)]
    pub conditions: Option<RuleConditions>,
    #[serde(default)]
    pub priority: Option<u32>,
}
