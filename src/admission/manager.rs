//! The admission manager: rule registry, limiter orchestration, strategy
//! dispatch, and the adaptive feedback loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::GatehouseConfig;
use crate::error::{GatehouseError, Result};

use super::context::{Priority, RequestContext};
use super::limiter::{Decision, Limiter};
use super::metrics::{MetricsInner, MetricsSnapshot};
use super::queue::{AdmissionQueue, DownstreamProcessor};
use super::rule::{Algorithm, Rule, RuleUpdate, Strategy};

/// Multiplicative shrink applied to adaptive rules when load exceeds the
/// threshold.
const ADAPTIVE_SHRINK_FACTOR: f64 = 0.9;
/// Multiplicative growth applied when load drops below half the threshold.
const ADAPTIVE_GROW_FACTOR: f64 = 1.1;
/// Adaptive limits never shrink below this fraction of the original limit.
const ADAPTIVE_FLOOR_FRACTION: f64 = 0.1;
/// Adaptive limits never grow beyond this multiple of the original limit.
const ADAPTIVE_CAP_MULTIPLE: u64 = 2;

/// An external source of the current system load (0.0 to 1.0). When set, the
/// adaptive loop uses it instead of the default throttle-ratio heuristic.
pub trait LoadProvider: Send + Sync {
    /// Current system load in `0.0..=1.0`.
    fn current_load(&self) -> f64;
}

/// Per-rule status returned by [`AdmissionManager::get_rule_status`].
#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    /// The rule as currently configured (adaptive rescaling included).
    pub rule: Rule,
    /// Number of live limiters keyed under this rule.
    pub active_limiters: usize,
    /// Times this rule has throttled a request.
    pub triggered: u64,
}

/// Orchestrates admission control: matches requests against rules, evaluates
/// one limiter per (rule id, scope key), aggregates the most restrictive
/// decision, dispatches the winning rule's strategy, and periodically
/// rescales adaptive rules against observed load.
///
/// The manager is the sole mutator of rules, limiters, queues, and counters;
/// it is thread-safe and intended to be shared behind an `Arc`.
pub struct AdmissionManager {
    /// Rules in evaluation order: stable-sorted by rule priority, insertion
    /// order among equals.
    rules: RwLock<Vec<Rule>>,
    /// One limiter per (rule id, scope key). Idle keys are never expired.
    limiters: DashMap<(String, String), Limiter>,
    /// One admission queue per rule that queues throttled requests.
    queues: DashMap<String, Arc<AdmissionQueue>>,
    /// Original `limits.requests` per rule, anchoring the adaptive floor/cap.
    baselines: DashMap<String, u64>,
    metrics: Mutex<MetricsInner>,
    clock: Arc<dyn Clock>,
    load_provider: RwLock<Option<Arc<dyn LoadProvider>>>,
    processor: RwLock<Option<Arc<dyn DownstreamProcessor>>>,
    adaptive_enabled: AtomicBool,
    load_threshold: Mutex<f64>,
    adaptive_interval: Duration,
    max_queue_size: usize,
    /// (total, throttled) counters as of the previous adaptive cycle.
    last_cycle_counts: Mutex<(u64, u64)>,
}

impl AdmissionManager {
    /// Create a manager with default configuration and no rules.
    pub fn new() -> Self {
        Self::with_config(GatehouseConfig::default())
    }

    /// Create a manager from configuration, registering its rules.
    pub fn with_config(config: GatehouseConfig) -> Self {
        let manager = Self {
            rules: RwLock::new(Vec::new()),
            limiters: DashMap::new(),
            queues: DashMap::new(),
            baselines: DashMap::new(),
            metrics: Mutex::new(MetricsInner::default()),
            clock: Arc::new(MonotonicClock::new()),
            load_provider: RwLock::new(None),
            processor: RwLock::new(None),
            adaptive_enabled: AtomicBool::new(config.adaptive_enabled),
            load_threshold: Mutex::new(config.load_threshold.clamp(0.0, 1.0)),
            adaptive_interval: Duration::from_millis(config.adaptive_interval_ms),
            max_queue_size: config.max_queue_size,
            last_cycle_counts: Mutex::new((0, 0)),
        };
        for rule in config.rules {
            manager.add_rule(rule);
        }
        manager
    }

    /// Replace the clock. Intended for tests; must be called before any
    /// limiter state exists.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the downstream processor handed to admission queues created from
    /// this point on.
    pub fn set_processor(&self, processor: Arc<dyn DownstreamProcessor>) {
        *self.processor.write() = Some(processor);
    }

    /// Set the external system-load provider used by the adaptive loop.
    pub fn set_load_provider(&self, provider: Arc<dyn LoadProvider>) {
        *self.load_provider.write() = Some(provider);
    }

    /// Enable or disable adaptive limit adjustment.
    pub fn set_adaptive_adjustment(&self, enabled: bool) {
        self.adaptive_enabled.store(enabled, Ordering::SeqCst);
        info!(enabled = enabled, "Adaptive adjustment toggled");
    }

    /// Set the load threshold above which adaptive rules shrink. Clamped to
    /// `0.0..=1.0`.
    pub fn set_system_load_threshold(&self, threshold: f64) {
        *self.load_threshold.lock() = threshold.clamp(0.0, 1.0);
    }

    // ---- Rule CRUD -------------------------------------------------------

    /// Register a rule. A rule with the same id is replaced, keeping its
    /// limiter keys but resetting their state.
    pub fn add_rule(&self, rule: Rule) {
        info!(rule_id = %rule.id, algorithm = ?rule.algorithm, strategy = ?rule.strategy, "Adding rule");
        self.baselines.insert(rule.id.clone(), rule.limits.requests);
        self.metrics.lock().register_rule(&rule.id);

        let mut rules = self.rules.write();
        if let Some(existing) = rules.iter().position(|r| r.id == rule.id) {
            rules.remove(existing);
            drop(rules);
            self.reset_rule_limiters(&rule.id, rule.algorithm, rule.limits, self.clock.now_ms());
            rules = self.rules.write();
        }
        rules.push(rule);
        // Stable sort: rules with equal priority keep insertion order.
        rules.sort_by_key(|r| r.priority);
    }

    /// Remove a rule and discard every limiter and queue keyed under its id.
    /// Returns whether the rule existed.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let removed = {
            let mut rules = self.rules.write();
            let before = rules.len();
            rules.retain(|r| r.id != rule_id);
            rules.len() != before
        };
        if !removed {
            return false;
        }

        self.limiters.retain(|key, _| key.0 != rule_id);
        if let Some((_, queue)) = self.queues.remove(rule_id) {
            queue.clear();
        }
        self.baselines.remove(rule_id);
        self.metrics.lock().remove_rule(rule_id);

        info!(rule_id = %rule_id, "Removed rule");
        true
    }

    /// Merge a partial update into a rule. If the algorithm or limits
    /// changed, every existing limiter for the rule is reconfigured in place
    /// (keys keep their identity); a limits change also refreshes the
    /// adaptive baseline. Returns whether the rule existed.
    pub fn update_rule(&self, rule_id: &str, update: RuleUpdate) -> bool {
        let reconfigured = {
            let mut rules = self.rules.write();
            let Some(rule) = rules.iter_mut().find(|r| r.id == rule_id) else {
                return false;
            };

            if let Some(name) = update.name {
                rule.name = name;
            }
            if let Some(scope) = update.scope {
                rule.scope = scope;
            }
            if let Some(strategy) = update.strategy {
                rule.strategy = strategy;
            }
            if let Some(enabled) = update.enabled {
                rule.enabled = enabled;
            }
            if let Some(conditions) = update.conditions {
                rule.conditions = Some(conditions);
            }
            if let Some(priority) = update.priority {
                rule.priority = priority;
            }

            let changed_algorithm = match update.algorithm {
                Some(algorithm) if algorithm != rule.algorithm => {
                    rule.algorithm = algorithm;
                    true
                }
                _ => false,
            };
            let changed_limits = match update.limits {
                Some(limits) if limits != rule.limits => {
                    rule.limits = limits;
                    true
                }
                _ => false,
            };
            let reconfigured = (changed_algorithm || changed_limits)
                .then_some((rule.algorithm, rule.limits, changed_limits));
            rules.sort_by_key(|r| r.priority);
            reconfigured
        };

        if let Some((algorithm, limits, changed_limits)) = reconfigured {
            debug!(
                rule_id = %rule_id,
                algorithm = ?algorithm,
                requests = limits.requests,
                "Rule reconfigured, resetting limiters"
            );
            if changed_limits {
                self.baselines.insert(rule_id.to_string(), limits.requests);
            }
            self.reset_rule_limiters(rule_id, algorithm, limits, self.clock.now_ms());
        }
        true
    }

    /// Reconfigure (not recreate) every limiter keyed under a rule.
    fn reset_rule_limiters(
        &self,
        rule_id: &str,
        algorithm: Algorithm,
        limits: super::rule::RuleLimits,
        now_ms: u64,
    ) {
        for mut entry in self.limiters.iter_mut() {
            if entry.key().0 == rule_id {
                entry.value_mut().reconfigure(algorithm, limits, now_ms);
            }
        }
    }

    // ---- Admission -------------------------------------------------------

    /// Decide admission for one request, consuming one token per matching
    /// rule.
    pub fn check_request(&self, ctx: &mut RequestContext) -> Decision {
        self.check_request_with_cost(ctx, 1)
    }

    /// Decide admission for a request costing `tokens` per matching rule.
    pub fn check_request_with_cost(&self, ctx: &mut RequestContext, tokens: u64) -> Decision {
        let now_ms = self.clock.now_ms();
        self.metrics.lock().total_requests += 1;

        let matching: Vec<Rule> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.matches(ctx))
            .cloned()
            .collect();

        let mut blocked: Vec<(Rule, Decision)> = Vec::new();
        let mut min_remaining = u64::MAX;
        let mut max_reset = now_ms;
        let mut max_delay: Option<u64> = None;

        for rule in &matching {
            let key = (rule.id.clone(), rule.scope_key(ctx));
            let decision = {
                let mut limiter = self
                    .limiters
                    .entry(key)
                    .or_insert_with(|| Limiter::new(rule.algorithm, rule.limits, now_ms));
                limiter.check(now_ms, tokens)
            };

            if decision.allowed {
                min_remaining = min_remaining.min(decision.remaining);
                max_reset = max_reset.max(decision.reset_at_ms);
                if let Some(delay) = decision.estimated_delay_ms {
                    max_delay = Some(max_delay.unwrap_or(0).max(delay));
                }
            } else {
                trace!(rule_id = %rule.id, request_id = %ctx.id, "Rule throttled request");
                self.metrics.lock().record_trigger(&rule.id);
                blocked.push((rule.clone(), decision));
            }
        }

        if blocked.is_empty() {
            self.metrics.lock().allowed_requests += 1;
            let mut decision = Decision::allow_unlimited(now_ms);
            decision.remaining = min_remaining;
            decision.reset_at_ms = max_reset;
            // Leaky-bucket admissions carry their smoothing delay through.
            if let Some(delay) = max_delay {
                decision.strategy = Some(Strategy::Delay);
                decision.estimated_delay_ms = Some(delay);
            }
            return decision;
        }

        self.metrics.lock().throttled_requests += 1;

        // Most restrictive: largest retry_after wins; ties keep the first
        // rule in evaluation order.
        let throttled_by: Vec<String> = blocked.iter().map(|(r, _)| r.id.clone()).collect();
        let mut winner_index = 0;
        for (i, (_, d)) in blocked.iter().enumerate().skip(1) {
            if d.retry_after_ms.unwrap_or(0)
                > blocked[winner_index].1.retry_after_ms.unwrap_or(0)
            {
                winner_index = i;
            }
        }
        let (winner, mut decision) = blocked.swap_remove(winner_index);
        decision.throttled_by = throttled_by;

        debug!(
            rule_id = %winner.id,
            request_id = %ctx.id,
            strategy = ?winner.strategy,
            retry_after_ms = ?decision.retry_after_ms,
            "Request throttled"
        );

        self.apply_strategy(&winner, decision, ctx)
    }

    /// Apply the winning rule's strategy to a blocking decision.
    fn apply_strategy(&self, rule: &Rule, mut decision: Decision, ctx: &mut RequestContext) -> Decision {
        match rule.strategy {
            Strategy::Reject => {
                decision.strategy = Some(Strategy::Reject);
                decision
            }
            Strategy::Queue => {
                decision.strategy = Some(Strategy::Queue);
                self.queue_estimate(rule, decision)
            }
            Strategy::Delay => {
                decision.strategy = Some(Strategy::Delay);
                decision.allowed = true;
                decision.estimated_delay_ms = decision.retry_after_ms;
                decision
            }
            Strategy::Degrade => {
                decision.strategy = Some(Strategy::Degrade);
                decision.allowed = true;
                ctx.metadata
                    .insert("degraded".to_string(), "true".to_string());
                decision
            }
            Strategy::Prioritize => {
                if ctx.priority != Priority::Critical {
                    ctx.priority = Priority::Low;
                }
                decision.strategy = Some(Strategy::Prioritize);
                self.queue_estimate(rule, decision)
            }
        }
    }

    /// Attach a queue-position estimate. The request stays blocked; actual
    /// sequencing only happens if the caller enqueues it.
    fn queue_estimate(&self, rule: &Rule, mut decision: Decision) -> Decision {
        self.metrics.lock().queued_requests += 1;
        let depth = self.queue_for(&rule.id).len();
        decision.queue_position = Some(depth + 1);
        decision
    }

    /// Hand a throttled request to the rule's admission queue. The returned
    /// channel resolves with the downstream processor's outcome.
    pub fn enqueue(
        &self,
        rule_id: &str,
        ctx: RequestContext,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        if !self.rules.read().iter().any(|r| r.id == rule_id) {
            return Err(GatehouseError::UnknownRule(rule_id.to_string()));
        }
        self.queue_for(rule_id).enqueue(ctx, self.clock.now_ms())
    }

    fn queue_for(&self, rule_id: &str) -> Arc<AdmissionQueue> {
        self.queues
            .entry(rule_id.to_string())
            .or_insert_with(|| {
                Arc::new(AdmissionQueue::new(
                    self.max_queue_size,
                    self.processor.read().clone(),
                ))
            })
            .clone()
    }

    // ---- Adaptive adjustment ---------------------------------------------

    /// Spawn the periodic adaptive-adjustment task. The task runs for the
    /// life of the returned handle; abort it to stop.
    pub fn spawn_adaptive_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.adaptive_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so the first real cycle
            // sees a full interval of traffic.
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.run_adaptive_cycle();
            }
        })
    }

    /// Run one adaptive-adjustment cycle.
    ///
    /// Computes the system load, derives a multiplicative adjustment factor,
    /// and rewrites every adaptive rule's `limits.requests` in place,
    /// clamped between 10% and 200% of the rule's original limit. A factor
    /// of 1.0 performs no rewrite, so repeated cycles under unchanged load
    /// are idempotent once converged. Each rule is adjusted
    /// apply-or-no-op; a skipped rule never leaves partial state.
    pub fn run_adaptive_cycle(&self) {
        if !self.adaptive_enabled.load(Ordering::SeqCst) {
            return;
        }

        let load = self.system_load();
        let threshold = *self.load_threshold.lock();
        let factor = if load > threshold {
            ADAPTIVE_SHRINK_FACTOR
        } else if load < threshold / 2.0 {
            ADAPTIVE_GROW_FACTOR
        } else {
            1.0
        };

        trace!(load = load, threshold = threshold, factor = factor, "Adaptive cycle");
        if factor == 1.0 {
            return;
        }

        let now_ms = self.clock.now_ms();
        let mut rules = self.rules.write();
        for rule in rules.iter_mut().filter(|r| r.is_adaptive()) {
            let baseline = self
                .baselines
                .get(&rule.id)
                .map(|b| *b)
                .unwrap_or(rule.limits.requests);
            let floor = ((baseline as f64) * ADAPTIVE_FLOOR_FRACTION).round().max(1.0) as u64;
            let cap = (baseline * ADAPTIVE_CAP_MULTIPLE).max(1);
            let target = ((rule.limits.requests as f64) * factor).round() as u64;
            let target = target.clamp(floor, cap);

            if target == rule.limits.requests {
                continue;
            }

            debug!(
                rule_id = %rule.id,
                load = load,
                from = rule.limits.requests,
                to = target,
                "Rescaling adaptive rule"
            );
            rule.limits.requests = target;
            let algorithm = rule.algorithm;
            let limits = rule.limits;
            let rule_id = rule.id.clone();
            self.reset_rule_limiters(&rule_id, algorithm, limits, now_ms);
        }
    }

    /// Current system load: the external provider when set, otherwise a
    /// heuristic from the throttle ratio since the previous cycle
    /// (`min(1, 2 * throttled / total)`).
    fn system_load(&self) -> f64 {
        if let Some(provider) = self.load_provider.read().as_ref() {
            return provider.current_load().clamp(0.0, 1.0);
        }

        let (total, throttled) = {
            let metrics = self.metrics.lock();
            (metrics.total_requests, metrics.throttled_requests)
        };
        let mut last = self.last_cycle_counts.lock();
        let total_delta = total.saturating_sub(last.0);
        let throttled_delta = throttled.saturating_sub(last.1);
        *last = (total, throttled);

        if total_delta == 0 {
            return 0.0;
        }
        (throttled_delta as f64 / total_delta as f64 * 2.0).min(1.0)
    }

    // ---- Introspection ---------------------------------------------------

    /// A snapshot of the admission counters.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    /// Status of one rule, or `None` if it does not exist.
    pub fn get_rule_status(&self, rule_id: &str) -> Option<RuleStatus> {
        let rule = self.rules.read().iter().find(|r| r.id == rule_id).cloned()?;
        let active_limiters = self
            .limiters
            .iter()
            .filter(|entry| entry.key().0 == rule_id)
            .count();
        let triggered = self
            .metrics
            .lock()
            .rule_triggers
            .get(rule_id)
            .copied()
            .unwrap_or(0);
        Some(RuleStatus {
            rule,
            active_limiters,
            triggered,
        })
    }

    /// Number of live limiters across all rules.
    pub fn limiter_count(&self) -> usize {
        self.limiters.len()
    }

    /// Discard all limiter state, fail and drop all queued entries, and zero
    /// the counters. Rules stay registered.
    pub fn clear_state(&self) {
        self.limiters.clear();
        for entry in self.queues.iter() {
            entry.value().clear();
        }
        self.queues.clear();
        self.metrics.lock().reset();
        *self.last_cycle_counts.lock() = (0, 0);
        warn!("Admission state cleared");
    }
}

impl Default for AdmissionManager {
    fn default() -> Self {
        Self::new()
    }
}
