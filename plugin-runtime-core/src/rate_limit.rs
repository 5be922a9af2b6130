//! Rate limiting for plugin executions
//!
//! Three interchangeable algorithms behind the [`RateLimiter`] trait, each
//! keeping independent state per caller-chosen key, and [`RateLimitPolicy`],
//! which composes a per-plugin limiter with per-method limiters in front of
//! `execute`.
//!
//! All limiters read time from `tokio::time::Instant`, so tests can drive them
//! with a paused clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::api::PluginKey;
use crate::error::{ConfigurationError, ExecutionError};
use crate::runtime::duration_ms;

/// Algorithm used by a [`RateLimitRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Continuous refill; bursts up to `max_requests`
    TokenBucket,
    /// Exact count over the trailing window
    SlidingWindow,
    /// Count per aligned window; allows up to twice the limit across a boundary
    FixedWindow,
}

/// `max_requests` per `time_window`, enforced by `algorithm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    pub algorithm: RateLimitAlgorithm,
    pub max_requests: u32,
    #[serde(with = "duration_ms")]
    pub time_window: Duration,
}

impl RateLimitRule {
    pub fn token_bucket(max_requests: u32, time_window: Duration) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            max_requests,
            time_window,
        }
    }

    pub fn sliding_window(max_requests: u32, time_window: Duration) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::SlidingWindow,
            max_requests,
            time_window,
        }
    }

    pub fn fixed_window(max_requests: u32, time_window: Duration) -> Self {
        Self {
            algorithm: RateLimitAlgorithm::FixedWindow,
            max_requests,
            time_window,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_requests == 0 {
            return Err(ConfigurationError::InvalidRuntimeConfig(
                "rate limit max_requests must be positive".to_string(),
            ));
        }
        if self.time_window.is_zero() {
            return Err(ConfigurationError::InvalidRuntimeConfig(
                "rate limit time_window must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a fresh limiter enforcing this rule
    pub fn build(&self) -> Result<Arc<dyn RateLimiter>, ConfigurationError> {
        self.validate()?;
        Ok(match self.algorithm {
            RateLimitAlgorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(*self)),
            RateLimitAlgorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::new(*self)),
            RateLimitAlgorithm::FixedWindow => Arc::new(FixedWindowLimiter::new(*self)),
        })
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Calls still admissible right now, after this one
    pub remaining: u32,
    /// Time until the limiter is back at full capacity
    pub reset_after: Duration,
    /// Time until the next call would be admitted; set only on denial
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// Absolute instant at which the limiter is back at full capacity
    pub fn reset_time(&self) -> chrono::DateTime<chrono::Utc> {
        let offset = chrono::Duration::from_std(self.reset_after).unwrap_or_else(|_| chrono::Duration::zero());
        chrono::Utc::now() + offset
    }
}

/// Admission control keyed by an arbitrary string.
///
/// `is_allowed` is the only mutating check and is atomic per key: N concurrent
/// callers against a limit of M admit exactly `min(N, M)`.
pub trait RateLimiter: Send + Sync + std::fmt::Debug {
    /// Check and, when allowed, consume one unit for `key`
    fn is_allowed(&self, key: &str) -> RateLimitDecision;
    /// Forget the state of one key
    fn reset(&self, key: &str);
    /// Forget `key` and every key starting with `key#`
    fn reset_scoped(&self, key: &str);
    /// Forget every key
    fn clear(&self);
    /// Drop keys whose state equals a fresh one; returns how many went
    fn prune(&self) -> usize;
    fn rule(&self) -> RateLimitRule;
}

/// Whether `candidate` is `key` itself or one of its `key#subject` buckets
fn in_scope(candidate: &str, key: &str) -> bool {
    candidate
        .strip_prefix(key)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('#'))
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

/// Like [`secs`] but rounded up to the next nanosecond, so waiting the
/// returned time is never a hair short.
fn secs_ceil(value: f64) -> Duration {
    let nanos = (value.max(0.0) * 1e9).ceil();
    if nanos >= u64::MAX as f64 {
        Duration::MAX
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = nanos as u64;
        Duration::from_nanos(whole)
    }
}

fn saturating_u32(value: f64) -> u32 {
    if value <= 0.0 {
        0
    } else if value >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = value.floor() as u32;
        whole
    }
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: capacity `max_requests`, refilled continuously at
/// `max_requests / time_window` tokens per second.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    rule: RateLimitRule,
    capacity: f64,
    refill_rate: f64,
    buckets: DashMap<String, TokenBucket>,
}

impl TokenBucketLimiter {
    pub fn new(rule: RateLimitRule) -> Self {
        let capacity = f64::from(rule.max_requests);
        Self {
            rule,
            capacity,
            refill_rate: capacity / rule.time_window.as_secs_f64(),
            buckets: DashMap::new(),
        }
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn is_allowed(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket {
                tokens: self.capacity,
                last_refill: now,
            });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let reset_after = secs_ceil((self.capacity - bucket.tokens) / self.refill_rate);
        RateLimitDecision {
            allowed,
            remaining: saturating_u32(bucket.tokens),
            reset_after,
            retry_after: (!allowed).then(|| secs_ceil((1.0 - bucket.tokens) / self.refill_rate)),
        }
    }

    fn reset(&self, key: &str) {
        self.buckets.remove(key);
    }

    fn reset_scoped(&self, key: &str) {
        self.buckets.retain(|candidate, _| !in_scope(candidate, key));
    }

    fn clear(&self) {
        self.buckets.clear();
    }

    fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens + elapsed * self.refill_rate < self.capacity
        });
        before.saturating_sub(self.buckets.len())
    }

    fn rule(&self) -> RateLimitRule {
        self.rule
    }
}

/// Sliding log: a call is admitted while fewer than `max_requests` calls were
/// admitted within the trailing `time_window`. A call exactly `time_window`
/// old still counts.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    rule: RateLimitRule,
    logs: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            logs: DashMap::new(),
        }
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn is_allowed(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let window = self.rule.time_window;
        let mut log = self.logs.entry(key.to_string()).or_default();

        while log
            .front()
            .is_some_and(|admitted| now.saturating_duration_since(*admitted) > window)
        {
            log.pop_front();
        }

        let limit = self.rule.max_requests as usize;
        let allowed = log.len() < limit;
        if allowed {
            log.push_back(now);
        }

        // an entry leaves the log one nanosecond after it is `window` old
        let until_expiry = |admitted: Option<&Instant>| {
            admitted
                .map(|at| {
                    window.saturating_sub(now.saturating_duration_since(*at)) + Duration::from_nanos(1)
                })
                .unwrap_or_default()
        };
        RateLimitDecision {
            allowed,
            remaining: u32::try_from(limit.saturating_sub(log.len())).unwrap_or(u32::MAX),
            reset_after: until_expiry(log.back()),
            retry_after: (!allowed).then(|| until_expiry(log.front())),
        }
    }

    fn reset(&self, key: &str) {
        self.logs.remove(key);
    }

    fn reset_scoped(&self, key: &str) {
        self.logs.retain(|candidate, _| !in_scope(candidate, key));
    }

    fn clear(&self) {
        self.logs.clear();
    }

    fn prune(&self) -> usize {
        let now = Instant::now();
        let window = self.rule.time_window;
        let before = self.logs.len();
        self.logs.retain(|_, log| {
            log.back()
                .is_some_and(|newest| now.saturating_duration_since(*newest) <= window)
        });
        before.saturating_sub(self.logs.len())
    }

    fn rule(&self) -> RateLimitRule {
        self.rule
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowCount {
    index: u128,
    count: u32,
}

/// Fixed window: counts reset at multiples of `time_window` since the limiter
/// was created. A burst straddling a boundary may admit up to `2 * max_requests`.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    rule: RateLimitRule,
    epoch: Instant,
    windows: DashMap<String, WindowCount>,
}

impl FixedWindowLimiter {
    pub fn new(rule: RateLimitRule) -> Self {
        Self {
            rule,
            epoch: Instant::now(),
            windows: DashMap::new(),
        }
    }

    fn window_index(&self, now: Instant) -> (u128, u128, u128) {
        let since_epoch = now.saturating_duration_since(self.epoch).as_nanos();
        let window_nanos = self.rule.time_window.as_nanos().max(1);
        (since_epoch / window_nanos, since_epoch, window_nanos)
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn is_allowed(&self, key: &str) -> RateLimitDecision {
        let (index, since_epoch, window_nanos) = self.window_index(Instant::now());

        let mut current = self
            .windows
            .entry(key.to_string())
            .or_insert(WindowCount { index, count: 0 });
        if current.index != index {
            *current = WindowCount { index, count: 0 };
        }

        let allowed = current.count < self.rule.max_requests;
        if allowed {
            current.count += 1;
        }

        let into_window = since_epoch % window_nanos;
        let until_boundary =
            Duration::from_nanos(u64::try_from(window_nanos - into_window).unwrap_or(u64::MAX));
        RateLimitDecision {
            allowed,
            remaining: self.rule.max_requests.saturating_sub(current.count),
            reset_after: until_boundary,
            retry_after: (!allowed).then_some(until_boundary),
        }
    }

    fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    fn reset_scoped(&self, key: &str) {
        self.windows.retain(|candidate, _| !in_scope(candidate, key));
    }

    fn clear(&self) {
        self.windows.clear();
    }

    fn prune(&self) -> usize {
        let (index, _, _) = self.window_index(Instant::now());
        let before = self.windows.len();
        self.windows.retain(|_, current| current.index == index && current.count > 0);
        before.saturating_sub(self.windows.len())
    }

    fn rule(&self) -> RateLimitRule {
        self.rule
    }
}

/// Which key the per-plugin limiter counts under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// One budget per plugin
    #[default]
    PerPlugin,
    /// One budget per plugin and calling subject
    PerSubject,
}

/// Rate limiting configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Rule applied to every plugin unless overridden
    pub per_plugin: Option<RateLimitRule>,
    /// Rules applied to a method name across all plugins
    pub per_method: std::collections::BTreeMap<String, RateLimitRule>,
    pub scope: RateLimitScope,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_plugin: None,
            per_method: std::collections::BTreeMap::new(),
            scope: RateLimitScope::PerPlugin,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Some(rule) = &self.per_plugin {
            rule.validate()?;
        }
        self.per_method.values().try_for_each(RateLimitRule::validate)
    }
}

/// Checks between two sweeps of idle limiter state
const PRUNE_INTERVAL: usize = 1024;

/// Limiters consulted before every execution.
///
/// Per-plugin limiters are checked first; the first denial wins and later
/// limiters are not charged. Each limiter is atomic per key, so admissions
/// against different keys never wait on each other.
#[derive(Debug)]
pub struct RateLimitPolicy {
    enabled: bool,
    scope: RateLimitScope,
    default_plugin: Option<Arc<dyn RateLimiter>>,
    plugin_overrides: DashMap<PluginKey, Arc<dyn RateLimiter>>,
    methods: RwLock<std::collections::BTreeMap<String, Arc<dyn RateLimiter>>>,
    checks: AtomicUsize,
}

impl RateLimitPolicy {
    pub fn from_config(config: &RateLimitConfig) -> Result<Self, ConfigurationError> {
        let default_plugin = config.per_plugin.as_ref().map(RateLimitRule::build).transpose()?;
        let methods = config
            .per_method
            .iter()
            .map(|(method, rule)| Ok((method.clone(), rule.build()?)))
            .collect::<Result<_, ConfigurationError>>()?;
        Ok(Self {
            enabled: config.enabled,
            scope: config.scope,
            default_plugin,
            plugin_overrides: DashMap::new(),
            methods: RwLock::new(methods),
            checks: AtomicUsize::new(0),
        })
    }

    /// Policy that admits everything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            scope: RateLimitScope::PerPlugin,
            default_plugin: None,
            plugin_overrides: DashMap::new(),
            methods: RwLock::new(std::collections::BTreeMap::new()),
            checks: AtomicUsize::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Give one plugin its own rule instead of the default
    pub fn set_plugin_rule(&self, key: PluginKey, rule: RateLimitRule) -> Result<(), ConfigurationError> {
        self.plugin_overrides.insert(key, rule.build()?);
        Ok(())
    }

    /// Limit a method name across every plugin
    pub fn set_method_rule(&self, method: impl Into<String>, rule: RateLimitRule) -> Result<(), ConfigurationError> {
        self.methods.write().insert(method.into(), rule.build()?);
        Ok(())
    }

    /// Drop all state and overrides tied to `key`, including its per-subject
    /// buckets. Method limiters are shared across plugins and keep their state.
    pub fn reset_plugin(&self, key: &PluginKey) {
        self.plugin_overrides.remove(key);
        if let Some(limiter) = &self.default_plugin {
            limiter.reset_scoped(&key.to_string());
        }
    }

    /// Drop limiter state that is back at full capacity. Runs on its own every
    /// few checks; returns the number of keys dropped.
    pub fn prune_idle(&self) -> usize {
        let overrides: Vec<Arc<dyn RateLimiter>> = self
            .plugin_overrides
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let methods: Vec<Arc<dyn RateLimiter>> = self.methods.read().values().cloned().collect();
        let pruned: usize = self
            .default_plugin
            .iter()
            .chain(overrides.iter())
            .chain(methods.iter())
            .map(|limiter| limiter.prune())
            .sum();
        if pruned > 0 {
            debug!(pruned, "Pruned idle rate limit state");
        }
        pruned
    }

    /// Admit or deny one call to `key::method` on behalf of `subject`
    pub fn check(
        &self,
        key: &PluginKey,
        method: &str,
        subject: Option<&str>,
    ) -> Result<(), ExecutionError> {
        if !self.enabled {
            return Ok(());
        }

        let plugin_limiter = self
            .plugin_overrides
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.default_plugin.clone());
        let method_limiter = self.methods.read().get(method).cloned();
        if plugin_limiter.is_none() && method_limiter.is_none() {
            return Ok(());
        }

        let plugin_bucket = match (self.scope, subject) {
            (RateLimitScope::PerSubject, Some(subject)) => format!("{key}#{subject}"),
            _ => key.to_string(),
        };

        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_INTERVAL == PRUNE_INTERVAL - 1 {
            self.prune_idle();
        }

        if let Some(limiter) = plugin_limiter {
            let decision = limiter.is_allowed(&plugin_bucket);
            if !decision.allowed {
                debug!(plugin = %key, method, limiter = "plugin", "Rate limit exceeded");
                return Err(ExecutionError::RateLimited {
                    key: key.clone(),
                    limiter: "plugin".to_string(),
                    retry_after: decision.retry_after.unwrap_or_default(),
                });
            }
        }
        if let Some(limiter) = method_limiter {
            let decision = limiter.is_allowed(method);
            if !decision.allowed {
                debug!(plugin = %key, method, limiter = "method", "Rate limit exceeded");
                return Err(ExecutionError::RateLimited {
                    key: key.clone(),
                    limiter: format!("method:{method}"),
                    retry_after: decision.retry_after.unwrap_or_default(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_then_retry_after() {
        let limiter = TokenBucketLimiter::new(RateLimitRule::token_bucket(10, Duration::from_secs(60)));
        for i in 0..10 {
            let decision = limiter.is_allowed("k");
            assert!(decision.allowed, "call {i} should pass");
            assert_eq!(decision.remaining, 9 - i);
        }
        let denied = limiter.is_allowed("k");
        assert!(!denied.allowed);
        let retry = denied.retry_after.unwrap();
        assert!(retry > Duration::from_millis(5_990) && retry <= Duration::from_millis(6_001));

        tokio::time::advance(retry).await;
        assert!(limiter.is_allowed("k").allowed);
        assert!(!limiter.is_allowed("k").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_admits_after_exact_retry_after() {
        let limiter = TokenBucketLimiter::new(RateLimitRule::token_bucket(3, Duration::from_millis(1_000)));
        for _ in 0..3 {
            assert!(limiter.is_allowed("k").allowed);
        }
        let retry = limiter.is_allowed("k").retry_after.unwrap();
        assert!(retry >= Duration::from_nanos(333_333_334), "{retry:?}");

        tokio::time::advance(retry).await;
        assert!(limiter.is_allowed("k").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_keys_are_independent() {
        let limiter = TokenBucketLimiter::new(RateLimitRule::token_bucket(1, Duration::from_secs(1)));
        assert!(limiter.is_allowed("a").allowed);
        assert!(!limiter.is_allowed("a").allowed);
        assert!(limiter.is_allowed("b").allowed);
        limiter.reset("a");
        assert!(limiter.is_allowed("a").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_counts_trailing_calls() {
        let limiter = SlidingWindowLimiter::new(RateLimitRule::sliding_window(5, Duration::from_secs(10)));
        for _ in 0..5 {
            assert!(limiter.is_allowed("k").allowed);
        }
        let denied = limiter.is_allowed("k");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_secs(10) + Duration::from_nanos(1)));

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!limiter.is_allowed("k").allowed);

        tokio::time::advance(Duration::from_secs(2)).await;
        let decision = limiter.is_allowed("k");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_counts_call_exactly_window_old() {
        let limiter = SlidingWindowLimiter::new(RateLimitRule::sliding_window(1, Duration::from_secs(10)));
        assert!(limiter.is_allowed("k").allowed);

        tokio::time::advance(Duration::from_secs(10)).await;
        let denied = limiter.is_allowed("k");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_nanos(1)));

        tokio::time::advance(Duration::from_nanos(1)).await;
        assert!(limiter.is_allowed("k").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_allows_boundary_burst() {
        let limiter = FixedWindowLimiter::new(RateLimitRule::fixed_window(3, Duration::from_secs(10)));
        tokio::time::advance(Duration::from_millis(9_900)).await;
        for _ in 0..3 {
            assert!(limiter.is_allowed("k").allowed);
        }
        let denied = limiter.is_allowed("k");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(100)));

        tokio::time::advance(Duration::from_millis(200)).await;
        for _ in 0..3 {
            assert!(limiter.is_allowed("k").allowed);
        }
        assert!(!limiter.is_allowed("k").allowed);
    }

    #[test]
    fn test_invalid_rules_are_rejected() {
        assert!(RateLimitRule::token_bucket(0, Duration::from_secs(1)).build().is_err());
        assert!(RateLimitRule::sliding_window(1, Duration::ZERO).build().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_plugin_limit_short_circuits_method_limit() {
        let mut config = RateLimitConfig {
            per_plugin: Some(RateLimitRule::fixed_window(1, Duration::from_secs(60))),
            ..RateLimitConfig::default()
        };
        config
            .per_method
            .insert("send".to_string(), RateLimitRule::fixed_window(1, Duration::from_secs(60)));
        let policy = RateLimitPolicy::from_config(&config).unwrap();
        let smtp = PluginKey::new("comm", "smtp");
        let sms = PluginKey::new("comm", "sms");

        policy.check(&smtp, "send", None).unwrap();
        let err = policy.check(&smtp, "send", None).unwrap_err();
        assert!(matches!(&err, ExecutionError::RateLimited { limiter, .. } if limiter == "plugin"));

        // The method budget was spent by the first smtp call.
        let err = policy.check(&sms, "send", None).unwrap_err();
        assert!(matches!(&err, ExecutionError::RateLimited { limiter, .. } if limiter == "method:send"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_per_subject_scope() {
        let config = RateLimitConfig {
            per_plugin: Some(RateLimitRule::sliding_window(1, Duration::from_secs(60))),
            scope: RateLimitScope::PerSubject,
            ..RateLimitConfig::default()
        };
        let policy = RateLimitPolicy::from_config(&config).unwrap();
        let key = PluginKey::new("comm", "smtp");

        policy.check(&key, "send", Some("alice")).unwrap();
        policy.check(&key, "send", Some("bob")).unwrap();
        assert!(policy.check(&key, "send", Some("alice")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_plugin_clears_subject_buckets() {
        let config = RateLimitConfig {
            per_plugin: Some(RateLimitRule::fixed_window(1, Duration::from_secs(60))),
            scope: RateLimitScope::PerSubject,
            ..RateLimitConfig::default()
        };
        let policy = RateLimitPolicy::from_config(&config).unwrap();
        let smtp = PluginKey::new("comm", "smtp");
        let smtp_relay = PluginKey::new("comm", "smtp-relay");

        policy.check(&smtp, "send", Some("alice")).unwrap();
        policy.check(&smtp, "send", None).unwrap();
        policy.check(&smtp_relay, "send", Some("alice")).unwrap();

        policy.reset_plugin(&smtp);

        policy.check(&smtp, "send", Some("alice")).unwrap();
        policy.check(&smtp, "send", None).unwrap();
        assert!(policy.check(&smtp_relay, "send", Some("alice")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_only_fully_recovered_state() {
        let bucket = TokenBucketLimiter::new(RateLimitRule::token_bucket(2, Duration::from_secs(20)));
        let sliding = SlidingWindowLimiter::new(RateLimitRule::sliding_window(2, Duration::from_secs(10)));
        let fixed = FixedWindowLimiter::new(RateLimitRule::fixed_window(2, Duration::from_secs(10)));
        let limiters: [&dyn RateLimiter; 3] = [&bucket, &sliding, &fixed];
        for limiter in limiters {
            for subject in 0..100 {
                assert!(limiter.is_allowed(&format!("comm/smtp#{subject}")).allowed);
            }
            assert!(limiter.is_allowed("busy").allowed);
        }

        tokio::time::advance(Duration::from_secs(3)).await;
        for limiter in limiters {
            assert_eq!(limiter.prune(), 0);
            assert!(limiter.is_allowed("busy").allowed);
        }

        // t=11: idle subjects are back at full capacity, "busy" is not,
        // except for the fixed window which rolled over
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(bucket.prune(), 100);
        assert_eq!(sliding.prune(), 100);
        assert_eq!(fixed.prune(), 101);

        assert_eq!(bucket.is_allowed("comm/smtp#7").remaining, 1);
        assert_eq!(bucket.is_allowed("busy").remaining, 0);
    }

    #[test]
    fn test_concurrent_admissions_across_keys_are_exact() {
        let policy = RateLimitPolicy::from_config(&RateLimitConfig {
            per_plugin: Some(RateLimitRule::fixed_window(25, Duration::from_secs(3_600))),
            ..RateLimitConfig::default()
        })
        .unwrap();
        let keys = [PluginKey::new("comm", "smtp"), PluginKey::new("comm", "sms")];
        let admitted = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let policy = &policy;
                let admitted = &admitted;
                let key = &keys[worker % 2];
                scope.spawn(move || {
                    for _ in 0..20 {
                        if policy.check(key, "send", None).is_ok() {
                            admitted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_disabled_policy_admits_everything() {
        let policy = RateLimitPolicy::disabled();
        policy
            .set_plugin_rule(PluginKey::new("a", "b"), RateLimitRule::token_bucket(1, Duration::from_secs(1)))
            .unwrap();
        for _ in 0..10 {
            policy.check(&PluginKey::new("a", "b"), "m", None).unwrap();
        }
    }
}
