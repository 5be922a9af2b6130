mod common;

use std::time::Duration;

use common::{activate, key, Scripted};
use plugin_runtime_core::{
    ExecutionError, ExecutionRequest, PluginManager, RateLimitRule, RateLimitScope, RateLimiter,
    RuntimeConfig,
};
use serde_json::Value;

#[tokio::test(start_paused = true)]
async fn test_sliding_window_recovers_after_window() {
    let limiter = RateLimitRule::sliding_window(5, Duration::from_secs(10)).build().unwrap();

    for _ in 0..5 {
        assert!(limiter.is_allowed("comm/smtp").allowed);
    }
    let denied = limiter.is_allowed("comm/smtp");
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(Duration::from_secs(10) + Duration::from_nanos(1)));

    tokio::time::advance(Duration::from_secs(11)).await;
    let decision = limiter.is_allowed("comm/smtp");
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 4);
}

#[tokio::test(start_paused = true)]
async fn test_fixed_window_allows_boundary_burst() {
    let limiter = RateLimitRule::fixed_window(3, Duration::from_secs(10)).build().unwrap();

    tokio::time::advance(Duration::from_millis(9_900)).await;
    for _ in 0..3 {
        assert!(limiter.is_allowed("k").allowed);
    }
    assert!(!limiter.is_allowed("k").allowed);

    // a new window opens 100ms later: up to twice the rate inside 200ms
    tokio::time::advance(Duration::from_millis(200)).await;
    for _ in 0..3 {
        assert!(limiter.is_allowed("k").allowed);
    }
}

#[tokio::test(start_paused = true)]
async fn test_per_subject_scope_isolates_callers() {
    let mut config = RuntimeConfig::default();
    config.rate_limit.per_plugin = Some(RateLimitRule::fixed_window(2, Duration::from_secs(60)));
    config.rate_limit.scope = RateLimitScope::PerSubject;
    let manager = PluginManager::new(config).unwrap();
    activate(&manager, Scripted::named("auth", "saml")).await;

    let call = |subject: &str| {
        ExecutionRequest::new(key("auth", "saml"), "echo", Value::Null).subject(subject)
    };
    for _ in 0..2 {
        manager.execute_request(call("alice")).await.unwrap();
    }
    let err = manager.execute_request(call("alice")).await.unwrap_err();
    assert!(matches!(err, ExecutionError::RateLimited { .. }));

    assert!(manager.execute_request(call("bob")).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_limits_admit_everything() {
    let mut config = RuntimeConfig::default();
    config.rate_limit.enabled = false;
    config.rate_limit.per_plugin = Some(RateLimitRule::token_bucket(1, Duration::from_secs(60)));
    let manager = PluginManager::new(config).unwrap();
    activate(&manager, Scripted::named("util", "echo")).await;

    for _ in 0..20 {
        manager
            .execute(&key("util", "echo"), "echo", Value::Null)
            .await
            .unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_plugin_override_replaces_default_rule() {
    let mut config = RuntimeConfig::default();
    config.rate_limit.per_plugin = Some(RateLimitRule::fixed_window(100, Duration::from_secs(60)));
    let manager = PluginManager::new(config).unwrap();
    activate(&manager, Scripted::named("util", "strict")).await;
    manager
        .rate_limits()
        .set_plugin_rule(key("util", "strict"), RateLimitRule::fixed_window(1, Duration::from_secs(60)))
        .unwrap();

    manager
        .execute(&key("util", "strict"), "echo", Value::Null)
        .await
        .unwrap();
    let err = manager
        .execute(&key("util", "strict"), "echo", Value::Null)
        .await
        .unwrap_err();
    assert_eq!(err.retry_after().map(|d| d <= Duration::from_secs(60)), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_token_bucket_call_after_exact_retry_after_is_admitted() {
    let mut config = RuntimeConfig::default();
    config.rate_limit.per_plugin = Some(RateLimitRule::token_bucket(3, Duration::from_millis(1_000)));
    let manager = PluginManager::new(config).unwrap();
    activate(&manager, Scripted::named("util", "echo")).await;

    for _ in 0..3 {
        manager
            .execute(&key("util", "echo"), "echo", Value::Null)
            .await
            .unwrap();
    }
    let retry_after = manager
        .execute(&key("util", "echo"), "echo", Value::Null)
        .await
        .unwrap_err()
        .retry_after()
        .unwrap();

    tokio::time::advance(retry_after).await;
    assert!(manager
        .execute(&key("util", "echo"), "echo", Value::Null)
        .await
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_unregister_resets_per_subject_budgets() {
    let mut config = RuntimeConfig::default();
    config.rate_limit.per_plugin = Some(RateLimitRule::fixed_window(1, Duration::from_secs(60)));
    config.rate_limit.scope = RateLimitScope::PerSubject;
    let manager = PluginManager::new(config).unwrap();
    activate(&manager, Scripted::named("auth", "saml")).await;

    let call = || ExecutionRequest::new(key("auth", "saml"), "echo", Value::Null).subject("alice");
    manager.execute_request(call()).await.unwrap();
    assert!(manager.execute_request(call()).await.is_err());

    manager.shutdown_plugin(&key("auth", "saml")).await.unwrap();
    manager.unregister_plugin(&key("auth", "saml"), false).await.unwrap();
    activate(&manager, Scripted::named("auth", "saml")).await;

    assert!(manager.execute_request(call()).await.is_ok());
}
