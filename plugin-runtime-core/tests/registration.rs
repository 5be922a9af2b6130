mod common;

use std::sync::Arc;

use common::{activate, key, manager, Scripted};
use mockall::mock;
use parking_lot::Mutex;
use plugin_runtime_core::{
    ArgSchema, DependencyError, EventListener, LifecycleError, Plugin, PluginEvent, PluginFilter,
    PluginMetadata, PluginRuntimeError, PluginStatus, RegistryError, ValueKind,
};
use serde_json::{json, Value};

mock! {
    Listener {}

    impl EventListener for Listener {
        fn on_event(&self, event: &PluginEvent) -> anyhow::Result<()>;
    }
}

fn with_deps(domain: &str, name: &str, deps: &[(&str, &str)]) -> Scripted {
    let mut builder = PluginMetadata::builder(domain, name).tag("test");
    for (dep_domain, dep_name) in deps {
        builder = builder.depends_on(key(dep_domain, dep_name));
    }
    Scripted::new(builder.build().unwrap())
}

#[tokio::test]
async fn test_duplicate_registration_leaves_registry_unchanged() {
    let manager = manager();
    activate(&manager, Scripted::named("comm", "smtp")).await;

    let err = manager
        .register_plugin(Arc::new(Scripted::named("comm", "smtp")), Value::Null, true)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PluginRuntimeError::Registry(RegistryError::DuplicateKey(ref k)) if *k == key("comm", "smtp")
    ));
    assert_eq!(manager.registry().len(), 1);
    let instance = manager.registry().get(&key("comm", "smtp")).unwrap();
    assert_eq!(instance.status(), PluginStatus::Active);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_at_registration() {
    let manager = manager();
    let metadata = PluginMetadata::builder("comm", "smtp")
        .config_schema(ArgSchema::object().required("host", ValueKind::String))
        .build()
        .unwrap();

    let err = manager
        .register_plugin(Arc::new(Scripted::new(metadata)), json!({ "port": 25 }), false)
        .await
        .unwrap_err();

    assert_eq!(err.category().to_string(), "configuration");
    assert!(manager.registry().is_empty());
}

#[tokio::test]
async fn test_unregister_refused_while_dependents_active() {
    let manager = manager();
    activate(&manager, with_deps("data", "db", &[])).await;
    activate(&manager, with_deps("data", "cache", &[("data", "db")])).await;

    let err = manager
        .unregister_plugin(&key("data", "db"), false)
        .await
        .unwrap_err();

    match err {
        PluginRuntimeError::Dependency(DependencyError::HasActiveDependents { dependents, .. }) => {
            assert_eq!(dependents, vec![key("data", "cache")]);
        }
        other => panic!("unexpected error: {other}"),
    }
    // refusal happens before shutdown
    let db = manager.registry().get(&key("data", "db")).unwrap();
    assert_eq!(db.status(), PluginStatus::Active);
}

#[tokio::test]
async fn test_refused_unregister_leaves_plugin_untouched() {
    let manager = manager();
    activate(&manager, with_deps("data", "db", &[])).await;
    activate(&manager, with_deps("data", "cache", &[("data", "db")])).await;
    manager.lifecycle().begin_update(&key("data", "cache")).await.unwrap();

    let err = manager
        .unregister_plugin(&key("data", "cache"), true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PluginRuntimeError::Registry(RegistryError::PluginBusy { status: PluginStatus::Updating, .. })
    ));
    let cache = manager.registry().get(&key("data", "cache")).unwrap();
    assert_eq!(cache.status(), PluginStatus::Updating);

    // db has no active dependents now; it is shut down and removed
    manager.unregister_plugin(&key("data", "db"), false).await.unwrap();
    assert!(!manager.registry().contains(&key("data", "db")));
}

#[tokio::test]
async fn test_forced_unregister_keeps_dependent_running() {
    let manager = manager();
    activate(&manager, with_deps("data", "db", &[])).await;
    activate(&manager, with_deps("data", "cache", &[("data", "db")])).await;

    manager
        .unregister_plugin(&key("data", "db"), true)
        .await
        .unwrap();

    assert!(!manager.registry().contains(&key("data", "db")));
    let cache = manager.registry().get(&key("data", "cache")).unwrap();
    assert_eq!(cache.status(), PluginStatus::Active);
    assert!(manager
        .execute(&key("data", "cache"), "echo", Value::Null)
        .await
        .is_ok());
    assert!(manager.registry().dependents_of(&key("data", "db")).is_empty());
}

#[tokio::test]
async fn test_auto_initialize_requires_active_dependencies() {
    let manager = manager();
    manager
        .register_plugin(Arc::new(with_deps("data", "db", &[])), Value::Null, false)
        .await
        .unwrap();

    let err = manager
        .register_plugin(
            Arc::new(with_deps("data", "cache", &[("data", "db")])),
            Value::Null,
            true,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PluginRuntimeError::Lifecycle(LifecycleError::DependencyNotActive { .. })
    ));
    assert!(manager.registry().contains(&key("data", "cache")));

    let report = manager.initialize_all().await;
    assert!(report.is_success(), "{:?}", report.failed());
    let cache = manager.registry().get(&key("data", "cache")).unwrap();
    assert_eq!(cache.status(), PluginStatus::Active);
}

#[tokio::test]
async fn test_find_plugins_and_domains() {
    let manager = manager();
    activate(&manager, with_deps("comm", "smtp", &[])).await;
    activate(&manager, with_deps("comm", "sms", &[])).await;
    manager
        .register_plugin(Arc::new(Scripted::named("auth", "saml")), Value::Null, false)
        .await
        .unwrap();

    let active = manager.find_plugins(&PluginFilter::new().status(PluginStatus::Active));
    assert_eq!(active.len(), 2);

    let globbed = manager.find_plugins(&PluginFilter::new().domain("comm").name_glob("sm*").unwrap());
    assert_eq!(globbed.len(), 2);

    let tagged = manager.find_plugins(&PluginFilter::new().tag("test"));
    assert!(tagged.iter().all(|summary| summary.domain == "comm"));

    assert_eq!(manager.list_domains(), vec!["auth".to_string(), "comm".to_string()]);
}

#[tokio::test]
async fn test_removal_impact_is_transitive() {
    let manager = manager();
    activate(&manager, with_deps("data", "db", &[])).await;
    activate(&manager, with_deps("data", "cache", &[("data", "db")])).await;
    activate(&manager, with_deps("api", "gateway", &[("data", "cache")])).await;

    assert_eq!(
        manager.removal_impact(&key("data", "db")),
        vec![key("data", "cache"), key("api", "gateway")]
    );
}

#[tokio::test]
async fn test_listeners_see_registration_events_and_failures_are_contained() {
    let manager = manager();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut failing = MockListener::new();
    failing
        .expect_on_event()
        .returning(|_| Err(anyhow::anyhow!("listener offline")));
    // registered, initializing, active, inactive, unregistered
    let mut counting = MockListener::new();
    counting.expect_on_event().times(5).returning(|_| Ok(()));

    manager.subscribe(Arc::new(failing));
    manager.subscribe(Arc::new(counting));
    let sink = Arc::clone(&seen);
    manager.subscribe(Arc::new(move |event: &PluginEvent| -> anyhow::Result<()> {
        sink.lock().push(event.clone());
        Ok(())
    }));

    activate(&manager, Scripted::named("util", "echo")).await;
    manager.unregister_plugin(&key("util", "echo"), false).await.unwrap();

    let seen = seen.lock();
    assert!(matches!(seen.first(), Some(PluginEvent::Registered { .. })));
    assert!(matches!(seen.last(), Some(PluginEvent::Unregistered { .. })));
    assert!(seen.iter().any(|event| matches!(
        event,
        PluginEvent::StatusChanged { to: PluginStatus::Active, .. }
    )));
}

#[tokio::test]
async fn test_health_check_reports_counters() {
    let manager = manager();
    activate(&manager, Scripted::named("util", "echo")).await;
    manager
        .execute(&key("util", "echo"), "echo", Value::Null)
        .await
        .unwrap();
    let _ = manager.execute(&key("util", "echo"), "fail", Value::Null).await;

    let report = manager.health_check(&key("util", "echo")).await.unwrap();
    assert!(report.healthy);
    assert_eq!(report.status, PluginStatus::Active);
    assert_eq!(report.success_count, 1);
    assert_eq!(report.error_count, 1);
    assert!(report.uptime.is_some());

    let plugin: Arc<dyn Plugin> = Arc::new(Scripted::named("util", "idle"));
    manager.register_plugin(plugin, Value::Null, false).await.unwrap();
    let idle = manager.health_check(&key("util", "idle")).await.unwrap();
    assert!(!idle.healthy);
}
