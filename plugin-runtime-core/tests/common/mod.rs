#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plugin_runtime_core::{
    ArgSchema, Capability, InvocationContext, MethodDescriptor, Plugin, PluginContext, PluginFault,
    PluginKey, PluginManager, PluginMetadata, RuntimeConfig, ValueKind,
};
use serde_json::{json, Value};

/// Plugin with a fixed set of scripted methods:
///
/// - `echo` returns its arguments
/// - `greet` requires a string `name`
/// - `sleep` waits `ms` milliseconds
/// - `fail` always fails
/// - `alloc` charges `bytes` of memory and ignores a refusal
/// - `fetch` requires network access
pub struct Scripted {
    metadata: PluginMetadata,
    pub invocations: Arc<AtomicUsize>,
}

impl Scripted {
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn named(domain: &str, name: &str) -> Self {
        Self::new(PluginMetadata::builder(domain, name).build().unwrap())
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Plugin for Scripted {
    fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    fn methods(&self) -> Vec<MethodDescriptor> {
        vec![
            MethodDescriptor::new("echo"),
            MethodDescriptor::new("greet")
                .with_schema(ArgSchema::object().required("name", ValueKind::String)),
            MethodDescriptor::new("sleep"),
            MethodDescriptor::new("fail"),
            MethodDescriptor::new("alloc"),
            MethodDescriptor::new("fetch").requires(Capability::NetworkAccess),
        ]
    }

    async fn initialize(&self, _ctx: &PluginContext) -> Result<(), PluginFault> {
        Ok(())
    }

    async fn invoke(
        &self,
        method: &str,
        args: Value,
        ctx: &InvocationContext,
    ) -> Result<Value, PluginFault> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match method {
            "echo" => Ok(args),
            "greet" => Ok(json!(format!("hello {}", args["name"].as_str().unwrap_or_default()))),
            "sleep" => {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!("awake"))
            }
            "fail" => Err(PluginFault::failed("scripted failure")),
            "alloc" => {
                let bytes = args["bytes"].as_u64().unwrap_or(0);
                let _ = ctx.charge_memory(bytes);
                Ok(json!("allocated"))
            }
            "fetch" => {
                ctx.require_capability(&Capability::NetworkAccess)?;
                Ok(json!("fetched"))
            }
            other => Err(PluginFault::failed(format!("unscripted method {other}"))),
        }
    }
}

pub fn key(domain: &str, name: &str) -> PluginKey {
    PluginKey::new(domain, name)
}

pub fn manager() -> PluginManager {
    PluginManager::new(RuntimeConfig::default()).unwrap()
}

/// Register `plugin` and initialize it, returning the shared handle
pub async fn activate(manager: &PluginManager, plugin: Scripted) -> Arc<Scripted> {
    let plugin = Arc::new(plugin);
    manager
        .register_plugin(Arc::clone(&plugin) as Arc<dyn Plugin>, Value::Null, true)
        .await
        .unwrap();
    plugin
}
