//! Tenant isolation
//!
//! Every tenant gets its own [`PluginManager`], and with it its own registry,
//! lifecycle manager, sandbox, limiters and event bus. The router only maps
//! tenant ids to scopes; nothing is keyed across tenants, so one tenant can
//! never resolve another tenant's plugins.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, warn};

use crate::api::PluginKey;
use crate::error::{ConfigurationError, PluginResult, PluginRuntimeError};
use crate::lifecycle::{BatchReport, HealthMonitor};
use crate::manager::PluginManager;
use crate::runtime::RuntimeConfig;

/// The plugin scope of one tenant
#[derive(Debug)]
pub struct TenantScope {
    tenant_id: String,
    manager: PluginManager,
    health_monitor: Mutex<Option<HealthMonitor>>,
}

impl TenantScope {
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn manager(&self) -> &PluginManager {
        &self.manager
    }

    /// Start periodic health checks for this tenant's plugins.
    ///
    /// Must be called from within a tokio runtime. A running monitor is kept.
    pub fn start_health_monitor(&self) {
        let mut slot = self.health_monitor.lock();
        if slot.is_none() {
            *slot = Some(self.manager.lifecycle().spawn_health_monitor());
        }
    }

    pub async fn stop_health_monitor(&self) {
        let monitor = self.health_monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }
}

/// Routes calls to per-tenant scopes
#[derive(Debug)]
pub struct TenantRouter {
    config: RuntimeConfig,
    scopes: DashMap<String, Arc<TenantScope>>,
}

impl TenantRouter {
    /// Router whose scopes are all built from `config`
    pub fn new(config: RuntimeConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            config,
            scopes: DashMap::new(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Scope of `tenant_id`, created on first use
    pub fn get_or_create_tenant_scope(&self, tenant_id: &str) -> Result<Arc<TenantScope>, ConfigurationError> {
        if tenant_id.trim().is_empty() {
            return Err(ConfigurationError::InvalidRuntimeConfig(
                "tenant id must not be empty".to_string(),
            ));
        }
        let scope = self
            .scopes
            .entry(tenant_id.to_string())
            .or_try_insert_with(|| {
                info!(tenant = tenant_id, "Creating tenant scope");
                Ok::<_, ConfigurationError>(Arc::new(TenantScope {
                    tenant_id: tenant_id.to_string(),
                    manager: PluginManager::new(self.config.clone())?,
                    health_monitor: Mutex::new(None),
                }))
            })?;
        Ok(Arc::clone(scope.value()))
    }

    pub fn tenant_scope(&self, tenant_id: &str) -> Option<Arc<TenantScope>> {
        self.scopes.get(tenant_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Tear down the scope of `tenant_id`.
    ///
    /// Stops its health monitor, shuts every plugin down in reverse
    /// dependency order and unregisters them all. The returned report holds
    /// the per-plugin shutdown outcomes.
    pub async fn remove_tenant_scope(&self, tenant_id: &str) -> PluginResult<BatchReport> {
        let (_, scope) = self
            .scopes
            .remove(tenant_id)
            .ok_or_else(|| PluginRuntimeError::TenantNotFound(tenant_id.to_string()))?;

        scope.stop_health_monitor().await;
        let manager = scope.manager();
        let report = manager.shutdown_all().await;
        for key in manager.registry().keys() {
            if let Err(err) = manager.unregister_plugin(&key, true).await {
                warn!(tenant = tenant_id, plugin = %key, error = %err, "Failed to unregister plugin during tenant teardown");
            }
        }
        info!(
            tenant = tenant_id,
            failed = report.failed().len(),
            "Tenant scope removed"
        );
        Ok(report)
    }

    /// Execute `method` of `key` in the scope of `tenant_id`
    pub async fn execute(
        &self,
        tenant_id: &str,
        key: &PluginKey,
        method: &str,
        args: Value,
    ) -> PluginResult<Value> {
        let scope = self
            .tenant_scope(tenant_id)
            .ok_or_else(|| PluginRuntimeError::TenantNotFound(tenant_id.to_string()))?;
        Ok(scope.manager().execute(key, method, args).await?)
    }

    /// Ids of every live tenant scope, sorted
    pub fn tenant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scopes.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
