//! Plugin security and permission management
//!
//! Capabilities a plugin must declare before the sandbox grants them, and the
//! pluggable [`CodeValidator`] consulted before every execution.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::api::{MethodDescriptor, PluginMetadata};

/// A named permission a plugin declares and the sandbox grants per call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Outbound network access
    NetworkAccess,
    /// File system read access
    FileSystemRead,
    /// File system write access
    FileSystemWrite,
    /// Reading environment variables
    EnvironmentRead,
    /// Spawning child processes
    ProcessSpawn,
    /// Database access through host-provided connections
    DatabaseAccess,
    /// Host-defined capability
    Custom(String),
}

impl Capability {
    pub fn custom(name: impl Into<String>) -> Self {
        Self::Custom(name.into())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkAccess => f.write_str("network_access"),
            Self::FileSystemRead => f.write_str("file_system_read"),
            Self::FileSystemWrite => f.write_str("file_system_write"),
            Self::EnvironmentRead => f.write_str("environment_read"),
            Self::ProcessSpawn => f.write_str("process_spawn"),
            Self::DatabaseAccess => f.write_str("database_access"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "network_access" => Self::NetworkAccess,
            "file_system_read" => Self::FileSystemRead,
            "file_system_write" => Self::FileSystemWrite,
            "environment_read" => Self::EnvironmentRead,
            "process_spawn" => Self::ProcessSpawn,
            "database_access" => Self::DatabaseAccess,
            other => Self::Custom(other.to_string()),
        })
    }
}

/// Why a [`CodeValidator`] rejected a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionMismatch {
    /// Capabilities used but never declared
    pub undeclared: BTreeSet<Capability>,
    /// Human-readable explanation
    pub reason: String,
}

/// Pre-execution inspection of a plugin's declared versus used permissions.
///
/// The heuristics are up to the implementation; the runtime only acts on the
/// verdict.
pub trait CodeValidator: Send + Sync {
    /// Accept or reject calling `method` on the plugin described by `metadata`
    fn validate(
        &self,
        metadata: &PluginMetadata,
        method: &MethodDescriptor,
    ) -> Result<(), PermissionMismatch>;
}

/// Rejects methods that require capabilities their plugin never declared.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredPermissionValidator;

impl CodeValidator for DeclaredPermissionValidator {
    fn validate(
        &self,
        metadata: &PluginMetadata,
        method: &MethodDescriptor,
    ) -> Result<(), PermissionMismatch> {
        let undeclared: BTreeSet<Capability> = method
            .required_capabilities
            .difference(metadata.declared_permissions())
            .cloned()
            .collect();
        if undeclared.is_empty() {
            return Ok(());
        }
        Err(PermissionMismatch {
            reason: format!(
                "method '{}' of {} uses undeclared capabilities: {}",
                method.name,
                metadata.key(),
                undeclared
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            undeclared,
        })
    }
}

/// Capabilities actually granted: declared ones, narrowed by the host policy
/// when one is configured.
pub fn grantable_capabilities(
    declared: &BTreeSet<Capability>,
    allowed: Option<&BTreeSet<Capability>>,
) -> BTreeSet<Capability> {
    match allowed {
        Some(allowed) => declared.intersection(allowed).cloned().collect(),
        None => declared.clone(),
    }
}
