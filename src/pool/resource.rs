//! Resource factories: how pooled handles are created, validated and destroyed.
//!
//! The set of built-in pool types is closed and selected by the `type` tag
//! in `[pools.<name>]`, resolved once when the configuration is loaded.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PoolConfig;

/// An opaque handle lent out by a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceHandle {
    /// Access to a fixed set of directories.
    Filesystem { allowed_paths: Vec<PathBuf> },
    /// A resolved agent CLI executable.
    AgentCli { binary: PathBuf },
    /// Handles produced by embedder-supplied factories.
    Opaque { label: String },
}

/// Creates, validates and destroys the handles of one pool.
#[async_trait]
pub trait ResourceFactory: Send + Sync {
    /// Resource type name used in events and stats.
    fn resource_type(&self) -> &str;

    /// Creates a new handle.
    async fn create(&self) -> Result<ResourceHandle>;

    /// Returns true if `handle` may be lent to a new owner.
    async fn validate(&self, handle: &ResourceHandle) -> bool;

    /// Releases anything `handle` holds.
    async fn destroy(&self, handle: ResourceHandle) {
        debug!(resource = self.resource_type(), ?handle, "Destroyed pooled handle");
    }
}

/// Built-in pool types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    /// Directory access handles.
    Filesystem,
    /// Agent CLI executables.
    AgentCli,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::AgentCli => write!(f, "agent-cli"),
        }
    }
}

/// Builds the factory for a configured pool.
pub fn build_factory(name: &str, config: &PoolConfig) -> Result<Arc<dyn ResourceFactory>> {
    match config.kind {
        PoolKind::Filesystem => {
            if config.paths.is_empty() {
                bail!("Pool '{name}' of type filesystem requires at least one path");
            }
            Ok(Arc::new(FilesystemFactory::new(
                config.paths.iter().map(PathBuf::from).collect(),
            )))
        }
        PoolKind::AgentCli => {
            let binary = config
                .binary
                .clone()
                .with_context(|| format!("Pool '{name}' of type agent-cli requires 'binary'"))?;
            Ok(Arc::new(AgentCliFactory::new(binary)))
        }
    }
}

/// Lends handles to a fixed set of existing directories.
#[derive(Debug, Clone)]
pub struct FilesystemFactory {
    paths: Vec<PathBuf>,
}

impl FilesystemFactory {
    /// Creates a factory for `paths`.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

#[async_trait]
impl ResourceFactory for FilesystemFactory {
    fn resource_type(&self) -> &str {
        "filesystem"
    }

    async fn create(&self) -> Result<ResourceHandle> {
        let mut allowed_paths = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            let resolved = tokio::fs::canonicalize(path)
                .await
                .with_context(|| format!("Allowed path does not exist: {}", path.display()))?;
            allowed_paths.push(resolved);
        }
        Ok(ResourceHandle::Filesystem { allowed_paths })
    }

    async fn validate(&self, handle: &ResourceHandle) -> bool {
        let ResourceHandle::Filesystem { allowed_paths } = handle else {
            return false;
        };
        for path in allowed_paths {
            if !tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
                return false;
            }
        }
        true
    }
}

/// Lends handles to a resolved agent CLI executable.
#[derive(Debug, Clone)]
pub struct AgentCliFactory {
    binary: String,
}

impl AgentCliFactory {
    /// Creates a factory for `binary`, a name on `PATH` or a path.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ResourceFactory for AgentCliFactory {
    fn resource_type(&self) -> &str {
        "agent-cli"
    }

    async fn create(&self) -> Result<ResourceHandle> {
        let binary = find_executable(&self.binary)
            .with_context(|| format!("Agent CLI '{}' not found on PATH", self.binary))?;
        Ok(ResourceHandle::AgentCli { binary })
    }

    async fn validate(&self, handle: &ResourceHandle) -> bool {
        match handle {
            ResourceHandle::AgentCli { binary } => is_executable(binary),
            _ => false,
        }
    }
}

/// Resolves `name` the way a shell would: paths are taken as-is, bare names
/// are searched on `PATH`.
pub(crate) fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}
