//! Socket location and manager options.
//!
//! The socket path is taken from `$RESOURCE_POLICY_SOCKET` when set,
//! otherwise `$XDG_RUNTIME_DIR/resource-policy/manager.sock`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::resource::ResourceType;

/// Explicit socket path override.
pub const SOCKET_ENV: &str = "RESOURCE_POLICY_SOCKET";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("neither $RESOURCE_POLICY_SOCKET nor $XDG_RUNTIME_DIR is set")]
    NoRuntimeDir,
}

/// Resolve the manager socket path from the environment.
pub fn resolve_socket_path() -> Result<PathBuf, ConfigError> {
    socket_path_from(
        std::env::var_os(SOCKET_ENV).map(PathBuf::from),
        std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from),
    )
}

fn socket_path_from(
    explicit: Option<PathBuf>,
    runtime_dir: Option<PathBuf>,
) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(path);
    }
    let runtime_dir = runtime_dir.ok_or(ConfigError::NoRuntimeDir)?;
    Ok(runtime_dir.join("resource-policy").join("manager.sock"))
}

/// Options for the development manager.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Types the manager refuses to grant. A required member on this
    /// list denies the whole set; optional members are left out of the
    /// grant.
    pub deny: BTreeSet<ResourceType>,
}

impl ManagerConfig {
    pub fn with_deny(deny: impl IntoIterator<Item = ResourceType>) -> Self {
        Self {
            deny: deny.into_iter().collect(),
        }
    }
}
