use crate::permission::ScopeType;
use std::time::Duration;

/// Permission names evaluated after a load when pre-warming is requested.
pub const COMMON_PERMISSIONS: &[&str] = &[
    "dashboard.view",
    "profile.read",
    "profile.update",
    "user.read",
    "settings.read",
];

/// Construction-time configuration of a [`PermissionManager`](crate::PermissionManager).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    pub cache_enabled: bool,
    /// Default TTL of cached decisions.
    pub cache_ttl: Duration,
    /// Cache capacity; zero disables caching.
    pub max_cache_size: usize,
    /// Propagate internal evaluation faults instead of denying.
    pub strict_mode: bool,
    /// Scope type reported for unscoped permissions in summaries.
    pub default_scope: ScopeType,
    pub sweep_interval: Duration,
    /// Union permissions of `parent_role` ancestors at load time.
    pub resolve_parent_roles: bool,
    pub max_inherit_depth: usize,
    pub prewarm_permissions: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            max_cache_size: 1000,
            strict_mode: false,
            default_scope: ScopeType::Global,
            sweep_interval: Duration::from_secs(60),
            resolve_parent_roles: false,
            max_inherit_depth: 16,
            prewarm_permissions: COMMON_PERMISSIONS.iter().map(ToString::to_string).collect(),
        }
    }
}
