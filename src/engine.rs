use crate::cache::CacheStrategy;
use crate::condition::{ConditionEvaluator, ConditionResult};
use crate::config::ManagerConfig;
use crate::context::PermissionContext;
use crate::error::{Error, Result};
use crate::evaluation_cache::{CacheStats, EvaluationCache};
use crate::events::{EventDispatcher, EventKind, PermissionEvent};
use crate::permission::{Role, ScopeType, permission_name};
use crate::scope::{ScopeCheck, ScopeResolver};
use crate::store::{PermissionLoader, PermissionStore, PrincipalPermissions, StorePoisoned};
use crate::types::{PrincipalId, RoleId};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CACHE_KEY_SEPARATOR: char = '|';

const REASON_GRANTED: &str = "permission granted";
const REASON_CONDITIONS_MET: &str = "all conditions met";
const REASON_NOT_LOADED: &str = "permissions not loaded";
const REASON_NOT_FOUND: &str = "permission not found";
const REASON_CACHED: &str = "cached decision";
const REASON_EVALUATION_ERROR: &str = "evaluation error";

/// Per-call evaluation options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluationOptions {
    /// Consult and populate the decision cache.
    pub use_cache: bool,
    /// TTL for the stored decision; the configured default when `None`.
    pub ttl: Option<Duration>,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            ttl: None,
        }
    }
}

impl EvaluationOptions {
    /// Options that bypass the cache entirely.
    pub fn uncached() -> Self {
        Self {
            use_cache: false,
            ttl: None,
        }
    }

    /// Sets the TTL of the decision stored by this call.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options for [`PermissionManager::load_user_permissions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Evaluate the configured common permissions right after the load.
    pub prewarm: bool,
    /// Drop the principal's cached decisions after the swap.
    pub invalidate_cache: bool,
}

/// Outcome of a permission evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub granted: bool,
    pub reason: String,
    /// Per-condition detail; `None` for cache hits and unconditional grants.
    pub condition_results: Option<Vec<ConditionResult>>,
    pub from_cache: bool,
}

impl EvaluationResult {
    fn granted(reason: impl Into<String>) -> Self {
        Self {
            granted: true,
            reason: reason.into(),
            condition_results: None,
            from_cache: false,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            granted: false,
            reason: reason.into(),
            condition_results: None,
            from_cache: false,
        }
    }

    fn cached(granted: bool) -> Self {
        Self {
            granted,
            reason: REASON_CACHED.to_string(),
            condition_results: None,
            from_cache: true,
        }
    }

    fn with_conditions(mut self, results: Vec<ConditionResult>) -> Self {
        self.condition_results = Some(results);
        self
    }
}

/// Snapshot of what is loaded for a principal.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PermissionSummary {
    pub user_id: PrincipalId,
    pub roles: Vec<String>,
    pub inherited_roles: Vec<String>,
    pub direct_permissions: Vec<String>,
    pub effective_permissions: Vec<String>,
    /// Scope type per effective permission; unscoped ones report the
    /// configured default scope.
    pub scopes: BTreeMap<String, ScopeType>,
    pub role_count: usize,
    pub permission_count: usize,
    pub loaded_at: DateTime<Utc>,
}

/// Cache configuration and counters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CacheInfo {
    pub enabled: bool,
    pub size: usize,
    pub max_size: usize,
    pub default_ttl: Duration,
    pub hit_rate: f64,
    pub stats: CacheStats,
}

/// Manager-wide counters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ManagerStats {
    pub principals_loaded: usize,
    pub evaluations: u64,
    pub granted: u64,
    pub denied: u64,
    pub errors: u64,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct Counters {
    evaluations: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
}

/// Builder for [`PermissionManager`].
pub struct PermissionManagerBuilder<L> {
    loader: L,
    config: ManagerConfig,
    strategy: Option<Box<dyn CacheStrategy>>,
    events: Option<Arc<EventDispatcher>>,
}

impl<L> PermissionManagerBuilder<L> {
    /// Creates a new builder with default configuration.
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            config: ManagerConfig::default(),
            strategy: None,
            events: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables or disables the decision cache.
    pub fn cache_enabled(mut self, on: bool) -> Self {
        self.config.cache_enabled = on;
        self
    }

    /// Sets the default TTL of cached decisions.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Sets the cache capacity; zero disables caching.
    pub fn max_cache_size(mut self, size: usize) -> Self {
        self.config.max_cache_size = size;
        self
    }

    /// Propagates internal evaluation faults instead of denying.
    pub fn strict_mode(mut self, on: bool) -> Self {
        self.config.strict_mode = on;
        self
    }

    /// Sets the scope type reported for unscoped permissions.
    pub fn default_scope(mut self, scope: ScopeType) -> Self {
        self.config.default_scope = scope;
        self
    }

    /// Sets the period of the expired-decision sweep.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Enables or disables `parent_role` resolution at load time.
    pub fn resolve_parent_roles(mut self, on: bool) -> Self {
        self.config.resolve_parent_roles = on;
        self
    }

    /// Sets maximum parent-role chain depth.
    pub fn max_inherit_depth(mut self, depth: usize) -> Self {
        self.config.max_inherit_depth = depth;
        self
    }

    /// Sets the permission names evaluated by a pre-warming load.
    pub fn prewarm_permissions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.prewarm_permissions = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the hook consulted before decisions are cached.
    pub fn cache_strategy<S: CacheStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Some(Box::new(strategy));
        self
    }

    /// Uses an existing (possibly shared) event dispatcher.
    pub fn events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builds the manager.
    pub fn build(self) -> PermissionManager<L> {
        let mut cache = EvaluationCache::new(self.config.max_cache_size, self.config.cache_ttl);
        if let Some(strategy) = self.strategy {
            cache = cache.with_strategy(strategy);
        }
        PermissionManager {
            loader: self.loader,
            store: PermissionStore::new(),
            cache: Arc::new(cache),
            events: self.events.unwrap_or_default(),
            conditions: ConditionEvaluator::new(),
            scopes: ScopeResolver::new(),
            counters: Counters::default(),
            config: self.config,
        }
    }
}

/// Authorization decision engine.
///
/// Loads roles and direct permissions through an injected
/// [`PermissionLoader`], evaluates scopes and conditions, caches decisions
/// and emits [`PermissionEvent`]s.
///
/// Evaluation is synchronous; only loading awaits. A load swaps a
/// principal's data atomically, but evaluations running while a load is in
/// flight may see either the old or the new data. Hosts that need
/// consistency across a reload must serialize per principal themselves.
///
/// Cached decisions are keyed by a narrowed view of the context (principal,
/// permission, resource id, action, ip, country). Two contexts that differ
/// only outside that view share one cached decision; pass
/// [`EvaluationOptions::uncached`] when that approximation is unacceptable.
#[derive(Debug)]
pub struct PermissionManager<L> {
    loader: L,
    store: PermissionStore,
    cache: Arc<EvaluationCache>,
    events: Arc<EventDispatcher>,
    conditions: ConditionEvaluator,
    scopes: ScopeResolver,
    counters: Counters,
    config: ManagerConfig,
}

impl<L> PermissionManager<L> {
    /// Creates a builder around `loader`.
    pub fn builder(loader: L) -> PermissionManagerBuilder<L> {
        PermissionManagerBuilder::new(loader)
    }

    /// Returns the configuration the manager was built with.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Returns the event dispatcher for subscriptions.
    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Whether permissions are installed for the principal.
    pub fn is_loaded(&self, user: &PrincipalId) -> bool {
        self.store.contains(user)
    }

    /// Removes a principal's data and cached decisions.
    pub fn clear_user_permissions(&self, user: &PrincipalId) -> bool {
        let existed = self.store.remove(user);
        let purged = self.cache.delete_by_prefix(&user_cache_prefix(user));
        info!(user = %user, purged, "cleared user permissions");
        self.events.emit(
            &PermissionEvent::new(EventKind::CacheCleared, Some(user.clone()))
                .with_metadata("entries", purged),
        );
        existed
    }

    /// Evaluates a permission and reports why it was granted or denied.
    pub fn evaluate_permission(
        &self,
        user: &PrincipalId,
        permission: &str,
        context: Option<PermissionContext>,
        options: EvaluationOptions,
    ) -> Result<EvaluationResult> {
        let context = context.unwrap_or_default().with_defaults(user, Utc::now());
        let use_cache = self.config.cache_enabled && options.use_cache;
        let key = cache_key(user, permission, &context);

        if use_cache && let Some(granted) = self.cache.get(&key) {
            debug!(user = %user, permission, granted, "decision cache hit");
            return Ok(EvaluationResult::cached(granted));
        }

        self.counters.evaluations.fetch_add(1, Ordering::Relaxed);
        let result = match self.evaluate_uncached(user, permission, &context) {
            Ok(result) => {
                if use_cache {
                    self.cache.set(key, result.granted, options.ttl, Some(&context));
                }
                result
            }
            Err(StorePoisoned) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                let fault = "permission store lock poisoned";
                if self.config.strict_mode {
                    return Err(Error::EvaluationFailed {
                        user: user.clone(),
                        permission: permission.to_string(),
                        message: fault.to_string(),
                    });
                }
                warn!(user = %user, permission, error = fault, "evaluation failed; denying");
                EvaluationResult::denied(REASON_EVALUATION_ERROR)
            }
        };

        self.record_decision(user, permission, &result);
        Ok(result)
    }

    fn evaluate_uncached(
        &self,
        user: &PrincipalId,
        name: &str,
        context: &PermissionContext,
    ) -> std::result::Result<EvaluationResult, StorePoisoned> {
        let Some(loaded) = self.store.get(user)? else {
            return Ok(EvaluationResult::denied(REASON_NOT_LOADED));
        };
        let Some(permission) = loaded.find_permission(name) else {
            return Ok(EvaluationResult::denied(REASON_NOT_FOUND));
        };

        if let ScopeCheck::Denied { reason } = self.scopes.check(permission.scope.as_ref(), context)
        {
            return Ok(EvaluationResult::denied(reason));
        }
        if permission.conditions.is_empty() {
            return Ok(EvaluationResult::granted(REASON_GRANTED));
        }

        let outcome = self
            .conditions
            .evaluate_all(&permission.conditions, &context.to_value());
        let result = if outcome.passed {
            EvaluationResult::granted(REASON_CONDITIONS_MET)
        } else {
            let unmet = outcome.unmet_summary();
            if unmet.is_empty() {
                EvaluationResult::denied("conditions not met")
            } else {
                EvaluationResult::denied(format!("conditions not met: {unmet}"))
            }
        };
        Ok(result.with_conditions(outcome.results))
    }

    fn record_decision(&self, user: &PrincipalId, permission: &str, result: &EvaluationResult) {
        let kind = if result.granted {
            self.counters.granted.fetch_add(1, Ordering::Relaxed);
            EventKind::PermissionGranted
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            EventKind::PermissionDenied
        };
        debug!(
            user = %user,
            permission,
            granted = result.granted,
            reason = %result.reason,
            "permission evaluated"
        );
        self.events.emit(
            &PermissionEvent::new(kind, Some(user.clone()))
                .with_permission(permission)
                .with_metadata("reason", result.reason.as_str()),
        );
    }

    /// Evaluates with an empty context and returns only the decision.
    pub fn has_permission(&self, user: &PrincipalId, permission: &str) -> Result<bool> {
        self.evaluate_permission(user, permission, None, EvaluationOptions::default())
            .map(|result| result.granted)
    }

    /// Short-circuits on the first granted permission; empty input is `false`.
    pub fn has_any_permission<S: AsRef<str>>(
        &self,
        user: &PrincipalId,
        permissions: &[S],
    ) -> Result<bool> {
        for permission in permissions {
            if self.has_permission(user, permission.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Short-circuits on the first denied permission; empty input is `true`.
    pub fn has_all_permissions<S: AsRef<str>>(
        &self,
        user: &PrincipalId,
        permissions: &[S],
    ) -> Result<bool> {
        for permission in permissions {
            if !self.has_permission(user, permission.as_ref())? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Checks the `<resource>.<action>` permission.
    pub fn check_permission(&self, user: &PrincipalId, resource: &str, action: &str) -> Result<bool> {
        self.has_permission(user, &permission_name(resource, action))
    }

    /// Whether the principal directly holds a role with this name.
    pub fn has_role(&self, user: &PrincipalId, role: &str) -> bool {
        matches!(self.store.get(user), Ok(Some(loaded)) if loaded.has_role(role))
    }

    /// Summarizes a principal's loaded data; `None` when not loaded.
    pub fn get_permission_summary(&self, user: &PrincipalId) -> Option<PermissionSummary> {
        let loaded = self.store.get(user).ok()??;
        let mut scopes = BTreeMap::new();
        for permission in loaded.permissions() {
            let scope = permission
                .scope
                .as_ref()
                .map_or(self.config.default_scope, |scope| scope.scope_type);
            scopes.entry(permission.name.clone()).or_insert(scope);
        }
        let effective_permissions = loaded.effective_permission_names();
        Some(PermissionSummary {
            user_id: user.clone(),
            roles: loaded.roles.iter().map(|role| role.name.clone()).collect(),
            inherited_roles: loaded.inherited.iter().map(|role| role.name.clone()).collect(),
            direct_permissions: loaded.direct.iter().map(|p| p.name.clone()).collect(),
            role_count: loaded.roles.len(),
            permission_count: effective_permissions.len(),
            effective_permissions,
            scopes,
            loaded_at: loaded.loaded_at,
        })
    }

    /// Drops every cached decision.
    pub fn clear_cache(&self) -> usize {
        let purged = self.cache.clear();
        info!(purged, "cleared decision cache");
        self.events.emit(
            &PermissionEvent::new(EventKind::CacheCleared, None).with_metadata("entries", purged),
        );
        purged
    }

    /// Drops a principal's cached decisions; other principals are untouched.
    pub fn clear_user_cache(&self, user: &PrincipalId) -> usize {
        let purged = self.cache.delete_by_prefix(&user_cache_prefix(user));
        debug!(user = %user, purged, "cleared user decision cache");
        self.events.emit(
            &PermissionEvent::new(EventKind::CacheCleared, Some(user.clone()))
                .with_metadata("entries", purged),
        );
        purged
    }

    /// Drops cached decisions whose key matches `pattern`.
    ///
    /// Keys have the form `user|permission|resource|action|ip|country`.
    pub fn invalidate_cache_pattern(&self, pattern: &str) -> Result<usize> {
        let pattern = Regex::new(pattern)?;
        Ok(self.cache.delete_by_pattern(&pattern))
    }

    /// Returns cache size, limits and counters.
    pub fn get_cache_info(&self) -> CacheInfo {
        let stats = self.cache.stats();
        CacheInfo {
            enabled: self.config.cache_enabled,
            size: self.cache.len(),
            max_size: self.cache.capacity(),
            default_ttl: self.cache.default_ttl(),
            hit_rate: stats.hit_rate(),
            stats,
        }
    }

    /// Returns evaluation counters and cache statistics.
    pub fn get_stats(&self) -> ManagerStats {
        ManagerStats {
            principals_loaded: self.store.len(),
            evaluations: self.counters.evaluations.load(Ordering::Relaxed),
            granted: self.counters.granted.load(Ordering::Relaxed),
            denied: self.counters.denied.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }

    /// Starts the periodic purge of expired decisions.
    ///
    /// Must be called from within a tokio runtime; the task ends when the
    /// manager is dropped.
    pub fn start_cache_sweeper(&self) -> JoinHandle<()> {
        self.cache.spawn_sweeper(self.config.sweep_interval)
    }
}

impl<L> PermissionManager<L>
where
    L: PermissionLoader,
{
    /// Fetches roles and direct permissions concurrently and installs them
    /// atomically. On failure nothing is installed.
    pub async fn load_user_permissions(
        &self,
        user: &PrincipalId,
        options: LoadOptions,
    ) -> Result<()> {
        let (roles, direct) = futures::try_join!(
            self.loader.load_roles(user),
            self.loader.load_direct_permissions(user),
        )
        .map_err(|source| {
            error!(user = %user, error = %source, "permission loader failed");
            Error::LoadFailed {
                user: user.clone(),
                source,
            }
        })?;

        let inherited = if self.config.resolve_parent_roles {
            self.resolve_parent_roles(user, &roles).await?
        } else {
            Vec::new()
        };

        let mut loaded = PrincipalPermissions::new(roles, direct);
        loaded.inherited = inherited;
        for permission in loaded.permissions() {
            if !permission.name_matches_parts() {
                warn!(
                    user = %user,
                    permission = %permission.name,
                    resource = %permission.resource,
                    action = %permission.action,
                    "permission name does not match resource.action"
                );
            }
        }
        let role_count = loaded.roles.len();
        let permission_count = loaded.effective_permission_names().len();

        self.store.install(user.clone(), loaded);
        info!(user = %user, role_count, permission_count, "loaded user permissions");

        if options.invalidate_cache {
            self.cache.delete_by_prefix(&user_cache_prefix(user));
        }
        self.events.emit(
            &PermissionEvent::new(EventKind::PermissionsLoaded, Some(user.clone()))
                .with_metadata("roleCount", role_count)
                .with_metadata("permissionCount", permission_count),
        );
        if options.prewarm && self.config.cache_enabled {
            self.prewarm(user)?;
        }
        Ok(())
    }

    fn prewarm(&self, user: &PrincipalId) -> Result<()> {
        for permission in &self.config.prewarm_permissions {
            self.evaluate_permission(user, permission, None, EvaluationOptions::default())?;
        }
        debug!(user = %user, count = self.config.prewarm_permissions.len(), "pre-warmed cache");
        Ok(())
    }

    /// Walks each held role's `parent_role` chain through the loader.
    ///
    /// Ancestors are returned in discovery order without duplicates. Parents
    /// the loader cannot provide are skipped.
    async fn resolve_parent_roles(&self, user: &PrincipalId, roles: &[Role]) -> Result<Vec<Role>> {
        let mut seen: HashSet<RoleId> = roles.iter().map(|role| role.id.clone()).collect();
        let mut inherited = Vec::new();

        for role in roles {
            let mut chain = HashSet::from([role.id.clone()]);
            let mut next = role.parent_role.clone();
            let mut depth = 0;

            while let Some(parent) = next.take() {
                depth += 1;
                if depth > self.config.max_inherit_depth {
                    return Err(Error::RoleDepthExceeded {
                        user: user.clone(),
                        role: parent,
                        max_depth: self.config.max_inherit_depth,
                    });
                }
                if !chain.insert(parent.clone()) {
                    return Err(Error::RoleCycleDetected {
                        user: user.clone(),
                        role: parent,
                    });
                }
                if seen.contains(&parent) {
                    break;
                }

                let fetched = self
                    .loader
                    .load_role(&parent)
                    .await
                    .map_err(|source| Error::LoadFailed {
                        user: user.clone(),
                        source,
                    })?;
                let Some(parent_role) = fetched else {
                    warn!(user = %user, role = %parent, "parent role unavailable; skipping");
                    break;
                };
                seen.insert(parent);
                next = parent_role.parent_role.clone();
                inherited.push(parent_role);
            }
        }

        Ok(inherited)
    }
}

fn user_cache_prefix(user: &PrincipalId) -> String {
    format!("{user}{CACHE_KEY_SEPARATOR}")
}

fn cache_key(user: &PrincipalId, permission: &str, context: &PermissionContext) -> String {
    let sep = CACHE_KEY_SEPARATOR;
    format!(
        "{user}{sep}{permission}{sep}{}{sep}{}{sep}{}{sep}{}",
        context.resource_id().unwrap_or_default(),
        context.action.as_deref().unwrap_or_default(),
        context.environment.ip.as_deref().unwrap_or_default(),
        context.country().unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoaderError;
    use crate::permission::{Condition, LogicalOperator, Operator, Permission, Scope};
    use crate::types::PermissionId;
    use crate::value::Value;
    use async_trait::async_trait;
    use futures::executor::block_on;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestLoader {
        state: Mutex<LoaderState>,
    }

    #[derive(Default)]
    struct LoaderState {
        roles: HashMap<PrincipalId, Vec<Role>>,
        direct: HashMap<PrincipalId, Vec<Permission>>,
        catalog: HashMap<RoleId, Role>,
        fail: bool,
    }

    impl TestLoader {
        fn set_roles(&self, user: &PrincipalId, roles: Vec<Role>) {
            self.state.lock().unwrap().roles.insert(user.clone(), roles);
        }

        fn set_direct(&self, user: &PrincipalId, permissions: Vec<Permission>) {
            self.state
                .lock()
                .unwrap()
                .direct
                .insert(user.clone(), permissions);
        }

        fn add_catalog_role(&self, role: Role) {
            self.state.lock().unwrap().catalog.insert(role.id.clone(), role);
        }

        fn set_fail(&self, fail: bool) {
            self.state.lock().unwrap().fail = fail;
        }
    }

    #[async_trait]
    impl PermissionLoader for TestLoader {
        async fn load_roles(&self, user: &PrincipalId) -> std::result::Result<Vec<Role>, LoaderError> {
            let state = self.state.lock().unwrap();
            if state.fail {
                return Err("role backend unavailable".into());
            }
            Ok(state.roles.get(user).cloned().unwrap_or_default())
        }

        async fn load_direct_permissions(
            &self,
            user: &PrincipalId,
        ) -> std::result::Result<Vec<Permission>, LoaderError> {
            let state = self.state.lock().unwrap();
            Ok(state.direct.get(user).cloned().unwrap_or_default())
        }

        async fn load_role(&self, role: &RoleId) -> std::result::Result<Option<Role>, LoaderError> {
            Ok(self.state.lock().unwrap().catalog.get(role).cloned())
        }
    }

    fn user(id: &str) -> PrincipalId {
        PrincipalId::try_from(id).unwrap()
    }

    fn permission(resource: &str, action: &str) -> Permission {
        let id = PermissionId::try_from(format!("{resource}_{action}")).unwrap();
        Permission::new(id, resource, action)
    }

    fn role(name: &str, permissions: Vec<Permission>) -> Role {
        permissions
            .into_iter()
            .fold(Role::new(RoleId::try_from(name).unwrap(), name), Role::with_permission)
    }

    fn manager_with(loader: Arc<TestLoader>) -> PermissionManager<Arc<TestLoader>> {
        PermissionManagerBuilder::new(loader).build()
    }

    fn load(manager: &PermissionManager<Arc<TestLoader>>, user: &PrincipalId) {
        block_on(manager.load_user_permissions(user, LoadOptions::default())).unwrap();
    }

    fn editor_loader(u1: &PrincipalId) -> Arc<TestLoader> {
        let loader = Arc::new(TestLoader::default());
        let publish = permission("article", "publish").with_condition(Condition::new(
            "resource.status",
            Operator::Eq,
            "draft",
        ));
        loader.set_roles(u1, vec![role("editor", vec![publish])]);
        loader
    }

    fn status_ctx(status: &str) -> PermissionContext {
        PermissionContext::new().with_resource(Value::object([("status", status)]))
    }

    #[test]
    fn evaluate_should_grant_drafts_and_deny_published() {
        let u1 = user("u1");
        let manager = manager_with(editor_loader(&u1));
        load(&manager, &u1);

        let result = manager
            .evaluate_permission(
                &u1,
                "article.publish",
                Some(status_ctx("draft")),
                EvaluationOptions::uncached(),
            )
            .unwrap();
        assert!(result.granted);
        assert_eq!(result.reason, REASON_CONDITIONS_MET);
        assert_eq!(result.condition_results.as_ref().map(Vec::len), Some(1));

        let result = manager
            .evaluate_permission(
                &u1,
                "article.publish",
                Some(status_ctx("published")),
                EvaluationOptions::uncached(),
            )
            .unwrap();
        assert!(!result.granted);
        assert!(!result.from_cache);
        assert!(result.reason.contains("resource.status"));
        let details = result.condition_results.unwrap();
        assert_eq!(details[0].actual, Value::from("published"));
    }

    #[test]
    fn evaluate_should_name_lone_negated_condition_in_reason() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        let archive = permission("article", "archive").with_condition(
            Condition::new("resource.status", Operator::Eq, "draft").with_logical(LogicalOperator::Not),
        );
        loader.set_direct(&u1, vec![archive]);
        let manager = manager_with(loader);
        load(&manager, &u1);

        let result = manager
            .evaluate_permission(
                &u1,
                "article.archive",
                Some(status_ctx("published")),
                EvaluationOptions::uncached(),
            )
            .unwrap();
        assert!(!result.granted);
        assert_eq!(result.reason, r#"conditions not met: resource.status EQ "draft""#);

        let result = manager
            .evaluate_permission(
                &u1,
                "article.archive",
                Some(status_ctx("draft")),
                EvaluationOptions::uncached(),
            )
            .unwrap();
        assert!(result.granted);
    }

    #[test]
    fn evaluate_should_expire_decision_after_per_call_ttl() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);
        let manager = PermissionManagerBuilder::new(loader)
            .cache_ttl(Duration::from_secs(300))
            .build();
        load(&manager, &u1);

        let short = EvaluationOptions::default().with_ttl(Duration::from_millis(20));
        let first = manager.evaluate_permission(&u1, "doc.read", None, short).unwrap();
        assert!(!first.from_cache);
        let hit = manager
            .evaluate_permission(&u1, "doc.read", None, EvaluationOptions::default())
            .unwrap();
        assert!(hit.from_cache);

        std::thread::sleep(Duration::from_millis(60));
        let after = manager
            .evaluate_permission(&u1, "doc.read", None, EvaluationOptions::default())
            .unwrap();
        assert!(!after.from_cache);
        assert!(after.granted);
        assert_eq!(manager.get_cache_info().stats.expirations, 1);
    }

    #[test]
    fn has_permission_should_grant_only_held_permissions() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);
        loader.set_roles(&u1, vec![role("writer", vec![permission("doc", "write")])]);
        let manager = manager_with(loader);
        load(&manager, &u1);

        assert!(manager.has_permission(&u1, "doc.read").unwrap());
        assert!(manager.has_permission(&u1, "doc.write").unwrap());
        assert!(!manager.has_permission(&u1, "doc.delete").unwrap());
        assert!(manager.check_permission(&u1, "doc", "write").unwrap());

        let result = manager
            .evaluate_permission(&u1, "doc.delete", None, EvaluationOptions::uncached())
            .unwrap();
        assert_eq!(result.reason, REASON_NOT_FOUND);
    }

    #[test]
    fn evaluate_should_deny_unloaded_principal() {
        let manager = manager_with(Arc::new(TestLoader::default()));
        let result = manager
            .evaluate_permission(&user("ghost"), "doc.read", None, EvaluationOptions::default())
            .unwrap();

        assert!(!result.granted);
        assert_eq!(result.reason, REASON_NOT_LOADED);
    }

    #[test]
    fn evaluate_should_check_team_scope_before_conditions() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        let deploy = permission("service", "deploy")
            .with_scope(Scope::new(crate::ScopeType::Team, ["T1", "T2"]))
            .with_condition(Condition::new("environment.ip", Operator::StartsWith, "10."));
        loader.set_roles(&u1, vec![role("operator", vec![deploy])]);
        let manager = manager_with(loader);
        load(&manager, &u1);

        let out_of_scope = PermissionContext::new()
            .with_metadata("teamId", "T3")
            .with_ip("10.0.0.1");
        let result = manager
            .evaluate_permission(&u1, "service.deploy", Some(out_of_scope), EvaluationOptions::default())
            .unwrap();
        assert!(!result.granted);
        assert!(result.reason.contains("out of scope"));
        assert!(result.condition_results.is_none());

        let in_scope_bad_ip = PermissionContext::new()
            .with_metadata("teamId", "T1")
            .with_ip("192.168.0.1");
        let result = manager
            .evaluate_permission(&u1, "service.deploy", Some(in_scope_bad_ip), EvaluationOptions::default())
            .unwrap();
        assert!(!result.granted);
        assert!(result.reason.contains("environment.ip"));

        let in_scope = PermissionContext::new()
            .with_metadata("teamId", "T1")
            .with_ip("10.1.2.3");
        let result = manager
            .evaluate_permission(&u1, "service.deploy", Some(in_scope), EvaluationOptions::default())
            .unwrap();
        assert!(result.granted);
    }

    #[test]
    fn evaluate_should_fold_conditions_in_declaration_order() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        let approve = permission("expense", "approve")
            .with_condition(Condition::new("resource.amount", Operator::Lte, 1000))
            .with_condition(
                Condition::new("metadata.role", Operator::Eq, "finance")
                    .with_logical(LogicalOperator::Or),
            )
            .with_condition(
                Condition::new("resource.flagged", Operator::Eq, true)
                    .with_logical(LogicalOperator::Not),
            );
        loader.set_direct(&u1, vec![approve]);
        let manager = manager_with(loader);
        load(&manager, &u1);

        let eval = |amount: i64, role: &str, flagged: bool| {
            let ctx = PermissionContext::new()
                .with_resource(Value::object([
                    ("amount", Value::from(amount)),
                    ("flagged", Value::from(flagged)),
                ]))
                .with_metadata("role", role);
            manager
                .evaluate_permission(&u1, "expense.approve", Some(ctx), EvaluationOptions::uncached())
                .unwrap()
                .granted
        };

        assert!(eval(500, "staff", false));
        assert!(!eval(5000, "staff", false));
        assert!(eval(5000, "finance", false));
        assert!(!eval(5000, "finance", true));
    }

    #[test]
    fn cached_decision_should_stay_stale_until_cleared() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);
        let manager = manager_with(Arc::clone(&loader));
        load(&manager, &u1);

        let first = manager
            .evaluate_permission(&u1, "doc.read", None, EvaluationOptions::default())
            .unwrap();
        assert!(first.granted && !first.from_cache);

        loader.set_direct(&u1, Vec::new());
        load(&manager, &u1);

        let second = manager
            .evaluate_permission(&u1, "doc.read", None, EvaluationOptions::default())
            .unwrap();
        assert!(second.granted);
        assert!(second.from_cache);
        assert!(second.condition_results.is_none());

        let fresh = manager
            .evaluate_permission(&u1, "doc.read", None, EvaluationOptions::uncached())
            .unwrap();
        assert!(!fresh.granted);

        manager.clear_user_cache(&u1);
        assert!(!manager.has_permission(&u1, "doc.read").unwrap());
    }

    #[test]
    fn load_should_invalidate_cached_decisions_when_asked() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);
        let manager = manager_with(Arc::clone(&loader));
        load(&manager, &u1);
        assert!(manager.has_permission(&u1, "doc.read").unwrap());

        loader.set_direct(&u1, Vec::new());
        let options = LoadOptions {
            invalidate_cache: true,
            ..LoadOptions::default()
        };
        block_on(manager.load_user_permissions(&u1, options)).unwrap();
        assert!(!manager.has_permission(&u1, "doc.read").unwrap());
    }

    #[test]
    fn cache_key_should_ignore_context_outside_narrowed_view() {
        let u1 = user("u1");
        let manager = manager_with(editor_loader(&u1));
        load(&manager, &u1);

        let granted = manager
            .evaluate_permission(&u1, "article.publish", Some(status_ctx("draft")), EvaluationOptions::default())
            .unwrap();
        assert!(granted.granted);

        let collided = manager
            .evaluate_permission(&u1, "article.publish", Some(status_ctx("published")), EvaluationOptions::default())
            .unwrap();
        assert!(collided.from_cache);
        assert!(collided.granted);

        let separate = PermissionContext::new()
            .with_resource(Value::object([("id", "a-2"), ("status", "published")]));
        let result = manager
            .evaluate_permission(&u1, "article.publish", Some(separate), EvaluationOptions::default())
            .unwrap();
        assert!(!result.from_cache);
        assert!(!result.granted);
    }

    #[test]
    fn failed_load_should_install_nothing() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);
        let manager = manager_with(Arc::clone(&loader));
        load(&manager, &u1);

        loader.set_direct(&u1, Vec::new());
        loader.set_fail(true);
        let err = block_on(manager.load_user_permissions(&u1, LoadOptions::default()))
            .expect_err("loader failure must propagate");
        assert!(matches!(err, Error::LoadFailed { .. }));

        let result = manager
            .evaluate_permission(&u1, "doc.read", None, EvaluationOptions::uncached())
            .unwrap();
        assert!(result.granted);

        let u2 = user("u2");
        assert!(block_on(manager.load_user_permissions(&u2, LoadOptions::default())).is_err());
        assert!(!manager.is_loaded(&u2));
    }

    #[test]
    fn clear_user_permissions_should_drop_data_and_cache() {
        let u1 = user("u1");
        let u2 = user("u2");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);
        loader.set_direct(&u2, vec![permission("doc", "read")]);
        let manager = manager_with(loader);
        load(&manager, &u1);
        load(&manager, &u2);
        manager.has_permission(&u1, "doc.read").unwrap();
        manager.has_permission(&u2, "doc.read").unwrap();
        assert_eq!(manager.get_cache_info().size, 2);

        let cleared = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&cleared);
        manager.events().subscribe(EventKind::CacheCleared, move |event| {
            sink.lock().unwrap().push(event.user_id.clone());
        });

        assert!(manager.clear_user_permissions(&u1));
        assert!(!manager.is_loaded(&u1));
        assert_eq!(manager.get_cache_info().size, 1);
        assert!(!manager.has_permission(&u1, "doc.read").unwrap());
        assert!(manager.has_permission(&u2, "doc.read").unwrap());
        assert_eq!(*cleared.lock().unwrap(), vec![Some(u1)]);
    }

    #[test]
    fn any_and_all_should_follow_individual_checks() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("a", "read")]);
        let manager = manager_with(loader);
        load(&manager, &u1);

        let a = manager.has_permission(&u1, "a.read").unwrap();
        let b = manager.has_permission(&u1, "b.read").unwrap();
        assert_eq!(manager.has_any_permission(&u1, &["a.read", "b.read"]).unwrap(), a || b);
        assert_eq!(manager.has_all_permissions(&u1, &["a.read", "b.read"]).unwrap(), a && b);
        assert!(!manager.has_any_permission::<&str>(&u1, &[]).unwrap());
        assert!(manager.has_all_permissions::<&str>(&u1, &[]).unwrap());
    }

    #[test]
    fn has_role_should_check_held_role_names() {
        let u1 = user("u1");
        let manager = manager_with(editor_loader(&u1));
        load(&manager, &u1);

        assert!(manager.has_role(&u1, "editor"));
        assert!(!manager.has_role(&u1, "admin"));
        assert!(!manager.has_role(&user("u2"), "editor"));
    }

    #[test]
    fn poisoned_store_should_fail_closed_or_error_in_strict_mode() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);

        let lenient = manager_with(Arc::clone(&loader));
        load(&lenient, &u1);
        lenient.store.poison();
        let result = lenient
            .evaluate_permission(&u1, "doc.read", None, EvaluationOptions::default())
            .unwrap();
        assert!(!result.granted);
        assert_eq!(result.reason, REASON_EVALUATION_ERROR);
        assert_eq!(lenient.get_stats().errors, 1);
        assert_eq!(lenient.get_cache_info().size, 0);

        let strict = PermissionManagerBuilder::new(loader).strict_mode(true).build();
        load(&strict, &u1);
        strict.store.poison();
        let err = strict
            .evaluate_permission(&u1, "doc.read", None, EvaluationOptions::default())
            .expect_err("strict mode must propagate");
        assert!(matches!(err, Error::EvaluationFailed { .. }));
        assert!(strict.has_permission(&u1, "doc.read").is_err());
    }

    #[test]
    fn events_should_report_loads_and_decisions() {
        let u1 = user("u1");
        let manager = manager_with(editor_loader(&u1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::PermissionsLoaded,
            EventKind::PermissionGranted,
            EventKind::PermissionDenied,
        ] {
            let sink = Arc::clone(&seen);
            manager.events().subscribe(kind, move |event| {
                sink.lock().unwrap().push((event.kind, event.permission.clone()));
            });
        }

        load(&manager, &u1);
        manager
            .evaluate_permission(&u1, "article.publish", Some(status_ctx("draft")), EvaluationOptions::uncached())
            .unwrap();
        manager.has_permission(&u1, "article.delete").unwrap();
        // Cache hits do not emit.
        manager.has_permission(&u1, "article.delete").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (EventKind::PermissionsLoaded, None),
                (EventKind::PermissionGranted, Some("article.publish".to_string())),
                (EventKind::PermissionDenied, Some("article.delete".to_string())),
            ]
        );
    }

    #[test]
    fn shared_dispatcher_should_see_all_managers() {
        let events = EventDispatcher::shared();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        events.subscribe(EventKind::PermissionDenied, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let loader = Arc::new(TestLoader::default());
        let first = PermissionManagerBuilder::new(Arc::clone(&loader))
            .events(Arc::clone(&events))
            .build();
        let second = PermissionManagerBuilder::new(loader)
            .events(events)
            .build();
        first.has_permission(&user("u1"), "doc.read").unwrap();
        second.has_permission(&user("u1"), "doc.read").unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn prewarm_should_populate_common_permissions() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("dashboard", "view")]);
        let manager = PermissionManagerBuilder::new(loader)
            .prewarm_permissions(["dashboard.view", "reports.export"])
            .build();

        let options = LoadOptions {
            prewarm: true,
            ..LoadOptions::default()
        };
        block_on(manager.load_user_permissions(&u1, options)).unwrap();

        assert_eq!(manager.get_cache_info().size, 2);
        let hit = manager
            .evaluate_permission(&u1, "dashboard.view", None, EvaluationOptions::default())
            .unwrap();
        assert!(hit.from_cache && hit.granted);
    }

    #[test]
    fn disabled_cache_should_never_store() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);
        let manager = PermissionManagerBuilder::new(loader).cache_enabled(false).build();
        load(&manager, &u1);

        assert!(manager.has_permission(&u1, "doc.read").unwrap());
        assert!(manager.has_permission(&u1, "doc.read").unwrap());

        let info = manager.get_cache_info();
        assert!(!info.enabled);
        assert_eq!(info.size, 0);
        assert_eq!(manager.get_stats().evaluations, 2);
    }

    #[test]
    fn cache_strategy_should_be_consulted() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read")]);
        let manager = PermissionManagerBuilder::new(loader)
            .cache_strategy(crate::SkipDenials)
            .build();
        load(&manager, &u1);

        manager.has_permission(&u1, "doc.read").unwrap();
        manager.has_permission(&u1, "doc.write").unwrap();
        assert_eq!(manager.get_cache_info().size, 1);
    }

    #[test]
    fn clear_cache_and_pattern_invalidation_should_remove_entries() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("doc", "read"), permission("doc", "write")]);
        let manager = manager_with(loader);
        load(&manager, &u1);
        manager.has_permission(&u1, "doc.read").unwrap();
        manager.has_permission(&u1, "doc.write").unwrap();

        assert_eq!(manager.invalidate_cache_pattern(r"\|doc\.write\|").unwrap(), 1);
        assert!(matches!(
            manager.invalidate_cache_pattern("(unclosed"),
            Err(Error::InvalidPattern(_))
        ));
        assert_eq!(manager.clear_cache(), 1);
        assert_eq!(manager.get_cache_info().size, 0);
    }

    #[test]
    fn summary_should_list_roles_and_effective_permissions() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        loader.set_direct(&u1, vec![permission("profile", "update")]);
        loader.set_roles(
            &u1,
            vec![role(
                "editor",
                vec![
                    permission("article", "edit")
                        .with_scope(Scope::new(crate::ScopeType::Team, ["T1"])),
                    permission("profile", "update"),
                ],
            )],
        );
        let manager = PermissionManagerBuilder::new(loader)
            .default_scope(crate::ScopeType::Organization)
            .build();
        load(&manager, &u1);

        let summary = manager.get_permission_summary(&u1).unwrap();
        assert_eq!(summary.roles, vec!["editor"]);
        assert_eq!(summary.direct_permissions, vec!["profile.update"]);
        assert_eq!(summary.effective_permissions, vec!["article.edit", "profile.update"]);
        assert_eq!(summary.permission_count, 2);
        assert_eq!(summary.scopes["article.edit"], crate::ScopeType::Team);
        assert_eq!(summary.scopes["profile.update"], crate::ScopeType::Organization);
        assert!(manager.get_permission_summary(&user("u2")).is_none());
        assert_eq!(manager.get_stats().principals_loaded, 1);
    }

    #[test]
    fn parent_roles_should_resolve_when_enabled() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        let viewer = role("viewer", vec![permission("doc", "read")]);
        loader.add_catalog_role(viewer);
        loader.set_roles(
            &u1,
            vec![role("editor", vec![permission("doc", "write")])
                .with_parent(RoleId::try_from("viewer").unwrap())],
        );

        let flat = manager_with(Arc::clone(&loader));
        load(&flat, &u1);
        assert!(!flat.has_permission(&u1, "doc.read").unwrap());

        let hierarchical = PermissionManagerBuilder::new(loader)
            .resolve_parent_roles(true)
            .build();
        load(&hierarchical, &u1);
        assert!(hierarchical.has_permission(&u1, "doc.read").unwrap());
        assert!(hierarchical.has_permission(&u1, "doc.write").unwrap());
        assert!(!hierarchical.has_role(&u1, "viewer"));
        let summary = hierarchical.get_permission_summary(&u1).unwrap();
        assert_eq!(summary.inherited_roles, vec!["viewer"]);
    }

    #[test]
    fn parent_role_cycles_and_depth_should_be_rejected() {
        let u1 = user("u1");
        let loader = Arc::new(TestLoader::default());
        let a = RoleId::try_from("role_a").unwrap();
        let b = RoleId::try_from("role_b").unwrap();
        loader.add_catalog_role(role("role_b", Vec::new()).with_parent(a.clone()));
        loader.set_roles(&u1, vec![role("role_a", Vec::new()).with_parent(b.clone())]);

        let manager = PermissionManagerBuilder::new(Arc::clone(&loader))
            .resolve_parent_roles(true)
            .build();
        let result = block_on(manager.load_user_permissions(&u1, LoadOptions::default()));
        assert!(matches!(result, Err(Error::RoleCycleDetected { .. })));
        assert!(!manager.is_loaded(&u1));

        let c = RoleId::try_from("role_c").unwrap();
        loader.add_catalog_role(role("role_b", Vec::new()).with_parent(c));
        loader.add_catalog_role(role("role_c", Vec::new()));
        let shallow = PermissionManagerBuilder::new(loader)
            .resolve_parent_roles(true)
            .max_inherit_depth(1)
            .build();
        let result = block_on(shallow.load_user_permissions(&u1, LoadOptions::default()));
        assert!(matches!(result, Err(Error::RoleDepthExceeded { .. })));
    }
}
