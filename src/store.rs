use crate::error::LoaderError;
use crate::permission::{Permission, Role};
use crate::types::{PrincipalId, RoleId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Source of roles and direct permissions for a principal.
///
/// The engine never persists what it loads; implementations decide where
/// the data comes from.
#[async_trait]
pub trait PermissionLoader: Send + Sync {
    /// Returns roles held by a principal, in lookup order.
    async fn load_roles(&self, user: &PrincipalId) -> std::result::Result<Vec<Role>, LoaderError>;

    /// Returns permissions granted directly to a principal.
    async fn load_direct_permissions(
        &self,
        user: &PrincipalId,
    ) -> std::result::Result<Vec<Permission>, LoaderError>;

    /// Returns a single role definition, used for parent-role resolution.
    ///
    /// The default implementation does not support lookups.
    async fn load_role(&self, _role: &RoleId) -> std::result::Result<Option<Role>, LoaderError> {
        Ok(None)
    }
}

#[async_trait]
impl<T> PermissionLoader for Arc<T>
where
    T: PermissionLoader + ?Sized,
{
    async fn load_roles(&self, user: &PrincipalId) -> std::result::Result<Vec<Role>, LoaderError> {
        (**self).load_roles(user).await
    }

    async fn load_direct_permissions(
        &self,
        user: &PrincipalId,
    ) -> std::result::Result<Vec<Permission>, LoaderError> {
        (**self).load_direct_permissions(user).await
    }

    async fn load_role(&self, role: &RoleId) -> std::result::Result<Option<Role>, LoaderError> {
        (**self).load_role(role).await
    }
}

/// Everything loaded for one principal.
#[derive(Debug, Clone, PartialEq)]
pub struct PrincipalPermissions {
    /// Roles held directly, in lookup order.
    pub roles: Vec<Role>,
    /// Ancestor roles resolved through `parent_role`, looked up after `roles`.
    pub inherited: Vec<Role>,
    pub direct: Vec<Permission>,
    pub loaded_at: DateTime<Utc>,
}

impl PrincipalPermissions {
    pub fn new(roles: Vec<Role>, direct: Vec<Permission>) -> Self {
        Self {
            roles,
            inherited: Vec::new(),
            direct,
            loaded_at: Utc::now(),
        }
    }

    /// Finds a permission by name: direct grants first, then held roles in
    /// order, then inherited roles. First match wins.
    pub fn find_permission(&self, name: &str) -> Option<&Permission> {
        self.direct
            .iter()
            .find(|permission| permission.name == name)
            .or_else(|| {
                self.roles
                    .iter()
                    .chain(&self.inherited)
                    .find_map(|role| role.find_permission(name))
            })
    }

    /// Whether a role with this name is held directly.
    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|role| role.name == name)
    }

    /// All permissions in lookup order.
    pub fn permissions(&self) -> impl Iterator<Item = &Permission> {
        self.direct.iter().chain(
            self.roles
                .iter()
                .chain(&self.inherited)
                .flat_map(|role| role.permissions.iter()),
        )
    }

    /// Sorted, de-duplicated names of the effective permission set.
    pub fn effective_permission_names(&self) -> Vec<String> {
        self.permissions()
            .map(|permission| permission.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// The permission store's lock was poisoned by a panicking writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StorePoisoned;

/// Per-principal holder of loaded roles and permissions.
///
/// Entries are replaced wholesale; readers hold an `Arc` snapshot and never
/// observe a partially installed load. A poisoned lock fails reads (callers
/// deny) while writes recover and keep replacing whole entries.
#[derive(Debug, Default)]
pub struct PermissionStore {
    principals: RwLock<HashMap<PrincipalId, Arc<PrincipalPermissions>>>,
}

impl PermissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(
        &self,
        user: &PrincipalId,
    ) -> Result<Option<Arc<PrincipalPermissions>>, StorePoisoned> {
        let guard = self.principals.read().map_err(|_| StorePoisoned)?;
        Ok(guard.get(user).cloned())
    }

    /// Swaps in a principal's data, returning the previous snapshot.
    pub(crate) fn install(
        &self,
        user: PrincipalId,
        permissions: PrincipalPermissions,
    ) -> Option<Arc<PrincipalPermissions>> {
        let mut guard = self
            .principals
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.insert(user, Arc::new(permissions))
    }

    pub(crate) fn remove(&self, user: &PrincipalId) -> bool {
        let mut guard = self
            .principals
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        guard.remove(user).is_some()
    }

    pub fn contains(&self, user: &PrincipalId) -> bool {
        self.principals
            .read()
            .map(|guard| guard.contains_key(user))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.principals.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let _ = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    let _guard = self.principals.write();
                    panic!("poisoning permission store for test");
                })
                .join()
        });
    }
}
