use crate::error::LoaderError;
use crate::permission::{Permission, Role};
use crate::store::PermissionLoader;
use crate::types::{PrincipalId, RoleId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// In-memory loader for tests and demos.
///
/// Role definitions live in a catalog; principals are assigned catalog roles
/// by id. Assignments to roles missing from the catalog are ignored at load
/// time.
#[derive(Debug, Default, Clone)]
pub struct MemoryLoader {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    roles: RwLock<HashMap<RoleId, Role>>,
    assignments: RwLock<HashMap<PrincipalId, Vec<RoleId>>>,
    direct: RwLock<HashMap<PrincipalId, Vec<Permission>>>,
    failure: RwLock<Option<String>>,
}

impl MemoryLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a role definition.
    pub fn add_role(&self, role: Role) {
        let mut guard = self.inner.roles.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(role.id.clone(), role);
    }

    /// Assigns a catalog role to a principal. Assignment order is lookup order.
    pub fn assign_role(&self, user: PrincipalId, role: RoleId) {
        let mut guard = self
            .inner
            .assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let roles = guard.entry(user).or_default();
        if !roles.contains(&role) {
            roles.push(role);
        }
    }

    /// Removes a role assignment. Returns whether it existed.
    pub fn revoke_role(&self, user: &PrincipalId, role: &RoleId) -> bool {
        let mut guard = self
            .inner
            .assignments
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(roles) = guard.get_mut(user) else {
            return false;
        };
        let before = roles.len();
        roles.retain(|held| held != role);
        before != roles.len()
    }

    /// Grants a permission directly to a principal.
    pub fn add_direct_permission(&self, user: PrincipalId, permission: Permission) {
        let mut guard = self.inner.direct.write().unwrap_or_else(PoisonError::into_inner);
        guard.entry(user).or_default().push(permission);
    }

    /// Makes every subsequent load fail with `message`; `None` restores
    /// normal operation.
    pub fn set_failure(&self, message: Option<&str>) {
        let mut guard = self.inner.failure.write().unwrap_or_else(PoisonError::into_inner);
        *guard = message.map(ToString::to_string);
    }

    fn check_failure(&self) -> std::result::Result<(), LoaderError> {
        let guard = self.inner.failure.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_deref() {
            Some(message) => Err(message.into()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PermissionLoader for MemoryLoader {
    async fn load_roles(&self, user: &PrincipalId) -> std::result::Result<Vec<Role>, LoaderError> {
        self.check_failure()?;
        let assignments = self
            .inner
            .assignments
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(held) = assignments.get(user) else {
            return Ok(Vec::new());
        };
        let roles = self.inner.roles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(held.iter().filter_map(|id| roles.get(id).cloned()).collect())
    }

    async fn load_direct_permissions(
        &self,
        user: &PrincipalId,
    ) -> std::result::Result<Vec<Permission>, LoaderError> {
        self.check_failure()?;
        let guard = self.inner.direct.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(user).cloned().unwrap_or_default())
    }

    async fn load_role(&self, role: &RoleId) -> std::result::Result<Option<Role>, LoaderError> {
        self.check_failure()?;
        let guard = self.inner.roles.read().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(role).cloned())
    }
}
