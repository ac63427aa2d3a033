use crate::context::PermissionContext;
use crate::permission::{Scope, ScopeType};

const GLOBAL_SCOPE_VALUE: &str = "global";

/// Result of a scope membership check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeCheck {
    Allowed,
    Denied { reason: String },
}

impl ScopeCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    fn denied(reason: String) -> Self {
        Self::Denied { reason }
    }
}

/// Checks a permission's scope against the evaluation context.
///
/// Exclusions are checked before the allow-list, so a value listed in both
/// is denied. An empty allow-list admits every value that is not excluded.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScopeResolver;

impl ScopeResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, scope: Option<&Scope>, context: &PermissionContext) -> ScopeCheck {
        let Some(scope) = scope else {
            return ScopeCheck::Allowed;
        };
        let Some(value) = Self::extract(scope.scope_type, context) else {
            return ScopeCheck::denied(format!("no scope information for {}", scope.scope_type));
        };
        if scope.excludes.iter().any(|excluded| *excluded == value) {
            return ScopeCheck::denied(format!("{} '{value}' is excluded", scope.scope_type));
        }
        if !scope.values.is_empty() && !scope.values.iter().any(|allowed| *allowed == value) {
            return ScopeCheck::denied(format!("{} '{value}' is out of scope", scope.scope_type));
        }
        ScopeCheck::Allowed
    }

    /// Context value a scope of the given type is matched against.
    pub fn extract(scope_type: ScopeType, context: &PermissionContext) -> Option<String> {
        match scope_type {
            ScopeType::Global => Some(GLOBAL_SCOPE_VALUE.to_string()),
            ScopeType::User => context.user_id.as_ref().map(|user| user.to_string()),
            other => {
                let key = other.metadata_key()?;
                context.metadata_value(key)?.coerce_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipalId;

    fn team_ctx(team: &str) -> PermissionContext {
        PermissionContext::new().with_metadata("teamId", team)
    }

    #[test]
    fn missing_scope_should_allow() {
        let resolver = ScopeResolver::new();
        assert!(resolver.check(None, &PermissionContext::new()).is_allowed());
    }

    #[test]
    fn team_scope_should_check_allow_list() {
        let resolver = ScopeResolver::new();
        let scope = Scope::new(ScopeType::Team, ["T1", "T2"]);

        assert!(resolver.check(Some(&scope), &team_ctx("T1")).is_allowed());
        assert_eq!(
            resolver.check(Some(&scope), &team_ctx("T3")),
            ScopeCheck::Denied {
                reason: "TEAM 'T3' is out of scope".to_string()
            }
        );
    }

    #[test]
    fn exclusion_should_win_over_allow_list() {
        let resolver = ScopeResolver::new();
        let scope = Scope::new(ScopeType::Team, ["T1", "T2"]).with_excludes(["T1"]);

        let check = resolver.check(Some(&scope), &team_ctx("T1"));
        assert_eq!(
            check,
            ScopeCheck::Denied {
                reason: "TEAM 'T1' is excluded".to_string()
            }
        );
    }

    #[test]
    fn empty_allow_list_should_admit_non_excluded_values() {
        let resolver = ScopeResolver::new();
        let scope = Scope::new(ScopeType::Team, Vec::<String>::new()).with_excludes(["T9"]);

        assert!(resolver.check(Some(&scope), &team_ctx("T4")).is_allowed());
        assert!(!resolver.check(Some(&scope), &team_ctx("T9")).is_allowed());
    }

    #[test]
    fn missing_scope_value_should_deny() {
        let resolver = ScopeResolver::new();
        let scope = Scope::new(ScopeType::Organization, ["acme"]);

        let check = resolver.check(Some(&scope), &PermissionContext::new());
        assert_eq!(
            check,
            ScopeCheck::Denied {
                reason: "no scope information for ORGANIZATION".to_string()
            }
        );
    }

    #[test]
    fn user_and_global_scopes_should_resolve() {
        let resolver = ScopeResolver::new();
        let ctx = PermissionContext::for_user(PrincipalId::try_from("u1").unwrap());

        let scope = Scope::new(ScopeType::User, ["u1"]);
        assert!(resolver.check(Some(&scope), &ctx).is_allowed());

        let scope = Scope::new(ScopeType::User, ["u2"]);
        assert!(!resolver.check(Some(&scope), &ctx).is_allowed());

        let scope = Scope::new(ScopeType::Global, Vec::<String>::new());
        assert!(resolver.check(Some(&scope), &PermissionContext::new()).is_allowed());

        let scope = Scope::new(ScopeType::Global, ["global"]).with_excludes(["global"]);
        assert!(!resolver.check(Some(&scope), &ctx).is_allowed());
    }

    #[test]
    fn numeric_metadata_should_match_as_string() {
        let resolver = ScopeResolver::new();
        let scope = Scope::new(ScopeType::Project, ["17"]);
        let ctx = PermissionContext::new().with_metadata("projectId", 17);

        assert!(resolver.check(Some(&scope), &ctx).is_allowed());
    }
}
