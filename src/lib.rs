//! Conditional RBAC decision engine.
//!
//! This crate evaluates whether a principal holds a named permission
//! (`<resource>.<action>`) through its roles or direct grants, whether the
//! request falls inside the permission's scope, and whether the permission's
//! attribute conditions hold for the request context. Decisions are cached
//! with a TTL and LRU bound. The default behavior is deny-by-default.
//!
//! Use [`PermissionManager`] for evaluation and implement
//! [`PermissionLoader`] to supply roles and permissions.
//!
//! # Examples
//!
//! Basic evaluation flow using the in-memory loader (enable `memory-loader`):
//! ```no_run
//! # #[cfg(feature = "memory-loader")]
//! # {
//! use futures::executor::block_on;
//! use rs_access::{
//!     Condition, EvaluationOptions, LoadOptions, MemoryLoader, Operator, Permission,
//!     PermissionContext, PermissionId, PermissionManager, PrincipalId, Role, RoleId, Value,
//! };
//!
//! let loader = MemoryLoader::new();
//! let editor = RoleId::try_from("editor").unwrap();
//! let publish = Permission::new(PermissionId::try_from("p1").unwrap(), "article", "publish")
//!     .with_condition(Condition::new("resource.status", Operator::Eq, "draft"));
//! loader.add_role(Role::new(editor.clone(), "editor").with_permission(publish));
//! let user = PrincipalId::try_from("u1").unwrap();
//! loader.assign_role(user.clone(), editor);
//!
//! let manager = PermissionManager::builder(loader).build();
//! block_on(manager.load_user_permissions(&user, LoadOptions::default())).unwrap();
//!
//! let context = PermissionContext::new().with_resource(Value::object([("status", "draft")]));
//! let result = manager
//!     .evaluate_permission(&user, "article.publish", Some(context), EvaluationOptions::default())
//!     .unwrap();
//! assert!(result.granted);
//! # }
//! ```
#![forbid(unsafe_code)]

mod cache;
mod condition;
mod config;
mod context;
mod engine;
mod error;
mod evaluation_cache;
mod events;
mod permission;
mod scope;
mod store;
mod types;
mod value;

#[cfg(feature = "memory-loader")]
mod memory_loader;

pub use crate::cache::{CacheStrategy, DefaultCacheStrategy, SkipDenials};
pub use crate::condition::{ConditionEvaluator, ConditionOutcome, ConditionResult, combine};
pub use crate::config::{COMMON_PERMISSIONS, ManagerConfig};
pub use crate::context::{Environment, Location, PermissionContext};
pub use crate::engine::{
    CacheInfo, EvaluationOptions, EvaluationResult, LoadOptions, ManagerStats, PermissionManager,
    PermissionManagerBuilder, PermissionSummary,
};
pub use crate::error::{Error, LoaderError, Result};
pub use crate::evaluation_cache::{CacheStats, EvaluationCache};
pub use crate::events::{EventDispatcher, EventKind, PermissionEvent, SubscriptionId};
pub use crate::permission::{
    Condition, LogicalOperator, Operator, Permission, Role, Scope, ScopeType, permission_name,
};
pub use crate::scope::{ScopeCheck, ScopeResolver};
pub use crate::store::{PermissionLoader, PermissionStore, PrincipalPermissions};
pub use crate::types::{PermissionId, PrincipalId, RoleId};
pub use crate::value::Value;

#[cfg(feature = "memory-loader")]
pub use crate::memory_loader::MemoryLoader;
