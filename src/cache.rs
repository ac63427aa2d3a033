use crate::context::PermissionContext;
use std::time::Duration;

/// Hook consulted by [`EvaluationCache::set`](crate::EvaluationCache::set)
/// before a decision is stored.
pub trait CacheStrategy: Send + Sync {
    /// Returns whether the decision may be cached at all.
    fn admit(&self, _key: &str, _granted: bool, _context: Option<&PermissionContext>) -> bool {
        true
    }

    /// Returns the TTL to store the decision with.
    fn ttl(
        &self,
        _key: &str,
        _granted: bool,
        _context: Option<&PermissionContext>,
        default: Duration,
    ) -> Duration {
        default
    }
}

impl<S: CacheStrategy + ?Sized> CacheStrategy for Box<S> {
    fn admit(&self, key: &str, granted: bool, context: Option<&PermissionContext>) -> bool {
        (**self).admit(key, granted, context)
    }

    fn ttl(
        &self,
        key: &str,
        granted: bool,
        context: Option<&PermissionContext>,
        default: Duration,
    ) -> Duration {
        (**self).ttl(key, granted, context, default)
    }
}

/// Caches every decision with the requested TTL.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCacheStrategy;

impl CacheStrategy for DefaultCacheStrategy {}

/// Never caches denials, so a newly granted permission is visible on the
/// next evaluation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipDenials;

impl CacheStrategy for SkipDenials {
    fn admit(&self, _key: &str, granted: bool, _context: Option<&PermissionContext>) -> bool {
        granted
    }
}
