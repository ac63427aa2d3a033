use crate::types::PrincipalId;
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Kinds of events emitted by the permission manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum EventKind {
    PermissionsLoaded,
    PermissionGranted,
    PermissionDenied,
    CacheCleared,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionsLoaded => "PERMISSIONS_LOADED",
            Self::PermissionGranted => "PERMISSION_GRANTED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::CacheCleared => "CACHE_CLEARED",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PermissionEvent {
    pub kind: EventKind,
    /// Absent for manager-wide events such as a full cache clear.
    pub user_id: Option<PrincipalId>,
    pub permission: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, Value>,
}

impl PermissionEvent {
    pub fn new(kind: EventKind, user_id: Option<PrincipalId>) -> Self {
        Self {
            kind,
            user_id,
            permission: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permission = Some(permission.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Handle returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&PermissionEvent) + Send + Sync>;

/// Typed publish/subscribe dispatcher.
///
/// Handlers run synchronously on the emitting thread, outside the
/// dispatcher's lock, so a handler may subscribe or unsubscribe.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a dispatcher meant to be shared between several managers.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&PermissionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut guard = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        guard.entry(kind).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Removes a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut guard = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = guard.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        before != handlers.len()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn emit(&self, event: &PermissionEvent) {
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind)
            .map(|handlers| handlers.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();
        debug!(
            kind = %event.kind,
            user = ?event.user_id,
            permission = ?event.permission,
            subscribers = handlers.len(),
            "permission event"
        );
        for handler in handlers {
            handler(event);
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let counts: HashMap<&EventKind, usize> =
            guard.iter().map(|(kind, handlers)| (kind, handlers.len())).collect();
        f.debug_struct("EventDispatcher")
            .field("subscribers", &counts)
            .finish()
    }
}
