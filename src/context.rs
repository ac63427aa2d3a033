use crate::types::PrincipalId;
use crate::value::Value;
use chrono::{DateTime, Local, Utc};
use std::collections::BTreeMap;

/// Geographic location of the request origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Location {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Request environment attached to a [`PermissionContext`].
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Environment {
    pub ip: Option<String>,
    pub location: Option<Location>,
    pub time: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
}

/// Per-call evaluation context.
///
/// Conditions address it through dotted paths rooted at `userId`, `resource`,
/// `action`, `environment` and `metadata` (see [`PermissionContext::to_value`]).
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase", default))]
pub struct PermissionContext {
    pub user_id: Option<PrincipalId>,
    pub resource: Option<Value>,
    pub action: Option<String>,
    pub environment: Environment,
    pub metadata: BTreeMap<String, Value>,
}

impl PermissionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(user: PrincipalId) -> Self {
        Self {
            user_id: Some(user),
            ..Self::default()
        }
    }

    pub fn with_resource(mut self, resource: impl Into<Value>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.environment.ip = Some(ip.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.environment
            .location
            .get_or_insert_with(Location::default)
            .country = Some(country.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.environment.location = Some(location);
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.environment.time = Some(time);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Binds the context to `user` and fills environment defaults
    /// (current time, local timezone) that the caller left unset.
    pub(crate) fn with_defaults(mut self, user: &PrincipalId, now: DateTime<Utc>) -> Self {
        self.user_id = Some(user.clone());
        if self.environment.time.is_none() {
            self.environment.time = Some(now);
        }
        if self.environment.timezone.is_none() {
            self.environment.timezone = Some(Local::now().offset().to_string());
        }
        self
    }

    /// Identifier of the target resource: a plain string resource, or the
    /// `id` field of a map resource.
    pub fn resource_id(&self) -> Option<String> {
        match self.resource.as_ref()? {
            resource @ Value::Map(_) => resource.get("id")?.coerce_string(),
            other => other.coerce_string(),
        }
    }

    pub fn country(&self) -> Option<&str> {
        self.environment.location.as_ref()?.country.as_deref()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key).filter(|value| !value.is_null())
    }

    /// Projects the context into the tree conditions are resolved against.
    pub fn to_value(&self) -> Value {
        let mut root = BTreeMap::new();
        if let Some(user) = &self.user_id {
            root.insert("userId".to_string(), Value::from(user.as_str()));
        }
        if let Some(resource) = &self.resource {
            root.insert("resource".to_string(), resource.clone());
        }
        if let Some(action) = &self.action {
            root.insert("action".to_string(), Value::from(action.as_str()));
        }

        let env = &self.environment;
        let mut environment = BTreeMap::new();
        if let Some(ip) = &env.ip {
            environment.insert("ip".to_string(), Value::from(ip.as_str()));
        }
        if let Some(location) = &env.location {
            environment.insert(
                "location".to_string(),
                Value::object([
                    ("country", Value::from(location.country.clone())),
                    ("region", Value::from(location.region.clone())),
                    ("city", Value::from(location.city.clone())),
                ]),
            );
        }
        if let Some(time) = env.time {
            environment.insert("time".to_string(), Value::from(time.timestamp_millis()));
        }
        if let Some(timezone) = &env.timezone {
            environment.insert("timezone".to_string(), Value::from(timezone.as_str()));
        }
        root.insert("environment".to_string(), Value::Map(environment));
        root.insert("metadata".to_string(), Value::Map(self.metadata.clone()));
        Value::Map(root)
    }
}
