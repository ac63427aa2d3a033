use crate::types::{PermissionId, RoleId};
use crate::value::Value;
use std::fmt;

/// Comparison operator of a [`Condition`].
///
/// Operators are parsed leniently: an unknown name is kept as
/// [`Operator::Unrecognized`] and evaluates to `false`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "String", into = "String"))]
pub enum Operator {
    Eq,
    Ne,
    In,
    Nin,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    Unrecognized(String),
}

impl Operator {
    /// Parses an operator name such as `EQ` or `starts_with`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "EQ" => Self::Eq,
            "NE" => Self::Ne,
            "IN" => Self::In,
            "NIN" => Self::Nin,
            "GT" => Self::Gt,
            "GTE" => Self::Gte,
            "LT" => Self::Lt,
            "LTE" => Self::Lte,
            "CONTAINS" => Self::Contains,
            "STARTS_WITH" => Self::StartsWith,
            "ENDS_WITH" => Self::EndsWith,
            "REGEX" => Self::Regex,
            _ => Self::Unrecognized(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Eq => "EQ",
            Self::Ne => "NE",
            Self::In => "IN",
            Self::Nin => "NIN",
            Self::Gt => "GT",
            Self::Gte => "GTE",
            Self::Lt => "LT",
            Self::Lte => "LTE",
            Self::Contains => "CONTAINS",
            Self::StartsWith => "STARTS_WITH",
            Self::EndsWith => "ENDS_WITH",
            Self::Regex => "REGEX",
            Self::Unrecognized(name) => name,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Operator {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Operator> for String {
    fn from(value: Operator) -> Self {
        value.as_str().to_string()
    }
}

/// How a condition folds into the running result of its list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
    Not,
}

/// Predicate over the evaluation context.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Condition {
    /// Dotted path into the context, e.g. `resource.status`.
    pub field: String,
    pub operator: Operator,
    pub value: Value,
    #[cfg_attr(feature = "serde", serde(default))]
    pub logical_operator: Option<LogicalOperator>,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            logical_operator: None,
        }
    }

    /// Sets the positional logical operator.
    pub fn with_logical(mut self, logical: LogicalOperator) -> Self {
        self.logical_operator = Some(logical);
        self
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// Dimension a [`Scope`] restricts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum ScopeType {
    User,
    Organization,
    Department,
    Project,
    Team,
    #[default]
    Global,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Organization => "ORGANIZATION",
            Self::Department => "DEPARTMENT",
            Self::Project => "PROJECT",
            Self::Team => "TEAM",
            Self::Global => "GLOBAL",
        }
    }

    /// Context metadata key holding the scope value, if the type reads metadata.
    pub fn metadata_key(&self) -> Option<&'static str> {
        match self {
            Self::Organization => Some("organizationId"),
            Self::Department => Some("departmentId"),
            Self::Project => Some("projectId"),
            Self::Team => Some("teamId"),
            Self::User | Self::Global => None,
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Include/exclude membership restriction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Scope {
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub scope_type: ScopeType,
    #[cfg_attr(feature = "serde", serde(default))]
    pub values: Vec<String>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub excludes: Vec<String>,
}

impl Scope {
    pub fn new<I, S>(scope_type: ScopeType, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scope_type,
            values: values.into_iter().map(Into::into).collect(),
            excludes: Vec::new(),
        }
    }

    pub fn with_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes = excludes.into_iter().map(Into::into).collect();
        self
    }
}

/// Named grant for a resource/action pair.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Permission {
    pub id: PermissionId,
    /// Lookup name, normally `<resource>.<action>`.
    pub name: String,
    pub resource: String,
    pub action: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub conditions: Vec<Condition>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub scope: Option<Scope>,
}

impl Permission {
    /// Creates an unconditional permission named `<resource>.<action>`.
    pub fn new(id: PermissionId, resource: impl Into<String>, action: impl Into<String>) -> Self {
        let resource = resource.into();
        let action = action.into();
        Self {
            id,
            name: permission_name(&resource, &action),
            resource,
            action,
            conditions: Vec::new(),
            scope: None,
        }
    }

    /// Overrides the lookup name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Returns whether `name` equals `<resource>.<action>`.
    pub fn name_matches_parts(&self) -> bool {
        split_permission_name(&self.name)
            .is_some_and(|(resource, action)| resource == self.resource && action == self.action)
    }
}

/// Named bundle of permissions.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    #[cfg_attr(feature = "serde", serde(default))]
    pub permissions: Vec<Permission>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub parent_role: Option<RoleId>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_system: bool,
}

impl Role {
    pub fn new(id: RoleId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            permissions: Vec::new(),
            parent_role: None,
            is_system: false,
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    pub fn with_parent(mut self, parent: RoleId) -> Self {
        self.parent_role = Some(parent);
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// Finds a permission of this role by lookup name.
    pub fn find_permission(&self, name: &str) -> Option<&Permission> {
        self.permissions.iter().find(|p| p.name == name)
    }
}

/// Composes the lookup name for a resource/action pair.
pub fn permission_name(resource: &str, action: &str) -> String {
    format!("{resource}.{action}")
}

// The action is the last segment; resources may themselves contain dots.
pub(crate) fn split_permission_name(value: &str) -> Option<(&str, &str)> {
    let (resource, action) = value.rsplit_once('.')?;
    if resource.is_empty() || action.is_empty() {
        return None;
    }
    Some((resource, action))
}
