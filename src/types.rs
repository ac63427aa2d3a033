use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::fmt;

const MAX_ID_LEN: usize = 128;

fn validate_id(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_ID_LEN {
        return Err(Error::InvalidId(format!(
            "{kind} length must be <= {MAX_ID_LEN}"
        )));
    }
    if !trimmed.chars().all(is_allowed_id_char) {
        return Err(Error::InvalidId(format!("{kind} contains invalid characters")));
    }
    Ok(trimmed.to_string())
}

// `|` is reserved as the cache key separator and never appears in ids.
fn is_allowed_id_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-' | '.' | '@')
}

macro_rules! define_id_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_id(value.as_ref(), $kind).map(Self)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }
    };
}

define_id_type!(
    /// Principal (user) identifier.
    PrincipalId,
    "principal id"
);
define_id_type!(
    /// Role identifier.
    RoleId,
    "role id"
);
define_id_type!(
    /// Permission identifier.
    PermissionId,
    "permission id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_id_should_trim_input() {
        let principal = PrincipalId::try_from("  user_1 ").expect("principal id");
        assert_eq!(principal.as_str(), "user_1");
    }

    #[test]
    fn principal_id_should_accept_email_like_ids() {
        let principal = PrincipalId::try_from("jane.doe@example.com").expect("principal id");
        assert_eq!(principal.to_string(), "jane.doe@example.com");
    }

    #[test]
    fn id_should_reject_cache_separator() {
        let err = RoleId::try_from("editor|admin").expect_err("must reject");
        assert!(err.to_string().contains("role id"));
    }

    #[test]
    fn id_should_reject_empty_and_oversized_input() {
        assert!(matches!(PermissionId::try_from("   "), Err(Error::InvalidId(_))));
        let long = "a".repeat(MAX_ID_LEN + 1);
        assert!(matches!(PermissionId::try_from(long), Err(Error::InvalidId(_))));
    }
}
