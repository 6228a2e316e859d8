//! Validated names for plugins, parsed sections and rulesets.

use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Plugin name prefix of management-board plugins.
pub const MANAGEMENT_NAME_PREFIX: &str = "mgmt_";

/// Service name prefix of management-board plugins.
pub const MANAGEMENT_DESCR_PREFIX: &str = "Management Interface: ";

fn validate(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PluginError::InvalidValue(format!("{} must not be empty", kind)));
    }
    if let Some(bad) = name.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Err(PluginError::InvalidValue(format!(
            "invalid character {:?} in {} {:?}",
            bad, kind, name
        )));
    }
    Ok(())
}

macro_rules! plugin_name_type {
    ($(#[$doc:meta])* $ty:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $ty(String);

        impl $ty {
            pub fn new(name: impl Into<String>) -> Result<Self> {
                let name = name.into();
                validate($kind, &name)?;
                Ok(Self(name))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $ty {
            type Error = PluginError;

            fn try_from(name: String) -> Result<Self> {
                Self::new(name)
            }
        }

        impl From<$ty> for String {
            fn from(name: $ty) -> String {
                name.0
            }
        }
    };
}

plugin_name_type!(
    /// Name of a check plugin.
    CheckPluginName,
    "check plugin name"
);

plugin_name_type!(
    /// Name of a parsed section a plugin subscribes to.
    ParsedSectionName,
    "parsed section name"
);

plugin_name_type!(
    /// Name of a ruleset providing plugin parameters.
    RuleSetName,
    "ruleset name"
);

impl CheckPluginName {
    pub fn is_management(&self) -> bool {
        self.0.starts_with(MANAGEMENT_NAME_PREFIX)
    }

    /// The management-board variant of this name.
    pub fn to_management(&self) -> Self {
        Self(format!("{}{}", MANAGEMENT_NAME_PREFIX, self.0))
    }
}
