//! Selection of the check function used for cluster services.

use crate::check_plugins::{CheckFunction, CheckPlugin};
use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How the results of the nodes of a cluster are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// The plugin's own cluster check.
    #[default]
    Native,
    Worst,
    Failover,
    Best,
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterMode::Native => "native",
            ClusterMode::Worst => "worst",
            ClusterMode::Failover => "failover",
            ClusterMode::Best => "best",
        };
        f.write_str(s)
    }
}

impl FromStr for ClusterMode {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(ClusterMode::Native),
            "worst" => Ok(ClusterMode::Worst),
            "failover" => Ok(ClusterMode::Failover),
            "best" => Ok(ClusterMode::Best),
            other => Err(PluginError::InvalidValue(format!(
                "unknown cluster mode {:?}",
                other
            ))),
        }
    }
}

/// The function to run for a cluster service of `plugin` in `mode`.
///
/// Only `native` is implemented; it yields the plugin's cluster check, which
/// is the "not ready for clustered data" fallback when the plugin declares
/// none.
pub fn get_cluster_check_function(mode: ClusterMode, plugin: &CheckPlugin) -> Result<&CheckFunction> {
    match mode {
        ClusterMode::Native => Ok(plugin.cluster_check_function()),
        other => Err(PluginError::NotImplemented(format!(
            "cluster mode {} for {}",
            other,
            plugin.name()
        ))),
    }
}
