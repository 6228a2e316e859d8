//! Checkmk check engine: plugin API value types, check plugin registration,
//! legacy check conversion, SNMP detection and scan function migration, and
//! cluster service dispatch.

pub mod api;
pub mod check_plugins;
pub mod cluster_modes;
pub mod clusterize;
pub mod detection;
pub mod error;
pub mod function;
pub mod legacy;
pub mod names;
pub mod scan_migration;

pub use api::{CheckOutput, CheckResult, IgnoreResults, Metric, Parameters, PluginValue, Service, State};
pub use check_plugins::{
    create_check_plugin, management_plugin_factory, CheckFunction, CheckPlugin,
    CheckPluginRegistry, CheckPluginSpec, DiscoveryFunction, RuleSetType,
};
pub use cluster_modes::{get_cluster_check_function, ClusterMode};
pub use clusterize::{aggregate_node_details, make_node_notice_results, NodeDetails};
pub use detection::{CompiledDetectionSpec, DetectAtom, DetectionSpec};
pub use error::{PluginError, Result};
pub use function::{CallArgs, PluginFunction};
pub use legacy::{create_check_plugin_from_legacy, LegacyCheckDefinition, LegacyResult};
pub use names::{CheckPluginName, ParsedSectionName, RuleSetName};
pub use scan_migration::{migrate_scan_function, ScanExpr, ScanFunctionMigrator};
