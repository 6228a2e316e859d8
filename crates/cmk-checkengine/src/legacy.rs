//! Conversion of legacy check definitions into check plugins.
//!
//! Legacy discovery functions return `(item, params)` pairs and legacy check
//! functions return `(state, text, perfdata)` triples. The converted plugin
//! wraps both so that they speak the current plugin API.

use crate::api::{CheckResult, Metric, Parameters, PluginValue, Service, State};
use crate::check_plugins::{
    create_check_plugin, management_plugin_factory, requires_item, CheckPlugin, CheckPluginSpec,
};
use crate::error::Result;
use crate::function::{CallArgs, PluginFunction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Key under which non-mapping legacy parameters are stored.
pub const PARAMS_WRAPPER_KEY: &str = "auto-migration-wrapper-key";

/// One perfdata entry of a legacy check result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LegacyPerfdata {
    pub name: String,
    pub value: f64,
    pub warn: Option<f64>,
    pub crit: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl LegacyPerfdata {
    pub fn new(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            value,
            ..Self::default()
        }
    }
}

/// A `(state, text, perfdata)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyResult {
    pub state: i64,
    pub text: String,
    #[serde(default)]
    pub perfdata: Vec<LegacyPerfdata>,
}

impl LegacyResult {
    pub fn new(state: i64, text: &str) -> Self {
        Self {
            state,
            text: text.to_string(),
            perfdata: Vec::new(),
        }
    }

    pub fn with_perfdata(mut self, perfdata: LegacyPerfdata) -> Self {
        self.perfdata.push(perfdata);
        self
    }
}

/// Legacy discovery: section in, `(item, params)` pairs out.
pub type LegacyDiscovery = Arc<dyn Fn(&Value) -> Vec<(Option<String>, Value)> + Send + Sync>;

/// Legacy check: item, params and section in, result triples out.
pub type LegacyCheck = Arc<dyn Fn(Option<&str>, &Value, &Value) -> Vec<LegacyResult> + Send + Sync>;

/// Which device a legacy check monitors when a management board is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementBoard {
    #[default]
    HostPrecedence,
    HostOnly,
    MgmtOnly,
}

/// A legacy check definition.
#[derive(Clone)]
pub struct LegacyCheckDefinition {
    /// Legacy name; the part before a dot names the section.
    pub name: String,
    pub service_name: String,
    pub discovery_function: Option<LegacyDiscovery>,
    pub check_function: LegacyCheck,
    pub check_ruleset_name: Option<String>,
    pub check_default_parameters: Option<Value>,
    pub management_board: ManagementBoard,
}

impl LegacyCheckDefinition {
    pub fn new<F>(name: &str, service_name: &str, check_function: F) -> Self
    where
        F: Fn(Option<&str>, &Value, &Value) -> Vec<LegacyResult> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            service_name: service_name.to_string(),
            discovery_function: None,
            check_function: Arc::new(check_function),
            check_ruleset_name: None,
            check_default_parameters: None,
            management_board: ManagementBoard::default(),
        }
    }

    pub fn with_discovery<F>(mut self, discovery: F) -> Self
    where
        F: Fn(&Value) -> Vec<(Option<String>, Value)> + Send + Sync + 'static,
    {
        self.discovery_function = Some(Arc::new(discovery));
        self
    }

    pub fn with_ruleset(mut self, name: &str, defaults: Option<Value>) -> Self {
        self.check_ruleset_name = Some(name.to_string());
        self.check_default_parameters = defaults;
        self
    }

    pub fn with_management_board(mut self, board: ManagementBoard) -> Self {
        self.management_board = board;
        self
    }

    /// Section the legacy check reads.
    pub fn section_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Plugin name of the converted check.
    pub fn plugin_name(&self) -> String {
        self.name.replace('.', "_")
    }
}

impl fmt::Debug for LegacyCheckDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyCheckDefinition")
            .field("name", &self.name)
            .field("service_name", &self.service_name)
            .field("check_ruleset_name", &self.check_ruleset_name)
            .field("management_board", &self.management_board)
            .finish()
    }
}

/// Wraps legacy parameters into a mapping.
pub fn wrap_parameters(params: Value) -> Option<Parameters> {
    match params {
        Value::Null => None,
        Value::Object(map) => Some(map),
        other => {
            let mut map = Parameters::new();
            map.insert(PARAMS_WRAPPER_KEY.to_string(), other);
            Some(map)
        }
    }
}

/// Reverses [`wrap_parameters`].
pub fn unwrap_parameters(params: Option<&Parameters>) -> Value {
    match params {
        None => Value::Null,
        Some(map) if map.len() == 1 && map.contains_key(PARAMS_WRAPPER_KEY) => {
            map[PARAMS_WRAPPER_KEY].clone()
        }
        Some(map) => Value::Object(map.clone()),
    }
}

fn convert_result(result: LegacyResult) -> Vec<PluginValue> {
    let state = match State::from_int(result.state) {
        Ok(state) => state,
        Err(_) => return vec![PluginValue::Raw(json!([result.state, result.text]))],
    };
    let text = result.text.trim();
    let converted = match text.split_once('\n') {
        Some((summary, _)) => CheckResult::new(state, summary.trim()).map(|r| r.with_details(text)),
        None => CheckResult::new(state, text),
    };
    let mut values = vec![match converted {
        Ok(r) => PluginValue::Result(r),
        Err(_) => PluginValue::Raw(json!(result.text)),
    }];
    for perf in result.perfdata {
        values.push(
            match Metric::new(perf.name.clone(), perf.value) {
                Ok(metric) => PluginValue::Metric(
                    metric
                        .with_levels(perf.warn, perf.crit)
                        .with_boundaries(perf.min, perf.max),
                ),
                Err(_) => PluginValue::Raw(json!(perf.name)),
            },
        );
    }
    values
}

/// Converts a legacy definition into a check plugin with item validation
/// disabled.
pub fn create_check_plugin_from_legacy(legacy: &LegacyCheckDefinition) -> Result<CheckPlugin> {
    let section = legacy.section_name().to_string();
    let has_item = requires_item(&legacy.service_name);
    let has_params = legacy.check_ruleset_name.is_some();

    let discovery = legacy.discovery_function.clone();
    let discovery_section = section.clone();
    let discovery_function = PluginFunction::generator(
        &format!("discover_{}", legacy.plugin_name()),
        &["section"],
        move |args: &CallArgs| {
            let Some(discover) = &discovery else {
                return Vec::new();
            };
            let section = args.section(&discovery_section).cloned().unwrap_or(Value::Null);
            discover(&section)
                .into_iter()
                .map(|(item, params)| {
                    let service = Service::new(item.as_deref());
                    match wrap_parameters(params) {
                        Some(params) => service.with_parameters(params).into(),
                        None => service.into(),
                    }
                })
                .collect()
        },
    );

    let mut signature = Vec::new();
    if has_item {
        signature.push("item");
    }
    if has_params {
        signature.push("params");
    }
    signature.push("section");

    let check = legacy.check_function.clone();
    let check_section = section.clone();
    let check_function = PluginFunction::generator(
        &format!("check_{}", legacy.plugin_name()),
        &signature,
        move |args: &CallArgs| {
            let params = unwrap_parameters(args.params.as_ref());
            let section = args.section(&check_section).cloned().unwrap_or(Value::Null);
            check(args.item.as_deref(), &params, &section)
                .into_iter()
                .flat_map(convert_result)
                .collect()
        },
    );

    let mut spec = CheckPluginSpec::new(
        &legacy.plugin_name(),
        &legacy.service_name,
        discovery_function,
        check_function,
    )
    .with_sections(&[section.as_str()])
    .with_module("legacy");
    if let Some(ruleset) = &legacy.check_ruleset_name {
        let defaults = legacy
            .check_default_parameters
            .clone()
            .and_then(wrap_parameters)
            .unwrap_or_default();
        spec = spec.with_check_ruleset(ruleset, Value::Object(defaults));
    }

    let plugin = create_check_plugin(spec, false)?;
    tracing::debug!(legacy = %legacy.name, plugin = %plugin.name(), "converted legacy check");
    Ok(match legacy.management_board {
        ManagementBoard::MgmtOnly => management_plugin_factory(&plugin),
        ManagementBoard::HostPrecedence | ManagementBoard::HostOnly => plugin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CheckOutput;

    fn legacy_df() -> LegacyCheckDefinition {
        LegacyCheckDefinition::new("df", "Filesystem %s", |item, params, section| {
            let used = section[item.unwrap_or("")].as_f64().unwrap_or(0.0);
            let crit = params["levels"][1].as_f64().unwrap_or(90.0);
            let state = if used >= crit { 2 } else { 0 };
            vec![LegacyResult::new(state, &format!("{}% used\nmounted rw", used))
                .with_perfdata(LegacyPerfdata {
                    crit: Some(crit),
                    max: Some(100.0),
                    ..LegacyPerfdata::new("fs_used_percent", used)
                })]
        })
        .with_discovery(|section| {
            section
                .as_object()
                .map(|m| m.keys().map(|k| (Some(k.clone()), Value::Null)).collect())
                .unwrap_or_default()
        })
        .with_ruleset("filesystem", Some(json!({"levels": [80.0, 90.0]})))
    }

    #[test]
    fn test_converted_plugin_shape() {
        let plugin = create_check_plugin_from_legacy(&legacy_df()).unwrap();
        assert_eq!(plugin.name().as_str(), "df");
        assert_eq!(plugin.check_ruleset_name().unwrap().as_str(), "filesystem");
        assert_eq!(
            plugin.check_function().function().parameters(),
            &["item".to_string(), "params".to_string(), "section".to_string()]
        );
        assert_eq!(plugin.module(), Some("legacy"));
    }

    #[test]
    fn test_discovery_and_check() {
        let plugin = create_check_plugin_from_legacy(&legacy_df()).unwrap();
        let section = json!({"/": 42.0, "/var": 95.0});
        let args = CallArgs::new().with_section("df", section.clone());
        let services: Vec<Service> = plugin
            .discovery_function()
            .discover(&args)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(services.len(), 2);

        let args = CallArgs::new()
            .with_item("/var")
            .with_params(plugin.check_default_parameters().cloned().unwrap_or_default())
            .with_section("df", section);
        let output = plugin.check_function().check_all(&args).unwrap();
        match &output[0] {
            CheckOutput::Result(r) => {
                assert_eq!(r.state, State::Crit);
                assert_eq!(r.summary, "95% used");
                assert_eq!(r.details(), "95% used\nmounted rw");
            }
            other => panic!("unexpected {:?}", other),
        }
        match &output[1] {
            CheckOutput::Metric(m) => {
                assert_eq!(m.name, "fs_used_percent");
                assert_eq!(m.levels, Some((None, Some(90.0))));
                assert_eq!(m.boundaries, Some((None, Some(100.0))));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_item_validation_disabled() {
        let legacy = LegacyCheckDefinition::new("uptime", "Uptime", |_, _, _| vec![])
            .with_discovery(|_| vec![(Some("bogus".to_string()), Value::Null)]);
        let plugin = create_check_plugin_from_legacy(&legacy).unwrap();
        assert!(plugin
            .discovery_function()
            .discover(&CallArgs::new())
            .all(|s| s.is_ok()));
    }

    #[test]
    fn test_invalid_state_fails_contract() {
        let legacy = LegacyCheckDefinition::new("uptime", "Uptime", |_, _, _| {
            vec![LegacyResult::new(7, "weird")]
        });
        let plugin = create_check_plugin_from_legacy(&legacy).unwrap();
        assert!(plugin.check_function().check_all(&CallArgs::new()).is_err());
    }

    #[test]
    fn test_dotted_name_and_wrapped_params() {
        let legacy = LegacyCheckDefinition::new("if.64", "Interface %s", |_, params, _| {
            vec![LegacyResult::new(0, &params.to_string())]
        })
        .with_ruleset("if", Some(json!([1, 2])));
        assert_eq!(legacy.section_name(), "if");
        let plugin = create_check_plugin_from_legacy(&legacy).unwrap();
        assert_eq!(plugin.name().as_str(), "if_64");
        let defaults = plugin.check_default_parameters().unwrap();
        assert!(defaults.contains_key(PARAMS_WRAPPER_KEY));

        let args = CallArgs::new().with_item("1").with_params(defaults.clone());
        let output = plugin.check_function().check_all(&args).unwrap();
        assert!(matches!(&output[0], CheckOutput::Result(r) if r.summary == "[1,2]"));
    }

    #[test]
    fn test_management_only() {
        let legacy = LegacyCheckDefinition::new("ipmi", "IPMI Sensor %s", |_, _, _| vec![])
            .with_management_board(ManagementBoard::MgmtOnly);
        let plugin = create_check_plugin_from_legacy(&legacy).unwrap();
        assert_eq!(plugin.name().as_str(), "mgmt_ipmi");
        assert_eq!(plugin.service_name(), "Management Interface: IPMI Sensor %s");
    }
}
