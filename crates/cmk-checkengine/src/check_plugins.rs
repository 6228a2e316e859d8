//! Check plugin registration.
//!
//! [`create_check_plugin`] validates a [`CheckPluginSpec`] and produces an
//! immutable [`CheckPlugin`] whose functions are wrapped so that they can only
//! ever yield values of the kinds the plugin API allows.

use crate::api::{CheckOutput, CheckResult, Parameters, PluginValue, Service, State};
use crate::error::{PluginError, Result};
use crate::function::{CallArgs, PluginFunction};
use crate::names::{CheckPluginName, ParsedSectionName, RuleSetName, MANAGEMENT_DESCR_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Placeholder for the item in a service name template.
pub const ITEM_PLACEHOLDER: &str = "%s";

/// Text of the result yielded for plugins without cluster support.
pub const CLUSTER_UNFIT_TEXT: &str =
    "This service is not ready to handle clustered data. Please change your configuration.";

/// How the discovery rules of a ruleset are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSetType {
    /// All matching rule values, as a list.
    #[default]
    All,
    /// Matching dictionary rules merged into one.
    Merged,
}

/// Whether a service name template declares an item.
pub fn requires_item(service_name: &str) -> bool {
    service_name.contains(ITEM_PLACEHOLDER)
}

/// A discovery function that can only yield services.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryFunction {
    function: PluginFunction,
    requires_item: bool,
    validate_item: bool,
}

impl DiscoveryFunction {
    pub fn function(&self) -> &PluginFunction {
        &self.function
    }

    /// Runs discovery. Yields an error in place of the first value that is
    /// not a [`Service`], or whose item presence contradicts the service name.
    pub fn discover<'a>(&'a self, args: &CallArgs) -> impl Iterator<Item = Result<Service>> + 'a {
        self.function
            .call(args)
            .into_iter()
            .map(move |value| self.filter(value))
    }

    fn filter(&self, value: PluginValue) -> Result<Service> {
        let service = match value {
            PluginValue::Service(service) => service,
            other => {
                return Err(PluginError::TypeContract(format!(
                    "{} yielded {} instead of Service",
                    self.function.name(),
                    other.kind()
                )))
            }
        };
        if self.validate_item {
            match (&service.item, self.requires_item) {
                (None, true) => {
                    return Err(PluginError::TypeContract(format!(
                        "{}: discovered Service must have an item",
                        self.function.name()
                    )))
                }
                (Some(item), false) => {
                    return Err(PluginError::TypeContract(format!(
                        "{}: discovered Service must not have an item, got {:?}",
                        self.function.name(),
                        item
                    )))
                }
                _ => {}
            }
        }
        Ok(service)
    }
}

/// A check function that can only yield results, metrics and
/// [`crate::api::IgnoreResults`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckFunction {
    function: PluginFunction,
}

impl CheckFunction {
    pub(crate) fn new(function: PluginFunction) -> Self {
        Self { function }
    }

    pub fn function(&self) -> &PluginFunction {
        &self.function
    }

    /// Runs the check. Yields an error in place of the first value of a kind
    /// check functions must not produce.
    pub fn check<'a>(&'a self, args: &CallArgs) -> impl Iterator<Item = Result<CheckOutput>> + 'a {
        self.function
            .call(args)
            .into_iter()
            .map(move |value| match value {
                PluginValue::Result(r) => Ok(CheckOutput::Result(r)),
                PluginValue::Metric(m) => Ok(CheckOutput::Metric(m)),
                PluginValue::IgnoreResults(i) => Ok(CheckOutput::IgnoreResults(i)),
                other => Err(PluginError::TypeContract(format!(
                    "{} yielded {}; only Result, Metric and IgnoreResults are allowed",
                    self.function.name(),
                    other.kind()
                ))),
            })
    }

    /// Runs the check and collects its output, failing on the first
    /// disallowed value.
    pub fn check_all(&self, args: &CallArgs) -> Result<Vec<CheckOutput>> {
        self.check(args).collect()
    }
}

/// The cluster check installed for plugins that do not declare one.
pub fn unfit_for_clustering() -> PluginFunction {
    PluginFunction::generator("unfit_for_clustering", &[], |_| {
        CheckResult::new(State::Unknown, CLUSTER_UNFIT_TEXT)
            .map(|result| vec![result.into()])
            .unwrap_or_default()
    })
}

/// Registration input for a check plugin.
#[derive(Debug, Clone)]
pub struct CheckPluginSpec {
    pub name: String,
    /// Subscribed parsed sections; defaults to the plugin name when empty.
    pub sections: Vec<String>,
    pub service_name: String,
    pub discovery_function: PluginFunction,
    pub discovery_default_parameters: Option<Value>,
    pub discovery_ruleset_name: Option<String>,
    pub discovery_ruleset_type: RuleSetType,
    pub check_function: PluginFunction,
    pub check_default_parameters: Option<Value>,
    pub check_ruleset_name: Option<String>,
    pub cluster_check_function: Option<PluginFunction>,
    pub module: Option<String>,
}

impl CheckPluginSpec {
    pub fn new(
        name: &str,
        service_name: &str,
        discovery_function: PluginFunction,
        check_function: PluginFunction,
    ) -> Self {
        Self {
            name: name.to_string(),
            sections: Vec::new(),
            service_name: service_name.to_string(),
            discovery_function,
            discovery_default_parameters: None,
            discovery_ruleset_name: None,
            discovery_ruleset_type: RuleSetType::All,
            check_function,
            check_default_parameters: None,
            check_ruleset_name: None,
            cluster_check_function: None,
            module: None,
        }
    }

    pub fn with_sections(mut self, sections: &[&str]) -> Self {
        self.sections = sections.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_discovery_ruleset(mut self, name: &str, defaults: Value, kind: RuleSetType) -> Self {
        self.discovery_ruleset_name = Some(name.to_string());
        self.discovery_default_parameters = Some(defaults);
        self.discovery_ruleset_type = kind;
        self
    }

    pub fn with_check_ruleset(mut self, name: &str, defaults: Value) -> Self {
        self.check_ruleset_name = Some(name.to_string());
        self.check_default_parameters = Some(defaults);
        self
    }

    pub fn with_cluster_check(mut self, function: PluginFunction) -> Self {
        self.cluster_check_function = Some(function);
        self
    }

    pub fn with_module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }
}

/// A validated check plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckPlugin {
    name: CheckPluginName,
    sections: Vec<ParsedSectionName>,
    service_name: String,
    discovery_function: DiscoveryFunction,
    discovery_default_parameters: Option<Parameters>,
    discovery_ruleset_name: Option<RuleSetName>,
    discovery_ruleset_type: RuleSetType,
    check_function: CheckFunction,
    check_default_parameters: Option<Parameters>,
    check_ruleset_name: Option<RuleSetName>,
    cluster_check_function: CheckFunction,
    has_cluster_support: bool,
    module: Option<String>,
}

impl CheckPlugin {
    pub fn name(&self) -> &CheckPluginName {
        &self.name
    }

    pub fn sections(&self) -> &[ParsedSectionName] {
        &self.sections
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn requires_item(&self) -> bool {
        requires_item(&self.service_name)
    }

    /// Service description for an item.
    pub fn service_description(&self, item: Option<&str>) -> String {
        match item {
            Some(item) => self.service_name.replacen(ITEM_PLACEHOLDER, item, 1),
            None => self.service_name.clone(),
        }
    }

    pub fn discovery_function(&self) -> &DiscoveryFunction {
        &self.discovery_function
    }

    pub fn discovery_default_parameters(&self) -> Option<&Parameters> {
        self.discovery_default_parameters.as_ref()
    }

    pub fn discovery_ruleset_name(&self) -> Option<&RuleSetName> {
        self.discovery_ruleset_name.as_ref()
    }

    pub fn discovery_ruleset_type(&self) -> RuleSetType {
        self.discovery_ruleset_type
    }

    pub fn check_function(&self) -> &CheckFunction {
        &self.check_function
    }

    pub fn check_default_parameters(&self) -> Option<&Parameters> {
        self.check_default_parameters.as_ref()
    }

    pub fn check_ruleset_name(&self) -> Option<&RuleSetName> {
        self.check_ruleset_name.as_ref()
    }

    /// The declared cluster check, or the installed fallback.
    pub fn cluster_check_function(&self) -> &CheckFunction {
        &self.cluster_check_function
    }

    /// Whether the plugin author declared a cluster check.
    pub fn has_cluster_support(&self) -> bool {
        self.has_cluster_support
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }
}

/// Checks the service name template against the plugin name.
pub fn validate_service_name(name: &CheckPluginName, service_name: &str) -> Result<()> {
    if service_name.is_empty() {
        return Err(PluginError::InvalidValue(format!(
            "service name of {} must not be empty",
            name
        )));
    }
    if service_name.matches(ITEM_PLACEHOLDER).count() > 1 {
        return Err(PluginError::InvalidValue(format!(
            "service name {:?} of {} must contain {:?} at most once",
            service_name, name, ITEM_PLACEHOLDER
        )));
    }
    let mgmt_descr = service_name.starts_with(MANAGEMENT_DESCR_PREFIX);
    if name.is_management() != mgmt_descr {
        return Err(PluginError::InvalidValue(format!(
            "service name {:?} and plugin name {} must both or neither carry the management prefix",
            service_name, name
        )));
    }
    Ok(())
}

/// Checks that a function is a generator taking exactly the expected
/// positional parameters.
pub fn validate_function_arguments(
    kind: &str,
    function: &PluginFunction,
    has_item: bool,
    has_params: bool,
    sections: &[ParsedSectionName],
) -> Result<()> {
    if !function.is_generator() {
        return Err(PluginError::TypeContract(format!(
            "{} function {} must be a generator",
            kind,
            function.name()
        )));
    }
    let mut expected = Vec::new();
    if has_item {
        expected.push("item".to_string());
    }
    if has_params {
        expected.push("params".to_string());
    }
    match sections {
        [_] => expected.push("section".to_string()),
        _ => expected.extend(sections.iter().map(|s| format!("section_{}", s))),
    }
    if function.parameters() != expected.as_slice() {
        return Err(PluginError::TypeContract(format!(
            "{} function {} has wrong arguments: expected [{}], got [{}]",
            kind,
            function.name(),
            expected.join(", "),
            function.parameters().join(", ")
        )));
    }
    Ok(())
}

/// Checks that defaults and ruleset name are given together and that the
/// defaults are a mapping.
pub fn validate_default_parameters(
    kind: &str,
    ruleset_name: Option<&str>,
    defaults: Option<Value>,
) -> Result<Option<Parameters>> {
    match (ruleset_name, defaults) {
        (None, None) => Ok(None),
        (Some(ruleset), None) => Err(PluginError::TypeContract(format!(
            "missing {} default parameters for ruleset {}",
            kind, ruleset
        ))),
        (None, Some(_)) => Err(PluginError::TypeContract(format!(
            "{} default parameters given without a ruleset name",
            kind
        ))),
        (Some(_), Some(Value::Object(map))) => Ok(Some(map)),
        (Some(_), Some(other)) => Err(PluginError::TypeContract(format!(
            "{} default parameters must be a mapping, got {}",
            kind, other
        ))),
    }
}

fn ruleset_name(name: Option<&str>) -> Result<Option<RuleSetName>> {
    name.map(RuleSetName::new).transpose()
}

/// Validates a registration and builds the plugin.
///
/// With `validate_item` unset, discovered services are not checked for
/// matching item presence.
pub fn create_check_plugin(spec: CheckPluginSpec, validate_item: bool) -> Result<CheckPlugin> {
    let name = CheckPluginName::new(spec.name)?;
    validate_service_name(&name, &spec.service_name)?;
    let has_item = requires_item(&spec.service_name);

    let sections = if spec.sections.is_empty() {
        vec![ParsedSectionName::new(name.as_str())?]
    } else {
        spec.sections
            .into_iter()
            .map(ParsedSectionName::new)
            .collect::<Result<Vec<_>>>()?
    };

    validate_function_arguments(
        "discovery",
        &spec.discovery_function,
        false,
        spec.discovery_ruleset_name.is_some(),
        &sections,
    )?;
    let discovery_default_parameters = validate_default_parameters(
        "discovery",
        spec.discovery_ruleset_name.as_deref(),
        spec.discovery_default_parameters,
    )?;

    validate_function_arguments(
        "check",
        &spec.check_function,
        has_item,
        spec.check_ruleset_name.is_some(),
        &sections,
    )?;
    let check_default_parameters = validate_default_parameters(
        "check",
        spec.check_ruleset_name.as_deref(),
        spec.check_default_parameters,
    )?;

    let has_cluster_support = spec.cluster_check_function.is_some();
    let cluster_check_function = match spec.cluster_check_function {
        Some(function) => {
            validate_function_arguments(
                "cluster check",
                &function,
                has_item,
                spec.check_ruleset_name.is_some(),
                &sections,
            )?;
            function
        }
        None => unfit_for_clustering(),
    };

    tracing::debug!(plugin = %name, sections = sections.len(), "registered check plugin");
    Ok(CheckPlugin {
        discovery_function: DiscoveryFunction {
            function: spec.discovery_function,
            requires_item: has_item,
            validate_item,
        },
        discovery_default_parameters,
        discovery_ruleset_name: ruleset_name(spec.discovery_ruleset_name.as_deref())?,
        discovery_ruleset_type: spec.discovery_ruleset_type,
        check_function: CheckFunction::new(spec.check_function),
        check_default_parameters,
        check_ruleset_name: ruleset_name(spec.check_ruleset_name.as_deref())?,
        cluster_check_function: CheckFunction::new(cluster_check_function),
        has_cluster_support,
        module: spec.module,
        name,
        sections,
        service_name: spec.service_name,
    })
}

/// Derives the management-board variant of a plugin. Only the name and the
/// service name change; the functions are shared.
pub fn management_plugin_factory(original: &CheckPlugin) -> CheckPlugin {
    CheckPlugin {
        name: original.name.to_management(),
        service_name: format!("{}{}", MANAGEMENT_DESCR_PREFIX, original.service_name),
        ..original.clone()
    }
}

/// Registered check plugins by name.
#[derive(Debug, Default)]
pub struct CheckPluginRegistry {
    plugins: BTreeMap<CheckPluginName, CheckPlugin>,
}

impl CheckPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plugin; names must be unique.
    pub fn register(&mut self, plugin: CheckPlugin) -> Result<()> {
        if self.plugins.contains_key(plugin.name()) {
            return Err(PluginError::InvalidValue(format!(
                "duplicate check plugin {}",
                plugin.name()
            )));
        }
        tracing::info!(plugin = %plugin.name(), "check plugin added to registry");
        self.plugins.insert(plugin.name().clone(), plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CheckPlugin> {
        let name = CheckPluginName::new(name).ok()?;
        self.plugins.get(&name)
    }

    /// Plugins subscribing to the given parsed section.
    pub fn subscribers<'a>(&'a self, section: &'a str) -> impl Iterator<Item = &'a CheckPlugin> + 'a {
        self.plugins
            .values()
            .filter(move |p| p.sections().iter().any(|s| s.as_str() == section))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CheckPlugin> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
