//! Introspectable plugin functions.
//!
//! A [`PluginFunction`] pairs a callable with the signature it was declared
//! with: its positional parameter names and whether it produces values
//! incrementally. Registration checks the signature against the contract of
//! the plugin before the function is ever invoked.

use crate::api::{Parameters, PluginValue};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Arguments of a single invocation.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub item: Option<String>,
    pub params: Option<Parameters>,
    /// Parsed sections by section name. For cluster checks each value is a
    /// mapping from node name to that node's section.
    pub sections: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, item: &str) -> Self {
        self.item = Some(item.to_string());
        self
    }

    pub fn with_params(mut self, params: Parameters) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_section(mut self, name: &str, section: Value) -> Self {
        self.sections.insert(name.to_string(), section);
        self
    }

    /// The only section, or the one of the given name.
    pub fn section(&self, name: &str) -> Option<&Value> {
        self.sections.get(name)
    }
}

/// Body of a plugin function.
pub type FunctionBody = Arc<dyn Fn(&CallArgs) -> Vec<PluginValue> + Send + Sync>;

/// A callable plus its declared signature.
#[derive(Clone)]
pub struct PluginFunction {
    name: String,
    parameters: Vec<String>,
    generator: bool,
    body: FunctionBody,
}

impl PluginFunction {
    /// A function producing its values incrementally.
    pub fn generator<F>(name: &str, parameters: &[&str], body: F) -> Self
    where
        F: Fn(&CallArgs) -> Vec<PluginValue> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            generator: true,
            body: Arc::new(body),
        }
    }

    /// A function returning its values in one go. Not accepted as a
    /// discovery or check function.
    pub fn returning<F>(name: &str, parameters: &[&str], body: F) -> Self
    where
        F: Fn(&CallArgs) -> Vec<PluginValue> + Send + Sync + 'static,
    {
        Self {
            generator: false,
            ..Self::generator(name, parameters, body)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn is_generator(&self) -> bool {
        self.generator
    }

    /// Invokes the function without any output filtering.
    pub fn call(&self, args: &CallArgs) -> Vec<PluginValue> {
        (self.body)(args)
    }

    /// Whether both wrap the very same callable.
    pub fn same_body(&self, other: &PluginFunction) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }
}

impl PartialEq for PluginFunction {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.parameters == other.parameters
            && self.generator == other.generator
            && self.same_body(other)
    }
}

impl fmt::Debug for PluginFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.parameters.join(", "))
    }
}
