//! Value types exchanged between check plugins and the engine.
//!
//! Check functions yield [`CheckResult`], [`Metric`] and [`IgnoreResults`];
//! discovery functions yield [`Service`]. Anything a plugin function produces
//! enters the engine as a [`PluginValue`] and is filtered by the wrappers in
//! [`crate::check_plugins`].

use crate::error::{PluginError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Parameter mapping handed to discovery and check functions.
pub type Parameters = serde_json::Map<String, Value>;

/// Monitoring state of a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    /// Everything fine.
    Ok,
    /// Warning level reached.
    Warn,
    /// Critical level reached.
    Crit,
    /// State could not be determined.
    Unknown,
}

impl State {
    /// Maps a legacy integer state (0..=3).
    pub fn from_int(value: i64) -> Result<Self> {
        match value {
            0 => Ok(State::Ok),
            1 => Ok(State::Warn),
            2 => Ok(State::Crit),
            3 => Ok(State::Unknown),
            other => Err(PluginError::InvalidValue(format!(
                "state must be in 0..=3, got {}",
                other
            ))),
        }
    }

    /// Integer value of the state.
    pub fn as_int(self) -> i64 {
        match self {
            State::Ok => 0,
            State::Warn => 1,
            State::Crit => 2,
            State::Unknown => 3,
        }
    }

    fn severity(self) -> u8 {
        match self {
            State::Ok => 0,
            State::Warn => 1,
            State::Unknown => 2,
            State::Crit => 3,
        }
    }

    /// Worst of the given states: CRIT > UNKNOWN > WARN > OK.
    ///
    /// An empty input yields `OK`.
    pub fn worst<I: IntoIterator<Item = State>>(states: I) -> State {
        states
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(State::Ok)
    }

    /// Best of the given states; an empty input yields `OK`.
    pub fn best<I: IntoIterator<Item = State>>(states: I) -> State {
        states
            .into_iter()
            .min_by_key(|s| s.severity())
            .unwrap_or(State::Ok)
    }

    /// Marker appended to text lines of this state.
    pub fn marker(self) -> &'static str {
        match self {
            State::Ok => "",
            State::Warn => "(!)",
            State::Crit => "(!!)",
            State::Unknown => "(?)",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Ok => "OK",
            State::Warn => "WARN",
            State::Crit => "CRIT",
            State::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One result line of a check: state, single-line summary and optional
/// multi-line details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub state: State,
    pub summary: String,
    details: Option<String>,
}

impl CheckResult {
    /// Creates a result; the summary must be a single line.
    pub fn new(state: State, summary: impl Into<String>) -> Result<Self> {
        let summary = summary.into();
        if summary.contains('\n') {
            return Err(PluginError::InvalidValue(format!(
                "summary must not contain newlines: {:?}",
                summary
            )));
        }
        Ok(Self {
            state,
            summary,
            details: None,
        })
    }

    /// Result that only shows up in the details.
    pub fn notice(state: State, details: impl Into<String>) -> Self {
        Self {
            state,
            summary: String::new(),
            details: Some(details.into()),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Details text, falling back to the summary.
    pub fn details(&self) -> &str {
        self.details.as_deref().unwrap_or(&self.summary)
    }
}

/// A performance value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub levels: Option<(Option<f64>, Option<f64>)>,
    pub boundaries: Option<(Option<f64>, Option<f64>)>,
}

impl Metric {
    /// Creates a metric; names must be non-empty and free of whitespace,
    /// quotes and `=`.
    pub fn new(name: impl Into<String>, value: f64) -> Result<Self> {
        let name = name.into();
        if name.is_empty()
            || name
                .chars()
                .any(|c| c.is_whitespace() || c == '=' || c == '\'' || c == '"')
        {
            return Err(PluginError::InvalidValue(format!(
                "invalid metric name: {:?}",
                name
            )));
        }
        if !value.is_finite() {
            return Err(PluginError::InvalidValue(format!(
                "metric {} has non-finite value",
                name
            )));
        }
        Ok(Self {
            name,
            value,
            levels: None,
            boundaries: None,
        })
    }

    pub fn with_levels(mut self, warn: Option<f64>, crit: Option<f64>) -> Self {
        if warn.is_some() || crit.is_some() {
            self.levels = Some((warn, crit));
        }
        self
    }

    pub fn with_boundaries(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        if min.is_some() || max.is_some() {
            self.boundaries = Some((min, max));
        }
        self
    }
}

/// Tells the engine to keep the previous results of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreResults {
    pub reason: String,
}

impl IgnoreResults {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Service {
    pub item: Option<String>,
    pub parameters: Option<Parameters>,
    pub labels: BTreeMap<String, String>,
}

impl Service {
    pub fn new(item: Option<&str>) -> Self {
        Self {
            item: item.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// Values a check function is allowed to yield.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutput {
    Result(CheckResult),
    Metric(Metric),
    IgnoreResults(IgnoreResults),
}

/// Any value produced by a plugin function before filtering.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginValue {
    Result(CheckResult),
    Metric(Metric),
    IgnoreResults(IgnoreResults),
    Service(Service),
    /// Anything outside the plugin API, e.g. a bare legacy tuple.
    Raw(Value),
}

impl PluginValue {
    /// Name of the value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            PluginValue::Result(_) => "Result",
            PluginValue::Metric(_) => "Metric",
            PluginValue::IgnoreResults(_) => "IgnoreResults",
            PluginValue::Service(_) => "Service",
            PluginValue::Raw(_) => "raw value",
        }
    }
}

impl From<CheckOutput> for PluginValue {
    fn from(output: CheckOutput) -> Self {
        match output {
            CheckOutput::Result(r) => PluginValue::Result(r),
            CheckOutput::Metric(m) => PluginValue::Metric(m),
            CheckOutput::IgnoreResults(i) => PluginValue::IgnoreResults(i),
        }
    }
}

impl From<CheckResult> for PluginValue {
    fn from(result: CheckResult) -> Self {
        PluginValue::Result(result)
    }
}

impl From<Metric> for PluginValue {
    fn from(metric: Metric) -> Self {
        PluginValue::Metric(metric)
    }
}

impl From<IgnoreResults> for PluginValue {
    fn from(ignore: IgnoreResults) -> Self {
        PluginValue::IgnoreResults(ignore)
    }
}

impl From<Service> for PluginValue {
    fn from(service: Service) -> Self {
        PluginValue::Service(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_state_order() {
        assert_eq!(State::worst([State::Ok, State::Warn]), State::Warn);
        assert_eq!(State::worst([State::Warn, State::Unknown]), State::Unknown);
        assert_eq!(State::worst([State::Unknown, State::Crit, State::Ok]), State::Crit);
        assert_eq!(State::worst([]), State::Ok);
        assert_eq!(State::best([State::Crit, State::Unknown]), State::Unknown);
    }

    #[test]
    fn test_state_from_int() {
        assert_eq!(State::from_int(2).unwrap(), State::Crit);
        assert!(State::from_int(4).is_err());
        assert_eq!(State::Unknown.as_int(), 3);
    }

    #[test]
    fn test_summary_is_single_line() {
        assert!(CheckResult::new(State::Ok, "a\nb").is_err());
        let r = CheckResult::new(State::Ok, "fine").unwrap();
        assert_eq!(r.details(), "fine");
        assert_eq!(r.with_details("x\ny").details(), "x\ny");
    }

    #[test]
    fn test_metric_name_validation() {
        assert!(Metric::new("", 1.0).is_err());
        assert!(Metric::new("fs used", 1.0).is_err());
        assert!(Metric::new("fs_used", f64::NAN).is_err());
        let m = Metric::new("fs_used", 1.0).unwrap().with_levels(None, None);
        assert!(m.levels.is_none());
    }
}
