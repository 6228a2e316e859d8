//! Rule conditions: host tags, host labels, host name and service predicates.
//!
//! Persisted form of a host name condition:
//!
//! ```json
//! ["web01", {"$regex": "db"}]          // positive: any entry matches
//! {"$nor": ["web01", {"$regex": "db"}]} // negated: no entry matches
//! ```
//!
//! Regular expressions match at the start of the subject.

use std::collections::BTreeMap;

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::*;

/// One entry of a host name or service condition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchEntry {
    /// Literal comparison.
    Exact(String),
    /// Regular expression anchored at the start.
    Regex {
        #[serde(rename = "$regex")]
        regex: String,
    },
}

impl MatchEntry {
    pub fn exact(s: impl Into<String>) -> Self {
        MatchEntry::Exact(s.into())
    }

    pub fn regex(s: impl Into<String>) -> Self {
        MatchEntry::Regex { regex: s.into() }
    }

    fn matches(&self, subject: &str, cache: &RegexCache) -> Result<bool> {
        match self {
            MatchEntry::Exact(s) => Ok(s == subject),
            MatchEntry::Regex { regex } => Ok(cache.get(regex)?.is_match(subject)),
        }
    }
}

/// A list of match entries with uniform polarity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchList {
    /// Matches if any entry matches.
    Positive(Vec<MatchEntry>),
    /// Matches if no entry matches.
    Negated {
        #[serde(rename = "$nor")]
        nor: Vec<MatchEntry>,
    },
}

impl MatchList {
    pub fn positive(entries: Vec<MatchEntry>) -> Self {
        MatchList::Positive(entries)
    }

    pub fn negated(entries: Vec<MatchEntry>) -> Self {
        MatchList::Negated { nor: entries }
    }

    pub fn entries(&self) -> &[MatchEntry] {
        match self {
            MatchList::Positive(entries) => entries,
            MatchList::Negated { nor } => nor,
        }
    }

    pub fn is_negated(&self) -> bool {
        matches!(self, MatchList::Negated { .. })
    }

    /// Evaluates the list against `subject`. An empty list never matches,
    /// regardless of polarity.
    pub fn matches(&self, subject: &str, cache: &RegexCache) -> Result<bool> {
        let entries = self.entries();
        if entries.is_empty() {
            return Ok(false);
        }
        let mut any = false;
        for entry in entries {
            if entry.matches(subject, cache)? {
                any = true;
                break;
            }
        }
        Ok(any != self.is_negated())
    }
}

/// Condition on one tag group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagCondition {
    /// The host carries this tag.
    Is(String),
    /// The host does not carry this tag.
    IsNot {
        #[serde(rename = "$ne")]
        ne: String,
    },
    /// The host carries one of these tags.
    OneOf {
        #[serde(rename = "$or")]
        or: Vec<String>,
    },
    /// The host carries none of these tags.
    NoneOf {
        #[serde(rename = "$nor")]
        nor: Vec<String>,
    },
}

impl TagCondition {
    /// Evaluates against the host's tag of the group (None if it has none).
    pub fn matches(&self, host_tag: Option<&str>) -> bool {
        match self {
            TagCondition::Is(tag) => host_tag == Some(tag.as_str()),
            TagCondition::IsNot { ne } => host_tag != Some(ne.as_str()),
            TagCondition::OneOf { or } => host_tag.map_or(false, |t| or.iter().any(|o| o == t)),
            TagCondition::NoneOf { nor } => host_tag.map_or(true, |t| !nor.iter().any(|o| o == t)),
        }
    }
}

/// Condition on one host label.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelCondition {
    Is(String),
    IsNot {
        #[serde(rename = "$ne")]
        ne: String,
    },
}

impl LabelCondition {
    pub fn matches(&self, host_value: Option<&str>) -> bool {
        match self {
            LabelCondition::Is(v) => host_value == Some(v.as_str()),
            LabelCondition::IsNot { ne } => host_value != Some(ne.as_str()),
        }
    }
}

/// The match predicate of a rule.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    /// Folder the rule is declared in; implied by the rule file location.
    #[serde(skip)]
    pub host_folder: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub host_tags: BTreeMap<String, TagCondition>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub host_labels: BTreeMap<String, LabelCondition>,
    /// None matches every host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_name: Option<MatchList>,
    /// None matches every service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_description: Option<MatchList>,
}

/// The host (and optional service) a rule is evaluated against.
#[derive(Clone, Copy, Debug)]
pub struct MatchContext<'a> {
    pub host_name: &'a str,
    pub host_folder: &'a str,
    pub tags: &'a TagGroups,
    pub labels: &'a Labels,
    pub service: Option<&'a str>,
}

impl RuleConditions {
    /// Host part of the predicate: folder scope, tags, labels and host name.
    pub fn matches_host(&self, ctx: &MatchContext<'_>, cache: &RegexCache) -> Result<bool> {
        if !is_transitive_parent(&self.host_folder, ctx.host_folder) {
            return Ok(false);
        }
        for (group, cond) in &self.host_tags {
            if !cond.matches(ctx.tags.get(group).map(String::as_str)) {
                return Ok(false);
            }
        }
        for (key, cond) in &self.host_labels {
            if !cond.matches(ctx.labels.get(key).map(String::as_str)) {
                return Ok(false);
            }
        }
        match &self.host_name {
            Some(list) => list.matches(ctx.host_name, cache),
            None => Ok(true),
        }
    }

    /// Full predicate. A rule with a service condition never matches when no
    /// service is given.
    pub fn matches(&self, ctx: &MatchContext<'_>, cache: &RegexCache) -> Result<bool> {
        if !self.matches_host(ctx, cache)? {
            return Ok(false);
        }
        match (&self.service_description, ctx.service) {
            (None, _) => Ok(true),
            (Some(_), None) => Ok(false),
            (Some(list), Some(service)) => list.matches(service, cache),
        }
    }
}

/// Compiled-regex memo shared by all condition evaluations.
#[derive(Default)]
pub struct RegexCache {
    compiled: DashMap<String, Regex>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the compiled, start-anchored form of `pattern`.
    pub fn get(&self, pattern: &str) -> Result<Regex> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(&format!("^(?:{})", pattern)).map_err(|e| WatoError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.compiled.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(name: &'a str, folder: &'a str, tags: &'a TagGroups, labels: &'a Labels) -> MatchContext<'a> {
        MatchContext {
            host_name: name,
            host_folder: folder,
            tags,
            labels,
            service: None,
        }
    }

    #[test]
    fn test_positive_and_negated_lists() {
        let cache = RegexCache::new();
        let pos = MatchList::positive(vec![MatchEntry::exact("a"), MatchEntry::exact("b")]);
        let neg = MatchList::negated(vec![MatchEntry::exact("a"), MatchEntry::exact("b")]);
        for host in ["a", "b"] {
            assert!(pos.matches(host, &cache).unwrap());
            assert!(!neg.matches(host, &cache).unwrap());
        }
        assert!(!pos.matches("c", &cache).unwrap());
        assert!(neg.matches("c", &cache).unwrap());
    }

    #[test]
    fn test_empty_lists_never_match() {
        let cache = RegexCache::new();
        assert!(!MatchList::positive(vec![]).matches("a", &cache).unwrap());
        assert!(!MatchList::negated(vec![]).matches("a", &cache).unwrap());
    }

    #[test]
    fn test_regex_is_prefix_anchored() {
        let cache = RegexCache::new();
        let list = MatchList::positive(vec![MatchEntry::regex("web")]);
        assert!(list.matches("web01", &cache).unwrap());
        assert!(!list.matches("myweb", &cache).unwrap());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalid_regex() {
        let cache = RegexCache::new();
        let list = MatchList::positive(vec![MatchEntry::regex("(")]);
        assert!(matches!(
            list.matches("x", &cache),
            Err(WatoError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_condition_serde_forms() {
        let conds: RuleConditions = serde_json::from_value(json!({
            "host_tags": {
                "agent": "cmk-agent",
                "criticality": {"$ne": "test"},
                "networking": {"$or": ["lan", "dmz"]},
                "snmp_ds": {"$nor": ["snmp-v1"]}
            },
            "host_labels": {"os": "linux", "env": {"$ne": "dev"}},
            "host_name": {"$nor": ["a", {"$regex": "b.*"}]},
            "service_description": [{"$regex": "CPU"}]
        }))
        .unwrap();

        assert_eq!(conds.host_tags["agent"], TagCondition::Is("cmk-agent".into()));
        assert_eq!(
            conds.host_tags["networking"],
            TagCondition::OneOf {
                or: vec!["lan".into(), "dmz".into()]
            }
        );
        assert_eq!(
            conds.host_labels["env"],
            LabelCondition::IsNot { ne: "dev".into() }
        );
        assert!(conds.host_name.as_ref().unwrap().is_negated());

        let back = serde_json::to_value(&conds).unwrap();
        assert_eq!(back["host_name"], json!({"$nor": ["a", {"$regex": "b.*"}]}));
        assert!(back.get("host_folder").is_none());
    }

    #[test]
    fn test_matches_host() {
        let cache = RegexCache::new();
        let tags: TagGroups = [("agent", "no-agent"), ("criticality", "prod")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let labels: Labels = [("os".to_string(), "linux".to_string())].into_iter().collect();

        let mut conds = RuleConditions {
            host_folder: "linux".into(),
            ..RuleConditions::default()
        };
        conds
            .host_tags
            .insert("criticality".into(), TagCondition::IsNot { ne: "test".into() });
        conds
            .host_labels
            .insert("os".into(), LabelCondition::Is("linux".into()));

        assert!(conds.matches_host(&ctx("h", "linux/db", &tags, &labels), &cache).unwrap());
        assert!(!conds.matches_host(&ctx("h", "windows", &tags, &labels), &cache).unwrap());

        conds
            .host_tags
            .insert("agent".into(), TagCondition::Is("cmk-agent".into()));
        assert!(!conds.matches_host(&ctx("h", "linux", &tags, &labels), &cache).unwrap());
    }

    #[test]
    fn test_service_condition_requires_service() {
        let cache = RegexCache::new();
        let tags = TagGroups::new();
        let labels = Labels::new();
        let conds = RuleConditions {
            service_description: Some(MatchList::positive(vec![MatchEntry::regex("Filesystem")])),
            ..RuleConditions::default()
        };
        let mut c = ctx("h", "", &tags, &labels);
        assert!(!conds.matches(&c, &cache).unwrap());
        c.service = Some("Filesystem /var");
        assert!(conds.matches(&c, &cache).unwrap());
        c.service = Some("CPU load");
        assert!(!conds.matches(&c, &cache).unwrap());
    }
}
