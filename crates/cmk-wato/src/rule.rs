//! A single configuration rule and its persisted record formats.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conditions::*;
use crate::ruleset::Rulespec;
use crate::tags::TagConfig;
use crate::types::*;

/// Host list sentinel matching every host.
pub const ALL_HOSTS: &str = "@all";

/// Item list sentinel matching every service.
pub const ALL_SERVICES: &str = "";

/// Provenance of a rule owned by an automation program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalIdent {
    pub site_id: String,
    pub program_id: String,
    pub instance_id: String,
}

/// Rule metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleOptions {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub docu_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<GlobalIdent>,
}

/// One conditional configuration entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub id: String,
    pub ruleset_name: String,
    pub folder_path: String,
    pub value: Value,
    pub conditions: RuleConditions,
    pub options: RuleOptions,
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Rule {
    /// Creates a rule with a fresh id and unconditional match.
    pub fn new(ruleset_name: &str, folder_path: &str, value: Value) -> Self {
        let folder_path = normalize_path(folder_path);
        Self {
            id: new_id(),
            ruleset_name: ruleset_name.to_string(),
            conditions: RuleConditions {
                host_folder: folder_path.clone(),
                ..RuleConditions::default()
            },
            folder_path,
            value,
            options: RuleOptions::default(),
        }
    }

    /// Creates a rule whose value is the rulespec's default value.
    pub fn from_ruleset_defaults(rulespec: &Rulespec, folder_path: &str) -> Self {
        Self::new(&rulespec.name, folder_path, rulespec.default_value.clone())
    }

    /// A copy with a fresh id.
    pub fn clone_with_new_id(&self) -> Self {
        Self {
            id: new_id(),
            ..self.clone()
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.options.disabled
    }

    pub fn is_locked(&self) -> bool {
        self.options.locked_by.is_some()
    }

    /// Evaluates the rule's conditions. Disabled rules never match.
    pub fn matches(&self, ctx: &MatchContext<'_>, cache: &RegexCache) -> Result<bool> {
        if self.is_disabled() {
            return Ok(false);
        }
        self.conditions.matches(ctx, cache)
    }

    /// Moves the rule to another folder, keeping the condition scope in sync.
    pub fn set_folder(&mut self, folder_path: &str) {
        self.folder_path = normalize_path(folder_path);
        self.conditions.host_folder = self.folder_path.clone();
    }

    pub fn to_record(&self) -> RuleRecord {
        RuleRecord::Dict(DictRule {
            id: self.id.clone(),
            value: self.value.clone(),
            condition: self.conditions.clone(),
            options: self.options.clone(),
        })
    }
}

/// Current persisted rule format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DictRule {
    #[serde(default = "new_id")]
    pub id: String,
    pub value: Value,
    #[serde(default)]
    pub condition: RuleConditions,
    #[serde(default)]
    pub options: RuleOptions,
}

/// A persisted rule record: the current dict form or a legacy positional
/// tuple.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RuleRecord {
    Dict(DictRule),
    LegacyTuple(Vec<Value>),
}

impl<'de> Deserialize<'de> for RuleRecord {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Structs would also accept sequences, so branch on the JSON shape.
        match Value::deserialize(deserializer)? {
            Value::Array(parts) => Ok(RuleRecord::LegacyTuple(parts)),
            other => serde_json::from_value(other)
                .map(RuleRecord::Dict)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// What the upgrade of a legacy record needs to know about its ruleset.
pub struct UpgradeContext<'a> {
    pub ruleset_name: &'a str,
    pub folder_path: &'a str,
    pub item_required: bool,
    pub tag_config: &'a TagConfig,
}

impl RuleRecord {
    /// Converts the record into the in-memory rule representation.
    pub fn upgrade(self, ctx: &UpgradeContext<'_>) -> Result<Rule> {
        let folder_path = normalize_path(ctx.folder_path);
        let (id, value, mut conditions, options) = match self {
            RuleRecord::Dict(d) => (d.id, d.value, d.condition, d.options),
            RuleRecord::LegacyTuple(parts) => {
                let (value, conditions, options) = parse_legacy_tuple(parts, ctx)?;
                (new_id(), value, conditions, options)
            }
        };
        conditions.host_folder = folder_path.clone();
        Ok(Rule {
            id,
            ruleset_name: ctx.ruleset_name.to_string(),
            folder_path,
            value,
            conditions,
            options,
        })
    }
}

fn invalid(ctx: &UpgradeContext<'_>, msg: impl std::fmt::Display) -> WatoError {
    WatoError::user_input(format!(
        "Invalid rule in ruleset '{}' of folder '{}': {}",
        ctx.ruleset_name, ctx.folder_path, msg
    ))
}

fn string_list(ctx: &UpgradeContext<'_>, value: &Value, what: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| invalid(ctx, format!("{} must be a list of strings", what)))
}

/// Layouts: `(value, [tags], hosts, [items], options?)` with item, or
/// `(value, [tags], hosts, options?)` without. The tag list is optional.
fn parse_legacy_tuple(
    mut parts: Vec<Value>,
    ctx: &UpgradeContext<'_>,
) -> Result<(Value, RuleConditions, RuleOptions)> {
    let options = match parts.last() {
        Some(Value::Object(_)) if parts.len() >= 2 => {
            let raw = parts.pop().unwrap_or_default();
            serde_json::from_value(raw).map_err(|e| invalid(ctx, e))?
        }
        _ => RuleOptions::default(),
    };
    if parts.is_empty() {
        return Err(invalid(ctx, "missing rule value"));
    }
    let value = parts.remove(0);

    let lists = parts
        .iter()
        .enumerate()
        .map(|(i, v)| string_list(ctx, v, &format!("element {}", i + 1)))
        .collect::<Result<Vec<_>>>()?;

    let (tags, hosts, items) = match (ctx.item_required, lists.len()) {
        (true, 3) => (Some(&lists[0]), &lists[1], Some(&lists[2])),
        (true, 2) => (None, &lists[0], Some(&lists[1])),
        (false, 2) => (Some(&lists[0]), &lists[1], None),
        (false, 1) => (None, &lists[0], None),
        (_, n) => return Err(invalid(ctx, format!("unexpected number of elements ({})", n))),
    };

    let mut conditions = RuleConditions::default();
    if let Some(tags) = tags {
        for spec in tags {
            let (negate, tag) = match spec.strip_prefix('!') {
                Some(tag) => (true, tag),
                None => (false, spec.as_str()),
            };
            let group = ctx
                .tag_config
                .group_of_tag(tag)
                .ok_or_else(|| invalid(ctx, format!("unknown tag '{}'", tag)))?;
            let cond = if negate {
                TagCondition::IsNot { ne: tag.to_string() }
            } else {
                TagCondition::Is(tag.to_string())
            };
            conditions.host_tags.insert(group.to_string(), cond);
        }
    }
    conditions.host_name = parse_host_list(hosts).map_err(|e| invalid(ctx, e))?;
    if let Some(items) = items {
        conditions.service_description = parse_item_list(items).map_err(|e| invalid(ctx, e))?;
    }
    Ok((value, conditions, options))
}

fn split_polarity(
    entries: &[&String],
    to_entry: impl Fn(&str) -> MatchEntry,
) -> std::result::Result<Option<MatchList>, String> {
    let negated: Vec<MatchEntry> = entries
        .iter()
        .filter_map(|e| e.strip_prefix('!'))
        .map(&to_entry)
        .collect();
    let positive: Vec<MatchEntry> = entries
        .iter()
        .filter(|e| !e.starts_with('!'))
        .map(|e| to_entry(e))
        .collect();
    match (positive.is_empty(), negated.is_empty()) {
        (_, true) => Ok(Some(MatchList::positive(positive))),
        (true, false) => Ok(Some(MatchList::negated(negated))),
        (false, false) => Err("mixed positive and negated entries are not supported".to_string()),
    }
}

/// Parses a legacy host list. `@all` alone matches every host; negated
/// entries followed by `@all` match every host except those.
pub fn parse_host_list(hosts: &[String]) -> std::result::Result<Option<MatchList>, String> {
    let has_all = hosts.iter().any(|h| h == ALL_HOSTS);
    let rest: Vec<&String> = hosts.iter().filter(|h| *h != ALL_HOSTS).collect();
    if has_all && !rest.iter().any(|h| h.starts_with('!')) {
        return Ok(None);
    }
    split_polarity(&rest, |h| match h.strip_prefix('~') {
        Some(re) => MatchEntry::regex(re),
        None => MatchEntry::exact(h),
    })
}

/// Parses a legacy item list. The empty string matches every service;
/// entries are regular expressions.
pub fn parse_item_list(items: &[String]) -> std::result::Result<Option<MatchList>, String> {
    let has_all = items.iter().any(|i| i == ALL_SERVICES);
    let rest: Vec<&String> = items.iter().filter(|i| *i != ALL_SERVICES).collect();
    if has_all && !rest.iter().any(|i| i.starts_with('!')) {
        return Ok(None);
    }
    split_polarity(&rest, |i| MatchEntry::regex(i))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upgrade(record: Value, item_required: bool) -> Result<Rule> {
        let tags = TagConfig::builtin();
        let record: RuleRecord = serde_json::from_value(record).unwrap();
        record.upgrade(&UpgradeContext {
            ruleset_name: "test",
            folder_path: "/linux/",
            item_required,
            tag_config: &tags,
        })
    }

    #[test]
    fn test_dict_record() {
        let rule = upgrade(
            json!({
                "id": "r1",
                "value": {"levels": [80, 90]},
                "condition": {"host_name": ["a"]},
                "options": {"description": "desc"}
            }),
            false,
        )
        .unwrap();
        assert_eq!(rule.id, "r1");
        assert_eq!(rule.folder_path, "linux");
        assert_eq!(rule.conditions.host_folder, "linux");
        assert_eq!(rule.options.description, "desc");
        assert_eq!(
            rule.conditions.host_name,
            Some(MatchList::positive(vec![MatchEntry::exact("a")]))
        );
    }

    #[test]
    fn test_legacy_tuple_without_item() {
        let rule = upgrade(
            json!(["grp", ["lan", "!test"], ["a", "~web"], {"disabled": true}]),
            false,
        )
        .unwrap();
        assert_eq!(rule.value, json!("grp"));
        assert!(rule.options.disabled);
        assert_eq!(rule.conditions.host_tags["networking"], TagCondition::Is("lan".into()));
        assert_eq!(
            rule.conditions.host_tags["criticality"],
            TagCondition::IsNot { ne: "test".into() }
        );
        assert_eq!(
            rule.conditions.host_name,
            Some(MatchList::positive(vec![
                MatchEntry::exact("a"),
                MatchEntry::regex("web")
            ]))
        );
        assert!(!rule.id.is_empty());
    }

    #[test]
    fn test_legacy_tuple_with_item() {
        let rule = upgrade(json!([{"x": 1}, ["!a", "!b", "@all"], ["!/var", ""]]), true).unwrap();
        assert_eq!(rule.value, json!({"x": 1}));
        assert_eq!(
            rule.conditions.host_name,
            Some(MatchList::negated(vec![
                MatchEntry::exact("a"),
                MatchEntry::exact("b")
            ]))
        );
        assert_eq!(
            rule.conditions.service_description,
            Some(MatchList::negated(vec![MatchEntry::regex("/var")]))
        );
    }

    #[test]
    fn test_legacy_catch_all() {
        let rule = upgrade(json!([true, ["@all"], [""]]), true).unwrap();
        assert_eq!(rule.conditions.host_name, None);
        assert_eq!(rule.conditions.service_description, None);
    }

    #[test]
    fn test_legacy_mixed_polarity_rejected() {
        assert!(matches!(
            upgrade(json!([1, ["a", "!b"]]), false),
            Err(WatoError::UserInput(_))
        ));
    }

    #[test]
    fn test_legacy_unknown_tag_rejected() {
        assert!(upgrade(json!([1, ["nonsense"], ["@all"]]), false).is_err());
    }

    #[test]
    fn test_to_record_omits_defaults() {
        let rule = Rule::new("ruleset", "a/b", json!(5));
        let value = serde_json::to_value(rule.to_record()).unwrap();
        assert_eq!(value["value"], json!(5));
        assert_eq!(value["condition"], json!({}));
        assert_eq!(value["options"], json!({}));
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let cache = RegexCache::new();
        let tags = TagGroups::new();
        let labels = Labels::new();
        let mut rule = Rule::new("r", "", json!(1));
        let ctx = MatchContext {
            host_name: "h",
            host_folder: "",
            tags: &tags,
            labels: &labels,
            service: None,
        };
        assert!(rule.matches(&ctx, &cache).unwrap());
        rule.options.disabled = true;
        assert!(!rule.matches(&ctx, &cache).unwrap());
    }
}
