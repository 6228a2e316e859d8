//! Rulesets: per-folder ordered rule lists and the match algorithm.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::conditions::{MatchContext, RegexCache};
use crate::folder::FolderTree;
use crate::rule::Rule;
use crate::types::*;

/// How the values of matching rules are aggregated.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Value of the first matching rule.
    #[default]
    First,
    /// List of the values of all matching rules.
    All,
    /// Concatenation of the (list) values of all matching rules.
    List,
    /// Shallow merge of the (dict) values of all matching rules.
    Dict,
}

/// What the item of a service-bound ruleset stands for.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    /// A check item.
    Item,
    /// A service description.
    Service,
}

/// Schema of a ruleset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rulespec {
    pub name: String,
    pub title: String,
    pub match_type: MatchType,
    #[serde(default)]
    pub item_type: Option<ItemType>,
    /// Value of rules created without an explicit value.
    pub default_value: Value,
}

impl Rulespec {
    pub fn new(name: &str, title: &str, match_type: MatchType, default_value: Value) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            match_type,
            item_type: None,
            default_value,
        }
    }

    pub fn with_item(mut self, item_type: ItemType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    pub fn item_required(&self) -> bool {
        self.item_type.is_some()
    }
}

/// Registry of known rulespecs, keyed by ruleset name.
#[derive(Clone, Debug, Default)]
pub struct RulespecRegistry {
    specs: BTreeMap<String, Arc<Rulespec>>,
}

impl RulespecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A small set of commonly used rulespecs.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Rulespec::new(
            "host_contactgroups",
            "Assignment of hosts to contact groups",
            MatchType::All,
            json!("all"),
        ));
        registry.register(Rulespec::new(
            "host_groups",
            "Assignment of hosts to host groups",
            MatchType::All,
            json!(""),
        ));
        registry.register(Rulespec::new(
            "ping_levels",
            "PING and host check parameters",
            MatchType::Dict,
            json!({}),
        ));
        registry.register(Rulespec::new(
            "periodic_discovery",
            "Periodic service discovery",
            MatchType::First,
            json!({"check_interval": 120.0, "severity_unmonitored": 1}),
        ));
        registry.register(Rulespec::new(
            "extra_host_conf:notification_options",
            "Notified events for hosts",
            MatchType::First,
            json!("d,u,r,f,s"),
        ));
        registry.register(Rulespec::new(
            "inventory_df_rules",
            "Filesystem discovery",
            MatchType::Dict,
            json!({}),
        ));
        registry.register(Rulespec::new(
            "ignored_services",
            "Disabled services",
            MatchType::All,
            json!(true),
        ).with_item(ItemType::Service));
        registry.register(
            Rulespec::new(
                "checkgroup_parameters:filesystem",
                "Filesystems (used space and growth)",
                MatchType::Dict,
                json!({"levels": [80.0, 90.0]}),
            )
            .with_item(ItemType::Item),
        );
        registry.register(
            Rulespec::new(
                "static_checks:filesystem",
                "Filesystems (used space and growth)",
                MatchType::All,
                json!(["df", "/", {}]),
            )
            .with_item(ItemType::Item),
        );
        registry.register(Rulespec::new(
            "active_checks:http",
            "Check HTTP service",
            MatchType::All,
            json!({}),
        ));
        registry
    }

    pub fn register(&mut self, spec: Rulespec) {
        self.specs.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Rulespec>> {
        self.specs.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.specs.keys().map(String::as_str)
    }
}

/// Position of a matching rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleLocation {
    pub folder_path: String,
    pub index: usize,
    pub rule_id: String,
}

/// Named collection of rules for one configuration topic.
#[derive(Clone, Debug)]
pub struct Ruleset {
    name: String,
    rulespec: Option<Arc<Rulespec>>,
    rules: BTreeMap<String, Vec<Rule>>,
    modified: BTreeSet<String>,
}

impl Ruleset {
    pub fn new(name: &str, rulespec: Option<Arc<Rulespec>>) -> Self {
        Self {
            name: name.to_string(),
            rulespec,
            rules: BTreeMap::new(),
            modified: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rulespec(&self) -> Option<&Rulespec> {
        self.rulespec.as_deref()
    }

    /// Match type of the rulespec; `first` for unknown rulesets.
    pub fn match_type(&self) -> MatchType {
        self.rulespec
            .as_ref()
            .map(|s| s.match_type)
            .unwrap_or_default()
    }

    pub fn item_required(&self) -> bool {
        self.rulespec.as_ref().map_or(false, |s| s.item_required())
    }

    pub fn title(&self) -> &str {
        self.rulespec
            .as_ref()
            .map(|s| s.title.as_str())
            .unwrap_or(&self.name)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.values().all(Vec::is_empty)
    }

    pub fn num_rules(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn num_rules_in_folder(&self, folder_path: &str) -> usize {
        self.get_folder_rules(folder_path).len()
    }

    /// Folders holding at least one rule.
    pub fn folder_paths(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(|(_, rules)| !rules.is_empty())
            .map(|(path, _)| path.as_str())
    }

    /// Folders changed since the last save.
    pub fn modified_folders(&self) -> &BTreeSet<String> {
        &self.modified
    }

    pub(crate) fn clear_modified(&mut self) {
        self.modified.clear();
    }

    /// Replaces the rules of one folder, as read from its rule file.
    pub(crate) fn set_folder_rules(&mut self, folder_path: &str, rules: Vec<Rule>) {
        self.rules.insert(normalize_path(folder_path), rules);
    }

    pub fn get_folder_rules(&self, folder_path: &str) -> &[Rule] {
        self.rules
            .get(&normalize_path(folder_path))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All rules in canonical order: deepest folder first, then declaration
    /// order within a folder.
    pub fn get_rules(&self) -> Vec<(&str, usize, &Rule)> {
        let mut all: Vec<(&str, usize, &Rule)> = self
            .rules
            .iter()
            .flat_map(|(path, rules)| {
                rules
                    .iter()
                    .enumerate()
                    .map(move |(index, rule)| (path.as_str(), index, rule))
            })
            .collect();
        all.sort_by(|a, b| {
            let key_a = (a.0.split('/').collect::<Vec<_>>(), usize::MAX - a.1);
            let key_b = (b.0.split('/').collect::<Vec<_>>(), usize::MAX - b.1);
            key_b.cmp(&key_a)
        });
        all
    }

    pub fn get_rule(&self, folder_path: &str, index: usize) -> Result<&Rule> {
        self.get_folder_rules(folder_path)
            .get(index)
            .ok_or_else(|| WatoError::RuleNotFound {
                ruleset: self.name.clone(),
                rule_id: format!("{}#{}", folder_path, index),
            })
    }

    pub fn get_rule_by_id(&self, rule_id: &str) -> Result<&Rule> {
        let (path, index) = self.locate(rule_id)?;
        Ok(&self.rules[&path][index])
    }

    fn locate(&self, rule_id: &str) -> Result<(String, usize)> {
        for (path, rules) in &self.rules {
            if let Some(index) = rules.iter().position(|r| r.id == rule_id) {
                return Ok((path.clone(), index));
            }
        }
        Err(WatoError::RuleNotFound {
            ruleset: self.name.clone(),
            rule_id: rule_id.to_string(),
        })
    }

    fn folder_rules_mut(&mut self, folder_path: &str) -> &mut Vec<Rule> {
        let path = normalize_path(folder_path);
        self.modified.insert(path.clone());
        self.rules.entry(path).or_default()
    }

    fn adopt(&self, mut rule: Rule, folder_path: &str) -> Rule {
        rule.ruleset_name = self.name.clone();
        rule.set_folder(folder_path);
        rule
    }

    /// Appends a rule at the end of the folder's list.
    pub fn append_rule(&mut self, folder_path: &str, rule: Rule) -> usize {
        let rule = self.adopt(rule, folder_path);
        let rules = self.folder_rules_mut(folder_path);
        rules.push(rule);
        rules.len() - 1
    }

    /// Inserts a rule at the top of the folder's list.
    pub fn prepend_rule(&mut self, folder_path: &str, rule: Rule) {
        let rule = self.adopt(rule, folder_path);
        self.folder_rules_mut(folder_path).insert(0, rule);
    }

    /// Inserts a rule directly after `after_id`, in that rule's folder.
    pub fn insert_rule_after(&mut self, rule: Rule, after_id: &str) -> Result<usize> {
        let (path, index) = self.locate(after_id)?;
        let rule = self.adopt(rule, &path);
        self.folder_rules_mut(&path).insert(index + 1, rule);
        Ok(index + 1)
    }

    /// Replaces the rule with the same id. A rule whose folder changed is
    /// removed from the old folder and appended to the new one.
    pub fn edit_rule(&mut self, rule: Rule) -> Result<()> {
        let (path, index) = self.locate(&rule.id)?;
        let new_path = normalize_path(&rule.folder_path);
        if new_path == path {
            let rule = self.adopt(rule, &path);
            self.folder_rules_mut(&path)[index] = rule;
        } else {
            self.folder_rules_mut(&path).remove(index);
            self.append_rule(&new_path, rule);
        }
        Ok(())
    }

    pub fn delete_rule(&mut self, rule_id: &str) -> Result<Rule> {
        let (path, index) = self.locate(rule_id)?;
        Ok(self.folder_rules_mut(&path).remove(index))
    }

    /// Copies a rule with a fresh id directly below the original.
    pub fn clone_rule(&mut self, rule_id: &str) -> Result<String> {
        let copy = self.get_rule_by_id(rule_id)?.clone_with_new_id();
        let id = copy.id.clone();
        self.insert_rule_after(copy, rule_id)?;
        Ok(id)
    }

    /// Moves a rule to `target` within its folder (clamped to the list end).
    pub fn move_rule_to(&mut self, rule_id: &str, target: usize) -> Result<()> {
        let (path, index) = self.locate(rule_id)?;
        let rules = self.folder_rules_mut(&path);
        let rule = rules.remove(index);
        let target = target.min(rules.len());
        rules.insert(target, rule);
        Ok(())
    }

    pub fn move_rule_to_top(&mut self, rule_id: &str) -> Result<()> {
        self.move_rule_to(rule_id, 0)
    }

    pub fn move_rule_to_bottom(&mut self, rule_id: &str) -> Result<()> {
        self.move_rule_to(rule_id, usize::MAX)
    }

    pub fn move_rule_up(&mut self, rule_id: &str) -> Result<()> {
        let (_, index) = self.locate(rule_id)?;
        self.move_rule_to(rule_id, index.saturating_sub(1))
    }

    pub fn move_rule_down(&mut self, rule_id: &str) -> Result<()> {
        let (_, index) = self.locate(rule_id)?;
        self.move_rule_to(rule_id, index + 1)
    }

    /// Evaluates the ruleset for a host (and optional service).
    ///
    /// Returns the aggregated value and the locations of all matching rules,
    /// or `(None, [])` if nothing matches. In `dict` mode the keys of rules
    /// iterated later overwrite those of earlier (more specific) rules.
    pub fn analyse_ruleset(
        &self,
        tree: &FolderTree,
        host_name: &str,
        service: Option<&str>,
        cache: &RegexCache,
    ) -> Result<(Option<Value>, Vec<RuleLocation>)> {
        let host = tree
            .find_host(host_name)?
            .ok_or_else(|| WatoError::HostNotFound(host_name.to_string()))?;
        let tags = host.tag_groups(tree)?;
        let labels = host.labels(tree)?;
        let ctx = MatchContext {
            host_name: host.name(),
            host_folder: host.folder_path(),
            tags,
            labels,
            service,
        };

        let match_type = self.match_type();
        let mut locations = Vec::new();
        let mut aggregate: Option<Value> = None;

        for (path, index, rule) in self.get_rules() {
            if !rule.matches(&ctx, cache)? {
                continue;
            }
            locations.push(RuleLocation {
                folder_path: path.to_string(),
                index,
                rule_id: rule.id.clone(),
            });

            match match_type {
                MatchType::First => {
                    aggregate = Some(rule.value.clone());
                    break;
                }
                MatchType::All => {
                    let list = aggregate.get_or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(items) = list {
                        items.push(rule.value.clone());
                    }
                }
                MatchType::List => {
                    let list = aggregate.get_or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(items) = list {
                        match &rule.value {
                            Value::Array(values) => items.extend(values.iter().cloned()),
                            other => items.push(other.clone()),
                        }
                    }
                }
                MatchType::Dict => {
                    let merged = aggregate.get_or_insert_with(|| Value::Object(Default::default()));
                    match (merged, &rule.value) {
                        (Value::Object(acc), Value::Object(update)) => {
                            for (k, v) in update {
                                acc.insert(k.clone(), v.clone());
                            }
                        }
                        (_, other) => {
                            tracing::warn!(ruleset = %self.name, rule = %rule.id, value = %other, "ignoring non-dict value in dict ruleset");
                        }
                    }
                }
            }
        }

        tracing::debug!(ruleset = %self.name, host = host_name, matches = locations.len(), "analysed ruleset");
        Ok((aggregate, locations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ruleset_with(paths: &[&str]) -> Ruleset {
        let mut rs = Ruleset::new("test", None);
        for (i, path) in paths.iter().enumerate() {
            rs.append_rule(path, Rule::new("test", path, json!(i)));
        }
        rs
    }

    fn order(rs: &Ruleset) -> Vec<(String, usize)> {
        rs.get_rules()
            .into_iter()
            .map(|(p, i, _)| (p.to_string(), i))
            .collect()
    }

    #[test]
    fn test_canonical_order_deepest_first() {
        let rs = ruleset_with(&["", "a", "a/b", "", "a", "c"]);
        assert_eq!(
            order(&rs),
            vec![
                ("c".to_string(), 0),
                ("a/b".to_string(), 0),
                ("a".to_string(), 0),
                ("a".to_string(), 1),
                ("".to_string(), 0),
                ("".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_edit_operations() {
        let mut rs = Ruleset::new("test", None);
        let r1 = Rule::new("test", "", json!(1));
        let r2 = Rule::new("test", "", json!(2));
        let r3 = Rule::new("test", "", json!(3));
        let (id1, id2, id3) = (r1.id.clone(), r2.id.clone(), r3.id.clone());
        rs.append_rule("", r1);
        rs.append_rule("", r2);
        rs.prepend_rule("", r3);
        let ids = |rs: &Ruleset| -> Vec<String> {
            rs.get_folder_rules("").iter().map(|r| r.id.clone()).collect()
        };
        assert_eq!(ids(&rs), vec![id3.clone(), id1.clone(), id2.clone()]);

        rs.move_rule_to_bottom(&id3).unwrap();
        assert_eq!(ids(&rs), vec![id1.clone(), id2.clone(), id3.clone()]);
        rs.move_rule_up(&id2).unwrap();
        assert_eq!(ids(&rs), vec![id2.clone(), id1.clone(), id3.clone()]);
        rs.move_rule_down(&id2).unwrap();
        assert_eq!(ids(&rs), vec![id1.clone(), id2.clone(), id3.clone()]);
        rs.move_rule_to_top(&id3).unwrap();
        assert_eq!(ids(&rs), vec![id3.clone(), id1.clone(), id2.clone()]);

        let copy = rs.clone_rule(&id3).unwrap();
        assert_eq!(rs.get_rule("", 1).unwrap().id, copy);
        assert_eq!(rs.get_rule_by_id(&copy).unwrap().value, json!(3));

        rs.delete_rule(&copy).unwrap();
        assert_eq!(rs.num_rules(), 3);
        assert!(matches!(
            rs.delete_rule(&copy),
            Err(WatoError::RuleNotFound { .. })
        ));
        assert!(rs.modified_folders().contains(""));
    }

    #[test]
    fn test_edit_rule_changes_folder() {
        let mut rs = Ruleset::new("test", None);
        let rule = Rule::new("test", "a", json!(1));
        let id = rule.id.clone();
        rs.append_rule("a", rule);

        let mut edited = rs.get_rule_by_id(&id).unwrap().clone();
        edited.value = json!(2);
        rs.edit_rule(edited.clone()).unwrap();
        assert_eq!(rs.get_rule("a", 0).unwrap().value, json!(2));

        edited.set_folder("b");
        rs.edit_rule(edited).unwrap();
        assert_eq!(rs.num_rules_in_folder("a"), 0);
        assert_eq!(rs.get_rule("b", 0).unwrap().conditions.host_folder, "b");
    }

    #[test]
    fn test_rulespec_defaults() {
        let registry = RulespecRegistry::builtin();
        let spec = registry.get("checkgroup_parameters:filesystem").unwrap();
        assert!(spec.item_required());
        let rule = Rule::from_ruleset_defaults(&spec, "linux");
        assert_eq!(rule.value, json!({"levels": [80.0, 90.0]}));
        assert_eq!(rule.ruleset_name, "checkgroup_parameters:filesystem");

        let rs = Ruleset::new("unknown", registry.get("unknown"));
        assert_eq!(rs.match_type(), MatchType::First);
        assert_eq!(rs.title(), "unknown");
    }
}
