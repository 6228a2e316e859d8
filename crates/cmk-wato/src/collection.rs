//! Rulesets aggregated over a folder or the whole tree, with load and save.
//!
//! Each folder stores its rules in `rules.mk`, a JSON object mapping ruleset
//! names to ordered lists of rule records. Records in the legacy tuple form
//! are upgraded on load and always written back in the dict form.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::access::AccessOp;
use crate::changes::ChangeKind;
use crate::conditions::{MatchContext, RegexCache};
use crate::context::RequestContext;
use crate::folder::{read_json, write_json, FolderTree};
use crate::rule::{RuleRecord, UpgradeContext};
use crate::ruleset::{Ruleset, RulespecRegistry};
use crate::types::*;

/// Rule file name.
pub const RULES_FILE: &str = "rules.mk";

/// Name prefix of the static check rulesets.
pub const STATIC_CHECKS_PREFIX: &str = "static_checks:";

type RulesFile = BTreeMap<String, Vec<RuleRecord>>;

/// How a collection was assembled. Only folder, all and single-ruleset
/// collections can be saved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CollectionKind {
    /// The rules of a single folder.
    Folder(String),
    /// Every ruleset across the whole tree.
    All,
    /// One named ruleset across the whole tree.
    SingleRecursively(String),
    /// Result of a [`RuleSearch`].
    Searched,
    /// Only the `static_checks:*` rulesets.
    StaticChecks,
    /// Everything except the `static_checks:*` rulesets.
    NonStaticChecks,
}

/// Filter for [`RulesetCollection::searched`]. Unset fields match
/// everything; text matches are case-insensitive substrings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleSearch {
    pub ruleset_name: Option<String>,
    pub description: Option<String>,
    pub folder: Option<String>,
    /// With `folder`: also rules of its subfolders.
    pub recursive: bool,
    pub disabled: Option<bool>,
    /// The rule must match this host.
    pub host_name: Option<String>,
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// A set of rulesets keyed by name.
#[derive(Debug)]
pub struct RulesetCollection {
    kind: CollectionKind,
    rulesets: BTreeMap<String, Ruleset>,
    rulespecs: Arc<RulespecRegistry>,
}

impl RulesetCollection {
    fn empty(kind: CollectionKind, rulespecs: Arc<RulespecRegistry>, only: Option<&str>) -> Self {
        let rulesets = rulespecs
            .names()
            .filter(|name| only.map_or(true, |o| o == *name))
            .map(|name| (name.to_string(), Ruleset::new(name, rulespecs.get(name))))
            .collect();
        Self {
            kind,
            rulesets,
            rulespecs,
        }
    }

    /// Loads the rules of a single folder.
    pub fn load_folder(tree: &FolderTree, rulespecs: Arc<RulespecRegistry>, path: &str) -> Result<Self> {
        let path = normalize_path(path);
        let mut collection = Self::empty(CollectionKind::Folder(path.clone()), rulespecs, None);
        collection.load_folder_file(tree, &path, None)?;
        Ok(collection)
    }

    /// Loads every ruleset of every folder.
    pub fn load_all(tree: &FolderTree, rulespecs: Arc<RulespecRegistry>) -> Result<Self> {
        let mut collection = Self::empty(CollectionKind::All, rulespecs, None);
        for folder in tree.all_folders() {
            collection.load_folder_file(tree, folder.path(), None)?;
        }
        Ok(collection)
    }

    /// Loads one ruleset across the whole tree.
    pub fn load_single_recursively(tree: &FolderTree, rulespecs: Arc<RulespecRegistry>, name: &str) -> Result<Self> {
        let mut collection = Self::empty(
            CollectionKind::SingleRecursively(name.to_string()),
            rulespecs,
            Some(name),
        );
        collection
            .rulesets
            .entry(name.to_string())
            .or_insert_with(|| Ruleset::new(name, None));
        for folder in tree.all_folders() {
            collection.load_folder_file(tree, folder.path(), Some(name))?;
        }
        Ok(collection)
    }

    fn load_folder_file(&mut self, tree: &FolderTree, path: &str, only: Option<&str>) -> Result<()> {
        let file = tree.folder_dir(path)?.join(RULES_FILE);
        let Some(contents) = read_json::<RulesFile>(&file)? else {
            return Ok(());
        };
        for (name, records) in contents {
            if only.map_or(false, |o| o != name) {
                continue;
            }
            let ruleset = self
                .rulesets
                .entry(name.clone())
                .or_insert_with(|| Ruleset::new(&name, self.rulespecs.get(&name)));
            let ctx = UpgradeContext {
                ruleset_name: &name,
                folder_path: path,
                item_required: ruleset.item_required(),
                tag_config: tree.tag_config(),
            };
            let rules = records
                .into_iter()
                .map(|record| record.upgrade(&ctx))
                .collect::<Result<Vec<_>>>()?;
            tracing::debug!(path, ruleset = %name, rules = rules.len(), "loaded rules");
            ruleset.set_folder_rules(path, rules);
        }
        Ok(())
    }

    /// A read-only view of the rules in `source` matching `search`.
    pub fn searched(source: &Self, tree: &FolderTree, search: &RuleSearch, cache: &RegexCache) -> Result<Self> {
        let host = match &search.host_name {
            Some(name) => Some(
                tree.find_host(name)?
                    .ok_or_else(|| WatoError::HostNotFound(name.clone()))?,
            ),
            None => None,
        };
        let host_ctx = match host {
            Some(host) => Some(MatchContext {
                host_name: host.name(),
                host_folder: host.folder_path(),
                tags: host.tag_groups(tree)?,
                labels: host.labels(tree)?,
                service: None,
            }),
            None => None,
        };
        let folder = search.folder.as_deref().map(normalize_path);

        let mut rulesets = BTreeMap::new();
        for (name, ruleset) in &source.rulesets {
            if let Some(pattern) = &search.ruleset_name {
                if !contains_ci(name, pattern) && !contains_ci(ruleset.title(), pattern) {
                    continue;
                }
            }
            let mut filtered = Ruleset::new(name, source.rulespecs.get(name));
            let mut found = false;
            for path in ruleset.folder_paths() {
                if let Some(folder) = &folder {
                    let in_scope = if search.recursive {
                        is_transitive_parent(folder, path)
                    } else {
                        folder == path
                    };
                    if !in_scope {
                        continue;
                    }
                }
                let mut rules = Vec::new();
                for rule in ruleset.get_folder_rules(path) {
                    if let Some(text) = &search.description {
                        if !contains_ci(&rule.options.description, text) {
                            continue;
                        }
                    }
                    if search.disabled.map_or(false, |d| d != rule.is_disabled()) {
                        continue;
                    }
                    if let Some(ctx) = &host_ctx {
                        if !rule.conditions.matches_host(ctx, cache)? {
                            continue;
                        }
                    }
                    rules.push(rule.clone());
                }
                if !rules.is_empty() {
                    found = true;
                    filtered.set_folder_rules(path, rules);
                }
            }
            if found {
                rulesets.insert(name.clone(), filtered);
            }
        }
        Ok(Self {
            kind: CollectionKind::Searched,
            rulesets,
            rulespecs: source.rulespecs.clone(),
        })
    }

    fn filtered_by_prefix(source: &Self, kind: CollectionKind, keep_static: bool) -> Self {
        let rulesets = source
            .rulesets
            .iter()
            .filter(|(name, _)| name.starts_with(STATIC_CHECKS_PREFIX) == keep_static)
            .map(|(name, ruleset)| (name.clone(), ruleset.clone()))
            .collect();
        Self {
            kind,
            rulesets,
            rulespecs: source.rulespecs.clone(),
        }
    }

    /// A read-only view of the static check rulesets.
    pub fn static_checks(source: &Self) -> Self {
        Self::filtered_by_prefix(source, CollectionKind::StaticChecks, true)
    }

    /// A read-only view of every ruleset except the static checks.
    pub fn non_static_checks(source: &Self) -> Self {
        Self::filtered_by_prefix(source, CollectionKind::NonStaticChecks, false)
    }

    pub fn kind(&self) -> &CollectionKind {
        &self.kind
    }

    pub fn is_editable(&self) -> bool {
        matches!(
            self.kind,
            CollectionKind::Folder(_) | CollectionKind::All | CollectionKind::SingleRecursively(_)
        )
    }

    pub fn get(&self, name: &str) -> Result<&Ruleset> {
        self.rulesets
            .get(name)
            .ok_or_else(|| WatoError::RulesetNotFound(name.to_string()))
    }

    /// Mutable access; creates an empty ruleset if the name is unknown.
    pub fn ruleset_mut(&mut self, name: &str) -> &mut Ruleset {
        let rulespecs = &self.rulespecs;
        self.rulesets
            .entry(name.to_string())
            .or_insert_with(|| Ruleset::new(name, rulespecs.get(name)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Ruleset> {
        self.rulesets.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.rulesets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rulesets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rulesets.is_empty()
    }

    /// Writes every modified folder's rule file.
    ///
    /// A folder collection writes its folder and rejects changes to any other
    /// folder; an all-rulesets collection writes the folders touched since
    /// the last save. Filtered views cannot be saved. Nothing is written and
    /// the pending changes are kept when the save is rejected.
    pub fn save(&mut self, tree: &FolderTree, ctx: &RequestContext) -> Result<()> {
        let modified: BTreeSet<String> = self
            .rulesets
            .values()
            .flat_map(|r| r.modified_folders().iter().cloned())
            .collect();
        let paths: BTreeSet<String> = match &self.kind {
            CollectionKind::Folder(path) => {
                // Only this folder's stored rules were loaded; writing any
                // other folder would drop the rules it already holds.
                if let Some(foreign) = modified.iter().find(|p| *p != path) {
                    return Err(WatoError::user_input(format!(
                        "Cannot save rules of folder '{}' through the rule collection of folder '{}'",
                        foreign, path
                    )));
                }
                [path.clone()].into_iter().collect()
            }
            CollectionKind::All | CollectionKind::SingleRecursively(_) => modified,
            other => {
                return Err(WatoError::NotImplemented(format!(
                    "saving a {:?} ruleset collection",
                    other
                )))
            }
        };
        for path in &paths {
            tree.permissions(path, &ctx.user)?
                .need_permission(AccessOp::Write)?;
        }
        for path in &paths {
            self.save_folder(tree, ctx, path)?;
        }
        for ruleset in self.rulesets.values_mut() {
            ruleset.clear_modified();
        }
        Ok(())
    }

    fn save_folder(&self, tree: &FolderTree, ctx: &RequestContext, path: &str) -> Result<()> {
        let file = tree.folder_dir(path)?.join(RULES_FILE);
        // Rulesets not part of this collection keep their stored records.
        let mut contents: RulesFile = read_json(&file)?.unwrap_or_default();
        let mut changed = Vec::new();
        for (name, ruleset) in &self.rulesets {
            let records: Vec<RuleRecord> = ruleset
                .get_folder_rules(path)
                .iter()
                .map(|rule| rule.to_record())
                .collect();
            if ruleset.modified_folders().contains(path) {
                changed.push(name.clone());
            }
            if records.is_empty() {
                contents.remove(name);
            } else {
                contents.insert(name.clone(), records);
            }
        }
        if contents.is_empty() {
            match std::fs::remove_file(&file) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        } else {
            write_json(&file, &contents)?;
        }
        tracing::info!(path, rulesets = contents.len(), "saved rules");

        for name in changed {
            ctx.record(
                ChangeKind::EditRuleset,
                ObjectRef::folder(path),
                format!("Changed rules of ruleset {} in folder {}", name, path),
                None,
                tree.folder_sites(path)?,
            );
        }
        Ok(())
    }
}
