//! Property-based tests for rule ordering and host list polarity.

use cmk_wato::conditions::{MatchEntry, MatchList};
use cmk_wato::rule::{parse_host_list, RuleRecord, UpgradeContext, ALL_HOSTS};
use cmk_wato::tags::TagConfig;
use cmk_wato::types::is_transitive_parent;
use cmk_wato::{RegexCache, Rule, Ruleset};
use proptest::prelude::*;
use serde_json::json;

const FOLDERS: [&str; 5] = ["", "a", "a/b", "a/b/c", "d"];

fn any_placements() -> impl Strategy<Value = Vec<usize>> {
    proptest::collection::vec(0usize..FOLDERS.len(), 0..30)
}

fn any_host_name() -> impl Strategy<Value = String> {
    "[a-z]{1,6}[0-9]{0,2}"
}

fn build(placements: &[usize]) -> Ruleset {
    let mut ruleset = Ruleset::new("test", None);
    for (n, folder) in placements.iter().enumerate() {
        ruleset.append_rule(FOLDERS[*folder], Rule::new("test", "", json!(n)));
    }
    ruleset
}

proptest! {
    /// Rules of a folder come before those of its ancestors, and keep their
    /// declaration order within the folder.
    #[test]
    fn test_canonical_order(placements in any_placements()) {
        let ruleset = build(&placements);
        let rules = ruleset.get_rules();
        prop_assert_eq!(rules.len(), placements.len());

        for pair in rules.windows(2) {
            let (path_a, index_a, _) = pair[0];
            let (path_b, index_b, _) = pair[1];
            if path_a == path_b {
                prop_assert!(index_a < index_b);
            }
            prop_assert!(
                path_a == path_b || !is_transitive_parent(path_a, path_b),
                "{} listed before its descendant {}", path_a, path_b
            );
        }
        for (path, index, rule) in &rules {
            prop_assert_eq!(&ruleset.get_folder_rules(path)[*index].id, &rule.id);
        }
    }

    /// Persisting and upgrading every folder's records reproduces the order.
    #[test]
    fn test_order_survives_persistence(placements in any_placements()) {
        let ruleset = build(&placements);
        let tags = TagConfig::builtin();
        let mut reloaded = Ruleset::new("test", None);
        for path in FOLDERS {
            for rule in ruleset.get_folder_rules(path) {
                let text = serde_json::to_string(&rule.to_record()).unwrap();
                let record: RuleRecord = serde_json::from_str(&text).unwrap();
                let ctx = UpgradeContext {
                    ruleset_name: "test",
                    folder_path: path,
                    item_required: false,
                    tag_config: &tags,
                };
                reloaded.append_rule(path, record.upgrade(&ctx).unwrap());
            }
        }
        let ids = |rs: &Ruleset| rs.get_rules().iter().map(|(_, _, r)| r.id.clone()).collect::<Vec<_>>();
        prop_assert_eq!(ids(&ruleset), ids(&reloaded));
    }

    /// A positive list matches exactly the listed hosts, a negated list
    /// everything else.
    #[test]
    fn test_host_list_polarity(
        listed in proptest::collection::vec(any_host_name(), 1..5),
        host in any_host_name(),
    ) {
        let cache = RegexCache::new();
        let expected = listed.contains(&host);

        let positive = parse_host_list(&listed).unwrap().unwrap();
        prop_assert_eq!(positive.matches(&host, &cache).unwrap(), expected);

        let mut negated: Vec<String> = listed.iter().map(|h| format!("!{}", h)).collect();
        negated.push(ALL_HOSTS.to_string());
        let negated = parse_host_list(&negated).unwrap().unwrap();
        prop_assert!(negated.is_negated());
        prop_assert_eq!(negated.matches(&host, &cache).unwrap(), !expected);
    }

    /// Mixing positive and negated entries in one list is rejected.
    #[test]
    fn test_mixed_polarity_rejected(a in any_host_name(), b in any_host_name()) {
        let hosts = vec![a, format!("!{}", b)];
        prop_assert!(parse_host_list(&hosts).is_err());
    }

    /// Empty lists never match, whatever their polarity.
    #[test]
    fn test_empty_lists_never_match(host in any_host_name()) {
        let cache = RegexCache::new();
        prop_assert!(!MatchList::positive(vec![]).matches(&host, &cache).unwrap());
        prop_assert!(!MatchList::negated(vec![]).matches(&host, &cache).unwrap());
        prop_assert!(MatchList::positive(vec![MatchEntry::regex(".*")]).matches(&host, &cache).unwrap());
    }
}
