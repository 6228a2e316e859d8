//! End-to-end tests over a populated folder tree: inheritance, permissions,
//! rule matching and persistence.

mod common;

use cmk_wato::changes::ChangeFilter;
use cmk_wato::config::FolderIndexConfig;
use cmk_wato::index::from_config;
use cmk_wato::{
    AccessOp, ChangeKind, Permission, RegexCache, RequestContext, Rule, RulesetCollection,
    UserContext, WatoConfig, WatoError,
};
use common::{attrs, TestSite};
use serde_json::json;

#[test]
fn test_inherited_configuration() {
    let site = TestSite::new();
    let tree = &site.tree;

    let db01 = tree.find_host("db01").unwrap().unwrap();
    let labels = db01.labels(tree).unwrap();
    assert_eq!(labels["os"], "linux");
    assert_eq!(labels["cmk/site"], "local");
    assert_eq!(db01.tag_groups(tree).unwrap()["networking"], "lan");

    let groups = tree.permitted_groups("linux/db").unwrap();
    assert!(groups.host_contact_groups.contains("dba"));

    let switch = tree.find_host("switch01").unwrap().unwrap();
    let tags = switch.tag_groups(tree).unwrap();
    assert_eq!(tags["snmp"], "snmp");
    assert!(!tags.contains_key("ping"));
}

#[test]
fn test_dict_mode_later_rules_override() {
    let site = TestSite::new();
    let mut all = RulesetCollection::load_all(&site.tree, site.rulespecs.clone()).unwrap();
    for name in ["ping_levels", "periodic_discovery"] {
        let ruleset = all.ruleset_mut(name);
        ruleset.append_rule("", Rule::new(name, "", json!({"x": 2, "y": 3})));
        ruleset.append_rule("linux", Rule::new(name, "", json!({"x": 1})));
    }
    let cache = RegexCache::new();

    let (value, locations) = all
        .get("ping_levels")
        .unwrap()
        .analyse_ruleset(&site.tree, "web01", None, &cache)
        .unwrap();
    assert_eq!(value, Some(json!({"x": 2, "y": 3})));
    let folders: Vec<&str> = locations.iter().map(|l| l.folder_path.as_str()).collect();
    assert_eq!(folders, vec!["linux", ""]);

    let (value, locations) = all
        .get("periodic_discovery")
        .unwrap()
        .analyse_ruleset(&site.tree, "web01", None, &cache)
        .unwrap();
    assert_eq!(value, Some(json!({"x": 1})));
    assert_eq!(locations.len(), 1);

    let (value, _) = all
        .get("ping_levels")
        .unwrap()
        .analyse_ruleset(&site.tree, "win01", None, &cache)
        .unwrap();
    assert_eq!(value, Some(json!({"x": 2, "y": 3})));
}

#[test]
fn test_rules_only_match_below_their_folder() {
    let site = TestSite::new();
    let mut all = RulesetCollection::load_all(&site.tree, site.rulespecs.clone()).unwrap();
    all.ruleset_mut("host_groups")
        .append_rule("windows", Rule::new("host_groups", "", json!("windows")));
    let cache = RegexCache::new();
    let ruleset = all.get("host_groups").unwrap();

    assert_eq!(
        ruleset.analyse_ruleset(&site.tree, "web01", None, &cache).unwrap(),
        (None, vec![])
    );
    let (value, _) = ruleset.analyse_ruleset(&site.tree, "win01", None, &cache).unwrap();
    assert_eq!(value, Some(json!(["windows"])));
    assert!(matches!(
        ruleset.analyse_ruleset(&site.tree, "nope", None, &cache),
        Err(WatoError::HostNotFound(_))
    ));
}

#[test]
fn test_legacy_host_lists_and_items() {
    let site = TestSite::new();
    std::fs::write(
        site.dir.path().join("rules.mk"),
        serde_json::to_string_pretty(&json!({
            "host_groups": [
                ["not-web01", ["!web01", "@all"]],
                ["web-regex", ["~web"]],
                ["lan-only", ["lan"], ["@all"]]
            ],
            "ignored_services": [
                [true, ["@all"], ["Filesystem /var", "!Filesystem /tmp"]]
            ]
        }))
        .unwrap(),
    )
    .unwrap();

    let cache = RegexCache::new();
    let result = RulesetCollection::load_all(&site.tree, site.rulespecs.clone());
    let err = result.unwrap_err();
    assert!(matches!(err, WatoError::UserInput(_)), "{}", err);

    std::fs::write(
        site.dir.path().join("rules.mk"),
        serde_json::to_string_pretty(&json!({
            "host_groups": [
                ["not-web01", ["!web01", "@all"]],
                ["web-regex", ["~web"]],
                ["lan-only", ["lan"], ["@all"]]
            ],
            "ignored_services": [
                [true, ["@all"], ["Filesystem /var"]]
            ]
        }))
        .unwrap(),
    )
    .unwrap();
    let all = RulesetCollection::load_all(&site.tree, site.rulespecs.clone()).unwrap();
    let groups = all.get("host_groups").unwrap();
    let value = |host: &str| groups.analyse_ruleset(&site.tree, host, None, &cache).unwrap().0;

    assert_eq!(value("web01"), Some(json!(["web-regex", "lan-only"])));
    assert_eq!(value("web02"), Some(json!(["not-web01", "web-regex", "lan-only"])));
    assert_eq!(value("win01"), Some(json!(["not-web01"])));

    let ignored = all.get("ignored_services").unwrap();
    let matches = |service: Option<&str>| {
        ignored
            .analyse_ruleset(&site.tree, "web01", service, &cache)
            .unwrap()
            .0
            .is_some()
    };
    assert!(matches(Some("Filesystem /var/log")));
    assert!(!matches(Some("Filesystem /tmp")));
    assert!(!matches(None));
}

#[test]
fn test_round_trip_preserves_rule_order() {
    let site = TestSite::new();
    let mut all = RulesetCollection::load_all(&site.tree, site.rulespecs.clone()).unwrap();
    let ruleset = all.ruleset_mut("host_contactgroups");
    for (folder, value) in [("", "a"), ("linux", "b"), ("linux/db", "c"), ("linux", "d"), ("", "e")] {
        ruleset.append_rule(folder, Rule::new("host_contactgroups", "", json!(value)));
    }
    let top = ruleset.get_folder_rules("linux")[1].id.clone();
    ruleset.move_rule_to_top(&top).unwrap();
    let order = |c: &RulesetCollection| -> Vec<String> {
        c.get("host_contactgroups")
            .unwrap()
            .get_rules()
            .iter()
            .map(|(_, _, r)| r.id.clone())
            .collect()
    };
    let before = order(&all);
    all.save(&site.tree, &site.ctx).unwrap();

    let reloaded = RulesetCollection::load_all(&site.reopen(), site.rulespecs.clone()).unwrap();
    assert_eq!(order(&reloaded), before);
    let values: Vec<String> = reloaded
        .get("host_contactgroups")
        .unwrap()
        .get_rules()
        .iter()
        .map(|(_, _, r)| r.value.as_str().unwrap().to_string())
        .collect();
    assert_eq!(values, vec!["c", "d", "b", "a", "e"]);
}

#[test]
fn test_cached_index_matches_tree_walk() {
    let mut site = TestSite::new();
    let config = WatoConfig {
        folder_index: FolderIndexConfig {
            enabled: true,
            store_path: Some(site.dir.path().join(".index").join("folders.bin")),
            lock_timeout_ms: 1000,
        },
        ..WatoConfig::with_root(site.dir.path())
    };
    let cached = cmk_wato::FolderTree::open(&config).unwrap();
    let direct = site.reopen();
    for folder in direct.all_folders() {
        assert_eq!(
            cached.folder_meta(folder.path()).unwrap(),
            direct.folder_meta(folder.path()).unwrap()
        );
        assert_eq!(
            cached.num_hosts_recursively(folder.path()).unwrap(),
            direct.num_hosts_recursively(folder.path()).unwrap()
        );
    }
    assert_eq!(cached.num_hosts_recursively("").unwrap(), 5);

    // Writes through a second tree sharing the store keep the index current.
    let mut writer = site.reopen().with_index(from_config(&config.folder_index));
    writer
        .create_hosts(&site.ctx, "windows", vec![cmk_wato::NewHost::new("win02", Default::default())])
        .unwrap();
    let cached = cmk_wato::FolderTree::open(&config).unwrap();
    assert_eq!(cached.num_hosts_recursively("windows").unwrap(), 2);

    site.tree.reload().unwrap();
    assert_eq!(site.tree.num_hosts_recursively("").unwrap(), 6);
}

#[test]
fn test_move_folder_changes_inheritance() {
    let mut site = TestSite::new();
    let new_path = site.tree.move_subfolder_to(&site.ctx, "linux/db", "windows").unwrap();
    assert_eq!(new_path, "windows/db");

    let db01 = site.tree.host("windows/db", "db01").unwrap();
    assert!(!db01.labels(&site.tree).unwrap().contains_key("os"));
    assert_eq!(db01.tag_groups(&site.tree).unwrap()["networking"], "dmz");
    assert_eq!(site.tree.num_hosts_recursively("windows").unwrap(), 2);
    assert_eq!(site.tree.num_hosts_recursively("linux").unwrap(), 2);

    let reopened = site.reopen();
    assert_eq!(reopened.hosts("windows/db").unwrap().len(), 1);
    assert!(!site.dir.path().join("linux").join("db").exists());
}

#[test]
fn test_permission_denied_explains_groups() {
    let mut site = TestSite::new();
    let web = RequestContext::new(
        UserContext::new("alice")
            .with_groups(&["web"])
            .with_permissions(&[Permission::ManageHosts, Permission::EditHosts]),
        site.ctx.changes.clone(),
    );
    let err = site
        .tree
        .create_hosts(&web, "linux/db", vec![cmk_wato::NewHost::new("db02", Default::default())])
        .unwrap_err();
    match err {
        WatoError::PermissionDenied { reason } => {
            assert!(reason.contains("dba"), "{}", reason);
            assert!(reason.contains("web"), "{}", reason);
        }
        other => panic!("unexpected {:?}", other),
    }

    let dba = UserContext::new("bob").with_groups(&["dba"]);
    assert!(site.tree.permissions("linux/db", &dba).unwrap().may(AccessOp::Write));
    assert!(!site.tree.permissions("linux", &dba).unwrap().may(AccessOp::Read));
}

#[test]
fn test_change_log_and_redaction() {
    let mut site = TestSite::new();
    site.ctx.changes.clear();
    site.tree
        .update_attributes(&site.ctx, "switch01", attrs(json!({"snmp_community": "private"})))
        .unwrap();
    site.tree.rename_host(&site.ctx, "switch01", "core-switch").unwrap();

    let edits = site.ctx.changes.query(&ChangeFilter {
        kind: Some(ChangeKind::EditHost),
        ..ChangeFilter::default()
    });
    assert_eq!(edits.len(), 1);
    let diff = edits[0].diff_text.as_deref().unwrap();
    assert!(!diff.contains("private"));
    assert!(!diff.contains("public"));
    assert_eq!(site.ctx.changes.len(), 2);

    let web02 = site.tree.host("linux", "web02").unwrap();
    assert_eq!(cmk_wato::attributes::parents_of(web02.attributes()), vec!["core-switch"]);
}

#[test]
fn test_config_file_opens_tree() {
    let site = TestSite::new();
    let config_path = site.dir.path().join("wato.toml");
    std::fs::write(
        &config_path,
        format!(
            "wato_root = {:?}\nsite_id = \"central\"\n\n[folder_index]\nenabled = true\n",
            site.dir.path().display().to_string()
        ),
    )
    .unwrap();
    let config = WatoConfig::from_file(&config_path).unwrap();
    let tree = cmk_wato::FolderTree::open(&config).unwrap();
    assert_eq!(tree.num_hosts_recursively("linux").unwrap(), 3);
    let web01 = tree.find_host("web01").unwrap().unwrap();
    assert_eq!(web01.site(&tree).unwrap(), "central");
}

#[test]
fn test_folder_collection_never_drops_rules() {
    let site = TestSite::new();
    let mut root = RulesetCollection::load_folder(&site.tree, site.rulespecs.clone(), "").unwrap();
    root.ruleset_mut("host_contactgroups")
        .append_rule("", Rule::new("host_contactgroups", "", json!("all")));
    root.ruleset_mut("host_contactgroups")
        .append_rule("linux", Rule::new("host_contactgroups", "", json!("linux")));
    assert!(matches!(
        root.save(&site.tree, &site.ctx),
        Err(WatoError::UserInput(_))
    ));

    let mut linux = RulesetCollection::load_folder(&site.tree, site.rulespecs.clone(), "linux").unwrap();
    linux
        .ruleset_mut("host_contactgroups")
        .append_rule("linux", Rule::new("host_contactgroups", "", json!("linux")));
    linux.save(&site.tree, &site.ctx).unwrap();

    let reloaded = RulesetCollection::load_all(&site.reopen(), site.rulespecs.clone()).unwrap();
    let ruleset = reloaded.get("host_contactgroups").unwrap();
    assert_eq!(ruleset.num_rules_in_folder("linux"), 1);
    assert_eq!(ruleset.num_rules_in_folder(""), 0);
    let (value, _) = ruleset
        .analyse_ruleset(&site.tree, "web01", None, &RegexCache::new())
        .unwrap();
    assert_eq!(value, Some(json!(["linux"])));
}
