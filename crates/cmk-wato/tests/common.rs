//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use cmk_wato::{Attributes, FolderTree, NewHost, RequestContext, RulespecRegistry};
use serde_json::{json, Value};
use tempfile::TempDir;

pub fn attrs(value: Value) -> Attributes {
    serde_json::from_value(value).unwrap()
}

/// A folder tree in a temporary directory.
///
/// Layout:
/// - `` (Main): `switch01` (no agent, SNMP v2)
/// - `linux` (label `os=linux`, networking `lan`): `web01`, `web02`
/// - `linux/db` (contact group `dba`): `db01`
/// - `windows` (networking `dmz`): `win01`
pub struct TestSite {
    pub dir: TempDir,
    pub tree: FolderTree,
    pub ctx: RequestContext,
    pub rulespecs: Arc<RulespecRegistry>,
}

impl TestSite {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = FolderTree::open_dir(dir.path()).unwrap();
        let ctx = RequestContext::admin();

        tree.create_subfolder(
            &ctx,
            "",
            "linux",
            "Linux servers",
            attrs(json!({"labels": {"os": "linux"}, "tag_networking": "lan"})),
        )
        .unwrap();
        tree.create_subfolder(
            &ctx,
            "linux",
            "db",
            "Databases",
            attrs(json!({"contactgroups": {"groups": ["dba"], "use": true}})),
        )
        .unwrap();
        tree.create_subfolder(
            &ctx,
            "",
            "windows",
            "Windows",
            attrs(json!({"tag_networking": "dmz"})),
        )
        .unwrap();

        tree.create_hosts(
            &ctx,
            "",
            vec![NewHost::new(
                "switch01",
                attrs(json!({"tag_agent": "no-agent", "tag_snmp_ds": "snmp-v2", "snmp_community": "public"})),
            )],
        )
        .unwrap();
        tree.create_hosts(
            &ctx,
            "linux",
            vec![
                NewHost::new("web01", attrs(json!({"ipaddress": "10.0.0.1"}))),
                NewHost::new("web02", attrs(json!({"ipaddress": "10.0.0.2", "parents": ["switch01"]}))),
            ],
        )
        .unwrap();
        tree.create_hosts(&ctx, "linux/db", vec![NewHost::new("db01", Attributes::new())])
            .unwrap();
        tree.create_hosts(&ctx, "windows", vec![NewHost::new("win01", Attributes::new())])
            .unwrap();

        Self {
            dir,
            tree,
            ctx,
            rulespecs: Arc::new(RulespecRegistry::builtin()),
        }
    }

    /// Re-reads the tree from disk.
    pub fn reopen(&self) -> FolderTree {
        FolderTree::open_dir(self.dir.path()).unwrap()
    }
}
