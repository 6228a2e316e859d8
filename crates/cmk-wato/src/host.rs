//! Hosts: effective configuration and host operations of the folder tree.
//!
//! Hosts are stored per folder in `hosts.mk` and loaded on first access.
//! A host refers to its folder by path; all lookups that need the folder go
//! through the [`FolderTree`].

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::*;
use crate::attributes::parents_of;
use crate::changes::ChangeKind;
use crate::context::RequestContext;
use crate::folder::{read_json, write_json, FolderTree};
use crate::types::*;

/// Host file name.
pub const HOSTS_FILE: &str = "hosts.mk";

/// Persisted host file of one folder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub all_hosts: Vec<String>,
    #[serde(default)]
    pub clusters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub host_attributes: BTreeMap<String, Attributes>,
    #[serde(default)]
    pub locked_hosts: LockFlag,
    /// Flattened "attribute to host to value" maps for the monitoring core.
    #[serde(flatten)]
    pub exports: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Loaded host state of a folder.
#[derive(Debug, Default)]
pub(crate) struct HostData {
    pub(crate) hosts: BTreeMap<String, Host>,
    pub(crate) locked_hosts: LockFlag,
}

impl HostData {
    fn from_file(folder_path: &str, file: HostsFile) -> Self {
        let mut attributes = file.host_attributes;
        let mut hosts = BTreeMap::new();
        for name in file.all_hosts {
            let attrs = attributes.remove(&name).unwrap_or_default();
            hosts.insert(name.clone(), Host::new(&name, folder_path, attrs, None));
        }
        for (name, nodes) in file.clusters {
            let attrs = attributes.remove(&name).unwrap_or_default();
            hosts.insert(name.clone(), Host::new(&name, folder_path, attrs, Some(nodes)));
        }
        Self {
            hosts,
            locked_hosts: file.locked_hosts,
        }
    }
}

/// A monitored host.
#[derive(Clone, Debug)]
pub struct Host {
    name: String,
    folder_path: String,
    attributes: Attributes,
    cluster_nodes: Option<Vec<String>>,
    effective: OnceCell<Attributes>,
    labels: OnceCell<Labels>,
    tags: OnceCell<TagGroups>,
}

impl Host {
    pub fn new(name: &str, folder_path: &str, attributes: Attributes, cluster_nodes: Option<Vec<String>>) -> Self {
        Self {
            name: name.to_string(),
            folder_path: normalize_path(folder_path),
            attributes,
            cluster_nodes,
            effective: OnceCell::new(),
            labels: OnceCell::new(),
            tags: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn folder_path(&self) -> &str {
        &self.folder_path
    }

    /// Own (explicitly set) attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn cluster_nodes(&self) -> Option<&[String]> {
        self.cluster_nodes.as_deref()
    }

    pub fn is_cluster(&self) -> bool {
        self.cluster_nodes.is_some()
    }

    /// Changes the name only. The owning folder's host map has to be
    /// re-keyed by the caller; [`FolderTree::rename_host`] does both.
    pub fn rename(&mut self, new_name: &str) {
        self.name = new_name.to_string();
        self.drop_caches();
    }

    pub fn drop_caches(&mut self) {
        self.effective.take();
        self.labels.take();
        self.tags.take();
    }

    /// Labels aggregated root folder to host; closer levels win. Each level
    /// contributes its raw `labels` plus labels synthesized by attributes.
    pub fn labels(&self, tree: &FolderTree) -> Result<&Labels> {
        if let Some(labels) = self.labels.get() {
            return Ok(labels);
        }
        let registry = tree.registry();
        let apply = |labels: &mut Labels, attributes: &Attributes| {
            for (name, value) in attributes {
                if let Some(contributor) = registry.get(name).and_then(|a| a.as_label_contributor()) {
                    labels.extend(contributor.labels(value));
                }
            }
        };
        let mut labels = Labels::new();
        apply(&mut labels, &registry.defaults());
        for path in ancestor_chain(&self.folder_path) {
            apply(&mut labels, tree.folder(&path)?.attributes());
        }
        apply(&mut labels, &self.attributes);
        Ok(self.labels.get_or_init(|| labels))
    }

    /// Folder's effective attributes overlaid with the host's own, with
    /// `labels` replaced by the aggregated label set.
    pub fn effective_attributes(&self, tree: &FolderTree) -> Result<&Attributes> {
        if let Some(effective) = self.effective.get() {
            return Ok(effective);
        }
        let mut effective = tree.effective_attributes(&self.folder_path)?.clone();
        for (k, v) in &self.attributes {
            effective.insert(k.clone(), v.clone());
        }
        effective.insert("labels".to_string(), serde_json::to_value(self.labels(tree)?)?);
        Ok(self.effective.get_or_init(|| effective))
    }

    /// Tag assignment derived from the tag contributing attributes.
    ///
    /// A host without agent and SNMP but with an IP address gets the `ping`
    /// tag.
    pub fn tag_groups(&self, tree: &FolderTree) -> Result<&TagGroups> {
        if let Some(tags) = self.tags.get() {
            return Ok(tags);
        }
        let effective = self.effective_attributes(tree)?;
        let mut tags = TagGroups::new();
        for attr in tree.registry().iter() {
            if let Some(contributor) = attr.as_tag_contributor() {
                tags.extend(contributor.tags(effective.get(attr.name())));
            }
        }
        let ping = {
            let tag = |group: &str| tags.get(group).map(String::as_str);
            tag("snmp_ds") == Some("no-snmp")
                && tag("agent") == Some("no-agent")
                && tag("address_family") != Some("no-ip")
        };
        if ping {
            tags.insert("ping".to_string(), "ping".to_string());
        }
        Ok(self.tags.get_or_init(|| tags))
    }

    /// Effective monitoring site.
    pub fn site(&self, tree: &FolderTree) -> Result<String> {
        Ok(self
            .effective_attributes(tree)?
            .get("site")
            .and_then(Value::as_str)
            .unwrap_or(tree.site_id())
            .to_string())
    }
}

/// A host to be created.
#[derive(Clone, Debug, PartialEq)]
pub struct NewHost {
    pub name: String,
    pub attributes: Attributes,
    pub cluster_nodes: Option<Vec<String>>,
}

impl NewHost {
    pub fn new(name: &str, attributes: Attributes) -> Self {
        Self {
            name: name.to_string(),
            attributes,
            cluster_nodes: None,
        }
    }

    pub fn cluster(name: &str, attributes: Attributes, nodes: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            attributes,
            cluster_nodes: Some(nodes),
        }
    }
}

/// Result of a host attribute edit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EditOutcome {
    /// Redacted diff of the attributes, None if nothing changed.
    pub diff: Option<String>,
    /// Sites whose configuration must be regenerated (old and new site).
    pub affected_sites: BTreeSet<String>,
}

fn validate_host_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(WatoError::user_input(format!("Invalid host name '{}'", name)))
    }
}

fn need_unlocked_hosts(flag: &LockFlag, path: &str) -> Result<()> {
    if flag.is_locked() {
        return Err(WatoError::user_input(format!(
            "The hosts of folder '{}' are locked ({})",
            path,
            flag.reason().unwrap_or("locked")
        )));
    }
    Ok(())
}

fn rename_in_parents(attributes: &mut Attributes, old: &str, new: &str) -> bool {
    let mut changed = false;
    if let Some(Value::Array(items)) = attributes.get_mut("parents") {
        for item in items.iter_mut() {
            if item.as_str() == Some(old) {
                *item = Value::String(new.to_string());
                changed = true;
            }
        }
    }
    changed
}

impl FolderTree {
    pub(crate) fn host_data(&self, path: &str) -> Result<&HostData> {
        let folder = self.folder(path)?;
        if let Some(data) = folder.host_data.get() {
            return Ok(data);
        }
        let file = folder.dir(self.root_dir()).join(HOSTS_FILE);
        let data = match read_json::<HostsFile>(&file)? {
            Some(contents) => HostData::from_file(folder.path(), contents),
            None => HostData::default(),
        };
        tracing::debug!(path = folder.path(), hosts = data.hosts.len(), "loaded hosts");
        Ok(folder.host_data.get_or_init(|| data))
    }

    fn host_data_mut(&mut self, path: &str) -> Result<&mut HostData> {
        self.host_data(path)?;
        let path = normalize_path(path);
        self.folders
            .get_mut(&path)
            .and_then(|f| f.host_data.get_mut())
            .ok_or(WatoError::FolderNotFound(path))
    }

    /// Hosts directly in a folder, keyed by name.
    pub fn hosts(&self, path: &str) -> Result<&BTreeMap<String, Host>> {
        Ok(&self.host_data(path)?.hosts)
    }

    pub fn host(&self, path: &str, name: &str) -> Result<&Host> {
        self.hosts(path)?
            .get(name)
            .ok_or_else(|| WatoError::HostNotFound(name.to_string()))
    }

    pub fn locked_hosts(&self, path: &str) -> Result<&LockFlag> {
        Ok(&self.host_data(path)?.locked_hosts)
    }

    /// Searches the whole tree for a host.
    pub fn find_host(&self, name: &str) -> Result<Option<&Host>> {
        for path in self.folders.keys() {
            if let Some(host) = self.hosts(path)?.get(name) {
                return Ok(Some(host));
            }
        }
        Ok(None)
    }

    fn require_host(&self, name: &str) -> Result<&Host> {
        self.find_host(name)?
            .ok_or_else(|| WatoError::HostNotFound(name.to_string()))
    }

    /// Names of all hosts in the tree.
    pub fn all_host_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for path in self.folders.keys() {
            names.extend(self.hosts(path)?.keys().cloned());
        }
        Ok(names)
    }

    /// Permission capability of `user` on a host: the folder's groups plus
    /// the host's own contact groups.
    pub fn host_permissions<'a>(&self, host: &Host, user: &'a UserContext) -> Result<PermissionCheck<'a>> {
        let mut groups = self.permitted_groups(host.folder_path())?;
        let own = ContactGroupConfig::from_attribute(host.attributes().get("contactgroups"));
        groups.permitted.extend(own.groups.iter().cloned());
        if own.use_for_hosts {
            groups.host_contact_groups.extend(own.groups);
        }
        Ok(PermissionCheck::new(format!("the host {}", host.name()), groups, user))
    }

    /// Writes the host file of a folder and updates its host count.
    pub fn save_hosts(&mut self, path: &str) -> Result<()> {
        let path = normalize_path(path);
        let data = self.host_data(&path)?;
        let mut file = HostsFile {
            locked_hosts: data.locked_hosts.clone(),
            ..HostsFile::default()
        };
        for (name, host) in &data.hosts {
            match &host.cluster_nodes {
                Some(nodes) => {
                    file.clusters.insert(name.clone(), nodes.clone());
                }
                None => file.all_hosts.push(name.clone()),
            }
            file.host_attributes
                .insert(name.clone(), host.attributes.clone());
            for (attr_name, value) in &host.attributes {
                let exportable = self
                    .registry()
                    .get(attr_name)
                    .and_then(|a| a.as_exportable());
                if let Some(exportable) = exportable {
                    if let Some(exported) = exportable.export_value(value) {
                        file.exports
                            .entry(exportable.export_key().to_string())
                            .or_default()
                            .insert(name.clone(), exported);
                    }
                }
            }
        }
        let count = data.hosts.len();
        let dir = self.folder_dir(&path)?;
        let target = dir.join(HOSTS_FILE);
        if count == 0 && file.locked_hosts.is_unlocked() {
            match std::fs::remove_file(&target) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        } else {
            write_json(&target, &file)?;
        }

        let root = self.root_dir().to_path_buf();
        let folder = self.folder_mut(&path)?;
        folder.num_hosts = count;
        folder.save_descriptor(&root)?;
        tracing::debug!(path = %path, hosts = count, "saved hosts");
        self.notify_index(&path);
        Ok(())
    }

    /// Creates hosts in a folder. Names must be unique across the tree and
    /// cluster nodes must exist.
    pub fn create_hosts(&mut self, ctx: &RequestContext, path: &str, hosts: Vec<NewHost>) -> Result<()> {
        ctx.need(Permission::ManageHosts)?;
        let path = normalize_path(path);
        self.permissions(&path, &ctx.user)?
            .need_permission(AccessOp::Write)?;
        need_unlocked_hosts(self.locked_hosts(&path)?, &path)?;

        let mut known = self.all_host_names()?;
        for new in &hosts {
            validate_host_name(&new.name)?;
            if !known.insert(new.name.clone()) {
                return Err(WatoError::user_input(format!(
                    "A host with the name '{}' already exists",
                    new.name
                )));
            }
            self.registry().validate(&new.attributes)?;
            validate_contact_group_modification(&ctx.user, None, new.attributes.get("contactgroups"))?;
        }
        for new in &hosts {
            for node in new.cluster_nodes.iter().flatten() {
                if !known.contains(node) || node == &new.name {
                    return Err(WatoError::user_input(format!(
                        "The cluster node '{}' of '{}' is not an existing host",
                        node, new.name
                    )));
                }
            }
        }

        let names: Vec<String> = hosts.iter().map(|h| h.name.clone()).collect();
        let data = self.host_data_mut(&path)?;
        for new in hosts {
            data.hosts.insert(
                new.name.clone(),
                Host::new(&new.name, &path, new.attributes, new.cluster_nodes),
            );
        }
        self.save_hosts(&path)?;

        for name in names {
            let sites = [self.host(&path, &name)?.site(self)?].into_iter().collect();
            ctx.record(
                ChangeKind::CreateHost,
                ObjectRef::host(&name),
                format!("Created new host {}", name),
                None,
                sites,
            );
        }
        Ok(())
    }

    /// Deletes hosts from a folder. Hosts still used as parents by other
    /// hosts cannot be deleted.
    pub fn delete_hosts(&mut self, ctx: &RequestContext, path: &str, names: &[String]) -> Result<()> {
        ctx.need(Permission::ManageHosts)?;
        let path = normalize_path(path);
        self.permissions(&path, &ctx.user)?
            .need_permission(AccessOp::Write)?;
        need_unlocked_hosts(self.locked_hosts(&path)?, &path)?;

        let doomed: BTreeSet<&String> = names.iter().collect();
        let mut sites = BTreeMap::new();
        for name in names {
            sites.insert(name.clone(), self.host(&path, name)?.site(self)?);
        }
        for folder_path in self.folders.keys() {
            for host in self.hosts(folder_path)?.values() {
                if doomed.contains(&host.name) {
                    continue;
                }
                if let Some(parent) = parents_of(&host.attributes).into_iter().find(|p| doomed.contains(p)) {
                    return Err(WatoError::user_input(format!(
                        "Cannot delete host '{}': it is the parent of '{}'",
                        parent, host.name
                    )));
                }
            }
        }

        let data = self.host_data_mut(&path)?;
        for name in names {
            data.hosts.remove(name);
        }
        self.save_hosts(&path)?;
        for (name, site) in sites {
            ctx.record(
                ChangeKind::DeleteHost,
                ObjectRef::host(&name),
                format!("Deleted host {}", name),
                None,
                [site].into_iter().collect(),
            );
        }
        Ok(())
    }

    /// Moves hosts between folders.
    pub fn move_hosts(&mut self, ctx: &RequestContext, from: &str, names: &[String], to: &str) -> Result<()> {
        ctx.need(Permission::ManageHosts)?;
        let from = normalize_path(from);
        let to = normalize_path(to);
        if from == to {
            return Err(WatoError::user_input("Source and target folder are the same"));
        }
        for path in [&from, &to] {
            self.permissions(path, &ctx.user)?
                .need_permission(AccessOp::Write)?;
            need_unlocked_hosts(self.locked_hosts(path)?, path)?;
        }
        let mut old_sites = BTreeMap::new();
        for name in names {
            old_sites.insert(name.clone(), self.host(&from, name)?.site(self)?);
        }

        let source = self.host_data_mut(&from)?;
        let mut moved = Vec::new();
        for name in names {
            if let Some(mut host) = source.hosts.remove(name) {
                host.folder_path = to.clone();
                host.drop_caches();
                moved.push(host);
            }
        }
        let target = self.host_data_mut(&to)?;
        for host in moved {
            target.hosts.insert(host.name.clone(), host);
        }
        self.save_hosts(&from)?;
        self.save_hosts(&to)?;

        for (name, old_site) in old_sites {
            let mut sites = BTreeSet::from([old_site]);
            sites.insert(self.host(&to, &name)?.site(self)?);
            ctx.record(
                ChangeKind::MoveHost,
                ObjectRef::host(&name),
                format!("Moved host {} from {} to {}", name, from, to),
                None,
                sites,
            );
        }
        Ok(())
    }

    /// Renames a host, re-keys its folder's host map and rewrites `parents`
    /// and cluster node references across the tree. Returns the names of
    /// hosts whose references were updated.
    pub fn rename_host(&mut self, ctx: &RequestContext, old: &str, new: &str) -> Result<Vec<String>> {
        ctx.need(Permission::RenameHosts)?;
        let host = self.require_host(old)?;
        let folder_path = host.folder_path().to_string();
        self.host_permissions(host, &ctx.user)?
            .need_permission(AccessOp::Write)?;
        need_unlocked_hosts(self.locked_hosts(&folder_path)?, &folder_path)?;
        validate_host_name(new)?;
        if self.find_host(new)?.is_some() {
            return Err(WatoError::user_input(format!(
                "A host with the name '{}' already exists",
                new
            )));
        }
        let site = host.site(self)?;

        let data = self.host_data_mut(&folder_path)?;
        let mut host = data
            .hosts
            .remove(old)
            .ok_or_else(|| WatoError::HostNotFound(old.to_string()))?;
        host.rename(new);
        data.hosts.insert(new.to_string(), host);

        let mut affected = Vec::new();
        let mut dirty = BTreeSet::from([folder_path.clone()]);
        let root = self.root_dir().to_path_buf();
        let paths: Vec<String> = self.folders.keys().cloned().collect();
        for path in paths {
            let folder = self.folder_mut(&path)?;
            if rename_in_parents(&mut folder.attributes, old, new) {
                folder.save_descriptor(&root)?;
            }
            let data = self.host_data_mut(&path)?;
            for host in data.hosts.values_mut() {
                let mut changed = rename_in_parents(&mut host.attributes, old, new);
                for node in host.cluster_nodes.iter_mut().flatten() {
                    if node == old {
                        *node = new.to_string();
                        changed = true;
                    }
                }
                if changed {
                    affected.push(host.name.clone());
                    dirty.insert(path.clone());
                }
            }
        }
        for path in &dirty {
            self.save_hosts(path)?;
        }
        self.drop_caches("");

        ctx.record(
            ChangeKind::RenameHost,
            ObjectRef::host(new),
            format!("Renamed host {} into {}", old, new),
            None,
            BTreeSet::from([site]),
        );
        Ok(affected)
    }

    /// Replaces a host's attributes and cluster nodes.
    ///
    /// Changing the contact groups additionally needs write permission on
    /// the folder. The returned diff masks secret values.
    pub fn apply_edit(
        &mut self,
        ctx: &RequestContext,
        name: &str,
        attributes: Attributes,
        cluster_nodes: Option<Vec<String>>,
    ) -> Result<EditOutcome> {
        ctx.need(Permission::EditHosts)?;
        let host = self.require_host(name)?;
        let folder_path = host.folder_path().to_string();
        self.host_permissions(host, &ctx.user)?
            .need_permission(AccessOp::Write)?;
        need_unlocked_hosts(self.locked_hosts(&folder_path)?, &folder_path)?;
        self.registry().validate(&attributes)?;

        let old_groups = host.attributes.get("contactgroups");
        if old_groups != attributes.get("contactgroups") {
            self.permissions(&folder_path, &ctx.user)?
                .need_permission(AccessOp::Write)?;
            validate_contact_group_modification(&ctx.user, old_groups, attributes.get("contactgroups"))?;
        }
        for node in cluster_nodes.iter().flatten() {
            if node == name || self.find_host(node)?.is_none() {
                return Err(WatoError::user_input(format!(
                    "The cluster node '{}' is not an existing host",
                    node
                )));
            }
        }
        let diff = self.registry().redacted_diff(&host.attributes, &attributes);
        let old_site = host.site(self)?;

        let data = self.host_data_mut(&folder_path)?;
        let host = data
            .hosts
            .get_mut(name)
            .ok_or_else(|| WatoError::HostNotFound(name.to_string()))?;
        host.attributes = attributes;
        host.cluster_nodes = cluster_nodes;
        host.drop_caches();
        let new_site = self.host(&folder_path, name)?.site(self)?;
        self.save_hosts(&folder_path)?;

        let affected_sites = BTreeSet::from([old_site, new_site]);
        ctx.record(
            ChangeKind::EditHost,
            ObjectRef::host(name),
            format!("Modified attributes of host {}", name),
            diff.clone(),
            affected_sites.clone(),
        );
        Ok(EditOutcome {
            diff,
            affected_sites,
        })
    }

    /// Sets or overwrites individual attributes of a host.
    pub fn update_attributes(&mut self, ctx: &RequestContext, name: &str, changes: Attributes) -> Result<EditOutcome> {
        let host = self.require_host(name)?;
        let mut attributes = host.attributes.clone();
        let nodes = host.cluster_nodes.clone();
        attributes.extend(changes);
        self.apply_edit(ctx, name, attributes, nodes)
    }

    /// Removes individual attributes of a host so they are inherited again.
    pub fn clean_attributes(&mut self, ctx: &RequestContext, name: &str, names: &[String]) -> Result<EditOutcome> {
        let host = self.require_host(name)?;
        let mut attributes = host.attributes.clone();
        let nodes = host.cluster_nodes.clone();
        for attr in names {
            attributes.remove(attr);
        }
        self.apply_edit(ctx, name, attributes, nodes)
    }
}
