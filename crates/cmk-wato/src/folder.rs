//! Folder hierarchy: loading, attribute inheritance, permissions and
//! structural mutations.
//!
//! Every folder is a directory below the tree root holding a `.wato`
//! descriptor. Folders live in an arena keyed by normalized path; hosts refer
//! to their folder by path only.

use std::cell::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::*;
use crate::attributes::{parents_of, validators_for_edition, AttributeRegistry, FolderAttributeValidator};
use crate::changes::ChangeKind;
use crate::config::WatoConfig;
use crate::context::RequestContext;
use crate::host::HostData;
use crate::index::{self, DirectFolderWalk, FolderIndex, FolderMeta};
use crate::tags::TagConfig;
use crate::types::*;

/// Folder descriptor file name.
pub const WATO_FILE: &str = ".wato";

/// Title of the root folder.
pub const ROOT_TITLE: &str = "Main";

/// Persisted folder descriptor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FolderDescriptor {
    #[serde(rename = "__id")]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub num_hosts: usize,
    #[serde(default)]
    pub lock: LockFlag,
    #[serde(default)]
    pub lock_subfolders: LockFlag,
}

/// Reads a JSON file; None if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            WatoError::Serialization(format!("{}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Writes a pretty-printed JSON file via a temporary file.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// One node of the folder tree.
#[derive(Debug)]
pub struct Folder {
    path: String,
    id: String,
    pub(crate) title: String,
    pub(crate) attributes: Attributes,
    locked: LockFlag,
    locked_subfolders: LockFlag,
    pub(crate) num_hosts: usize,
    pub(crate) host_data: OnceCell<HostData>,
    effective: OnceCell<Attributes>,
}

impl Folder {
    fn new(path: &str, title: &str, attributes: Attributes) -> Self {
        Self {
            path: path.to_string(),
            id: uuid::Uuid::new_v4().simple().to_string(),
            title: title.to_string(),
            attributes,
            locked: LockFlag::default(),
            locked_subfolders: LockFlag::default(),
            num_hosts: 0,
            host_data: OnceCell::new(),
            effective: OnceCell::new(),
        }
    }

    fn from_descriptor(path: &str, d: FolderDescriptor) -> Self {
        Self {
            path: path.to_string(),
            id: d.id,
            title: d.title,
            attributes: d.attributes,
            locked: d.lock,
            locked_subfolders: d.lock_subfolders,
            num_hosts: d.num_hosts,
            host_data: OnceCell::new(),
            effective: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Directory name; empty for the root folder.
    pub fn name(&self) -> &str {
        path_name(&self.path)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Own (explicitly set) attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    pub fn parent_path(&self) -> Option<String> {
        parent_path(&self.path)
    }

    pub fn locked(&self) -> &LockFlag {
        &self.locked
    }

    pub fn locked_subfolders(&self) -> &LockFlag {
        &self.locked_subfolders
    }

    /// Number of hosts directly in this folder.
    pub fn num_hosts(&self) -> usize {
        self.host_data
            .get()
            .map(|d| d.hosts.len())
            .unwrap_or(self.num_hosts)
    }

    pub(crate) fn dir(&self, root: &Path) -> PathBuf {
        if self.path.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&self.path)
        }
    }

    pub(crate) fn descriptor(&self) -> FolderDescriptor {
        FolderDescriptor {
            id: self.id.clone(),
            title: self.title.clone(),
            attributes: self.attributes.clone(),
            num_hosts: self.num_hosts(),
            lock: self.locked.clone(),
            lock_subfolders: self.locked_subfolders.clone(),
        }
    }

    pub(crate) fn save_descriptor(&self, root: &Path) -> Result<()> {
        write_json(&self.dir(root).join(WATO_FILE), &self.descriptor())
    }

    pub(crate) fn drop_effective(&mut self) {
        self.effective.take();
    }
}

fn validate_folder_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WatoError::user_input(format!(
            "Invalid folder name '{}': only letters, digits, '-' and '_' are allowed",
            name
        )))
    }
}

fn level_groups(attributes: &Attributes) -> ContactGroupConfig {
    ContactGroupConfig::from_attribute(attributes.get("contactgroups"))
}

/// The folder hierarchy of one configuration root.
pub struct FolderTree {
    root_dir: PathBuf,
    site_id: String,
    tag_config: Arc<TagConfig>,
    registry: Arc<AttributeRegistry>,
    validators: Vec<Box<dyn FolderAttributeValidator>>,
    pub(crate) folders: BTreeMap<String, Folder>,
    index: Box<dyn FolderIndex>,
}

impl FolderTree {
    /// Loads the tree below `config.wato_root`, creating the root if needed.
    pub fn open(config: &WatoConfig) -> Result<Self> {
        let tag_config = Arc::new(TagConfig::builtin());
        let registry = Arc::new(AttributeRegistry::builtin(&config.site_id, tag_config.clone()));
        let mut tree = Self {
            root_dir: config.wato_root.clone(),
            site_id: config.site_id.clone(),
            validators: validators_for_edition(config.edition, registry.clone()),
            tag_config,
            registry,
            folders: BTreeMap::new(),
            index: index::from_config(&config.folder_index),
        };
        tree.reload()?;
        Ok(tree)
    }

    /// Loads the tree below `root` with default settings.
    pub fn open_dir(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open(&WatoConfig::with_root(root))
    }

    /// Replaces the folder index implementation.
    pub fn with_index(mut self, index: Box<dyn FolderIndex>) -> Self {
        self.index = index;
        self
    }

    /// Discards all in-memory state and re-reads the folder descriptors.
    pub fn reload(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.root_dir)?;
        self.folders.clear();
        self.load_subtree("")?;
        tracing::debug!(root = %self.root_dir.display(), folders = self.folders.len(), "loaded folder tree");
        Ok(())
    }

    fn load_subtree(&mut self, path: &str) -> Result<()> {
        let dir = if path.is_empty() {
            self.root_dir.clone()
        } else {
            self.root_dir.join(path)
        };
        let folder = match read_json::<FolderDescriptor>(&dir.join(WATO_FILE))? {
            Some(d) => Folder::from_descriptor(path, d),
            None => {
                let title = if path.is_empty() { ROOT_TITLE } else { path_name(path) };
                let folder = Folder::new(path, title, Attributes::new());
                folder.save_descriptor(&self.root_dir)?;
                tracing::info!(path, "created missing folder descriptor");
                folder
            }
        };
        self.folders.insert(path.to_string(), folder);

        let mut children = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match entry.file_name().to_str() {
                Some(name) if !name.starts_with('.') => children.push(name.to_string()),
                _ => tracing::warn!(dir = %dir.display(), "skipping unreadable directory name"),
            }
        }
        children.sort();
        for name in children {
            self.load_subtree(&join_path(path, &name))?;
        }
        Ok(())
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn tag_config(&self) -> &TagConfig {
        &self.tag_config
    }

    pub fn registry(&self) -> &AttributeRegistry {
        &self.registry
    }

    pub fn root(&self) -> Result<&Folder> {
        self.folder("")
    }

    /// Exact lookup by path.
    pub fn folder(&self, path: &str) -> Result<&Folder> {
        let path = normalize_path(path);
        self.folders
            .get(&path)
            .ok_or(WatoError::FolderNotFound(path))
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.folders.contains_key(&normalize_path(path))
    }

    pub(crate) fn folder_mut(&mut self, path: &str) -> Result<&mut Folder> {
        let path = normalize_path(path);
        match self.folders.get_mut(&path) {
            Some(folder) => Ok(folder),
            None => Err(WatoError::FolderNotFound(path)),
        }
    }

    pub(crate) fn folder_dir(&self, path: &str) -> Result<PathBuf> {
        Ok(self.folder(path)?.dir(&self.root_dir))
    }

    /// All folders, parents before children.
    pub fn all_folders(&self) -> impl Iterator<Item = &Folder> {
        self.folders.values()
    }

    /// Paths of `path` and every folder below it.
    pub fn subtree_paths(&self, path: &str) -> Vec<String> {
        let path = normalize_path(path);
        self.folders
            .keys()
            .filter(|p| is_transitive_parent(&path, p))
            .cloned()
            .collect()
    }

    /// Direct children of a folder.
    pub fn subfolders(&self, path: &str) -> Result<Vec<&Folder>> {
        let path = normalize_path(path);
        self.folder(&path)?;
        Ok(self
            .folders
            .values()
            .filter(|f| f.parent_path().as_deref() == Some(path.as_str()))
            .collect())
    }

    /// Titles from the root folder down to `path`.
    pub fn title_path(&self, path: &str) -> Result<Vec<String>> {
        ancestor_chain(&normalize_path(path))
            .iter()
            .map(|p| self.folder(p).map(|f| f.title.clone()))
            .collect()
    }

    /// Own attributes layered root to folder (closer wins), then defaults
    /// for anything still unset. Memoized until [`FolderTree::drop_caches`].
    pub fn effective_attributes(&self, path: &str) -> Result<&Attributes> {
        let folder = self.folder(path)?;
        if let Some(effective) = folder.effective.get() {
            return Ok(effective);
        }
        let mut effective = match folder.parent_path() {
            Some(parent) => self.effective_attributes(&parent)?.clone(),
            None => Attributes::new(),
        };
        for (k, v) in &folder.attributes {
            effective.insert(k.clone(), v.clone());
        }
        for (k, v) in self.registry.defaults() {
            effective.entry(k).or_insert(v);
        }
        Ok(folder.effective.get_or_init(|| effective))
    }

    /// Invalidates memoized values of `path`, its descendants and their hosts.
    pub fn drop_caches(&mut self, path: &str) {
        let path = normalize_path(path);
        for (p, folder) in self.folders.iter_mut() {
            if !is_transitive_parent(&path, p) {
                continue;
            }
            folder.drop_effective();
            if let Some(data) = folder.host_data.get_mut() {
                for host in data.hosts.values_mut() {
                    host.drop_caches();
                }
            }
        }
    }

    fn inherited_groups(&self, path: &str) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let mut perms = BTreeSet::new();
        let mut uses = BTreeSet::new();
        for p in ancestor_chain(path) {
            let cg = level_groups(&self.folder(&p)?.attributes);
            if cg.recurse_perms {
                perms.extend(cg.groups.iter().cloned());
            }
            if cg.use_for_hosts && cg.recurse_use {
                uses.extend(cg.groups.iter().cloned());
            }
        }
        Ok((perms, uses))
    }

    /// Contact groups of a folder: its own groups plus those recursively
    /// granted by its ancestors.
    pub fn permitted_groups(&self, path: &str) -> Result<PermittedGroups> {
        let folder = self.folder(path)?;
        let cg = level_groups(&folder.attributes);
        let (mut permitted, mut host_contact_groups) = match folder.parent_path() {
            Some(parent) => self.inherited_groups(&parent)?,
            None => Default::default(),
        };
        permitted.extend(cg.groups.iter().cloned());
        if cg.use_for_hosts {
            host_contact_groups.extend(cg.groups.iter().cloned());
        }
        let effective = level_groups(self.effective_attributes(path)?);
        Ok(PermittedGroups {
            permitted,
            host_contact_groups,
            use_for_services: effective.use_for_services,
        })
    }

    /// Permission capability of `user` on a folder.
    pub fn permissions<'a>(&self, path: &str, user: &'a UserContext) -> Result<PermissionCheck<'a>> {
        let subject = format!("the folder {}", self.title_path(path)?.join(" / "));
        Ok(PermissionCheck::new(subject, self.permitted_groups(path)?, user))
    }

    /// Requires `op` on the folder and every folder below it.
    pub fn need_recursive_permission(&self, path: &str, user: &UserContext, op: AccessOp) -> Result<()> {
        for p in self.subtree_paths(path) {
            self.permissions(&p, user)?.need_permission(op)?;
        }
        Ok(())
    }

    /// Sites affected by a change of the folder.
    pub(crate) fn folder_sites(&self, path: &str) -> Result<BTreeSet<String>> {
        let site = self
            .effective_attributes(path)?
            .get("site")
            .and_then(Value::as_str)
            .unwrap_or(&self.site_id)
            .to_string();
        Ok([site].into_iter().collect())
    }

    pub(crate) fn notify_index(&self, path: &str) {
        if let Err(e) = self.index.folder_changed(self, path) {
            tracing::warn!(path, error = %e, "folder index update failed");
        }
    }

    pub(crate) fn invalidate_index(&self) {
        if let Err(e) = self.index.invalidate() {
            tracing::warn!(error = %e, "folder index invalidation failed");
        }
    }

    fn validate_attributes(&self, parent: &str, attributes: &Attributes) -> Result<()> {
        for validator in &self.validators {
            validator.validate(parent, attributes)?;
        }
        Ok(())
    }

    /// Creates a subfolder and returns its path.
    pub fn create_subfolder(
        &mut self,
        ctx: &RequestContext,
        parent: &str,
        name: &str,
        title: &str,
        attributes: Attributes,
    ) -> Result<String> {
        ctx.need(Permission::ManageFolders)?;
        let parent = normalize_path(parent);
        self.permissions(&parent, &ctx.user)?
            .need_permission(AccessOp::Write)?;
        if let Some(reason) = lock_reason(self.folder(&parent)?.locked_subfolders()) {
            return Err(WatoError::user_input(format!(
                "Cannot create a subfolder: the subfolders of this folder are locked ({})",
                reason
            )));
        }
        validate_folder_name(name)?;
        let path = join_path(&parent, name);
        if self.folders.contains_key(&path) {
            return Err(WatoError::user_input(format!(
                "A folder with the name '{}' already exists",
                name
            )));
        }
        self.validate_attributes(&parent, &attributes)?;
        validate_contact_group_modification(&ctx.user, None, attributes.get("contactgroups"))?;

        let folder = Folder::new(&path, title, attributes);
        std::fs::create_dir_all(folder.dir(&self.root_dir))?;
        folder.save_descriptor(&self.root_dir)?;
        self.folders.insert(path.clone(), folder);

        ctx.record(
            ChangeKind::NewFolder,
            ObjectRef::folder(&path),
            format!("Created new folder {}", path),
            None,
            self.folder_sites(&path)?,
        );
        self.notify_index(&path);
        Ok(path)
    }

    /// Deletes a subfolder with everything below it.
    pub fn delete_subfolder(&mut self, ctx: &RequestContext, parent: &str, name: &str) -> Result<()> {
        ctx.need(Permission::ManageFolders)?;
        let parent = normalize_path(parent);
        self.permissions(&parent, &ctx.user)?
            .need_permission(AccessOp::Write)?;
        if let Some(reason) = lock_reason(self.folder(&parent)?.locked_subfolders()) {
            return Err(WatoError::user_input(format!(
                "Cannot delete a subfolder: the subfolders of this folder are locked ({})",
                reason
            )));
        }
        let path = join_path(&parent, name);
        if let Some(reason) = lock_reason(self.folder(&path)?.locked()) {
            return Err(WatoError::user_input(format!(
                "Cannot delete the folder {}: it is locked ({})",
                path, reason
            )));
        }

        let subtree = self.subtree_paths(&path);
        let mut doomed = BTreeSet::new();
        for p in &subtree {
            doomed.extend(self.hosts(p)?.keys().cloned());
        }
        let outside: Vec<String> = self
            .folders
            .keys()
            .filter(|p| !is_transitive_parent(&path, p))
            .cloned()
            .collect();
        for p in &outside {
            for host in self.hosts(p)?.values() {
                let used: Vec<String> = parents_of(host.attributes())
                    .into_iter()
                    .filter(|parent| doomed.contains(parent))
                    .collect();
                if !used.is_empty() {
                    return Err(WatoError::user_input(format!(
                        "Cannot delete the folder {}: the host(s) {} are used as parents by {}",
                        path,
                        used.join(", "),
                        host.name()
                    )));
                }
            }
        }

        let sites = self.folder_sites(&path)?;
        std::fs::remove_dir_all(self.folder_dir(&path)?)?;
        self.folders.retain(|p, _| !is_transitive_parent(&path, p));

        ctx.record(
            ChangeKind::DeleteFolder,
            ObjectRef::folder(&path),
            format!("Deleted folder {}", path),
            None,
            sites,
        );
        self.invalidate_index();
        Ok(())
    }

    /// Moves `subfolder` below `target` and returns its new path. Hosts of
    /// the moved subtree are re-saved so inherited attributes take effect.
    pub fn move_subfolder_to(&mut self, ctx: &RequestContext, subfolder: &str, target: &str) -> Result<String> {
        ctx.need(Permission::ManageFolders)?;
        let src = normalize_path(subfolder);
        let dst = normalize_path(target);
        if src.is_empty() {
            return Err(WatoError::user_input("Cannot move the main folder"));
        }
        self.folder(&src)?;
        self.folder(&dst)?;
        if src == dst {
            return Err(WatoError::user_input("Cannot move a folder into itself"));
        }
        if is_transitive_parent(&src, &dst) {
            return Err(WatoError::user_input(
                "Cannot move a folder into one of its own subfolders",
            ));
        }
        if parent_path(&src).as_deref() == Some(dst.as_str()) {
            return Err(WatoError::user_input(
                "The folder is already located in the target folder",
            ));
        }
        let new_path = join_path(&dst, path_name(&src));
        if self.folders.contains_key(&new_path) {
            return Err(WatoError::user_input(format!(
                "The target folder already contains a folder named '{}'",
                path_name(&src)
            )));
        }
        if let Some(reason) = lock_reason(self.folder(&src)?.locked()) {
            return Err(WatoError::user_input(format!(
                "Cannot move the folder: it is locked ({})",
                reason
            )));
        }
        if let Some(reason) = lock_reason(self.folder(&dst)?.locked_subfolders()) {
            return Err(WatoError::user_input(format!(
                "Cannot move the folder: the subfolders of the target are locked ({})",
                reason
            )));
        }
        self.need_recursive_permission(&src, &ctx.user, AccessOp::Write)?;
        self.permissions(&dst, &ctx.user)?
            .need_permission(AccessOp::Write)?;
        if let Some(parent) = parent_path(&src) {
            self.permissions(&parent, &ctx.user)?
                .need_permission(AccessOp::Write)?;
        }

        let mut sites = self.folder_sites(&src)?;
        std::fs::rename(self.folder_dir(&src)?, self.folder_dir(&dst)?.join(path_name(&src)))?;
        self.folders.retain(|p, _| !is_transitive_parent(&src, p));
        self.load_subtree(&new_path)?;

        for p in self.subtree_paths(&new_path) {
            self.hosts(&p)?;
            self.save_hosts(&p)?;
        }
        self.drop_caches(&new_path);
        sites.extend(self.folder_sites(&new_path)?);

        ctx.record(
            ChangeKind::MoveFolder,
            ObjectRef::folder(&new_path),
            format!("Moved folder {} to {}", src, new_path),
            None,
            sites,
        );
        self.invalidate_index();
        Ok(new_path)
    }

    /// Changes title and own attributes of a folder.
    pub fn edit_folder(&mut self, ctx: &RequestContext, path: &str, title: &str, attributes: Attributes) -> Result<()> {
        let path = normalize_path(path);
        self.permissions(&path, &ctx.user)?
            .need_permission(AccessOp::Write)?;
        let folder = self.folder(&path)?;
        if let Some(reason) = lock_reason(folder.locked()) {
            return Err(WatoError::user_input(format!(
                "Cannot edit the folder: it is locked ({})",
                reason
            )));
        }
        let parent = folder.parent_path().unwrap_or_default();
        self.validate_attributes(&parent, &attributes)?;
        validate_contact_group_modification(
            &ctx.user,
            folder.attributes.get("contactgroups"),
            attributes.get("contactgroups"),
        )?;
        let diff = self.registry.redacted_diff(&folder.attributes, &attributes);
        let mut sites = self.folder_sites(&path)?;

        let root = self.root_dir.clone();
        let folder = self.folder_mut(&path)?;
        folder.title = title.to_string();
        folder.attributes = attributes;
        folder.save_descriptor(&root)?;
        self.drop_caches(&path);
        sites.extend(self.folder_sites(&path)?);

        ctx.record(
            ChangeKind::EditFolder,
            ObjectRef::folder(&path),
            format!("Edited properties of folder {}", path),
            diff,
            sites,
        );
        self.invalidate_index();
        Ok(())
    }

    /// Cached folder metadata; falls back to walking the tree if the index
    /// is unavailable.
    pub fn folder_meta(&self, path: &str) -> Result<FolderMeta> {
        let path = normalize_path(path);
        match self.index.folder_meta(self, &path) {
            Err(WatoError::CacheUnavailable(reason)) => {
                tracing::warn!(path = %path, %reason, "folder index unavailable, walking tree");
                DirectFolderWalk.folder_meta(self, &path)
            }
            other => other,
        }
    }

    /// Number of hosts in the folder and all its subfolders.
    pub fn num_hosts_recursively(&self, path: &str) -> Result<usize> {
        let path = normalize_path(path);
        match self.index.num_hosts_recursively(self, &path) {
            Err(WatoError::CacheUnavailable(reason)) => {
                tracing::warn!(path = %path, %reason, "folder index unavailable, walking tree");
                DirectFolderWalk.num_hosts_recursively(self, &path)
            }
            other => other,
        }
    }
}

fn lock_reason(flag: &LockFlag) -> Option<String> {
    if flag.is_locked() {
        Some(flag.reason().unwrap_or("locked").to_string())
    } else {
        None
    }
}
