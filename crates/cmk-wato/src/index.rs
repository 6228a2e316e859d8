//! Folder index: per-folder metadata (title path, permitted groups, host
//! counts) without walking the tree on every request.
//!
//! [`CachedFolderIndex`] keeps one bincode record per folder in a
//! [`KvStore`]. Keys are `folder:/` followed by the folder path and a
//! trailing slash, so a prefix scan yields a whole subtree. The index is
//! rebuilt whenever the set of folders or the modification time or size of
//! any `.wato` descriptor differs from the last update.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::FolderIndexConfig;
use crate::folder::{FolderTree, WATO_FILE};
use crate::kvstore::{BatchOp, FileKvStore, KvStore, MemoryKvStore};
use crate::types::*;

const FOLDER_PREFIX: &str = "folder:/";
const META_KEY: &[u8] = b"meta:last_update";

/// Cached metadata of one folder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMeta {
    pub title: String,
    /// Titles from the root folder down to this folder.
    pub title_path: Vec<String>,
    pub permitted_groups: BTreeSet<String>,
    /// Hosts directly in the folder.
    pub num_hosts: usize,
}

/// Computes a folder's metadata from the tree.
pub fn compute_meta(tree: &FolderTree, path: &str) -> Result<FolderMeta> {
    let folder = tree.folder(path)?;
    Ok(FolderMeta {
        title: folder.title().to_string(),
        title_path: tree.title_path(path)?,
        permitted_groups: tree.permitted_groups(path)?.permitted,
        num_hosts: folder.num_hosts(),
    })
}

/// Source of folder metadata.
pub trait FolderIndex: Send + Sync {
    fn folder_meta(&self, tree: &FolderTree, path: &str) -> Result<FolderMeta>;

    /// Hosts in the folder and all of its subfolders.
    fn num_hosts_recursively(&self, tree: &FolderTree, path: &str) -> Result<usize>;

    /// Called after a folder's descriptor or hosts were written.
    fn folder_changed(&self, tree: &FolderTree, path: &str) -> Result<()>;

    /// Forces a rebuild on next access.
    fn invalidate(&self) -> Result<()>;
}

/// Answers every query by walking the in-memory tree.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectFolderWalk;

impl FolderIndex for DirectFolderWalk {
    fn folder_meta(&self, tree: &FolderTree, path: &str) -> Result<FolderMeta> {
        compute_meta(tree, path)
    }

    fn num_hosts_recursively(&self, tree: &FolderTree, path: &str) -> Result<usize> {
        tree.folder(path)?;
        let mut total = 0;
        for p in tree.subtree_paths(path) {
            total += tree.folder(&p)?.num_hosts();
        }
        Ok(total)
    }

    fn folder_changed(&self, _tree: &FolderTree, _path: &str) -> Result<()> {
        Ok(())
    }

    fn invalidate(&self) -> Result<()> {
        Ok(())
    }
}

/// Modification time (nanoseconds) and size of one `.wato` descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct DescriptorStamp {
    mtime: u128,
    len: u64,
}

/// Descriptor stamps of every folder, keyed by path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct IndexStamp(BTreeMap<String, DescriptorStamp>);

impl IndexStamp {
    /// True if both stamps agree on every folder other than `path`.
    fn same_except(&self, other: &IndexStamp, path: &str) -> bool {
        let rest = |stamp: &IndexStamp| {
            stamp
                .0
                .iter()
                .filter(|(p, _)| p.as_str() != path)
                .map(|(p, d)| (p.clone(), *d))
                .collect::<Vec<_>>()
        };
        rest(self) == rest(other)
    }
}

/// Exclusive lock file held while the index is read or rebuilt.
struct IndexLock {
    path: PathBuf,
}

impl IndexLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WatoError::CacheUnavailable(e.to_string()))?;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
            {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(WatoError::CacheUnavailable(format!(
                            "timed out waiting for lock {}",
                            path.display()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(WatoError::CacheUnavailable(e.to_string())),
            }
        }
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release index lock");
        }
    }
}

fn folder_key(path: &str) -> Vec<u8> {
    if path.is_empty() {
        FOLDER_PREFIX.as_bytes().to_vec()
    } else {
        format!("{}{}/", FOLDER_PREFIX, path).into_bytes()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| WatoError::Serialization(e.to_string()))
}

fn descriptor_stamp(tree: &FolderTree, path: &str) -> Result<DescriptorStamp> {
    let file = tree.folder_dir(path)?.join(WATO_FILE);
    let metadata = std::fs::metadata(&file)?;
    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    Ok(DescriptorStamp {
        mtime,
        len: metadata.len(),
    })
}

fn current_stamp(tree: &FolderTree) -> Result<IndexStamp> {
    let mut stamps = BTreeMap::new();
    for folder in tree.all_folders() {
        stamps.insert(folder.path().to_string(), descriptor_stamp(tree, folder.path())?);
    }
    Ok(IndexStamp(stamps))
}

/// Folder index persisted in a key/value store.
pub struct CachedFolderIndex {
    store: Box<dyn KvStore>,
    lock_path: Option<PathBuf>,
    lock_timeout: Duration,
}

impl CachedFolderIndex {
    /// An index in a process-local store, without a lock file.
    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryKvStore::new()),
            lock_path: None,
            lock_timeout: Duration::from_millis(0),
        }
    }

    /// An index in `store`, serialized between processes by `lock_path`.
    pub fn new(store: Box<dyn KvStore>, lock_path: Option<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            store,
            lock_path,
            lock_timeout,
        }
    }

    fn lock(&self) -> Result<Option<IndexLock>> {
        self.lock_path
            .as_deref()
            .map(|p| IndexLock::acquire(p, self.lock_timeout))
            .transpose()
    }

    fn stored_stamp(&self) -> Result<Option<IndexStamp>> {
        match self.store.get(META_KEY)? {
            None => Ok(None),
            Some(bytes) => match bincode::deserialize(&bytes) {
                Ok(stamp) => Ok(Some(stamp)),
                Err(e) => {
                    tracing::warn!(error = %e, "corrupt folder index stamp");
                    Ok(None)
                }
            },
        }
    }

    fn rebuild(&self, tree: &FolderTree, stamp: &IndexStamp) -> Result<()> {
        let mut ops = vec![BatchOp::DeletePrefix {
            prefix: FOLDER_PREFIX.as_bytes().to_vec(),
        }];
        for folder in tree.all_folders() {
            ops.push(BatchOp::Put {
                key: folder_key(folder.path()),
                value: encode(&compute_meta(tree, folder.path())?)?,
            });
        }
        ops.push(BatchOp::Put {
            key: META_KEY.to_vec(),
            value: encode(stamp)?,
        });
        self.store.write_batch(ops)?;
        tracing::info!(folders = stamp.0.len(), "rebuilt folder index");
        Ok(())
    }

    fn ensure_fresh(&self, tree: &FolderTree) -> Result<()> {
        let current = current_stamp(tree)?;
        if self.stored_stamp()?.as_ref() != Some(&current) {
            self.rebuild(tree, &current)?;
        }
        Ok(())
    }
}

impl FolderIndex for CachedFolderIndex {
    fn folder_meta(&self, tree: &FolderTree, path: &str) -> Result<FolderMeta> {
        tree.folder(path)?;
        let _lock = self.lock()?;
        self.ensure_fresh(tree)?;
        if let Some(bytes) = self.store.get(&folder_key(path))? {
            match bincode::deserialize(&bytes) {
                Ok(meta) => return Ok(meta),
                Err(e) => {
                    tracing::warn!(path, error = %e, "corrupt folder index entry");
                    self.rebuild(tree, &current_stamp(tree)?)?;
                }
            }
        }
        compute_meta(tree, path)
    }

    fn num_hosts_recursively(&self, tree: &FolderTree, path: &str) -> Result<usize> {
        tree.folder(path)?;
        let _lock = self.lock()?;
        self.ensure_fresh(tree)?;
        let mut total = 0;
        for (key, bytes) in self.store.scan_prefix(&folder_key(path))? {
            match bincode::deserialize::<FolderMeta>(&bytes) {
                Ok(meta) => total += meta.num_hosts,
                Err(e) => {
                    tracing::warn!(key = %String::from_utf8_lossy(&key), error = %e, "corrupt folder index entry");
                    self.rebuild(tree, &current_stamp(tree)?)?;
                    return DirectFolderWalk.num_hosts_recursively(tree, path);
                }
            }
        }
        Ok(total)
    }

    /// Updates the single entry if the rest of the index is still current,
    /// otherwise rebuilds.
    fn folder_changed(&self, tree: &FolderTree, path: &str) -> Result<()> {
        let _lock = self.lock()?;
        let Some(stored) = self.stored_stamp()? else {
            return Ok(());
        };
        let current = current_stamp(tree)?;
        if !current.same_except(&stored, path) {
            return self.rebuild(tree, &current);
        }
        self.store.write_batch(vec![
            BatchOp::Put {
                key: folder_key(path),
                value: encode(&compute_meta(tree, path)?)?,
            },
            BatchOp::Put {
                key: META_KEY.to_vec(),
                value: encode(&current)?,
            },
        ])?;
        tracing::debug!(path, "updated folder index entry");
        Ok(())
    }

    fn invalidate(&self) -> Result<()> {
        let _lock = self.lock()?;
        self.store.delete(META_KEY)
    }
}

/// Builds the index selected by the configuration.
pub fn from_config(config: &FolderIndexConfig) -> Box<dyn FolderIndex> {
    if !config.enabled {
        return Box::new(DirectFolderWalk);
    }
    match &config.store_path {
        Some(path) => Box::new(CachedFolderIndex::new(
            Box::new(FileKvStore::open(path)),
            Some(path.with_extension("lock")),
            Duration::from_millis(config.lock_timeout_ms),
        )),
        None => Box::new(CachedFolderIndex::in_memory()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::host::NewHost;

    fn populated() -> (tempfile::TempDir, FolderTree) {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = FolderTree::open_dir(dir.path()).unwrap();
        let ctx = RequestContext::admin();
        tree.create_subfolder(&ctx, "", "a", "Alpha", Attributes::new()).unwrap();
        tree.create_subfolder(&ctx, "a", "b", "Beta", Attributes::new()).unwrap();
        tree.create_subfolder(&ctx, "", "ab", "AB", Attributes::new()).unwrap();
        tree.create_hosts(&ctx, "a", vec![NewHost::new("h1", Attributes::new())]).unwrap();
        tree.create_hosts(
            &ctx,
            "a/b",
            vec![NewHost::new("h2", Attributes::new()), NewHost::new("h3", Attributes::new())],
        )
        .unwrap();
        tree.create_hosts(&ctx, "ab", vec![NewHost::new("h4", Attributes::new())]).unwrap();
        (dir, tree)
    }

    #[test]
    fn test_folder_key_prefixes() {
        assert_eq!(folder_key(""), b"folder:/".to_vec());
        assert_eq!(folder_key("a/b"), b"folder:/a/b/".to_vec());
        assert!(!folder_key("ab").starts_with(&folder_key("a")));
    }

    #[test]
    fn test_cached_matches_direct_walk() {
        let (_dir, tree) = populated();
        let cached = CachedFolderIndex::in_memory();
        for path in ["", "a", "a/b", "ab"] {
            assert_eq!(
                cached.folder_meta(&tree, path).unwrap(),
                DirectFolderWalk.folder_meta(&tree, path).unwrap()
            );
            assert_eq!(
                cached.num_hosts_recursively(&tree, path).unwrap(),
                DirectFolderWalk.num_hosts_recursively(&tree, path).unwrap()
            );
        }
        assert_eq!(cached.num_hosts_recursively(&tree, "a").unwrap(), 3);
        assert_eq!(
            cached.folder_meta(&tree, "a/b").unwrap().title_path,
            vec!["Main", "Alpha", "Beta"]
        );
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let (_dir, mut tree) = populated();
        let cached = CachedFolderIndex::in_memory();
        assert_eq!(cached.num_hosts_recursively(&tree, "").unwrap(), 4);

        let ctx = RequestContext::admin();
        tree.create_subfolder(&ctx, "", "c", "C", Attributes::new()).unwrap();
        tree.create_hosts(&ctx, "c", vec![NewHost::new("h5", Attributes::new())]).unwrap();
        cached.invalidate().unwrap();
        assert_eq!(cached.num_hosts_recursively(&tree, "").unwrap(), 5);
    }

    #[test]
    fn test_external_edit_with_older_mtime_is_noticed() {
        let (dir, tree) = populated();
        let cached = CachedFolderIndex::in_memory();
        assert_eq!(cached.folder_meta(&tree, "ab").unwrap().title, "AB");

        let file = dir.path().join("ab").join(WATO_FILE);
        let text = std::fs::read_to_string(&file).unwrap();
        assert!(text.contains("\"title\": \"AB\""));
        std::fs::write(&file, text.replace("\"title\": \"AB\"", "\"title\": \"XY\"")).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&file)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_secs(1))
            .unwrap();

        let reloaded = FolderTree::open_dir(dir.path()).unwrap();
        assert_eq!(cached.folder_meta(&reloaded, "ab").unwrap().title, "XY");
        assert_eq!(cached.folder_meta(&reloaded, "a").unwrap().title, "Alpha");
    }

    #[test]
    fn test_folder_changed_updates_only_when_rest_is_current() {
        let (_dir, mut tree) = populated();
        let cached = CachedFolderIndex::in_memory();
        assert_eq!(cached.num_hosts_recursively(&tree, "").unwrap(), 4);

        let ctx = RequestContext::admin();
        tree.create_hosts(&ctx, "ab", vec![NewHost::new("h5", Attributes::new())]).unwrap();
        cached.folder_changed(&tree, "ab").unwrap();
        assert_eq!(cached.stored_stamp().unwrap(), Some(current_stamp(&tree).unwrap()));
        assert_eq!(cached.folder_meta(&tree, "ab").unwrap().num_hosts, 2);

        let mut stale = current_stamp(&tree).unwrap();
        stale.0.get_mut("a").unwrap().len += 1;
        cached.store.put(META_KEY.to_vec(), encode(&stale).unwrap()).unwrap();
        cached.folder_changed(&tree, "ab").unwrap();
        assert_eq!(cached.stored_stamp().unwrap(), Some(current_stamp(&tree).unwrap()));
        assert_eq!(cached.num_hosts_recursively(&tree, "").unwrap(), 5);
    }

    #[test]
    fn test_corrupt_entry_is_rebuilt() {
        let (_dir, tree) = populated();
        let cached = CachedFolderIndex::in_memory();
        cached.folder_meta(&tree, "a").unwrap();
        cached.store.put(folder_key("a"), b"garbage".to_vec()).unwrap();
        assert_eq!(cached.folder_meta(&tree, "a").unwrap().title, "Alpha");
        assert_eq!(cached.num_hosts_recursively(&tree, "a").unwrap(), 3);
    }

    #[test]
    fn test_lock_timeout() {
        let (dir, tree) = populated();
        let lock_path = dir.path().join("index.lock");
        std::fs::write(&lock_path, b"").unwrap();
        let cached = CachedFolderIndex::new(
            Box::new(MemoryKvStore::new()),
            Some(lock_path.clone()),
            Duration::from_millis(30),
        );
        assert!(matches!(
            cached.folder_meta(&tree, "a"),
            Err(WatoError::CacheUnavailable(_))
        ));
        std::fs::remove_file(&lock_path).unwrap();
        assert!(cached.folder_meta(&tree, "a").is_ok());
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_tree_falls_back_when_locked() {
        let (dir, _) = populated();
        let store_path = dir.path().join("index.bin");
        std::fs::write(store_path.with_extension("lock"), b"").unwrap();
        let config = FolderIndexConfig {
            enabled: true,
            store_path: Some(store_path),
            lock_timeout_ms: 20,
        };
        let tree = FolderTree::open_dir(dir.path())
            .unwrap()
            .with_index(from_config(&config));
        assert_eq!(tree.num_hosts_recursively("a").unwrap(), 3);
        assert_eq!(tree.folder_meta("ab").unwrap().num_hosts, 1);
    }
}
