//! Change log of pending configuration changes.
//!
//! Every structural mutation records one entry. Entries are kept in memory
//! (bounded) and optionally appended to a JSON-lines file.

use std::collections::{BTreeSet, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::types::ObjectRef;

const MAX_ENTRIES: usize = 10_000;

/// Kind of a recorded change.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    NewFolder,
    EditFolder,
    DeleteFolder,
    MoveFolder,
    CreateHost,
    EditHost,
    DeleteHost,
    MoveHost,
    RenameHost,
    NewRule,
    EditRule,
    DeleteRule,
    MoveRule,
    EditRuleset,
}

/// One recorded change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: u64,
    /// Nanoseconds since the epoch.
    pub timestamp: u64,
    pub user_id: String,
    pub kind: ChangeKind,
    pub object: ObjectRef,
    pub text: String,
    /// Redacted attribute diff, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_text: Option<String>,
    /// Sites whose configuration must be regenerated.
    pub sites: BTreeSet<String>,
}

/// Filter for querying recorded changes.
#[derive(Clone, Debug, Default)]
pub struct ChangeFilter {
    pub user_id: Option<String>,
    pub kind: Option<ChangeKind>,
    pub object: Option<ObjectRef>,
}

impl ChangeFilter {
    pub fn matches(&self, entry: &ChangeEntry) -> bool {
        if let Some(ref u) = self.user_id {
            if &entry.user_id != u {
                return false;
            }
        }
        if let Some(k) = self.kind {
            if entry.kind != k {
                return false;
            }
        }
        if let Some(ref o) = self.object {
            if &entry.object != o {
                return false;
            }
        }
        true
    }
}

/// Bounded in-memory change log with an optional JSON-lines sink.
pub struct ChangeLog {
    entries: Mutex<VecDeque<ChangeEntry>>,
    next_id: Mutex<u64>,
    sink: Option<PathBuf>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChangeLog {
    /// Creates an in-memory change log.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            next_id: Mutex::new(1),
            sink: None,
        }
    }

    /// Creates a change log that also appends every entry to `path`.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            sink: Some(path.into()),
            ..Self::new()
        }
    }

    /// Records a change and returns its id.
    pub fn record(
        &self,
        user_id: &str,
        kind: ChangeKind,
        object: ObjectRef,
        text: impl Into<String>,
        diff_text: Option<String>,
        sites: BTreeSet<String>,
    ) -> u64 {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let id = {
            let mut next = lock(&self.next_id);
            let id = *next;
            *next += 1;
            id
        };

        let entry = ChangeEntry {
            id,
            timestamp,
            user_id: user_id.to_string(),
            kind,
            object,
            text: text.into(),
            diff_text,
            sites,
        };
        tracing::info!(id, kind = ?entry.kind, object = %entry.object, "{}", entry.text);

        if let Some(path) = &self.sink {
            if let Err(e) = append_line(path, &entry) {
                tracing::warn!(path = %path.display(), error = %e, "failed to append change entry");
            }
        }

        let mut entries = lock(&self.entries);
        if entries.len() >= MAX_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// Returns matching entries, oldest first.
    pub fn query(&self, filter: &ChangeFilter) -> Vec<ChangeEntry> {
        lock(&self.entries)
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// Returns all entries, oldest first.
    pub fn entries(&self) -> Vec<ChangeEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards all in-memory entries (changes were activated).
    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

fn append_line(path: &PathBuf, entry: &ChangeEntry) -> std::io::Result<()> {
    let line = serde_json::to_string(entry)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", line)
}
