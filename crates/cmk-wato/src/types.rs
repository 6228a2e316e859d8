use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute mapping of a folder or host (attribute name to value).
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// Label mapping (label key to label value).
pub type Labels = BTreeMap<String, String>;

/// Tag assignment of a host (tag group id to tag id).
pub type TagGroups = BTreeMap<String, String>;

/// Result alias for setup operations.
pub type Result<T> = std::result::Result<T, WatoError>;

/// Lock flag of a folder or of the hosts in a folder.
///
/// Either a plain boolean or a string carrying the reason the object is
/// locked (usually the name of the integration that created it).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LockFlag {
    /// Plain on/off flag.
    Flag(bool),
    /// Locked, with a human-readable reason.
    Reason(String),
}

impl LockFlag {
    /// Returns true if the object is locked.
    pub fn is_locked(&self) -> bool {
        match self {
            LockFlag::Flag(locked) => *locked,
            LockFlag::Reason(_) => true,
        }
    }

    /// Returns the lock reason, if one was given.
    pub fn reason(&self) -> Option<&str> {
        match self {
            LockFlag::Flag(_) => None,
            LockFlag::Reason(reason) => Some(reason),
        }
    }

    /// Returns true if this is the default (unlocked) value.
    pub fn is_unlocked(&self) -> bool {
        !self.is_locked()
    }
}

impl Default for LockFlag {
    fn default() -> Self {
        LockFlag::Flag(false)
    }
}

/// Normalizes a folder path: strips surrounding slashes and collapses
/// empty components. The root folder is the empty string.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Returns the parent path of a folder path, or None for the root folder.
pub fn parent_path(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(pos) => Some(path[..pos].to_string()),
        None => Some(String::new()),
    }
}

/// Joins a folder path and a child name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Returns the last component of a folder path.
pub fn path_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Returns true if `ancestor` is `path` itself or one of its ancestors.
pub fn is_transitive_parent(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty()
        || ancestor == path
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'/')
}

/// Returns the chain of folder paths from the root down to `path` (inclusive).
pub fn ancestor_chain(path: &str) -> Vec<String> {
    let mut chain = vec![String::new()];
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current = join_path(&current, part);
        chain.push(current.clone());
    }
    chain
}

/// Kind of object referenced by a change log entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// A folder, identified by its path.
    Folder,
    /// A host, identified by its name.
    Host,
    /// A rule, identified by its id.
    Rule,
}

/// Reference to the object a change applies to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Object kind.
    pub kind: ObjectKind,
    /// Object identifier.
    pub ident: String,
}

impl ObjectRef {
    /// Creates a reference to a folder.
    pub fn folder(path: &str) -> Self {
        Self {
            kind: ObjectKind::Folder,
            ident: path.to_string(),
        }
    }

    /// Creates a reference to a host.
    pub fn host(name: &str) -> Self {
        Self {
            kind: ObjectKind::Host,
            ident: name.to_string(),
        }
    }

    /// Creates a reference to a rule.
    pub fn rule(id: &str) -> Self {
        Self {
            kind: ObjectKind::Rule,
            ident: id.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.ident)
    }
}

/// Error types for folder, host and rule operations.
#[derive(Debug, thiserror::Error)]
pub enum WatoError {
    /// The acting user lacks a permission. The reason explains what is missing.
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Human-readable explanation, including the permitted groups.
        reason: String,
    },

    /// Malformed or conflicting input from the caller.
    #[error("{0}")]
    UserInput(String),

    /// The requested folder does not exist.
    #[error("folder '{0}' not found")]
    FolderNotFound(String),

    /// The requested host does not exist.
    #[error("host '{0}' not found")]
    HostNotFound(String),

    /// The requested rule does not exist.
    #[error("rule '{rule_id}' not found in ruleset '{ruleset}'")]
    RuleNotFound {
        /// Ruleset that was searched.
        ruleset: String,
        /// Rule id that was not found.
        rule_id: String,
    },

    /// The requested ruleset does not exist.
    #[error("ruleset '{0}' not found")]
    RulesetNotFound(String),

    /// The operation is not implemented for this object.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The folder index cache could not be used.
    #[error("folder index unavailable: {0}")]
    CacheUnavailable(String),

    /// A regular expression in a rule condition does not compile.
    #[error("invalid regular expression '{pattern}': {reason}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// A persisted file could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WatoError {
    /// Shorthand for a user-input error.
    pub fn user_input(msg: impl Into<String>) -> Self {
        WatoError::UserInput(msg.into())
    }
}

impl From<serde_json::Error> for WatoError {
    fn from(e: serde_json::Error) -> Self {
        WatoError::Serialization(e.to_string())
    }
}
