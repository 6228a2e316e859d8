//! Checkmk setup core: folder hierarchy, hosts, attribute inheritance,
//! permissions, rules and ruleset matching.

pub mod access;
pub mod attributes;
pub mod changes;
pub mod collection;
pub mod conditions;
pub mod config;
pub mod context;
pub mod folder;
pub mod host;
pub mod index;
pub mod kvstore;
pub mod rule;
pub mod ruleset;
pub mod tags;
pub mod types;

pub use access::{AccessOp, Permission, PermissionCheck, UserContext};
pub use changes::{ChangeEntry, ChangeKind, ChangeLog};
pub use collection::{CollectionKind, RuleSearch, RulesetCollection};
pub use conditions::{MatchContext, RegexCache, RuleConditions};
pub use config::WatoConfig;
pub use context::RequestContext;
pub use folder::{Folder, FolderTree};
pub use host::{EditOutcome, Host, NewHost};
pub use index::{CachedFolderIndex, DirectFolderWalk, FolderIndex, FolderMeta};
pub use rule::{Rule, RuleOptions};
pub use ruleset::{MatchType, RuleLocation, Ruleset, Rulespec, RulespecRegistry};
pub use types::{Attributes, Labels, Result, TagGroups, WatoError};
