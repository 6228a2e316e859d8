//! Permission checking for folders and hosts.
//!
//! Write access is granted by the `wato.all_folders` super-permission or by
//! membership in one of the folder's permitted contact groups. Read access
//! works the same with `wato.see_all_folders`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::*;

/// Global permissions relevant to the setup core.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Create, delete and move folders.
    ManageFolders,
    /// Create, delete and move hosts.
    ManageHosts,
    /// Modify host attributes.
    EditHosts,
    /// Rename hosts.
    RenameHosts,
    /// Write access to all folders and hosts, regardless of contact groups.
    AllFolders,
    /// Read access to all folders and hosts, regardless of contact groups.
    SeeAllFolders,
}

impl Permission {
    /// All known permissions.
    pub const ALL: [Permission; 6] = [
        Permission::ManageFolders,
        Permission::ManageHosts,
        Permission::EditHosts,
        Permission::RenameHosts,
        Permission::AllFolders,
        Permission::SeeAllFolders,
    ];

    /// Returns the permission identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ManageFolders => "wato.manage_folders",
            Permission::ManageHosts => "wato.manage_hosts",
            Permission::EditHosts => "wato.edit_hosts",
            Permission::RenameHosts => "wato.rename_hosts",
            Permission::AllFolders => "wato.all_folders",
            Permission::SeeAllFolders => "wato.see_all_folders",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The acting user of a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext {
    /// User id, recorded in the change log.
    pub id: String,
    /// Contact groups the user is a member of.
    pub contact_groups: BTreeSet<String>,
    /// Granted global permissions.
    pub permissions: BTreeSet<Permission>,
}

impl UserContext {
    /// Creates a user without groups or permissions.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            contact_groups: BTreeSet::new(),
            permissions: BTreeSet::new(),
        }
    }

    /// Creates a user holding every permission.
    pub fn admin(id: impl Into<String>) -> Self {
        Self::new(id).with_permissions(&Permission::ALL)
    }

    /// Adds contact groups.
    pub fn with_groups<S: AsRef<str>>(mut self, groups: &[S]) -> Self {
        self.contact_groups
            .extend(groups.iter().map(|g| g.as_ref().to_string()));
        self
    }

    /// Adds permissions.
    pub fn with_permissions(mut self, permissions: &[Permission]) -> Self {
        self.permissions.extend(permissions.iter().copied());
        self
    }

    /// Checks a global permission.
    pub fn may(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Fails unless the user holds the permission.
    pub fn need(&self, permission: Permission) -> Result<()> {
        if self.may(permission) {
            return Ok(());
        }
        Err(WatoError::PermissionDenied {
            reason: format!(
                "user '{}' lacks the permission '{}'",
                self.id, permission
            ),
        })
    }
}

/// Kind of access requested on a folder or host.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessOp {
    /// View the object.
    Read,
    /// Modify the object.
    Write,
}

impl AccessOp {
    fn super_permission(self) -> Permission {
        match self {
            AccessOp::Read => Permission::SeeAllFolders,
            AccessOp::Write => Permission::AllFolders,
        }
    }
}

/// Value of the `contactgroups` attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactGroupConfig {
    /// Groups assigned at this level.
    pub groups: Vec<String>,
    /// Subfolders inherit the permitted groups.
    pub recurse_perms: bool,
    /// The groups are also used as contact groups of the hosts.
    #[serde(rename = "use")]
    pub use_for_hosts: bool,
    /// The groups are also used as contact groups of the services.
    pub use_for_services: bool,
    /// Subfolders inherit the host contact groups.
    pub recurse_use: bool,
}

impl ContactGroupConfig {
    /// Parses the attribute value; missing or malformed values count as empty.
    pub fn from_attribute(value: Option<&serde_json::Value>) -> Self {
        value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Groups computed for a folder or host from its ancestor chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermittedGroups {
    /// Contact groups granting access.
    pub permitted: BTreeSet<String>,
    /// Contact groups assigned to hosts.
    pub host_contact_groups: BTreeSet<String>,
    /// Whether the groups are also used for services.
    pub use_for_services: bool,
}

/// Capability object answering access questions for one folder or host.
#[derive(Clone, Debug)]
pub struct PermissionCheck<'a> {
    subject: String,
    groups: PermittedGroups,
    user: &'a UserContext,
}

impl<'a> PermissionCheck<'a> {
    /// Creates the check for `subject` (a folder title path or host name).
    pub fn new(subject: impl Into<String>, groups: PermittedGroups, user: &'a UserContext) -> Self {
        Self {
            subject: subject.into(),
            groups,
            user,
        }
    }

    /// The groups this decision is based on.
    pub fn groups(&self) -> &PermittedGroups {
        &self.groups
    }

    /// Returns true if the user may perform `op`.
    pub fn may(&self, op: AccessOp) -> bool {
        self.reason_why_may_not(op).is_none()
    }

    /// Explains why the user may not perform `op`, or None if allowed.
    pub fn reason_why_may_not(&self, op: AccessOp) -> Option<String> {
        if self.user.may(op.super_permission()) {
            return None;
        }
        if self
            .user
            .contact_groups
            .iter()
            .any(|g| self.groups.permitted.contains(g))
        {
            return None;
        }

        let mut reason = format!("Sorry, you have no permissions to {}.", self.subject);
        if self.groups.permitted.is_empty() {
            reason.push_str(" It is not permitted for any contact group.");
        } else {
            reason.push_str(&format!(
                " Its permitted contact groups are {}.",
                join(&self.groups.permitted)
            ));
            if self.user.contact_groups.is_empty() {
                reason.push_str(" But you are not a member of any contact group.");
            } else {
                reason.push_str(&format!(
                    " Your contact groups are {}.",
                    join(&self.user.contact_groups)
                ));
            }
        }
        reason.push_str(&format!(
            " You may enlarge access by becoming a member of a permitted contact group or by holding '{}'.",
            op.super_permission()
        ));
        Some(reason)
    }

    /// Fails with a permission error carrying the reason if `op` is not allowed.
    pub fn need_permission(&self, op: AccessOp) -> Result<()> {
        match self.reason_why_may_not(op) {
            None => Ok(()),
            Some(reason) => {
                tracing::debug!(user = %self.user.id, subject = %self.subject, "access denied");
                Err(WatoError::PermissionDenied { reason })
            }
        }
    }
}

fn join(groups: &BTreeSet<String>) -> String {
    groups.iter().cloned().collect::<Vec<_>>().join(", ")
}

/// Users without `wato.all_folders` may only assign contact groups they are
/// themselves a member of.
pub fn validate_contact_group_modification(
    user: &UserContext,
    old: Option<&serde_json::Value>,
    new: Option<&serde_json::Value>,
) -> Result<()> {
    if user.may(Permission::AllFolders) {
        return Ok(());
    }
    let old_groups: BTreeSet<String> = ContactGroupConfig::from_attribute(old)
        .groups
        .into_iter()
        .collect();
    let added: Vec<String> = ContactGroupConfig::from_attribute(new)
        .groups
        .into_iter()
        .filter(|g| !old_groups.contains(g) && !user.contact_groups.contains(g))
        .collect();
    if added.is_empty() {
        return Ok(());
    }
    Err(WatoError::PermissionDenied {
        reason: format!(
            "You cannot assign the contact groups {} because you are not a member of them.",
            added.join(", ")
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn groups(permitted: &[&str]) -> PermittedGroups {
        PermittedGroups {
            permitted: permitted.iter().map(|s| s.to_string()).collect(),
            ..PermittedGroups::default()
        }
    }

    #[test]
    fn test_super_permission_grants_write() {
        let user = UserContext::new("admin").with_permissions(&[Permission::AllFolders]);
        let check = PermissionCheck::new("folder Main", groups(&[]), &user);
        assert!(check.may(AccessOp::Write));
        assert!(!check.may(AccessOp::Read));
    }

    #[test]
    fn test_group_membership_grants_access() {
        let user = UserContext::new("bob").with_groups(&["linux"]);
        let check = PermissionCheck::new("folder Linux", groups(&["linux", "db"]), &user);
        assert!(check.may(AccessOp::Write));
        assert!(check.need_permission(AccessOp::Read).is_ok());
    }

    #[test]
    fn test_reason_lists_permitted_groups() {
        let user = UserContext::new("bob").with_groups(&["windows"]);
        let check = PermissionCheck::new("folder Linux", groups(&["db", "linux"]), &user);
        let reason = check.reason_why_may_not(AccessOp::Write).unwrap();
        assert!(reason.contains("db, linux"));
        assert!(reason.contains("windows"));

        match check.need_permission(AccessOp::Write) {
            Err(WatoError::PermissionDenied { reason }) => assert!(reason.contains("linux")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_no_groups_requires_override() {
        let user = UserContext::new("bob");
        let check = PermissionCheck::new("folder Main", groups(&[]), &user);
        let reason = check.reason_why_may_not(AccessOp::Write).unwrap();
        assert!(reason.contains("not permitted for any contact group"));
        assert!(reason.contains("wato.all_folders"));
    }

    #[test]
    fn test_contact_group_config_parse() {
        let value = json!({"groups": ["a"], "recurse_perms": true, "use": true});
        let conf = ContactGroupConfig::from_attribute(Some(&value));
        assert_eq!(conf.groups, vec!["a"]);
        assert!(conf.recurse_perms);
        assert!(conf.use_for_hosts);
        assert!(!conf.recurse_use);

        let conf = ContactGroupConfig::from_attribute(Some(&json!("garbage")));
        assert_eq!(conf, ContactGroupConfig::default());
    }

    #[test]
    fn test_contact_group_modification() {
        let user = UserContext::new("bob").with_groups(&["linux"]);
        let old = json!({"groups": ["db"]});
        assert!(validate_contact_group_modification(
            &user,
            Some(&old),
            Some(&json!({"groups": ["db", "linux"]}))
        )
        .is_ok());
        assert!(validate_contact_group_modification(
            &user,
            Some(&old),
            Some(&json!({"groups": ["windows"]}))
        )
        .is_err());

        let admin = UserContext::admin("admin");
        assert!(validate_contact_group_modification(
            &admin,
            None,
            Some(&json!({"groups": ["windows"]}))
        )
        .is_ok());
    }
}
