//! Request-scoped context threaded through every mutating operation.

use std::sync::Arc;

use crate::access::{Permission, UserContext};
use crate::changes::{ChangeKind, ChangeLog};
use crate::types::ObjectRef;
use std::collections::BTreeSet;

/// Acting user plus the change log receiving the request's changes.
#[derive(Clone)]
pub struct RequestContext {
    pub user: UserContext,
    pub changes: Arc<ChangeLog>,
}

impl RequestContext {
    pub fn new(user: UserContext, changes: Arc<ChangeLog>) -> Self {
        Self { user, changes }
    }

    /// A context for an administrator with a private change log. Used by
    /// tooling and tests.
    pub fn admin() -> Self {
        Self::new(UserContext::admin("automation"), Arc::new(ChangeLog::new()))
    }

    pub fn need(&self, permission: Permission) -> crate::types::Result<()> {
        self.user.need(permission)
    }

    pub(crate) fn record(
        &self,
        kind: ChangeKind,
        object: ObjectRef,
        text: impl Into<String>,
        diff_text: Option<String>,
        sites: BTreeSet<String>,
    ) -> u64 {
        self.changes
            .record(&self.user.id, kind, object, text, diff_text, sites)
    }
}
