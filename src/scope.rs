//! Multi-tenant scoping primitives.
//!
//! Every stored artifact (document, chunk, entity link, progress event)
//! carries a [`ScopeKey`] naming the tenant it belongs to and how narrowly
//! it is shared. Reads never take raw header values: handlers build a
//! [`Visibility`] once per request and every store operation filters
//! through it, so a query that skips scope filtering does not typecheck.

use serde::{Deserialize, Serialize};

/// How narrowly an artifact is shared within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Visible to everyone in the tenant.
    Tenant,
    /// Visible within a single workspace.
    Workspace,
    /// Visible to a single principal within a workspace.
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Tenant => "tenant",
            Scope::Workspace => "workspace",
            Scope::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Scope> {
        match s {
            "tenant" => Some(Scope::Tenant),
            "workspace" => Some(Scope::Workspace),
            "user" => Some(Scope::User),
            _ => None,
        }
    }
}

/// The ownership tuple attached to every stored artifact.
///
/// Invariants are enforced by construction: `workspace_id` is present iff
/// the scope is `workspace` or `user`, `principal_id` iff the scope is
/// `user`. Serializes flat (`tenant_id`, `scope`, `workspace_id`,
/// `principal_id`) so wire shapes can `#[serde(flatten)]` it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeKey {
    pub tenant_id: String,
    pub scope: Scope,
    pub workspace_id: Option<String>,
    pub principal_id: Option<String>,
}

impl ScopeKey {
    pub fn tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            scope: Scope::Tenant,
            workspace_id: None,
            principal_id: None,
        }
    }

    pub fn workspace(tenant_id: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            scope: Scope::Workspace,
            workspace_id: Some(workspace_id.into()),
            principal_id: None,
        }
    }

    pub fn user(
        tenant_id: impl Into<String>,
        workspace_id: impl Into<String>,
        principal_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            scope: Scope::User,
            workspace_id: Some(workspace_id.into()),
            principal_id: Some(principal_id.into()),
        }
    }
}

/// The set of scope keys a caller may observe.
///
/// Derived from the bearer-resolved tenant plus the optional
/// `X-Workspace-Id` / `X-Principal-Id` headers. Tenant-scope artifacts are
/// always visible; workspace-scope only when the caller named that
/// workspace; user-scope only when the caller named both workspace and
/// principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visibility {
    pub tenant_id: String,
    pub workspace_id: Option<String>,
    pub principal_id: Option<String>,
}

impl Visibility {
    /// A principal without a workspace grants nothing extra, so it is
    /// dropped here rather than checked at every call site.
    pub fn new(
        tenant_id: impl Into<String>,
        workspace_id: Option<String>,
        principal_id: Option<String>,
    ) -> Self {
        let workspace_id = workspace_id.filter(|w| !w.is_empty());
        let principal_id = if workspace_id.is_some() {
            principal_id.filter(|p| !p.is_empty())
        } else {
            None
        };
        Self {
            tenant_id: tenant_id.into(),
            workspace_id,
            principal_id,
        }
    }

    pub fn allows(&self, key: &ScopeKey) -> bool {
        if key.tenant_id != self.tenant_id {
            return false;
        }
        match key.scope {
            Scope::Tenant => true,
            Scope::Workspace => match (&self.workspace_id, &key.workspace_id) {
                (Some(mine), Some(theirs)) => mine == theirs,
                _ => false,
            },
            Scope::User => {
                matches!(
                    (&self.workspace_id, &key.workspace_id),
                    (Some(mine), Some(theirs)) if mine == theirs
                ) && matches!(
                    (&self.principal_id, &key.principal_id),
                    (Some(mine), Some(theirs)) if mine == theirs
                )
            }
        }
    }
}
