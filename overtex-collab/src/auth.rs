//! Upgrade-time authentication and authorization.
//!
//! Every connection names a project and carries a bearer token, a share
//! token, or both. The gate runs before the WebSocket handshake completes,
//! so a refused request never creates document state:
//!
//! ```text
//! GET /?projectId=P1&token=…&activeFile=main.tex
//!         │
//!         ├─ Credentials::from_parts     missing projectId       → 400
//!         ├─ TokenVerifier::verify       bad or missing token    → 401
//!         ├─ PermissionResolver          no grant for project    → 403
//!         ▼
//!     Admission { identity, permission, project_path }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: String,
    pub email: String,
}

/// Access level on one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Owner,
    Edit,
    View,
    None,
}

impl Permission {
    /// Whether deltas from this connection may change shared state.
    pub fn can_edit(self) -> bool {
        matches!(self, Permission::Owner | Permission::Edit)
    }

    pub fn can_attach(self) -> bool {
        self != Permission::None
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(Permission::Owner),
            "edit" => Some(Permission::Edit),
            "view" => Some(Permission::View),
            "none" => Some(Permission::None),
            _ => None,
        }
    }
}

/// Result of resolving a user's access to a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub permission: Permission,
    /// On-disk root of the project, used for hydration
    pub project_path: PathBuf,
}

impl Grant {
    pub fn denied() -> Self {
        Self { permission: Permission::None, project_path: PathBuf::new() }
    }
}

/// Verifies bearer credentials.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Identity>;
}

/// Resolves what a user (or share-token holder) may do on a project.
pub trait PermissionResolver: Send + Sync {
    fn resolve_permission(
        &self,
        user: Option<&Identity>,
        project_id: &str,
        share_token: Option<&str>,
    ) -> Grant;
}

/// Parameters carried by an upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub project_id: String,
    pub token: Option<String>,
    pub share_token: Option<String>,
    /// Hint for initial presence; never gates attach
    pub active_file: Option<String>,
}

impl Credentials {
    /// Parse from the request query string and `Authorization` header.
    ///
    /// A `Bearer` header takes precedence over a `token` query parameter.
    pub fn from_parts(query: Option<&str>, authorization: Option<&str>) -> Result<Self, AuthRejection> {
        let mut creds = Credentials::default();

        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                let value = value.into_owned();
                if value.is_empty() {
                    continue;
                }
                match key.as_ref() {
                    "projectId" => creds.project_id = value,
                    "token" => creds.token = Some(value),
                    "sid" => creds.share_token = Some(value),
                    "activeFile" => creds.active_file = Some(value),
                    _ => {}
                }
            }
        }

        if let Some(token) = authorization.and_then(|h| h.strip_prefix("Bearer ")) {
            let token = token.trim();
            if !token.is_empty() {
                creds.token = Some(token.to_string());
            }
        }

        if creds.project_id.is_empty() {
            return Err(AuthRejection::MissingProject);
        }
        if creds.token.is_none() && creds.share_token.is_none() {
            return Err(AuthRejection::MissingCredential);
        }
        Ok(creds)
    }
}

/// Why an upgrade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingProject,
    MissingCredential,
    InvalidToken,
    Forbidden,
}

impl AuthRejection {
    /// HTTP status returned instead of `101 Switching Protocols`.
    pub fn status_code(self) -> u16 {
        match self {
            AuthRejection::MissingProject => 400,
            AuthRejection::MissingCredential | AuthRejection::InvalidToken => 401,
            AuthRejection::Forbidden => 403,
        }
    }
}

impl std::fmt::Display for AuthRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingProject => write!(f, "Missing projectId"),
            Self::MissingCredential => write!(f, "Missing token or share token"),
            Self::InvalidToken => write!(f, "Invalid token"),
            Self::Forbidden => write!(f, "Forbidden"),
        }
    }
}

impl std::error::Error for AuthRejection {}

/// An authorized connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub project_id: String,
    /// `None` for share-token access without a bearer token
    pub identity: Option<Identity>,
    pub permission: Permission,
    pub project_path: PathBuf,
    pub active_file: Option<String>,
}

/// Run both collaborators against parsed credentials.
pub fn authorize(
    creds: Credentials,
    verifier: &dyn TokenVerifier,
    resolver: &dyn PermissionResolver,
) -> Result<Admission, AuthRejection> {
    let identity = match &creds.token {
        Some(token) => Some(verifier.verify(token).ok_or(AuthRejection::InvalidToken)?),
        None => None,
    };

    let grant = resolver.resolve_permission(
        identity.as_ref(),
        &creds.project_id,
        creds.share_token.as_deref(),
    );
    if !grant.permission.can_attach() {
        return Err(AuthRejection::Forbidden);
    }

    Ok(Admission {
        project_id: creds.project_id,
        identity,
        permission: grant.permission,
        project_path: grant.project_path,
        active_file: creds.active_file,
    })
}

/// Project ids double as directory names under the projects root.
pub fn is_valid_project_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0'])
}

/// Table-driven collaborator implementing both traits.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    projects_root: PathBuf,
    tokens: HashMap<String, Identity>,
    /// (uid, project) → permission
    grants: HashMap<(String, String), Permission>,
    /// (share token, project) → permission
    share_links: HashMap<(String, String), Permission>,
}

impl StaticAuth {
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self { projects_root: projects_root.into(), ..Self::default() }
    }

    pub fn with_token(mut self, token: &str, uid: &str, email: &str) -> Self {
        self.tokens.insert(
            token.to_string(),
            Identity { uid: uid.to_string(), email: email.to_string() },
        );
        self
    }

    pub fn with_grant(mut self, uid: &str, project_id: &str, permission: Permission) -> Self {
        self.grants.insert((uid.to_string(), project_id.to_string()), permission);
        self
    }

    pub fn with_share_link(mut self, sid: &str, project_id: &str, permission: Permission) -> Self {
        // Share links never confer ownership
        let permission = if permission == Permission::Owner { Permission::Edit } else { permission };
        self.share_links.insert((sid.to_string(), project_id.to_string()), permission);
        self
    }

    pub fn projects_root(&self) -> &Path {
        &self.projects_root
    }
}

impl TokenVerifier for StaticAuth {
    fn verify(&self, token: &str) -> Option<Identity> {
        self.tokens.get(token).cloned()
    }
}

impl PermissionResolver for StaticAuth {
    fn resolve_permission(
        &self,
        user: Option<&Identity>,
        project_id: &str,
        share_token: Option<&str>,
    ) -> Grant {
        if !is_valid_project_id(project_id) {
            return Grant::denied();
        }

        let by_user = user
            .and_then(|u| self.grants.get(&(u.uid.clone(), project_id.to_string())))
            .copied()
            .unwrap_or(Permission::None);
        let by_link = share_token
            .and_then(|sid| self.share_links.get(&(sid.to_string(), project_id.to_string())))
            .copied()
            .unwrap_or(Permission::None);

        let permission = [Permission::Owner, Permission::Edit, Permission::View]
            .into_iter()
            .find(|p| by_user == *p || by_link == *p)
            .unwrap_or(Permission::None);

        Grant { permission, project_path: self.projects_root.join(project_id) }
    }
}
