use std::env;
use std::path::PathBuf;

use overtex_collab::auth::{Permission, StaticAuth};
use overtex_collab::server::ServerConfig;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    /// Directory holding one subdirectory per project (default: ./projects)
    pub projects_root: PathBuf,
    /// `token=uid:email` pairs
    pub tokens: Vec<(String, String, String)>,
    /// `uid@project=permission` pairs
    pub grants: Vec<(String, String, Permission)>,
    /// `sid@project=permission` pairs
    pub share_links: Vec<(String, String, Permission)>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ServerConfig::default();

        let server = ServerConfig {
            bind_addr: lookup("OVERTEX_BIND").unwrap_or(defaults.bind_addr),
            max_peers_per_room: parse_or(&lookup, "OVERTEX_MAX_PEERS", defaults.max_peers_per_room)?,
            broadcast_capacity: defaults.broadcast_capacity,
            heartbeat_interval_secs: parse_or(
                &lookup,
                "OVERTEX_HEARTBEAT_SECS",
                defaults.heartbeat_interval_secs,
            )?,
            handshake_timeout_ms: parse_or(
                &lookup,
                "OVERTEX_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout_ms,
            )?,
            storage_path: lookup("OVERTEX_STORAGE_PATH")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        };

        let projects_root = PathBuf::from(
            lookup("OVERTEX_PROJECTS_ROOT").unwrap_or_else(|| "./projects".to_string()),
        );

        let tokens = entries(&lookup, "OVERTEX_TOKENS")
            .into_iter()
            .map(|(token, value)| {
                let (uid, email) = value
                    .split_once(':')
                    .ok_or_else(|| ConfigError::InvalidEntry("OVERTEX_TOKENS", value.clone()))?;
                Ok((token, uid.to_string(), email.to_string()))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let grants = scoped(&lookup, "OVERTEX_GRANTS")?;
        let share_links = scoped(&lookup, "OVERTEX_SHARE_LINKS")?;

        Ok(Config { server, projects_root, tokens, grants, share_links })
    }

    /// Build the table-driven auth collaborator.
    pub fn auth(&self) -> StaticAuth {
        let mut auth = StaticAuth::new(&self.projects_root);
        for (token, uid, email) in &self.tokens {
            auth = auth.with_token(token, uid, email);
        }
        for (uid, project, permission) in &self.grants {
            auth = auth.with_grant(uid, project, *permission);
        }
        for (sid, project, permission) in &self.share_links {
            auth = auth.with_share_link(sid, project, *permission);
        }
        auth
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber(key, raw)),
        None => Ok(default),
    }
}

/// `key=value;key=value`, blank items skipped.
fn entries<F>(lookup: &F, key: &str) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_default();
    raw.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (item.to_string(), String::new()),
        })
        .collect()
}

/// `subject@project=permission` entries.
fn scoped<F>(lookup: &F, key: &'static str) -> Result<Vec<(String, String, Permission)>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    entries(lookup, key)
        .into_iter()
        .map(|(scope, value)| {
            let (subject, project) = scope
                .split_once('@')
                .ok_or_else(|| ConfigError::InvalidEntry(key, scope.clone()))?;
            let permission =
                Permission::parse(&value).ok_or_else(|| ConfigError::InvalidEntry(key, value.clone()))?;
            Ok((subject.to_string(), project.to_string(), permission))
        })
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    InvalidNumber(&'static str, String),
    InvalidEntry(&'static str, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidNumber(key, raw) => {
                write!(f, "Invalid {key} environment variable: {raw:?}")
            }
            ConfigError::InvalidEntry(key, raw) => write!(f, "Invalid entry in {key}: {raw:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use overtex_collab::auth::{PermissionResolver, TokenVerifier};
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.server.max_peers_per_room, 100);
        assert!(config.server.storage_path.is_none());
        assert_eq!(config.projects_root, PathBuf::from("./projects"));
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("OVERTEX_BIND", "0.0.0.0:8080"),
            ("OVERTEX_MAX_PEERS", "8"),
            ("OVERTEX_HEARTBEAT_SECS", "10"),
            ("OVERTEX_HANDSHAKE_TIMEOUT_MS", "250"),
            ("OVERTEX_STORAGE_PATH", "/var/lib/overtex"),
        ]))
        .unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.server.max_peers_per_room, 8);
        assert_eq!(config.server.heartbeat_interval_secs, 10);
        assert_eq!(config.server.handshake_timeout_ms, 250);
        assert_eq!(config.server.storage_path, Some(PathBuf::from("/var/lib/overtex")));
    }

    #[test]
    fn test_invalid_number_fails() {
        let err = Config::from_lookup(lookup(&[("OVERTEX_MAX_PEERS", "many")])).unwrap_err();
        assert_eq!(err, ConfigError::InvalidNumber("OVERTEX_MAX_PEERS", "many".to_string()));
    }

    #[test]
    fn test_auth_tables() {
        let config = Config::from_lookup(lookup(&[
            ("OVERTEX_PROJECTS_ROOT", "/srv/projects"),
            ("OVERTEX_TOKENS", "tok-ada=u1:ada@example.com; tok-bo=u2:bo@example.com;"),
            ("OVERTEX_GRANTS", "u1@P1=owner;u2@P1=view"),
            ("OVERTEX_SHARE_LINKS", "abc@P1=edit"),
        ]))
        .unwrap();
        assert_eq!(config.tokens.len(), 2);

        let auth = config.auth();
        let ada = auth.verify("tok-ada").unwrap();
        assert_eq!(ada.email, "ada@example.com");
        let grant = auth.resolve_permission(Some(&ada), "P1", None);
        assert_eq!(grant.permission, Permission::Owner);
        assert_eq!(grant.project_path, PathBuf::from("/srv/projects/P1"));

        let bo = auth.verify("tok-bo").unwrap();
        assert_eq!(auth.resolve_permission(Some(&bo), "P1", None).permission, Permission::View);
        assert_eq!(auth.resolve_permission(Some(&bo), "P1", Some("abc")).permission, Permission::Edit);
    }

    #[test]
    fn test_malformed_entries() {
        let err = Config::from_lookup(lookup(&[("OVERTEX_TOKENS", "tok-ada")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEntry("OVERTEX_TOKENS", _)));

        let err = Config::from_lookup(lookup(&[("OVERTEX_GRANTS", "u1@P1=admin")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEntry("OVERTEX_GRANTS", _)));

        let err = Config::from_lookup(lookup(&[("OVERTEX_SHARE_LINKS", "abc=edit")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEntry("OVERTEX_SHARE_LINKS", _)));
    }
}
