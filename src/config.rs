use std::path::PathBuf;

use chrono::Duration;

use crate::models::Credentials;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid { name: &'static str, expected: &'static str, value: String },
    #[error("BOOTSTRAP_ADMIN_USERNAME and BOOTSTRAP_ADMIN_PASSWORD must be set together")]
    PartialAdminSeed,
}

/// Out-of-band admin account created at startup when missing.
#[derive(Clone)]
pub struct AdminSeed {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AdminSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSeed").field("username", &self.username).finish_non_exhaustive()
    }
}

impl From<AdminSeed> for Credentials {
    fn from(seed: AdminSeed) -> Self {
        Credentials { username: seed.username, password: seed.password }
    }
}

/// Runtime settings, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: String,
    /// Snapshot directory for the in-memory store; `None` keeps state in memory only.
    pub data_dir: Option<PathBuf>,
    pub image_dir: PathBuf,
    pub session_ttl: Duration,
    pub frontend_url: Option<String>,
    pub enable_hsts: bool,
    pub database_url: Option<String>,
    pub bootstrap_admin: Option<AdminSeed>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".into(),
            data_dir: None,
            image_dir: PathBuf::from("data/images"),
            session_ttl: Duration::hours(24),
            frontend_url: None,
            enable_hsts: false,
            database_url: None,
            bootstrap_admin: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let session_ttl = match get("SESSION_TTL_HOURS") {
            None => defaults.session_ttl,
            Some(v) => match v.parse::<i64>() {
                Ok(h) if h > 0 && h <= 24 * 365 => Duration::hours(h),
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "SESSION_TTL_HOURS",
                        expected: "a whole number of hours between 1 and 8760",
                        value: v,
                    })
                }
            },
        };

        let enable_hsts = match get("ENABLE_HSTS") {
            None => false,
            Some(v) => parse_flag(&v).ok_or(ConfigError::Invalid {
                name: "ENABLE_HSTS",
                expected: "a boolean (1/0/true/false)",
                value: v,
            })?,
        };

        let bootstrap_admin = match (get("BOOTSTRAP_ADMIN_USERNAME"), lookup("BOOTSTRAP_ADMIN_PASSWORD")) {
            (Some(username), Some(password)) if !password.is_empty() => Some(AdminSeed { username, password }),
            (None, None) => None,
            (None, Some(p)) if p.is_empty() => None,
            _ => return Err(ConfigError::PartialAdminSeed),
        };

        Ok(Self {
            bind: get("NEWSROOM_BIND").unwrap_or(defaults.bind),
            data_dir: get("NEWSROOM_DATA_DIR").map(PathBuf::from),
            image_dir: get("NEWSROOM_IMAGE_DIR").map(PathBuf::from).unwrap_or(defaults.image_dir),
            session_ttl,
            frontend_url: get("FRONTEND_URL"),
            enable_hsts,
            database_url: get("DATABASE_URL"),
            bootstrap_admin,
        })
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_nothing_set() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:8080");
        assert_eq!(cfg.session_ttl, Duration::hours(24));
        assert!(cfg.data_dir.is_none());
        assert!(cfg.bootstrap_admin.is_none());
        assert!(!cfg.enable_hsts);
    }

    #[test]
    fn reads_overrides() {
        let cfg = load(&[
            ("NEWSROOM_BIND", "127.0.0.1:9000"),
            ("NEWSROOM_DATA_DIR", "/tmp/news"),
            ("SESSION_TTL_HOURS", "2"),
            ("ENABLE_HSTS", "true"),
            ("BOOTSTRAP_ADMIN_USERNAME", "root"),
            ("BOOTSTRAP_ADMIN_PASSWORD", "s3cret"),
        ])
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.data_dir, Some(PathBuf::from("/tmp/news")));
        assert_eq!(cfg.session_ttl, Duration::hours(2));
        assert!(cfg.enable_hsts);
        assert_eq!(cfg.bootstrap_admin.unwrap().username, "root");
    }

    #[test]
    fn rejects_bad_ttl_and_flags() {
        assert!(matches!(load(&[("SESSION_TTL_HOURS", "0")]), Err(ConfigError::Invalid { .. })));
        assert!(matches!(load(&[("SESSION_TTL_HOURS", "soon")]), Err(ConfigError::Invalid { .. })));
        assert!(matches!(load(&[("ENABLE_HSTS", "maybe")]), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn admin_seed_needs_both_halves() {
        assert_eq!(load(&[("BOOTSTRAP_ADMIN_USERNAME", "root")]).unwrap_err(), ConfigError::PartialAdminSeed);
        assert_eq!(load(&[("BOOTSTRAP_ADMIN_PASSWORD", "pw")]).unwrap_err(), ConfigError::PartialAdminSeed);
    }

    #[test]
    fn seed_debug_hides_password() {
        let seed = AdminSeed { username: "root".into(), password: "hunter2".into() };
        assert!(!format!("{seed:?}").contains("hunter2"));
    }
}
