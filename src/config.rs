use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::FixedOffset;
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "attendance.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub store: StoreKind,
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// Campus clock as minutes east of UTC. Lecture dates and session times use it.
    pub utc_offset_minutes: i32,
    pub identity: IdentityConfig,
}

/// Settings for the hosted identity provider and the session cookie issued after sign-in.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub client_id: String,
    pub api_key: String,
    pub redirect_uri: String,
    pub api_base: String,
    pub cookie_name: String,
    pub session_ttl_hours: i64,
    pub secure_cookies: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            store: StoreKind::Memory,
            database_url: None,
            max_connections: 10,
            utc_offset_minutes: 0,
            identity: IdentityConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            api_key: String::new(),
            redirect_uri: "http://127.0.0.1:3000/auth/callback".to_string(),
            api_base: "https://api.workos.com".to_string(),
            cookie_name: "wos_session".to_string(),
            session_ttl_hours: 48,
            secure_cookies: false,
        }
    }
}

impl Config {
    /// Reads `$ATTENDANCE_CONFIG` (or `attendance.toml` when present), then applies
    /// environment overrides.
    pub fn load() -> anyhow::Result<Config> {
        let path = match env::var("ATTENDANCE_CONFIG") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Some(PathBuf::from(DEFAULT_CONFIG_FILE))
            }
            Err(_) => None,
        };

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                log::info!("Loaded configuration from {}", path.display());
                Config::from_toml(&raw)?
            }
            None => Config::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Config> {
        toml::from_str(raw).context("parsing configuration")
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("BIND_ADDR") {
            self.bind_addr = addr
                .parse()
                .with_context(|| format!("BIND_ADDR `{}` is not a socket address", addr))?;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
            self.store = StoreKind::Postgres;
        }
        if let Some(store) = lookup("STORE") {
            self.store = match store.as_str() {
                "memory" => StoreKind::Memory,
                "postgres" => StoreKind::Postgres,
                other => bail!("STORE must be `memory` or `postgres`, got `{}`", other),
            };
        }
        if let Some(max) = lookup("MAX_CONNECTIONS") {
            self.max_connections = max.parse().context("MAX_CONNECTIONS")?;
        }
        if let Some(offset) = lookup("UTC_OFFSET_MINUTES") {
            self.utc_offset_minutes = offset.parse().context("UTC_OFFSET_MINUTES")?;
        }

        let identity = &mut self.identity;
        if let Some(value) = lookup("WORKOS_CLIENT_ID") {
            identity.client_id = value;
        }
        if let Some(value) = lookup("WORKOS_API_KEY") {
            identity.api_key = value;
        }
        if let Some(value) = lookup("WORKOS_REDIRECT_URI") {
            identity.redirect_uri = value;
        }
        if let Some(value) = lookup("WORKOS_API_BASE") {
            identity.api_base = value;
        }
        if let Some(value) = lookup("COOKIE_NAME") {
            identity.cookie_name = value;
        }
        if let Some(value) = lookup("SESSION_TTL_HOURS") {
            identity.session_ttl_hours = value.parse().context("SESSION_TTL_HOURS")?;
        }
        if let Some(value) = lookup("SECURE_COOKIES") {
            identity.secure_cookies = value.parse().context("SECURE_COOKIES")?;
        }
        Ok(())
    }

    pub fn campus_offset(&self) -> anyhow::Result<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .with_context(|| {
                format!(
                    "utc_offset_minutes `{}` is outside -1439..=1439",
                    self.utc_offset_minutes
                )
            })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.campus_offset()?;
        if self.store == StoreKind::Postgres && self.database_url.is_none() {
            bail!("the postgres store needs DATABASE_URL");
        }
        if self.identity.session_ttl_hours < 1 {
            bail!("session_ttl_hours must be at least 1");
        }
        if self.identity.cookie_name.is_empty() {
            bail!("cookie_name must not be empty");
        }
        if self.identity.client_id.is_empty() {
            log::warn!("WORKOS_CLIENT_ID is not set; sign-in will not work");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_use_memory_store() {
        let config = Config::default();
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.identity.cookie_name, "wos_session");
        config.validate().unwrap();
    }

    #[test]
    fn toml_fills_missing_fields_with_defaults() {
        let config = Config::from_toml(
            r#"
            bind_addr = "0.0.0.0:8080"
            store = "postgres"
            database_url = "postgres://localhost/attendance"

            [identity]
            client_id = "client_123"
            session_ttl_hours = 12
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.store, StoreKind::Postgres);
        assert_eq!(config.identity.client_id, "client_123");
        assert_eq!(config.identity.session_ttl_hours, 12);
        assert_eq!(config.identity.api_base, "https://api.workos.com");
        assert_eq!(config.max_connections, 10);
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://db/attendance"),
            ("WORKOS_CLIENT_ID", "client_env"),
            ("COOKIE_NAME", "att_session"),
        ]);
        let mut config = Config::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.store, StoreKind::Postgres);
        assert_eq!(config.identity.client_id, "client_env");
        assert_eq!(config.identity.cookie_name, "att_session");
        config.validate().unwrap();
    }

    #[test]
    fn postgres_without_url_is_rejected() {
        let mut config = Config::default();
        config.apply_env(|key| (key == "STORE").then(|| "postgres".to_string())).unwrap();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        assert!(config
            .apply_env(|key| (key == "STORE").then(|| "sqlite".to_string()))
            .is_err());
    }

    #[test]
    fn campus_offset_is_bounded() {
        let mut config = Config::default();
        assert_eq!(config.campus_offset().unwrap().local_minus_utc(), 0);

        config
            .apply_env(|key| (key == "UTC_OFFSET_MINUTES").then(|| "330".to_string()))
            .unwrap();
        assert_eq!(config.campus_offset().unwrap().local_minus_utc(), 330 * 60);
        config.validate().unwrap();

        config.utc_offset_minutes = -24 * 60;
        assert!(config.validate().is_err());
    }
}
