use config::{Config, ConfigError, Environment as ConfigEnvironment, File};
use secrecy::{ExposeSecret, Secret};
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(serde::Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub telegram: TelegramSettings,
}

#[derive(serde::Deserialize, Clone)]
pub struct ApplicationSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    /// Bearer token required for bot writes. Without it every bot write is
    /// rejected.
    #[serde(default)]
    pub write_token: Option<Secret<String>>,
    /// HMAC secret for capability tokens. Without it self-service writes are
    /// authorized by their headers alone.
    #[serde(default)]
    pub capability_secret: Option<Secret<String>>,
    #[serde(
        default = "default_finalize_ttl",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub finalize_capability_ttl_secs: i64,
    #[serde(
        default = "default_linked_ttl",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub linked_capability_ttl_secs: i64,
}

impl ApplicationSettings {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn write_token(&self) -> Option<&str> {
        configured(&self.write_token)
    }

    pub fn capability_secret(&self) -> Option<&str> {
        configured(&self.capability_secret)
    }
}

#[derive(serde::Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(serde::Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub store: StoreKind,
    /// Full connection string; wins over the individual fields.
    #[serde(default)]
    pub url: Option<Secret<String>>,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: Secret<String>,
    #[serde(
        default = "default_port",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub port: u16,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub database_name: String,
    #[serde(default = "default_true")]
    pub require_ssl: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            url: None,
            username: String::new(),
            password: Secret::new(String::new()),
            port: 5432,
            host: String::new(),
            database_name: String::new(),
            require_ssl: true,
        }
    }
}

impl DatabaseSettings {
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        if let Some(url) = configured(&self.url) {
            return PgConnectOptions::from_str(url);
        }
        let ssl_mode = if self.require_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(ssl_mode)
            .database(&self.database_name))
    }
}

#[derive(serde::Deserialize, Clone)]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_token: Option<Secret<String>>,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

impl Default for TelegramSettings {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_base: default_telegram_api(),
        }
    }
}

impl TelegramSettings {
    pub fn bot_token(&self) -> Option<&str> {
        configured(&self.bot_token)
    }
}

fn configured(secret: &Option<Secret<String>>) -> Option<&str> {
    secret
        .as_ref()
        .map(|secret| secret.expose_secret().as_str())
        .filter(|value| !value.trim().is_empty())
}

fn default_password() -> Secret<String> {
    Secret::new(String::new())
}

fn default_port() -> u16 {
    5432
}

fn default_true() -> bool {
    true
}

fn default_finalize_ttl() -> i64 {
    15 * 60
}

fn default_linked_ttl() -> i64 {
    30 * 24 * 60 * 60
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

pub fn get_configuration() -> Result<Settings, ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| ConfigError::Message(format!("failed to determine current directory: {e}")))?
        .join("configuration");

    let environment: AppEnvironment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Message)?;

    let mut settings = load_from(&base_path, &environment)?;
    apply_legacy_env(&mut settings, |key| std::env::var(key).ok());

    info!(
        environment = environment.as_str(),
        address = %settings.application.address(),
        store = ?settings.database.store,
        "configuration loaded"
    );
    Ok(settings)
}

/// Layers `base.yaml`, `<environment>.yaml` and `APP_*` variables.
pub fn load_from(base_path: &Path, environment: &AppEnvironment) -> Result<Settings, ConfigError> {
    let environment_filename = format!("{}.yaml", environment.as_str());

    Config::builder()
        .add_source(File::from(base_path.join("base.yaml")))
        .add_source(File::from(base_path.join(environment_filename)).required(false))
        .add_source(
            ConfigEnvironment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?
        .try_deserialize::<Settings>()
}

/// Honours the unprefixed variable names older deployments set: `PORT`,
/// `STATE_WRITE_TOKEN`, `DATABASE_URL`, `TELEGRAM_BOT_TOKEN` and
/// `LINK_CAPABILITY_SECRET`.
pub fn apply_legacy_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    if let Some(port) = var("PORT") {
        match port.trim().parse() {
            Ok(port) => settings.application.port = port,
            Err(_) => warn!(%port, "ignoring PORT that is not a port number"),
        }
    }
    if let Some(token) = var("STATE_WRITE_TOKEN") {
        settings.application.write_token = Some(Secret::new(token));
    }
    if let Some(secret) = var("LINK_CAPABILITY_SECRET") {
        settings.application.capability_secret = Some(Secret::new(secret));
    }
    if let Some(url) = var("DATABASE_URL") {
        settings.database.url = Some(Secret::new(url));
        settings.database.store = StoreKind::Postgres;
    }
    if let Some(token) = var("TELEGRAM_BOT_TOKEN") {
        settings.telegram.bot_token = Some(Secret::new(token));
    }
}

pub enum AppEnvironment {
    Local,
    Production,
}

impl AppEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppEnvironment::Local => "local",
            AppEnvironment::Production => "production",
        }
    }
}

impl TryFrom<String> for AppEnvironment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    fn write_config(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).expect("write config file");
    }

    #[test]
    fn environment_file_overrides_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_config(
            dir.path(),
            "base.yaml",
            "application:\n  port: 8000\n  host: 0.0.0.0\n",
        );
        write_config(
            dir.path(),
            "production.yaml",
            "application:\n  port: \"9000\"\ndatabase:\n  store: postgres\n",
        );

        let settings = load_from(dir.path(), &AppEnvironment::Production).expect("settings");
        assert_eq!(settings.application.port, 9000);
        assert_eq!(settings.application.host, "0.0.0.0");
        assert_eq!(settings.database.store, StoreKind::Postgres);
        assert_eq!(settings.application.finalize_capability_ttl_secs, 900);
        assert_eq!(settings.application.write_token(), None);
        assert_eq!(settings.telegram.api_base, "https://api.telegram.org");
    }

    #[test]
    fn legacy_variables_override_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_config(
            dir.path(),
            "base.yaml",
            "application:\n  port: 8000\n  host: 127.0.0.1\n  write_token: from-file\n",
        );
        let mut settings = load_from(dir.path(), &AppEnvironment::Local).expect("settings");

        let env: HashMap<&str, &str> = HashMap::from([
            ("PORT", "8123"),
            ("STATE_WRITE_TOKEN", "from-env"),
            ("DATABASE_URL", "postgres://link:pw@db/link_state"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("LINK_CAPABILITY_SECRET", ""),
        ]);
        apply_legacy_env(&mut settings, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.application.port, 8123);
        assert_eq!(settings.application.write_token(), Some("from-env"));
        assert_eq!(settings.application.capability_secret(), None);
        assert_eq!(settings.database.store, StoreKind::Postgres);
        assert!(settings.database.connect_options().is_ok());
        assert_eq!(settings.telegram.bot_token(), Some("123:abc"));
    }

    #[test]
    fn bad_port_variable_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_config(
            dir.path(),
            "base.yaml",
            "application:\n  port: 8000\n  host: 127.0.0.1\n",
        );
        let mut settings = load_from(dir.path(), &AppEnvironment::Local).expect("settings");
        apply_legacy_env(&mut settings, |key| {
            (key == "PORT").then(|| "eighty".to_string())
        });
        assert_eq!(settings.application.port, 8000);
    }

    #[test]
    fn unknown_environment_is_rejected() {
        let env: Result<AppEnvironment, _> = "staging".to_string().try_into();
        assert!(env.is_err());
    }
}
