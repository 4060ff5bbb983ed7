//! Configuration of the `mailgen` binary.
//!
//! Settings come from JSON files: the system file and the user's file, where
//! the user's top-level keys override the system ones and object-valued keys
//! are merged one level deep. `--config` replaces both with a single file.
//! `DATABASE_URL` and the `SMTP_*` variables override their sections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mailgen_mail::{OpenPgpConfig, SmtpConfig};
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::PgConnectOptions;

pub const SYSTEM_CONFIG: &str = "/etc/intelmq/intelmq-mailgen.conf";
/// Location of the user's file, relative to `$HOME`.
pub const USER_CONFIG: &str = ".intelmq/intelmq-mailgen.conf";

const DEFAULT_DB_HOST: &str = "localhost";
const DEFAULT_DB_PORT: u16 = 5432;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration file found (tried {tried})")]
    NotFound { tried: String },

    #[error("could not read {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not valid JSON: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[source] serde_json::Error),

    #[error("no database configured, set DATABASE_URL or database.event")]
    MissingDatabase,

    #[error("invalid DATABASE_URL: {0}")]
    DatabaseUrl(#[source] sqlx::Error),

    #[error("no SMTP relay configured, set SMTP_HOST or the smtp section")]
    MissingSmtp,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

fn default_db_host() -> String {
    DEFAULT_DB_HOST.to_string()
}

fn default_db_port() -> u16 {
    DEFAULT_DB_PORT
}

/// Connection to the event database.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventDatabase {
    pub name: String,
    pub username: String,
    pub password: Option<String>,
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseSection {
    pub event: EventDatabase,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    pub openpgp: OpenPgpConfig,
    /// `From` address of every notification.
    pub sender: String,
    pub template_dir: PathBuf,
    pub script_directory: PathBuf,
    #[serde(default)]
    pub script_timeout_secs: Option<u64>,
    #[serde(default)]
    pub xarf_reportdomain: Option<String>,
    /// Log level of the `mailgen` crates unless `RUST_LOG` is set.
    #[serde(default)]
    pub logging_level: Option<String>,
}

impl Config {
    /// Load the configuration, either from `explicit` alone or from the
    /// system and user files.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_value(read_json(path)?),
            None => Self::load_layered(&default_paths()),
        }
    }

    /// Merge every existing file of `paths` in order. Missing files are
    /// skipped; finding none at all is an error.
    pub fn load_layered(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut merged: Option<Value> = None;
        for path in paths.iter().filter(|p| p.exists()) {
            tracing::debug!(path = %path.display(), "Reading configuration file");
            let value = read_json(path)?;
            match merged.as_mut() {
                Some(base) => merge(base, value),
                None => merged = Some(value),
            }
        }
        let merged = merged.ok_or_else(|| ConfigError::NotFound {
            tried: paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })?;
        Self::from_value(merged)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(ConfigError::Invalid)
    }

    pub fn script_timeout(&self) -> Option<Duration> {
        self.script_timeout_secs.map(Duration::from_secs)
    }

    /// Connect options of the event database. `database_url` takes
    /// precedence over the `database.event` section.
    pub fn connect_options(
        &self,
        database_url: Option<&str>,
    ) -> Result<PgConnectOptions, ConfigError> {
        if let Some(url) = database_url {
            return url.parse().map_err(ConfigError::DatabaseUrl);
        }
        let db = self
            .database
            .as_ref()
            .map(|d| &d.event)
            .ok_or(ConfigError::MissingDatabase)?;
        let mut options = PgConnectOptions::new()
            .host(&db.host)
            .port(db.port)
            .username(&db.username)
            .database(&db.name);
        if let Some(password) = &db.password {
            options = options.password(password);
        }
        Ok(options)
    }

    /// The SMTP relay: the environment first, then the `smtp` section.
    pub fn smtp(&self, from_env: Option<SmtpConfig>) -> Result<SmtpConfig, ConfigError> {
        from_env
            .or_else(|| self.smtp.clone())
            .ok_or(ConfigError::MissingSmtp)
    }

    /// Default `EnvFilter` directive for the configured logging level.
    pub fn log_directive(&self) -> String {
        let level = match self
            .logging_level
            .as_deref()
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            None => "info",
            Some("warning") => "warn",
            Some("critical" | "fatal") => "error",
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            Some(_) => "info",
        };
        format!("mailgen={level}")
    }
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SYSTEM_CONFIG)];
    if let Some(home) = std::env::var_os("HOME") {
        paths.push(PathBuf::from(home).join(USER_CONFIG));
    }
    paths
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply `overlay` on top of `base`. Keys whose values are objects on both
/// sides are merged key by key; everything else is replaced.
pub fn merge(base: &mut Value, overlay: Value) {
    let (Value::Object(base), Value::Object(overlay)) = (base, overlay) else {
        return;
    };
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(section)) => {
                existing.extend(section);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
