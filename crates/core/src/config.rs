//! Settings are layered: built-in defaults, then `procura.toml`, then
//! `PROCURA_*` environment variables, then [`ConfigOverrides`].

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Searched in order when no explicit path is given.
pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["procura.toml", "config/procura.toml"];

/// Dotted setting key and the environment variables that set it. When more
/// than one variable is listed the first one present wins.
pub const ENV_BINDINGS: &[(&str, &[&str])] = &[
    ("database.url", &["PROCURA_DATABASE_URL"]),
    ("database.max_connections", &["PROCURA_DATABASE_MAX_CONNECTIONS"]),
    ("database.timeout_secs", &["PROCURA_DATABASE_TIMEOUT_SECS"]),
    ("server.bind_address", &["PROCURA_SERVER_BIND_ADDRESS"]),
    ("server.port", &["PROCURA_SERVER_PORT"]),
    ("server.graceful_shutdown_secs", &["PROCURA_SERVER_GRACEFUL_SHUTDOWN_SECS"]),
    ("server.api_token", &["PROCURA_SERVER_API_TOKEN"]),
    ("workflow.max_steps_per_process", &["PROCURA_WORKFLOW_MAX_STEPS_PER_PROCESS"]),
    ("workflow.default_page_size", &["PROCURA_WORKFLOW_DEFAULT_PAGE_SIZE"]),
    ("logging.level", &["PROCURA_LOGGING_LEVEL", "PROCURA_LOG_LEVEL"]),
    ("logging.format", &["PROCURA_LOGGING_FORMAT", "PROCURA_LOG_FORMAT"]),
];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub workflow: WorkflowConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
    /// When set, API calls must carry `Authorization: Bearer <token>`.
    pub api_token: Option<SecretString>,
}

#[derive(Clone, Debug)]
pub struct WorkflowConfig {
    pub max_steps_per_process: u32,
    pub default_page_size: u32,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// Values set by the embedding process; they beat every other layer.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub api_token: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    /// Must exist when given; otherwise [`CONFIG_FILE_CANDIDATES`] are tried.
    pub config_path: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://procura.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
                api_token: None,
            },
            workflow: WorkflowConfig { max_steps_per_process: 64, default_page_size: 50 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let file = match options.config_path {
            Some(path) if path.exists() => Some(path),
            Some(path) => return Err(ConfigError::MissingConfigFile(path)),
            None => find_config_file(),
        };
        if let Some(path) = file {
            config.apply_file(read_file_layer(&path)?);
        }

        for (key, vars) in ENV_BINDINGS {
            let found = vars.iter().find_map(|var| read_env(var).map(|value| (*var, value)));
            if let Some((var, value)) = found {
                config.assign(key, var, value)?;
            }
        }

        let ConfigOverrides { database_url, api_token } = options.overrides;
        if let Some(url) = database_url {
            config.database.url = url;
        }
        if let Some(token) = api_token {
            config.server.api_token = Some(token.into());
        }

        config.validate()?;
        Ok(config)
    }

    /// Whether the HTTP API requires a bearer token.
    pub fn api_token_required(&self) -> bool {
        self.server.api_token.as_ref().is_some_and(|token| !token.expose_secret().is_empty())
    }

    /// Effective value of an [`ENV_BINDINGS`] key for operator output. The API
    /// token is reduced to a four character prefix.
    pub fn display_value(&self, key: &str) -> Option<String> {
        let value = match key {
            "database.url" => self.database.url.clone(),
            "database.max_connections" => self.database.max_connections.to_string(),
            "database.timeout_secs" => self.database.timeout_secs.to_string(),
            "server.bind_address" => self.server.bind_address.clone(),
            "server.port" => self.server.port.to_string(),
            "server.graceful_shutdown_secs" => self.server.graceful_shutdown_secs.to_string(),
            "server.api_token" => match &self.server.api_token {
                Some(token) => redact(token.expose_secret()),
                None => "<unset>".to_string(),
            },
            "workflow.max_steps_per_process" => self.workflow.max_steps_per_process.to_string(),
            "workflow.default_page_size" => self.workflow.default_page_size.to_string(),
            "logging.level" => self.logging.level.clone(),
            "logging.format" => format!("{:?}", self.logging.format).to_lowercase(),
            _ => return None,
        };
        Some(value)
    }

    fn assign(&mut self, key: &str, var: &str, value: String) -> Result<(), ConfigError> {
        match key {
            "database.url" => self.database.url = value,
            "database.max_connections" => self.database.max_connections = parse_env(var, &value)?,
            "database.timeout_secs" => self.database.timeout_secs = parse_env(var, &value)?,
            "server.bind_address" => self.server.bind_address = value,
            "server.port" => self.server.port = parse_env(var, &value)?,
            "server.graceful_shutdown_secs" => {
                self.server.graceful_shutdown_secs = parse_env(var, &value)?;
            }
            "server.api_token" => self.server.api_token = Some(value.into()),
            "workflow.max_steps_per_process" => {
                self.workflow.max_steps_per_process = parse_env(var, &value)?;
            }
            "workflow.default_page_size" => {
                self.workflow.default_page_size = parse_env(var, &value)?;
            }
            "logging.level" => self.logging.level = value,
            "logging.format" => self.logging.format = value.parse()?,
            other => {
                return Err(ConfigError::Validation(format!("unknown setting `{other}`")));
            }
        }
        Ok(())
    }

    fn apply_file(&mut self, file: FileLayer) {
        let FileLayer { database, server, workflow, logging } = file;
        replace(&mut self.database.url, database.url);
        replace(&mut self.database.max_connections, database.max_connections);
        replace(&mut self.database.timeout_secs, database.timeout_secs);
        replace(&mut self.server.bind_address, server.bind_address);
        replace(&mut self.server.port, server.port);
        replace(&mut self.server.graceful_shutdown_secs, server.graceful_shutdown_secs);
        if let Some(token) = server.api_token {
            self.server.api_token = Some(token.into());
        }
        replace(&mut self.workflow.max_steps_per_process, workflow.max_steps_per_process);
        replace(&mut self.workflow.default_page_size, workflow.default_page_size);
        replace(&mut self.logging.level, logging.level);
        replace(&mut self.logging.format, logging.format);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.database.url.trim();
        check(
            url.starts_with("sqlite:") || url == ":memory:",
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)",
        )?;
        check(self.database.max_connections > 0, "database.max_connections must be greater than zero")?;
        check(
            (1..=300).contains(&self.database.timeout_secs),
            "database.timeout_secs must be in range 1..=300",
        )?;

        check(!self.server.bind_address.trim().is_empty(), "server.bind_address must not be empty")?;
        check(self.server.port > 0, "server.port must be greater than zero")?;
        let token_len = self.server.api_token.as_ref().map_or(0, |token| token.expose_secret().len());
        check(
            token_len == 0 || token_len >= 16,
            "server.api_token must be at least 16 characters when set",
        )?;

        check(
            (1..=500).contains(&self.workflow.max_steps_per_process),
            "workflow.max_steps_per_process must be in range 1..=500",
        )?;
        check(
            (1..=1000).contains(&self.workflow.default_page_size),
            "workflow.default_page_size must be in range 1..=1000",
        )?;

        let level = self.logging.level.trim().to_ascii_lowercase();
        check(
            matches!(level.as_str(), "trace" | "debug" | "info" | "warn" | "error"),
            format!(
                "logging.level `{}` is invalid (expected trace|debug|info|warn|error)",
                self.logging.level
            ),
        )
    }
}

/// First of [`CONFIG_FILE_CANDIDATES`] that exists in the working directory.
pub fn find_config_file() -> Option<PathBuf> {
    CONFIG_FILE_CANDIDATES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_file_layer(path: &Path) -> Result<FileLayer, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&interpolate_env_vars(&raw)?)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

/// Replaces every `${VAR}` with the variable's value.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let end = tail.find('}').ok_or(ConfigError::UnterminatedInterpolation)?;
        let var = &tail[..end];
        let value = env::var(var)
            .map_err(|_| ConfigError::MissingEnvInterpolation { var: var.to_string() })?;
        output.push_str(&value);
        rest = &tail[end + 1..];
    }
    output.push_str(rest);
    Ok(output)
}

fn redact(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    let prefix: String = trimmed.chars().take(4).collect();
    format!("{prefix}***")
}

fn replace<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn check(condition: bool, message: impl Into<String>) -> Result<(), ConfigError> {
    if condition {
        Ok(())
    } else {
        Err(ConfigError::Validation(message.into()))
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// `procura.toml` as written; every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileLayer {
    database: DatabaseFile,
    server: ServerFile,
    workflow: WorkflowFile,
    logging: LoggingFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DatabaseFile {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServerFile {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    api_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkflowFile {
    max_steps_per_process: Option<u32>,
    default_page_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoggingFile {
    level: Option<String>,
    format: Option<LogFormat>,
}
