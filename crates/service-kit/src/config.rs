//! Configuration loading utilities.

use serde::de::DeserializeOwned;
use std::env;
use std::path::{Path, PathBuf};

use crate::environment::Environment;

#[cfg(feature = "tracing")]
use crate::logging::{init_logging, LogFormat};

/// Error type for configuration operations.
#[derive(Debug)]
pub enum ConfigError {
    /// Configuration file not found.
    NotFound(PathBuf),
    /// Failed to read an env file.
    DotEnv(PathBuf, String),
    /// Failed to parse configuration.
    Parse(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "Config file not found: {}", path.display()),
            Self::DotEnv(path, msg) => {
                write!(f, "Failed to load env file {}: {}", path.display(), msg)
            }
            Self::Parse(msg) => write!(f, "Failed to parse config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Supported config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    DotEnv,
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?;
        match ext.to_lowercase().as_str() {
            "env" => Some(Self::DotEnv),
            "toml" => Some(Self::Toml),
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Configuration builder.
///
/// Sources are layered: env files first (they never override variables that
/// are already set), then the structured config file, then environment
/// variables with `__` as the nesting separator.
///
/// # Example
///
/// ```ignore
/// use service_kit::ConfigBuilder;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct MyConfig {
///     address: String,
/// }
///
/// let config: MyConfig = ConfigBuilder::new()
///     .with_dotenv()
///     .with_environment_dotenv("configs")
///     .with_config_file("config.toml")
///     .build()?;
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    load_default_dotenv: bool,
    environment_dotenv_dir: Option<PathBuf>,
    config_files: Vec<PathBuf>,
    env_prefix: Option<String>,
    #[cfg(feature = "tracing")]
    init_logging: bool,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load environment variables from `.env` file in current directory.
    pub fn with_dotenv(mut self) -> Self {
        self.load_default_dotenv = true;
        self
    }

    /// Load `<dir>/<APP_ENV>.env`, where `APP_ENV` defaults to `development`.
    ///
    /// Unlike [`with_dotenv`](Self::with_dotenv), a missing file is an error.
    pub fn with_environment_dotenv(mut self, dir: impl Into<PathBuf>) -> Self {
        self.environment_dotenv_dir = Some(dir.into());
        self
    }

    /// Load a configuration file.
    ///
    /// File format is detected from extension:
    /// - `.env` - Environment variables (multiple allowed)
    /// - `.toml` / `.yaml` / `.json` - Config file (last one used)
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_files.push(path.into());
        self
    }

    /// Only read environment variables starting with `<PREFIX>_`.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Initialize logging from environment variables (`LOG_FORMAT`, `RUST_LOG`).
    #[cfg(feature = "tracing")]
    pub fn with_logging_from_env(mut self) -> Self {
        self.init_logging = true;
        self
    }

    /// Build and return the configuration.
    pub fn build<C: DeserializeOwned>(self) -> Result<C, ConfigError> {
        if self.load_default_dotenv {
            let _ = dotenvy::dotenv();
        }

        if let Some(dir) = &self.environment_dotenv_dir {
            load_environment_dotenv(dir)?;
        }

        let mut main_config_file: Option<PathBuf> = None;

        for path in &self.config_files {
            match ConfigFormat::from_path(path) {
                Some(ConfigFormat::DotEnv) => {
                    if path.exists() {
                        let _ = dotenvy::from_path(path);
                    }
                }
                Some(_) => {
                    main_config_file = Some(path.clone());
                }
                None => {
                    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
                    let is_dotenv = file_name.starts_with(".env") || file_name == "env";
                    if is_dotenv && path.exists() {
                        let _ = dotenvy::from_path(path);
                    }
                }
            }
        }

        #[cfg(feature = "tracing")]
        if self.init_logging {
            init_logging(LogFormat::from_env(), "info");
        }

        let env_source = EnvSource {
            prefix: self.env_prefix,
        };

        match main_config_file {
            Some(path) => load_config_file(&path, env_source),
            None => load_from_env(env_source),
        }
    }
}

/// Load `<dir>/<APP_ENV>.env` without overriding variables that are already set.
pub fn load_environment_dotenv(dir: impl AsRef<Path>) -> Result<PathBuf, ConfigError> {
    let name = env::var("APP_ENV").unwrap_or_else(|_| Environment::default().as_str().to_string());
    let path = dir.as_ref().join(format!("{name}.env"));

    if !path.exists() {
        return Err(ConfigError::NotFound(path));
    }

    dotenvy::from_path(&path).map_err(|e| ConfigError::DotEnv(path.clone(), e.to_string()))?;
    tracing::debug!(path = %path.display(), "loaded environment file");
    Ok(path)
}

fn load_from_env<C: DeserializeOwned>(source: EnvSource) -> Result<C, ConfigError> {
    use config::Config;

    Config::builder()
        .add_source(source)
        .build()
        .and_then(|c| c.try_deserialize::<C>())
        .map_err(|e| ConfigError::Parse(e.to_string()))
}

fn load_config_file<C: DeserializeOwned>(path: &Path, source: EnvSource) -> Result<C, ConfigError> {
    use config::{Config, File};

    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    Config::builder()
        .add_source(File::from(path))
        .add_source(source)
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Environment source that also maps `APP_ENV`/`RUST_ENV` to the `environment` field.
#[derive(Debug, Clone)]
struct EnvSource {
    prefix: Option<String>,
}

impl config::Source for EnvSource {
    fn clone_into_box(&self) -> Box<dyn config::Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<config::Map<String, config::Value>, config::ConfigError> {
        use config::{Environment, Value, ValueKind};

        let source = match &self.prefix {
            Some(prefix) => Environment::with_prefix(prefix).prefix_separator("_"),
            None => Environment::default(),
        };

        let mut map = source.separator("__").try_parsing(true).collect()?;

        if !map.contains_key("environment") {
            if let Ok(val) = env::var("ENVIRONMENT")
                .or_else(|_| env::var("APP_ENV"))
                .or_else(|_| env::var("RUST_ENV"))
            {
                map.insert(
                    "environment".to_string(),
                    Value::new(None, ValueKind::String(val)),
                );
            }
        }

        Ok(map)
    }
}
