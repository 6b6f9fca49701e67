use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "config/server.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub model_path: PathBuf,
    pub upload_dir: PathBuf,
    /// Abort startup when the model cannot be loaded.
    pub require_model: bool,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            model_path: PathBuf::from("modelo_js/model.json"),
            upload_dir: PathBuf::from("uploads"),
            require_model: true,
            workers: None,
        }
    }
}

impl ServerConfig {
    /// Defaults, then the YAML file named by `CONFIG_PATH` (or
    /// `config/server.yaml` when present), then environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let file = std::env::var("CONFIG_PATH")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let default = PathBuf::from(DEFAULT_CONFIG_PATH);
                default.exists().then_some(default)
            });

        let config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&raw)?)
    }

    /// Applies `HOST`, `PORT`, `MODEL_PATH`, `UPLOAD_DIR`, `REQUIRE_MODEL`
    /// and `WORKERS` from `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.port = parse("PORT", &port)?;
        }
        if let Some(path) = lookup("MODEL_PATH") {
            self.model_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup("UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("REQUIRE_MODEL") {
            self.require_model = parse_bool("REQUIRE_MODEL", &flag)?;
        }
        if let Some(workers) = lookup("WORKERS") {
            let workers: usize = parse("WORKERS", &workers)?;
            if workers == 0 {
                return Err(invalid("WORKERS", "0"));
            }
            self.workers = Some(workers);
        }
        Ok(self)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}
