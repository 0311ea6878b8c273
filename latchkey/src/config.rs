//! Operator configuration: `$LATCHKEY_HOME/config.json` plus environment
//! overrides

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use latchkey_api::Tokens;
use latchkey_ble::DiscoveryFilter;
use latchkey_engine::EngineConfig;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory; set LATCHKEY_HOME")]
    NoHome,
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Everything `config.json` may contain; all fields are optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub characteristic_uuid: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_chunk_size: Option<usize>,
}

impl FileConfig {
    /// Environment wins over the file
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("LATCHKEY_API_URL") {
            self.api_url = Some(url);
        }
        if let Some(token) = var("LATCHKEY_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }
        if let Some(token) = var("LATCHKEY_REFRESH_TOKEN") {
            self.refresh_token = Some(token);
        }
    }
}

/// Home directory: `$LATCHKEY_HOME`, else `~/.latchkey`
pub fn latchkey_home() -> Result<PathBuf, ConfigError> {
    match std::env::var_os("LATCHKEY_HOME") {
        Some(home) => Ok(PathBuf::from(home)),
        None => dirs::home_dir()
            .map(|home| home.join(".latchkey"))
            .ok_or(ConfigError::NoHome),
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let data = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_str(&data)
        .map_err(|source| ConfigError::Json { path: path.to_path_buf(), source })
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub home: PathBuf,
    pub file: FileConfig,
}

impl Settings {
    pub fn load(home: Option<PathBuf>) -> Result<Self, ConfigError> {
        let home = match home {
            Some(home) => home,
            None => latchkey_home()?,
        };
        let mut file = read_file(&home.join(CONFIG_FILE))?;
        file.apply_env(|name| std::env::var(name).ok().filter(|v| !v.is_empty()));
        Ok(Self { home, file })
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE)
    }

    pub fn tokens(&self) -> Tokens {
        Tokens {
            access: self.file.access_token.clone(),
            refresh: self.file.refresh_token.clone(),
        }
    }

    pub fn discovery_window(&self) -> Duration {
        self.file
            .discovery_secs
            .map(Duration::from_secs)
            .unwrap_or(latchkey_ble::ble::DEFAULT_SCAN_WINDOW)
    }

    pub fn write_chunk_size(&self) -> usize {
        self.file
            .write_chunk_size
            .unwrap_or(latchkey_ble::ble::DEFAULT_WRITE_CHUNK)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let service_uuid = self.file.service_uuid.unwrap_or(defaults.service_uuid);

        EngineConfig {
            scan_timeout: self
                .file
                .scan_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.scan_timeout),
            ack_timeout: self
                .file
                .ack_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.ack_timeout),
            service_uuid,
            characteristic_uuid: self
                .file
                .characteristic_uuid
                .unwrap_or(defaults.characteristic_uuid),
            discovery: DiscoveryFilter {
                name_contains: self.file.device_name_filter.clone(),
                services: Vec::new(),
            },
        }
    }

    /// Write rotated tokens back to `config.json`.
    ///
    /// The file is re-read first so environment overrides never end up on
    /// disk.
    pub fn save_tokens(&mut self, tokens: &Tokens) -> Result<(), ConfigError> {
        let path = self.config_path();
        let mut on_disk = read_file(&path)?;
        on_disk.access_token = tokens.access.clone();
        on_disk.refresh_token = tokens.refresh.clone();

        fs::create_dir_all(&self.home)
            .map_err(|source| ConfigError::Io { path: self.home.clone(), source })?;
        let data = serde_json::to_string_pretty(&on_disk)
            .map_err(|source| ConfigError::Json { path: path.clone(), source })?;
        fs::write(&path, data).map_err(|source| ConfigError::Io { path: path.clone(), source })?;

        self.file.access_token = tokens.access.clone();
        self.file.refresh_token = tokens.refresh.clone();
        Ok(())
    }
}
