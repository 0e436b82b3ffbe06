use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Supervisor configuration, loaded from a JSON document at startup.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Identity used in the cgroup path.
    pub worker_name: String,
    pub host: String,
    pub port: u16,
    pub certs: CertsConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertsConfig {
    /// Base directory that relative certificate paths resolve against.
    pub cert_dir: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// CA used to verify client certificates.
    pub ca_file: PathBuf,
}

impl CertsConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cert_dir.join(path)
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
