//! Configuration for the capstan S3 server

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Root directory for object data (one subdirectory per bucket)
    #[serde(default = "default_buckets_root")]
    pub buckets_root: PathBuf,

    /// Scratch root for in-progress multipart uploads
    #[serde(default = "default_multipart_root")]
    pub multipart_root: PathBuf,

    /// Path of the SQLite catalog holding users, access keys and buckets
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,

    /// Region echoed in SigV4 scopes and bucket-location responses
    #[serde(default = "default_region")]
    pub region: String,

    /// Age after which abandoned multipart scratch directories are swept
    #[serde(default = "default_multipart_max_age_secs")]
    pub multipart_max_age_secs: u64,

    /// Bootstrap credentials, inserted into the catalog on first start so a
    /// fresh instance is reachable before any external provisioning runs
    #[serde(default)]
    pub root_access_key_id: Option<String>,

    #[serde(default)]
    pub root_secret_access_key: Option<String>,
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:9000".parse().unwrap()
}

fn default_buckets_root() -> PathBuf {
    PathBuf::from("./data/buckets")
}

fn default_multipart_root() -> PathBuf {
    PathBuf::from("./data/multipart")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("./data/catalog.db")
}

fn default_max_body_size() -> u64 {
    5 * 1024 * 1024 * 1024 * 1024 // 5 TiB, the S3 object ceiling
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_multipart_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            buckets_root: default_buckets_root(),
            multipart_root: default_multipart_root(),
            catalog_path: default_catalog_path(),
            max_body_size: default_max_body_size(),
            region: default_region(),
            multipart_max_age_secs: default_multipart_max_age_secs(),
            root_access_key_id: None,
            root_secret_access_key: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("CAPSTAN_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }
        if let Ok(dir) = std::env::var("CAPSTAN_BUCKETS_ROOT") {
            config.buckets_root = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("CAPSTAN_MULTIPART_ROOT") {
            config.multipart_root = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("CAPSTAN_CATALOG_PATH") {
            config.catalog_path = PathBuf::from(path);
        }
        if let Ok(size) = std::env::var("CAPSTAN_MAX_BODY_SIZE") {
            if let Ok(parsed) = size.parse() {
                config.max_body_size = parsed;
            }
        }
        if let Ok(region) = std::env::var("CAPSTAN_REGION") {
            config.region = region;
        }
        if let Ok(key) = std::env::var("CAPSTAN_ROOT_ACCESS_KEY_ID") {
            config.root_access_key_id = Some(key);
        }
        if let Ok(secret) = std::env::var("CAPSTAN_ROOT_SECRET_ACCESS_KEY") {
            config.root_secret_access_key = Some(secret);
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("CAPSTAN_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        for path in &["capstan.toml", "/etc/capstan/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        Self::from_env()
    }

    /// Bootstrap credential pair if both halves are configured.
    pub fn root_credentials(&self) -> Option<(&str, &str)> {
        match (&self.root_access_key_id, &self.root_secret_access_key) {
            (Some(key), Some(secret)) => Some((key.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
