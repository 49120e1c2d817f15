use crate::{AtelierError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;


#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub paths: PathsConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    /// PEM-encoded RSA public key used to validate RS256 JWTs.
    pub jwt_public_key_pem: Option<String>,
    /// When true, requests may skip the JWT but must carry the app secret.
    pub allow_anonymous: bool,
    /// Shared secret required on every request in anonymous mode.
    pub app_secret: Option<String>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root data directory; logs and per-task state live underneath.
    pub data_dir: PathBuf,
}

impl PathsConfig {
    pub fn server_log_file(&self) -> PathBuf {
        self.data_dir.join("logs").join("server").join("logs.jsonl")
    }

    pub fn task_log_file(&self, task_id: &crate::ids::TaskId) -> PathBuf {
        self.data_dir
            .join("state")
            .join("tasks")
            .join(format!("{task_id}.json"))
    }

    pub fn cached_repo_path(&self, project_id: &crate::ids::ProjectId) -> PathBuf {
        self.data_dir.join("cached_repos").join(project_id.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub debounce_seconds: f64,
    pub max_debounce_seconds: f64,
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file
        match dotenv() {
            Ok(path) => tracing::info!("Loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("Could not load .env file: {}", e),
        }

        let data_dir = env::var("ATELIER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let database = DatabaseConfig {
            path: env::var("ATELIER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("atelier.db")),
        };

        let allow_anonymous = env::var("ATELIER_ALLOW_ANONYMOUS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let app_secret = env::var("ATELIER_APP_SECRET").ok();
        if allow_anonymous {
            match &app_secret {
                Some(secret) if !secret.trim().is_empty() => {}
                _ => {
                    return Err(AtelierError::Configuration(
                        "ATELIER_APP_SECRET is required when ATELIER_ALLOW_ANONYMOUS is set"
                            .to_string(),
                    ))
                }
            }
        }

        let jwt_public_key_pem = match env::var("ATELIER_JWT_PUBLIC_KEY_PATH") {
            Ok(path) => Some(std::fs::read_to_string(&path).map_err(|e| {
                AtelierError::Configuration(format!("cannot read JWT public key at {path}: {e}"))
            })?),
            Err(_) => None,
        };
        if !allow_anonymous && jwt_public_key_pem.is_none() {
            return Err(AtelierError::Configuration(
                "ATELIER_JWT_PUBLIC_KEY_PATH is required unless ATELIER_ALLOW_ANONYMOUS is set"
                    .to_string(),
            ));
        }

        let api = ApiConfig {
            host: env::var("ATELIER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("ATELIER_PORT")
                .unwrap_or_else(|_| "8585".to_string())
                .parse()
                .map_err(|_| AtelierError::Configuration("ATELIER_PORT must be a port number".to_string()))?,
            jwt_public_key_pem,
            allow_anonymous,
            app_secret,
            allowed_origins: env::var("ATELIER_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let sync = SyncConfig {
            debounce_seconds: env::var("ATELIER_SYNC_DEBOUNCE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::constants::LOCAL_SYNC_DEBOUNCE_SECONDS),
            max_debounce_seconds: env::var("ATELIER_SYNC_MAX_DEBOUNCE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::constants::LOCAL_SYNC_MAX_DEBOUNCE_SECONDS),
        };
        if sync.max_debounce_seconds < sync.debounce_seconds {
            return Err(AtelierError::Configuration(
                "ATELIER_SYNC_MAX_DEBOUNCE_SECONDS must be >= ATELIER_SYNC_DEBOUNCE_SECONDS"
                    .to_string(),
            ));
        }

        Ok(Config {
            database,
            api,
            paths: PathsConfig { data_dir },
            sync,
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs_home()
        .map(|home| home.join(".atelier"))
        .unwrap_or_else(|| PathBuf::from(".atelier"))
}

fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
