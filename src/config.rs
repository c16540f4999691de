//! Runtime configuration, read from the environment into a passive struct.
//!
//! The engine never reads the environment itself; the binary shell loads a
//! [`Config`] once at startup and hands it over. Exit codes for startup
//! failures: 2 invalid config, 3 app-data dir inaccessible, 4 fatal
//! filesystem error.

use std::path::{Path, PathBuf};

use crate::types::Side;

pub const DEFAULT_QUEUE_CONCURRENCY: usize = 1;
pub const DEFAULT_QUEUE_RETRY_COUNT: u32 = 3;
pub const DEFAULT_HASH_WORKERS: usize = 2;

/// Exit codes recognized by wrapper scripts.
pub const EXIT_INVALID_CONFIG: i32 = 2;
pub const EXIT_DATA_DIR: i32 = 3;
pub const EXIT_FATAL_FS: i32 = 4;

/// One storage root plus its policy bits.
#[derive(Debug, Clone)]
pub struct SideConfig {
    pub root: PathBuf,
    pub allow_delete_from_sync: bool,
}

/// Full engine configuration. One instance per app-data directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub local: SideConfig,
    pub lake: SideConfig,
    pub queue_concurrency: usize,
    pub queue_retry_count: u32,
    pub hash_workers: usize,
    pub app_data_dir: PathBuf,
}

impl Config {
    pub fn side(&self, side: Side) -> &SideConfig {
        match side {
            Side::Local => &self.local,
            Side::Lake => &self.lake,
        }
    }

    pub fn root(&self, side: Side) -> &Path {
        &self.side(side).root
    }

    /// Whether sync-path deletes are permitted on `side`. Dedupe-initiated
    /// deletes bypass this flag by contract.
    pub fn allow_delete_from_sync(&self, side: Side) -> bool {
        self.side(side).allow_delete_from_sync
    }
}

/// A configuration problem that should abort startup with exit code 2.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Recognized environment keys, resolved with CLI overrides applied first.
pub struct EnvOverrides {
    pub local_root: Option<PathBuf>,
    pub lake_root: Option<PathBuf>,
    pub app_data_dir: Option<PathBuf>,
}

/// Build a [`Config`] from the environment plus CLI overrides.
pub fn load(overrides: EnvOverrides) -> Result<Config, ConfigError> {
    let local_root = resolve_root("LOCAL_MODELS_ROOT", overrides.local_root)?;
    let lake_root = resolve_root("LAKE_MODELS_ROOT", overrides.lake_root)?;
    if local_root == lake_root {
        return Err(ConfigError("LOCAL_MODELS_ROOT and LAKE_MODELS_ROOT must differ".into()));
    }

    let app_data_dir = overrides
        .app_data_dir
        .or_else(|| std::env::var_os("APP_DATA_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(".modeldepot"));

    if let Ok(algo) = std::env::var("HASH_ALGO") {
        if algo != "blake3" {
            return Err(ConfigError(format!("HASH_ALGO must be blake3, got {algo}")));
        }
    }

    Ok(Config {
        local: SideConfig {
            root: local_root,
            allow_delete_from_sync: env_bool("LOCAL_ALLOW_DELETE", false)?,
        },
        lake: SideConfig {
            root: lake_root,
            allow_delete_from_sync: env_bool("LAKE_ALLOW_DELETE", false)?,
        },
        queue_concurrency: env_number("QUEUE_CONCURRENCY", DEFAULT_QUEUE_CONCURRENCY)?.max(1),
        queue_retry_count: env_number("QUEUE_RETRY_COUNT", DEFAULT_QUEUE_RETRY_COUNT)?,
        hash_workers: env_number("HASH_WORKERS", DEFAULT_HASH_WORKERS)?.max(1),
        app_data_dir,
    })
}

fn resolve_root(key: &str, flag: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    let raw = flag
        .or_else(|| std::env::var_os(key).map(PathBuf::from))
        .ok_or_else(|| ConfigError(format!("{key} is not set")))?;
    let canonical = raw
        .canonicalize()
        .map_err(|e| ConfigError(format!("{key}={}: {e}", raw.display())))?;
    if !canonical.is_dir() {
        return Err(ConfigError(format!("{key}={} is not a directory", canonical.display())));
    }
    Ok(canonical)
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(ConfigError(format!("{key}={other} is not a boolean"))),
        },
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => v.parse().map_err(|_| ConfigError(format!("{key}={v} is not a number"))),
    }
}
