use std::{
    env, fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{JoinError, Result},
    logjoin::{DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_STATS_PREFIX},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Inactivity interval after which a session is finalized, in seconds.
    pub idle_timeout_secs: u64,
    /// When set, sessions are joined and counted but never queued.
    pub dry_run: bool,
    pub stats_prefix: String,
    pub shard_index: u32,
    pub shard_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Config {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            data_dir: default_data_dir(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            dry_run: false,
            stats_prefix: DEFAULT_STATS_PREFIX.to_string(),
            shard_index: 0,
            shard_count: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| JoinError::Config(err.to_string()))?;
    path.push(".logjoin");
    path.push("config.toml");
    Ok(path)
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.validate()?;
        cfg.ensure_data_dir()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.ensure_data_dir()?;
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(JoinError::Config("shard_count must be positive".into()));
        }
        if self.shard_index >= self.shard_count {
            return Err(JoinError::Config(format!(
                "shard_index {} out of range 0..{}",
                self.shard_index, self.shard_count
            )));
        }
        if self.idle_timeout_secs == 0 {
            return Err(JoinError::Config("idle_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn session_store_path(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

fn default_data_dir() -> PathBuf {
    let Ok(current_dir) = env::current_dir() else {
        return PathBuf::from(".logjoin");
    };
    current_dir.join(".logjoin")
}
