//! Configuration for the server and the champion chooser.
//!
//! Loaded from a TOML file, then overridden by environment variables:
//! `CHAMPD_POOL` and `CHAMPD_LISTEN`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dpth::LEVEL_LIMIT;
use crate::error::{Error, Result};
use crate::logging::LogLevel;
use crate::sparse::HookPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root of the storage pool.
    pub pool: PathBuf,
    pub server: ServerConfig,
    pub champ: ChampConfig,
    pub dpth: DpthConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PathBuf::from("/var/lib/champd"),
            server: ServerConfig::default(),
            champ: ChampConfig::default(),
            dpth: DpthConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Where backup clients connect.
    pub listen: SocketAddr,
    /// Exposes the champion chooser to other processes.
    pub champ_listen: Option<SocketAddr>,
    /// Uses a champion chooser in another process instead of the built-in one.
    pub champ_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4971)),
            champ_listen: None,
            champ_addr: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChampConfig {
    /// Most champions loaded for one window.
    pub champs_max: usize,
    /// Hooks collected before a scoring pass runs.
    pub window_hooks: u16,
    /// Blocks collected before a scoring pass runs, hooks or not.
    pub max_pending_blocks: usize,
    /// See [`HookPolicy`].
    pub hook_bits: u8,
}

impl ChampConfig {
    pub fn hook_policy(&self) -> HookPolicy {
        HookPolicy {
            bits: self.hook_bits,
        }
    }
}

impl Default for ChampConfig {
    fn default() -> Self {
        Self {
            champs_max: 10,
            window_hooks: 4096,
            max_pending_blocks: 65536,
            hook_bits: HookPolicy::default().bits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DpthConfig {
    pub max_per_level: u32,
}

impl Default for DpthConfig {
    fn default() -> Self {
        Self {
            max_per_level: LEVEL_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Consecutive already-stored blocks after which the client is told to
    /// forget them.
    pub forget_threshold: usize,
    /// zstd level for new block data.
    pub compression_level: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            forget_threshold: 1024,
            compression_level: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(pool) = std::env::var("CHAMPD_POOL") {
            self.pool = PathBuf::from(pool);
        }
        if let Ok(listen) = std::env::var("CHAMPD_LISTEN") {
            if let Ok(listen) = listen.parse() {
                self.server.listen = listen;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.champ.champs_max == 0 {
            return Err(Error::Config("champ.champs_max must be at least 1".into()));
        }
        if self.champ.window_hooks == 0 {
            return Err(Error::Config("champ.window_hooks must be at least 1".into()));
        }
        if self.champ.max_pending_blocks == 0 {
            return Err(Error::Config(
                "champ.max_pending_blocks must be at least 1".into(),
            ));
        }
        if self.champ.hook_bits > 64 {
            return Err(Error::Config("champ.hook_bits must be at most 64".into()));
        }
        if !(1..=LEVEL_LIMIT).contains(&self.dpth.max_per_level) {
            return Err(Error::Config(format!(
                "dpth.max_per_level must be between 1 and {LEVEL_LIMIT}"
            )));
        }
        Ok(())
    }

    pub fn data_root(&self) -> PathBuf {
        self.pool.join("data")
    }

    pub fn backups_root(&self) -> PathBuf {
        self.pool.join("backups")
    }

    pub fn sparse_path(&self) -> PathBuf {
        self.pool.join("sparse.gz")
    }
}
