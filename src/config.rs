use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Runtime configuration loaded from `~/.config/review-gc/config.toml`.
///
/// All fields have defaults, so the tool works without a config file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Fallback remote for review queries.
    #[serde(default = "default_remote")]
    pub default_remote: String,

    /// Program used for the remote-execution channel.
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,

    /// Minimum age of the last run before `--auto` runs again.
    #[serde(default = "default_gc_interval_days")]
    pub gc_interval_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_remote: default_remote(),
            ssh_command: default_ssh_command(),
            gc_interval_days: default_gc_interval_days(),
        }
    }
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_ssh_command() -> String {
    "ssh".to_string()
}

fn default_gc_interval_days() -> u32 {
    7
}

impl Config {
    /// Load config from `path`. Returns `(Config, found)`; if the file does
    /// not exist, returns the default config and `found = false`.
    pub fn load(path: &Path) -> Result<(Self, bool)> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config: Config = toml::from_str(&text)
                    .with_context(|| format!("parsing config file: {}", path.display()))?;
                Ok((config, true))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((Config::default(), false)),
            Err(e) => {
                Err(e).with_context(|| format!("reading config file: {}", path.display()))
            }
        }
    }

    /// Like [`Config::load`], but warns when the file is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let (config, found) = Self::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?;
        if !found {
            warn!("No config file found at {}, using defaults.", path.display());
        }
        Ok(config)
    }
}

/// `~/.config/review-gc/config.toml`, or a relative fallback when no home
/// directory can be found.
pub fn default_config_path() -> PathBuf {
    match directories::BaseDirs::new() {
        Some(base) => base.home_dir().join(".config/review-gc/config.toml"),
        None => PathBuf::from(".review-gc.toml"),
    }
}
