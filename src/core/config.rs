//! Server configuration: identity, registry policy, and engine wiring.
//!
//! Loaded from `config.toml` in the platform config directory, or from an
//! explicit `--config` path. A missing file yields the defaults.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const DEFAULT_TOOL_PREFIX: &str = "goal-";
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;

/// Errors that can occur when loading configuration from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "Failed to parse config at {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// When the capability registry snapshot is rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryRefresh {
    /// Build once at initialization; listings stay stable for the session.
    #[default]
    Session,
    /// Rebuild on every `tools/list` / `resources/list`.
    PerList,
}

/// How to drive the underlying build tool as a subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Executable to run (e.g. `pants`).
    pub command: String,
    /// Arguments prepended to every invocation.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for engine invocations (the build root).
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Subcommand that prints one target address per line.
    #[serde(default = "default_list_targets_args")]
    pub list_targets_args: Vec<String>,
    /// Subcommand that prints JSON metadata for the address appended to it.
    #[serde(default = "default_metadata_args")]
    pub metadata_args: Vec<String>,
    /// Goals to expose as tools.
    #[serde(default)]
    pub goals: Vec<GoalConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_list_targets_args() -> Vec<String> {
    vec!["list".to_string(), "::".to_string()]
}

fn default_metadata_args() -> Vec<String> {
    vec!["peek".to_string()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            command: "pants".to_string(),
            args: Vec::new(),
            root: None,
            list_targets_args: default_list_targets_args(),
            metadata_args: default_metadata_args(),
            goals: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    /// Server name advertised during the handshake
    pub server_name: Option<String>,
    /// Prefix applied to goal names when deriving tool names
    pub tool_prefix: Option<String>,
    #[serde(default)]
    pub registry_refresh: RegistryRefresh,
    /// How long to wait for in-flight requests after a shutdown notification
    pub shutdown_grace_ms: Option<u64>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    pub fn load() -> Result<Config, Box<dyn std::error::Error>> {
        Self::load_from_path(&Self::get_config_path())
    }

    pub fn load_from_path(config_path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
                path: config_path.clone(),
                source,
            })?;
            let config: Config =
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: config_path.clone(),
                    source,
                })?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save_to_path(&self, config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let parent = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty());

        if let Some(dir) = parent {
            fs::create_dir_all(dir)?;
        }

        let contents = toml::to_string_pretty(self)?;
        let mut temp_file = match parent {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };

        temp_file.write_all(contents.as_bytes())?;
        temp_file.as_file_mut().sync_all()?;
        temp_file
            .persist(config_path)
            .map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;
        Ok(())
    }

    pub fn get_config_path() -> PathBuf {
        match ProjectDirs::from("org", "permacommons", "chantier") {
            Some(proj_dirs) => proj_dirs.config_dir().join("config.toml"),
            None => PathBuf::from("config.toml"),
        }
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or("chantier")
    }

    pub fn tool_prefix(&self) -> &str {
        self.tool_prefix.as_deref().unwrap_or(DEFAULT_TOOL_PREFIX)
    }

    pub fn shutdown_grace_ms(&self) -> u64 {
        self.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS)
    }
}
