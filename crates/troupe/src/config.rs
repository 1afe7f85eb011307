//! Application configuration.
//!
//! Loaded from `~/.config/troupe/config.toml` (created with defaults on
//! first run) and layered with `TROUPE`-prefixed environment variables,
//! e.g. `TROUPE_SERVER__PORT=5000`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "troupe";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    pub hierarchy: HierarchyConfig,
    pub until_done: UntilDoneConfig,
    pub escalation: EscalationConfig,
    pub logging: LoggingConfig,
}

/// WebSocket server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4617,
        }
    }
}

/// Worker runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path to (or bare name of) the worker runtime binary.
    pub binary: PathBuf,
    /// Working directory for sessions that do not specify one.
    pub default_cwd: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            binary: PathBuf::from("troupe-worker"),
            default_cwd: home.join("projects"),
        }
    }
}

/// Session hierarchy caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Maximum hierarchy levels including the root. With the default of 3 a
    /// root may have children and grandchildren, but no deeper.
    pub max_levels: u32,
    /// Maximum live children per session.
    pub max_children: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            max_levels: 3,
            max_children: 5,
        }
    }
}

/// Until-done loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UntilDoneConfig {
    /// Cap on continuation cycles per query.
    pub max_iterations: u32,
    /// Delay before re-invoking an unfinished session.
    pub continue_delay_ms: u64,
}

impl Default for UntilDoneConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            continue_delay_ms: 1500,
        }
    }
}

/// Escalation handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Deadline after which an unresolved escalation is resolved with action
    /// "timeout". 0 disables the deadline.
    pub timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self { timeout_secs: 900 }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Load configuration, creating the default file on first run.
pub fn load_or_init(config_file: Option<PathBuf>) -> Result<AppConfig> {
    let config_file = match config_file {
        Some(path) => expand_path(path)?,
        None => default_config_dir()?.join("config.toml"),
    };

    if !config_file.exists() {
        write_default_config(&config_file)?;
        info!("wrote default config to {}", config_file.display());
    }

    let built = Config::builder()
        .add_source(
            File::from(config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("TROUPE").separator("__"))
        .build()
        .context("building configuration")?;

    let config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {}\n# File: {}\n\n", APP_NAME, path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => {
            let expanded = shellexpand::full(text).context("expanding path")?;
            Ok(PathBuf::from(expanded.to_string()))
        }
        None => Ok(path),
    }
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.hierarchy.max_levels, 3);
        assert_eq!(config.hierarchy.max_children, 5);
        assert_eq!(config.until_done.max_iterations, 10);
        assert_eq!(config.escalation.timeout_secs, 900);
        assert_eq!(config.server.port, 4617);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [hierarchy]
            max_levels = 2
        "#,
        )
        .unwrap();
        assert_eq!(parsed.hierarchy.max_levels, 2);
        assert_eq!(parsed.hierarchy.max_children, 5);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn test_load_or_init_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = load_or_init(Some(path.clone())).unwrap();
        assert!(path.exists());
        assert_eq!(config.server.port, 4617);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# Configuration for troupe"));
    }
}
