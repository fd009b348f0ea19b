use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bridge::accumulator::DEFAULT_MAX_OUTPUT_CHARS;
use crate::bridge::interpreter::DEFAULT_PARTIAL_OUTPUT_CHARS;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_command")]
    pub command: String,
    /// Passed to the external CLI as `--config <path>` when set.
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    /// 0 disables the deadline.
    #[serde(default = "default_bridge_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
    #[serde(default = "default_partial_output_chars")]
    pub partial_output_chars: usize,
    #[serde(default)]
    pub keep_partial_stdout_on_timeout: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            command: default_bridge_command(),
            config_path: None,
            timeout_ms: default_bridge_timeout_ms(),
            max_output_chars: default_max_output_chars(),
            partial_output_chars: default_partial_output_chars(),
            keep_partial_stdout_on_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, command: Option<&str>, timeout_ms: Option<u64>) {
        if let Some(command) = command {
            self.bridge.command = command.to_owned();
        }
        if let Some(timeout_ms) = timeout_ms {
            self.bridge.timeout_ms = timeout_ms;
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("OPENCLAW_BRIDGE_COMMAND") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.bridge.command = trimmed.to_owned();
            }
        }
        if let Ok(v) = env::var("OPENCLAW_BRIDGE_CONFIG_PATH") {
            let trimmed = v.trim();
            self.bridge.config_path = if trimmed.is_empty() {
                None
            } else {
                Some(PathBuf::from(trimmed))
            };
        }
        if let Ok(v) = env::var("OPENCLAW_BRIDGE_TIMEOUT_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                self.bridge.timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("OPENCLAW_BRIDGE_MAX_OUTPUT_CHARS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.bridge.max_output_chars = n;
            }
        }
        if let Ok(v) = env::var("OPENCLAW_BRIDGE_PARTIAL_OUTPUT_CHARS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                self.bridge.partial_output_chars = n;
            }
        }
        if let Ok(v) = env::var("OPENCLAW_BRIDGE_KEEP_PARTIAL_STDOUT") {
            self.bridge.keep_partial_stdout_on_timeout = parse_bool(&v);
        }
        if let Ok(v) = env::var("OPENCLAW_BRIDGE_CATALOG_PATH") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.catalog.path = PathBuf::from(trimmed);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bridge.command.trim().is_empty() {
            anyhow::bail!("bridge.command must be a non-empty executable name");
        }
        if self.bridge.max_output_chars == 0 {
            anyhow::bail!("bridge.max_output_chars must be > 0");
        }
        if self.bridge.partial_output_chars == 0 {
            anyhow::bail!("bridge.partial_output_chars must be > 0");
        }
        if self.bridge.partial_output_chars > self.bridge.max_output_chars {
            anyhow::bail!("bridge.partial_output_chars must not exceed bridge.max_output_chars");
        }
        if self
            .bridge
            .config_path
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            anyhow::bail!("bridge.config_path must not be empty when set");
        }
        Ok(())
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn default_bridge_command() -> String {
    "mcporter".to_owned()
}

fn default_bridge_timeout_ms() -> u64 {
    30_000
}

fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}

fn default_partial_output_chars() -> usize {
    DEFAULT_PARTIAL_OUTPUT_CHARS
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("openclaw-tools.json")
}
