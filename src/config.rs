use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::NovaResult;

/// Host-side configuration for the extension runtime (`extensions.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub timing: TimingConfig,
    /// Extra environment passed to every worker process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-extension preference overrides, keyed by extension id.
    #[serde(default)]
    pub preferences: HashMap<String, HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory scanned for extensions. Defaults to the platform data dir.
    pub extensions_dir: Option<PathBuf>,
    /// Start every valid extension when the host comes up.
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay before the "Loading..." placeholder is shown.
    pub loading_delay_ms: u64,
    /// Time a worker gets to exit after SIGTERM.
    pub stop_grace_ms: u64,
    /// Extra slack added to the grace period before SIGKILL.
    pub kill_margin_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            timing: TimingConfig::default(),
            env: BTreeMap::new(),
            preferences: HashMap::new(),
        }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            extensions_dir: None,
            autostart: true,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            loading_delay_ms: 300,
            stop_grace_ms: 500,
            kill_margin_ms: 50,
        }
    }
}

impl TimingConfig {
    pub fn loading_delay(&self) -> Duration {
        Duration::from_millis(self.loading_delay_ms)
    }

    /// Delay between SIGTERM and the forced kill.
    pub fn kill_delay(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms + self.kill_margin_ms)
    }
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .map(|h| h.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
            })
            .join("nova")
            .join("extensions.toml")
    }

    /// Directory scanned for extensions.
    pub fn extensions_dir(&self) -> PathBuf {
        self.general
            .extensions_dir
            .clone()
            .unwrap_or_else(default_extensions_dir)
    }

    /// Load config from the default path, or return defaults if missing or broken.
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config from {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load and validate config from an explicit path.
    pub fn load_from(path: &Path) -> NovaResult<Self> {
        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate();
        Ok(config)
    }

    /// Clamp config values to acceptable ranges
    fn validate(&mut self) {
        self.timing.loading_delay_ms = self.timing.loading_delay_ms.clamp(0, 5_000);
        self.timing.stop_grace_ms = self.timing.stop_grace_ms.clamp(50, 10_000);
        self.timing.kill_margin_ms = self.timing.kill_margin_ms.min(1_000);
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> NovaResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Preference overrides for one extension.
    pub fn preference_overrides(&self, ext_id: &str) -> Option<&HashMap<String, serde_json::Value>> {
        self.preferences.get(ext_id)
    }
}

fn default_extensions_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("nova").join("extensions"))
        .unwrap_or_else(|| PathBuf::from("/tmp/nova/extensions"))
}
