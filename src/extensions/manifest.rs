//! Extension manifest parsing.
//!
//! Each extension has a `manifest.toml` file that defines:
//! - Extension metadata (name, title, version, required API, etc.)
//! - The worker command and its environment
//! - Triggers (keywords that route queries to the worker)
//! - Preferences (user-configurable settings sent on connect)

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{ExtensionError, ExtensionResult};

/// File name of the manifest inside an extension directory.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Longest debounce a worker may declare.
pub const MAX_DEBOUNCE_MS: u64 = 10_000;

/// Version of the worker protocol implemented by this host.
pub static HOST_API_VERSION: Lazy<Version> = Lazy::new(|| Version::new(1, 2, 0));

/// Complete extension manifest parsed from `manifest.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub extension: ExtensionMeta,

    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,

    #[serde(default)]
    pub preferences: Vec<PreferenceConfig>,
}

impl ExtensionManifest {
    /// Load manifest from a directory containing `manifest.toml`.
    pub fn load(extension_dir: &Path) -> ExtensionResult<Self> {
        let manifest_path = extension_dir.join(MANIFEST_FILE);

        if !manifest_path.exists() {
            return Err(ExtensionError::ManifestNotFound(
                extension_dir.to_path_buf(),
            ));
        }

        let content = std::fs::read_to_string(&manifest_path)?;

        toml::from_str(&content).map_err(|e| ExtensionError::ManifestInvalid {
            path: manifest_path,
            message: e.to_string(),
        })
    }

    /// Validate the manifest for required fields and constraints.
    pub fn validate(&self) -> ExtensionResult<()> {
        let invalid = |message: String| ExtensionError::ManifestInvalid {
            path: MANIFEST_FILE.into(),
            message,
        };

        if self.extension.name.is_empty() {
            return Err(invalid("extension.name is required".to_string()));
        }

        if !self
            .extension
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(invalid(format!(
                "extension.name '{}' may only contain letters, digits, '-', '_' and '.'",
                self.extension.name
            )));
        }

        if self.extension.title.is_empty() {
            return Err(invalid("extension.title is required".to_string()));
        }

        if self.extension.version.is_empty() {
            return Err(invalid("extension.version is required".to_string()));
        }

        if self.runtime.command.first().map_or(true, |c| c.is_empty()) {
            return Err(invalid("runtime.command must name an executable".to_string()));
        }

        if self.runtime.debounce_ms > MAX_DEBOUNCE_MS {
            return Err(invalid(format!(
                "runtime.debounce_ms must be at most {}",
                MAX_DEBOUNCE_MS
            )));
        }

        let mut keywords = HashSet::new();
        for trigger in &self.triggers {
            if trigger.id.is_empty() {
                return Err(invalid("trigger.id is required".to_string()));
            }
            if trigger.keyword.is_empty() || trigger.keyword.contains(char::is_whitespace) {
                return Err(invalid(format!(
                    "trigger '{}' requires a single-word keyword",
                    trigger.id
                )));
            }
            if !keywords.insert(trigger.keyword.as_str()) {
                return Err(invalid(format!(
                    "keyword '{}' is declared twice",
                    trigger.keyword
                )));
            }
        }

        let mut pref_ids = HashSet::new();
        for pref in &self.preferences {
            if pref.id.is_empty() {
                return Err(invalid("preference.id is required".to_string()));
            }
            if !pref_ids.insert(pref.id.as_str()) {
                return Err(invalid(format!("preference '{}' is declared twice", pref.id)));
            }
            if pref.pref_type == PreferenceType::Dropdown
                && !pref.options.is_empty()
                && pref
                    .default
                    .as_ref()
                    .and_then(Value::as_str)
                    .is_some_and(|d| !pref.options.iter().any(|o| o.value == d))
            {
                return Err(invalid(format!(
                    "preference '{}' default is not one of its options",
                    pref.id
                )));
            }
        }

        if let Some(req) = &self.extension.api_version {
            VersionReq::parse(req)
                .map_err(|e| invalid(format!("extension.api_version '{}': {}", req, e)))?;
        }

        Ok(())
    }

    /// Check the declared API requirement against the host protocol version.
    pub fn check_compatibility(&self) -> ExtensionResult<()> {
        let Some(req) = &self.extension.api_version else {
            return Ok(());
        };

        let parsed = VersionReq::parse(req).map_err(|e| ExtensionError::ManifestInvalid {
            path: MANIFEST_FILE.into(),
            message: format!("extension.api_version '{}': {}", req, e),
        })?;

        if parsed.matches(&HOST_API_VERSION) {
            Ok(())
        } else {
            Err(ExtensionError::Incompatible {
                extension: self.extension.name.clone(),
                required: req.clone(),
                provided: HOST_API_VERSION.to_string(),
            })
        }
    }

    /// Resolve the extension icon relative to its directory.
    ///
    /// Returns `None` when no icon is declared or the file is missing.
    pub fn load_icon(&self, extension_dir: &Path, size: u32) -> Option<IconHandle> {
        let icon = self.extension.icon.as_ref()?;
        let path = extension_dir.join(icon);
        if !path.is_file() {
            tracing::debug!(
                "Icon {} for extension '{}' does not exist",
                path.display(),
                self.extension.name
            );
            return None;
        }
        Some(IconHandle { path, size })
    }

    /// Build the preferences object sent to the worker on connect.
    ///
    /// Declared defaults are applied first, then user overrides for known ids.
    pub fn preferences_with(&self, overrides: Option<&HashMap<String, Value>>) -> Map<String, Value> {
        let mut prefs = Map::new();
        for pref in &self.preferences {
            let value = overrides
                .and_then(|o| o.get(&pref.id))
                .cloned()
                .or_else(|| pref.default.clone())
                .unwrap_or_else(|| pref.pref_type.empty_value());
            prefs.insert(pref.id.clone(), value);
        }
        prefs
    }

    /// Find the trigger bound to a keyword.
    pub fn trigger_for_keyword(&self, keyword: &str) -> Option<&TriggerConfig> {
        self.triggers.iter().find(|t| t.keyword == keyword)
    }
}

/// Extension metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionMeta {
    /// Unique identifier, also used as the worker id.
    pub name: String,

    /// Human-readable display name.
    pub title: String,

    /// Short description.
    #[serde(default)]
    pub description: String,

    /// Extension version.
    pub version: String,

    /// Author name.
    #[serde(default)]
    pub author: Option<String>,

    /// Icon filename relative to extension root.
    #[serde(default)]
    pub icon: Option<String>,

    /// Semver requirement on the host API (e.g. "^1.0").
    #[serde(default)]
    pub api_version: Option<String>,
}

/// How the worker process is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Program and arguments, resolved relative to the extension directory.
    pub command: Vec<String>,

    /// Extra environment for the worker.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Quiet period before a query is sent to the worker.
    #[serde(default)]
    pub debounce_ms: u64,
}

/// Keyword that routes a query to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub id: String,

    pub keyword: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,
}

/// User preference configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceConfig {
    /// Preference key.
    pub id: String,

    /// Human-readable title.
    #[serde(default)]
    pub title: String,

    /// Preference type.
    #[serde(rename = "type")]
    pub pref_type: PreferenceType,

    /// Default value.
    #[serde(default)]
    pub default: Option<Value>,

    /// Options for dropdown type.
    #[serde(default)]
    pub options: Vec<PreferenceOption>,
}

/// Preference type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PreferenceType {
    Text,
    Password,
    Number,
    Checkbox,
    Dropdown,
}

impl PreferenceType {
    fn empty_value(self) -> Value {
        match self {
            PreferenceType::Checkbox => Value::Bool(false),
            PreferenceType::Number => Value::from(0),
            _ => Value::String(String::new()),
        }
    }
}

/// Dropdown option.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceOption {
    pub value: String,
    #[serde(default)]
    pub title: String,
}

/// Resolved icon, handed to the UI for the loading placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconHandle {
    pub path: PathBuf,
    pub size: u32,
}
