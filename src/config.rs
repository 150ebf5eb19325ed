//! Engine configuration
//!
//! Loaded from `.typthon-nfi.toml` (or an explicit path) and then overridden
//! by `TYPTHON_NFI_*` environment variables.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CONFIG_FILE: &str = ".typthon-nfi.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NfiConfig {
    #[serde(default)]
    pub reclamation: ReclamationConfig,

    #[serde(default)]
    pub call: CallConfig,

    #[serde(default)]
    pub library: LibraryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReclamationConfig {
    /// Register context allocations with the process-wide queue instead of a
    /// per-context one
    #[serde(default = "default_false")]
    pub shared_queue: bool,

    #[serde(default = "default_reaper_name")]
    pub reaper_thread_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallConfig {
    /// Specialized pipelines kept per call site before it degrades to the
    /// per-arity tier
    #[serde(default = "default_cache_size")]
    pub inline_cache_size: usize,

    /// Emit a debug event for every native call
    #[serde(default = "default_false")]
    pub trace_calls: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Default binding mode for `LoadFlags::default()`
    #[serde(default = "default_true")]
    pub lazy_binding: bool,

    #[serde(default = "default_false")]
    pub global_symbols: bool,
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        Self {
            shared_queue: false,
            reaper_thread_name: default_reaper_name(),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            inline_cache_size: default_cache_size(),
            trace_calls: false,
        }
    }
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            lazy_binding: true,
            global_symbols: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_cache_size() -> usize { 4 }
fn default_reaper_name() -> String { "typthon-nfi-reaper".to_string() }

impl NfiConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Find `.typthon-nfi.toml` in the current directory or its parents,
    /// falling back to defaults; environment overrides apply either way
    pub fn discover() -> Self {
        let mut current = std::env::current_dir().ok();

        while let Some(dir) = current {
            let path = dir.join(CONFIG_FILE);
            if path.exists() {
                match Self::load(&path) {
                    Ok(config) => return config.with_env_overrides(),
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable NFI config");
                    }
                }
            }
            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default().with_env_overrides()
    }

    /// Apply `TYPTHON_NFI_*` environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(size) = env_var("TYPTHON_NFI_CACHE_SIZE").and_then(|v| v.parse().ok()) {
            self.call.inline_cache_size = size;
        }
        if let Some(shared) = env_var("TYPTHON_NFI_SHARED_REAPER") {
            self.reclamation.shared_queue = parse_flag(&shared);
        }
        if let Some(lazy) = env_var("TYPTHON_NFI_LAZY_BINDING") {
            self.library.lazy_binding = parse_flag(&lazy);
        }
        if let Some(trace) = env_var("TYPTHON_NFI_TRACE_CALLS") {
            self.call.trace_calls = parse_flag(&trace);
        }
        self
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_flag(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NfiConfig::default();
        assert!(!config.reclamation.shared_queue);
        assert_eq!(config.call.inline_cache_size, 4);
        assert!(config.library.lazy_binding);
        assert_eq!(config.reclamation.reaper_thread_name, "typthon-nfi-reaper");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[reclamation]
shared_queue = true

[call]
inline_cache_size = 8
"#;

        let config = NfiConfig::parse(toml).unwrap();
        assert!(config.reclamation.shared_queue);
        assert_eq!(config.call.inline_cache_size, 8);
        // untouched sections keep their defaults
        assert!(config.library.lazy_binding);
        assert!(!config.call.trace_calls);
    }

    #[test]
    fn test_parse_rejects_bad_types() {
        let result = NfiConfig::parse("[call]\ninline_cache_size = \"many\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        let mut config = NfiConfig::default();
        config.library.global_symbols = true;
        config.call.inline_cache_size = 2;
        config.save(&path).unwrap();

        let loaded = NfiConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("off"));
    }
}
