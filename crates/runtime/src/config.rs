//! Runtime configuration
//!
//! Paths come from three layers, strongest last: an optional `Orus.toml` in
//! the working directory, then the `ORUS_STD_PATH` / `ORUS_CACHE_PATH`
//! environment variables, then CLI flags. The cache root defaults to
//! `~/.cache/orus` when nothing else sets it.

use serde::Deserialize;
use std::path::PathBuf;

/// On-disk config file name.
pub const CONFIG_FILE: &str = "Orus.toml";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Root for `std/...` module resolution when a module is not on disk
    /// relative to the working directory.
    pub std_path: Option<PathBuf>,
    /// Root for `.obc` bytecode cache files. Set to the empty string in
    /// `Orus.toml` to disable caching entirely.
    pub cache_path: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("failed to parse {}: {}", CONFIG_FILE, e))
    }

    /// Layer the environment on top of this config.
    pub fn apply_env(mut self) -> Self {
        if let Ok(path) = std::env::var("ORUS_STD_PATH") {
            if !path.is_empty() {
                self.std_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("ORUS_CACHE_PATH") {
            if !path.is_empty() {
                self.cache_path = Some(PathBuf::from(path));
            }
        }
        self
    }

    /// Fill remaining holes with defaults.
    pub fn with_defaults(mut self) -> Self {
        if self.cache_path.is_none() {
            self.cache_path = home::home_dir().map(|dir| dir.join(".cache").join("orus"));
        }
        self
    }

    /// Load `Orus.toml` from the working directory if present, then apply
    /// the environment and defaults.
    pub fn load() -> Self {
        let base = std::fs::read_to_string(CONFIG_FILE)
            .ok()
            .and_then(|text| match RuntimeConfig::from_toml(&text) {
                Ok(config) => Some(config),
                Err(message) => {
                    tracing::debug!(%message, "ignoring malformed config file");
                    None
                }
            })
            .unwrap_or_default();
        base.apply_env().with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toml_paths() {
        let config = RuntimeConfig::from_toml(
            "std_path = \"/opt/orus/std\"\ncache_path = \"/tmp/orus-cache\"\n",
        )
        .unwrap();
        assert_eq!(config.std_path, Some(PathBuf::from("/opt/orus/std")));
        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/orus-cache")));
    }

    #[test]
    fn empty_toml_is_valid() {
        let config = RuntimeConfig::from_toml("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(RuntimeConfig::from_toml("std_path = [1, 2]").is_err());
    }

    #[test]
    #[serial_test::serial]
    fn environment_overrides_config() {
        unsafe {
            std::env::set_var("ORUS_STD_PATH", "/env/std");
            std::env::set_var("ORUS_CACHE_PATH", "/env/cache");
        }
        let config = RuntimeConfig {
            std_path: Some(PathBuf::from("/toml/std")),
            cache_path: None,
        }
        .apply_env();
        assert_eq!(config.std_path, Some(PathBuf::from("/env/std")));
        assert_eq!(config.cache_path, Some(PathBuf::from("/env/cache")));
        unsafe {
            std::env::remove_var("ORUS_STD_PATH");
            std::env::remove_var("ORUS_CACHE_PATH");
        }
    }

    #[test]
    #[serial_test::serial]
    fn empty_environment_keeps_config() {
        unsafe {
            std::env::remove_var("ORUS_STD_PATH");
            std::env::remove_var("ORUS_CACHE_PATH");
        }
        let config = RuntimeConfig {
            std_path: Some(PathBuf::from("/toml/std")),
            cache_path: None,
        }
        .apply_env();
        assert_eq!(config.std_path, Some(PathBuf::from("/toml/std")));
    }

    #[test]
    fn defaults_fill_cache_path() {
        let config = RuntimeConfig::default().with_defaults();
        // Either a home directory exists or the cache stays off.
        if home::home_dir().is_some() {
            assert!(config.cache_path.is_some());
        }
    }
}
