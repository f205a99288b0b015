// Worker configuration: JSON file, then environment, then CLI flags
use crate::volume::VolumeTranslator;
use anyhow::{bail, Context, Result};
use sandrun_common::redis::DEFAULT_KEY_PREFIX;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/sandrun.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Image every sandbox runs
    pub image: String,
    /// Where the working directory is mounted inside the container
    pub mount_target: String,
    pub use_sudo: bool,
    /// Pull the image before the run when it is not cached locally
    pub pull_images: bool,
    /// Wall-clock limit for the whole run; `None` waits indefinitely
    pub run_timeout_ms: Option<u64>,
    /// Forces a path translation mode; `None` picks the host default
    pub volume_mode: Option<VolumeTranslator>,
    pub store: StoreBackend,
    pub redis_url: String,
    pub key_prefix: String,
    /// Mirror sandbox output to this process's stdout/stderr
    pub echo: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image: "sandrun/base".to_string(),
            mount_target: "/run".to_string(),
            use_sudo: false,
            pull_images: true,
            run_timeout_ms: None,
            volume_mode: None,
            store: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            echo: true,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load config/sandrun.json when present, built-in defaults otherwise
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            Self::load(default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = var("REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(image) = var("SANDRUN_IMAGE") {
            self.image = image;
        }
        if let Some(target) = var("SANDRUN_MOUNT_TARGET") {
            self.mount_target = target;
        }
        if let Some(raw) = var("SANDRUN_TIMEOUT_MS") {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("SANDRUN_TIMEOUT_MS is not a number: {}", raw))?;
            self.run_timeout_ms = Some(ms);
        }
        if let Some(raw) = var("SANDRUN_USE_SUDO") {
            self.use_sudo = parse_flag(&raw)
                .with_context(|| format!("SANDRUN_USE_SUDO is not a boolean: {}", raw))?;
        }
        if let Some(raw) = var("SANDRUN_STORE") {
            self.store = match raw.to_lowercase().as_str() {
                "redis" => StoreBackend::Redis,
                "memory" => StoreBackend::Memory,
                other => bail!("Unknown store backend: {} (expected redis or memory)", other),
            };
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    pub fn translator(&self) -> VolumeTranslator {
        self.volume_mode.unwrap_or_else(VolumeTranslator::for_host)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandrun.json");
        fs::write(
            &path,
            r#"{"image":"coduno/base","mount_target":"/app","run_timeout_ms":30000,"volume_mode":"drive-letter"}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.image, "coduno/base");
        assert_eq!(config.mount_target, "/app");
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.translator(), VolumeTranslator::DriveLetter);
        assert_eq!(config.store, StoreBackend::Redis);
        assert_eq!(config.key_prefix, "sandrun");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(&dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn test_load_malformed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandrun.json");
        fs::write(&path, "{ image: ").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(vars(&[
                ("REDIS_URL", "redis://:secret@db:6379"),
                ("SANDRUN_IMAGE", "custom/image"),
                ("SANDRUN_TIMEOUT_MS", "1500"),
                ("SANDRUN_USE_SUDO", "yes"),
                ("SANDRUN_STORE", "Memory"),
            ]))
            .unwrap();

        assert_eq!(config.redis_url, "redis://:secret@db:6379");
        assert_eq!(config.image, "custom/image");
        assert_eq!(config.run_timeout_ms, Some(1500));
        assert!(config.use_sudo);
        assert_eq!(config.store, StoreBackend::Memory);
    }

    #[test]
    fn test_bad_env_values_are_rejected() {
        let mut config = Config::default();
        assert!(config.apply_overrides(vars(&[("SANDRUN_TIMEOUT_MS", "soon")])).is_err());
        assert!(config.apply_overrides(vars(&[("SANDRUN_STORE", "postgres")])).is_err());
        assert!(config.apply_overrides(vars(&[("SANDRUN_USE_SUDO", "maybe")])).is_err());
    }
}
