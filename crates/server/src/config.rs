//! Configuration persistence for the fluxstep server.
//!
//! Configuration is loaded with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/fluxstep/config.toml)
//! 3. Default values (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MODEL: &str = "black-forest-labs/FLUX.1-dev";
pub const DEFAULT_STEPS: usize = 40;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 3.5;
pub const DEFAULT_SIZE: usize = 768;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_MAX_STEPS: usize = fluxstep_core::pipeline::MAX_INFERENCE_STEPS;

/// Persistent configuration stored in TOML format. Every field is optional
/// so a file only needs the values it overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Local model directory or hub repo id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Weight precision (bf16, fp16, fp32).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype: Option<String>,

    /// Accelerator ordinal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<usize>,

    /// Force CPU execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Steps used when `prepare_latents` does not name a count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Upper bound on the step count a client may request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<usize>,

    /// Comma-separated list of allowed CORS origins. "*" allows all origins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Record attention and send per-token maps with every step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_attention: Option<bool>,
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub model: String,
    pub dtype: String,
    pub device: usize,
    pub cpu: bool,
    pub host: String,
    pub port: u16,
    pub steps: usize,
    pub guidance_scale: f64,
    pub height: usize,
    pub width: usize,
    pub seed: u64,
    pub max_steps: usize,
    pub allowed_origins: String,
    pub log_level: String,
    pub capture_attention: bool,
}

impl ServerConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fluxstep").join("config.toml"))
    }

    /// Load configuration from the default path, or defaults if absent.
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Merge with another config, preferring values set in `other`.
    pub fn merge(&mut self, other: &ServerConfig) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if other.is_some() {
                slot.clone_from(other);
            }
        }
        take(&mut self.model, &other.model);
        take(&mut self.dtype, &other.dtype);
        take(&mut self.device, &other.device);
        take(&mut self.cpu, &other.cpu);
        take(&mut self.host, &other.host);
        take(&mut self.port, &other.port);
        take(&mut self.steps, &other.steps);
        take(&mut self.guidance_scale, &other.guidance_scale);
        take(&mut self.height, &other.height);
        take(&mut self.width, &other.width);
        take(&mut self.seed, &other.seed);
        take(&mut self.max_steps, &other.max_steps);
        take(&mut self.allowed_origins, &other.allowed_origins);
        take(&mut self.log_level, &other.log_level);
        take(&mut self.capture_attention, &other.capture_attention);
    }

    /// Fills unset fields with the built-in defaults.
    pub fn resolve(&self) -> Settings {
        Settings {
            model: self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            dtype: self.dtype.clone().unwrap_or_else(|| "bf16".to_string()),
            device: self.device.unwrap_or(0),
            cpu: self.cpu.unwrap_or(false),
            host: self.host.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8000),
            steps: self.steps.unwrap_or(DEFAULT_STEPS),
            guidance_scale: self.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE),
            height: self.height.unwrap_or(DEFAULT_SIZE),
            width: self.width.unwrap_or(DEFAULT_SIZE),
            seed: self.seed.unwrap_or(DEFAULT_SEED),
            max_steps: self.max_steps.unwrap_or(DEFAULT_MAX_STEPS),
            allowed_origins: self.allowed_origins.clone().unwrap_or_else(|| "*".to_string()),
            log_level: self.log_level.clone().unwrap_or_else(|| "info".to_string()),
            capture_attention: self.capture_attention.unwrap_or(true),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("No config directory available")]
    NoConfigDir,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = ServerConfig {
            model: Some("/models/flux1-schnell".to_string()),
            port: Some(9000),
            steps: Some(4),
            capture_attention: Some(false),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        let loaded = ServerConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("dtype"));
    }

    #[test]
    fn merge_prefers_other() {
        let mut base = ServerConfig {
            model: Some("base-model".to_string()),
            steps: Some(20),
            seed: Some(1),
            ..Default::default()
        };
        let cli = ServerConfig {
            steps: Some(8),
            height: Some(512),
            ..Default::default()
        };
        base.merge(&cli);

        assert_eq!(base.model, Some("base-model".to_string()));
        assert_eq!(base.steps, Some(8));
        assert_eq!(base.height, Some(512));
        assert_eq!(base.seed, Some(1));
    }

    #[test]
    fn resolve_fills_defaults() {
        let settings = ServerConfig::default().resolve();
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.steps, 40);
        assert_eq!((settings.height, settings.width), (768, 768));
        assert_eq!(settings.seed, 42);
        assert_eq!(settings.guidance_scale, 3.5);
        assert!(settings.capture_attention);

        let settings = ServerConfig {
            cpu: Some(true),
            dtype: Some("fp32".to_string()),
            ..Default::default()
        }
        .resolve();
        assert!(settings.cpu);
        assert_eq!(settings.dtype, "fp32");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(matches!(
            ServerConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
