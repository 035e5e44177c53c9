//! Renderer configuration.
//!
//! Loaded from TOML or built in code. Every field has a default, so a file
//! only needs the keys it changes:
//!
//! ```toml
//! backend = "vulkan"          # dummy, wgpu or vulkan
//! allow_backend_fallback = true
//! vsync = false
//! clear_color = [0.0, 0.0, 0.0, 1.0]
//!
//! [recovery]
//! auto_recover = true
//! max_attempts = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RenderError;
use crate::presentation::PresentationConfig;
use crate::stats::{DEFAULT_STATS_WINDOW, MAX_STATS_WINDOW};
use crate::BackendType;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<ConfigError> for RenderError {
    fn from(err: ConfigError) -> Self {
        RenderError::InvalidArgument(err.to_string())
    }
}

/// What to do after the device is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Try to recover at the start of the next frame instead of waiting for
    /// an explicit restore.
    pub auto_recover: bool,
    /// Consecutive failed automatic attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            auto_recover: false,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub backend: BackendType,
    /// Fall back to another compiled backend when the requested one fails.
    pub allow_backend_fallback: bool,
    pub vsync: bool,
    pub clear_color: [f32; 4],
    pub frustum_culling: bool,
    pub batching: bool,
    /// Frames in the FPS moving average.
    pub stats_window: usize,
    pub acquire_timeout_ms: u64,
    /// Recreate an out-of-date swapchain on the next frame without waiting
    /// for `resize`.
    pub auto_recreate_swapchain: bool,
    pub recovery: RecoveryConfig,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Wgpu,
            allow_backend_fallback: true,
            vsync: true,
            clear_color: [0.1, 0.1, 0.12, 1.0],
            frustum_culling: true,
            batching: true,
            stats_window: DEFAULT_STATS_WINDOW,
            acquire_timeout_ms: 1000,
            auto_recreate_swapchain: true,
            recovery: RecoveryConfig::default(),
        }
    }
}

impl RendererConfig {
    /// Defaults with the Dummy backend and no fallback, for tests and
    /// headless tools.
    pub fn headless() -> Self {
        Self::default()
            .with_backend(BackendType::Dummy)
            .with_backend_fallback(false)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load `path`, or fall back to defaults when it is missing or invalid.
    pub fn from_file_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path.as_ref()) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Using default renderer config: {}", err);
                Self::default()
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml_string()?).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_STATS_WINDOW).contains(&self.stats_window) {
            return Err(invalid(
                "stats_window",
                format!("must be between 1 and {}", MAX_STATS_WINDOW),
            ));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(invalid("acquire_timeout_ms", "must be greater than 0"));
        }
        if self
            .clear_color
            .iter()
            .any(|c| !c.is_finite() || !(0.0..=1.0).contains(c))
        {
            return Err(invalid("clear_color", "components must be within 0.0..=1.0"));
        }
        if self.recovery.auto_recover && self.recovery.max_attempts == 0 {
            return Err(invalid(
                "recovery.max_attempts",
                "must be at least 1 when auto_recover is enabled",
            ));
        }
        Ok(())
    }

    pub fn presentation_config(&self) -> PresentationConfig {
        PresentationConfig {
            vsync: self.vsync,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
        }
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_backend_fallback(mut self, allow: bool) -> Self {
        self.allow_backend_fallback = allow;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    pub fn with_frustum_culling(mut self, enabled: bool) -> Self {
        self.frustum_culling = enabled;
        self
    }

    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    pub fn with_stats_window(mut self, frames: usize) -> Self {
        self.stats_window = frames;
        self
    }

    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = timeout_ms;
        self
    }

    pub fn with_auto_recreate_swapchain(mut self, enabled: bool) -> Self {
        self.auto_recreate_swapchain = enabled;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, BackendType::Wgpu);
        assert_eq!(config.stats_window, 60);
        assert!(!config.recovery.auto_recover);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RendererConfig::from_toml_str(
            r#"
            backend = "vulkan"
            vsync = false

            [recovery]
            auto_recover = true
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendType::Vulkan);
        assert!(!config.vsync);
        assert!(config.recovery.auto_recover);
        assert_eq!(config.recovery.max_attempts, 3);
        assert!(config.frustum_culling);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RendererConfig::headless().with_clear_color([0.0, 0.5, 1.0, 1.0]);
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("backend = \"dummy\""));
        assert_eq!(RendererConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let err = RendererConfig::default()
            .with_stats_window(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "stats_window"));

        let err = RendererConfig::default()
            .with_clear_color([2.0, 0.0, 0.0, 1.0])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "clear_color"));

        assert!(RendererConfig::from_toml_str("backend = \"metal\"").is_err());
        assert!(matches!(
            RendererConfig::from_toml_str("acquire_timeout_ms = 0"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let config = RendererConfig::from_file_or_default("/nonexistent/renderer.toml");
        assert_eq!(config, RendererConfig::default());
        assert!(matches!(
            RendererConfig::from_file("/nonexistent/renderer.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
