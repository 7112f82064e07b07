//! # Engine Configuration
//!
//! Serializable configuration for the renderer core. Files are loaded by
//! extension: `.toml` through `toml`, `.ron` through `ron`.
//!
//! Every field has a default, so a config file only needs to name the values it
//! overrides:
//!
//! ```toml
//! log_level = "debug"
//!
//! [renderer]
//! application_name = "Terra Probe"
//! frames_in_flight = 3
//! ```

use ash::vk;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Upper bound on frames in flight; deeper pipelines only add latency
pub const MAX_FRAMES_IN_FLIGHT: u32 = 8;

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        format.parse(&contents)
    }

    /// Save configuration to file
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = ConfigFormat::from_path(path)?.serialize(self)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is outside its accepted range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk configuration formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// TOML document
    Toml,
    /// Rusty Object Notation document
    Ron,
}

impl ConfigFormat {
    /// Pick the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("ron") => Ok(Self::Ron),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }

    /// Parse a document in this format
    pub fn parse<T: for<'de> Deserialize<'de>>(self, contents: &str) -> Result<T, ConfigError> {
        match self {
            Self::Toml => toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string())),
            Self::Ron => ron::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string())),
        }
    }

    /// Serialize a value in this format
    pub fn serialize<T: Serialize>(self, value: &T) -> Result<String, ConfigError> {
        match self {
            Self::Toml => {
                toml::to_string_pretty(value).map_err(|e| ConfigError::Serialize(e.to_string()))
            }
            Self::Ron => ron::ser::to_string_pretty(value, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string())),
        }
    }
}

/// Surface extent in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceExtent {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Default for SurfaceExtent {
    fn default() -> Self {
        Self { width: 1920, height: 1080 }
    }
}

/// # Renderer Configuration
///
/// Settings consumed by the lifecycle bring-up: instance metadata, the depth of
/// the frame pipeline and the timeout applied to every fence wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Frames in flight; also the swapchain buffer count and descriptor set count
    pub frames_in_flight: u32,
    /// Sync slots on the transfer queue
    pub transfer_slots: u32,
    /// Timeout for a single fence wait, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Initial surface extent
    pub extent: SurfaceExtent,
    /// Whether to enable Vulkan validation layers (`None` follows the build type)
    pub enable_validation: Option<bool>,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Set frames in flight
    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    #[must_use]
    pub const fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set the initial surface extent
    #[must_use]
    pub const fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = SurfaceExtent { width, height };
        self
    }

    /// Whether validation should be requested, resolving the automatic setting
    pub fn validation_requested(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Initial extent as a Vulkan extent
    pub const fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("application name cannot be empty".to_string()));
        }
        if self.frames_in_flight == 0 || self.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::Invalid(format!(
                "frames in flight must be within 1..={MAX_FRAMES_IN_FLIGHT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.transfer_slots == 0 {
            return Err(ConfigError::Invalid("transfer slots must be at least 1".to_string()));
        }
        if self.fence_timeout_ns == 0 {
            return Err(ConfigError::Invalid("fence timeout must be non-zero".to_string()));
        }
        if self.extent.width == 0 || self.extent.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "extent must be non-zero, got {}x{}",
                self.extent.width, self.extent.height
            )));
        }
        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: "Terra".to_string(),
            frames_in_flight: 2,
            transfer_slots: 1,
            fence_timeout_ns: 1_000_000_000,
            extent: SurfaceExtent::default(),
            enable_validation: None,
        }
    }
}

/// # Complete Engine Configuration
///
/// Top-level configuration loaded by applications and tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default log filter, overridden by `RUST_LOG`
    pub log_level: String,
    /// Rendering core configuration
    pub renderer: RendererConfig,
}

impl EngineConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::Invalid(format!("unknown log level '{}'", self.log_level)));
        }
        self.renderer.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            renderer: RendererConfig::default(),
        }
    }
}

impl Config for EngineConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.renderer.frames_in_flight, 2);
        assert_eq!(config.renderer.transfer_slots, 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig = ConfigFormat::Toml
            .parse(
                r#"
                log_level = "debug"

                [renderer]
                application_name = "Probe"
                frames_in_flight = 3
                "#,
            )
            .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.renderer.application_name, "Probe");
        assert_eq!(config.renderer.frames_in_flight, 3);
        assert_eq!(config.renderer.fence_timeout_ns, 1_000_000_000);
        assert_eq!(config.renderer.extent, SurfaceExtent::default());
    }

    #[test]
    fn test_ron_config() {
        let config: EngineConfig = ConfigFormat::Ron
            .parse("(renderer: (frames_in_flight: 4, extent: (width: 800, height: 600)))")
            .unwrap();

        assert_eq!(config.renderer.frames_in_flight, 4);
        assert_eq!(config.renderer.extent(), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn test_serialize_then_parse_toml() {
        let config = EngineConfig {
            log_level: "warn".to_string(),
            renderer: RendererConfig::new("Saved").with_validation(false),
        };
        let text = ConfigFormat::Toml.serialize(&config).unwrap();
        let parsed: EngineConfig = ConfigFormat::Toml.parse(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            RendererConfig::default().with_frames_in_flight(0).validate(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RendererConfig::default().with_frames_in_flight(MAX_FRAMES_IN_FLIGHT + 1).validate(),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RendererConfig::default().with_extent(0, 600).validate(),
            Err(ConfigError::Invalid(_))
        ));

        let config = EngineConfig {
            log_level: "loud".to_string(),
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unsupported_extension() {
        let result = EngineConfig::load_from_file("engine.json");
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_validation_override() {
        assert!(RendererConfig::default().with_validation(true).validation_requested());
        assert!(!RendererConfig::default().with_validation(false).validation_requested());
    }
}
