//! Server configuration.
//!
//! Configs are JSON documents. Every field is optional:
//!
//! ```json
//! {
//!     "name": "sandbox",
//!     "fixed_timestep": 0.02,
//!     "max_fixed_steps": 4,
//!     "features": ["TimerFeature"],
//!     "scenes": ["main"]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Environment variable naming a config file, consulted when no path is
/// given explicitly.
pub const CONFIG_ENV: &str = "ENGINE_CONFIG";

/// Default fixed-update step, in seconds.
pub const DEFAULT_FIXED_TIMESTEP: f64 = 1.0 / 60.0;

/// Default cap on fixed-update steps per frame.
pub const DEFAULT_MAX_FIXED_STEPS: u32 = 8;

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Human-readable server name, used in logs.
    pub name: String,
    /// Length of one FixedUpdate step, in seconds.
    pub fixed_timestep: f64,
    /// Most FixedUpdate steps run in one frame. Time beyond the cap is
    /// dropped.
    pub max_fixed_steps: u32,
    /// Feature type names constructed through the type registry at startup.
    pub features: Vec<String>,
    /// Names of empty scenes created and opened at startup.
    pub scenes: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "engine".to_string(),
            fixed_timestep: DEFAULT_FIXED_TIMESTEP,
            max_fixed_steps: DEFAULT_MAX_FIXED_STEPS,
            features: Vec::new(),
            scenes: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Create a default config with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_fixed_timestep(mut self, seconds: f64) -> Self {
        self.fixed_timestep = seconds;
        self
    }

    #[must_use]
    pub fn with_max_fixed_steps(mut self, steps: u32) -> Self {
        self.max_fixed_steps = steps;
        self
    }

    /// Add a feature type to construct at startup.
    #[must_use]
    pub fn with_feature(mut self, type_name: impl Into<String>) -> Self {
        self.features.push(type_name.into());
        self
    }

    /// Add a scene to open at startup.
    #[must_use]
    pub fn with_scene(mut self, name: impl Into<String>) -> Self {
        self.scenes.push(name.into());
        self
    }

    /// Parse and validate a JSON config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and the
    /// [`ServerConfig::validate`] errors for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise see
    /// [`ServerConfig::from_json_str`].
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), name = %config.name, "loaded server config");
        Ok(config)
    }

    /// Load from `path`, else from the file named by [`CONFIG_ENV`], else
    /// fall back to defaults.
    ///
    /// # Errors
    ///
    /// See [`ServerConfig::from_path`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_path(path),
            _ => {
                debug!("no config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTimestep`] or
    /// [`ConfigError::InvalidStepCap`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.fixed_timestep.is_finite() || self.fixed_timestep <= 0.0 {
            return Err(ConfigError::InvalidTimestep(self.fixed_timestep));
        }
        if self.max_fixed_steps == 0 {
            return Err(ConfigError::InvalidStepCap);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = ServerConfig::from_json_str(r#"{ "name": "sandbox" }"#).unwrap();
        assert_eq!(config.name, "sandbox");
        assert_eq!(config.max_fixed_steps, DEFAULT_MAX_FIXED_STEPS);
        assert!((config.fixed_timestep - DEFAULT_FIXED_TIMESTEP).abs() < f64::EPSILON);
        assert!(config.features.is_empty());
        assert_eq!(ServerConfig::from_json_str("{}").unwrap(), ServerConfig::default());
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::new("game")
            .with_fixed_timestep(0.5)
            .with_max_fixed_steps(2)
            .with_feature("TimerFeature")
            .with_scene("main");
        assert_eq!(config.name, "game");
        assert_eq!(config.features, vec!["TimerFeature"]);
        assert_eq!(config.scenes, vec!["main"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            ServerConfig::from_json_str(r#"{ "fixed_timestep": 0 }"#),
            Err(ConfigError::InvalidTimestep(_))
        ));
        assert!(matches!(
            ServerConfig::from_json_str(r#"{ "max_fixed_steps": 0 }"#),
            Err(ConfigError::InvalidStepCap)
        ));
        assert!(matches!(
            ServerConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_from_path() {
        let path = std::env::temp_dir().join(format!("engine-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "scenes": ["a", "b"] }"#).unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.scenes, vec!["a", "b"]);

        let missing = ServerConfig::from_path(&path).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
