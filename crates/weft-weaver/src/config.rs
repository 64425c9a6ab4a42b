//! Weaver configuration (weft.toml)
//!
//! Loading the file from the agent's environment is the host's job; this
//! module only owns the typed value and its validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read weaver config: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse weaver config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid weaver config: {0}")]
    ValidationError(String),
}

/// Weaver settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeaverConfig {
    /// Master switch; when false every class passes through untouched
    pub enabled: bool,

    /// Prefix of injected field names (default: "weft$")
    pub field_prefix: String,

    /// Run the structural verifier on every woven class
    pub verify_output: bool,

    /// Upper bound on cached weave results; new results are dropped once reached
    pub max_cached_classes: usize,

    /// Operand stack bound enforced when computing frames
    pub max_stack: u16,

    /// Internal-name prefixes that are never instrumented
    pub excluded_prefixes: Vec<String>,

    /// Patch modules to skip at catalog load
    pub disabled_modules: Vec<String>,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            field_prefix: "weft$".to_string(),
            verify_output: true,
            max_cached_classes: 65_536,
            max_stack: 1024,
            excluded_prefixes: vec!["weft/".to_string(), "java/lang/".to_string()],
            disabled_modules: Vec::new(),
        }
    }
}

impl WeaverConfig {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: WeaverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.field_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "field_prefix cannot be empty".to_string(),
            ));
        }

        // Injected names must stay valid member identifiers
        if !self
            .field_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
            || self.field_prefix.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(ConfigError::ValidationError(format!(
                "Invalid field_prefix: {}. Must contain only alphanumeric characters, '_' and '$'",
                self.field_prefix
            )));
        }

        if self.max_stack == 0 {
            return Err(ConfigError::ValidationError(
                "max_stack must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether `class` falls under an excluded prefix
    pub fn is_excluded(&self, class: &str) -> bool {
        self.excluded_prefixes
            .iter()
            .any(|prefix| class.starts_with(prefix.as_str()))
    }

    /// Whether the named patch module is disabled
    pub fn is_module_disabled(&self, module: &str) -> bool {
        self.disabled_modules.iter().any(|m| m == module)
    }
}
