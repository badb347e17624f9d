//! Replication intake configuration.

use crate::error::ConfigError;
use crate::history::DEFAULT_MAX_HISTORY;

/// Configuration shared by every intake on a node.
///
/// # Example
///
/// ```
/// use replikit::ReplicationConfig;
///
/// let config = ReplicationConfig::builder().max_history(8).build().unwrap();
/// assert_eq!(config.max_history, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReplicationConfig {
    /// Upper bound on `replication-history` length.
    pub max_history: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

impl ReplicationConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> ReplicationConfigBuilder {
        ReplicationConfigBuilder {
            config: Self::default(),
        }
    }

    /// Check the configuration for values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_history == 0 {
            return Err(ConfigError::ZeroHistory);
        }
        Ok(())
    }

    /// Parse and validate a TOML document. Missing fields take their defaults.
    #[cfg(feature = "serde")]
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for [`ReplicationConfig`].
#[derive(Debug, Clone)]
pub struct ReplicationConfigBuilder {
    config: ReplicationConfig,
}

impl ReplicationConfigBuilder {
    /// Set the history bound.
    pub fn max_history(mut self, max_history: usize) -> Self {
        self.config.max_history = max_history;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ReplicationConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
