//! Engine configuration types.
//!
//! The configuration is normally read from an `xlat.toml` file. Every field has a
//! default, so an empty file (or no file at all) yields a usable engine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Default file name looked up by the CLI.
pub const CONFIG_FILE_NAME: &str = "xlat.toml";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Addresses of the dispatcher entry points installed in every thread context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookAddrs {
    /// Where generated code returns to the dispatcher loop.
    pub dispatcher_return: u32,
    /// Indirect-jump resolution routine (jump cache probe).
    pub indirect_jump: u32,
    /// Fragment exit routine; reads the next guest address from the context.
    pub fragment_exit: u32,
}

/// Fragment translator settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Start of the trusted runtime code region.
    pub runtime_code_start: u32,
    /// Size of the trusted runtime code region (0 = none).
    pub runtime_code_size: u32,
}

impl TranslatorConfig {
    /// Whether `addr` lies inside the trusted runtime code region.
    pub fn in_runtime_code(&self, addr: u32) -> bool {
        addr.wrapping_sub(self.runtime_code_start) < self.runtime_code_size
    }
}

/// Thread context settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Hard cap on concurrently live guest threads.
    pub max_threads: usize,
    /// Address hint for the context arena. Must leave the arena below 4 GiB.
    pub region_base: u64,
    /// Pages reserved for the signal-handling stack of each context.
    pub signal_stack_pages: usize,
    pub hooks: HookAddrs,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_threads: 32,
            region_base: 0x6000_0000,
            signal_stack_pages: 4,
            hooks: HookAddrs::default(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub translator: TranslatorConfig,
    pub threads: ContextConfig,
    /// Log a listing of every translated fragment at debug level.
    pub trace: bool,
}

impl EngineConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load `path` if it exists, otherwise fall back to the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write the configuration to `path`, refusing to clobber an existing file.
    pub fn save_new(&self, path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Err(ConfigError::Invalid(format!(
                "{} already exists",
                path.display()
            )));
        }
        let content = self.to_toml_string()?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads.max_threads == 0 {
            return Err(ConfigError::Invalid("threads.max_threads must be > 0".into()));
        }
        if self.threads.region_base > u64::from(u32::MAX) {
            return Err(ConfigError::Invalid(
                "threads.region_base must lie below 4 GiB".into(),
            ));
        }
        let start = self.translator.runtime_code_start;
        if start.checked_add(self.translator.runtime_code_size).is_none() {
            return Err(ConfigError::Invalid(
                "translator runtime code region wraps the address space".into(),
            ));
        }
        Ok(())
    }
}
