//! Configuration for secure channel endpoints.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $UASC_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/uasc/config.toml
//!   3. ~/.config/uasc/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::builder::{BuilderOptions, SequenceGapPolicy};
use crate::crypto::{MessageSecurityMode, SecurityPolicy};
use crate::wire::{DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UascConfig {
    pub limits: LimitsConfig,
    pub security: SecurityConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Size of chunks we send. Never below 8192 on a real connection.
    pub chunk_size: usize,
    /// Largest reassembled message. 0 = unlimited.
    pub max_message_size: usize,
    /// Most chunks per message. 0 = unlimited.
    pub max_chunk_count: usize,
    /// Largest chunk accepted from the stream. 0 = unlimited.
    pub max_chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub policy_uri: String,
    pub mode: MessageSecurityMode,
    pub sequence_gap_policy: SequenceGapPolicy,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Only accept chunks for this secure channel id.
    pub expected_channel_id: Option<u32>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_message_size: 16 * 1024 * 1024,
            max_chunk_count: 0,
            max_chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            policy_uri: SecurityPolicy::None.uri(),
            mode: MessageSecurityMode::None,
            sequence_gap_policy: SequenceGapPolicy::Notify,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("uasc")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl UascConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            UascConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("UASC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&UascConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply UASC_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let number = |key: &str| lookup(key).and_then(|v| v.parse::<usize>().ok());
        if let Some(v) = number("UASC_LIMITS__CHUNK_SIZE") {
            self.limits.chunk_size = v;
        }
        if let Some(v) = number("UASC_LIMITS__MAX_MESSAGE_SIZE") {
            self.limits.max_message_size = v;
        }
        if let Some(v) = number("UASC_LIMITS__MAX_CHUNK_COUNT") {
            self.limits.max_chunk_count = v;
        }
        if let Some(v) = number("UASC_LIMITS__MAX_CHUNK_SIZE") {
            self.limits.max_chunk_size = v;
        }
        if let Some(v) = lookup("UASC_SECURITY__POLICY_URI") {
            self.security.policy_uri = v;
        }
        if let Some(v) = lookup("UASC_SECURITY__MODE") {
            match v.as_str() {
                "None" | "none" => self.security.mode = MessageSecurityMode::None,
                "Sign" | "sign" => self.security.mode = MessageSecurityMode::Sign,
                "SignAndEncrypt" | "sign_and_encrypt" => {
                    self.security.mode = MessageSecurityMode::SignAndEncrypt
                }
                _ => {}
            }
        }
        if let Some(v) = lookup("UASC_SECURITY__REJECT_SEQUENCE_GAPS") {
            self.security.sequence_gap_policy = if v == "true" || v == "1" {
                SequenceGapPolicy::Reject
            } else {
                SequenceGapPolicy::Notify
            };
        }
        if let Some(v) = lookup("UASC_CHANNEL__EXPECTED_CHANNEL_ID") {
            self.channel.expected_channel_id = v.parse().ok();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size {} is below the minimum of {MIN_CHUNK_SIZE}",
                self.limits.chunk_size
            )));
        }
        self.security_policy()?;
        Ok(())
    }

    pub fn security_policy(&self) -> Result<SecurityPolicy, ConfigError> {
        let policy = SecurityPolicy::from_uri(&self.security.policy_uri)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if policy.is_deprecated() {
            return Err(ConfigError::Invalid(format!(
                "security policy {} is deprecated",
                policy.uri()
            )));
        }
        Ok(policy)
    }

    pub fn builder_options(&self) -> BuilderOptions {
        BuilderOptions {
            max_message_size: self.limits.max_message_size,
            max_chunk_count: self.limits.max_chunk_count,
            expected_channel_id: self.channel.expected_channel_id,
            sequence_gap_policy: self.security.sequence_gap_policy,
        }
    }
}
