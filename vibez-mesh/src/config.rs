//! Mesh configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::media::CaptureConstraints;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub mesh: MeshConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// A STUN or TURN relay handed to every peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    #[must_use]
    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Audio level detector tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Sampling period of the frequency analyser
    pub poll_interval_ms: u64,
    /// How long energy must stay below the threshold before "not speaking" fires
    pub silence_delay_ms: u64,
    /// Average byte-frequency energy (0-255) above which the user is speaking
    pub threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            silence_delay_ms: 300,
            threshold: 30.0,
        }
    }
}

impl DetectorConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn silence_delay(&self) -> Duration {
        Duration::from_millis(self.silence_delay_ms)
    }
}

/// Mesh coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Public STUN relays followed by the TURN fallback
    pub ice_servers: Vec<IceServerConfig>,
    /// Global topic used as a fallback relay for addressed signaling
    pub relay_topic: String,
    /// Constraints requested when the microphone is acquired
    pub capture: CaptureConstraints,
    pub detector: DetectorConfig,
    /// Whether an incoming offer may switch a listener into speaking mode
    pub promote_on_offer: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServerConfig::stun("stun:stun.l.google.com:19302"),
                IceServerConfig::stun("stun:stun1.l.google.com:19302"),
                IceServerConfig::stun("stun:stun2.l.google.com:19302"),
                IceServerConfig {
                    urls: vec!["turn:openrelay.metered.ca:80".to_string()],
                    username: Some("openrelayproject".to_string()),
                    credential: Some("openrelayproject".to_string()),
                },
            ],
            relay_topic: "webrtc-signaling".to_string(),
            capture: CaptureConstraints::default(),
            detector: DetectorConfig::default(),
            promote_on_offer: true,
        }
    }
}

impl MeshConfig {
    /// Check the configuration for values the mesh cannot work with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.ice_servers.is_empty() {
            errors.push("mesh.ice_servers must contain at least one server".to_string());
        }
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                errors.push("mesh.ice_servers entry has no urls".to_string());
            }
            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                errors.push(format!(
                    "TURN server {:?} requires username and credential",
                    server.urls
                ));
            }
        }
        if self.relay_topic.trim().is_empty() {
            errors.push("mesh.relay_topic must not be empty".to_string());
        }
        if self.detector.poll_interval_ms == 0 {
            errors.push("mesh.detector.poll_interval_ms must be positive".to_string());
        }
        if !(0.0..=255.0).contains(&self.detector.threshold) {
            errors.push("mesh.detector.threshold must be within 0..=255".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // VIBEZ_MESH__RELAY_TOPIC, VIBEZ_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("VIBEZ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }
}
