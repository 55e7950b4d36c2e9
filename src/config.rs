//! Listener and dialer settings
//!
//! Plain serde structs so deployments can keep tuning knobs in a JSON file.
//! Every field has a default, so `{}` is a valid settings document.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::Fingerprint;
use crate::transport::{ChannelRejectPolicy, Network};

/// Channel type used when nothing else is configured
pub const DEFAULT_CHANNEL_TYPE: &str = "http";

/// Default bound on a server-side handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on connect plus handshake when dialing
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default first delay after a failed accept
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);

/// Default ceiling for the accept backoff
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Settings errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Settings file could not be read
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    /// Settings document is not valid JSON for this type
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    /// Values parse but do not make sense together
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Result type for settings operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Server-side tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    /// Channel type names the listener accepts
    pub channel_types: Vec<String>,
    /// Handshake bound in milliseconds
    pub handshake_timeout_ms: u64,
    /// Handler bound in milliseconds, 0 for none
    pub channel_timeout_ms: u64,
    /// First accept backoff delay in milliseconds
    pub accept_backoff_initial_ms: u64,
    /// Accept backoff ceiling in milliseconds
    pub accept_backoff_max_ms: u64,
    /// What to do with the session after rejecting a channel
    pub reject_policy: ChannelRejectPolicy,
    /// Client keys allowed in; empty admits everyone
    pub authorized_keys: Vec<Fingerprint>,
}

impl Default for ListenSettings {
    fn default() -> Self {
        ListenSettings {
            channel_types: vec![DEFAULT_CHANNEL_TYPE.to_string()],
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            channel_timeout_ms: 0,
            accept_backoff_initial_ms: DEFAULT_BACKOFF_INITIAL.as_millis() as u64,
            accept_backoff_max_ms: DEFAULT_BACKOFF_MAX.as_millis() as u64,
            reject_policy: ChannelRejectPolicy::default(),
            authorized_keys: Vec::new(),
        }
    }
}

impl ListenSettings {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read a JSON settings file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> ConfigResult<()> {
        if self.channel_types.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one channel type is required".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake timeout must be positive".to_string(),
            ));
        }
        if self.accept_backoff_initial_ms == 0
            || self.accept_backoff_initial_ms > self.accept_backoff_max_ms
        {
            return Err(ConfigError::Invalid(format!(
                "accept backoff must satisfy 0 < initial ({}) <= max ({})",
                self.accept_backoff_initial_ms, self.accept_backoff_max_ms
            )));
        }
        Ok(())
    }

    /// Handshake bound
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Handler bound, if any
    pub fn channel_timeout(&self) -> Option<Duration> {
        match self.channel_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Client-side tuning
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialSettings {
    /// Address family to dial
    pub network: Network,
    /// Channel type to open
    pub channel_type: String,
    /// Connect plus handshake bound in milliseconds, 0 for none
    pub timeout_ms: u64,
    /// Host keys trusted; empty trusts any host
    pub known_hosts: Vec<Fingerprint>,
}

impl Default for DialSettings {
    fn default() -> Self {
        DialSettings {
            network: Network::Tcp,
            channel_type: DEFAULT_CHANNEL_TYPE.to_string(),
            timeout_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
            known_hosts: Vec::new(),
        }
    }
}

impl DialSettings {
    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let settings: Self = serde_json::from_str(json)?;
        if settings.channel_type.is_empty() {
            return Err(ConfigError::Invalid("channel type is empty".to_string()));
        }
        Ok(settings)
    }

    /// Read a JSON settings file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Connect plus handshake bound; zero means unbounded
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Signer;

    #[test]
    fn test_empty_document_gives_defaults() {
        assert_eq!(ListenSettings::from_json("{}").unwrap(), ListenSettings::default());
        assert_eq!(DialSettings::from_json("{}").unwrap(), DialSettings::default());

        let listen = ListenSettings::default();
        assert_eq!(listen.channel_types, vec!["http".to_string()]);
        assert_eq!(listen.channel_timeout(), None);
        assert_eq!(listen.reject_policy, ChannelRejectPolicy::Continue);
    }

    #[test]
    fn test_listen_settings_parse() {
        let fp = Signer::from_seed(&[3u8; 32]).fingerprint();
        let json = format!(
            r#"{{
                "channel_types": ["http", "grpc"],
                "channel_timeout_ms": 2500,
                "reject_policy": "disconnect",
                "authorized_keys": ["{}"]
            }}"#,
            fp
        );

        let settings = ListenSettings::from_json(&json).unwrap();
        assert_eq!(settings.channel_types.len(), 2);
        assert_eq!(settings.channel_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(settings.reject_policy, ChannelRejectPolicy::Disconnect);
        assert_eq!(settings.authorized_keys, vec![fp]);
        assert_eq!(settings.handshake_timeout(), DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn test_invalid_listen_settings() {
        assert!(matches!(
            ListenSettings::from_json(r#"{"channel_types": []}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ListenSettings::from_json(r#"{"accept_backoff_initial_ms": 5000}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ListenSettings::from_json(r#"{"authorized_keys": ["MD5:00"]}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_dial_settings_parse() {
        let settings =
            DialSettings::from_json(r#"{"network": "tcp6", "timeout_ms": 0}"#).unwrap();
        assert_eq!(settings.network, Network::Tcp6);
        assert_eq!(settings.timeout(), Duration::ZERO);
        assert_eq!(settings.channel_type, DEFAULT_CHANNEL_TYPE);
    }
}
