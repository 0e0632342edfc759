use std::time::Duration;

use config::Config;
use serde::Deserialize;

use crate::announcer::AnnouncerConfig;
use crate::utils::error::ServerError;

/// Configuration settings for the stream gate.
///
/// Every field has a default matching the original service constants, so an
/// empty environment yields a runnable configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// The port on which the server will listen. Port 0 binds an ephemeral
    /// port, observable through `Server::local_addr`.
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// The maximum number of simultaneous client sessions allowed.
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    /// Inactivity window after which a session is unilaterally disconnected.
    #[serde(default = "defaults::client_timeout_ms")]
    pub client_timeout_ms: u64,
    /// How long one accept attempt waits before the loop turns to cleanup.
    #[serde(default = "defaults::accept_timeout_ms")]
    pub accept_timeout_ms: u64,
    /// Bounded wait for read readiness inside a session pass.
    #[serde(default = "defaults::read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Polling interval of the cooperative loops.
    #[serde(default = "defaults::tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Connect attempts allowed per second per source address.
    #[serde(default = "defaults::connection_rate_limit")]
    pub connection_rate_limit: u32,
    /// Payload broadcast by the presence announcer.
    #[serde(default = "defaults::announce_payload")]
    pub announce_payload: String,
    /// Destination port of announcer datagrams.
    #[serde(default = "defaults::announce_port")]
    pub announce_port: u16,
    /// Number of successfully sent announcements before the announcer goes
    /// silent until the next disconnect/reconnect renewal.
    #[serde(default = "defaults::announce_max_attempts")]
    pub announce_max_attempts: u32,
    /// Minimum spacing between two announcements.
    #[serde(default = "defaults::announce_retry_ms")]
    pub announce_retry_ms: u64,
    /// Polling interval of the announcer loop.
    #[serde(default = "defaults::announce_tick_ms")]
    pub announce_tick_ms: u64,
}

mod defaults {
    pub fn port() -> u16 {
        10303
    }
    pub fn max_connections() -> usize {
        16
    }
    pub fn client_timeout_ms() -> u64 {
        600_000
    }
    pub fn accept_timeout_ms() -> u64 {
        1000
    }
    pub fn read_timeout_ms() -> u64 {
        5
    }
    pub fn tick_interval_ms() -> u64 {
        5
    }
    pub fn connection_rate_limit() -> u32 {
        64
    }
    pub fn announce_payload() -> String {
        concat!("streamgate ", env!("CARGO_PKG_VERSION")).to_string()
    }
    pub fn announce_port() -> u16 {
        3055
    }
    pub fn announce_max_attempts() -> u32 {
        11
    }
    pub fn announce_retry_ms() -> u64 {
        5000
    }
    pub fn announce_tick_ms() -> u64 {
        300
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            max_connections: defaults::max_connections(),
            client_timeout_ms: defaults::client_timeout_ms(),
            accept_timeout_ms: defaults::accept_timeout_ms(),
            read_timeout_ms: defaults::read_timeout_ms(),
            tick_interval_ms: defaults::tick_interval_ms(),
            connection_rate_limit: defaults::connection_rate_limit(),
            announce_payload: defaults::announce_payload(),
            announce_port: defaults::announce_port(),
            announce_max_attempts: defaults::announce_max_attempts(),
            announce_retry_ms: defaults::announce_retry_ms(),
            announce_tick_ms: defaults::announce_tick_ms(),
        }
    }
}

impl ServerConfig {
    /// Loads the configuration from environment variables.
    ///
    /// Environment variables are prefixed with `SG_`; unset variables fall
    /// back to their defaults.
    ///
    /// # Errors
    /// Returns `ServerError::Configuration` if the environment cannot be
    /// parsed into a configuration.
    pub fn from_env() -> Result<Self, ServerError> {
        Config::builder()
            .add_source(config::Environment::with_prefix("SG"))
            .build()
            .map_err(|e| ServerError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| ServerError::Configuration(e.to_string()))
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns `ServerError::Configuration` if validation fails.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.max_connections > 10_000 {
            return Err(ServerError::Configuration(
                "max_connections cannot exceed 10,000".into(),
            ));
        }
        if self.tick_interval_ms == 0 || self.announce_tick_ms == 0 {
            return Err(ServerError::Configuration(
                "tick intervals must be greater than 0".into(),
            ));
        }
        if self.accept_timeout_ms == 0 {
            return Err(ServerError::Configuration(
                "accept_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.announce_payload.is_empty() {
            return Err(ServerError::Configuration(
                "announce_payload must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// The announcer's slice of this configuration.
    pub fn announcer(&self) -> AnnouncerConfig {
        AnnouncerConfig {
            payload: self.announce_payload.clone().into_bytes(),
            port: self.announce_port,
            max_attempts: self.announce_max_attempts,
            retry_interval: Duration::from_millis(self.announce_retry_ms),
            tick_interval: Duration::from_millis(self.announce_tick_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.port, 10303);
        assert_eq!(config.announce_port, 3055);
        assert_eq!(config.client_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = ServerConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_payload_is_rejected() {
        let config = ServerConfig {
            announce_payload: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
