//! Configuration for the session SDK

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Restart behavior for one transport connector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportPolicy {
    /// Begin transport creation as soon as the router device is ready,
    /// without an explicit start() (default: false)
    pub eager_start: bool,

    /// Schedule a full restart when remote creation fails and the budget
    /// allows (default: false)
    pub restart_on_fail: bool,

    /// How long to wait for the remote "transport created" acknowledgement,
    /// milliseconds (default: 10000)
    pub remote_wait_timeout_ms: u64,

    /// Base delay before a scheduled restart, milliseconds; the actual delay
    /// is randomized within ±500ms of this (default: 2000)
    pub restart_delay_ms: u64,

    /// Restart budget while first connecting (default: 2)
    pub restart_max_initial: u32,

    /// Restart budget once the transport has been running (default: 5)
    pub restart_max: u32,

    /// ICE restart attempts before the leg is declared failed (default: 3)
    pub ice_restart_max: u32,

    /// How long a connection must stay up before the restart counter is
    /// cleared, milliseconds (default: 10000)
    pub stable_timeout_ms: u64,
}

impl Default for TransportPolicy {
    fn default() -> Self {
        Self {
            eager_start: false,
            restart_on_fail: false,
            remote_wait_timeout_ms: 10_000,
            restart_delay_ms: 2_000,
            restart_max_initial: 2,
            restart_max: 5,
            ice_restart_max: 3,
            stable_timeout_ms: 10_000,
        }
    }
}

impl TransportPolicy {
    /// Policy for the receiving side: starts eagerly and heals itself
    pub fn recv() -> Self {
        Self {
            eager_start: true,
            restart_on_fail: true,
            ..Default::default()
        }
    }

    /// Policy for the sending side: started explicitly once permissions allow
    pub fn send() -> Self {
        Self {
            eager_start: false,
            ..Default::default()
        }
    }

    /// Set the remote-acknowledgement wait timeout
    pub fn with_remote_wait_timeout(mut self, timeout: Duration) -> Self {
        self.remote_wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the base restart delay
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn remote_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_wait_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stable_timeout(&self) -> Duration {
        Duration::from_millis(self.stable_timeout_ms)
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.remote_wait_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "remote_wait_timeout_ms must be positive".to_string(),
            ));
        }
        if self.restart_max < self.restart_max_initial {
            return Err(Error::InvalidConfig(
                "restart_max must be >= restart_max_initial".to_string(),
            ));
        }
        Ok(())
    }
}

/// An ICE server entry handed to the media engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE candidate gathering policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    #[default]
    All,
    Relay,
}

/// Top-level session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// REST API host used to provision session parameters
    pub api_host: String,

    /// Bearer token for provisioning and signaling, if required
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Timeout for one signaling request/acknowledgement round trip,
    /// milliseconds (default: 15000)
    pub request_timeout_ms: u64,

    /// Overall connect timeout, milliseconds (default: 30000)
    pub connect_timeout_ms: u64,

    /// Re-join automatically after a server-initiated reconnect
    pub auto_rejoin: bool,

    /// Receiving transport policy
    pub recv_transport: TransportPolicy,

    /// Sending transport policy
    pub send_transport: TransportPolicy,

    /// ICE servers; usually filled in from the provisioning response
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,

    #[serde(default)]
    pub ice_transport_policy: IceTransportPolicy,

    /// Retry policy for the provisioning round trips
    #[serde(skip)]
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            api_host: "https://api.example.com".to_string(),
            auth_token: None,
            request_timeout_ms: 15_000,
            connect_timeout_ms: 30_000,
            auto_rejoin: true,
            recv_transport: TransportPolicy::recv(),
            send_transport: TransportPolicy::send(),
            ice_servers: Vec::new(),
            ice_transport_policy: IceTransportPolicy::All,
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(api_host: impl Into<String>) -> Self {
        Self {
            api_host: api_host.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_ice_servers(mut self, ice_servers: Vec<IceServer>) -> Self {
        self.ice_servers = ice_servers;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_host.is_empty() {
            return Err(Error::InvalidConfig("api_host must not be empty".to_string()));
        }
        if !self.api_host.starts_with("http://") && !self.api_host.starts_with("https://") {
            return Err(Error::InvalidConfig(
                "api_host must be an http(s) URL".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        self.recv_transport.validate()?;
        self.send_transport.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SessionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_api_host() {
        let config = SessionConfig::new("not-a-url");
        assert!(config.validate().is_err());

        let config = SessionConfig::new("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_policy_presets() {
        let recv = TransportPolicy::recv();
        assert!(recv.eager_start);
        assert!(recv.restart_on_fail);

        let send = TransportPolicy::send();
        assert!(!send.eager_start);
        assert!(!send.restart_on_fail);
    }

    #[test]
    fn test_transport_policy_budget_validation() {
        let policy = TransportPolicy {
            restart_max_initial: 10,
            restart_max: 2,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = SessionConfig::new("https://api.test").with_auth_token("tok");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SessionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.api_host, "https://api.test");
        assert_eq!(parsed.auth_token.as_deref(), Some("tok"));
        assert!(parsed.recv_transport.eager_start);
    }
}
