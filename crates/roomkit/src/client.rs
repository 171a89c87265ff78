//! Session bootstrap
//!
//! Provisions session parameters over the REST API (with bounded retries),
//! dials the signaling websocket and hands back an [`RtcSession`].

use std::sync::Arc;

use anyhow::anyhow;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{IceServer, SessionConfig};
use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::retry::retry;
use crate::session::RtcSession;
use crate::signaling::{SignalConnection, WsSignalConnection};

/// Provisioning response for one session
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    /// Websocket endpoint to dial
    pub signal_url: String,
    /// ICE servers the media plane wants us to use
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    /// Short-lived signaling token; falls back to the API auth token
    #[serde(default)]
    pub session_token: Option<String>,
}

/// Entry point: provisions and connects sessions
pub struct RoomClient {
    http: reqwest::Client,
    config: SessionConfig,
}

impl RoomClient {
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self { http, config })
    }

    /// Provision session parameters for `room`. Network failures and server
    /// errors are retried per the configured policy; rejections are not.
    pub async fn provision(&self, room: &str) -> Result<SessionDescriptor> {
        let url = format!(
            "{}/v1/rooms/{}/sessions",
            self.config.api_host.trim_end_matches('/'),
            room
        );
        retry(&self.config.retry, Error::is_retryable, || async {
            debug!(%url, "provisioning session");
            let mut request = self.http.post(&url);
            if let Some(token) = &self.config.auth_token {
                request = request.bearer_auth(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::Http(e.to_string()))?;
            let status = response.status();
            if status.is_server_error() {
                return Err(Error::Http(format!("provisioning failed with {status}")));
            }
            if !status.is_success() {
                return Err(Error::Other(anyhow!("provisioning rejected with {status}")));
            }
            response
                .json::<SessionDescriptor>()
                .await
                .map_err(|e| Error::Http(e.to_string()))
        })
        .await
    }

    /// Provision, dial signaling and build the session, all bounded by the
    /// configured connect timeout
    pub async fn connect(&self, room: &str, engine: Arc<dyn MediaEngine>) -> Result<RtcSession> {
        let session = tokio::time::timeout(self.config.connect_timeout(), async {
            let descriptor = self.provision(room).await?;
            let mut config = self.config.clone();
            if config.ice_servers.is_empty() {
                config.ice_servers = descriptor.ice_servers;
            }
            let token = descriptor
                .session_token
                .as_deref()
                .or(config.auth_token.as_deref());
            let conn =
                WsSignalConnection::connect(&descriptor.signal_url, token, config.request_timeout())
                    .await?;
            RtcSession::new(Arc::new(conn) as Arc<dyn SignalConnection>, engine, config)
        })
        .await
        .map_err(|_| Error::OperationTimeout("connect".to_string()))??;
        info!(room, "session established");
        Ok(session)
    }

    /// Build a session over an already-established signaling channel; useful
    /// for custom transports and tests
    pub fn with_connection(
        &self,
        conn: Arc<dyn SignalConnection>,
        engine: Arc<dyn MediaEngine>,
    ) -> Result<RtcSession> {
        RtcSession::new(conn, engine, self.config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use wiremock::matchers::{bearer_token, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_config(api_host: String) -> SessionConfig {
        SessionConfig {
            retry: RetryPolicy {
                max_retries: 3,
                backoff_initial_ms: 1,
                backoff_min_ms: 1,
                backoff_max_ms: 5,
                jitter_enabled: false,
                ..RetryPolicy::default()
            },
            ..SessionConfig::new(api_host)
        }
    }

    fn descriptor_body() -> serde_json::Value {
        serde_json::json!({
            "signalUrl": "wss://media.example.com/signal",
            "iceServers": [ { "urls": ["stun:stun.example.com"] } ]
        })
    }

    #[tokio::test]
    async fn test_provision_parses_descriptor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/rooms/lobby/sessions"))
            .and(bearer_token("tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(descriptor_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = RoomClient::new(fast_config(server.uri()).with_auth_token("tok")).unwrap();
        let descriptor = client.provision("lobby").await.unwrap();
        assert_eq!(descriptor.signal_url, "wss://media.example.com/signal");
        assert_eq!(descriptor.ice_servers[0].urls[0], "stun:stun.example.com");
    }

    #[tokio::test]
    async fn test_provision_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(descriptor_body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = RoomClient::new(fast_config(server.uri())).unwrap();
        assert!(client.provision("lobby").await.is_ok());
    }

    #[tokio::test]
    async fn test_provision_does_not_retry_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let client = RoomClient::new(fast_config(server.uri())).unwrap();
        assert!(client.provision("lobby").await.is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(RoomClient::new(SessionConfig::new("not-a-url")).is_err());
    }
}
