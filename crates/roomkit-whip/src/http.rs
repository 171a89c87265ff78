//! WHIP HTTP protocol operations
//!
//! OPTIONS preflight, offer POST, trickle/restart PATCH and session DELETE
//! against the ingest endpoint. Network errors and 5xx responses are
//! retried on the configured schedule; everything the server deliberately
//! rejected fails immediately. All requests race against a cancellation
//! token so `close()` aborts whatever is in flight.

use reqwest::header::{HeaderMap, ALLOW, CONTENT_TYPE, ETAG, IF_MATCH, LINK, LOCATION};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::{RetryPolicy, WhipConfig};
use crate::error::{Error, Result};

const SDP_CONTENT_TYPE: &str = "application/sdp";
const TRICKLE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

/// Capabilities and hints learned from an OPTIONS preflight or offer POST
#[derive(Debug, Default, Clone)]
pub struct EndpointCapabilities {
    pub can_trickle: bool,
    pub can_restart: bool,
    pub ice_servers: Vec<RTCIceServer>,
}

/// Result of a successful offer POST
#[derive(Debug, Clone)]
pub struct OfferOutcome {
    pub answer_sdp: String,
    pub resource: Url,
    pub etag: Option<String>,
    pub capabilities: EndpointCapabilities,
}

/// Result of an accepted ICE-restart PATCH
#[derive(Debug, Clone)]
pub struct RestartOutcome {
    pub answer_frag: String,
    pub etag: Option<String>,
}

pub struct WhipHttp {
    http: reqwest::Client,
    endpoint: Url,
    auth_token: Option<String>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl WhipHttp {
    pub fn new(config: &WhipConfig, cancel: CancellationToken) -> Result<Self> {
        let endpoint = config.endpoint_url()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self {
            http,
            endpoint,
            auth_token: config.auth_token.clone(),
            retry: config.retry.clone(),
            cancel,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// OPTIONS capability probe. Failures are tolerated since many servers
    /// do not implement the preflight at all.
    pub async fn preflight(&self) -> EndpointCapabilities {
        match self
            .send(self.http.request(Method::OPTIONS, self.endpoint.clone()))
            .await
        {
            Ok(response) => read_capabilities(response.headers()),
            Err(e) => {
                debug!(error = %e, "preflight not supported by endpoint");
                EndpointCapabilities::default()
            }
        }
    }

    /// POSTs the SDP offer; returns the answer, the session resource URL
    /// from `Location` and any ETag/capability headers.
    pub async fn post_offer(&self, offer_sdp: &str) -> Result<OfferOutcome> {
        let response = self
            .send(
                self.http
                    .post(self.endpoint.clone())
                    .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
                    .body(offer_sdp.to_string()),
            )
            .await?;

        let location = header_str(response.headers(), LOCATION.as_str())
            .ok_or_else(|| Error::Sdp("offer response missing Location header".to_string()))?;
        let resource = self
            .endpoint
            .join(&location)
            .map_err(|e| Error::Sdp(format!("bad Location header: {e}")))?;
        let etag = header_str(response.headers(), ETAG.as_str());
        let capabilities = read_capabilities(response.headers());

        let answer_sdp = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        debug!(%resource, "session resource created");
        Ok(OfferOutcome {
            answer_sdp,
            resource,
            etag,
            capabilities,
        })
    }

    /// PATCHes a trickle fragment against the session resource, guarded by
    /// the current ETag when one is known.
    pub async fn patch_trickle(
        &self,
        resource: &Url,
        etag: Option<&str>,
        fragment: &str,
    ) -> Result<()> {
        let mut request = self
            .http
            .patch(resource.clone())
            .header(CONTENT_TYPE, TRICKLE_CONTENT_TYPE)
            .body(fragment.to_string());
        if let Some(etag) = etag {
            request = request.header(IF_MATCH, etag);
        }
        self.send(request).await?;
        Ok(())
    }

    /// PATCHes an ICE-restart fragment with an unconditional precondition;
    /// a 200 carries the new answer fragment and ETag.
    pub async fn patch_restart(&self, resource: &Url, fragment: &str) -> Result<RestartOutcome> {
        let response = self
            .send(
                self.http
                    .patch(resource.clone())
                    .header(CONTENT_TYPE, TRICKLE_CONTENT_TYPE)
                    .header(IF_MATCH, "*")
                    .body(fragment.to_string()),
            )
            .await?;
        let etag = header_str(response.headers(), ETAG.as_str());
        let answer_frag = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(RestartOutcome { answer_frag, etag })
    }

    /// DELETEs the session resource; errors are logged and swallowed since
    /// teardown must not fail
    pub async fn delete(&self, resource: &Url) {
        if let Err(e) = self.send(self.http.delete(resource.clone())).await {
            warn!(%resource, error = %e, "session delete failed");
        }
    }

    /// Issues the request with bounded retries, racing the cancellation
    /// token. The builder must be cloneable (no streaming body).
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let mut attempt = 0u32;
        loop {
            let outcome = self.send_once(&request).await;
            match outcome {
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(attempt, error = %e, ?delay, "request failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(Error::Closed),
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send_once(&self, request: &RequestBuilder) -> Result<Response> {
        let mut request = request
            .try_clone()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("request body not cloneable")))?;
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let response = tokio::select! {
            result = request.send() => result.map_err(|e| Error::Network(e.to_string()))?,
            _ = self.cancel.cancelled() => return Err(Error::Closed),
        };
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::CONFLICT => Error::SessionClosed,
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => Error::PatchUnsupported,
            _ => Error::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            },
        })
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.to_string())
}

fn read_capabilities(headers: &HeaderMap) -> EndpointCapabilities {
    let mut allow = header_str(headers, ALLOW.as_str()).unwrap_or_default();
    if allow.is_empty() {
        allow = header_str(headers, "access-control-allow-methods").unwrap_or_default();
    }
    let patch_allowed = allow
        .split(',')
        .any(|method| method.trim().eq_ignore_ascii_case("PATCH"));
    EndpointCapabilities {
        can_trickle: patch_allowed,
        can_restart: patch_allowed,
        ice_servers: parse_link_ice_servers(headers),
    }
}

/// Parses `Link: <stun:...>; rel="ice-server"` headers into ICE server
/// entries. TURN entries require username/credential with
/// `credential-type="password"`; anything else is skipped.
fn parse_link_ice_servers(headers: &HeaderMap) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    for value in headers.get_all(LINK) {
        let Ok(raw) = value.to_str() else { continue };
        for link in split_links(raw) {
            let mut parts = link.split(';');
            let Some(url) = parts
                .next()
                .map(|u| u.trim().trim_start_matches('<').trim_end_matches('>'))
            else {
                continue;
            };
            let mut rel = None;
            let mut username = None;
            let mut credential = None;
            let mut credential_type = None;
            for param in parts {
                let Some((key, val)) = param.split_once('=') else { continue };
                let val = val.trim().trim_matches('"').trim_matches('\'');
                match key.trim() {
                    "rel" => rel = Some(val.to_string()),
                    "username" => username = Some(val.to_string()),
                    "credential" => credential = Some(val.to_string()),
                    "credential-type" => credential_type = Some(val.to_string()),
                    _ => {}
                }
            }
            if rel.as_deref() != Some("ice-server") {
                continue;
            }
            if url.starts_with("stun:") {
                servers.push(RTCIceServer {
                    urls: vec![url.to_string()],
                    ..Default::default()
                });
            } else if let (Some(username), Some(credential)) = (username, credential) {
                if credential_type.as_deref() == Some("password") {
                    servers.push(RTCIceServer {
                        urls: vec![url.to_string()],
                        username,
                        credential,
                    });
                }
            }
        }
    }
    servers
}

/// Splits a combined Link header on commas that start a new `<...>` entry,
/// leaving commas inside parameter values alone
fn split_links(raw: &str) -> Vec<&str> {
    let mut links = Vec::new();
    let mut start = 0;
    let bytes = raw.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] == b',' && raw[i + 1..].trim_start().starts_with('<') {
            links.push(raw[start..i].trim());
            start = i + 1;
        }
    }
    links.push(raw[start..].trim());
    links.retain(|l| !l.is_empty());
    links
}
