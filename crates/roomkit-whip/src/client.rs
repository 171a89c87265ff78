//! WHIP publishing client
//!
//! Owns the peer connection and the session resource, drives trickle ICE
//! and recovers from connection drops: ICE-only restart when the endpoint
//! supports PATCH, full offer/answer restart otherwise or when the server
//! reports the session gone. Reconnect attempts are capped; exceeding the
//! cap emits a terminal failure exactly once.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::config::WhipConfig;
use crate::error::{Error, Result};
use crate::http::WhipHttp;
use crate::sdp::{
    apply_restart_answer, extract_ice_credentials, media_sections, restrict_codecs,
    trickle_fragment, IceCredentials, MediaCandidates, MediaSection,
};
use crate::silence::SilentAudioTrack;

/// Lifecycle events of one publishing session
#[derive(Debug, Clone)]
pub enum WhipEvent {
    /// The peer connection reached the connected state
    Connected,
    /// The connection dropped and a restart is underway
    Reconnecting,
    /// The reconnect budget is exhausted; the client gave up
    Failed { reason: String },
    /// The client was closed
    Closed,
}

type PublishTrack = Arc<dyn TrackLocal + Send + Sync>;

struct State {
    pc: Option<Arc<RTCPeerConnection>>,
    tracks: Vec<PublishTrack>,
    silence: Option<SilentAudioTrack>,
    resource: Option<Url>,
    etag: Option<String>,
    creds: Option<IceCredentials>,
    sections: Vec<MediaSection>,
    ice_servers: Vec<RTCIceServer>,
    can_trickle: bool,
    can_restart: bool,
    pending: Vec<RTCIceCandidateInit>,
    eof_candidates: bool,
    restarting: bool,
    reconnects: u32,
    restart_timer: Option<JoinHandle<()>>,
    failed: bool,
    closed: bool,
}

pub struct WhipClient {
    config: WhipConfig,
    http: WhipHttp,
    cancel: CancellationToken,
    events: broadcast::Sender<WhipEvent>,
    state: Mutex<State>,
}

impl WhipClient {
    pub fn new(config: WhipConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let http = WhipHttp::new(&config, cancel.clone())?;
        let (events, _) = broadcast::channel(64);
        let ice_servers = config.ice_servers.clone();
        Ok(Arc::new(Self {
            config,
            http,
            cancel,
            events,
            state: Mutex::new(State {
                pc: None,
                tracks: Vec::new(),
                silence: None,
                resource: None,
                etag: None,
                creds: None,
                sections: Vec::new(),
                ice_servers,
                can_trickle: false,
                can_restart: false,
                pending: Vec::new(),
                eof_candidates: false,
                restarting: false,
                reconnects: 0,
                restart_timer: None,
                failed: false,
                closed: false,
            }),
        }))
    }

    pub fn events(&self) -> broadcast::Receiver<WhipEvent> {
        self.events.subscribe()
    }

    /// Starts publishing the given tracks. Probes endpoint capabilities,
    /// attaches a silent audio track when none of the tracks carries audio
    /// and runs the offer/answer exchange.
    pub async fn publish(self: &Arc<Self>, tracks: Vec<PublishTrack>) -> Result<()> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            if state.pc.is_some() {
                return Err(Error::Other(anyhow::anyhow!("already publishing")));
            }
        }

        let caps = self.http.preflight().await;
        let mut tracks = tracks;
        {
            let mut state = self.state.lock();
            state.can_trickle |= caps.can_trickle;
            state.can_restart |= caps.can_restart;
            if state.ice_servers.is_empty() {
                state.ice_servers = caps.ice_servers;
            }
            let has_audio = tracks.iter().any(|t| t.kind() == RTPCodecType::Audio);
            if self.config.ensure_audio && !has_audio {
                debug!("no audio track given, attaching silence");
                let silence = SilentAudioTrack::spawn();
                tracks.push(silence.track() as PublishTrack);
                state.silence = Some(silence);
            }
            state.tracks = tracks.clone();
        }

        self.run_start().await
    }

    /// Builds a fresh peer connection for the stored tracks and runs the
    /// offer/answer exchange against the endpoint
    async fn run_start(self: &Arc<Self>) -> Result<()> {
        let (tracks, ice_servers, can_trickle) = {
            let state = self.state.lock();
            (
                state.tracks.clone(),
                state.ice_servers.clone(),
                state.can_trickle,
            )
        };

        let pc = self.build_peer_connection(ice_servers).await?;
        for track in &tracks {
            pc.add_track(Arc::clone(track)).await?;
        }
        self.bind_handlers(&pc);
        {
            let mut state = self.state.lock();
            state.pc = Some(Arc::clone(&pc));
            state.pending.clear();
            state.eof_candidates = false;
            state.restarting = false;
        }

        let offer = pc.create_offer(None).await?;
        let munged = restrict_codecs(&offer.sdp, "video", &self.config.video_codecs);
        pc.set_local_description(RTCSessionDescription::offer(munged)?)
            .await?;

        if !can_trickle {
            // No PATCH support: ship a complete offer instead
            let mut done = pc.gathering_complete_promise().await;
            let _ = done.recv().await;
        }

        let offer_sdp = pc
            .local_description()
            .await
            .ok_or_else(|| Error::Sdp("no local description".to_string()))?
            .sdp;
        {
            let mut state = self.state.lock();
            state.creds = Some(extract_ice_credentials(&offer_sdp)?);
            state.sections = media_sections(&offer_sdp);
        }

        let outcome = self.http.post_offer(&offer_sdp).await?;
        let flush = {
            let mut state = self.state.lock();
            state.can_trickle |= outcome.capabilities.can_trickle;
            state.can_restart |= outcome.capabilities.can_restart;
            if state.ice_servers.is_empty() {
                state.ice_servers = outcome.capabilities.ice_servers.clone();
            }
            state.resource = Some(outcome.resource.clone());
            state.etag = outcome.etag.clone();
            state.can_trickle && !state.pending.is_empty()
        };

        pc.set_remote_description(RTCSessionDescription::answer(outcome.answer_sdp)?)
            .await?;
        info!(resource = %outcome.resource, "publishing session established");

        if flush {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.flush_candidates().await });
        }
        Ok(())
    }

    async fn build_peer_connection(
        &self,
        ice_servers: Vec<RTCIceServer>,
    ) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?;
        Ok(Arc::new(pc))
    }

    fn bind_handlers(self: &Arc<Self>, pc: &Arc<RTCPeerConnection>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(client) = weak.upgrade() else { return };
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => client.handle_local_candidate(init),
                        Err(e) => warn!(error = %e, "dropping unserializable candidate"),
                    },
                    None => {
                        client.state.lock().eof_candidates = true;
                        client.maybe_trickle();
                    }
                }
            })
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(client) = weak.upgrade() else { return };
                debug!(?state, "peer connection state changed");
                match state {
                    RTCPeerConnectionState::Connected => {
                        client.state.lock().reconnects = 0;
                        client.emit(WhipEvent::Connected);
                    }
                    RTCPeerConnectionState::Failed => client.handle_connection_drop(true),
                    RTCPeerConnectionState::Disconnected => client.handle_connection_drop(false),
                    _ => {}
                }
            })
        }));
    }

    fn handle_local_candidate(self: &Arc<Self>, init: RTCIceCandidateInit) {
        self.state.lock().pending.push(init);
        self.maybe_trickle();
    }

    fn maybe_trickle(self: &Arc<Self>) {
        let ready = {
            let state = self.state.lock();
            state.can_trickle
                && state.resource.is_some()
                && !state.restarting
                && !state.closed
                && !state.failed
        };
        if ready {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.flush_candidates().await });
        }
    }

    /// PATCHes everything gathered so far against the session resource.
    /// Trickle failures are logged but never escalate; the connection state
    /// handler owns recovery.
    async fn flush_candidates(self: &Arc<Self>) {
        let (resource, etag, creds, medias, eof) = {
            let mut state = self.state.lock();
            let (Some(resource), Some(creds)) = (state.resource.clone(), state.creds.clone())
            else {
                return;
            };
            if state.pending.is_empty() && !state.eof_candidates {
                return;
            }
            let pending = std::mem::take(&mut state.pending);
            let medias = batch_by_section(&pending, &state.sections, state.eof_candidates);
            (resource, state.etag.clone(), creds, medias, state.eof_candidates)
        };
        if medias.is_empty() {
            return;
        }
        let fragment = trickle_fragment(&creds, &medias, eof);
        if let Err(e) = self
            .http
            .patch_trickle(&resource, etag.as_deref(), &fragment)
            .await
        {
            warn!(error = %e, "trickle PATCH failed");
        }
    }

    /// Reacts to a dropped connection: `failed` restarts immediately,
    /// `disconnected` after a randomized delay. Each drop consumes one
    /// reconnect attempt; exhausting the budget is terminal.
    fn handle_connection_drop(self: &Arc<Self>, immediate: bool) {
        let action = {
            let mut state = self.state.lock();
            if state.closed || state.failed || state.restarting {
                return;
            }
            if state
                .restart_timer
                .as_ref()
                .is_some_and(|timer| !timer.is_finished())
            {
                return;
            }
            state.reconnects += 1;
            if state.reconnects > self.config.max_reconnects {
                state.failed = true;
                DropAction::GiveUp
            } else if immediate {
                DropAction::RestartNow
            } else {
                DropAction::RestartLater
            }
        };

        match action {
            DropAction::GiveUp => {
                warn!(
                    max_reconnects = self.config.max_reconnects,
                    "reconnect budget exhausted"
                );
                self.emit(WhipEvent::Failed {
                    reason: "reconnect budget exhausted".to_string(),
                });
            }
            DropAction::RestartNow => {
                self.emit(WhipEvent::Reconnecting);
                let client = Arc::clone(self);
                tokio::spawn(async move { client.restart().await });
            }
            DropAction::RestartLater => {
                self.emit(WhipEvent::Reconnecting);
                let delay = randomized_delay(Duration::from_millis(self.config.restart_delay_ms));
                let client = Arc::clone(self);
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    client.restart().await;
                });
                self.state.lock().restart_timer = Some(timer);
            }
        }
    }

    /// ICE-only restart when the endpoint permits, full restart otherwise.
    /// A session-gone answer to the restart PATCH falls back to exactly one
    /// full restart.
    async fn restart(self: &Arc<Self>) {
        let can_restart = {
            let mut state = self.state.lock();
            if state.closed || state.failed {
                return;
            }
            state.restart_timer = None;
            state.can_restart
        };
        if !can_restart {
            self.full_restart().await;
            return;
        }
        match self.restart_ice().await {
            Ok(()) => {}
            Err(e) if e.needs_full_restart() => {
                debug!(error = %e, "session gone, falling back to full restart");
                self.full_restart().await;
            }
            Err(e) => {
                self.state.lock().restarting = false;
                warn!(error = %e, "ICE restart failed");
            }
        }
    }

    async fn restart_ice(self: &Arc<Self>) -> Result<()> {
        let (pc, resource) = {
            let mut state = self.state.lock();
            let (Some(pc), Some(resource)) = (state.pc.clone(), state.resource.clone()) else {
                debug!("no active session to restart");
                return Ok(());
            };
            state.pending.clear();
            state.eof_candidates = false;
            state.restarting = true;
            (pc, resource)
        };
        info!("restarting ICE");

        let offer = pc
            .create_offer(Some(RTCOfferOptions {
                ice_restart: true,
                ..Default::default()
            }))
            .await?;
        let creds = extract_ice_credentials(&offer.sdp)?;
        {
            let mut state = self.state.lock();
            state.creds = Some(creds.clone());
            state.sections = media_sections(&offer.sdp);
        }
        pc.set_local_description(offer).await?;

        let fragment = trickle_fragment(&creds, &[], false);
        let outcome = self.http.patch_restart(&resource, &fragment).await?;

        let remote = pc
            .remote_description()
            .await
            .ok_or_else(|| Error::Sdp("no remote description".to_string()))?;
        let rewritten = apply_restart_answer(&remote.sdp, &outcome.answer_frag)?;
        pc.set_remote_description(RTCSessionDescription::answer(rewritten)?)
            .await?;

        let flush = {
            let mut state = self.state.lock();
            state.etag = outcome.etag;
            state.restarting = false;
            !state.pending.is_empty() || state.eof_candidates
        };
        if flush {
            self.flush_candidates().await;
        }
        Ok(())
    }

    /// Tears the session down and redoes the offer/answer exchange with the
    /// same tracks. A failure here is terminal.
    async fn full_restart(self: &Arc<Self>) {
        info!("full session restart");
        self.teardown_session().await;
        if self.state.lock().closed {
            return;
        }
        if let Err(e) = self.run_start().await {
            self.state.lock().failed = true;
            warn!(error = %e, "session restart failed");
            self.emit(WhipEvent::Failed {
                reason: e.to_string(),
            });
        }
    }

    async fn teardown_session(&self) {
        let (pc, resource) = {
            let mut state = self.state.lock();
            state.restarting = false;
            (state.pc.take(), state.resource.take())
        };
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                debug!(error = %e, "peer connection close failed");
            }
        }
        if let Some(resource) = resource {
            self.http.delete(&resource).await;
        }
    }

    /// Stops publishing, deletes the session resource and cancels all
    /// in-flight requests. Idempotent.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(timer) = state.restart_timer.take() {
                timer.abort();
            }
            if let Some(silence) = state.silence.take() {
                silence.stop();
            }
        }
        self.teardown_session().await;
        self.cancel.cancel();
        self.emit(WhipEvent::Closed);
        info!("client closed");
    }

    fn emit(&self, event: WhipEvent) {
        let _ = self.events.send(event);
    }
}

impl Drop for WhipClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        let mut state = self.state.lock();
        if let Some(timer) = state.restart_timer.take() {
            timer.abort();
        }
    }
}

enum DropAction {
    RestartNow,
    RestartLater,
    GiveUp,
}

/// Randomizes a restart delay within ±500ms of the base
fn randomized_delay(base: Duration) -> Duration {
    let jitter = rand::random::<f64>() * 1000.0 - 500.0;
    let millis = (base.as_millis() as f64 + jitter).max(0.0) as u64;
    Duration::from_millis(millis)
}

/// Groups gathered candidates into per-m-line batches. Candidates without
/// a mid, or with one that matches no section, go to the first section;
/// the first section is always present when signaling end-of-candidates.
fn batch_by_section(
    pending: &[RTCIceCandidateInit],
    sections: &[MediaSection],
    eof: bool,
) -> Vec<MediaCandidates> {
    let Some(first) = sections.first() else {
        return Vec::new();
    };
    let mut medias: Vec<MediaCandidates> = Vec::new();
    if eof || !pending.is_empty() {
        medias.push(MediaCandidates {
            mid: first.mid.clone(),
            kind: first.kind.clone(),
            candidates: Vec::new(),
        });
    }
    for init in pending {
        let section = init
            .sdp_mid
            .as_deref()
            .and_then(|mid| sections.iter().find(|s| s.mid == mid))
            .unwrap_or(first);
        let media = match medias.iter_mut().find(|m| m.mid == section.mid) {
            Some(media) => media,
            None => {
                medias.push(MediaCandidates {
                    mid: section.mid.clone(),
                    kind: section.kind.clone(),
                    candidates: Vec::new(),
                });
                medias.last_mut().unwrap()
            }
        };
        media.candidates.push(init.candidate.clone());
    }
    medias
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sections() -> Vec<MediaSection> {
        vec![
            MediaSection {
                mid: "0".to_string(),
                kind: "audio".to_string(),
            },
            MediaSection {
                mid: "1".to_string(),
                kind: "video".to_string(),
            },
        ]
    }

    fn candidate(mid: Option<&str>, body: &str) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: body.to_string(),
            sdp_mid: mid.map(str::to_string),
            ..Default::default()
        }
    }

    fn test_client(max_reconnects: u32) -> Arc<WhipClient> {
        let config = WhipConfig {
            max_reconnects,
            ..WhipConfig::new("https://ingest.example.com/whip")
        };
        WhipClient::new(config).unwrap()
    }

    #[test]
    fn test_batching_groups_by_mid_with_fallback() {
        let pending = vec![
            candidate(Some("0"), "candidate:a"),
            candidate(Some("1"), "candidate:b"),
            candidate(None, "candidate:c"),
            candidate(Some("99"), "candidate:d"),
        ];
        let medias = batch_by_section(&pending, &sections(), false);
        assert_eq!(medias.len(), 2);
        assert_eq!(medias[0].mid, "0");
        assert_eq!(
            medias[0].candidates,
            vec!["candidate:a", "candidate:c", "candidate:d"]
        );
        assert_eq!(medias[1].mid, "1");
        assert_eq!(medias[1].candidates, vec!["candidate:b"]);
    }

    #[test]
    fn test_batching_eof_without_candidates_keeps_first_section() {
        let medias = batch_by_section(&[], &sections(), true);
        assert_eq!(medias.len(), 1);
        assert_eq!(medias[0].mid, "0");
        assert!(medias[0].candidates.is_empty());
    }

    #[test]
    fn test_batching_without_sections_is_empty() {
        assert!(batch_by_section(&[candidate(None, "candidate:a")], &[], true).is_empty());
    }

    #[test]
    fn test_randomized_delay_window() {
        let base = Duration::from_millis(2000);
        for _ in 0..100 {
            let delay = randomized_delay(base);
            assert!(delay >= Duration::from_millis(1500));
            assert!(delay < Duration::from_millis(2501));
        }
    }

    #[tokio::test]
    async fn test_reconnect_budget_is_terminal_once() {
        let client = test_client(2);
        // ICE restarts with no live session are no-ops, so drops only
        // consume budget here
        client.state.lock().can_restart = true;
        let mut events = client.events();

        client.handle_connection_drop(true);
        client.handle_connection_drop(true);
        client.handle_connection_drop(true);
        client.handle_connection_drop(true);

        assert!(matches!(events.recv().await.unwrap(), WhipEvent::Reconnecting));
        assert!(matches!(events.recv().await.unwrap(), WhipEvent::Reconnecting));
        assert!(matches!(events.recv().await.unwrap(), WhipEvent::Failed { .. }));
        // the fourth drop emitted nothing
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drops_ignored_after_close() {
        let client = test_client(2);
        client.state.lock().can_restart = true;
        let mut events = client.events();
        client.close().await;
        client.handle_connection_drop(true);
        assert!(matches!(events.recv().await.unwrap(), WhipEvent::Closed));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = test_client(2);
        let mut events = client.events();
        client.close().await;
        client.close().await;
        assert!(matches!(events.recv().await.unwrap(), WhipEvent::Closed));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_after_close_rejected() {
        let client = test_client(2);
        client.close().await;
        assert!(matches!(
            client.publish(Vec::new()).await,
            Err(Error::Closed)
        ));
    }
}
