//! Silent audio synthesis
//!
//! Some ingest servers assume every session carries an audio m-line and
//! misbehave on video-only offers. When the published tracks have no audio,
//! a local Opus track fed with silence frames is attached instead.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// A standalone Opus silence frame (DTX)
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const FRAME_DURATION: Duration = Duration::from_millis(20);

/// A local audio track that produces Opus silence until stopped
pub struct SilentAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
    feeder: JoinHandle<()>,
}

impl SilentAudioTrack {
    /// Creates the track and spawns the frame feeder
    pub fn spawn() -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            "audio-silence".to_owned(),
            "roomkit-whip".to_owned(),
        ));
        let cancel = CancellationToken::new();
        let feeder = tokio::spawn(Self::feed(Arc::clone(&track), cancel.clone()));
        Self {
            track,
            cancel,
            feeder,
        }
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    async fn feed(track: Arc<TrackLocalStaticSample>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }
            let sample = Sample {
                data: Bytes::from_static(&OPUS_SILENCE),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            // Write errors just mean the track is not bound yet
            let _ = track.write_sample(&sample).await;
        }
        debug!("silence feeder stopped");
    }

    /// Stops the feeder; the track itself stays valid but goes quiet
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SilentAudioTrack {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.feeder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_feeder_terminates_on_stop() {
        let silence = SilentAudioTrack::spawn();
        tokio::time::advance(Duration::from_millis(100)).await;
        silence.stop();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !silence.feeder.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("feeder did not stop");
    }

    #[tokio::test]
    async fn test_track_identity() {
        use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
        use webrtc::track::track_local::TrackLocal;

        let silence = SilentAudioTrack::spawn();
        let track = silence.track();
        assert_eq!(track.kind(), RTPCodecType::Audio);
        assert_eq!(track.id(), "audio-silence");
        silence.stop();
    }
}
