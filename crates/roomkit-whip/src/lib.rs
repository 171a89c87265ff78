//! WHIP (WebRTC-HTTP Ingest Protocol) publishing client
//!
//! A self-contained one-way ingest client: SDP offer/answer over HTTP,
//! trickle ICE via incremental PATCH, ICE-only and full session restarts,
//! and silent-audio insertion for video-only captures.
//!
//! # Example
//!
//! ```no_run
//! use roomkit_whip::{WhipClient, WhipConfig, WhipEvent};
//! # use std::sync::Arc;
//! # use webrtc::track::track_local::TrackLocal;
//!
//! # async fn run(video: Arc<dyn TrackLocal + Send + Sync>) -> roomkit_whip::Result<()> {
//! let config = WhipConfig::new("https://ingest.example.com/whip").with_auth_token("token");
//! let client = WhipClient::new(config)?;
//!
//! let mut events = client.events();
//! client.publish(vec![video]).await?;
//! while let Ok(event) = events.recv().await {
//!     if matches!(event, WhipEvent::Failed { .. }) {
//!         break;
//!     }
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod sdp;
pub mod silence;

pub use client::{WhipClient, WhipEvent};
pub use config::{RetryPolicy, WhipConfig};
pub use error::{Error, Result};
pub use silence::SilentAudioTrack;
