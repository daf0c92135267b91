//! Local media: capture constraints, the shared local stream handed to
//! every peer connection, and the device seam the host platform implements.
//!
//! The local stream is acquired once per session and shared read-only
//! across all peer connections. Enabling/disabling a track affects every
//! peer at once; that coupling is intentional and does not renegotiate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaAccessError;
use crate::logger::log;
use crate::utils::random_id;

/// Capture profile requested from the devices on join.
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    /// Specific capture devices, when the user picked one. `None` means
    /// the platform default.
    pub video_device: Option<String>,
    pub audio_device: Option<String>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            framerate: 30,
            echo_cancellation: true,
            noise_suppression: true,
            video_device: None,
            audio_device: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
}

/// One local capture track. The `webrtc` track object is shared with every
/// peer connection; `enabled` gates the capture pipeline writing samples
/// into it (transport-transparent, no renegotiation).
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, track: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            kind,
            track,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip `enabled`; returns the new value.
    pub fn toggle(&self) -> bool {
        let was = self.enabled.fetch_xor(true, Ordering::SeqCst);
        !was
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Write one capture sample, respecting the enabled/stopped gates.
    /// Capture pipelines call this; peers only ever read.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> bool {
        if self.is_stopped() || !self.is_enabled() {
            return false;
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track.write_sample(&sample).await.is_ok()
    }
}

/// The session's local stream: at most one video and one audio track,
/// shared read-only across every peer connection.
#[derive(Clone, Default)]
pub struct LocalStream {
    pub video: Option<LocalTrack>,
    pub audio: Option<LocalTrack>,
}

impl LocalStream {
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.video.iter().chain(self.audio.iter()).cloned().collect()
    }

    /// Stop every track. Idempotent.
    pub fn stop(&self) {
        for t in self.tracks() {
            t.stop();
        }
        log("Local media stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks().iter().all(|t| t.is_stopped())
    }
}

/// Get-user-media-equivalent capability of the host platform.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire camera and microphone under the given constraints.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaAccessError>;

    /// Probe device availability without keeping a stream.
    async fn probe(&self) -> bool;
}

// ========== FAKE DEVICES ==========

/// Device implementation producing VP8/Opus sample tracks without real
/// capture hardware. Used by tests and local demos.
#[derive(Default)]
pub struct FakeDevices {
    /// When set, `acquire` fails with this error kind instead.
    deny: Option<FakeDenial>,
}

#[derive(Debug, Clone, Copy)]
pub enum FakeDenial {
    Permission,
    NoDevice,
    Busy,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying(deny: FakeDenial) -> Self {
        Self { deny: Some(deny) }
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalStream, MediaAccessError> {
        if let Some(deny) = self.deny {
            return Err(match deny {
                FakeDenial::Permission => MediaAccessError::PermissionDenied,
                FakeDenial::NoDevice => MediaAccessError::DeviceUnavailable,
                FakeDenial::Busy => MediaAccessError::DeviceBusy,
            });
        }

        let stream_id = format!("local-{}", random_id());
        log(&format!(
            "FakeDevices: acquiring {}x{}@{} as stream {}",
            constraints.width, constraints.height, constraints.framerate, stream_id
        ));

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id.clone(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id,
        ));

        Ok(LocalStream {
            video: Some(LocalTrack::new(TrackKind::Video, video)),
            audio: Some(LocalTrack::new(TrackKind::Audio, audio)),
        })
    }

    async fn probe(&self) -> bool {
        self.deny.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn toggle_flips_enabled_without_stopping() {
        let stream = FakeDevices::new()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        let video = stream.video.as_ref().unwrap();
        assert!(video.is_enabled());
        assert!(!video.toggle());
        assert!(!video.is_enabled());
        assert!(video.toggle());
        assert!(!video.is_stopped());
    }

    #[tokio::test]
    async fn stopped_track_refuses_samples() {
        let stream = FakeDevices::new()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        stream.stop();
        assert!(stream.is_stopped());
        let video = stream.video.as_ref().unwrap();
        let wrote = video
            .write_sample(Bytes::from_static(&[0u8; 4]), Duration::from_millis(33))
            .await;
        assert!(!wrote);
    }

    #[tokio::test]
    async fn denial_maps_to_distinct_errors() {
        let denied = FakeDevices::denying(FakeDenial::Permission)
            .acquire(&MediaConstraints::default())
            .await;
        assert!(matches!(denied, Err(MediaAccessError::PermissionDenied)));

        let missing = FakeDevices::denying(FakeDenial::NoDevice)
            .acquire(&MediaConstraints::default())
            .await;
        assert!(matches!(missing, Err(MediaAccessError::DeviceUnavailable)));

        assert!(!FakeDevices::denying(FakeDenial::Busy).probe().await);
        assert!(FakeDevices::new().probe().await);
    }
}
