use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use rendezvous_agent::{MediaError, MediaSource, Playback, RemoteStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Stands in for a camera: produces a VP8 track fed with a fixed frame.
pub struct SyntheticCamera {
    enabled: bool,
}

impl SyntheticCamera {
    /// A disabled camera behaves like a user refusing capture.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

/// A running local video track. The frame pump stops when this is dropped.
pub struct LocalVideo {
    track: Arc<TrackLocalStaticSample>,
    pump: JoinHandle<()>,
}

impl LocalVideo {
    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl Drop for LocalVideo {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[async_trait]
impl MediaSource for SyntheticCamera {
    type Stream = LocalVideo;

    async fn acquire(&self) -> Result<LocalVideo, MediaError> {
        if !self.enabled {
            return Err(MediaError::Denied);
        }
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            "video".to_owned(),
            "rendezvous-local".to_owned(),
        ));
        let pump = tokio::spawn(pump_frames(Arc::clone(&track)));
        Ok(LocalVideo { track, pump })
    }
}

async fn pump_frames(track: Arc<TrackLocalStaticSample>) {
    // Not a decodable picture; receivers only drain it.
    let frame = Bytes::from_static(&[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00]);
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    loop {
        ticker.tick().await;
        let sample = Sample {
            data: frame.clone(),
            duration: FRAME_INTERVAL,
            timestamp: SystemTime::now(),
            ..Default::default()
        };
        if let Err(err) = track.write_sample(&sample).await {
            debug!(target = "rendezvous::media", error = %err, "local frame not written");
        }
    }
}

/// Reports remote media in the log instead of rendering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingPlayback;

impl Playback for LoggingPlayback {
    fn attach(&self, stream: &RemoteStream) {
        info!(
            target = "rendezvous::media",
            stream_id = %stream.stream_id,
            track_id = %stream.track_id,
            kind = %stream.kind,
            "remote stream attached"
        );
    }

    fn detach(&self) {
        info!(target = "rendezvous::media", "remote stream detached");
    }
}
