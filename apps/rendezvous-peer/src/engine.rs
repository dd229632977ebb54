//! [`PeerEngine`] backed by a webrtc-rs peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use rendezvous_agent::{
    ConnectivityState, DescriptionKind, EngineError, EngineEvents, EngineFactory, PeerEngine,
    RemoteStream, Role,
};
use rendezvous_proto::IceCandidate;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn to_setup_error<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Setup(err.to_string())
}

fn build_api() -> Result<API, EngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub struct WebRtcEngineFactory {
    api: Arc<API>,
    ice_servers: Vec<String>,
    local_track: Option<Arc<TrackLocalStaticSample>>,
}

impl WebRtcEngineFactory {
    pub fn new(
        ice_servers: Vec<String>,
        local_track: Option<Arc<TrackLocalStaticSample>>,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            api: Arc::new(build_api()?),
            ice_servers,
            local_track,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    type Engine = WebRtcEngine;

    async fn create(&self, role: Role, events: EngineEvents) -> Result<WebRtcEngine, EngineError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(to_setup_error)?,
        );

        match &self.local_track {
            Some(track) => {
                pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(to_setup_error)?;
            }
            // Without a send track an offer would carry no media section at all.
            None if role == Role::Initiator => {
                pc.add_transceiver_from_kind(
                    RTPCodecType::Video,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(to_setup_error)?;
            }
            None => {}
        }

        install_handlers(&pc, events);
        debug!(target = "rendezvous::engine", %role, "peer connection created");
        Ok(WebRtcEngine { pc })
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: EngineEvents) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                events.local_candidate(None);
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.local_candidate(Some(candidate_from_init(init))),
                Err(err) => warn!(
                    target = "rendezvous::engine",
                    session = %events.session(),
                    error = %err,
                    "failed to serialise local candidate"
                ),
            }
        })
    }));

    let state_events = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            if let Some(state) = connectivity_from(state) {
                events.connectivity(state);
            }
        })
    }));

    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let events = events.clone();
            Box::pin(async move {
                events.remote_stream(RemoteStream {
                    stream_id: track.stream_id().to_string(),
                    track_id: track.id().to_string(),
                    kind: track.kind().to_string(),
                });
                // RTP must be read for the receiver's interceptors to keep running.
                tokio::spawn(async move {
                    let mut packets = 0u64;
                    while track.read_rtp().await.is_ok() {
                        packets += 1;
                    }
                    debug!(target = "rendezvous::engine", packets, "remote track ended");
                });
            })
        },
    ));
}

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcEngine {
    fn description(kind: DescriptionKind, sdp: &str) -> Result<RTCSessionDescription, EngineError> {
        let description = match kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
            DescriptionKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
        };
        description.map_err(|err| EngineError::Rejected(err.to_string()))
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn generate_offer(&self) -> Result<String, EngineError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        Ok(offer.sdp)
    }

    async fn generate_answer(&self) -> Result<String, EngineError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        Ok(answer.sdp)
    }

    async fn set_local_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), EngineError> {
        let description = Self::description(kind, sdp)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| EngineError::Rejected(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), EngineError> {
        let description = Self::description(kind, sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| EngineError::Rejected(err.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc
            .close()
            .await
            .map_err(|err| EngineError::Setup(err.to_string()))
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    let mut candidate = IceCandidate::new(init.candidate);
    candidate.sdp_mid = init.sdp_mid;
    candidate.sdp_mline_index = init.sdp_mline_index;
    candidate.username_fragment = init.username_fragment;
    candidate
}

fn connectivity_from(state: RTCIceConnectionState) -> Option<ConnectivityState> {
    Some(match state {
        RTCIceConnectionState::New => ConnectivityState::New,
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn ice_states_map_onto_connectivity() {
        assert_eq!(connectivity_from(RTCIceConnectionState::Unspecified), None);
        assert_eq!(
            connectivity_from(RTCIceConnectionState::Disconnected),
            Some(ConnectivityState::Disconnected)
        );
        assert!(connectivity_from(RTCIceConnectionState::Failed)
            .is_some_and(ConnectivityState::is_terminal));
        assert!(connectivity_from(RTCIceConnectionState::Closed)
            .is_some_and(ConnectivityState::is_terminal));
    }

    #[test_timeout::timeout]
    fn candidate_fields_carry_over() {
        let candidate = candidate_from_init(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host".to_owned(),
            sdp_mid: Some("0".to_owned()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_owned()),
        });
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
        assert!(candidate.extra.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn offers_a_video_section_without_local_media() {
        let factory = WebRtcEngineFactory::new(Vec::new(), None).expect("factory");
        let (inputs, _rx) = tokio::sync::mpsc::unbounded_channel();
        let events = EngineEvents::new(rendezvous_agent::SessionId(1), inputs);
        let engine = factory.create(Role::Initiator, events).await.expect("engine");
        let offer = engine.generate_offer().await.expect("offer");
        assert!(offer.contains("m=video"));
        engine.close().await.expect("close");
    }
}
