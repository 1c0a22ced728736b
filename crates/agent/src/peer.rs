use crate::encoder::{EncodedSample, EncoderBackend};
use crate::negotiation::{ConnectionState, NegotiationHandle, PeerConnection};
use anyhow::Context;
use async_trait::async_trait;
use camrelay_protocol::{IceCandidate, IceConfig, SessionDescription};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const H264_CONSTRAINED_BASELINE: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const H264_MAIN: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=4d001f";

/// ICE servers for the peer connection. TURN credentials apply to every TURN URL.
pub fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_urls.clone(),
            ..Default::default()
        });
    }
    if !config.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: config.turn_urls.clone(),
            username: config.turn_username.clone().unwrap_or_default(),
            credential: config.turn_credential.clone().unwrap_or_default(),
        });
    }
    servers
}

/// `None` for states negotiation does not track.
pub fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::Unspecified => None,
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn log_sdp(label: &str, sdp: &str) {
    for line in sdp.lines() {
        if line.starts_with("m=")
            || line.starts_with("a=rtpmap:")
            || line.starts_with("a=fmtp:")
            || line.starts_with("a=group:")
            || line.starts_with("a=mid:")
        {
            debug!(sdp_line = line, "{label} SDP");
        }
    }
}

/// webrtc-rs peer connection sending one H.264 video track.
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    video_sender: Arc<RTCRtpSender>,
}

impl WebRtcPeer {
    pub async fn new(ice: &IceConfig, backend: EncoderBackend) -> anyhow::Result<Self> {
        let mut media_engine = MediaEngine::default();

        // Only H.264: with the default codec set browsers may pick VP8, which
        // this agent never produces.
        let h264_feedback = vec![
            RTCPFeedback {
                typ: "goog-remb".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "ccm".into(),
                parameter: "fir".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "".into(),
            },
            RTCPFeedback {
                typ: "nack".into(),
                parameter: "pli".into(),
            },
            RTCPFeedback {
                typ: "transport-cc".into(),
                parameter: "".into(),
            },
        ];

        // Constrained Baseline is always offered by browsers. nvh264enc emits
        // Main profile, so that profile is registered too when it is in use.
        let mut profiles = vec![(125u8, H264_CONSTRAINED_BASELINE)];
        if backend == EncoderBackend::Nvidia {
            profiles.push((102, H264_MAIN));
        }
        for (payload_type, fmtp) in profiles {
            media_engine.register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_H264.to_string(),
                        clock_rate: crate::encoder::RTP_CLOCK_RATE,
                        channels: 0,
                        sdp_fmtp_line: fmtp.to_string(),
                        rtcp_feedback: h264_feedback.clone(),
                    },
                    payload_type,
                    ..Default::default()
                },
                RTPCodecType::Video,
            )?;
        }
        info!(?backend, "Registered H.264 codecs");

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers(ice),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        // Without the fmtp the track can bind to packetization-mode=0
        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: crate::encoder::RTP_CLOCK_RATE,
                sdp_fmtp_line: H264_CONSTRAINED_BASELINE.to_string(),
                ..Default::default()
            },
            "video".to_string(),
            "camrelay".to_string(),
        ));

        let video_sender = peer_connection
            .add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .context("Failed to add video track")?;

        info!("WebRTC peer connection created");
        Ok(Self {
            peer_connection,
            video_track,
            video_sender,
        })
    }

    /// Hand every gathered local candidate to negotiation.
    pub fn on_local_candidate(&self, handle: NegotiationHandle) {
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            let disposition = handle.local_candidate(from_candidate_init(init));
                            debug!(?disposition, "Local ICE candidate gathered");
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {e}"),
                    }
                }
                Box::pin(async {})
            }));
    }

    /// Report connection state transitions to negotiation.
    pub fn on_connection_state(&self, handle: NegotiationHandle) {
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                match map_connection_state(state) {
                    Some(state) => handle.connection_state_changed(state),
                    None => debug!(?state, "Ignoring peer connection state"),
                }
                Box::pin(async {})
            }));
    }

    /// Read RTCP from the video sender and call `on_keyframe_request` for
    /// every PLI or FIR, so packet loss recovers before the next periodic IDR.
    pub fn start_rtcp_reader(&self, on_keyframe_request: impl Fn() + Send + Sync + 'static) {
        let sender = Arc::clone(&self.video_sender);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                for pkt in &packets {
                    let pkt_any = pkt.as_any();
                    if pkt_any.is::<rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication>()
                        || pkt_any.is::<rtcp::payload_feedbacks::full_intra_request::FullIntraRequest>()
                    {
                        debug!("Received PLI/FIR keyframe request");
                        on_keyframe_request();
                    }
                }
            }
            debug!("RTCP reader finished");
        });
    }

    pub async fn write_video_sample(&self, sample: &EncodedSample) -> anyhow::Result<()> {
        self.video_track
            .write_sample(&webrtc::media::Sample {
                data: sample.payload.clone(),
                duration: sample.duration(),
                ..Default::default()
            })
            .await
            .context("Failed to write video sample")?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.peer_connection.connection_state() == RTCPeerConnectionState::Connected
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn set_remote_description(&self, offer: SessionDescription) -> anyhow::Result<()> {
        log_sdp("Offer", &offer.sdp);
        let offer = RTCSessionDescription::offer(offer.sdp).context("Failed to parse SDP offer")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote description")
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        log_sdp("Answer", &answer.sdp);
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, answer: SessionDescription) -> anyhow::Result<()> {
        let answer =
            RTCSessionDescription::answer(answer.sdp).context("Failed to parse SDP answer")?;
        self.peer_connection
            .set_local_description(answer)
            .await
            .context("Failed to set local description")
    }

    /// webrtc-rs rejects candidates that arrive before the remote
    /// description; the caller logs and drops them.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.peer_connection
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .context("Failed to add ICE candidate")
    }

    async fn close(&self, reason: &str) -> anyhow::Result<()> {
        info!(%reason, "Closing peer connection");
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping() {
        assert_eq!(map_connection_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Connecting),
            Some(ConnectionState::Connecting)
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Disconnected),
            Some(ConnectionState::Disconnected)
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
    }

    #[test]
    fn default_ice_config_is_one_stun_server() {
        let servers = ice_servers(&IceConfig::default());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert!(servers[0].username.is_empty());
    }

    #[test]
    fn turn_servers_carry_credentials() {
        let config = IceConfig {
            stun_urls: vec![],
            turn_urls: vec!["turn:turn.example.com:3478".to_string()],
            turn_username: Some("cam".to_string()),
            turn_credential: Some("secret".to_string()),
        };
        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].username, "cam");
        assert_eq!(servers[0].credential, "secret");
    }

    #[test]
    fn candidate_conversion_keeps_every_field() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.0.2.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };
        assert_eq!(
            from_candidate_init(to_candidate_init(candidate.clone())),
            candidate
        );
    }
}
