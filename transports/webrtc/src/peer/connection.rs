//! webrtc-rs backed transport engine

use super::{
    AudioSink, CandidateCallback, IceConnectionState, PeerConnectionState, RtcConnection,
    RtcEngine, StateCallback, StateChange, VideoSink,
};
use crate::config::{IceServerConfig, DEFAULT_VIDEO_FRAMERATE};
use crate::media::tracks::{AudioTrack, VideoTrack};
use crate::media::video::{VideoEncoderFactory, DEFAULT_VIDEO_MIME_TYPE, VIDEO_CLOCK_RATE};
use crate::signaling::message::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Engine creating webrtc-rs peer connections
///
/// Audio tracks are Opus. Video tracks use the configured
/// [`VideoEncoderFactory`]; without one, raw frames are dropped.
#[derive(Clone)]
pub struct WebRtcEngine {
    video_encoder: Option<VideoEncoderFactory>,
    video_framerate: u32,
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self {
            video_encoder: None,
            video_framerate: DEFAULT_VIDEO_FRAMERATE,
        }
    }
}

impl WebRtcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode outgoing video with encoders built by `factory`
    pub fn with_video_encoder(mut self, factory: VideoEncoderFactory) -> Self {
        self.video_encoder = Some(factory);
        self
    }

    /// Frame rate used for video sample durations
    pub fn with_video_framerate(mut self, framerate: u32) -> Self {
        self.video_framerate = framerate;
        self
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<Arc<dyn RtcConnection>> {
        let connection = WebRtcConnection::new(
            ice_servers,
            self.video_encoder.clone(),
            self.video_framerate,
        )
        .await?;
        Ok(Arc::new(connection))
    }
}

/// One webrtc-rs peer connection
pub struct WebRtcConnection {
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    candidate_callback: Arc<Mutex<Option<Arc<CandidateCallback>>>>,
    state_callbacks: Arc<Mutex<Vec<Arc<StateCallback>>>>,
    /// RTP senders (retained to prevent track cleanup)
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
    video_encoder: Option<VideoEncoderFactory>,
    video_framerate: u32,
}

impl WebRtcConnection {
    #[instrument(skip_all, fields(ice_servers = ice_servers.len()))]
    async fn new(
        ice_servers: &[IceServerConfig],
        video_encoder: Option<VideoEncoderFactory>,
        video_framerate: u32,
    ) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = ice_servers
            .iter()
            .map(|server| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                }
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        let candidate_callback: Arc<Mutex<Option<Arc<CandidateCallback>>>> =
            Arc::new(Mutex::new(None));
        let state_callbacks: Arc<Mutex<Vec<Arc<StateCallback>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let slot = Arc::clone(&candidate_callback);
        peer_connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let candidate = match c {
                Some(c) => match c.to_json() {
                    Ok(init) => Some(candidate_from_init(init)),
                    Err(e) => {
                        warn!("Failed to serialize local ICE candidate: {}", e);
                        return Box::pin(async {});
                    }
                },
                None => None,
            };
            let callback = slot.lock().clone();
            if let Some(callback) = callback {
                callback(candidate);
            }
            Box::pin(async {})
        }));

        let callbacks = Arc::clone(&state_callbacks);
        let id = connection_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let state = map_connection_state(s);
                debug!(connection_id = %id, ?state, "Peer connection state changed");
                dispatch(&callbacks, StateChange::Connection(state));
                Box::pin(async {})
            },
        ));

        let callbacks = Arc::clone(&state_callbacks);
        let id = connection_id.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |s: RTCIceConnectionState| {
                let state = map_ice_state(s);
                debug!(connection_id = %id, ?state, "ICE connection state changed");
                dispatch(&callbacks, StateChange::Ice(state));
                Box::pin(async {})
            },
        ));

        info!(connection_id = %connection_id, "Created peer connection");

        Ok(Self {
            connection_id,
            peer_connection,
            candidate_callback,
            state_callbacks,
            senders: Mutex::new(Vec::new()),
            video_encoder,
            video_framerate,
        })
    }

    /// Get the underlying WebRTC peer connection
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    async fn add_track(&self, track: Arc<TrackLocalStaticSample>, kind: &str) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add {} track: {}", kind, e)))?;

        // RTCP must be read for interceptors (NACK, reports) to run
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().push(sender);
        Ok(())
    }
}

fn dispatch(callbacks: &Mutex<Vec<Arc<StateCallback>>>, change: StateChange) {
    let callbacks = callbacks.lock().clone();
    for callback in callbacks {
        callback(change);
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn candidate_to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(Error::SdpError(
                "rollback descriptions are not supported".to_string(),
            ))
        }
    };
    parsed.map_err(|e| Error::SdpError(format!("Failed to parse SDP: {}", e)))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(Error::SdpError(format!(
                "unexpected SDP type {:?}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn add_audio_track(&self) -> Result<Arc<dyn AudioSink>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            "audio".to_string(),
            format!("stream-{}", self.connection_id),
        ));
        self.add_track(Arc::clone(&track), "audio").await?;
        debug!(connection_id = %self.connection_id, "Audio track added");
        Ok(Arc::new(AudioTrack::new(track)))
    }

    async fn add_video_track(&self) -> Result<Arc<dyn VideoSink>> {
        let encoder = match self.video_encoder.as_ref() {
            Some(factory) => Some(factory()?),
            None => None,
        };
        let (mime_type, sdp_fmtp_line) = match encoder.as_ref() {
            Some(e) => (e.mime_type().to_string(), e.sdp_fmtp_line().to_string()),
            None => (DEFAULT_VIDEO_MIME_TYPE.to_string(), String::new()),
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type,
                clock_rate: VIDEO_CLOCK_RATE,
                channels: 0,
                sdp_fmtp_line,
                rtcp_feedback: vec![],
            },
            "video".to_string(),
            format!("stream-{}", self.connection_id),
        ));
        self.add_track(Arc::clone(&track), "video").await?;
        debug!(connection_id = %self.connection_id, "Video track added");
        Ok(Arc::new(VideoTrack::new(
            track,
            encoder,
            self.video_framerate,
        )))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.peer_connection.local_description().await?;
        match from_rtc_description(description) {
            Ok(description) => Some(description),
            Err(e) => {
                warn!("Unusable local description: {}", e);
                None
            }
        }
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        debug!(
            connection_id = %self.connection_id,
            candidate = %candidate.candidate,
            "Adding remote ICE candidate"
        );
        self.peer_connection
            .add_ice_candidate(candidate_to_init(candidate))
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        info!(connection_id = %self.connection_id, "Closing peer connection");
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_connection_state(self.peer_connection.connection_state())
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.peer_connection.ice_connection_state())
    }

    fn on_ice_candidate(&self, callback: CandidateCallback) {
        *self.candidate_callback.lock() = Some(Arc::new(callback));
    }

    fn on_state_change(&self, callback: StateCallback) {
        self.state_callbacks.lock().push(Arc::new(callback));
    }
}
