use bytes::Bytes;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::audio::{resample, AudioStream};
use crate::error::{AppError, Result};
use crate::room::RoomEvent;
use crate::signaling::{SignalingMessage, SignalingSender};

/// Sample rate of the audio carried between peers.
pub const WIRE_SAMPLE_RATE: u32 = 48_000;
/// Samples per RTP packet; keeps each packet well under the MTU.
pub const SAMPLES_PER_PACKET: usize = 240;

pub fn build_api() -> Result<API> {
    // Create a MediaEngine object to configure the supported codec
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Raw little-endian f32 frames; both ends of a call run this code.
pub fn encode_payload(samples: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}

pub fn decode_payload(payload: &[u8]) -> Vec<f32> {
    payload
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn local_track(stream: &AudioStream) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: WIRE_SAMPLE_RATE,
            channels: 1,
            ..Default::default()
        },
        "audio".to_owned(),
        stream.id().to_owned(),
    ))
}

/// Copies `stream` into `track`, one packet of `SAMPLES_PER_PACKET` at a time.
pub fn spawn_track_writer(stream: &AudioStream, track: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    let mut frames = stream.subscribe();
    let source_rate = stream.sample_rate();
    let packet_duration = Duration::from_secs_f64(SAMPLES_PER_PACKET as f64 / WIRE_SAMPLE_RATE as f64);

    tokio::spawn(async move {
        let mut pending: Vec<f32> = Vec::with_capacity(SAMPLES_PER_PACKET * 4);
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    pending.extend(resample(&frame, source_rate, WIRE_SAMPLE_RATE));
                    while pending.len() >= SAMPLES_PER_PACKET {
                        let packet: Vec<f32> = pending.drain(..SAMPLES_PER_PACKET).collect();
                        let sample = Sample {
                            data: encode_payload(&packet),
                            duration: packet_duration,
                            ..Default::default()
                        };
                        if let Err(e) = track.write_sample(&sample).await {
                            tracing::warn!("Failed to write audio sample: {}", e);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("track writer skipped {} frames", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the first offer.
    Offerer,
    /// Waits for the remote offer.
    Answerer,
}

/// One WebRTC connection to one remote peer of the room.
pub struct PeerLink {
    local_id: String,
    peer_id: String,
    role: Role,
    peer_connection: Arc<RTCPeerConnection>,
    sender: Mutex<Option<Arc<RTCRtpSender>>>,
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    readers: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    signaling: SignalingSender,
}

impl PeerLink {
    pub async fn new(
        api: &API,
        ice_servers: &[String],
        local_id: &str,
        peer_id: &str,
        role: Role,
        signaling: SignalingSender,
        events: mpsc::UnboundedSender<RoomEvent>,
    ) -> Result<Arc<Self>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);
        let readers = Arc::new(StdMutex::new(Vec::new()));

        // Trickle ICE through the relay
        let ice_signaling = signaling.clone();
        let from_peer = local_id.to_string();
        let to_peer = peer_id.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signaling = ice_signaling.clone();
            let from_peer = from_peer.clone();
            let to_peer = to_peer.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let encoded = candidate
                    .to_json()
                    .map_err(AppError::from)
                    .and_then(|init| serde_json::to_string(&init).map_err(AppError::from));
                match encoded {
                    Ok(candidate) => {
                        let _ = signaling
                            .send(SignalingMessage::IceCandidate {
                                from_peer,
                                to_peer,
                                candidate,
                            })
                            .await;
                    }
                    Err(e) => tracing::warn!("could not encode ICE candidate: {}", e),
                }
            })
        }));

        // Set up track handling
        let track_peer = peer_id.to_string();
        let track_readers = readers.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                if track.kind() == RTPCodecType::Audio {
                    let stream = AudioStream::new(track_peer.clone(), WIRE_SAMPLE_RATE);
                    let reader = spawn_track_reader(track, stream.clone());
                    if let Ok(mut readers) = track_readers.lock() {
                        readers.push(reader);
                    }
                    let _ = events.send(RoomEvent::PeerStream {
                        peer_id: track_peer.clone(),
                        stream,
                    });
                }
                Box::pin(async {})
            },
        ));

        let state_peer = peer_id.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer Connection State with {} has changed: {}", state_peer, s);
            Box::pin(async {})
        }));

        Ok(Arc::new(Self {
            local_id: local_id.to_string(),
            peer_id: peer_id.to_string(),
            role,
            peer_connection,
            sender: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            readers,
            signaling,
        }))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Starts sending `track`. Sending the same link a track twice is a no-op.
    pub async fn attach(&self, track: Arc<TrackLocalStaticSample>) -> Result<()> {
        {
            let mut sender = self.sender.lock().await;
            if sender.is_some() {
                return Ok(());
            }
            let rtp_sender = self
                .peer_connection
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            *sender = Some(rtp_sender);
        }
        self.negotiate().await
    }

    pub async fn detach(&self) -> Result<()> {
        let removed = self.sender.lock().await.take();
        if let Some(rtp_sender) = removed {
            self.peer_connection.remove_track(&rtp_sender).await?;
            self.negotiate().await?;
        }
        Ok(())
    }

    /// Offers when this side may: the offerer before its first answer, or
    /// either side once a previous exchange has settled.
    async fn negotiate(&self) -> Result<()> {
        if self.peer_connection.connection_state() == RTCPeerConnectionState::Closed {
            return Ok(());
        }
        let has_remote = self.peer_connection.remote_description().await.is_some();
        let stable = self.peer_connection.signaling_state() == RTCSignalingState::Stable;
        let may_offer = match (self.role, has_remote) {
            (Role::Offerer, false) => stable,
            (_, true) => stable,
            (Role::Answerer, false) => false,
        };
        if may_offer {
            self.send_offer().await?;
        }
        Ok(())
    }

    async fn send_offer(&self) -> Result<()> {
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer.clone()).await?;
        self.signaling
            .send(SignalingMessage::Offer {
                from_peer: self.local_id.clone(),
                to_peer: self.peer_id.clone(),
                sdp: serde_json::to_string(&offer)?,
            })
            .await
    }

    pub async fn handle_offer(&self, sdp: &str) -> Result<()> {
        let offer: RTCSessionDescription = serde_json::from_str(sdp)?;
        self.peer_connection.set_remote_description(offer).await?;
        self.flush_candidates().await?;

        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer.clone()).await?;
        self.signaling
            .send(SignalingMessage::Answer {
                from_peer: self.local_id.clone(),
                to_peer: self.peer_id.clone(),
                sdp: serde_json::to_string(&answer)?,
            })
            .await
    }

    pub async fn handle_answer(&self, sdp: &str) -> Result<()> {
        let answer: RTCSessionDescription = serde_json::from_str(sdp)?;
        self.peer_connection.set_remote_description(answer).await?;
        self.flush_candidates().await
    }

    /// Candidates that arrive before the remote description are held back.
    pub async fn add_ice_candidate(&self, candidate: &str) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
        if self.peer_connection.remote_description().await.is_none() {
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn flush_candidates(&self) -> Result<()> {
        let pending: Vec<_> = self.pending_candidates.lock().await.drain(..).collect();
        for init in pending {
            self.peer_connection.add_ice_candidate(init).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Ok(mut readers) = self.readers.lock() {
            for reader in readers.drain(..) {
                reader.abort();
            }
        }
        if let Err(e) = self.peer_connection.close().await {
            tracing::warn!("closing connection to {} failed: {}", self.peer_id, e);
        }
    }
}

fn spawn_track_reader(track: Arc<TrackRemote>, stream: AudioStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((packet, _)) = track.read_rtp().await {
            stream.push(&decode_payload(&packet.payload));
        }
        stream.stop();
    })
}
