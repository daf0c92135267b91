//! One live peer link: the RTCPeerConnection for a single remote
//! participant, its negotiation state, pending work (offer timeout, ICE
//! restart grace) and the remote stream it delivers.
//!
//! Links are owned exclusively by the [`PeerRegistry`](crate::peer::registry::PeerRegistry)
//! for their lifetime and destroyed on peer leave, session leave, or
//! unrecoverable failure.

use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::NegotiationError;
use crate::logger::{dump_candidate, log_peer};
use crate::media::LocalStream;
use crate::negotiation::NegotiationEngine;
use crate::peer::state::{NegotiationState, PeerRole};
use crate::signaling::CandidateInit;

/// Remote media stream of one peer, keyed by stream id. At most one per
/// link; replaced wholesale when the peer's stream changes identity.
#[derive(Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<Arc<TrackRemote>>,
}

pub struct PeerLink {
    remote_id: String,
    role: PeerRole,
    attempt: u32,
    pc: Arc<RTCPeerConnection>,
    state: Mutex<NegotiationState>,
    timeout_task: Mutex<Option<JoinHandle<()>>>,
    restart_task: Mutex<Option<JoinHandle<()>>>,
    /// Candidates that arrived before the remote description; flushed
    /// once it is set.
    pending_candidates: Mutex<Vec<CandidateInit>>,
    /// Locally gathered candidates, kept for connectivity diagnostics.
    local_candidates: Mutex<Vec<CandidateInit>>,
    remote_stream: Mutex<Option<RemoteStream>>,
}

impl PeerLink {
    /// Build the underlying RTCPeerConnection, attach the shared local
    /// tracks and wire every callback into the negotiation engine.
    pub async fn connect(
        engine: Weak<NegotiationEngine>,
        remote_id: &str,
        role: PeerRole,
        attempt: u32,
        rtc_config: RTCConfiguration,
        local: &LocalStream,
    ) -> Result<Arc<Self>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

        // Shared read-only track references; every link sees the same
        // local tracks.
        for local_track in local.tracks() {
            let rtp_sender = pc
                .add_track(local_track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // Drain RTCP for the sender so interceptors keep running.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while rtp_sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }

        let link = Arc::new(Self {
            remote_id: remote_id.to_string(),
            role,
            attempt,
            pc,
            state: Mutex::new(NegotiationState::New),
            timeout_task: Mutex::new(None),
            restart_task: Mutex::new(None),
            pending_candidates: Mutex::new(Vec::new()),
            local_candidates: Mutex::new(Vec::new()),
            remote_stream: Mutex::new(None),
        });

        link.wire_callbacks(engine);
        log_peer(
            remote_id,
            &format!("Link created (role={:?}, attempt={})", role, attempt),
        );
        Ok(link)
    }

    fn wire_callbacks(&self, engine: Weak<NegotiationEngine>) {
        // Local trickle candidates go straight out through signaling.
        let cand_engine = engine.clone();
        let cand_peer = self.remote_id.clone();
        self.pc
            .on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
                let engine = cand_engine.clone();
                let peer = cand_peer.clone();
                Box::pin(async move {
                    let Some(c) = cand else {
                        log_peer(&peer, "ICE candidate gathering completed");
                        return;
                    };
                    dump_candidate(&peer, "LOCAL", &c);
                    let Ok(init) = c.to_json() else { return };
                    if let Some(engine) = engine.upgrade() {
                        engine
                            .on_local_candidate(
                                &peer,
                                CandidateInit {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                },
                            )
                            .await;
                    }
                })
            }));

        let state_engine = engine.clone();
        let state_peer = self.remote_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
                let engine = state_engine.clone();
                let peer = state_peer.clone();
                log_peer(&peer, &format!("Peer connection state: {:?}", st));
                Box::pin(async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.on_peer_state(&peer, st).await;
                    }
                })
            }));

        let ice_engine = engine.clone();
        let ice_peer = self.remote_id.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
                let engine = ice_engine.clone();
                let peer = ice_peer.clone();
                log_peer(&peer, &format!("ICE connection state: {:?}", st));
                Box::pin(async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.on_ice_state(&peer, st).await;
                    }
                })
            }));

        let track_engine = engine;
        let track_peer = self.remote_id.clone();
        self.pc
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let engine = track_engine.clone();
                let peer = track_peer.clone();
                Box::pin(async move {
                    if let Some(engine) = engine.upgrade() {
                        engine.on_remote_track(&peer, track).await;
                    }
                })
            }));
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn pc(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock().unwrap()
    }

    /// Checked transition; illegal moves are logged and refused.
    pub fn transition(&self, next: NegotiationState) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition(next) {
            log_peer(
                &self.remote_id,
                &format!("Refusing illegal transition {:?} -> {:?}", *state, next),
            );
            return false;
        }
        log_peer(
            &self.remote_id,
            &format!("State {:?} -> {:?}", *state, next),
        );
        *state = next;
        true
    }

    pub fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    pub async fn remote_description_set(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    // ----- pending work -----

    /// Arm the connection-attempt timeout, replacing any previous one.
    pub fn store_timeout(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.timeout_task.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    pub fn clear_timeout(&self) {
        if let Some(handle) = self.timeout_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Drop the watchdog handle without aborting the task. The watchdog
    /// calls this about itself before closing the link, so the retry and
    /// failure handling it still has to run is not cancelled mid-flight.
    pub fn detach_timeout(&self) {
        self.timeout_task.lock().unwrap().take();
    }

    pub fn store_restart(&self, handle: JoinHandle<()>) {
        if let Some(old) = self.restart_task.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_task.lock().unwrap().is_some()
    }

    pub fn clear_restart(&self) {
        if let Some(handle) = self.restart_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Restart-task counterpart of [`Self::detach_timeout`].
    pub fn detach_restart(&self) {
        self.restart_task.lock().unwrap().take();
    }

    // ----- candidates -----

    pub fn push_pending_candidate(&self, candidate: CandidateInit) {
        self.pending_candidates.lock().unwrap().push(candidate);
    }

    pub fn record_local_candidate(&self, candidate: CandidateInit) {
        self.local_candidates.lock().unwrap().push(candidate);
    }

    pub fn local_candidates(&self) -> Vec<CandidateInit> {
        self.local_candidates.lock().unwrap().clone()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().unwrap().len()
    }

    /// Apply every buffered candidate now that the remote description is
    /// set. Individual failures are logged and skipped.
    pub async fn flush_pending_candidates(&self) {
        let drained: Vec<CandidateInit> = {
            let mut pending = self.pending_candidates.lock().unwrap();
            pending.drain(..).collect()
        };
        for candidate in drained {
            log_peer(&self.remote_id, "Applying buffered candidate");
            if let Err(e) = self.pc.add_ice_candidate(candidate.into()).await {
                log_peer(
                    &self.remote_id,
                    &format!("Failed to apply buffered candidate: {:?}", e),
                );
            }
        }
    }

    // ----- remote stream -----

    /// Record a remote track. Tracks of the same stream id accumulate into
    /// one stream; a new stream id replaces the old stream entirely.
    /// Returns true when a (possibly new) stream entry was created.
    pub fn add_remote_track(&self, track: Arc<TrackRemote>) -> bool {
        let stream_id = track.stream_id();
        let mut slot = self.remote_stream.lock().unwrap();
        match slot.as_mut() {
            Some(stream) if stream.id == stream_id => {
                let track_id = track.id();
                if stream.tracks.iter().any(|t| t.id() == track_id) {
                    return false; // never duplicated for the same track
                }
                stream.tracks.push(track);
                false
            }
            Some(stream) => {
                log_peer(
                    &self.remote_id,
                    &format!("Remote stream replaced: {} -> {}", stream.id, stream_id),
                );
                *slot = Some(RemoteStream {
                    id: stream_id,
                    tracks: vec![track],
                });
                true
            }
            None => {
                *slot = Some(RemoteStream {
                    id: stream_id,
                    tracks: vec![track],
                });
                true
            }
        }
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.remote_stream.lock().unwrap().clone()
    }

    /// Tear the link down: cancel pending work, mark Closed, close the
    /// underlying connection. Safe to call more than once.
    pub async fn close(&self) {
        self.clear_timeout();
        self.clear_restart();
        self.transition(NegotiationState::Closed);
        if let Err(e) = self.pc.close().await {
            log_peer(&self.remote_id, &format!("Close error: {:?}", e));
        }
    }
}
