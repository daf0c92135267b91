//! Negotiation engine: drives the offer/answer/ICE exchange for every
//! peer, with glare avoidance, timeout retry and ICE restart.
//!
//! One engine per joined session. All signaling for the session flows
//! through [`NegotiationEngine::handle_signal`] in arrival order; peer
//! failures are contained to the one peer and never fail the session on
//! their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::time::sleep;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_remote::TrackRemote;

use crate::config::SessionConfig;
use crate::error::NegotiationError;
use crate::ice::{analyze_candidates, IceProvider};
use crate::logger::{dump_selected_pair, log, log_peer};
use crate::media::LocalStream;
use crate::peer::connection::PeerLink;
use crate::peer::registry::PeerRegistry;
use crate::peer::state::{NegotiationState, PeerRole};
use crate::session::{SessionConnectionState, SessionEvent};
use crate::signaling::{CandidateInit, SignalMessage, SignalPayload, SignalingTransport};

/// Glare avoidance: exactly one of two participants initiates, decided by
/// identity ordering alone. Symmetric and deterministic, no coordination
/// message needed.
pub fn initiates_to(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

pub struct NegotiationEngine {
    local_id: String,
    config: SessionConfig,
    registry: PeerRegistry,
    transport: Arc<dyn SignalingTransport>,
    ice: Arc<IceProvider>,
    local_stream: LocalStream,
    events: broadcast::Sender<SessionEvent>,
    /// Any peer ever reached Connected in this session.
    ever_connected: AtomicBool,
    /// Some peer exhausted its connection attempts.
    exhausted: AtomicBool,
    last_state: Mutex<SessionConnectionState>,
}

impl NegotiationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_id: &str,
        config: SessionConfig,
        registry: PeerRegistry,
        transport: Arc<dyn SignalingTransport>,
        ice: Arc<IceProvider>,
        local_stream: LocalStream,
        events: broadcast::Sender<SessionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.to_string(),
            config,
            registry,
            transport,
            ice,
            local_stream,
            events,
            ever_connected: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            last_state: Mutex::new(SessionConnectionState::New),
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    // ========== SIGNALING DISPATCH ==========

    /// Entry point for every envelope of the session, in arrival order.
    pub async fn handle_signal(self: &Arc<Self>, msg: SignalMessage) {
        if msg.recipient != self.local_id {
            // The transport filters by recipient already; anything else
            // indicates a misrouted relay.
            log(&format!(
                "Ignoring misrouted envelope for {} (we are {})",
                msg.recipient, self.local_id
            ));
            return;
        }
        let sender = msg.sender;
        match msg.payload {
            SignalPayload::Offer { sdp } => self.handle_offer(&sender, sdp).await,
            SignalPayload::Answer { sdp } => self.handle_answer(&sender, sdp).await,
            SignalPayload::IceCandidate { candidate } => {
                self.handle_candidate(&sender, candidate).await
            }
        }
    }

    /// A participant announced itself on the relay. The side with the
    /// smaller identity initiates; the other waits for the offer.
    pub async fn peer_joined(self: &Arc<Self>, remote_id: &str) {
        if remote_id == self.local_id {
            return;
        }
        if initiates_to(&self.local_id, remote_id) {
            self.start_offer(remote_id).await;
        } else {
            log_peer(remote_id, "Peer joined; waiting for their offer");
        }
    }

    pub async fn peer_left(self: &Arc<Self>, remote_id: &str) {
        let Some(link) = self.registry.remove(remote_id) else {
            return;
        };
        log_peer(remote_id, "Peer left; closing link");
        link.close().await;
        self.emit(SessionEvent::PeerDisconnected {
            peer_id: remote_id.to_string(),
        });
        self.emit_state_change();
    }

    // ========== INITIATOR SIDE ==========

    /// Begin connecting toward a newly discovered peer. A no-op when the
    /// registry already holds a link for that identity.
    pub async fn start_offer(self: &Arc<Self>, remote_id: &str) {
        if self.registry.contains(remote_id) {
            log_peer(remote_id, "Already connected/connecting; not offering");
            return;
        }
        self.offer_attempt(remote_id, 1).await;
    }

    async fn offer_attempt(self: &Arc<Self>, remote_id: &str, attempt: u32) {
        log_peer(
            remote_id,
            &format!("Offer attempt {}/{}", attempt, self.config.max_attempts),
        );
        let rtc_config = self.ice.rtc_config(self.config.prefer_local_network);
        let link = match PeerLink::connect(
            Arc::downgrade(self),
            remote_id,
            PeerRole::Initiator,
            attempt,
            rtc_config,
            &self.local_stream,
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                log_peer(remote_id, &format!("Could not build link: {}", e));
                return;
            }
        };

        // Register before the first await on signaling so the very next
        // inbound handler already sees this link.
        if !self.registry.insert(Arc::clone(&link)) {
            link.close().await;
            return;
        }
        link.transition(NegotiationState::Negotiating);

        if let Err(e) = self.send_offer(&link, false).await {
            self.fail_peer(remote_id, e).await;
            return;
        }
        self.arm_offer_timeout(&link);
        self.emit_state_change();
    }

    async fn send_offer(
        &self,
        link: &Arc<PeerLink>,
        ice_restart: bool,
    ) -> Result<(), NegotiationError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = link.pc().create_offer(options).await?;
        link.pc().set_local_description(offer.clone()).await?;
        self.transport
            .send(SignalMessage::offer(&self.local_id, link.remote_id(), offer))
            .await?;
        log_peer(link.remote_id(), "Offer sent");
        Ok(())
    }

    /// The 10-second watchdog for an initiated connection: runs until the
    /// peer reaches Connected and is cancelled on every terminal
    /// transition.
    fn arm_offer_timeout(self: &Arc<Self>, link: &Arc<PeerLink>) {
        let weak = Arc::downgrade(self);
        let remote_id = link.remote_id().to_string();
        let timeout = self.config.offer_timeout;
        link.store_timeout(tokio::spawn(async move {
            sleep(timeout).await;
            if let Some(engine) = weak.upgrade() {
                engine.on_offer_timeout(&remote_id).await;
            }
        }));
    }

    async fn on_offer_timeout(self: &Arc<Self>, remote_id: &str) {
        let Some(link) = self.registry.get(remote_id) else {
            return;
        };
        if link.state() == NegotiationState::Connected {
            return;
        }
        let attempt = link.attempt();
        log_peer(
            remote_id,
            &format!("Connection attempt {} timed out", attempt),
        );
        self.registry.remove(remote_id);
        // This runs on the watchdog task itself. Drop the handle instead
        // of letting close() abort it, or the retry and failure handling
        // below would be cancelled at the next await point.
        link.detach_timeout();
        link.close().await;

        if attempt >= self.config.max_attempts {
            log_peer(remote_id, "Max attempts exhausted; marking peer failed");
            self.exhausted.store(true, Ordering::SeqCst);
            self.emit(SessionEvent::PeerFailed {
                peer_id: remote_id.to_string(),
            });
            self.emit_state_change();
        } else {
            self.offer_attempt(remote_id, attempt + 1).await;
        }
    }

    // ========== RECEIVER SIDE ==========

    async fn handle_offer(self: &Arc<Self>, sender: &str, sdp: RTCSessionDescription) {
        if let Some(link) = self.registry.get(sender) {
            // A settled link accepting a fresh offer is a renegotiation
            // (ICE restart). Anything else is a duplicate offer from
            // retries or reordering: idempotent no-op, one link only.
            let renegotiable = link.signaling_state() == RTCSignalingState::Stable
                && matches!(
                    link.state(),
                    NegotiationState::Connected | NegotiationState::Disconnected
                );
            if renegotiable {
                log_peer(sender, "Renegotiation offer on settled link");
                link.transition(NegotiationState::Negotiating);
                if let Err(e) = self.apply_offer_and_answer(&link, sdp).await {
                    log_peer(sender, &format!("Renegotiation failed: {}", e));
                    self.fail_peer(sender, e).await;
                }
            } else {
                log_peer(sender, "Ignoring duplicate offer for existing link");
            }
            return;
        }

        log_peer(sender, "Offer received; answering");
        let rtc_config = self.ice.rtc_config(self.config.prefer_local_network);
        let link = match PeerLink::connect(
            Arc::downgrade(self),
            sender,
            PeerRole::Receiver,
            1,
            rtc_config,
            &self.local_stream,
        )
        .await
        {
            Ok(link) => link,
            Err(e) => {
                log_peer(sender, &format!("Could not build link: {}", e));
                return;
            }
        };
        if !self.registry.insert(Arc::clone(&link)) {
            // An offer raced us into the registry; keep the existing link.
            link.close().await;
            return;
        }
        link.transition(NegotiationState::Negotiating);
        if let Err(e) = self.apply_offer_and_answer(&link, sdp).await {
            self.fail_peer(sender, e).await;
        }
        self.emit_state_change();
    }

    async fn apply_offer_and_answer(
        &self,
        link: &Arc<PeerLink>,
        sdp: RTCSessionDescription,
    ) -> Result<(), NegotiationError> {
        link.pc().set_remote_description(sdp).await?;
        link.flush_pending_candidates().await;
        let answer = link.pc().create_answer(None).await?;
        link.pc().set_local_description(answer.clone()).await?;
        self.transport
            .send(SignalMessage::answer(
                &self.local_id,
                link.remote_id(),
                answer,
            ))
            .await?;
        log_peer(link.remote_id(), "Answer sent");
        Ok(())
    }

    async fn handle_answer(self: &Arc<Self>, sender: &str, sdp: RTCSessionDescription) {
        let Some(link) = self.registry.get(sender) else {
            log_peer(sender, "Answer from unknown peer; ignored");
            return;
        };
        // Only an outstanding local offer can take an answer. Anything
        // else (double answer, stale answer after retry) is a no-op.
        if link.signaling_state() != RTCSignalingState::HaveLocalOffer {
            log_peer(
                sender,
                &format!(
                    "Answer in signaling state {:?}; ignored",
                    link.signaling_state()
                ),
            );
            return;
        }
        match link.pc().set_remote_description(sdp).await {
            Ok(()) => {
                log_peer(sender, "Answer applied");
                link.flush_pending_candidates().await;
            }
            Err(e) => {
                self.fail_peer(sender, NegotiationError::from(e)).await;
            }
        }
    }

    async fn handle_candidate(self: &Arc<Self>, sender: &str, candidate: CandidateInit) {
        let Some(link) = self.registry.get(sender) else {
            log_peer(sender, "Candidate for unknown peer; dropped");
            return;
        };
        if link.state().is_terminal() {
            log_peer(sender, "Candidate for closed link; dropped");
            return;
        }
        if link.remote_description_set().await {
            if let Err(e) = link.pc().add_ice_candidate(candidate.into()).await {
                log_peer(sender, &format!("Failed to add candidate: {:?}", e));
            }
        } else {
            // Buffered until the remote description lands, then flushed.
            log_peer(sender, "Remote description not set yet; buffering candidate");
            link.push_pending_candidate(candidate);
        }
    }

    // ========== LINK CALLBACKS ==========

    pub(crate) async fn on_local_candidate(&self, remote_id: &str, candidate: CandidateInit) {
        if let Some(link) = self.registry.get(remote_id) {
            link.record_local_candidate(candidate.clone());
        }
        let msg = SignalMessage::candidate(&self.local_id, remote_id, candidate);
        if let Err(e) = self.transport.send(msg).await {
            log_peer(remote_id, &format!("Failed to trickle candidate: {}", e));
        }
    }

    pub(crate) async fn on_peer_state(
        self: &Arc<Self>,
        remote_id: &str,
        state: RTCPeerConnectionState,
    ) {
        let Some(link) = self.registry.get(remote_id) else {
            return;
        };
        match state {
            RTCPeerConnectionState::Connected => {
                link.clear_timeout();
                let recovered = link.state() == NegotiationState::Disconnected
                    || link.restart_pending();
                link.clear_restart();
                link.transition(NegotiationState::Connected);
                self.ever_connected.store(true, Ordering::SeqCst);
                if recovered {
                    self.emit(SessionEvent::ConnectionRecovered {
                        peer_id: remote_id.to_string(),
                    });
                } else {
                    self.emit(SessionEvent::PeerConnected {
                        peer_id: remote_id.to_string(),
                    });
                }
                analyze_candidates(&link.local_candidates());
                dump_selected_pair(remote_id, link.pc(), "connected").await;
                self.emit_state_change();
            }
            RTCPeerConnectionState::Disconnected => {
                if link.state() == NegotiationState::Connected {
                    link.transition(NegotiationState::Disconnected);
                    self.emit(SessionEvent::ConnectionProblem {
                        peer_id: remote_id.to_string(),
                    });
                    self.emit_state_change();
                }
            }
            RTCPeerConnectionState::Failed => {
                // Unrecoverable at the transport level: contain to this peer.
                self.fail_peer(remote_id, NegotiationError::Ice("connection failed".into()))
                    .await;
            }
            RTCPeerConnectionState::Closed => {
                if let Some(link) = self.registry.remove(remote_id) {
                    link.clear_timeout();
                    link.clear_restart();
                    self.emit_state_change();
                }
            }
            _ => {}
        }
    }

    pub(crate) async fn on_ice_state(
        self: &Arc<Self>,
        remote_id: &str,
        state: RTCIceConnectionState,
    ) {
        let Some(link) = self.registry.get(remote_id) else {
            return;
        };
        match state {
            RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed => {
                if link.restart_pending() {
                    return;
                }
                // Wait out the grace period before restarting; brief
                // network blips recover on their own.
                self.emit(SessionEvent::ConnectionRecovering {
                    peer_id: remote_id.to_string(),
                });
                let weak = Arc::downgrade(self);
                let peer = remote_id.to_string();
                let grace = self.config.ice_restart_grace;
                link.store_restart(tokio::spawn(async move {
                    sleep(grace).await;
                    if let Some(engine) = weak.upgrade() {
                        engine.after_restart_grace(&peer).await;
                    }
                }));
            }
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                if link.restart_pending() {
                    link.clear_restart();
                }
            }
            _ => {}
        }
    }

    async fn after_restart_grace(self: &Arc<Self>, remote_id: &str) {
        let Some(link) = self.registry.get(remote_id) else {
            return;
        };
        let ice_state = link.pc().ice_connection_state();
        if !matches!(
            ice_state,
            RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed
        ) {
            log_peer(remote_id, "ICE recovered during grace period");
            return;
        }
        match link.role() {
            PeerRole::Initiator => {
                log_peer(remote_id, "Grace over; attempting ICE restart");
                link.transition(NegotiationState::Negotiating);
                if let Err(e) = self.send_offer(&link, true).await {
                    // Running on the restart task; drop the handle so
                    // fail_peer's close does not cancel us mid-teardown.
                    link.detach_restart();
                    self.fail_peer(remote_id, e).await;
                }
            }
            PeerRole::Receiver => {
                // The initiator owns the restart offer; we hold on.
                log_peer(remote_id, "Grace over; waiting for initiator's restart");
            }
        }
    }

    pub(crate) async fn on_remote_track(&self, remote_id: &str, track: Arc<TrackRemote>) {
        let Some(link) = self.registry.get(remote_id) else {
            return;
        };
        let stream_id = track.stream_id();
        log_peer(
            remote_id,
            &format!("Remote track: kind={} stream={}", track.kind(), stream_id),
        );
        if link.add_remote_track(track) {
            self.emit(SessionEvent::RemoteStream {
                peer_id: remote_id.to_string(),
                stream_id,
            });
        }
    }

    // ========== TEARDOWN & DERIVED STATE ==========

    /// Tear down one peer after a contained failure. The session keeps
    /// running with the remaining peers.
    async fn fail_peer(&self, remote_id: &str, err: NegotiationError) {
        log_peer(remote_id, &format!("Peer torn down: {}", err));
        if let Some(link) = self.registry.remove(remote_id) {
            link.close().await;
        }
        self.emit(SessionEvent::PeerDisconnected {
            peer_id: remote_id.to_string(),
        });
        self.emit_state_change();
    }

    /// Close every link and empty the registry. Cancels all pending
    /// timeouts as part of each close.
    pub async fn shutdown(&self) {
        for link in self.registry.clear() {
            link.close().await;
        }
    }

    /// Aggregate session connection state, derived from the registry.
    pub fn session_state(&self) -> SessionConnectionState {
        if self.registry.connected_count() > 0 {
            SessionConnectionState::Connected
        } else if self.ever_connected.load(Ordering::SeqCst) {
            SessionConnectionState::Disconnected
        } else if self.exhausted.load(Ordering::SeqCst) {
            SessionConnectionState::Failed
        } else if !self.registry.is_empty() {
            SessionConnectionState::Connecting
        } else {
            SessionConnectionState::New
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state_change(&self) {
        let state = self.session_state();
        let mut last = self.last_state.lock().unwrap();
        if *last != state {
            log(&format!("Session state {:?} -> {:?}", *last, state));
            *last = state;
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FakeDevices, MediaConstraints, MediaDevices};
    use crate::signaling::{MemoryRelay, SignalEvent};
    use tokio::sync::mpsc;
    use webrtc::api::media_engine::MediaEngine;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::RTCPeerConnection;

    #[test]
    fn initiator_tie_break_is_deterministic_and_exclusive() {
        let ids = ["alice", "bob", "carol", "0x01", "zz"];
        for a in ids {
            for b in ids {
                if a == b {
                    continue;
                }
                // exactly one side initiates, same answer from both views
                assert_ne!(initiates_to(a, b), initiates_to(b, a));
                assert_eq!(initiates_to(a, b), a < b);
            }
        }
    }

    async fn aux_pc() -> RTCPeerConnection {
        let mut m = MediaEngine::default();
        m.register_default_codecs().unwrap();
        let mut registry = webrtc::interceptor::registry::Registry::new();
        registry = webrtc::api::interceptor_registry::register_default_interceptors(registry, &mut m)
            .unwrap();
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();
        api.new_peer_connection(Default::default()).await.unwrap()
    }

    async fn test_engine(
        hub: &Arc<MemoryRelay>,
        id: &str,
    ) -> (Arc<NegotiationEngine>, mpsc::UnboundedReceiver<SignalEvent>) {
        let transport = hub.client(id);
        let rx = transport.connect().await.unwrap();
        let (events, _) = broadcast::channel(64);
        // real audio+video tracks so offers carry media sections
        let stream = FakeDevices::new()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        let engine = NegotiationEngine::new(
            id,
            SessionConfig::default(),
            PeerRegistry::new(),
            transport,
            Arc::new(IceProvider::new(vec![])),
            stream,
            events,
        );
        (engine, rx)
    }

    /// Skip interleaved candidate trickle until the next offer arrives.
    async fn next_offer(rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> RTCSessionDescription {
        loop {
            if let SignalEvent::Message(m) = rx.recv().await.expect("relay closed") {
                if let SignalPayload::Offer { sdp } = m.payload {
                    return sdp;
                }
            }
        }
    }

    async fn next_answer(rx: &mut mpsc::UnboundedReceiver<SignalEvent>) -> RTCSessionDescription {
        loop {
            if let SignalEvent::Message(m) = rx.recv().await.expect("relay closed") {
                if let SignalPayload::Answer { sdp } = m.payload {
                    return sdp;
                }
            }
        }
    }

    #[tokio::test]
    async fn early_candidates_are_buffered_and_flushed_on_answer() {
        // The source-of-truth behavior: candidates arriving before the
        // remote description are buffered, not dropped, and flushed once
        // the description lands.
        let hub = MemoryRelay::new();
        let (engine, _rx_a) = test_engine(&hub, "alice").await;
        let bob = hub.client("bob");
        let mut rx_b = bob.connect().await.unwrap();

        engine.start_offer("bob").await;
        let offer = next_offer(&mut rx_b).await;

        // candidate arrives before bob's answer
        engine
            .handle_candidate(
                "bob",
                CandidateInit {
                    candidate: "candidate:1 1 UDP 2122252543 127.0.0.1 50000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            )
            .await;
        let link = engine.registry().get("bob").unwrap();
        assert_eq!(link.pending_candidate_count(), 1);

        // bob answers through an auxiliary connection
        let pc = aux_pc().await;
        pc.set_remote_description(offer).await.unwrap();
        let answer = pc.create_answer(None).await.unwrap();
        pc.set_local_description(answer.clone()).await.unwrap();

        engine.handle_answer("bob", answer).await;
        assert_eq!(link.pending_candidate_count(), 0);
        assert!(link.remote_description_set().await);

        pc.close().await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn answer_in_wrong_state_is_a_no_op() {
        let hub = MemoryRelay::new();
        let (engine, _rx_a) = test_engine(&hub, "alice").await;
        let bob = hub.client("bob");
        let mut rx_b = bob.connect().await.unwrap();

        // bob offers; alice answers; the link settles into Stable
        let pc = aux_pc().await;
        pc.create_data_channel("x", None).await.unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();
        engine.handle_offer("bob", offer).await;

        let first_answer = next_answer(&mut rx_b).await;
        let link = engine.registry().get("bob").unwrap();
        assert_eq!(link.signaling_state(), RTCSignalingState::Stable);
        let state_before = link.state();

        // a stray answer arrives even though no local offer is pending
        engine.handle_answer("bob", first_answer).await;

        // no state corruption, no teardown, still exactly one link
        assert_eq!(engine.registry().len(), 1);
        assert_eq!(link.state(), state_before);

        pc.close().await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_offer_keeps_a_single_link() {
        let hub = MemoryRelay::new();
        let (engine, _rx_a) = test_engine(&hub, "alice").await;
        let bob = hub.client("bob");
        let _rx_b = bob.connect().await.unwrap();

        let pc = aux_pc().await;
        pc.create_data_channel("x", None).await.unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();

        // two offers in quick succession, as a network retry would produce
        engine.handle_offer("bob", offer.clone()).await;
        let link_before = engine.registry().get("bob").unwrap();
        engine.handle_offer("bob", offer).await;

        assert_eq!(engine.registry().len(), 1);
        assert!(Arc::ptr_eq(
            &engine.registry().get("bob").unwrap(),
            &link_before
        ));

        pc.close().await.unwrap();
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn watchdog_runs_the_full_retry_chain_before_failing() {
        // The timeout handler executes on the watchdog task itself, so
        // closing the timed-out link must not cancel the handler: every
        // attempt has to run and the exhaustion has to surface.
        let hub = MemoryRelay::new();
        let transport = hub.client("alice");
        let _rx = transport.connect().await.unwrap();
        let (events, mut events_rx) = broadcast::channel(64);
        let stream = FakeDevices::new()
            .acquire(&MediaConstraints::default())
            .await
            .unwrap();
        let config = SessionConfig {
            offer_timeout: std::time::Duration::from_millis(100),
            max_attempts: 2,
            ..SessionConfig::default()
        };
        let engine = NegotiationEngine::new(
            "alice",
            config,
            PeerRegistry::new(),
            transport,
            Arc::new(IceProvider::new(vec![])),
            stream,
            events,
        );

        // nobody named "ghost" is on the relay; offers go nowhere
        engine.start_offer("ghost").await;

        loop {
            let event = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                events_rx.recv(),
            )
            .await
            .expect("retries never exhausted")
            .unwrap();
            if let SessionEvent::PeerFailed { peer_id } = event {
                assert_eq!(peer_id, "ghost");
                break;
            }
        }
        assert!(engine.registry().is_empty());
        assert_eq!(engine.session_state(), SessionConnectionState::Failed);
    }

    #[tokio::test]
    async fn candidate_for_unknown_peer_is_dropped_without_panic() {
        let hub = MemoryRelay::new();
        let (engine, _rx) = test_engine(&hub, "alice").await;
        engine
            .handle_candidate(
                "stranger",
                CandidateInit {
                    candidate: "candidate:1 1 UDP 2122252543 127.0.0.1 50000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            )
            .await;
        assert!(engine.registry().is_empty());
    }
}
