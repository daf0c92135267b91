//! Signaling transport: the duplex message channel between session
//! participants, relayed through an external pub/sub mechanism.
//!
//! The transport guarantees that a message addressed to a recipient is
//! delivered only to that recipient, and that presence events fire exactly
//! once per join/leave transition. The subscription is session-scoped;
//! `disconnect` unsubscribes fully.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::SignalingError;
use crate::logger::log;

/// ICE candidate as carried over signaling.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl From<CandidateInit> for RTCIceCandidateInit {
    fn from(c: CandidateInit) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: None,
        }
    }
}

/// Typed payload of a signaling envelope.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: RTCSessionDescription },
    Answer { sdp: RTCSessionDescription },
    IceCandidate { candidate: CandidateInit },
}

/// Signaling envelope, addressed by participant identity. Transient:
/// consumed exactly once by the negotiation handler for its type.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignalMessage {
    pub sender: String,
    pub recipient: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalMessage {
    pub fn offer(sender: &str, recipient: &str, sdp: RTCSessionDescription) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            payload: SignalPayload::Offer { sdp },
        }
    }

    pub fn answer(sender: &str, recipient: &str, sdp: RTCSessionDescription) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            payload: SignalPayload::Answer { sdp },
        }
    }

    pub fn candidate(sender: &str, recipient: &str, candidate: CandidateInit) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            payload: SignalPayload::IceCandidate { candidate },
        }
    }
}

/// Everything the session-scoped subscription can deliver: addressed
/// envelopes plus the relay's presence transitions.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    Message(SignalMessage),
    PeerJoined(String),
    PeerLeft(String),
}

/// Duplex signaling channel for one participant in one session.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Subscribe to the session channel. Returns the stream of events
    /// addressed to this participant.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<SignalEvent>, SignalingError>;

    /// Relay an envelope to its recipient.
    async fn send(&self, msg: SignalMessage) -> Result<(), SignalingError>;

    /// Unsubscribe fully; no further events are delivered.
    async fn disconnect(&self);
}

// ========== IN-PROCESS RELAY ==========

/// In-process pub/sub hub standing in for the external signaling relay.
/// One hub per session; each participant gets a client via [`MemoryRelay::client`].
/// Used by tests and local demos; production transports implement
/// [`SignalingTransport`] against the real relay.
#[derive(Default)]
pub struct MemoryRelay {
    members: Mutex<HashMap<String, mpsc::UnboundedSender<SignalEvent>>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>, user_id: &str) -> Arc<MemoryRelayClient> {
        Arc::new(MemoryRelayClient {
            hub: Arc::clone(self),
            user_id: user_id.to_string(),
        })
    }

    fn join(&self, user_id: &str, tx: mpsc::UnboundedSender<SignalEvent>) {
        let mut members = self.members.lock().unwrap();
        for (id, peer_tx) in members.iter() {
            if id != user_id {
                let _ = peer_tx.send(SignalEvent::PeerJoined(user_id.to_string()));
            }
        }
        members.insert(user_id.to_string(), tx);
    }

    fn leave(&self, user_id: &str) {
        let mut members = self.members.lock().unwrap();
        // Presence fires only on a real membership transition.
        if members.remove(user_id).is_some() {
            for peer_tx in members.values() {
                let _ = peer_tx.send(SignalEvent::PeerLeft(user_id.to_string()));
            }
        }
    }

    fn route(&self, msg: SignalMessage) -> Result<(), SignalingError> {
        let members = self.members.lock().unwrap();
        match members.get(&msg.recipient) {
            Some(tx) => tx
                .send(SignalEvent::Message(msg))
                .map_err(|e| SignalingError::SendFailed(e.to_string())),
            None => {
                // Recipient already gone; the relay drops the envelope.
                log(&format!(
                    "Relay: dropping message for absent recipient {}",
                    msg.recipient
                ));
                Ok(())
            }
        }
    }
}

/// Per-participant handle onto a [`MemoryRelay`] hub.
pub struct MemoryRelayClient {
    hub: Arc<MemoryRelay>,
    user_id: String,
}

#[async_trait]
impl SignalingTransport for MemoryRelayClient {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<SignalEvent>, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.join(&self.user_id, tx);
        log(&format!("Relay: {} subscribed", self.user_id));
        Ok(rx)
    }

    async fn send(&self, msg: SignalMessage) -> Result<(), SignalingError> {
        self.hub.route(msg)
    }

    async fn disconnect(&self) {
        self.hub.leave(&self.user_id);
        log(&format!("Relay: {} unsubscribed", self.user_id));
    }
}
