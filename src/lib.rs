//! Peer-to-peer video session core for telehealth consultations.
//!
//! The crate owns the WebRTC signaling state machine, the multi-peer
//! connection lifecycle and the ICE/offer-answer negotiation protocol for
//! one session. Everything else (the signaling relay, the appointment
//! data store, the capture devices) is consumed through injected trait
//! seams.
//!
//! Entry point: [`SessionController`]. Construct one per session entry
//! with its collaborators, `join()`, listen on `events()`, `leave()`.

pub mod config;
pub mod discovery;
pub mod error;
pub mod ice;
pub mod logger;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;

pub use config::SessionConfig;
pub use error::{
    IceError, JoinError, MediaAccessError, NegotiationError, SessionError, SignalingError,
    StoreError,
};
pub use ice::{IceProvider, IceServerConfig, IceServerKind, TurnCredentialFetcher};
pub use media::{FakeDevices, LocalStream, LocalTrack, MediaConstraints, MediaDevices, TrackKind};
pub use negotiation::{initiates_to, NegotiationEngine};
pub use peer::{NegotiationState, PeerLink, PeerRegistry, PeerRole, RemoteStream};
pub use session::{LocalIdentity, SessionConnectionState, SessionController, SessionEvent};
pub use signaling::{
    CandidateInit, MemoryRelay, MemoryRelayClient, SignalEvent, SignalMessage, SignalPayload,
    SignalingTransport,
};
pub use store::{MemoryStore, ParticipantRole, ParticipantRow, SessionRecord, SessionStore};
