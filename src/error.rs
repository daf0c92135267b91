//! Error taxonomy for the session core.
//!
//! Peer-level failures (`NegotiationError`) are contained: they tear down
//! one peer connection and never fail the whole session. Join-time failures
//! (`JoinError`) are fatal to the join attempt and surfaced immediately.
//! Every user-visible message is category-specific, never a raw protocol
//! string.

use thiserror::Error;

/// Local camera/microphone acquisition failures. Recoverable: surfaced as
/// an actionable message, never fatal to the application.
#[derive(Debug, Error)]
pub enum MediaAccessError {
    #[error("camera or microphone permission was denied")]
    PermissionDenied,
    #[error("no usable camera or microphone was found")]
    DeviceUnavailable,
    #[error("the capture device is busy in another application")]
    DeviceBusy,
    #[error("media capture failed: {0}")]
    Other(String),
}

/// Signaling transport failures. Trigger a reconnect attempt and surface
/// as a DISCONNECTED/FAILED session state.
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("could not connect to the signaling relay: {0}")]
    ConnectFailed(String),
    #[error("signaling connection dropped")]
    Dropped,
    #[error("failed to send signaling message: {0}")]
    SendFailed(String),
    #[error("signaling transport is not connected")]
    NotConnected,
}

/// Per-peer protocol failures. Logged; the specific peer connection is
/// torn down and the session continues with the remaining peers.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("malformed session description: {0}")]
    MalformedDescription(String),
    #[error("description received in the wrong signaling state: {0}")]
    WrongState(String),
    #[error("ICE failure: {0}")]
    Ice(String),
    #[error(transparent)]
    Rtc(#[from] webrtc::Error),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

/// ICE configuration failures. A failed TURN credential fetch degrades
/// the profile to STUN-only rather than failing the connection.
#[derive(Debug, Error)]
pub enum IceError {
    #[error("TURN credential fetch failed: {0}")]
    CredentialFetch(String),
}

/// External data store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("data store request failed: {0}")]
    Backend(String),
}

/// Join-time failures. Fatal to the join attempt, no retry.
#[derive(Debug, Error)]
pub enum JoinError {
    #[error("this session does not exist")]
    SessionNotFound,
    #[error("this session has expired")]
    SessionExpired,
    #[error("this session is already at its participant limit")]
    SessionFull,
    #[error(transparent)]
    Media(#[from] MediaAccessError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Umbrella error for session controller operations after join.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active session")]
    NotJoined,
    #[error(transparent)]
    Join(#[from] JoinError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
