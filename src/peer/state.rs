//! Per-peer negotiation state machine.
//!
//! One explicit tagged state per peer with a single transition check, so
//! illegal moves (applying an answer twice, reviving a closed link) are
//! caught centrally instead of by scattered flags.

use serde::Serialize;

/// Progress of one peer through the offer/answer/ICE exchange. Distinct
/// from the transport-level ICE connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// Whether the move to `next` is legal.
    ///
    /// Failed and Closed are terminal. Negotiating may fall back to New
    /// (close-and-retry), settled links may re-enter Negotiating for an
    /// ICE restart, and any live state may reach Failed or Closed.
    pub fn can_transition(self, next: NegotiationState) -> bool {
        use NegotiationState::*;
        if self == next {
            return false;
        }
        match (self, next) {
            (Failed, _) | (Closed, _) => false,
            (_, Failed) | (_, Closed) => true,
            (New, Negotiating) => true,
            (Negotiating, Connected) => true,
            (Negotiating, New) => true,
            (Connected, Disconnected) => true,
            (Connected, Negotiating) => true,
            (Disconnected, Negotiating) => true,
            (Disconnected, Connected) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

/// Which side of the offer/answer exchange this peer link is on, decided
/// by the identity tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Receiver,
}
