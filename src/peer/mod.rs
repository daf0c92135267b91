pub mod connection;
pub mod registry;
pub mod state;

pub use connection::{PeerLink, RemoteStream};
pub use registry::PeerRegistry;
pub use state::{NegotiationState, PeerRole};
