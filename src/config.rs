// Session configuration.
// Logging can only be disabled in development builds.

use std::time::Duration;

use crate::media::MediaConstraints;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // logging is on in debug builds

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // logging is off in release builds

// Extra switches for development builds
#[cfg(debug_assertions)]
pub mod dev {
    // Flip this to false to silence logging entirely in debug builds.
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Protocol timings and media profile for one session.
///
/// Every duration the negotiation engine uses comes from here so tests can
/// shrink them instead of waiting out real-world timeouts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an initiated connection may stay short of `Connected`
    /// before the attempt is torn down and retried.
    pub offer_timeout: Duration,
    /// Total connection attempts per peer before giving up.
    pub max_attempts: u32,
    /// Grace period after an ICE-level disconnect before an ICE restart
    /// is attempted. Avoids restart storms on brief network blips.
    pub ice_restart_grace: Duration,
    /// Local capture profile handed to the media devices on join.
    pub media: MediaConstraints,
    /// Prefer the lower-latency STUN-only ICE profile when the host sits
    /// on a loopback or private network.
    pub prefer_local_network: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(10),
            max_attempts: 3,
            ice_restart_grace: Duration::from_secs(3),
            media: MediaConstraints::default(),
            prefer_local_network: true,
        }
    }
}
