//! ICE configuration: resolves the STUN/TURN server set and transport
//! policy for a connection attempt, with a lower-latency STUN-only profile
//! when the host sits on a loopback or private network.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::IceError;
use crate::logger::log;
use crate::signaling::CandidateInit;

/// One STUN or TURN server entry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceServerConfig {
    pub id: String,
    pub kind: IceServerKind,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IceServerKind {
    Stun,
    Turn,
}

/// Prefix the URL with its scheme when the configured value omits it.
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

static DEFAULT_STUN_SERVERS: Lazy<Vec<IceServerConfig>> = Lazy::new(|| {
    vec![
        IceServerConfig {
            id: "default-stun-0".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        IceServerConfig {
            id: "default-stun-1".into(),
            kind: IceServerKind::Stun,
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Time-bounded TURN relay credentials fetched from an external endpoint.
/// Fetch failure is tolerated: the profile degrades to STUN-only.
#[async_trait]
pub trait TurnCredentialFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceServerConfig>, IceError>;
}

/// Resolves the ICE server set and transport policy for each connection
/// attempt. The TURN credential fetch happens once, before the first
/// attempt.
pub struct IceProvider {
    servers: Mutex<Vec<IceServerConfig>>,
    fetcher: Option<Box<dyn TurnCredentialFetcher>>,
    fetched: Mutex<bool>,
}

impl IceProvider {
    /// Provider over an explicit server list, no TURN endpoint.
    pub fn new(servers: Vec<IceServerConfig>) -> Self {
        Self {
            servers: Mutex::new(servers),
            fetcher: None,
            fetched: Mutex::new(true),
        }
    }

    /// Provider with the default STUN set plus a TURN credential endpoint.
    pub fn with_turn(fetcher: Box<dyn TurnCredentialFetcher>) -> Self {
        Self {
            servers: Mutex::new(DEFAULT_STUN_SERVERS.clone()),
            fetcher: Some(fetcher),
            fetched: Mutex::new(false),
        }
    }

    /// One-time TURN credential fetch. Must complete (or be tolerated as
    /// failed) before the first connection attempt.
    pub async fn prepare(&self) {
        if *self.fetched.lock().unwrap() {
            return;
        }
        if let Some(fetcher) = &self.fetcher {
            match fetcher.fetch().await {
                Ok(turn) => {
                    log(&format!("ICE: fetched {} TURN server entries", turn.len()));
                    self.servers.lock().unwrap().extend(turn);
                }
                Err(e) => {
                    log(&format!("ICE: credential fetch failed, STUN-only: {}", e));
                }
            }
        }
        *self.fetched.lock().unwrap() = true;
    }

    pub fn servers(&self) -> Vec<IceServerConfig> {
        self.servers.lock().unwrap().clone()
    }

    /// Build the peer connection configuration for one attempt.
    ///
    /// With `prefer_local` set and the host on a loopback/private network,
    /// TURN relays are left out: host and srflx candidates resolve faster
    /// and a relay cannot beat a LAN path.
    pub fn rtc_config(&self, prefer_local: bool) -> RTCConfiguration {
        let local_profile = prefer_local && on_private_network();
        let ice_servers: Vec<RTCIceServer> = self
            .servers
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !local_profile || s.kind == IceServerKind::Stun)
            .map(|s| RTCIceServer {
                urls: vec![add_ice_url_scheme(s)],
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
            })
            .collect();

        if local_profile {
            log("ICE: local-network profile (STUN-only)");
        }

        RTCConfiguration {
            ice_servers,
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

/// True for loopback, RFC 1918 and link-local v4 ranges.
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local()
}

/// Best-effort check of which source address the host would use for an
/// outbound packet. No traffic is sent.
fn on_private_network() -> bool {
    let probe = || -> std::io::Result<IpAddr> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.connect("8.8.8.8:80")?;
        Ok(sock.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(ip)) => is_private_ipv4(ip),
        Ok(IpAddr::V6(ip)) => ip.is_loopback(),
        // No route at all: everything is local
        Err(_) => true,
    }
}

// ========== SERVER REACHABILITY PROBE ==========

/// Check that a configured server actually yields candidates of its kind:
/// srflx for STUN, relay for TURN. Used by the pre-join network check.
pub async fn check_server(config: &IceServerConfig) -> bool {
    check_server_with_timeout(config, Duration::from_secs(10)).await
}

/// [`check_server`] with an explicit gathering deadline.
pub async fn check_server_with_timeout(config: &IceServerConfig, limit: Duration) -> bool {
    let url = add_ice_url_scheme(config);
    log(&format!("ICE check: probing '{}' ({:?})", url, config.kind));

    let ice_server = RTCIceServer {
        urls: vec![url],
        username: config.username.clone().unwrap_or_default(),
        credential: config.credential.clone().unwrap_or_default(),
    };
    let rtc_config = RTCConfiguration {
        ice_servers: vec![ice_server],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    match api.new_peer_connection(rtc_config).await {
        Ok(pc) => check_via_gathering(pc.into(), config.kind, limit).await,
        Err(e) => {
            log(&format!("ICE check: peer connection failed: {:?}", e));
            false
        }
    }
}

async fn check_via_gathering(
    pc: std::sync::Arc<RTCPeerConnection>,
    kind: IceServerKind,
    limit: Duration,
) -> bool {
    let (tx, mut rx) = mpsc::channel(10);

    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    let hit = match kind {
                        IceServerKind::Stun => json.candidate.contains("srflx"),
                        IceServerKind::Turn => json.candidate.contains("relay"),
                    };
                    if hit {
                        let _ = tx.send(true).await;
                    }
                }
            }
        })
    }));

    // A data channel is enough to kick off gathering.
    if pc.create_data_channel("probe", None).await.is_err() {
        return false;
    }
    let offer = match pc.create_offer(None).await {
        Ok(o) => o,
        Err(e) => {
            log(&format!("ICE check: create_offer failed: {:?}", e));
            return false;
        }
    };
    if let Err(e) = pc.set_local_description(offer).await {
        log(&format!("ICE check: set_local_description failed: {:?}", e));
        return false;
    }

    let hit = matches!(timeout(limit, rx.recv()).await, Ok(Some(true)));
    let _ = pc.close().await;
    log(&format!("ICE check: result={}", hit));
    hit
}

/// Count candidate types for diagnostics; warn when no relay is present.
pub fn analyze_candidates(candidates: &[CandidateInit]) -> (usize, usize, usize) {
    let mut host = 0;
    let mut srflx = 0;
    let mut relay = 0;

    for c in candidates {
        if c.candidate.contains("typ host") {
            host += 1;
        } else if c.candidate.contains("typ srflx") {
            srflx += 1;
        } else if c.candidate.contains("typ relay") {
            relay += 1;
        }
    }

    log(&format!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host, srflx, relay
    ));
    if relay == 0 {
        log("WARNING: no TURN relay candidates; connection through strict NAT may fail");
    }
    (host, srflx, relay)
}
