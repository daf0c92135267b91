use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

/// Timestamped logging, gated by the build configuration.
pub fn log(msg: &str) {
    if crate::config::LOGGING_ENABLED {
        #[cfg(debug_assertions)]
        {
            if !crate::config::dev::ENABLE_LOGGING {
                return;
            }
        }

        let now = chrono::Local::now();
        println!("TELERTC: [{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), msg);
    }
}

/// Logging with the remote participant id prefixed.
pub fn log_peer(peer_id: &str, msg: &str) {
    log(&format!("[peer={}] {}", peer_id, msg));
}

/// Print an ICE candidate as it appears (Trickle-ICE).
pub fn dump_candidate(peer_id: &str, label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        log_peer(
            peer_id,
            &format!(
                "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
                init.candidate, init.sdp_mid, init.sdp_mline_index
            ),
        );
    }
}

/// Quick getStats snapshot of the nominated candidate pair.
pub async fn dump_selected_pair(peer_id: &str, pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                log_peer(
                    peer_id,
                    &format!(
                        "STATS {moment}: {}:{}  bytes={}/{} state={:?}",
                        pair.local_candidate_id,
                        pair.remote_candidate_id,
                        pair.bytes_sent,
                        pair.bytes_received,
                        pair.state
                    ),
                );
            }
        }
    }
}
