//! Participant discovery: on join, find the already-active participants
//! of the session and initiate toward those the tie-break assigns to us.

use std::sync::Arc;

use crate::error::StoreError;
use crate::logger::{log, log_peer};
use crate::negotiation::{initiates_to, NegotiationEngine};
use crate::store::SessionStore;

/// Query the store for active participants (excluding self) and start an
/// offer toward each peer this side initiates to. Peers already present in
/// the registry are skipped; an empty result (first participant) is fine.
/// Returns how many offers were started.
pub async fn discover_peers(
    store: &Arc<dyn SessionStore>,
    engine: &Arc<NegotiationEngine>,
    session_id: &str,
) -> Result<usize, StoreError> {
    let local_id = engine.local_id().to_string();
    let rows = store.active_participants(session_id, &local_id).await?;
    log(&format!(
        "Discovery: {} active participant(s) besides us",
        rows.len()
    ));

    let mut started = 0;
    for row in rows {
        if engine.registry().contains(&row.user_id) {
            log_peer(&row.user_id, "Discovery: already in registry; skipping");
            continue;
        }
        if initiates_to(&local_id, &row.user_id) {
            engine.start_offer(&row.user_id).await;
            started += 1;
        } else {
            log_peer(&row.user_id, "Discovery: they initiate; waiting");
        }
    }
    Ok(started)
}
