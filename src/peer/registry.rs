//! Peer connection registry: the single authoritative mapping from remote
//! participant identity to its live link.
//!
//! Reads and writes are synchronous and immediately consistent: an insert
//! is visible to the very next signaling handler even when it runs in the
//! same tick. Any UI-facing state is a derived projection of this map,
//! never the other way around.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::logger::log_peer;
use crate::peer::connection::PeerLink;
use crate::peer::state::NegotiationState;

#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<PeerLink>>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a link for its remote identity. Refuses a second live entry
    /// for the same identity and returns false; the caller must treat that
    /// as "connection already exists".
    pub fn insert(&self, link: Arc<PeerLink>) -> bool {
        let mut map = self.inner.lock().unwrap();
        let id = link.remote_id().to_string();
        if map.contains_key(&id) {
            log_peer(&id, "Registry: refusing duplicate entry");
            return false;
        }
        map.insert(id, link);
        true
    }

    pub fn get(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        self.inner.lock().unwrap().get(remote_id).cloned()
    }

    pub fn remove(&self, remote_id: &str) -> Option<Arc<PeerLink>> {
        self.inner.lock().unwrap().remove(remote_id)
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.inner.lock().unwrap().contains_key(remote_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Drain every entry, returning the links for teardown.
    pub fn clear(&self) -> Vec<Arc<PeerLink>> {
        self.inner.lock().unwrap().drain().map(|(_, l)| l).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.state() == NegotiationState::Connected)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::IceProvider;
    use crate::media::LocalStream;
    use crate::peer::connection::PeerLink;
    use crate::peer::state::PeerRole;
    use std::sync::Weak;

    async fn test_link(remote: &str) -> Arc<PeerLink> {
        let ice = IceProvider::new(vec![]);
        PeerLink::connect(
            Weak::new(),
            remote,
            PeerRole::Initiator,
            1,
            ice.rtc_config(false),
            &LocalStream::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn at_most_one_entry_per_identity() {
        let registry = PeerRegistry::new();
        let first = test_link("bob").await;
        let second = test_link("bob").await;

        assert!(registry.insert(Arc::clone(&first)));
        assert!(!registry.insert(Arc::clone(&second)));
        assert_eq!(registry.len(), 1);
        // the surviving entry is the first one
        assert!(Arc::ptr_eq(&registry.get("bob").unwrap(), &first));

        second.close().await;
        first.close().await;
    }

    #[tokio::test]
    async fn writes_are_immediately_visible() {
        let registry = PeerRegistry::new();
        let link = test_link("bob").await;
        registry.insert(Arc::clone(&link));
        // no await between write and read: the lookup must already see it
        assert!(registry.contains("bob"));
        assert!(registry.remove("bob").is_some());
        assert!(!registry.contains("bob"));
        link.close().await;
    }

    #[tokio::test]
    async fn clear_drains_everything() {
        let registry = PeerRegistry::new();
        registry.insert(test_link("bob").await);
        registry.insert(test_link("carol").await);
        let drained = registry.clear();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        for link in drained {
            link.close().await;
        }
    }
}
