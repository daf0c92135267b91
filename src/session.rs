//! Session controller: the public face of the session core.
//!
//! One controller instance per session entry, with every collaborator
//! injected (signaling transport, data store, media devices, ICE
//! provider). Constructed on session entry, disposed on leave; no
//! process-wide state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::discovery::discover_peers;
use crate::error::{JoinError, SessionError};
use crate::ice::{check_server, IceProvider};
use crate::logger::log;
use crate::media::{LocalStream, MediaDevices, TrackKind};
use crate::negotiation::NegotiationEngine;
use crate::peer::connection::RemoteStream;
use crate::peer::registry::PeerRegistry;
use crate::signaling::{SignalEvent, SignalingTransport};
use crate::store::{ParticipantRole, ParticipantRow, SessionStore};

/// Aggregate connection state of the whole session, derived from the
/// per-peer states in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Everything the session surfaces to its consumer.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    PeerFailed { peer_id: String },
    RemoteStream { peer_id: String, stream_id: String },
    ConnectionProblem { peer_id: String },
    ConnectionRecovering { peer_id: String },
    ConnectionRecovered { peer_id: String },
    StateChanged(SessionConnectionState),
}

/// Who we are in which session.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
}

pub struct SessionController {
    config: SessionConfig,
    identity: LocalIdentity,
    transport: Arc<dyn SignalingTransport>,
    store: Arc<dyn SessionStore>,
    devices: Arc<dyn MediaDevices>,
    ice: Arc<IceProvider>,
    events: broadcast::Sender<SessionEvent>,
    engine: Mutex<Option<Arc<NegotiationEngine>>>,
    local_stream: Mutex<Option<LocalStream>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    joined: AtomicBool,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        identity: LocalIdentity,
        transport: Arc<dyn SignalingTransport>,
        store: Arc<dyn SessionStore>,
        devices: Arc<dyn MediaDevices>,
        ice: Arc<IceProvider>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            config,
            identity,
            transport,
            store,
            devices,
            ice,
            events,
            engine: Mutex::new(None),
            local_stream: Mutex::new(None),
            signal_task: Mutex::new(None),
            joined: AtomicBool::new(false),
        })
    }

    /// Subscribe to session events. May be called before or after join.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Join the session: validate it, acquire local media, register our
    /// participant row, open signaling and discover existing peers.
    /// Returns once local media is ready; peers connect asynchronously.
    pub async fn join(self: &Arc<Self>) -> Result<(), JoinError> {
        if self.joined.load(Ordering::SeqCst) {
            log("join() called while already joined; ignoring");
            return Ok(());
        }
        let id = &self.identity;
        log(&format!(
            "Joining session {} as {} ({})",
            id.session_id, id.user_id, id.display_name
        ));

        // Session must exist, be active and not expired.
        let record = self
            .store
            .fetch_session(&id.session_id)
            .await?
            .ok_or(JoinError::SessionNotFound)?;
        if !record.is_active || record.is_expired(Utc::now()) {
            return Err(JoinError::SessionExpired);
        }
        // Capacity binds everyone but the host; their seat is implicit.
        let others = self
            .store
            .active_participants(&id.session_id, &id.user_id)
            .await?;
        if id.role != ParticipantRole::Host && others.len() as u32 >= record.max_participants {
            return Err(JoinError::SessionFull);
        }

        // TURN credentials must be resolved (or given up on) before the
        // first connection attempt.
        self.ice.prepare().await;

        let stream = self.devices.acquire(&self.config.media).await?;

        self.store
            .upsert_participant(ParticipantRow {
                session_id: id.session_id.clone(),
                user_id: id.user_id.clone(),
                participant_name: id.display_name.clone(),
                role: id.role,
                is_active: true,
                joined_at: Utc::now(),
            })
            .await?;

        let mut rx = self.transport.connect().await?;

        let engine = NegotiationEngine::new(
            &id.user_id,
            self.config.clone(),
            PeerRegistry::new(),
            Arc::clone(&self.transport),
            Arc::clone(&self.ice),
            stream.clone(),
            self.events.clone(),
        );

        // All signaling for the session is processed here in arrival
        // order; per-peer ordering follows from it.
        let loop_engine = Arc::clone(&engine);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SignalEvent::Message(msg) => loop_engine.handle_signal(msg).await,
                    SignalEvent::PeerJoined(peer) => loop_engine.peer_joined(&peer).await,
                    SignalEvent::PeerLeft(peer) => loop_engine.peer_left(&peer).await,
                }
            }
            log("Signaling channel closed");
        });

        *self.local_stream.lock().unwrap() = Some(stream);
        *self.engine.lock().unwrap() = Some(Arc::clone(&engine));
        *self.signal_task.lock().unwrap() = Some(task);
        self.joined.store(true, Ordering::SeqCst);

        // A discovery failure is not fatal: we are in the session, peers
        // still reach us through relay presence announcements.
        if let Err(e) = discover_peers(&self.store, &engine, &id.session_id).await {
            log(&format!("Discovery failed: {}", e));
        }
        Ok(())
    }

    /// Leave the session: drop signaling, close every peer link (which
    /// cancels their pending timeouts), stop local media, deregister, and
    /// reset to idle.
    pub async fn leave(&self) -> Result<(), SessionError> {
        if !self.joined.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        log(&format!("Leaving session {}", self.identity.session_id));

        if let Some(task) = self.signal_task.lock().unwrap().take() {
            task.abort();
        }
        self.transport.disconnect().await;

        let engine = self.engine.lock().unwrap().take();
        if let Some(engine) = engine {
            engine.shutdown().await;
        }

        let stream = self.local_stream.lock().unwrap().take();
        if let Some(stream) = stream {
            stream.stop();
        }

        self.store
            .mark_inactive(&self.identity.session_id, &self.identity.user_id)
            .await?;
        Ok(())
    }

    /// Full leave-then-join cycle; used for manual retry and automatic
    /// recovery alike.
    pub async fn reconnect(self: &Arc<Self>) -> Result<(), JoinError> {
        if let Err(e) = self.leave().await {
            log(&format!("Leave during reconnect failed: {}", e));
        }
        self.join().await
    }

    /// Flip the local video track. Transport-transparent: affects every
    /// peer at once, no renegotiation. Returns the new enabled value.
    pub fn toggle_video(&self) -> Result<bool, SessionError> {
        self.toggle_track(TrackKind::Video)
    }

    /// Flip the local audio track; see [`Self::toggle_video`].
    pub fn toggle_audio(&self) -> Result<bool, SessionError> {
        self.toggle_track(TrackKind::Audio)
    }

    fn toggle_track(&self, kind: TrackKind) -> Result<bool, SessionError> {
        let guard = self.local_stream.lock().unwrap();
        let stream = guard.as_ref().ok_or(SessionError::NotJoined)?;
        let track = match kind {
            TrackKind::Video => stream.video.as_ref(),
            TrackKind::Audio => stream.audio.as_ref(),
        };
        Ok(track.map(|t| t.toggle()).unwrap_or(false))
    }

    /// Switch to a specific capture device: re-acquire under the updated
    /// constraints and replace the shared local stream. The previous
    /// tracks are left running, not stopped: live peer links hold them
    /// as their negotiated senders and must keep receiving samples. Only
    /// links built after the switch pick up the new stream.
    pub async fn change_device(&self, kind: TrackKind, device_id: &str) -> Result<(), SessionError> {
        if !self.joined.load(Ordering::SeqCst) {
            return Err(SessionError::NotJoined);
        }
        let mut constraints = self.config.media.clone();
        match kind {
            TrackKind::Video => constraints.video_device = Some(device_id.to_string()),
            TrackKind::Audio => constraints.audio_device = Some(device_id.to_string()),
        }
        let fresh = self
            .devices
            .acquire(&constraints)
            .await
            .map_err(|e| SessionError::Join(JoinError::Media(e)))?;
        *self.local_stream.lock().unwrap() = Some(fresh);
        Ok(())
    }

    /// Probe camera/microphone availability without keeping a stream.
    pub async fn test_devices(&self) -> bool {
        self.devices.probe().await
    }

    /// Probe each configured ICE server for reachability; returns the
    /// per-server verdicts. Part of the pre-join connectivity check.
    pub async fn test_network(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();
        for server in self.ice.servers() {
            let ok = check_server(&server).await;
            results.push((server.id.clone(), ok));
        }
        results
    }

    /// Derived aggregate state; `New` when idle.
    pub fn connection_state(&self) -> SessionConnectionState {
        self.engine
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.session_state())
            .unwrap_or(SessionConnectionState::New)
    }

    /// Remote identities with a live link.
    pub fn peers(&self) -> Vec<String> {
        self.engine
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.registry().ids())
            .unwrap_or_default()
    }

    pub fn remote_stream(&self, peer_id: &str) -> Option<RemoteStream> {
        self.engine
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|e| e.registry().get(peer_id))
            .and_then(|link| link.remote_stream())
    }

    pub fn has_local_media(&self) -> bool {
        self.local_stream.lock().unwrap().is_some()
    }

    /// Shared handle onto the local stream, for capture pipelines and UI.
    pub fn local_stream(&self) -> Option<LocalStream> {
        self.local_stream.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaAccessError;
    use crate::media::{FakeDenial, FakeDevices};
    use crate::signaling::MemoryRelay;
    use crate::store::{MemoryStore, SessionRecord};
    use chrono::Duration as ChronoDuration;

    fn session_record(id: &str, max: u32, expired: bool) -> SessionRecord {
        SessionRecord {
            id: id.into(),
            is_active: true,
            expires_at: if expired {
                Some(Utc::now() - ChronoDuration::minutes(5))
            } else {
                Some(Utc::now() + ChronoDuration::hours(1))
            },
            max_participants: max,
        }
    }

    fn controller(
        store: Arc<MemoryStore>,
        hub: &Arc<MemoryRelay>,
        user: &str,
        role: ParticipantRole,
        devices: FakeDevices,
    ) -> Arc<SessionController> {
        SessionController::new(
            SessionConfig::default(),
            LocalIdentity {
                session_id: "visit-1".into(),
                user_id: user.into(),
                display_name: format!("Dr. {user}"),
                role,
            },
            hub.client(user),
            store,
            Arc::new(devices),
            Arc::new(IceProvider::new(vec![])),
        )
    }

    #[tokio::test]
    async fn join_rejects_missing_session() {
        let store = Arc::new(MemoryStore::new());
        let hub = MemoryRelay::new();
        let c = controller(
            Arc::clone(&store),
            &hub,
            "alice",
            ParticipantRole::Participant,
            FakeDevices::new(),
        );
        assert!(matches!(c.join().await, Err(JoinError::SessionNotFound)));
        assert_eq!(store.row_count("visit-1"), 0);
    }

    #[tokio::test]
    async fn join_rejects_expired_session() {
        let store = Arc::new(MemoryStore::new());
        store.insert_session(session_record("visit-1", 4, true));
        let hub = MemoryRelay::new();
        let c = controller(
            Arc::clone(&store),
            &hub,
            "alice",
            ParticipantRole::Participant,
            FakeDevices::new(),
        );
        assert!(matches!(c.join().await, Err(JoinError::SessionExpired)));
        assert_eq!(store.row_count("visit-1"), 0);
    }

    #[tokio::test]
    async fn join_rejects_full_session_without_creating_a_row() {
        let store = Arc::new(MemoryStore::new());
        store.insert_session(session_record("visit-1", 1, false));
        let hub = MemoryRelay::new();

        let host = controller(
            Arc::clone(&store),
            &hub,
            "host",
            ParticipantRole::Host,
            FakeDevices::new(),
        );
        host.join().await.unwrap();
        assert_eq!(store.row_count("visit-1"), 1);

        let late = controller(
            Arc::clone(&store),
            &hub,
            "late",
            ParticipantRole::Participant,
            FakeDevices::new(),
        );
        assert!(matches!(late.join().await, Err(JoinError::SessionFull)));
        assert_eq!(store.row_count("visit-1"), 1);

        host.leave().await.unwrap();
    }

    #[tokio::test]
    async fn media_denial_surfaces_as_distinct_error() {
        let store = Arc::new(MemoryStore::new());
        store.insert_session(session_record("visit-1", 4, false));
        let hub = MemoryRelay::new();
        let c = controller(
            Arc::clone(&store),
            &hub,
            "alice",
            ParticipantRole::Participant,
            FakeDevices::denying(FakeDenial::Permission),
        );
        match c.join().await {
            Err(JoinError::Media(MediaAccessError::PermissionDenied)) => {}
            other => panic!("expected permission denial, got {:?}", other),
        }
        // rejection happens before the participant row is written
        assert_eq!(store.row_count("visit-1"), 0);
        assert!(!c.has_local_media());
    }

    #[tokio::test]
    async fn toggles_require_a_joined_session() {
        let store = Arc::new(MemoryStore::new());
        store.insert_session(session_record("visit-1", 4, false));
        let hub = MemoryRelay::new();
        let c = controller(
            Arc::clone(&store),
            &hub,
            "alice",
            ParticipantRole::Participant,
            FakeDevices::new(),
        );
        assert!(matches!(c.toggle_video(), Err(SessionError::NotJoined)));

        c.join().await.unwrap();
        assert!(!c.toggle_video().unwrap()); // on -> off
        assert!(c.toggle_video().unwrap()); // off -> on
        assert!(!c.toggle_audio().unwrap());
        c.leave().await.unwrap();
    }

    #[tokio::test]
    async fn device_probe_reflects_availability() {
        let store = Arc::new(MemoryStore::new());
        let hub = MemoryRelay::new();
        let ok = controller(
            Arc::clone(&store),
            &hub,
            "a",
            ParticipantRole::Participant,
            FakeDevices::new(),
        );
        assert!(ok.test_devices().await);
        let broken = controller(
            store,
            &hub,
            "b",
            ParticipantRole::Participant,
            FakeDevices::denying(FakeDenial::NoDevice),
        );
        assert!(!broken.test_devices().await);
    }

    #[tokio::test]
    async fn change_device_keeps_the_old_tracks_serving_existing_links() {
        let store = Arc::new(MemoryStore::new());
        store.insert_session(session_record("visit-1", 4, false));
        let hub = MemoryRelay::new();
        let c = controller(
            Arc::clone(&store),
            &hub,
            "alice",
            ParticipantRole::Participant,
            FakeDevices::new(),
        );
        c.join().await.unwrap();

        let before = c.local_stream().unwrap();
        c.change_device(TrackKind::Video, "cam-2").await.unwrap();
        let after = c.local_stream().unwrap();

        // the stored stream really changed
        let old_video = before.video.as_ref().unwrap();
        let new_video = after.video.as_ref().unwrap();
        assert!(!Arc::ptr_eq(&old_video.rtc_track(), &new_video.rtc_track()));

        // peer links negotiated the old tracks; they must stay writable
        assert!(!before.is_stopped());
        assert!(
            old_video
                .write_sample(
                    bytes::Bytes::from_static(&[0u8; 4]),
                    std::time::Duration::from_millis(33)
                )
                .await
        );
        assert!(!after.is_stopped());
        c.leave().await.unwrap();
    }

    #[tokio::test]
    async fn network_probe_reports_one_verdict_per_server() {
        let store = Arc::new(MemoryStore::new());
        let hub = MemoryRelay::new();
        let c = controller(
            store,
            &hub,
            "alice",
            ParticipantRole::Participant,
            FakeDevices::new(),
        );
        // no servers configured: nothing to probe, nothing to report
        assert!(c.test_network().await.is_empty());
    }
}
