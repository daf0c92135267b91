//! Client seam for the external data store.
//!
//! The store owns sessions and participant rows; this core only reads
//! session validity, upserts its own participant row on join, marks it
//! inactive on leave, and uses the active-participant query as the
//! discovery index.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Session validity as read from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_participants: u32,
}

impl SessionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Host,
    Participant,
}

/// One participant row per (session, user). Owned by the store, not by
/// this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub session_id: String,
    pub user_id: String,
    pub participant_name: String,
    pub role: ParticipantRole,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn fetch_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Insert or update this user's row for the session.
    async fn upsert_participant(&self, row: ParticipantRow) -> Result<(), StoreError>;

    /// Active participants in the session, excluding the given user.
    async fn active_participants(
        &self,
        session_id: &str,
        exclude_user: &str,
    ) -> Result<Vec<ParticipantRow>, StoreError>;

    async fn mark_inactive(&self, session_id: &str, user_id: &str) -> Result<(), StoreError>;
}

// ========== IN-MEMORY STORE ==========

/// In-process store for tests and local demos.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    rows: Mutex<Vec<ParticipantRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_session(&self, record: SessionRecord) {
        self.sessions
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    pub fn row_count(&self, session_id: &str) -> usize {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id)
            .count()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn fetch_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.lock().unwrap().get(session_id).cloned())
    }

    async fn upsert_participant(&self, row: ParticipantRow) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        match rows
            .iter_mut()
            .find(|r| r.session_id == row.session_id && r.user_id == row.user_id)
        {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        Ok(())
    }

    async fn active_participants(
        &self,
        session_id: &str,
        exclude_user: &str,
    ) -> Result<Vec<ParticipantRow>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.session_id == session_id && r.is_active && r.user_id != exclude_user)
            .cloned()
            .collect())
    }

    async fn mark_inactive(&self, session_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .find(|r| r.session_id == session_id && r.user_id == user_id)
        {
            row.is_active = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(session: &str, user: &str, active: bool) -> ParticipantRow {
        ParticipantRow {
            session_id: session.into(),
            user_id: user.into(),
            participant_name: user.into(),
            role: ParticipantRole::Participant,
            is_active: active,
            joined_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let store = MemoryStore::new();
        store.upsert_participant(row("s1", "alice", true)).await.unwrap();
        store.upsert_participant(row("s1", "alice", true)).await.unwrap();
        assert_eq!(store.row_count("s1"), 1);
    }

    #[tokio::test]
    async fn discovery_query_filters_self_and_inactive() {
        let store = MemoryStore::new();
        store.upsert_participant(row("s1", "alice", true)).await.unwrap();
        store.upsert_participant(row("s1", "bob", true)).await.unwrap();
        store.upsert_participant(row("s1", "carol", false)).await.unwrap();
        store.upsert_participant(row("s2", "dave", true)).await.unwrap();

        let found = store.active_participants("s1", "alice").await.unwrap();
        let ids: Vec<_> = found.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, vec!["bob"]);
    }

    #[tokio::test]
    async fn mark_inactive_hides_row_from_discovery() {
        let store = MemoryStore::new();
        store.upsert_participant(row("s1", "bob", true)).await.unwrap();
        store.mark_inactive("s1", "bob").await.unwrap();
        assert!(store.active_participants("s1", "x").await.unwrap().is_empty());
    }

    #[test]
    fn expiry_is_relative_to_now() {
        let record = SessionRecord {
            id: "s1".into(),
            is_active: true,
            expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
            max_participants: 4,
        };
        assert!(record.is_expired(Utc::now()));

        let open = SessionRecord {
            expires_at: None,
            ..record
        };
        assert!(!open.is_expired(Utc::now()));
    }
}
