//! Composite-keyed active sessions plus archived history. The in-memory map
//! is a cache re-derivable from the sqlite store; every mutation here writes
//! through immediately, following the teacher's
//! `cthulu-backend/flows/file_repository.rs` write-on-every-mutation
//! discipline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::error::BrokerError;
use crate::model::{EndReason, Session, SessionHistory, SessionKey, SessionStatus};
use crate::store::{HistoryFilters, SqliteStore};
use tokio::sync::RwLock;

/// Options accepted by `clear`. `end_reason` defaults to `Completed`;
/// `error_message` is attached to the history row when the session ended in
/// error.
#[derive(Debug, Clone, Default)]
pub struct ClearOptions {
    pub end_reason: Option<EndReason>,
    pub error_message: Option<String>,
}

pub struct SessionStore {
    store: Arc<SqliteStore>,
    active: RwLock<HashMap<SessionKey, Session>>,
}

impl SessionStore {
    pub fn new(store: Arc<SqliteStore>) -> SessionStore {
        SessionStore { store, active: RwLock::new(HashMap::new()) }
    }

    /// Repopulates the in-memory map from the persistent store. Called once
    /// by `StateManager::load`; tunnel handles are never reconstructed here
    /// (`has_tunnel` starts `false` for every loaded session).
    pub async fn reload_from_store(&self) -> Result<(), BrokerError> {
        let sessions = self.store.list_active_sessions().await?;
        let mut active = self.active.write().await;
        active.clear();
        for session in sessions {
            active.insert(session.session_key.clone(), session);
        }
        Ok(())
    }

    /// Fails if a session already exists for this key.
    pub async fn create(&self, session: Session) -> Result<Session, BrokerError> {
        let mut active = self.active.write().await;
        if active.contains_key(&session.session_key) {
            return Err(BrokerError::validation(format!("session already exists: {}", session.session_key)));
        }
        self.store.upsert_active_session(session.clone()).await?;
        active.insert(session.session_key.clone(), session.clone());
        Ok(session)
    }

    /// Idempotent: returns the existing session if one is already present,
    /// tolerating a concurrent winner that created it between the read and
    /// the write.
    pub async fn get_or_create<F>(&self, key: &SessionKey, build: F) -> Result<Session, BrokerError>
    where
        F: FnOnce() -> Session,
    {
        {
            let active = self.active.read().await;
            if let Some(existing) = active.get(key) {
                return Ok(existing.clone());
            }
        }
        let mut active = self.active.write().await;
        if let Some(existing) = active.get(key) {
            return Ok(existing.clone());
        }
        let session = build();
        self.store.upsert_active_session(session.clone()).await?;
        active.insert(key.clone(), session.clone());
        Ok(session)
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Session> {
        self.active.read().await.get(key).cloned()
    }

    /// Synchronous best-effort token lookup for `ProxyRegistry`'s
    /// token-lookup closure (§4.I), which cannot await. A writer holding the
    /// map at this instant just yields a transient `None` — the next
    /// proxied request tries again.
    pub fn try_token_for(&self, key: &SessionKey) -> Option<String> {
        self.active.try_read().ok()?.get(key)?.token.clone()
    }

    /// Fails if no session exists for this key.
    pub async fn update<F>(&self, key: &SessionKey, mutate: F) -> Result<Session, BrokerError>
    where
        F: FnOnce(&mut Session),
    {
        let mut active = self.active.write().await;
        let session = active.get_mut(key).ok_or_else(|| BrokerError::not_found(format!("no session for key: {key}")))?;
        mutate(session);
        let updated = session.clone();
        drop(active);
        self.store.upsert_active_session(updated.clone()).await?;
        Ok(updated)
    }

    /// Removes the session from the active table. If its status was above
    /// `Idle`, archives it to history with `options.end_reason` (default
    /// `Completed`). Returns the archived history row, if any.
    pub async fn clear(&self, key: &SessionKey, options: ClearOptions) -> Result<Option<SessionHistory>, BrokerError> {
        let mut active = self.active.write().await;
        let Some(session) = active.remove(key) else {
            return Ok(None);
        };
        drop(active);
        self.store.delete_active_session(key.as_str()).await?;

        if matches!(session.status, SessionStatus::Idle) {
            return Ok(None);
        }

        let end_reason = options.end_reason.unwrap_or(EndReason::Completed);
        let history = SessionHistory::from_session(&session, end_reason, options.error_message, Utc::now());
        self.store.insert_history(history.clone()).await?;
        Ok(Some(history))
    }

    pub async fn all(&self) -> Vec<Session> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn for_user(&self, user: &str) -> Vec<Session> {
        self.active.read().await.values().filter(|s| s.user == user).cloned().collect()
    }

    pub async fn active_only(&self) -> Vec<Session> {
        self.active.read().await.values().filter(|s| s.is_active()).cloned().collect()
    }

    pub async fn has_active(&self, user: &str, cluster: &str) -> bool {
        self.active.read().await.values().any(|s| s.user == user && s.cluster == cluster && s.is_active())
    }

    pub async fn mark_dev_server_used(&self, key: &SessionKey) -> Result<(), BrokerError> {
        self.update(key, |session| session.used_dev_server = true).await?;
        Ok(())
    }

    pub async fn get_history(&self, filters: HistoryFilters) -> Result<Vec<SessionHistory>, BrokerError> {
        self.store.list_history(filters).await
    }

    pub async fn count_history(&self, filters: HistoryFilters) -> Result<u64, BrokerError> {
        self.store.count_history(filters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Ide;

    async fn fresh_store() -> SessionStore {
        SessionStore::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn create_rejects_duplicate_key() {
        let store = fresh_store().await;
        let session = Session::new("alice", "gemini", Ide::Vscode);
        store.create(session.clone()).await.unwrap();
        assert!(store.create(session).await.is_err());
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = fresh_store().await;
        let key = SessionKey::encode("alice", "gemini", Ide::Vscode);
        let first = store.get_or_create(&key, || Session::new("alice", "gemini", Ide::Vscode)).await.unwrap();
        let second = store.get_or_create(&key, || panic!("should not rebuild")).await.unwrap();
        assert_eq!(first.session_key, second.session_key);
    }

    #[tokio::test]
    async fn update_fails_when_missing() {
        let store = fresh_store().await;
        let key = SessionKey::encode("alice", "gemini", Ide::Vscode);
        let result = store.update(&key, |s| s.status = SessionStatus::Running).await;
        assert!(matches!(result, Err(BrokerError::NotFound { .. })));
    }

    #[tokio::test]
    async fn clear_archives_only_sessions_above_idle() {
        let store = fresh_store().await;
        let key = SessionKey::encode("alice", "gemini", Ide::Vscode);
        store.create(Session::new("alice", "gemini", Ide::Vscode)).await.unwrap();

        // Still idle: clearing produces no history row.
        let history = store.clear(&key, ClearOptions::default()).await.unwrap();
        assert!(history.is_none());

        store.create(Session::new("alice", "gemini", Ide::Vscode)).await.unwrap();
        store.update(&key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("123".to_string());
            s.started_at = Some(Utc::now());
        }).await.unwrap();
        let history = store.clear(&key, ClearOptions { end_reason: Some(EndReason::Timeout), error_message: None }).await.unwrap();
        assert!(history.is_some());
        assert_eq!(history.unwrap().end_reason, EndReason::Timeout);
        assert!(store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn archiving_is_additive() {
        let store = fresh_store().await;
        let key = SessionKey::encode("alice", "gemini", Ide::Vscode);
        store.create(Session::new("alice", "gemini", Ide::Vscode)).await.unwrap();
        store.update(&key, |s| {
            s.status = SessionStatus::Running;
            s.job_id = Some("1".to_string());
            s.started_at = Some(Utc::now());
        }).await.unwrap();

        let before_active = store.all().await.len();
        let before_history = store.count_history(HistoryFilters::default()).await.unwrap();
        store.clear(&key, ClearOptions::default()).await.unwrap();
        let after_active = store.all().await.len();
        let after_history = store.count_history(HistoryFilters::default()).await.unwrap();

        assert_eq!(before_active - after_active, 1);
        assert_eq!(after_history - before_history, 1);
    }

    #[tokio::test]
    async fn for_user_filters_sessions() {
        let store = fresh_store().await;
        store.create(Session::new("alice", "gemini", Ide::Vscode)).await.unwrap();
        store.create(Session::new("bob", "gemini", Ide::Jupyter)).await.unwrap();
        assert_eq!(store.for_user("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn try_token_for_reads_without_awaiting() {
        let store = fresh_store().await;
        let key = SessionKey::encode("alice", "gemini", Ide::Vscode);
        store.create(Session::new("alice", "gemini", Ide::Vscode)).await.unwrap();
        assert_eq!(store.try_token_for(&key), None);
        store.update(&key, |s| s.token = Some("tok-123".to_string())).await.unwrap();
        assert_eq!(store.try_token_for(&key), Some("tok-123".to_string()));
    }

    #[tokio::test]
    async fn has_active_respects_status() {
        let store = fresh_store().await;
        let key = SessionKey::encode("alice", "gemini", Ide::Vscode);
        store.create(Session::new("alice", "gemini", Ide::Vscode)).await.unwrap();
        assert!(!store.has_active("alice", "gemini").await);
        store.update(&key, |s| s.status = SessionStatus::Pending).await.unwrap();
        assert!(store.has_active("alice", "gemini").await);
    }
}
