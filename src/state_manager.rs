//! Binds SessionStore, SSHQueue and the persistent store together: startup
//! load/reconcile, cooperative operation locks, the per-process user-account
//! cache, and the single `on_session_cleared` notification point TunnelManager
//! and ProxyRegistry hang their teardown off of.
//!
//! Grounded on the teacher's `src/server/mod.rs` `AppState` wiring (struct
//! holding every shared component behind `Arc`) and
//! `cthulu-backend/flows/file_repository.rs`'s `load_all()` startup sequence.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::error::BrokerError;
use crate::model::{EndReason, Session, SessionHistory, SessionStatus, UserAccount};
use crate::session_store::{ClearOptions, SessionStore};
use crate::slurm;
use crate::ssh::SshExec;
use crate::ssh_queue::SshQueue;
use crate::store::SqliteStore;

pub type SessionClearedCallback = Arc<dyn Fn(SessionHistory) + Send + Sync>;

/// Single-job inspector command for one `(cluster, job_id)`. Kept as a free
/// function (not a method) so both `StateManager::reconcile` and tests can
/// build the exact command string the same way.
fn single_job_command(job_id: &str) -> String {
    format!("squeue -j {job_id} -h -o '%i|%T|%N|%L' 2>/dev/null || true")
}

pub struct StateManager {
    pub sessions: Arc<SessionStore>,
    store: Arc<SqliteStore>,
    ssh_queue: Arc<SshQueue>,
    ssh: Arc<dyn SshExec>,
    clusters: Vec<String>,
    locks: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
    user_accounts: RwLock<HashMap<String, UserAccount>>,
    on_cleared: std::sync::Mutex<Option<SessionClearedCallback>>,
    ready: RwLock<bool>,
}

impl StateManager {
    pub fn new(store: Arc<SqliteStore>, ssh_queue: Arc<SshQueue>, ssh: Arc<dyn SshExec>, clusters: Vec<String>) -> StateManager {
        StateManager {
            sessions: Arc::new(SessionStore::new(store.clone())),
            store,
            ssh_queue,
            ssh,
            clusters,
            locks: Mutex::new(HashMap::new()),
            user_accounts: RwLock::new(HashMap::new()),
            on_cleared: std::sync::Mutex::new(None),
            ready: RwLock::new(false),
        }
    }

    pub fn set_on_session_cleared(&self, callback: SessionClearedCallback) {
        *self.on_cleared.lock().unwrap() = Some(callback);
    }

    async fn notify_cleared(&self, history: SessionHistory) {
        let callback = self.on_cleared.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(history);
        }
    }

    /// Five-step startup sequence: the store is already open by the time
    /// this runs (`SqliteStore::open` happened in `broker.rs`'s wiring).
    pub async fn load(&self, legacy_state_path: Option<&std::path::Path>) -> Result<(), BrokerError> {
        if let Some(path) = legacy_state_path {
            crate::store::legacy::migrate_if_present(&self.store, path).await?;
        }

        self.sessions.reload_from_store().await?;

        self.reconcile().await;

        *self.ready.write().await = true;
        Ok(())
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// For every `running` session, query the cluster for its job. A
    /// successful query that finds the job still pending/running keeps the
    /// session untouched; a successful query that finds it gone or terminal
    /// clears the session with `endReason=reconciled`. A failing query
    /// conservatively leaves the session in place (§7: reconciliation
    /// errors favor keeping state over losing it).
    async fn reconcile(&self) {
        let sessions = self.sessions.all().await;
        for session in sessions {
            if !matches!(session.status, SessionStatus::Running | SessionStatus::Pending) {
                continue;
            }
            let Some(job_id) = session.job_id.clone() else { continue };

            let cluster = session.cluster.clone();
            let command = single_job_command(&job_id);
            let result = self.ssh_queue.enqueue(&cluster, || async { self.ssh.run(&cluster, &command, crate::ssh::COMMAND_TIMEOUT).await }).await;

            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    tracing::warn!(cluster = %cluster, job_id = %job_id, error = %err, "reconcile: ssh query failed, keeping session in place");
                    continue;
                }
            };

            let job = slurm::parse_single_job(&job_id, &output);
            let gone_or_terminal = match &job {
                None => true,
                Some(job) => slurm::is_terminal(&job.state),
            };

            if gone_or_terminal {
                if let Err(err) = self.clear_and_notify(&session.session_key, ClearOptions { end_reason: Some(EndReason::Reconciled), error_message: None }).await {
                    tracing::error!(session_key = %session.session_key, error = %err, "failed to archive reconciled session");
                } else {
                    tracing::info!(session_key = %session.session_key, job_id = %job_id, "reconciled away: job no longer active");
                }
            }
        }
    }

    async fn clear_pointer_if_matches(&self, session: &Session) {
        if let Ok(Some(pointer)) = self.store.get_active_session_pointer().await {
            if pointer.matches_key(&session.session_key) {
                let _ = self.store.set_active_session_pointer(None).await;
            }
        }
    }

    /// Clears a session, drops the `ActiveSession` pointer if it named this
    /// key, and fires `on_session_cleared` — the single path JobPoller,
    /// IdleReaper, and `reconcile` all funnel through so TunnelManager and
    /// ProxyRegistry learn about every termination uniformly.
    pub async fn clear_and_notify(&self, key: &crate::model::SessionKey, options: ClearOptions) -> Result<Option<SessionHistory>, BrokerError> {
        let Some(session) = self.sessions.get(key).await else {
            return Ok(None);
        };
        let history = self.sessions.clear(key, options).await?;
        if let Some(history) = history.clone() {
            self.clear_pointer_if_matches(&session).await;
            self.notify_cleared(history).await;
        }
        Ok(history)
    }

    // -- locks ------------------------------------------------------------

    /// Non-reentrant: rejects with `Lock` if already held.
    pub async fn acquire(&self, operation: &str) -> Result<(), BrokerError> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(operation) {
            return Err(BrokerError::lock(operation));
        }
        locks.insert(operation.to_string(), Utc::now());
        Ok(())
    }

    /// Idempotent: releasing a lock that isn't held is a no-op.
    pub async fn release(&self, operation: &str) {
        self.locks.lock().await.remove(operation);
    }

    pub fn launch_lock_name(session_key: &crate::model::SessionKey) -> String {
        format!("launch:{session_key}")
    }

    pub fn stop_lock_name(session_key: &crate::model::SessionKey) -> String {
        format!("stop:{session_key}")
    }

    // -- user account cache -------------------------------------------------

    /// Picks the first configured cluster, asks SLURM for the user's
    /// default account, and caches the result for the rest of the process
    /// lifetime (entries never expire in-process; a restart always
    /// refetches).
    pub async fn fetch_user_account(&self, user: &str) -> Result<UserAccount, BrokerError> {
        if let Some(cached) = self.user_accounts.read().await.get(user).cloned() {
            return Ok(cached);
        }

        let cluster = self.clusters.first().ok_or_else(|| BrokerError::unexpected("no clusters configured"))?.clone();
        let command = format!("sacctmgr show user {user} format=defaultaccount -n -P 2>/dev/null");
        let output = self.ssh_queue.enqueue(&cluster, || async { self.ssh.run(&cluster, &command, crate::ssh::COMMAND_TIMEOUT).await }).await?;
        let account = output.lines().next().unwrap_or("").trim().to_string();
        if account.is_empty() {
            return Err(BrokerError::job(format!("no default account found for user {user}")));
        }

        let record = UserAccount { user: user.to_string(), account, fetched_at: Utc::now() };
        self.user_accounts.write().await.insert(user.to_string(), record.clone());
        self.store.upsert_user_account(record.clone()).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ide, SessionKey};
    use crate::ssh::FakeSsh;

    fn manager(ssh: Arc<FakeSsh>) -> StateManager {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        StateManager::new(store, Arc::new(SshQueue::new()), ssh, vec!["gemini".to_string()])
    }

    #[tokio::test]
    async fn lock_rejects_double_acquire() {
        let manager = manager(Arc::new(FakeSsh::new()));
        manager.acquire("launch:alice-gemini-vscode").await.unwrap();
        let second = manager.acquire("launch:alice-gemini-vscode").await;
        assert!(matches!(second, Err(BrokerError::Lock { .. })));
        manager.release("launch:alice-gemini-vscode").await;
        assert!(manager.acquire("launch:alice-gemini-vscode").await.is_ok());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let manager = manager(Arc::new(FakeSsh::new()));
        manager.release("never:held").await;
        manager.release("never:held").await;
    }

    #[tokio::test]
    async fn fetch_user_account_caches_after_first_lookup() {
        let fake = Arc::new(FakeSsh::new());
        fake.respond("gemini", "sacctmgr show user alice format=defaultaccount -n -P 2>/dev/null", "pi-smith\n");
        let manager = manager(fake.clone());

        let first = manager.fetch_user_account("alice").await.unwrap();
        assert_eq!(first.account, "pi-smith");

        // Remove the canned response: a cache hit must not re-call SSH.
        let second = manager.fetch_user_account("alice").await.unwrap();
        assert_eq!(second.account, "pi-smith");
        assert_eq!(fake.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reconcile_clears_session_with_gone_job() {
        let fake = Arc::new(FakeSsh::new());
        fake.respond("gemini", &single_job_command("5150"), "");
        let manager = manager(fake);

        let mut session = Session::new("bob", "gemini", Ide::Jupyter);
        session.status = SessionStatus::Running;
        session.job_id = Some("5150".to_string());
        session.node = Some("cn-01".to_string());
        session.started_at = Some(Utc::now());
        manager.sessions.create(session.clone()).await.unwrap();
        manager.store.set_active_session_pointer(Some(&crate::model::ActiveSession { user: "bob".to_string(), cluster: "gemini".to_string(), ide: Ide::Jupyter })).await.unwrap();

        let cleared = Arc::new(std::sync::Mutex::new(None));
        let cleared_clone = cleared.clone();
        manager.set_on_session_cleared(Arc::new(move |history| {
            *cleared_clone.lock().unwrap() = Some(history);
        }));

        manager.reconcile().await;

        assert!(manager.sessions.get(&session.session_key).await.is_none());
        assert_eq!(cleared.lock().unwrap().as_ref().unwrap().end_reason, EndReason::Reconciled);
        assert!(manager.store.get_active_session_pointer().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_keeps_session_when_job_still_running() {
        let fake = Arc::new(FakeSsh::new());
        fake.respond("gemini", &single_job_command("5150"), "5150|RUNNING|cn-01|3600");
        let manager = manager(fake);

        let mut session = Session::new("bob", "gemini", Ide::Jupyter);
        session.status = SessionStatus::Running;
        session.job_id = Some("5150".to_string());
        manager.sessions.create(session.clone()).await.unwrap();

        manager.reconcile().await;
        assert!(manager.sessions.get(&session.session_key).await.is_some());
    }

    #[tokio::test]
    async fn reconcile_keeps_session_on_ssh_error() {
        let fake = Arc::new(FakeSsh::new());
        fake.fail("gemini", &single_job_command("5150"), "connection refused");
        let manager = manager(fake);

        let mut session = Session::new("bob", "gemini", Ide::Jupyter);
        session.status = SessionStatus::Running;
        session.job_id = Some("5150".to_string());
        manager.sessions.create(session.clone()).await.unwrap();

        manager.reconcile().await;
        assert!(manager.sessions.get(&session.session_key).await.is_some());
    }

    #[tokio::test]
    async fn load_runs_migration_then_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut session = Session::new("alice", "gemini", Ide::Vscode);
        session.status = SessionStatus::Running;
        session.job_id = Some("1".to_string());
        let legacy = serde_json::json!({ "sessions": [session], "activeSession": null });
        std::fs::write(&path, serde_json::to_string(&legacy).unwrap()).unwrap();

        let fake = Arc::new(FakeSsh::new());
        fake.respond("gemini", &single_job_command("1"), "");
        let manager = manager(fake);
        manager.load(Some(&path)).await.unwrap();

        assert!(manager.is_ready().await);
        assert!(manager.sessions.all().await.is_empty());
    }
}
