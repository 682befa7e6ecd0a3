//! Reaps idle `running` sessions every 60s once a positive idle timeout is
//! configured (§4.J). Disabled entirely when the configured timeout is
//! zero, mirroring `BrokerConfig::session_idle_timeout_minutes`'s `0`
//! meaning "off" rather than "no threshold".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{EndReason, Session};
use crate::session_store::ClearOptions;
use crate::ssh::SshExec;
use crate::ssh_queue::SshQueue;
use crate::state_manager::StateManager;

const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// The session's last-known activity instant, or `None` if it can't be
/// determined (no `lastActivity` and no parseable `startedAt`) — such a
/// session is skipped rather than treated as idle.
fn reference_time(session: &Session) -> Option<DateTime<Utc>> {
    if let Some(millis) = session.last_activity {
        return DateTime::from_timestamp_millis(millis);
    }
    session.started_at
}

pub struct IdleReaper {
    state: Arc<StateManager>,
    ssh_queue: Arc<SshQueue>,
    ssh: Arc<dyn SshExec>,
    timeout: chrono::Duration,
    stopped: AtomicBool,
}

impl IdleReaper {
    pub fn new(state: Arc<StateManager>, ssh_queue: Arc<SshQueue>, ssh: Arc<dyn SshExec>, timeout_minutes: u64) -> IdleReaper {
        IdleReaper { state, ssh_queue, ssh, timeout: chrono::Duration::minutes(timeout_minutes as i64), stopped: AtomicBool::new(false) }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub async fn run(self: Arc<Self>) {
        if self.timeout <= chrono::Duration::zero() {
            return;
        }
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(SCAN_INTERVAL).await;
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.scan().await;
        }
    }

    pub async fn scan(&self) {
        let now = Utc::now();
        for session in self.state.sessions.all().await {
            if !matches!(session.status, crate::model::SessionStatus::Running) || session.job_id.is_none() {
                continue;
            }
            let Some(reference) = reference_time(&session) else { continue };
            let idle_for = now.signed_duration_since(reference).max(chrono::Duration::zero());
            if idle_for <= self.timeout {
                continue;
            }

            let job_id = session.job_id.clone().unwrap();
            let cluster = session.cluster.clone();
            let cancel_command = format!("scancel {job_id}");
            let result = self.ssh_queue.enqueue(&cluster, || async { self.ssh.run(&cluster, &cancel_command, crate::ssh::COMMAND_TIMEOUT).await }).await;
            if let Err(err) = result {
                tracing::warn!(session_key = %session.session_key, job_id = %job_id, error = %err, "failed to cancel idle job, clearing session anyway");
            }

            if let Err(err) = self.state.clear_and_notify(&session.session_key, ClearOptions { end_reason: Some(EndReason::Timeout), error_message: None }).await {
                tracing::error!(session_key = %session.session_key, error = %err, "failed to archive idle-timed-out session");
            } else {
                tracing::info!(session_key = %session.session_key, idle_minutes = idle_for.num_minutes(), "reaped idle session");
            }
        }
    }
}
