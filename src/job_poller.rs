//! Adaptive, batched SLURM queue polling. One SSH call per cluster per
//! cycle returns every queued-or-running job this service owns; individual
//! per-session lookups never happen. Grounded on the teacher's
//! `src/flows/scheduler.rs` `github_pr_loop` (interval loop + backoff + a
//! `seen`-style dedup map) and its `JoinHandle`-per-loop bookkeeping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::model::{EndReason, SessionStatus};
use crate::session_store::ClearOptions;
use crate::slurm::{self, JobInfo};
use crate::ssh::SshExec;
use crate::ssh_queue::SshQueue;
use crate::state_manager::StateManager;

pub const FREQUENT: Duration = Duration::from_secs(15);
pub const MODERATE: Duration = Duration::from_secs(60);
pub const RELAXED: Duration = Duration::from_secs(5 * 60);
pub const INFREQUENT: Duration = Duration::from_secs(10 * 60);
pub const IDLE: Duration = Duration::from_secs(30 * 60);
pub const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

const JOB_NAMES: &str = "hpc-vscode,hpc-rstudio,hpc-jupyter";

fn batch_list_command() -> String {
    format!("squeue --name={JOB_NAMES} --states=R,PD -h -o '%i|%T|%N|%L|%j' 2>/dev/null || true")
}

/// Pure backoff function, tested directly against SPEC_FULL.md §8's
/// boundary cases. `min_time_left_seconds` is the minimum
/// `time_left_seconds` across all `pending`/`running` sessions; `None` when
/// there are none with a known time left.
pub fn next_interval(has_pending: bool, active_count: usize, min_time_left_seconds: Option<i64>, unchanged_count: u32) -> Duration {
    let base = if has_pending {
        FREQUENT
    } else if active_count == 0 {
        IDLE
    } else {
        match min_time_left_seconds {
            Some(t) if t < 600 => FREQUENT,
            Some(t) if t < 1_800 => MODERATE,
            Some(t) if t < 3_600 => RELAXED,
            Some(t) if t < 21_600 => INFREQUENT,
            _ => IDLE,
        }
    };

    if unchanged_count >= 3 {
        let exponent = (unchanged_count - 2).min(3);
        let multiplier = 1.5f64.powi(exponent as i32);
        let scaled = Duration::from_secs_f64((base.as_secs_f64() * multiplier).min(MAX_INTERVAL.as_secs_f64()));
        scaled.min(MAX_INTERVAL)
    } else {
        base
    }
}

pub struct JobPoller {
    state: Arc<StateManager>,
    ssh_queue: Arc<SshQueue>,
    ssh: Arc<dyn SshExec>,
    clusters: Vec<String>,
    unchanged_count: AtomicU32,
    fast_poll: Notify,
    stopped: AtomicBool,
}

impl JobPoller {
    pub fn new(state: Arc<StateManager>, ssh_queue: Arc<SshQueue>, ssh: Arc<dyn SshExec>, clusters: Vec<String>) -> JobPoller {
        JobPoller { state, ssh_queue, ssh, clusters, unchanged_count: AtomicU32::new(0), fast_poll: Notify::new(), stopped: AtomicBool::new(false) }
    }

    /// A call site (e.g. "session just created, now pending") uses this to
    /// re-arm the next sleep to fire within `FREQUENT`, race-free because
    /// the wait loop always listens on this `Notify` alongside the sleep.
    pub fn trigger_fast_poll(&self) {
        self.fast_poll.notify_one();
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.fast_poll.notify_one();
    }

    pub async fn run(self: Arc<Self>) {
        let mut interval = FREQUENT;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.fast_poll.notified() => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    interval = FREQUENT;
                }
            }

            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            match self.run_cycle().await {
                Ok(significant) => {
                    if significant {
                        self.unchanged_count.store(0, Ordering::SeqCst);
                    } else {
                        self.unchanged_count.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "job poll cycle failed, rescheduling anyway");
                }
            }

            interval = self.compute_next_interval().await;
        }
    }

    async fn compute_next_interval(&self) -> Duration {
        let sessions = self.state.sessions.active_only().await;
        let has_pending = sessions.iter().any(|s| matches!(s.status, SessionStatus::Pending));
        let min_time_left = sessions.iter().filter_map(|s| s.time_left_seconds).min();
        let unchanged = self.unchanged_count.load(Ordering::SeqCst);
        next_interval(has_pending, sessions.len(), min_time_left, unchanged)
    }

    /// One full cycle: batch-query every cluster in parallel, match jobs to
    /// sessions, apply transitions. Returns whether anything significant
    /// changed (a status transition or a disappearance).
    pub async fn run_cycle(&self) -> Result<bool, crate::error::BrokerError> {
        let mut significant = false;

        let futures = self.clusters.iter().map(|cluster| {
            let cluster = cluster.clone();
            async move {
                let command = batch_list_command();
                let result = self.ssh_queue.enqueue(&cluster, || async { self.ssh.run(&cluster, &command, crate::ssh::COMMAND_TIMEOUT).await }).await;
                (cluster, result)
            }
        });
        let results = futures::future::join_all(futures).await;

        for (cluster, result) in results {
            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    tracing::warn!(cluster = %cluster, error = %err, "job poll cycle failed for cluster");
                    continue;
                }
            };
            let jobs = slurm::parse_job_list(&output);
            if self.apply_cluster_jobs(&cluster, &jobs).await? {
                significant = true;
            }
        }

        Ok(significant)
    }

    async fn apply_cluster_jobs(&self, cluster: &str, jobs: &[JobInfo]) -> Result<bool, crate::error::BrokerError> {
        let mut significant = false;
        let sessions = self.state.sessions.all().await;

        for session in sessions {
            if session.cluster != cluster || !matches!(session.status, SessionStatus::Pending | SessionStatus::Running) {
                continue;
            }
            let Some(job_id) = session.job_id.clone() else { continue };
            let matched = jobs.iter().find(|j| j.job_id == job_id);

            match matched {
                None => {
                    let end_reason = if session.error.is_some() { EndReason::Error } else { EndReason::Completed };
                    self.state
                        .clear_and_notify(&session.session_key, ClearOptions { end_reason: Some(end_reason), error_message: session.error.clone() })
                        .await?;
                    significant = true;
                }
                Some(job) => {
                    if slurm::is_terminal(&job.state) {
                        let end_reason = slurm::end_reason_for_state(&job.state);
                        self.state.clear_and_notify(&session.session_key, ClearOptions { end_reason: Some(end_reason), error_message: None }).await?;
                        significant = true;
                        continue;
                    }

                    let was_pending = matches!(session.status, SessionStatus::Pending);
                    let was_running = matches!(session.status, SessionStatus::Running);
                    let now_pending = slurm::is_pending(&job.state);
                    let now_running = slurm::is_running(&job.state);

                    if (was_pending && now_running) || (was_running && now_pending) {
                        significant = true;
                    }

                    let job = job.clone();
                    self.state
                        .sessions
                        .update(&session.session_key, |s| {
                            s.time_left_seconds = job.time_left_seconds;
                            if now_running {
                                s.status = SessionStatus::Running;
                                if job.node.is_some() {
                                    s.node = job.node.clone();
                                }
                                if s.started_at.is_none() {
                                    s.started_at = Some(chrono::Utc::now());
                                }
                            } else if now_pending {
                                s.status = SessionStatus::Pending;
                            }
                        })
                        .await?;
                }
            }
        }

        Ok(significant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ide, Session};
    use crate::ssh::FakeSsh;
    use crate::store::SqliteStore;

    fn poller(ssh: Arc<FakeSsh>) -> (JobPoller, Arc<StateManager>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let state = Arc::new(StateManager::new(store, Arc::new(SshQueue::new()), ssh.clone(), vec!["gemini".to_string()]));
        (JobPoller::new(state.clone(), Arc::new(SshQueue::new()), ssh, vec!["gemini".to_string()]), state)
    }

    #[test]
    fn never_exceeds_max_regardless_of_unchanged_count() {
        let interval = next_interval(false, 1, Some(36_000), 50);
        assert!(interval <= MAX_INTERVAL);
    }

    #[test]
    fn backoff_only_kicks_in_at_three() {
        assert_eq!(next_interval(false, 1, Some(36_000), 2), IDLE);
        assert_ne!(next_interval(false, 1, Some(36_000), 3), IDLE);
    }

    #[test]
    fn exponential_backoff_matches_walkthrough() {
        let base = IDLE;
        assert_eq!(next_interval(false, 1, Some(36_000), 0), base);
        assert_eq!(next_interval(false, 1, Some(36_000), 3), Duration::from_secs_f64(base.as_secs_f64() * 1.5));
        assert_eq!(next_interval(false, 1, Some(36_000), 4), Duration::from_secs_f64(base.as_secs_f64() * 1.5 * 1.5));
        assert_eq!(next_interval(false, 1, Some(36_000), 5), MAX_INTERVAL);
    }

    #[test]
    fn pending_session_always_forces_frequent() {
        assert_eq!(next_interval(true, 1, Some(36_000), 10), FREQUENT);
    }

    #[test]
    fn no_active_sessions_is_idle() {
        assert_eq!(next_interval(false, 0, None, 0), IDLE);
    }

    #[test]
    fn time_left_thresholds() {
        assert_eq!(next_interval(false, 1, Some(500), 0), FREQUENT);
        assert_eq!(next_interval(false, 1, Some(1_000), 0), MODERATE);
        assert_eq!(next_interval(false, 1, Some(2_000), 0), RELAXED);
        assert_eq!(next_interval(false, 1, Some(10_000), 0), INFREQUENT);
    }

    #[tokio::test]
    async fn pending_to_running_sets_started_at_and_node() {
        let fake = Arc::new(FakeSsh::new());
        fake.respond("gemini", "squeue --name=hpc-vscode,hpc-rstudio,hpc-jupyter --states=R,PD -h -o '%i|%T|%N|%L|%j' 2>/dev/null || true", "77|RUNNING|cn-07|7200|hpc-vscode");
        let (poller, state) = poller(fake);

        let mut session = Session::new("alice", "gemini", Ide::Vscode);
        session.status = SessionStatus::Pending;
        session.job_id = Some("77".to_string());
        state.sessions.create(session.clone()).await.unwrap();

        let significant = poller.run_cycle().await.unwrap();
        assert!(significant);

        let updated = state.sessions.get(&session.session_key).await.unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert_eq!(updated.node.as_deref(), Some("cn-07"));
        assert!(updated.started_at.is_some());
    }

    #[tokio::test]
    async fn missing_job_clears_session_as_completed() {
        let fake = Arc::new(FakeSsh::new());
        fake.respond("gemini", "squeue --name=hpc-vscode,hpc-rstudio,hpc-jupyter --states=R,PD -h -o '%i|%T|%N|%L|%j' 2>/dev/null || true", "");
        let (poller, state) = poller(fake);

        let mut session = Session::new("alice", "gemini", Ide::Vscode);
        session.status = SessionStatus::Running;
        session.job_id = Some("77".to_string());
        session.started_at = Some(chrono::Utc::now());
        state.sessions.create(session.clone()).await.unwrap();

        let significant = poller.run_cycle().await.unwrap();
        assert!(significant);
        assert!(state.sessions.get(&session.session_key).await.is_none());

        let history = state.sessions.get_history(Default::default()).await.unwrap();
        assert_eq!(history[0].end_reason, EndReason::Completed);
    }

    #[tokio::test]
    async fn time_left_always_refreshes_even_without_transition() {
        let fake = Arc::new(FakeSsh::new());
        fake.respond("gemini", "squeue --name=hpc-vscode,hpc-rstudio,hpc-jupyter --states=R,PD -h -o '%i|%T|%N|%L|%j' 2>/dev/null || true", "77|RUNNING|cn-07|1800|hpc-vscode");
        let (poller, state) = poller(fake);

        let mut session = Session::new("alice", "gemini", Ide::Vscode);
        session.status = SessionStatus::Running;
        session.job_id = Some("77".to_string());
        session.node = Some("cn-07".to_string());
        session.started_at = Some(chrono::Utc::now());
        session.time_left_seconds = Some(9_999);
        state.sessions.create(session.clone()).await.unwrap();

        let significant = poller.run_cycle().await.unwrap();
        assert!(!significant);
        let updated = state.sessions.get(&session.session_key).await.unwrap();
        assert_eq!(updated.time_left_seconds, Some(1_800));
    }
}
