//! SSH port-forward lifecycle for running sessions (§4.K). Spawns `ssh -N -L
//! <port>:<node>:<remote_port>`, keeps the child process handle alive for
//! the session's lifetime, and tears it down when `StateManager` reports the
//! session cleared. Grounded on the teacher's `guest_agent.rs`
//! (`tokio::process::Command::new("ssh")` + PID-based kill on timeout) and
//! `relay.rs` (`child.kill()` on teardown).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::BrokerError;
use crate::model::{Session, SessionHistory, SessionKey};
use crate::port::{PortAllocator, PortRegistry};
use crate::ssh::TUNNEL_SPAWN_TIMEOUT;

/// A live forward. `kill` is idempotent from the caller's point of view:
/// `TunnelManager` only ever calls it once per handle, but implementations
/// must tolerate the underlying process having already exited.
#[async_trait]
pub trait TunnelHandle: Send + Sync {
    async fn kill(&mut self);
}

/// Opens the forward itself; kept as a narrow trait (not the whole
/// `SshExec`) so tests substitute a deterministic fake, per DESIGN NOTES'
/// cycle-avoidance guidance already applied to `PartitionRefresher`.
#[async_trait]
pub trait TunnelSpawner: Send + Sync {
    async fn spawn(&self, cluster: &str, local_port: u16, compute_node: &str, remote_port: u16) -> Result<Box<dyn TunnelHandle>, BrokerError>;
}

pub struct RealTunnelHandle {
    child: tokio::process::Child,
}

#[async_trait]
impl TunnelHandle for RealTunnelHandle {
    async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// `cluster -> "user@host"`, built once at wiring time from `ClustersConfig`
/// plus the default HPC SSH user (mirrors `RealSsh`'s `hosts` map).
pub struct RealTunnelSpawner {
    targets: HashMap<String, String>,
}

impl RealTunnelSpawner {
    pub fn new(targets: HashMap<String, String>) -> RealTunnelSpawner {
        RealTunnelSpawner { targets }
    }

    fn target(&self, cluster: &str) -> Result<&str, BrokerError> {
        self.targets.get(cluster).map(String::as_str).ok_or_else(|| BrokerError::tunnel(format!("unknown cluster: {cluster}")))
    }
}

#[async_trait]
impl TunnelSpawner for RealTunnelSpawner {
    async fn spawn(&self, cluster: &str, local_port: u16, compute_node: &str, remote_port: u16) -> Result<Box<dyn TunnelHandle>, BrokerError> {
        let target = self.target(cluster)?;
        let forward = format!("{local_port}:{compute_node}:{remote_port}");

        let mut command = tokio::process::Command::new("ssh");
        command
            .arg("-N")
            .arg("-L")
            .arg(&forward)
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(target);

        let spawn_result = tokio::time::timeout(TUNNEL_SPAWN_TIMEOUT, async { command.spawn() }).await;
        let child = match spawn_result {
            Ok(Ok(child)) => child,
            Ok(Err(err)) => return Err(BrokerError::tunnel(format!("failed to spawn tunnel to {cluster}: {err}"))),
            Err(_) => return Err(BrokerError::tunnel(format!("tunnel spawn to {cluster} timed out"))),
        };

        Ok(Box::new(RealTunnelHandle { child }))
    }
}

/// Deterministic in-memory double. Every `spawn()` call is recorded; a
/// cluster can be configured to fail instead.
pub struct FakeTunnelSpawner {
    pub calls: std::sync::Mutex<Vec<(String, u16, String, u16)>>,
    failing: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl FakeTunnelSpawner {
    pub fn new() -> FakeTunnelSpawner {
        FakeTunnelSpawner { calls: std::sync::Mutex::new(Vec::new()), failing: std::sync::Mutex::new(std::collections::HashSet::new()) }
    }

    pub fn fail_cluster(&self, cluster: &str) {
        self.failing.lock().unwrap().insert(cluster.to_string());
    }
}

impl Default for FakeTunnelSpawner {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FakeTunnelHandle {
    pub killed: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl TunnelHandle for FakeTunnelHandle {
    async fn kill(&mut self) {
        self.killed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl TunnelSpawner for FakeTunnelSpawner {
    async fn spawn(&self, cluster: &str, local_port: u16, compute_node: &str, remote_port: u16) -> Result<Box<dyn TunnelHandle>, BrokerError> {
        self.calls.lock().unwrap().push((cluster.to_string(), local_port, compute_node.to_string(), remote_port));
        if self.failing.lock().unwrap().contains(cluster) {
            return Err(BrokerError::tunnel(format!("fake tunnel failure for {cluster}")));
        }
        Ok(Box::new(FakeTunnelHandle { killed: Arc::new(std::sync::atomic::AtomicBool::new(false)) }))
    }
}

/// Owns every live tunnel. `on_session_cleared` (wired in `broker.rs`) calls
/// `teardown` for every session StateManager reports gone; `launch` is
/// called once a job transitions to `running` and its node is known.
pub struct TunnelManager {
    spawner: Arc<dyn TunnelSpawner>,
    ports: Arc<PortRegistry>,
    handles: Mutex<HashMap<SessionKey, Box<dyn TunnelHandle>>>,
}

impl TunnelManager {
    pub fn new(spawner: Arc<dyn TunnelSpawner>, ports: Arc<PortRegistry>) -> TunnelManager {
        TunnelManager { spawner, ports, handles: Mutex::new(HashMap::new()) }
    }

    /// Allocates a local port, records it in `PortRegistry`, and opens the
    /// `-L` forward to the session's compute node. Returns the allocated
    /// port so the caller can update `Session.has_tunnel` / hand it to
    /// `ProxyRegistry`.
    pub async fn launch(&self, session: &Session) -> Result<u16, BrokerError> {
        let node = session.node.as_deref().ok_or_else(|| BrokerError::tunnel("cannot open tunnel: session has no node yet"))?;
        let local_port = PortAllocator::allocate().await?;
        let remote_port = session.ide.default_remote_port();

        let handle = self.spawner.spawn(&session.cluster, local_port, node, remote_port).await?;

        self.ports.set(&session.session_key, local_port).await;
        self.handles.lock().await.insert(session.session_key.clone(), handle);
        Ok(local_port)
    }

    /// Closes the tunnel and frees the port. Idempotent: a session with no
    /// tunnel on record (never launched, or already torn down) is a no-op.
    pub async fn teardown(&self, key: &SessionKey) {
        let handle = self.handles.lock().await.remove(key);
        if let Some(mut handle) = handle {
            handle.kill().await;
        }
        self.ports.remove(key).await;
    }

    /// The `on_session_cleared` callback shape `StateManager` expects.
    pub async fn handle_session_cleared(&self, history: &SessionHistory) {
        self.teardown(&history.session_key).await;
    }

    pub async fn has_tunnel(&self, key: &SessionKey) -> bool {
        self.handles.lock().await.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndReason, Ide};

    fn manager(spawner: Arc<FakeTunnelSpawner>) -> TunnelManager {
        TunnelManager::new(spawner, Arc::new(PortRegistry::new()))
    }

    fn running_session() -> Session {
        let mut session = Session::new("alice", "gemini", Ide::Vscode);
        session.status = crate::model::SessionStatus::Running;
        session.node = Some("cn-07".to_string());
        session
    }

    #[tokio::test]
    async fn launch_records_port_and_handle() {
        let spawner = Arc::new(FakeTunnelSpawner::new());
        let manager = manager(spawner.clone());
        let session = running_session();

        let port = manager.launch(&session).await.unwrap();
        assert!(port > 0);
        assert!(manager.has_tunnel(&session.session_key).await);
        assert_eq!(manager.ports.get(&session.session_key).await, Some(port));

        let calls = spawner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "gemini");
        assert_eq!(calls[0].2, "cn-07");
        assert_eq!(calls[0].3, 8080);
    }

    #[tokio::test]
    async fn launch_without_node_fails() {
        let spawner = Arc::new(FakeTunnelSpawner::new());
        let manager = manager(spawner);
        let session = Session::new("alice", "gemini", Ide::Vscode);
        assert!(manager.launch(&session).await.is_err());
    }

    #[tokio::test]
    async fn launch_surfaces_spawner_failure() {
        let spawner = Arc::new(FakeTunnelSpawner::new());
        spawner.fail_cluster("gemini");
        let manager = manager(spawner);
        let session = running_session();
        assert!(manager.launch(&session).await.is_err());
        assert!(!manager.has_tunnel(&session.session_key).await);
    }

    #[tokio::test]
    async fn teardown_kills_handle_and_frees_port() {
        let spawner = Arc::new(FakeTunnelSpawner::new());
        let manager = manager(spawner);
        let session = running_session();
        manager.launch(&session).await.unwrap();

        manager.teardown(&session.session_key).await;
        assert!(!manager.has_tunnel(&session.session_key).await);
        assert_eq!(manager.ports.get(&session.session_key).await, None);
    }

    #[tokio::test]
    async fn teardown_is_idempotent_for_unknown_session() {
        let spawner = Arc::new(FakeTunnelSpawner::new());
        let manager = manager(spawner);
        let key = SessionKey::encode("ghost", "gemini", Ide::Vscode);
        manager.teardown(&key).await;
        manager.teardown(&key).await;
    }

    #[tokio::test]
    async fn on_session_cleared_callback_tears_down_by_key() {
        let spawner = Arc::new(FakeTunnelSpawner::new());
        let manager = manager(spawner);
        let session = running_session();
        manager.launch(&session).await.unwrap();

        let history = SessionHistory::from_session(&session, EndReason::Completed, None, chrono::Utc::now());
        manager.handle_session_cleared(&history).await;
        assert!(!manager.has_tunnel(&session.session_key).await);
    }
}
