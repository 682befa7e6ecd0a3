use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::BrokerError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
pub const TUNNEL_SPAWN_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The broker's only window onto the outside world: running a command on a
/// cluster's login host and getting its stdout back. `cluster` addresses a
/// login host configured out-of-band (`ClustersConfig`); `run` does not know
/// about tunnels or long-lived processes — `TunnelManager` spawns those
/// separately.
#[async_trait]
pub trait SshExec: Send + Sync {
    async fn run(&self, cluster: &str, command: &str, timeout: Duration) -> Result<String, BrokerError>;
}

/// Shells out to the system `ssh(1)` binary, following the subprocess
/// spawn/timeout/stream pattern used for the broker's own tunnel and job
/// submission commands.
pub struct RealSsh {
    /// `cluster -> login host`, e.g. `gemini -> gemini.hpc.example.edu`.
    hosts: HashMap<String, String>,
    user: String,
}

impl RealSsh {
    pub fn new(hosts: HashMap<String, String>, user: String) -> RealSsh {
        RealSsh { hosts, user }
    }

    fn target(&self, cluster: &str) -> Result<String, BrokerError> {
        self.hosts
            .get(cluster)
            .map(|host| format!("{}@{}", self.user, host))
            .ok_or_else(|| BrokerError::ssh(format!("unknown cluster: {cluster}")))
    }
}

#[async_trait]
impl SshExec for RealSsh {
    async fn run(&self, cluster: &str, command: &str, command_timeout: Duration) -> Result<String, BrokerError> {
        let target = self.target(cluster)?;

        let mut child = Command::new("ssh")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", CONNECT_TIMEOUT.as_secs()))
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&target)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| BrokerError::ssh(format!("failed to spawn ssh: {err}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }

        let status = match timeout(command_timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(BrokerError::ssh(format!("ssh wait failed: {err}"))),
            Err(_) => {
                let _ = child.start_kill();
                return Err(BrokerError::ssh(format!("ssh to {cluster} timed out after {:?}", command_timeout)));
            }
        };

        if !status.success() {
            return Err(BrokerError::ssh(format!("ssh to {cluster} exited with {status}: {stderr}")));
        }

        Ok(stdout)
    }
}

/// Deterministic in-memory double. Tests queue one canned response (or
/// error) per `(cluster, command)` pair and assert against recorded calls;
/// also records each call's start/end so the SSHQueue serialization
/// invariant (§8) can be checked directly.
pub struct FakeSsh {
    responses: Mutex<HashMap<(String, String), Result<String, String>>>,
    pub calls: Mutex<Vec<FakeSshCall>>,
}

#[derive(Debug, Clone)]
pub struct FakeSshCall {
    pub cluster: String,
    pub command: String,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
}

impl FakeSsh {
    pub fn new() -> FakeSsh {
        FakeSsh { responses: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
    }

    pub fn respond(&self, cluster: &str, command: &str, output: &str) {
        self.responses.lock().unwrap().insert((cluster.to_string(), command.to_string()), Ok(output.to_string()));
    }

    pub fn fail(&self, cluster: &str, command: &str, message: &str) {
        self.responses.lock().unwrap().insert((cluster.to_string(), command.to_string()), Err(message.to_string()));
    }
}

impl Default for FakeSsh {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SshExec for FakeSsh {
    async fn run(&self, cluster: &str, command: &str, _timeout: Duration) -> Result<String, BrokerError> {
        let started = now_ms();
        // A tiny real await keeps this a genuine concurrency test subject
        // rather than a synchronous function wearing an async signature.
        tokio::task::yield_now().await;
        let result = self
            .responses
            .lock()
            .unwrap()
            .get(&(cluster.to_string(), command.to_string()))
            .cloned()
            .unwrap_or_else(|| Err(format!("no fake response for {cluster}: {command}")));
        let finished = now_ms();
        self.calls.lock().unwrap().push(FakeSshCall {
            cluster: cluster.to_string(),
            command: command.to_string(),
            started_at_ms: started,
            finished_at_ms: finished,
        });
        result.map_err(BrokerError::ssh)
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_ssh_returns_canned_response() {
        let fake = FakeSsh::new();
        fake.respond("gemini", "scontrol show partition -o", "PartitionName=compute");
        let out = fake.run("gemini", "scontrol show partition -o", COMMAND_TIMEOUT).await.unwrap();
        assert_eq!(out, "PartitionName=compute");
    }

    #[tokio::test]
    async fn fake_ssh_surfaces_failure() {
        let fake = FakeSsh::new();
        fake.fail("gemini", "bad-command", "permission denied");
        let err = fake.run("gemini", "bad-command", COMMAND_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, BrokerError::Ssh { .. }));
    }

    #[tokio::test]
    async fn fake_ssh_records_calls() {
        let fake = FakeSsh::new();
        fake.respond("gemini", "cmd", "ok");
        let _ = fake.run("gemini", "cmd", COMMAND_TIMEOUT).await;
        assert_eq!(fake.calls.lock().unwrap().len(), 1);
    }
}
