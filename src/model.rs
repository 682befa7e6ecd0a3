use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the three IDEs the broker knows how to launch and proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ide {
    Vscode,
    Rstudio,
    Jupyter,
}

impl Ide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ide::Vscode => "vscode",
            Ide::Rstudio => "rstudio",
            Ide::Jupyter => "jupyter",
        }
    }

    pub fn parse(s: &str) -> Option<Ide> {
        match s {
            "vscode" => Some(Ide::Vscode),
            "rstudio" => Some(Ide::Rstudio),
            "jupyter" => Some(Ide::Jupyter),
            _ => None,
        }
    }

    /// Outward SLURM job name, e.g. `hpc-vscode`.
    pub fn job_name(&self) -> String {
        format!("hpc-{}", self.as_str())
    }

    /// vscode and jupyter hand out a per-session secret; rstudio relies on
    /// its own cookie-based auth and never gets one.
    pub fn requires_token(&self) -> bool {
        !matches!(self, Ide::Rstudio)
    }

    /// Port the IDE's server listens on inside the job, i.e. the remote end
    /// of the SSH `-L` tunnel.
    pub fn default_remote_port(&self) -> u16 {
        match self {
            Ide::Vscode => 8080,
            Ide::Rstudio => 8787,
            Ide::Jupyter => 8888,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gpu {
    None,
    A100,
    V100,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Pending,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Completed,
    Cancelled,
    Timeout,
    Reconciled,
    Error,
}

/// Opaque composite key `user-cluster-ide`. Usernames may themselves contain
/// hyphens, so decoding peels off the last two hyphen-separated tokens
/// (`ide`, then `cluster`) and treats everything left over as `user`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn encode(user: &str, cluster: &str, ide: Ide) -> SessionKey {
        SessionKey(format!("{user}-{cluster}-{}", ide.as_str()))
    }

    pub fn decode(&self) -> Option<(String, String, Ide)> {
        let mut parts: Vec<&str> = self.0.split('-').collect();
        if parts.len() < 3 {
            return None;
        }
        let ide_str = parts.pop()?;
        let cluster = parts.pop()?.to_string();
        let ide = Ide::parse(ide_str)?;
        if parts.is_empty() {
            return None;
        }
        let user = parts.join("-");
        Some((user, cluster, ide))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authoritative record for one interactive IDE attempt.
///
/// Invariant: `status ∈ {Running, Pending}` implies `job_id.is_some()`.
/// `status == Running` implies `node.is_some()` and, for IDEs that require
/// one, `token.is_some()`. `started_at` is set iff the session has ever
/// reached `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user: String,
    pub cluster: String,
    pub ide: Ide,
    pub session_key: SessionKey,

    pub cpus: u32,
    pub memory: String,
    pub walltime: String,
    pub gpu: Gpu,
    pub account: String,
    pub release_version: Option<String>,

    pub status: SessionStatus,
    pub job_id: Option<String>,
    pub node: Option<String>,
    pub token: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub time_left_seconds: Option<i64>,
    pub last_activity: Option<i64>,
    pub error: Option<String>,

    pub used_dev_server: bool,

    /// Not persisted: populated from `TunnelManager` at runtime only.
    #[serde(skip)]
    pub has_tunnel: bool,
}

impl Session {
    pub fn new(user: &str, cluster: &str, ide: Ide) -> Session {
        Session {
            user: user.to_string(),
            cluster: cluster.to_string(),
            ide,
            session_key: SessionKey::encode(user, cluster, ide),
            cpus: 1,
            memory: "4G".to_string(),
            walltime: "01:00:00".to_string(),
            gpu: Gpu::None,
            account: String::new(),
            release_version: None,
            status: SessionStatus::Idle,
            job_id: None,
            node: None,
            token: None,
            submitted_at: Utc::now(),
            started_at: None,
            time_left_seconds: None,
            last_activity: None,
            error: None,
            used_dev_server: false,
            has_tunnel: false,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.status, SessionStatus::Idle | SessionStatus::Stopped)
    }
}

/// Pointer naming the session the UI considers "foreground" for proxy-time
/// token lookups. Only the `{user, cluster, ide}` schema is implemented —
/// see DESIGN.md Open Question #2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub user: String,
    pub cluster: String,
    pub ide: Ide,
}

impl ActiveSession {
    pub fn matches_key(&self, key: &SessionKey) -> bool {
        SessionKey::encode(&self.user, &self.cluster, self.ide) == *key
    }
}

/// Immutable record written when a session is cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHistory {
    pub user: String,
    pub cluster: String,
    pub ide: Ide,
    pub session_key: SessionKey,
    pub cpus: u32,
    pub memory: String,
    pub walltime: String,
    pub gpu: Gpu,
    pub account: String,
    pub job_id: Option<String>,
    pub node: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub wait_seconds: Option<i64>,
    pub duration_minutes: Option<i64>,
    pub end_reason: EndReason,
    pub error_message: Option<String>,
    pub used_dev_server: bool,
}

impl SessionHistory {
    /// Build a history row from a session about to be cleared. `ended_at`
    /// is always the current time, so `ended_at >= submitted_at` holds as
    /// long as callers do not backdate `submitted_at` into the future.
    pub fn from_session(session: &Session, end_reason: EndReason, error_message: Option<String>, now: DateTime<Utc>) -> SessionHistory {
        let wait_seconds = session.started_at.map(|started| (started - session.submitted_at).num_seconds().max(0));
        let duration_minutes = session.started_at.map(|started| (now - started).num_minutes().max(0));

        SessionHistory {
            user: session.user.clone(),
            cluster: session.cluster.clone(),
            ide: session.ide,
            session_key: session.session_key.clone(),
            cpus: session.cpus,
            memory: session.memory.clone(),
            walltime: session.walltime.clone(),
            gpu: session.gpu,
            account: session.account.clone(),
            job_id: session.job_id.clone(),
            node: session.node.clone(),
            submitted_at: session.submitted_at,
            started_at: session.started_at,
            ended_at: now,
            wait_seconds,
            duration_minutes,
            end_reason,
            error_message,
            used_dev_server: session.used_dev_server,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceGauge {
    pub used: f64,
    pub total: f64,
    pub percent: f64,
}

impl ResourceGauge {
    pub fn new(used: f64, total: f64) -> ResourceGauge {
        let percent = if total > 0.0 { (used / total) * 100.0 } else { 0.0 };
        ResourceGauge { used, total, percent }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeGauge {
    pub used: f64,
    pub total: f64,
    pub percent: f64,
    pub idle: f64,
    pub busy: f64,
    pub down: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionUsage {
    pub cpus: ResourceGauge,
    pub gpus: Option<ResourceGauge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub online: bool,
    pub cpus: ResourceGauge,
    pub memory: ResourceGauge,
    pub nodes: NodeGauge,
    pub gpus: ResourceGauge,
    pub partitions: std::collections::HashMap<String, PartitionUsage>,
    pub running_jobs: u32,
    pub pending_jobs: u32,
    pub fairshare: Option<f64>,
    pub last_checked: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub error: Option<String>,
}

impl ClusterHealth {
    pub fn offline(error: String, now: DateTime<Utc>, consecutive_failures: u32) -> ClusterHealth {
        ClusterHealth {
            online: false,
            cpus: ResourceGauge::default(),
            memory: ResourceGauge::default(),
            nodes: NodeGauge::default(),
            gpus: ResourceGauge::default(),
            partitions: std::collections::HashMap::new(),
            running_jobs: 0,
            pending_jobs: 0,
            fairshare: None,
            last_checked: now,
            consecutive_failures,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub cpus_percent: f64,
    pub memory_percent: f64,
    pub nodes_percent: f64,
    pub gpus_percent: f64,
    pub running_jobs: u32,
    pub pending_jobs: u32,
    pub a100_cpus_percent: Option<f64>,
    pub v100_cpus_percent: Option<f64>,
    /// Set once a bucket has been downsampled; `None` for full-resolution
    /// samples.
    pub sample_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionLimits {
    pub cluster: String,
    pub name: String,
    pub is_default: bool,
    pub max_cpus: Option<u32>,
    pub max_mem_mb: Option<u64>,
    pub max_time: Option<String>,
    pub default_time: Option<String>,
    pub total_cpus: u32,
    pub total_nodes: u32,
    pub total_mem_mb: u64,
    pub gpu_count: Option<u32>,
    pub gpu_type: Option<String>,
    pub restricted: bool,
    pub restriction_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user: String,
    pub account: String,
    pub fetched_at: DateTime<Utc>,
}
