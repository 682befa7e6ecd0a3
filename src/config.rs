use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Process-wide settings, read from environment variables. Built through
/// `from_raw_values` so tests never have to mutate `std::env`.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub port: u16,
    pub environment: String,
    pub sentry_dsn: Option<String>,

    pub hpc_ssh_user: Option<String>,
    pub default_hpc: Option<String>,
    pub default_ide: Option<String>,
    pub default_cpus: u32,
    pub default_mem: String,
    pub default_time: String,
    pub additional_ports: Vec<u16>,
    pub session_idle_timeout_minutes: u64,
    pub enable_state_persistence: bool,
    pub state_file: String,
    pub use_sqlite: bool,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        Self::from_raw_values(&|key| std::env::var(key).ok())
    }

    /// `lookup` is a pure function from variable name to raw string value,
    /// so callers (production `from_env`, or a test) control the inputs
    /// without touching process-global environment.
    pub fn from_raw_values(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let port = lookup("PORT").and_then(|v| v.parse().ok()).unwrap_or(8081);
        let environment = lookup("ENVIRONMENT").filter(|s| !s.is_empty()).unwrap_or_else(|| "local".to_string());
        let sentry_dsn = lookup("SENTRY_DSN").filter(|s| !s.is_empty());

        let hpc_ssh_user = lookup("HPC_SSH_USER").filter(|s| !s.is_empty());
        let default_hpc = lookup("DEFAULT_HPC").filter(|s| !s.is_empty());
        let default_ide = lookup("DEFAULT_IDE").filter(|s| !s.is_empty());
        let default_cpus = lookup("DEFAULT_CPUS").and_then(|v| v.parse().ok()).unwrap_or(4);
        let default_mem = lookup("DEFAULT_MEM").filter(|s| !s.is_empty()).unwrap_or_else(|| "8G".to_string());
        let default_time = lookup("DEFAULT_TIME").filter(|s| !s.is_empty()).unwrap_or_else(|| "01:00:00".to_string());

        let additional_ports = match lookup("ADDITIONAL_PORTS") {
            None => vec![5500],
            Some(raw) if raw.is_empty() => vec![],
            Some(raw) => raw.split(',').filter_map(|p| p.trim().parse::<u16>().ok()).collect(),
        };

        let session_idle_timeout_minutes = lookup("SESSION_IDLE_TIMEOUT").and_then(|v| v.parse().ok()).unwrap_or(0);
        let enable_state_persistence = lookup("ENABLE_STATE_PERSISTENCE").map(|v| is_truthy(&v)).unwrap_or(false);
        let state_file = lookup("STATE_FILE").filter(|s| !s.is_empty()).unwrap_or_else(|| "state.json".to_string());
        let use_sqlite = lookup("USE_SQLITE").map(|v| is_truthy(&v)).unwrap_or(true);

        BrokerConfig {
            port,
            environment,
            sentry_dsn,
            hpc_ssh_user,
            default_hpc,
            default_ide,
            default_cpus,
            default_mem,
            default_time,
            additional_ports,
            session_idle_timeout_minutes,
            enable_state_persistence,
            state_file,
            use_sqlite,
        }
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// A cluster's GPU partition, parsed from its `[clusters.X.gpu]` block.
#[derive(Debug, Clone, Deserialize)]
pub struct GpuPartitionConfig {
    pub partition: String,
    pub gres: String,
    #[serde(default)]
    pub max_time: Option<String>,
    #[serde(default)]
    pub mem: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    pub partition: String,
    #[serde(default)]
    pub bind_paths: Vec<String>,
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default)]
    pub library_paths: Vec<String>,
    #[serde(default)]
    pub gpu: Option<GpuPartitionConfig>,
}

/// `[clusters.<name>]` blocks loaded from a TOML file.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClustersConfig {
    #[serde(default)]
    pub clusters: HashMap<String, ClusterConfig>,
}

impl ClustersConfig {
    pub fn load(path: &Path) -> Result<ClustersConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read clusters config at {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse clusters config at {}", path.display()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.clusters.keys().map(|s| s.as_str()).collect()
    }
}
