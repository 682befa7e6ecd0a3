use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::BrokerError;
use crate::model::PartitionLimits;
use crate::ssh::{SshExec, COMMAND_TIMEOUT};
use crate::timefmt::UNLIMITED_MAX_TIME;

/// Parses one `scontrol show partition -o` line into a key=value map. Tokens
/// are whitespace-separated; each is `KEY=VALUE` with no embedded spaces
/// (list-valued fields like `TRES` use commas internally instead).
fn parse_kv_line(line: &str) -> HashMap<String, String> {
    line.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Parses a suffixed memory value (`640000M`, `64G`, `2T`) into megabytes.
/// A bare number with no suffix is assumed to already be megabytes.
fn parse_mem_to_mb(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, suffix) = match raw.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&raw[..raw.len() - 1], c.to_ascii_uppercase()),
        _ => (raw, 'M'),
    };
    let value: u64 = digits.parse().ok()?;
    Some(match suffix {
        'K' => value / 1024,
        'M' => value,
        'G' => value * 1024,
        'T' => value * 1024 * 1024,
        _ => value,
    })
}

fn parse_tres_field<'a>(tres: &'a str, field: &str) -> Option<&'a str> {
    tres.split(',').find_map(|pair| pair.split_once('=').filter(|(k, _)| *k == field).map(|(_, v)| v))
}

/// Parses a `gpu:TYPE:COUNT` gres token, as returned by `sinfo -O
/// 'partition,gres' -h` for GPU partitions.
pub fn parse_gres(raw: &str) -> Option<(String, u32)> {
    let mut parts = raw.trim().split(':');
    let kind = parts.next()?;
    if kind != "gpu" {
        return None;
    }
    let gpu_type = parts.next()?.to_string();
    let count: u32 = parts.next()?.parse().ok()?;
    Some((gpu_type, count))
}

/// Parses one `scontrol show partition -o` line into `PartitionLimits`,
/// following the rules in SPEC_FULL.md §4.D verbatim.
pub fn parse_partition_line(cluster: &str, line: &str, now: chrono::DateTime<Utc>) -> Option<PartitionLimits> {
    let fields = parse_kv_line(line);
    let name = fields.get("PartitionName")?.clone();

    let total_cpus: u32 = fields.get("TotalCPUs").and_then(|v| v.parse().ok()).unwrap_or(0);
    let total_nodes: u32 = fields.get("TotalNodes").and_then(|v| v.parse().ok()).unwrap_or(0);
    let total_mem_mb: u64 = fields
        .get("TRES")
        .and_then(|tres| parse_tres_field(tres, "mem"))
        .and_then(parse_mem_to_mb)
        .unwrap_or(0);

    let is_default = fields.get("Default").map(|v| v == "YES").unwrap_or(false);

    let max_cpus = match fields.get("MaxCPUsPerNode").map(|s| s.as_str()) {
        Some("UNLIMITED") => {
            if total_nodes > 0 {
                Some(total_cpus / total_nodes)
            } else {
                None
            }
        }
        Some(other) => other.parse().ok(),
        None => None,
    };

    let max_mem_mb = match fields.get("MaxMemPerNode").map(|s| s.as_str()) {
        Some("UNLIMITED") => {
            if total_nodes > 0 {
                Some(total_mem_mb / total_nodes as u64)
            } else {
                None
            }
        }
        Some(other) => parse_mem_to_mb(other),
        None => None,
    };

    let max_time = fields.get("MaxTime").map(|v| if v == "UNLIMITED" { UNLIMITED_MAX_TIME.to_string() } else { v.clone() });
    let default_time = fields.get("DefaultTime").cloned();

    let allow_accounts = fields.get("AllowAccounts").map(|s| s.as_str());
    let deny_accounts = fields.get("DenyAccounts").map(|s| s.as_str()).filter(|s| !s.is_empty());
    let (restricted, restriction_reason) = match (allow_accounts, deny_accounts) {
        (Some(allow), _) if allow != "ALL" => (true, Some(format!("restricted to accounts: {allow}"))),
        (_, Some(deny)) => (true, Some(format!("denied accounts: {deny}"))),
        _ => (false, None),
    };

    Some(PartitionLimits {
        cluster: cluster.to_string(),
        name,
        is_default,
        max_cpus,
        max_mem_mb,
        max_time,
        default_time,
        total_cpus,
        total_nodes,
        total_mem_mb,
        gpu_count: None,
        gpu_type: None,
        restricted,
        restriction_reason,
        updated_at: now,
    })
}

/// In-memory table of parsed partition limits, keyed by `(cluster,
/// partition)` exactly as the persistent store's composite primary key.
pub struct PartitionStore {
    entries: RwLock<HashMap<(String, String), PartitionLimits>>,
    last_updated: RwLock<HashMap<String, chrono::DateTime<Utc>>>,
}

impl PartitionStore {
    pub fn new() -> PartitionStore {
        PartitionStore { entries: RwLock::new(HashMap::new()), last_updated: RwLock::new(HashMap::new()) }
    }

    pub async fn upsert(&self, cluster: &str, name: &str, limits: PartitionLimits) {
        self.entries.write().await.insert((cluster.to_string(), name.to_string()), limits);
        self.last_updated.write().await.insert(cluster.to_string(), Utc::now());
    }

    pub async fn get(&self, cluster: &str, name: &str) -> Option<PartitionLimits> {
        self.entries.read().await.get(&(cluster.to_string(), name.to_string())).cloned()
    }

    pub async fn list_for_cluster(&self, cluster: &str) -> Vec<PartitionLimits> {
        self.entries.read().await.values().filter(|p| p.cluster == cluster).cloned().collect()
    }

    pub async fn list_all(&self) -> Vec<PartitionLimits> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Removes every partition for `cluster` whose name is not in
    /// `keep_set`. Called after a successful refresh with the observed
    /// partition names so partitions SLURM no longer reports disappear.
    pub async fn delete_stale(&self, cluster: &str, keep_set: &[String]) {
        let mut entries = self.entries.write().await;
        entries.retain(|(entry_cluster, name), _| entry_cluster != cluster || keep_set.contains(name));
    }

    pub async fn last_updated(&self, cluster: Option<&str>) -> Option<chrono::DateTime<Utc>> {
        let last_updated = self.last_updated.read().await;
        match cluster {
            Some(cluster) => last_updated.get(cluster).copied(),
            None => last_updated.values().copied().max(),
        }
    }

    pub async fn default_partition(&self, cluster: &str) -> Option<PartitionLimits> {
        self.entries.read().await.values().find(|p| p.cluster == cluster && p.is_default).cloned()
    }
}

impl Default for PartitionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Refreshes a `PartitionStore` from a cluster's SLURM commands. Takes a
/// minimal `SshExec` rather than the whole broker, per DESIGN NOTES'
/// cycle-avoidance guidance.
pub struct PartitionRefresher {
    ssh: Arc<dyn SshExec>,
    store: Arc<PartitionStore>,
}

impl PartitionRefresher {
    pub fn new(ssh: Arc<dyn SshExec>, store: Arc<PartitionStore>) -> PartitionRefresher {
        PartitionRefresher { ssh, store }
    }

    /// A refresh failure leaves existing rows in place — callers only log.
    pub async fn refresh(&self, cluster: &str) -> Result<(), BrokerError> {
        let output = self.ssh.run(cluster, "scontrol show partition -o", COMMAND_TIMEOUT).await?;
        let now = Utc::now();

        let mut parsed: Vec<PartitionLimits> = output.lines().filter_map(|line| parse_partition_line(cluster, line, now)).collect();

        let gpu_partitions: Vec<usize> = parsed.iter().enumerate().filter(|(_, p)| p.name.contains("gpu")).map(|(i, _)| i).collect();
        if !gpu_partitions.is_empty() {
            if let Ok(gres_output) = self.ssh.run(cluster, "sinfo -O 'partition,gres' -h", COMMAND_TIMEOUT).await {
                let gres_by_partition = parse_gres_output(&gres_output);
                for idx in gpu_partitions {
                    if let Some((gpu_type, count)) = gres_by_partition.get(&parsed[idx].name) {
                        parsed[idx].gpu_type = Some(gpu_type.clone());
                        parsed[idx].gpu_count = Some(*count);
                    }
                }
            }
        }

        let keep_set: Vec<String> = parsed.iter().map(|p| p.name.clone()).collect();
        for partition in parsed {
            self.store.upsert(cluster, &partition.name.clone(), partition).await;
        }
        self.store.delete_stale(cluster, &keep_set).await;
        Ok(())
    }
}

/// `sinfo -O 'partition,gres' -h` output: one `PARTITION GRES` pair per
/// line, partition names padded with trailing `*` for the default.
fn parse_gres_output(output: &str) -> HashMap<String, (String, u32)> {
    let mut by_partition = HashMap::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(partition) = fields.next() else { continue };
        let Some(gres) = fields.next() else { continue };
        if let Some(parsed) = parse_gres(gres) {
            by_partition.insert(partition.trim_end_matches('*').to_string(), parsed);
        }
    }
    by_partition
}

#[allow(dead_code)]
pub const REFRESH_COOLDOWN: Duration = Duration::from_secs(0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::FakeSsh;

    #[test]
    fn parses_unlimited_with_nonzero_nodes() {
        let line = "PartitionName=compute Default=YES MaxTime=UNLIMITED MaxCPUsPerNode=UNLIMITED MaxMemPerNode=UNLIMITED TotalCPUs=440 TotalNodes=10 TRES=cpu=440,mem=640000M,node=10 AllowAccounts=ALL";
        let parsed = parse_partition_line("gemini", line, Utc::now()).unwrap();
        assert!(parsed.is_default);
        assert_eq!(parsed.max_time.as_deref(), Some(UNLIMITED_MAX_TIME));
        assert_eq!(parsed.max_cpus, Some(44));
        assert_eq!(parsed.max_mem_mb, Some(64_000));
        assert!(!parsed.restricted);
    }

    #[test]
    fn unlimited_with_zero_nodes_yields_none_not_divide_by_zero() {
        let line = "PartitionName=empty MaxCPUsPerNode=UNLIMITED MaxMemPerNode=UNLIMITED TotalCPUs=0 TotalNodes=0";
        let parsed = parse_partition_line("gemini", line, Utc::now()).unwrap();
        assert_eq!(parsed.max_cpus, None);
        assert_eq!(parsed.max_mem_mb, None);
    }

    #[test]
    fn restricted_via_allow_accounts() {
        let line = "PartitionName=priority AllowAccounts=pi-smith,pi-jones TotalCPUs=10 TotalNodes=1";
        let parsed = parse_partition_line("gemini", line, Utc::now()).unwrap();
        assert!(parsed.restricted);
        assert!(parsed.restriction_reason.unwrap().contains("pi-smith"));
    }

    #[test]
    fn restricted_via_deny_accounts() {
        let line = "PartitionName=shared DenyAccounts=pi-banned AllowAccounts=ALL TotalCPUs=10 TotalNodes=1";
        let parsed = parse_partition_line("gemini", line, Utc::now()).unwrap();
        assert!(parsed.restricted);
    }

    #[test]
    fn parse_is_idempotent_through_reserialization() {
        let line = "PartitionName=compute Default=YES MaxTime=04:00:00 MaxCPUsPerNode=16 MaxMemPerNode=64000M TotalCPUs=440 TotalNodes=10 TRES=cpu=440,mem=640000M,node=10 AllowAccounts=ALL";
        let first = parse_partition_line("gemini", line, Utc::now()).unwrap();
        let reserialized = format!(
            "PartitionName={} Default={} MaxTime={} MaxCPUsPerNode={} MaxMemPerNode={}M TotalCPUs={} TotalNodes={} TRES=cpu={},mem={}M,node={} AllowAccounts=ALL",
            first.name,
            if first.is_default { "YES" } else { "NO" },
            first.max_time.as_deref().unwrap(),
            first.max_cpus.unwrap(),
            first.max_mem_mb.unwrap(),
            first.total_cpus,
            first.total_nodes,
            first.total_cpus,
            first.total_mem_mb,
            first.total_nodes,
        );
        let second = parse_partition_line("gemini", &reserialized, Utc::now()).unwrap();
        assert_eq!(first.max_cpus, second.max_cpus);
        assert_eq!(first.max_mem_mb, second.max_mem_mb);
        assert_eq!(first.is_default, second.is_default);
    }

    #[test]
    fn parses_gres_token() {
        assert_eq!(parse_gres("gpu:a100:2"), Some(("a100".to_string(), 2)));
        assert_eq!(parse_gres("not-gpu"), None);
    }

    #[tokio::test]
    async fn refresh_attaches_gpu_info_and_drops_stale_partitions() {
        let fake = Arc::new(FakeSsh::new());
        fake.respond(
            "gemini",
            "scontrol show partition -o",
            "PartitionName=gpu Default=NO MaxTime=1-00:00:00 MaxCPUsPerNode=32 MaxMemPerNode=128000M TotalCPUs=64 TotalNodes=2 TRES=cpu=64,mem=256000M,node=2 AllowAccounts=ALL",
        );
        fake.respond("gemini", "sinfo -O 'partition,gres' -h", "gpu*    gpu:a100:4\n");

        let store = Arc::new(PartitionStore::new());
        store
            .upsert(
                "gemini",
                "stale",
                PartitionLimits {
                    cluster: "gemini".to_string(),
                    name: "stale".to_string(),
                    is_default: false,
                    max_cpus: None,
                    max_mem_mb: None,
                    max_time: None,
                    default_time: None,
                    total_cpus: 0,
                    total_nodes: 0,
                    total_mem_mb: 0,
                    gpu_count: None,
                    gpu_type: None,
                    restricted: false,
                    restriction_reason: None,
                    updated_at: Utc::now(),
                },
            )
            .await;

        let refresher = PartitionRefresher::new(fake.clone(), store.clone());
        refresher.refresh("gemini").await.unwrap();

        let listed = store.list_for_cluster("gemini").await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "gpu");
        assert_eq!(listed[0].gpu_type.as_deref(), Some("a100"));
        assert_eq!(listed[0].gpu_count, Some(4));
    }

    #[tokio::test]
    async fn refresh_failure_leaves_existing_rows() {
        let fake = Arc::new(FakeSsh::new());
        fake.fail("gemini", "scontrol show partition -o", "connection refused");
        let store = Arc::new(PartitionStore::new());
        store
            .upsert(
                "gemini",
                "compute",
                PartitionLimits {
                    cluster: "gemini".to_string(),
                    name: "compute".to_string(),
                    is_default: true,
                    max_cpus: Some(44),
                    max_mem_mb: Some(64_000),
                    max_time: None,
                    default_time: None,
                    total_cpus: 440,
                    total_nodes: 10,
                    total_mem_mb: 640_000,
                    gpu_count: None,
                    gpu_type: None,
                    restricted: false,
                    restriction_reason: None,
                    updated_at: Utc::now(),
                },
            )
            .await;

        let refresher = PartitionRefresher::new(fake, store.clone());
        assert!(refresher.refresh("gemini").await.is_err());
        assert_eq!(store.list_for_cluster("gemini").await.len(), 1);
    }
}
