//! Fixed-interval cluster health sampling: CPU/memory/node/GPU gauges, job
//! counts and fairshare, written through to `ClusterCache` and the sqlite
//! `cluster_health` table, with hourly-bucketed history downsampling.
//!
//! The exact SLURM command surface for health sampling isn't pinned by the
//! spec; the command set below follows `partition.rs`'s established
//! precedent of parsing `sinfo`/`squeue` delimited output rather than
//! reaching for a non-existent single all-in-one command. See DESIGN.md.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::cluster_cache::ClusterCache;
use crate::error::BrokerError;
use crate::model::{ClusterHealth, HealthHistoryEntry, NodeGauge, PartitionUsage, ResourceGauge};
use crate::partition::{parse_gres, PartitionStore};
use crate::ssh::{SshExec, COMMAND_TIMEOUT};
use crate::ssh_queue::SshQueue;
use crate::store::SqliteStore;

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30 * 60);
const ROLLOVER_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const ROLLOVER_MIN_GAP: Duration = Duration::from_secs(60 * 60);

const CPU_CMD: &str = "sinfo -h -o '%C'";
const NODE_STATE_CMD: &str = "sinfo -h -N -o '%t'";
const NODE_MEM_CMD: &str = "sinfo -h -N -o '%m,%e'";
const PARTITION_CPU_CMD: &str = "sinfo -h -o '%P,%C'";
const GPU_CONFIGURED_CMD: &str = "sinfo -h -o '%G'";
const GPU_ALLOC_CMD: &str = "squeue -h -t RUNNING -o '%b' 2>/dev/null || true";
const RUNNING_CMD: &str = "squeue -h -t RUNNING -r 2>/dev/null | wc -l";
const PENDING_CMD: &str = "squeue -h -t PENDING -r 2>/dev/null | wc -l";
const FAIRSHARE_CMD: &str = "sshare --noheader -o Fairshare -u $(whoami) 2>/dev/null || true";

fn parse_cpu_gauge(output: &str) -> Option<ResourceGauge> {
    let line = output.lines().next()?.trim();
    let parts: Vec<&str> = line.split('/').collect();
    if parts.len() != 4 {
        return None;
    }
    let alloc: f64 = parts[0].parse().ok()?;
    let total: f64 = parts[3].parse().ok()?;
    Some(ResourceGauge::new(alloc, total))
}

fn parse_node_gauge(output: &str) -> NodeGauge {
    let mut idle = 0.0;
    let mut busy = 0.0;
    let mut down = 0.0;
    let mut total = 0.0;

    for line in output.lines() {
        let state = line.trim().to_lowercase();
        if state.is_empty() {
            continue;
        }
        total += 1.0;
        if state.starts_with("down") || state.starts_with("drain") {
            down += 1.0;
        } else if state.starts_with("idle") {
            idle += 1.0;
        } else {
            busy += 1.0;
        }
    }

    NodeGauge { used: busy, total, percent: if total > 0.0 { (busy / total) * 100.0 } else { 0.0 }, idle, busy, down }
}

fn parse_memory_gauge(output: &str) -> Option<ResourceGauge> {
    let mut total_mb: u64 = 0;
    let mut free_mb: u64 = 0;
    let mut saw_any = false;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split(',');
        let total: u64 = parts.next()?.trim().parse().ok()?;
        let free: u64 = parts.next()?.trim().parse().ok()?;
        total_mb += total;
        free_mb += free;
        saw_any = true;
    }

    if !saw_any {
        return None;
    }
    let used = total_mb.saturating_sub(free_mb);
    Some(ResourceGauge::new(used as f64, total_mb as f64))
}

fn parse_partition_cpu_map(output: &str) -> HashMap<String, ResourceGauge> {
    let mut map = HashMap::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.splitn(2, ',');
        let Some(name) = parts.next() else { continue };
        let Some(cpu) = parts.next() else { continue };
        if let Some(gauge) = parse_cpu_gauge(cpu) {
            map.insert(name.trim_end_matches('*').to_string(), gauge);
        }
    }
    map
}

fn parse_gpu_configured_total(output: &str) -> u32 {
    output.lines().filter_map(parse_gres).map(|(_, count)| count).sum()
}

fn parse_tres_gpu_token(token: &str) -> Option<u32> {
    let token = token.trim();
    if token.is_empty() || token.eq_ignore_ascii_case("n/a") || token == "(null)" || !token.contains("gpu") {
        return None;
    }
    token.rsplit(':').next()?.parse().ok()
}

fn parse_gpu_allocated_total(output: &str) -> u32 {
    output.lines().flat_map(|line| line.split(',')).filter_map(parse_tres_gpu_token).sum()
}

fn parse_count(output: &str) -> u32 {
    output.lines().next().and_then(|line| line.trim().parse().ok()).unwrap_or(0)
}

fn parse_fairshare(output: &str) -> Option<f64> {
    output.lines().next().and_then(|line| line.trim().parse().ok())
}

/// Average CPU percent across every partition whose `gpu_type` matches, or
/// `None` if no such partition has usable cpu data.
fn average_cpu_percent_for_gpu_type(limits: &[crate::model::PartitionLimits], partition_cpu: &HashMap<String, ResourceGauge>, gpu_type: &str) -> Option<f64> {
    let matching: Vec<f64> = limits
        .iter()
        .filter(|p| p.gpu_type.as_deref() == Some(gpu_type))
        .filter_map(|p| partition_cpu.get(&p.name))
        .map(|g| g.percent)
        .collect();
    if matching.is_empty() {
        None
    } else {
        Some(matching.iter().sum::<f64>() / matching.len() as f64)
    }
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / 2.0
    }
}

fn median_opt(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let mut present: Vec<f64> = values.flatten().collect();
    if present.is_empty() {
        None
    } else {
        Some(median(&mut present))
    }
}

fn median_u32(values: impl Iterator<Item = u32>) -> u32 {
    let mut as_f64: Vec<f64> = values.map(|v| v as f64).collect();
    median(&mut as_f64).round() as u32
}

fn bucket_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H").to_string()
}

/// Collapses one hour-bucket's worth of entries to a single median row.
/// Timestamp is the middle entry's (by chronological order), not the
/// bucket boundary, so a reader can still tell roughly when within the
/// hour the samples fell.
fn downsample_bucket(entries: &[HealthHistoryEntry]) -> HealthHistoryEntry {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|e| e.timestamp);
    let mid_timestamp = sorted[sorted.len() / 2].timestamp;

    HealthHistoryEntry {
        timestamp: mid_timestamp,
        cpus_percent: median(&mut entries.iter().map(|e| e.cpus_percent).collect::<Vec<_>>()),
        memory_percent: median(&mut entries.iter().map(|e| e.memory_percent).collect::<Vec<_>>()),
        nodes_percent: median(&mut entries.iter().map(|e| e.nodes_percent).collect::<Vec<_>>()),
        gpus_percent: median(&mut entries.iter().map(|e| e.gpus_percent).collect::<Vec<_>>()),
        running_jobs: median_u32(entries.iter().map(|e| e.running_jobs)),
        pending_jobs: median_u32(entries.iter().map(|e| e.pending_jobs)),
        a100_cpus_percent: median_opt(entries.iter().map(|e| e.a100_cpus_percent)),
        v100_cpus_percent: median_opt(entries.iter().map(|e| e.v100_cpus_percent)),
        sample_count: Some(entries.len() as u32),
    }
}

/// Buckets every entry older than 24h by `YYYY-MM-DDTHH`, downsamples each
/// bucket to one median row, and leaves entries from the last 24h
/// untouched and at full resolution.
fn rollover_entries(entries: Vec<HealthHistoryEntry>, now: DateTime<Utc>) -> Vec<HealthHistoryEntry> {
    let cutoff = now - chrono::Duration::from_std(ROLLOVER_WINDOW).unwrap();
    let (old, recent): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.timestamp < cutoff);
    if old.is_empty() {
        return recent;
    }

    let mut buckets: BTreeMap<String, Vec<HealthHistoryEntry>> = BTreeMap::new();
    for entry in old {
        buckets.entry(bucket_key(entry.timestamp)).or_default().push(entry);
    }

    let mut result: Vec<HealthHistoryEntry> = buckets.into_values().map(|group| downsample_bucket(&group)).collect();
    result.extend(recent);
    result.sort_by_key(|e| e.timestamp);
    result
}

pub struct HealthPoller {
    ssh_queue: Arc<SshQueue>,
    ssh: Arc<dyn SshExec>,
    clusters: Vec<String>,
    cache: Arc<ClusterCache>,
    store: Arc<SqliteStore>,
    partitions: Arc<PartitionStore>,
    failures: Mutex<HashMap<String, u32>>,
    last_rollover: Mutex<HashMap<String, DateTime<Utc>>>,
    stopped: AtomicBool,
}

impl HealthPoller {
    pub fn new(ssh_queue: Arc<SshQueue>, ssh: Arc<dyn SshExec>, clusters: Vec<String>, cache: Arc<ClusterCache>, store: Arc<SqliteStore>, partitions: Arc<PartitionStore>) -> HealthPoller {
        HealthPoller {
            ssh_queue,
            ssh,
            clusters,
            cache,
            store,
            partitions,
            failures: Mutex::new(HashMap::new()),
            last_rollover: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub async fn run(self: Arc<Self>) {
        let mut sleep_for = self.initial_delay().await;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(sleep_for).await;
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            self.poll_all().await;
            sleep_for = HEALTH_INTERVAL;
        }
    }

    /// If every configured cluster already has a fresh, online cache entry,
    /// the first poll waits out the remaining TTL instead of re-sampling
    /// immediately on process restart.
    async fn initial_delay(&self) -> Duration {
        if self.clusters.is_empty() {
            return Duration::ZERO;
        }
        let mut max_remaining = Duration::ZERO;
        for cluster in &self.clusters {
            let entry = self.cache.get(cluster).await;
            let online = entry.data.as_ref().map(|d| d.online).unwrap_or(false);
            if !entry.valid || !online {
                return Duration::ZERO;
            }
            max_remaining = max_remaining.max(HEALTH_INTERVAL.saturating_sub(entry.age));
        }
        max_remaining
    }

    pub async fn poll_all(&self) {
        let futures = self.clusters.iter().map(|cluster| self.poll_cluster(cluster));
        futures::future::join_all(futures).await;
    }

    async fn poll_cluster(&self, cluster: &str) {
        match self.sample_cluster(cluster).await {
            Ok((health, basic_metrics_ok, a100, v100)) => {
                self.failures.lock().await.insert(cluster.to_string(), 0);
                self.cache.set(cluster, health.clone()).await;
                if let Err(err) = self.store.upsert_cluster_health(cluster, health.clone()).await {
                    tracing::warn!(cluster = %cluster, error = %err, "failed to persist cluster health snapshot");
                }

                if !basic_metrics_ok {
                    return;
                }

                let entry = HealthHistoryEntry {
                    timestamp: health.last_checked,
                    cpus_percent: health.cpus.percent,
                    memory_percent: health.memory.percent,
                    nodes_percent: health.nodes.percent,
                    gpus_percent: health.gpus.percent,
                    running_jobs: health.running_jobs,
                    pending_jobs: health.pending_jobs,
                    a100_cpus_percent: a100,
                    v100_cpus_percent: v100,
                    sample_count: None,
                };
                if let Err(err) = self.store.insert_health_history(cluster, &entry).await {
                    tracing::warn!(cluster = %cluster, error = %err, "failed to append health history entry");
                }
                if let Err(err) = self.maybe_rollover(cluster).await {
                    tracing::warn!(cluster = %cluster, error = %err, "health history rollover failed");
                }
            }
            Err(err) => {
                let mut failures = self.failures.lock().await;
                let count = failures.entry(cluster.to_string()).or_insert(0);
                *count += 1;
                let n = *count;
                drop(failures);

                let health = ClusterHealth::offline(err.to_string(), Utc::now(), n);
                self.cache.set(cluster, health.clone()).await;
                let _ = self.store.upsert_cluster_health(cluster, health).await;

                if n <= 4 {
                    tracing::warn!(cluster = %cluster, error = %err, consecutive_failures = n, "cluster health check failed");
                } else {
                    tracing::error!(cluster = %cluster, error = %err, consecutive_failures = n, "cluster health check failed");
                }
            }
        }
    }

    /// Returns the sampled health, whether every basic metric parsed
    /// (gating whether a history row should be appended), and the derived
    /// A100/V100 partition CPU percentages.
    async fn sample_cluster(&self, cluster: &str) -> Result<(ClusterHealth, bool, Option<f64>, Option<f64>), BrokerError> {
        let cluster_owned = cluster.to_string();
        let ssh = self.ssh.clone();
        let limits = self.partitions.list_for_cluster(cluster).await;

        self.ssh_queue
            .enqueue(cluster, move || async move {
                let cpu_out = ssh.run(&cluster_owned, CPU_CMD, COMMAND_TIMEOUT).await?;
                let node_state_out = ssh.run(&cluster_owned, NODE_STATE_CMD, COMMAND_TIMEOUT).await?;
                let node_mem_out = ssh.run(&cluster_owned, NODE_MEM_CMD, COMMAND_TIMEOUT).await?;
                let partition_cpu_out = ssh.run(&cluster_owned, PARTITION_CPU_CMD, COMMAND_TIMEOUT).await?;
                let gpu_conf_out = ssh.run(&cluster_owned, GPU_CONFIGURED_CMD, COMMAND_TIMEOUT).await?;
                let gpu_alloc_out = ssh.run(&cluster_owned, GPU_ALLOC_CMD, COMMAND_TIMEOUT).await?;
                let running_out = ssh.run(&cluster_owned, RUNNING_CMD, COMMAND_TIMEOUT).await?;
                let pending_out = ssh.run(&cluster_owned, PENDING_CMD, COMMAND_TIMEOUT).await?;
                let fairshare_out = ssh.run(&cluster_owned, FAIRSHARE_CMD, COMMAND_TIMEOUT).await?;

                let cpus = parse_cpu_gauge(&cpu_out);
                let memory = parse_memory_gauge(&node_mem_out);
                let basic_metrics_ok = cpus.is_some() && memory.is_some();

                let nodes = parse_node_gauge(&node_state_out);
                let partition_cpu = parse_partition_cpu_map(&partition_cpu_out);
                let gpu_total = parse_gpu_configured_total(&gpu_conf_out);
                let gpu_used = parse_gpu_allocated_total(&gpu_alloc_out);
                let gpus = ResourceGauge::new(gpu_used as f64, gpu_total as f64);
                let running_jobs = parse_count(&running_out);
                let pending_jobs = parse_count(&pending_out);
                let fairshare = parse_fairshare(&fairshare_out);

                let partitions = partition_cpu.iter().map(|(name, gauge)| (name.clone(), PartitionUsage { cpus: gauge.clone(), gpus: None })).collect();

                let a100 = average_cpu_percent_for_gpu_type(&limits, &partition_cpu, "a100");
                let v100 = average_cpu_percent_for_gpu_type(&limits, &partition_cpu, "v100");

                let health = ClusterHealth {
                    online: true,
                    cpus: cpus.unwrap_or_default(),
                    memory: memory.unwrap_or_default(),
                    nodes,
                    gpus,
                    partitions,
                    running_jobs,
                    pending_jobs,
                    fairshare,
                    last_checked: Utc::now(),
                    consecutive_failures: 0,
                    error: None,
                };

                Ok((health, basic_metrics_ok, a100, v100))
            })
            .await
    }

    async fn maybe_rollover(&self, cluster: &str) -> Result<(), BrokerError> {
        let now = Utc::now();
        {
            let mut last = self.last_rollover.lock().await;
            if let Some(prev) = last.get(cluster) {
                if now.signed_duration_since(*prev) < chrono::Duration::from_std(ROLLOVER_MIN_GAP).unwrap() {
                    return Ok(());
                }
            }
            last.insert(cluster.to_string(), now);
        }

        let entries = self.store.list_health_history(cluster).await?;
        let rolled = rollover_entries(entries, now);
        self.store.replace_health_history(cluster, rolled).await
    }
}
