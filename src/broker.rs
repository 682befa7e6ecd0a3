//! Constructor-injection wiring of every component in §4: the broker struct
//! holds an `Arc` of each and is built once at process start, mirroring the
//! teacher's `src/main.rs` `run_server` sequence (build clients/providers,
//! wire `AppState`, start background work) rather than module-scope
//! singletons, per spec.md §9's design note.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::cluster_cache::ClusterCache;
use crate::config::{BrokerConfig, ClustersConfig};
use crate::error::BrokerError;
use crate::health_poller::HealthPoller;
use crate::idle_reaper::IdleReaper;
use crate::job_poller::JobPoller;
use crate::model::SessionHistory;
use crate::partition::{PartitionRefresher, PartitionStore};
use crate::port::PortRegistry;
use crate::proxy::{port_forward, ProxyRegistry};
use crate::ssh::{RealSsh, SshExec};
use crate::ssh_queue::SshQueue;
use crate::state_manager::StateManager;
use crate::store::SqliteStore;
use crate::tunnel::{RealTunnelSpawner, TunnelManager};

/// Everything the rest of the process needs, held behind `Arc` so every
/// background loop and (eventually) every request handler can share it
/// without its own copy of the wiring.
pub struct Broker {
    pub config: BrokerConfig,
    pub clusters: ClustersConfig,
    pub ssh_queue: Arc<SshQueue>,
    pub ssh: Arc<dyn SshExec>,
    pub cluster_cache: Arc<ClusterCache>,
    pub partitions: Arc<PartitionStore>,
    pub ports: Arc<PortRegistry>,
    pub proxies: Arc<ProxyRegistry>,
    pub tunnels: Arc<TunnelManager>,
    pub state: Arc<StateManager>,
    pub job_poller: Arc<JobPoller>,
    pub health_poller: Arc<HealthPoller>,
    pub idle_reaper: Arc<IdleReaper>,
    pub store: Arc<SqliteStore>,
    handles: AsyncMutex<Vec<JoinHandle<()>>>,
}

/// `cluster -> login host` from `clusters.toml`, shared by `RealSsh` and
/// `RealTunnelSpawner` (the latter additionally prefixes the SSH user).
fn cluster_hosts(clusters: &ClustersConfig) -> HashMap<String, String> {
    clusters.clusters.iter().map(|(name, cfg)| (name.clone(), cfg.host.clone())).collect()
}

fn cluster_targets(clusters: &ClustersConfig, default_user: &str) -> HashMap<String, String> {
    clusters
        .clusters
        .iter()
        .map(|(name, cfg)| {
            let user = cfg.user.as_deref().unwrap_or(default_user);
            (name.clone(), format!("{user}@{}", cfg.host))
        })
        .collect()
}

impl Broker {
    /// Builds the full dependency graph but starts nothing: background
    /// loops and the startup reconcile only run from `start()`, so tests can
    /// construct a `Broker` and poke at individual components first.
    pub fn new(config: BrokerConfig, clusters: ClustersConfig, store: Arc<SqliteStore>) -> Arc<Broker> {
        let cluster_names: Vec<String> = clusters.names().into_iter().map(str::to_string).collect();
        let ssh_user = config.hpc_ssh_user.clone().unwrap_or_else(|| "hpcuser".to_string());

        let ssh: Arc<dyn SshExec> = Arc::new(RealSsh::new(cluster_hosts(&clusters), ssh_user.clone()));
        let ssh_queue = Arc::new(SshQueue::new());
        let cluster_cache = Arc::new(ClusterCache::new());
        let partitions = Arc::new(PartitionStore::new());
        let ports = Arc::new(PortRegistry::new());
        let port_forwards = port_forward::from_configured_ports(&config.additional_ports);
        let proxies = Arc::new(ProxyRegistry::new(ports.clone(), port_forwards));

        let tunnel_spawner = Arc::new(RealTunnelSpawner::new(cluster_targets(&clusters, &ssh_user)));
        let tunnels = Arc::new(TunnelManager::new(tunnel_spawner, ports.clone()));

        let state = Arc::new(StateManager::new(store.clone(), ssh_queue.clone(), ssh.clone(), cluster_names.clone()));

        let job_poller = Arc::new(JobPoller::new(state.clone(), ssh_queue.clone(), ssh.clone(), cluster_names.clone()));
        let health_poller =
            Arc::new(HealthPoller::new(ssh_queue.clone(), ssh.clone(), cluster_names.clone(), cluster_cache.clone(), store.clone(), partitions.clone()));
        let idle_reaper = Arc::new(IdleReaper::new(state.clone(), ssh_queue.clone(), ssh.clone(), config.session_idle_timeout_minutes));

        Arc::new(Broker {
            config,
            clusters,
            ssh_queue,
            ssh,
            cluster_cache,
            partitions,
            ports,
            proxies,
            tunnels,
            state,
            job_poller,
            health_poller,
            idle_reaper,
            store,
            handles: AsyncMutex::new(Vec::new()),
        })
    }

    /// Five things happen, in order: wire the cross-component callbacks
    /// (token lookup, activity, on-session-cleared teardown), load/reconcile
    /// `StateManager` (§4.F step 1-5), refresh every cluster's partition
    /// table once, then spawn the three background loops (G, H, J).
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.wire_callbacks().await;

        let legacy_path =
            self.config.enable_state_persistence.then(|| std::path::PathBuf::from(&self.config.state_file));
        self.state.load(legacy_path.as_deref()).await?;

        self.refresh_all_partitions().await;

        let mut handles = self.handles.lock().await;
        handles.push(tokio::spawn(self.job_poller.clone().run()));
        handles.push(tokio::spawn(self.health_poller.clone().run()));
        handles.push(tokio::spawn(self.idle_reaper.clone().run()));

        tracing::info!(clusters = ?self.clusters.names(), "broker started");
        Ok(())
    }

    async fn wire_callbacks(&self) {
        let sessions = self.state.sessions.clone();
        self.proxies.set_token_lookup(Arc::new(move |key| sessions.try_token_for(key))).await;

        let sessions = self.state.sessions.clone();
        self.proxies
            .set_activity_callback(Arc::new(move |key| {
                let sessions = sessions.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let _ = sessions.update(&key, |s| s.last_activity = Some(chrono::Utc::now().timestamp_millis())).await;
                });
            }))
            .await;

        let tunnels = self.tunnels.clone();
        let proxies = self.proxies.clone();
        self.state.set_on_session_cleared(Arc::new(move |history: SessionHistory| {
            let tunnels = tunnels.clone();
            let proxies = proxies.clone();
            tokio::spawn(async move {
                tunnels.handle_session_cleared(&history).await;
                proxies.destroy(&history.session_key).await;
            });
        }));
    }

    /// §4.D: run at start-up (and available on demand via the same method
    /// for an external caller, e.g. an admin-triggered refresh route).
    pub async fn refresh_all_partitions(&self) {
        let refresher = PartitionRefresher::new(self.ssh.clone(), self.partitions.clone());
        for cluster in self.clusters.names() {
            if let Err(err) = refresher.refresh(cluster).await {
                tracing::warn!(cluster = %cluster, error = %err, "partition refresh failed at startup, keeping existing rows");
            }
        }
    }

    /// Graceful shutdown order from spec.md §5: stop pollers, drain
    /// in-flight SSH queues (the per-cluster mutex permits are released as
    /// soon as in-flight `enqueue` calls return — nothing further to signal
    /// here), destroy proxies, close tunnels, flush the session store.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down: stopping background loops");
        self.job_poller.stop();
        self.health_poller.stop();
        self.idle_reaper.stop();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        drop(handles);

        self.proxies.destroy_all().await;

        for session in self.state.sessions.all().await {
            self.tunnels.teardown(&session.session_key).await;
        }

        // The sqlite store is write-through on every mutation (§9 design
        // note); nothing buffered needs an explicit flush beyond letting the
        // connection drop.
        tracing::info!("shutdown complete");
    }
}
