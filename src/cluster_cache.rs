use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::model::ClusterHealth;

pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

pub struct CacheEntry {
    pub data: Option<ClusterHealth>,
    pub age: Duration,
    pub valid: bool,
}

/// TTL'd per-cluster snapshot of last-known health. A read-through hint
/// only — the health-of-record lives in SessionStore's history table; this
/// just avoids re-querying the cluster on every status request.
pub struct ClusterCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (ClusterHealth, Instant)>>,
}

impl ClusterCache {
    pub fn new() -> ClusterCache {
        ClusterCache { ttl: DEFAULT_TTL, entries: RwLock::new(HashMap::new()) }
    }

    pub fn with_ttl(ttl: Duration) -> ClusterCache {
        ClusterCache { ttl, entries: RwLock::new(HashMap::new()) }
    }

    pub async fn get(&self, cluster: &str) -> CacheEntry {
        let entries = self.entries.read().await;
        match entries.get(cluster) {
            None => CacheEntry { data: None, age: Duration::MAX, valid: false },
            Some((data, inserted_at)) => {
                let age = inserted_at.elapsed();
                CacheEntry { data: Some(data.clone()), age, valid: age < self.ttl }
            }
        }
    }

    pub async fn set(&self, cluster: &str, data: ClusterHealth) {
        self.entries.write().await.insert(cluster.to_string(), (data, Instant::now()));
    }

    /// `None` clears every cluster; `Some(cluster)` clears just that one.
    pub async fn invalidate(&self, cluster: Option<&str>) {
        let mut entries = self.entries.write().await;
        match cluster {
            None => entries.clear(),
            Some(cluster) => {
                entries.remove(cluster);
            }
        }
    }
}

impl Default for ClusterCache {
    fn default() -> Self {
        Self::new()
    }
}
