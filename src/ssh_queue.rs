use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::BrokerError;

/// Serialises SSH operations per cluster: one in-flight call per cluster,
/// different clusters run in parallel. `enqueue` hands back the original
/// (still-rejectable) result to its caller — a failing operation never
/// poisons the queue for the next caller on the same cluster, per
/// DESIGN.md's Open Question #1 resolution.
///
/// Implemented as a per-cluster `tokio::sync::Mutex<()>` permit rather than
/// a stored chained future: `tokio::sync::Mutex` is FIFO, so this gives the
/// same strict-per-cluster ordering without needing futures to be
/// `Clone`/storable.
pub struct SshQueue {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SshQueue {
    pub fn new() -> SshQueue {
        SshQueue { locks: Mutex::new(HashMap::new()) }
    }

    async fn lock_for(&self, cluster: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(cluster.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub async fn enqueue<F, Fut, T>(&self, cluster: &str, op: F) -> Result<T, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let cluster_lock = self.lock_for(cluster).await;
        let _permit = cluster_lock.lock().await;
        op().await
    }
}

impl Default for SshQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_cluster_operations_never_overlap() {
        let queue = Arc::new(SshQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue("gemini", || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_observed.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<(), BrokerError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_clusters_run_concurrently() {
        let queue = Arc::new(SshQueue::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for cluster in ["gemini", "apollo", "orion"] {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let max_observed = max_observed.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .enqueue(cluster, || async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_observed.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<(), BrokerError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(max_observed.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn failure_does_not_poison_subsequent_operations() {
        let queue = SshQueue::new();
        let first: Result<(), BrokerError> = queue.enqueue("gemini", || async { Err(BrokerError::ssh("boom")) }).await;
        assert!(first.is_err());

        let second = queue.enqueue("gemini", || async { Ok::<_, BrokerError>(42) }).await;
        assert_eq!(second.unwrap(), 42);
    }
}
