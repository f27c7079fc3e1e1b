use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::ports::{PortAllocator, PortError};

#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    pub interval: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// Periodically reclaims expired reservations and port rows whose
/// application or node no longer exists.
pub struct CleanupWorker {
    ports: PortAllocator,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(ports: PortAllocator, config: CleanupWorkerConfig) -> Self {
        Self { ports, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting cleanup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cleanup().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_cleanup(&self) {
        match self.run_once().await {
            Ok(count) => {
                if count > 0 {
                    info!(deleted = count, "Purged orphaned port allocations");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to purge orphaned port allocations");
            }
        }
    }

    /// One sweep. Returns the number of rows removed.
    pub async fn run_once(&self) -> Result<u64, PortError> {
        self.ports.purge_orphans_at(Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use berth_id::{AppId, NodeId};
    use berth_networking::PortRanges;
    use uuid::Uuid;

    use crate::model::{Node, PortAllocation, PortOwner};
    use crate::store::{MemoryStore, NodeStore, PortStore};

    #[test]
    fn test_config_defaults() {
        let config = CleanupWorkerConfig::default();
        assert_eq!(config.interval.as_secs(), 300);
    }

    #[tokio::test]
    async fn test_sweep_removes_orphans_and_expired_rows() {
        let store = Arc::new(MemoryStore::new());
        let node = Node::new("n1", PortRanges::parse_list("8000-8010").unwrap());
        store.insert_node(&node).await.unwrap();

        let now = Utc::now();
        let rows = [
            (8000, PortOwner::Application(AppId::new()), None),
            (
                8001,
                PortOwner::Reservation(Uuid::new_v4()),
                Some(now - chrono::Duration::minutes(1)),
            ),
            (
                8002,
                PortOwner::Reservation(Uuid::new_v4()),
                Some(now + chrono::Duration::minutes(30)),
            ),
        ];
        for (port, owner, expires_at) in rows {
            let row = PortAllocation {
                node_id: node.id,
                port,
                owner,
                expires_at,
                created_at: now,
            };
            assert!(store.try_insert_port(&row).await.unwrap());
        }
        let gone_node = PortAllocation {
            node_id: NodeId::new(),
            port: 9000,
            owner: PortOwner::Reservation(Uuid::new_v4()),
            expires_at: None,
            created_at: now,
        };
        assert!(store.try_insert_port(&gone_node).await.unwrap());

        let ports = PortAllocator::new(store.clone(), store.clone(), Duration::from_secs(1800));
        let worker = CleanupWorker::new(ports, CleanupWorkerConfig::default());

        assert_eq!(worker.run_once().await.unwrap(), 3);
        assert_eq!(worker.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let ports = PortAllocator::new(store.clone(), store, Duration::from_secs(1800));
        let worker = CleanupWorker::new(
            ports,
            CleanupWorkerConfig {
                interval: Duration::from_millis(10),
            },
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
