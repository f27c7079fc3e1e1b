//! Per-node host port allocation.
//!
//! Allocation takes no lock. Each candidate port is claimed with a single
//! insert guarded by the `(node_id, port)` uniqueness constraint; losing the
//! race just moves on to the next candidate. Candidates are swept from a
//! rolling per-node cursor so consecutive allocations walk forward through
//! the ranges instead of hammering the lowest free ports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_id::{AppId, NodeId};
use berth_networking::PortRanges;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::DbError;
use crate::error::ErrorKind;
use crate::model::{Node, PortAllocation, PortOwner};
use crate::store::{NodeStore, PortStore};

/// Reservation TTL when none is configured.
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum PortError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("node {0} has no port ranges configured")]
    NoPortRanges(NodeId),

    #[error("no available ports on node {0}")]
    Exhausted(NodeId),

    #[error("not enough reserved ports: need {needed}, have {reserved}")]
    NotEnoughReserved { needed: usize, reserved: usize },

    #[error("port count must be at least 1")]
    InvalidCount,

    #[error("cannot reserve {requested} ports: node {node_id} has {capacity}")]
    CountExceedsCapacity {
        node_id: NodeId,
        requested: usize,
        capacity: usize,
    },

    #[error(transparent)]
    Db(#[from] DbError),
}

impl PortError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NodeNotFound(_) => ErrorKind::NotFound,
            Self::NoPortRanges(_) | Self::InvalidCount | Self::CountExceedsCapacity { .. } => {
                ErrorKind::Configuration
            }
            Self::Exhausted(_) => ErrorKind::Exhaustion,
            Self::NotEnoughReserved { .. } => ErrorKind::Precondition,
            Self::Db(_) => ErrorKind::Internal,
        }
    }
}

/// Liveness check for ports bound outside the platform's knowledge, such as
/// by an unrelated container on the node.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// `Ok(true)` vetoes the port.
    async fn is_bound(&self, node: &Node, port: u16) -> std::io::Result<bool>;
}

#[derive(Clone)]
pub struct PortAllocator {
    nodes: Arc<dyn NodeStore>,
    ports: Arc<dyn PortStore>,
    probe: Option<Arc<dyn PortProbe>>,
    reservation_ttl: chrono::Duration,
}

impl PortAllocator {
    pub fn new(
        nodes: Arc<dyn NodeStore>,
        ports: Arc<dyn PortStore>,
        reservation_ttl: Duration,
    ) -> Self {
        let reservation_ttl = chrono::Duration::from_std(reservation_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        Self {
            nodes,
            ports,
            probe: None,
            reservation_ttl,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub async fn allocate(&self, node_id: &NodeId, owner: PortOwner) -> Result<u16, PortError> {
        self.allocate_at(node_id, owner, Utc::now()).await
    }

    /// Claims one free port on the node for `owner`.
    ///
    /// Expired reservations on the node are purged first. Reservation rows
    /// expire after the configured TTL; application rows never expire.
    #[instrument(skip(self), fields(node_id = %node_id))]
    pub async fn allocate_at(
        &self,
        node_id: &NodeId,
        owner: PortOwner,
        now: DateTime<Utc>,
    ) -> Result<u16, PortError> {
        let node = self
            .nodes
            .get_node(node_id)
            .await?
            .ok_or(PortError::NodeNotFound(*node_id))?;
        if node.port_ranges.is_empty() {
            return Err(PortError::NoPortRanges(*node_id));
        }

        let purged = self.ports.purge_expired(node_id, now).await?;
        if purged > 0 {
            debug!(purged, "Purged expired port reservations");
        }

        let expires_at = match owner {
            PortOwner::Reservation(_) => Some(now + self.reservation_ttl),
            PortOwner::Application(_) => None,
        };

        for port in node.port_ranges.candidates(node.port_cursor) {
            let row = PortAllocation {
                node_id: *node_id,
                port,
                owner,
                expires_at,
                created_at: now,
            };
            if !self.ports.try_insert_port(&row).await? {
                continue;
            }

            if let Some(probe) = &self.probe {
                match probe.is_bound(&node, port).await {
                    Ok(true) => {
                        warn!(port, "Port already bound on node, skipping");
                        self.ports.delete_port(node_id, port).await?;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(port, error = %e, "Port probe failed, keeping allocation"),
                }
            }

            self.nodes
                .set_port_cursor(node_id, node.port_ranges.next_cursor(port))
                .await?;
            debug!(port, "Port allocated");
            return Ok(port);
        }

        warn!("No available ports on node");
        Err(PortError::Exhausted(*node_id))
    }

    pub async fn reserve_ports(
        &self,
        node_id: &NodeId,
        count: usize,
        reservation: Uuid,
    ) -> Result<Vec<u16>, PortError> {
        self.reserve_ports_at(node_id, count, reservation, Utc::now())
            .await
    }

    /// Reserves `count` ports under one reservation, all or nothing.
    /// `count` may not exceed the node's total range size.
    #[instrument(skip(self), fields(node_id = %node_id, reservation = %reservation))]
    pub async fn reserve_ports_at(
        &self,
        node_id: &NodeId,
        count: usize,
        reservation: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<u16>, PortError> {
        if count == 0 {
            return Err(PortError::InvalidCount);
        }
        let node = self
            .nodes
            .get_node(node_id)
            .await?
            .ok_or(PortError::NodeNotFound(*node_id))?;
        let capacity = node.port_ranges.len();
        if count > capacity {
            return Err(PortError::CountExceedsCapacity {
                node_id: *node_id,
                requested: count,
                capacity,
            });
        }

        let mut reserved = Vec::with_capacity(count);
        for _ in 0..count {
            match self
                .allocate_at(node_id, PortOwner::Reservation(reservation), now)
                .await
            {
                Ok(port) => reserved.push(port),
                Err(e) => {
                    for port in &reserved {
                        if let Err(cleanup) = self.ports.delete_port(node_id, *port).await {
                            warn!(port, error = %cleanup, "Failed to roll back partial reservation");
                        }
                    }
                    return Err(e);
                }
            }
        }
        info!(ports = ?reserved, "Ports reserved");
        Ok(reserved)
    }

    /// Converts a reservation on one node into a permanent binding.
    #[instrument(skip(self), fields(node_id = %node_id, app_id = %application))]
    pub async fn attach_reservation(
        &self,
        reservation: Uuid,
        node_id: &NodeId,
        application: &AppId,
    ) -> Result<u64, PortError> {
        let attached = self
            .ports
            .attach_reservation(&reservation, node_id, application)
            .await?;
        info!(attached, "Reservation attached to application");
        Ok(attached)
    }

    /// Fails unless the reservation holds at least `needed` ports on the node.
    pub async fn require_reserved(
        &self,
        reservation: Uuid,
        node_id: &NodeId,
        needed: usize,
    ) -> Result<Vec<u16>, PortError> {
        let ports: Vec<u16> = self
            .ports
            .ports_for_reservation(&reservation)
            .await?
            .into_iter()
            .filter(|row| row.node_id == *node_id)
            .map(|row| row.port)
            .collect();
        if ports.len() < needed {
            return Err(PortError::NotEnoughReserved {
                needed,
                reserved: ports.len(),
            });
        }
        Ok(ports)
    }

    pub async fn release_port(&self, application: &AppId) -> Result<u64, PortError> {
        let released = self.ports.release_application(application).await?;
        info!(app_id = %application, released, "Released application ports");
        Ok(released)
    }

    pub async fn release_reservation(&self, reservation: Uuid) -> Result<u64, PortError> {
        Ok(self.ports.release_reservation(&reservation).await?)
    }

    pub async fn ports_for_application(&self, application: &AppId) -> Result<Vec<u16>, PortError> {
        let mut ports: Vec<u16> = self
            .ports
            .ports_for_application(application)
            .await?
            .into_iter()
            .map(|row| row.port)
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }

    pub async fn ports_for_reservation(&self, reservation: Uuid) -> Result<Vec<u16>, PortError> {
        let mut ports: Vec<u16> = self
            .ports
            .ports_for_reservation(&reservation)
            .await?
            .into_iter()
            .map(|row| row.port)
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }

    /// Replaces the node's allowed ranges. Existing allocations are kept.
    #[instrument(skip(self, ranges), fields(node_id = %node_id, ranges = ranges.len()))]
    pub async fn set_port_ranges(
        &self,
        node_id: &NodeId,
        ranges: &PortRanges,
    ) -> Result<(), PortError> {
        if !self.nodes.set_port_ranges(node_id, ranges).await? {
            return Err(PortError::NodeNotFound(*node_id));
        }
        info!("Port ranges updated");
        Ok(())
    }

    pub async fn purge_orphans(&self) -> Result<u64, PortError> {
        self.purge_orphans_at(Utc::now()).await
    }

    /// Drops expired reservations and rows whose application or node is gone.
    pub async fn purge_orphans_at(&self, now: DateTime<Utc>) -> Result<u64, PortError> {
        Ok(self.ports.purge_orphans(now).await?)
    }
}
