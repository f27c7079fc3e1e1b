//! Port allocation, reservations and the orphan sweep.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use berth_control_plane::engine::{Engine, EngineSettings};
use berth_control_plane::error::ErrorKind;
use berth_control_plane::model::{Node, PortOwner};
use berth_control_plane::ports::PortProbe;
use berth_control_plane::store::{HierarchyStore, NodeStore};
use berth_id::{AppId, NodeId};
use berth_networking::PortRanges;
use chrono::{Duration, Utc};
use common::Harness;
use uuid::Uuid;

fn app_owner() -> PortOwner {
    PortOwner::Application(AppId::new())
}

#[tokio::test]
async fn allocates_in_order_then_exhausts() {
    let h = Harness::new();
    let node = h.node("8000-8002").await;
    let ports = &h.engine.ports;

    let mut got = Vec::new();
    for _ in 0..3 {
        got.push(ports.allocate(&node.id, app_owner()).await.unwrap());
    }
    assert_eq!(got, vec![8000, 8001, 8002]);

    let err = ports.allocate(&node.id, app_owner()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exhaustion);
}

#[tokio::test]
async fn released_port_is_reused_after_wrap() {
    let h = Harness::new();
    let node = h.node("8000-8002").await;
    let ports = &h.engine.ports;

    let first = AppId::new();
    assert_eq!(ports.allocate(&node.id, PortOwner::Application(first)).await.unwrap(), 8000);
    ports.allocate(&node.id, app_owner()).await.unwrap();
    ports.allocate(&node.id, app_owner()).await.unwrap();

    assert_eq!(ports.release_port(&first).await.unwrap(), 1);
    assert_eq!(ports.allocate(&node.id, app_owner()).await.unwrap(), 8000);
}

#[tokio::test]
async fn missing_node_or_ranges_is_rejected() {
    let h = Harness::new();
    let bare = h.node("").await;

    let err = h.engine.ports.allocate(&bare.id, app_owner()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let err = h.engine.ports.allocate(&NodeId::new(), app_owner()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn expired_reservations_are_reclaimed() {
    let h = Harness::new();
    let node = h.node("8000-8001").await;
    let ports = &h.engine.ports;
    let t0 = Utc::now();

    let reserved = ports
        .reserve_ports_at(&node.id, 2, Uuid::new_v4(), t0)
        .await
        .unwrap();
    assert_eq!(reserved, vec![8000, 8001]);

    let err = ports
        .allocate_at(&node.id, app_owner(), t0 + Duration::minutes(10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exhaustion);

    let port = ports
        .allocate_at(&node.id, app_owner(), t0 + Duration::minutes(31))
        .await
        .unwrap();
    assert_eq!(port, 8000);
}

#[tokio::test]
async fn reservation_is_all_or_nothing() {
    let h = Harness::new();
    let node = h.node("8000-8002").await;
    let ports = &h.engine.ports;
    ports.allocate(&node.id, app_owner()).await.unwrap();

    let reservation = Uuid::new_v4();
    let err = ports.reserve_ports(&node.id, 3, reservation).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exhaustion);
    assert!(ports.ports_for_reservation(reservation).await.unwrap().is_empty());

    let reserved = ports.reserve_ports(&node.id, 2, reservation).await.unwrap();
    assert_eq!(reserved.len(), 2);

    let err = ports.reserve_ports(&node.id, 0, Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[tokio::test]
async fn reservation_larger_than_the_node_is_refused() {
    let h = Harness::new();
    let node = h.node("8000-8002").await;
    let ports = &h.engine.ports;

    for count in [4, 65_536, usize::MAX] {
        let err = ports
            .reserve_ports(&node.id, count, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
    assert_eq!(ports.allocate(&node.id, app_owner()).await.unwrap(), 8000);

    let err = ports
        .reserve_ports(&NodeId::new(), 1, Uuid::new_v4())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn attached_reservation_becomes_permanent() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let env = h.environment_tree().await;
    let app = h.application(env, Some(node.id)).await;
    let ports = &h.engine.ports;

    let reservation = Uuid::new_v4();
    let reserved = ports.reserve_ports(&node.id, 2, reservation).await.unwrap();

    let attached = ports
        .attach_reservation(reservation, &node.id, &app.id)
        .await
        .unwrap();
    assert_eq!(attached, 2);
    assert_eq!(ports.ports_for_application(&app.id).await.unwrap(), reserved);
    assert!(ports.ports_for_reservation(reservation).await.unwrap().is_empty());

    // Well past the reservation TTL the rows are still held.
    let purged = ports.purge_orphans_at(Utc::now() + Duration::days(1)).await.unwrap();
    assert_eq!(purged, 0);
    assert_eq!(ports.ports_for_application(&app.id).await.unwrap(), reserved);
}

#[tokio::test]
async fn attach_only_moves_rows_on_the_given_node() {
    let h = Harness::new();
    let first = h.node("8000-8009").await;
    let second = h.node("9000-9009").await;
    let ports = &h.engine.ports;

    let reservation = Uuid::new_v4();
    ports.reserve_ports(&first.id, 1, reservation).await.unwrap();
    ports.reserve_ports(&second.id, 1, reservation).await.unwrap();

    let app = AppId::new();
    assert_eq!(ports.attach_reservation(reservation, &second.id, &app).await.unwrap(), 1);
    assert_eq!(ports.ports_for_application(&app).await.unwrap(), vec![9000]);
    assert_eq!(ports.ports_for_reservation(reservation).await.unwrap(), vec![8000]);
}

#[tokio::test]
async fn require_reserved_checks_the_count() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let ports = &h.engine.ports;

    let reservation = Uuid::new_v4();
    ports.reserve_ports(&node.id, 1, reservation).await.unwrap();

    let err = ports.require_reserved(reservation, &node.id, 2).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.to_string().contains("not enough reserved ports"));

    let held = ports.require_reserved(reservation, &node.id, 1).await.unwrap();
    assert_eq!(held, vec![8000]);

    assert_eq!(ports.release_reservation(reservation).await.unwrap(), 1);
    assert!(ports.require_reserved(reservation, &node.id, 1).await.is_err());
}

#[tokio::test]
async fn orphan_sweep_drops_rows_of_deleted_owners() {
    let h = Harness::new();
    let node = h.node("8000-8009").await;
    let other = h.node("9000-9009").await;
    let env = h.environment_tree().await;
    let kept = h.application(env, Some(node.id)).await;
    let deleted = h.application(env, Some(node.id)).await;
    let ports = &h.engine.ports;

    ports.allocate(&node.id, PortOwner::Application(kept.id)).await.unwrap();
    ports.allocate(&node.id, PortOwner::Application(deleted.id)).await.unwrap();
    ports.allocate(&other.id, PortOwner::Application(kept.id)).await.unwrap();

    assert!(h.store.delete_application(&deleted.id).await.unwrap());
    assert!(h.store.delete_node(&other.id).await.unwrap());

    assert_eq!(ports.purge_orphans().await.unwrap(), 2);
    assert_eq!(ports.ports_for_application(&kept.id).await.unwrap(), vec![8000]);
    assert!(ports.ports_for_application(&deleted.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_allocations_never_collide() {
    let h = Harness::new();
    let node = h.node("8000-8019").await;

    let attempts = (0..20).map(|_| {
        let ports = h.engine.ports.clone();
        let node_id = node.id;
        tokio::spawn(async move { ports.allocate(&node_id, app_owner()).await })
    });
    let results = futures_util::future::join_all(attempts).await;

    let got: BTreeSet<u16> = results
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    assert_eq!(got.len(), 20);
    assert_eq!(got.first(), Some(&8000));
    assert_eq!(got.last(), Some(&8019));
}

#[tokio::test]
async fn new_ranges_apply_to_later_allocations() {
    let h = Harness::new();
    let node = h.node("8000-8000").await;
    let ports = &h.engine.ports;
    assert_eq!(ports.allocate(&node.id, app_owner()).await.unwrap(), 8000);

    ports
        .set_port_ranges(&node.id, &PortRanges::parse_list("9000-9001").unwrap())
        .await
        .unwrap();
    assert_eq!(ports.allocate(&node.id, app_owner()).await.unwrap(), 9000);

    let err = ports
        .set_port_ranges(&NodeId::new(), &PortRanges::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

/// Reports fixed ports as bound; any other port errors.
struct FixedProbe {
    bound: Vec<u16>,
}

#[async_trait]
impl PortProbe for FixedProbe {
    async fn is_bound(&self, _node: &Node, port: u16) -> std::io::Result<bool> {
        if self.bound.contains(&port) {
            return Ok(true);
        }
        if port == 8002 {
            return Err(std::io::Error::other("probe timed out"));
        }
        Ok(false)
    }
}

#[tokio::test]
async fn probe_vetoes_ports_bound_outside_the_platform() {
    let h = Harness::new();
    let engine = Engine::with_probe(
        h.store.clone(),
        h.push.clone(),
        Arc::new(FixedProbe { bound: vec![8000] }),
        EngineSettings::default(),
    );
    let node = h.node("8000-8002").await;

    assert_eq!(engine.ports.allocate(&node.id, app_owner()).await.unwrap(), 8001);
    // A failing probe keeps the port.
    assert_eq!(engine.ports.allocate(&node.id, app_owner()).await.unwrap(), 8002);

    let err = engine.ports.allocate(&node.id, app_owner()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Exhaustion);
}
