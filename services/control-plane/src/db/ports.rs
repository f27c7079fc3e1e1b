//! Port allocation table.
//!
//! `(node_id, port)` is unique. A losing insert surfaces as a violation of
//! that constraint and is reported as "taken", never as an error.

use async_trait::async_trait;
use berth_id::{AppId, NodeId};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::rows::PortRow;
use super::{DbError, PgStore};
use crate::model::{PortAllocation, PortOwner};
use crate::store::PortStore;

const UNIQUE_NODE_PORT: &str = "port_allocations_node_id_port_key";

const PORT_COLUMNS: &str =
    "node_id, port, application_id, reservation_uuid, expires_at, created_at";

impl PgStore {
    /// `filter` is a trusted SQL predicate on `$1`.
    async fn fetch_ports(&self, filter: &str, value: String) -> Result<Vec<PortAllocation>, DbError> {
        let sql = format!("SELECT {PORT_COLUMNS} FROM port_allocations WHERE {filter} ORDER BY port");
        let rows: Vec<PortRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::Query)?;
        rows.into_iter().map(PortAllocation::try_from).collect()
    }
}

#[async_trait]
impl PortStore for PgStore {
    async fn try_insert_port(&self, allocation: &PortAllocation) -> Result<bool, DbError> {
        let (application_id, reservation_uuid) = match allocation.owner {
            PortOwner::Application(app) => (Some(app.to_string()), None),
            PortOwner::Reservation(uuid) => (None, Some(uuid)),
        };

        let insert = sqlx::query(
            r#"
            INSERT INTO port_allocations (node_id, port, application_id, reservation_uuid, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(allocation.node_id.to_string())
        .bind(i32::from(allocation.port))
        .bind(application_id)
        .bind(reservation_uuid)
        .bind(allocation.expires_at)
        .bind(allocation.created_at)
        .execute(&self.pool)
        .await;

        match insert {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db_err))
                if db_err.constraint().unwrap_or_default() == UNIQUE_NODE_PORT =>
            {
                Ok(false)
            }
            Err(e) => Err(DbError::Query(e)),
        }
    }

    async fn delete_port(&self, node_id: &NodeId, port: u16) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM port_allocations WHERE node_id = $1 AND port = $2")
            .bind(node_id.to_string())
            .bind(i32::from(port))
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, node_id: &NodeId, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query(
            "DELETE FROM port_allocations WHERE node_id = $1 AND expires_at IS NOT NULL AND expires_at <= $2",
        )
        .bind(node_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }

    async fn attach_reservation(
        &self,
        reservation: &Uuid,
        node_id: &NodeId,
        application: &AppId,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE port_allocations
            SET application_id = $3, reservation_uuid = NULL, expires_at = NULL
            WHERE reservation_uuid = $1 AND node_id = $2
            "#,
        )
        .bind(*reservation)
        .bind(node_id.to_string())
        .bind(application.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }

    async fn release_application(&self, application: &AppId) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM port_allocations WHERE application_id = $1")
            .bind(application.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }

    async fn release_reservation(&self, reservation: &Uuid) -> Result<u64, DbError> {
        let result = sqlx::query("DELETE FROM port_allocations WHERE reservation_uuid = $1")
            .bind(*reservation)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }

    async fn ports_for_application(
        &self,
        application: &AppId,
    ) -> Result<Vec<PortAllocation>, DbError> {
        self.fetch_ports("application_id = $1", application.to_string())
            .await
    }

    async fn ports_for_reservation(
        &self,
        reservation: &Uuid,
    ) -> Result<Vec<PortAllocation>, DbError> {
        self.fetch_ports("reservation_uuid = $1::uuid", reservation.to_string())
            .await
    }

    async fn purge_orphans(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            DELETE FROM port_allocations pa
            WHERE (pa.expires_at IS NOT NULL AND pa.expires_at <= $1)
               OR NOT EXISTS (SELECT 1 FROM nodes n WHERE n.id = pa.node_id)
               OR (pa.application_id IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM applications a WHERE a.id = pa.application_id))
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(result.rows_affected())
    }
}
