//! Node registry tables.

use async_trait::async_trait;
use berth_id::NodeId;
use berth_networking::PortRanges;
use chrono::{DateTime, Utc};

use super::rows::{NodeRow, PortRangeRow};
use super::{DbError, PgStore};
use crate::model::Node;
use crate::store::NodeStore;

impl PgStore {
    async fn replace_ranges(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: &NodeId,
        ranges: &PortRanges,
    ) -> Result<(), DbError> {
        sqlx::query("DELETE FROM node_port_ranges WHERE node_id = $1")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::Query)?;

        for range in ranges.ranges() {
            sqlx::query(
                "INSERT INTO node_port_ranges (node_id, start_port, end_port) VALUES ($1, $2, $3)",
            )
            .bind(id.to_string())
            .bind(i32::from(range.start()))
            .bind(i32::from(range.end()))
            .execute(&mut **tx)
            .await
            .map_err(DbError::Query)?;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeStore for PgStore {
    async fn insert_node(&self, node: &Node) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        sqlx::query(
            r#"
            INSERT INTO nodes (id, name, port_cursor, last_seen_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(node.id.to_string())
        .bind(&node.name)
        .bind(node.port_cursor.map(i32::from))
        .bind(node.last_seen_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        Self::replace_ranges(&mut tx, &node.id, &node.port_ranges).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, DbError> {
        let row: Option<NodeRow> = sqlx::query_as(
            "SELECT id, name, port_cursor, last_seen_at FROM nodes WHERE id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let ranges: Vec<PortRangeRow> = sqlx::query_as(
            "SELECT start_port, end_port FROM node_port_ranges WHERE node_id = $1 ORDER BY start_port",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.into_node(ranges).map(Some)
    }

    async fn delete_node(&self, id: &NodeId) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_port_ranges(&self, id: &NodeId, ranges: &PortRanges) -> Result<bool, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM nodes WHERE id = $1 FOR UPDATE")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        if exists.is_none() {
            return Ok(false);
        }

        Self::replace_ranges(&mut tx, id, ranges).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(true)
    }

    async fn set_port_cursor(&self, id: &NodeId, cursor: u16) -> Result<(), DbError> {
        sqlx::query("UPDATE nodes SET port_cursor = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(i32::from(cursor))
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    async fn touch_node(&self, id: &NodeId, now: DateTime<Utc>) -> Result<bool, DbError> {
        let result = sqlx::query("UPDATE nodes SET last_seen_at = $2 WHERE id = $1")
            .bind(id.to_string())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(result.rows_affected() > 0)
    }
}
