//! Conflict queue persistence
//!
//! Append-only log of every processed sync operation and its outcome. Rows
//! are only ever inserted, moved `conflict -> resolved`, or purged once
//! they are old and settled.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;

use super::types::{
    ConflictData, ConflictRecord, EntityType, RecordStatus, ResolutionStrategy, TypeStats,
};
use crate::db::{format_timestamp, parse_timestamp};
use crate::error::Result;

/// Repository for the `sync_queue` table
pub struct ConflictQueue<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> ConflictQueue<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Record a processed operation
    pub async fn append(&mut self, record: &ConflictRecord) -> Result<()> {
        let data = serde_json::to_string(&record.data)?;
        let resolved_data = record
            .resolved_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, user_id, device_id, entity_type, entity_id, client_id, operation,
                client_version, server_version, data, status, conflict_resolution,
                resolved_data, batch_id, created_at, synced_at, resolved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.device_id)
        .bind(record.entity_type.as_str())
        .bind(&record.entity_id)
        .bind(&record.client_id)
        .bind(record.operation.as_str())
        .bind(record.client_version)
        .bind(record.server_version)
        .bind(&data)
        .bind(record.status.as_str())
        .bind(record.conflict_resolution.map(|s| s.as_str()))
        .bind(&resolved_data)
        .bind(&record.batch_id)
        .bind(format_timestamp(&record.created_at))
        .bind(format_timestamp(&record.synced_at))
        .bind(record.resolved_at.as_ref().map(format_timestamp))
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    /// Get a record belonging to `user_id`
    pub async fn get(&mut self, user_id: &str, id: &str) -> Result<Option<ConflictRecord>> {
        let row = sqlx::query_as::<_, RecordRow>(&format!(
            "SELECT {} FROM sync_queue WHERE id = ? AND user_id = ?",
            RECORD_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&mut *self.conn)
        .await?;

        row.map(RecordRow::into_record).transpose()
    }

    /// Move a record from `conflict` to `resolved`.
    ///
    /// Returns `false` if the record was not in `conflict` state, leaving it
    /// untouched.
    pub async fn mark_resolved(
        &mut self,
        id: &str,
        strategy: ResolutionStrategy,
        resolved_data: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let resolved_data = resolved_data.map(serde_json::to_string).transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE sync_queue
            SET status = 'resolved', conflict_resolution = ?, resolved_data = ?, resolved_at = ?
            WHERE id = ? AND status = 'conflict'
            "#,
        )
        .bind(strategy.as_str())
        .bind(&resolved_data)
        .bind(format_timestamp(&now))
        .bind(id)
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Unresolved conflicts of a user, oldest first, optionally for one device
    pub async fn list_conflicts(
        &mut self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Vec<ConflictRecord>> {
        let rows = sqlx::query_as::<_, RecordRow>(&format!(
            r#"
            SELECT {} FROM sync_queue
            WHERE user_id = ? AND status = 'conflict' AND (? IS NULL OR device_id = ?)
            ORDER BY created_at ASC, id ASC
            "#,
            RECORD_COLUMNS
        ))
        .bind(user_id)
        .bind(device_id)
        .bind(device_id)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Count unresolved conflicts, optionally for one device
    pub async fn count_conflicts(&mut self, user_id: &str, device_id: Option<&str>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM sync_queue
            WHERE user_id = ? AND status = 'conflict' AND (? IS NULL OR device_id = ?)
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .bind(device_id)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(count)
    }

    /// Most recent processing time for a device
    pub async fn last_sync(&mut self, user_id: &str, device_id: &str) -> Result<Option<DateTime<Utc>>> {
        let (last,): (Option<String>,) = sqlx::query_as(
            "SELECT MAX(synced_at) FROM sync_queue WHERE user_id = ? AND device_id = ?",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_one(&mut *self.conn)
        .await?;

        last.as_deref().map(parse_timestamp).transpose()
    }

    /// Record counts per entity type and status for a device
    pub async fn stats_by_type(
        &mut self,
        user_id: &str,
        device_id: &str,
    ) -> Result<BTreeMap<EntityType, TypeStats>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT entity_type, status, COUNT(*)
            FROM sync_queue
            WHERE user_id = ? AND device_id = ?
            GROUP BY entity_type, status
            "#,
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_all(&mut *self.conn)
        .await?;

        let mut stats: BTreeMap<EntityType, TypeStats> = EntityType::ALL
            .iter()
            .map(|t| (*t, TypeStats::default()))
            .collect();

        for (entity_type, status, count) in rows {
            let entity_type: EntityType = entity_type.parse()?;
            let entry = stats.entry(entity_type).or_default();
            match status.parse::<RecordStatus>()? {
                RecordStatus::Completed => entry.completed = count,
                RecordStatus::Conflict => entry.conflict = count,
                RecordStatus::Resolved => entry.resolved = count,
            }
        }

        Ok(stats)
    }

    /// Delete settled records synced before `older_than`. Open conflicts are kept.
    pub async fn purge_settled(&mut self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM sync_queue WHERE status IN ('completed', 'resolved') AND synced_at < ?",
        )
        .bind(format_timestamp(&older_than))
        .execute(&mut *self.conn)
        .await?;

        Ok(result.rows_affected())
    }
}

const RECORD_COLUMNS: &str = "id, user_id, device_id, entity_type, entity_id, client_id, operation, \
     client_version, server_version, data, status, conflict_resolution, resolved_data, batch_id, \
     created_at, synced_at, resolved_at";

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: String,
    user_id: String,
    device_id: String,
    entity_type: String,
    entity_id: String,
    client_id: String,
    operation: String,
    client_version: i64,
    server_version: i64,
    data: String,
    status: String,
    conflict_resolution: Option<String>,
    resolved_data: Option<String>,
    batch_id: Option<String>,
    created_at: String,
    synced_at: String,
    resolved_at: Option<String>,
}

impl RecordRow {
    fn into_record(self) -> Result<ConflictRecord> {
        let data: ConflictData = serde_json::from_str(&self.data)?;
        let resolved_data = self
            .resolved_data
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(ConflictRecord {
            id: self.id,
            user_id: self.user_id,
            device_id: self.device_id,
            entity_type: self.entity_type.parse()?,
            entity_id: self.entity_id,
            client_id: self.client_id,
            operation: self.operation.parse()?,
            client_version: self.client_version,
            server_version: self.server_version,
            data,
            status: self.status.parse()?,
            conflict_resolution: self
                .conflict_resolution
                .as_deref()
                .map(str::parse)
                .transpose()?,
            resolved_data,
            batch_id: self.batch_id,
            created_at: parse_timestamp(&self.created_at)?,
            synced_at: parse_timestamp(&self.synced_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}
