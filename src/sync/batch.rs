//! Batch session tracking for chunked transfers
//!
//! Large change sets arrive as numbered chunks sharing one batch id. Each
//! accepted chunk stays applied on its own; this module only keeps the
//! running totals and remembers which chunk numbers were already accepted,
//! so a re-delivered chunk is acknowledged without being applied twice.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::types::{BatchSession, BatchStatus};
use crate::db::{format_timestamp, parse_timestamp};
use crate::error::Result;

/// Repository for `sync_batches` and `sync_batch_parts`
pub struct BatchTracker<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> BatchTracker<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Entities accepted for a chunk that was already processed, if any
    pub async fn find_part(
        &mut self,
        user_id: &str,
        batch_id: &str,
        batch_number: i64,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT entities_count FROM sync_batch_parts
            WHERE user_id = ? AND batch_id = ? AND batch_number = ?
            "#,
        )
        .bind(user_id)
        .bind(batch_id)
        .bind(batch_number)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(row.map(|(count,)| count))
    }

    /// Get the session for a batch id
    pub async fn get_session(&mut self, user_id: &str, batch_id: &str) -> Result<Option<BatchSession>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT user_id, batch_id, batch_number, total_batches, entities_count,
                   status, created_at, updated_at
            FROM sync_batches
            WHERE user_id = ? AND batch_id = ?
            "#,
        )
        .bind(user_id)
        .bind(batch_id)
        .fetch_optional(&mut *self.conn)
        .await?;

        row.map(BatchRow::into_session).transpose()
    }

    /// Record an accepted chunk and fold it into the session.
    ///
    /// Creates the session on first sight of `batch_id`; afterwards adds to
    /// `entities_count`. The session becomes `completed` when the chunk
    /// numbered `total_batches` is seen, and stays completed.
    pub async fn record_part(
        &mut self,
        user_id: &str,
        batch_id: &str,
        batch_number: i64,
        total_batches: i64,
        entities_count: i64,
        now: DateTime<Utc>,
    ) -> Result<BatchSession> {
        let stamp = format_timestamp(&now);

        sqlx::query(
            r#"
            INSERT INTO sync_batch_parts (user_id, batch_id, batch_number, entities_count, processed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(batch_id)
        .bind(batch_number)
        .bind(entities_count)
        .bind(&stamp)
        .execute(&mut *self.conn)
        .await?;

        let status = if batch_number == total_batches {
            BatchStatus::Completed
        } else {
            BatchStatus::Processing
        };

        sqlx::query(
            r#"
            INSERT INTO sync_batches (
                user_id, batch_id, batch_number, total_batches, entities_count,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, batch_id) DO UPDATE SET
                batch_number = excluded.batch_number,
                entities_count = entities_count + excluded.entities_count,
                status = CASE WHEN excluded.status = 'completed' THEN 'completed' ELSE status END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(batch_id)
        .bind(batch_number)
        .bind(total_batches)
        .bind(entities_count)
        .bind(status.as_str())
        .bind(&stamp)
        .bind(&stamp)
        .execute(&mut *self.conn)
        .await?;

        tracing::debug!(
            batch_id = %batch_id,
            batch_number = batch_number,
            total_batches = total_batches,
            entities = entities_count,
            "Recorded batch part"
        );

        self.get_session(user_id, batch_id).await?.ok_or_else(|| {
            crate::error::AppError::Internal(format!("Batch session {} vanished", batch_id))
        })
    }
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    user_id: String,
    batch_id: String,
    batch_number: i64,
    total_batches: i64,
    entities_count: i64,
    status: String,
    created_at: String,
    updated_at: String,
}

impl BatchRow {
    fn into_session(self) -> Result<BatchSession> {
        Ok(BatchSession {
            batch_id: self.batch_id,
            user_id: self.user_id,
            batch_number: self.batch_number,
            total_batches: self.total_batches,
            entities_count: self.entities_count,
            status: self.status.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}
