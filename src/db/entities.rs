//! Versioned entity store
//!
//! Typed CRUD over the events, tasks, and documents tables. Every write is a
//! compare-and-set on the `version` column, and every statement carries the
//! caller's scope predicate so tenant isolation is checked on each access.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::{format_timestamp, parse_timestamp};
use crate::auth::Scope;
use crate::error::{AppError, Result};
use crate::sync::{EntityPayload, EntityType, SyncCursor, SyncEntity};

/// Visibility predicate; binds `user_id` then `tenant_id`
const SCOPE_PREDICATE: &str =
    "(owner_user_id = ? OR (tenant_id IS NOT NULL AND tenant_id = ?))";

/// Rows after a cursor in `(updated_at, id)` order; binds the timestamp
/// three times then the tie-breaking id. A `NULL` timestamp matches all rows.
const AFTER_CURSOR: &str =
    "(? IS NULL OR updated_at > ? OR (updated_at = ? AND id > ?))";

/// Store for the three syncable entity kinds.
///
/// Borrows a connection so callers can run several operations inside one
/// transaction.
pub struct EntityStore<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> EntityStore<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Insert a new entity owned by the scope's user. Version starts at 1.
    pub async fn create(
        &mut self,
        scope: &Scope,
        payload: &EntityPayload,
        now: DateTime<Utc>,
    ) -> Result<SyncEntity> {
        let entity_type = payload.entity_type();
        let id = Uuid::new_v4().to_string();
        let stamp = format_timestamp(&now);
        let raw = serde_json::to_string(payload)?;

        let sql = format!(
            r#"
            INSERT INTO {} (id, owner_user_id, tenant_id, title, payload, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            "#,
            entity_type.table()
        );

        sqlx::query(&sql)
            .bind(&id)
            .bind(&scope.user_id)
            .bind(&scope.tenant_id)
            .bind(payload.title())
            .bind(&raw)
            .bind(&stamp)
            .bind(&stamp)
            .execute(&mut *self.conn)
            .await?;

        Ok(SyncEntity {
            server_id: id,
            entity_type,
            owner_user_id: scope.user_id.clone(),
            tenant_id: scope.tenant_id.clone(),
            version: 1,
            payload: payload.clone(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a visible entity by id
    pub async fn find(
        &mut self,
        scope: &Scope,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<SyncEntity>> {
        let sql = format!(
            r#"
            SELECT id, owner_user_id, tenant_id, payload, version, created_at, updated_at
            FROM {}
            WHERE id = ? AND {}
            "#,
            entity_type.table(),
            SCOPE_PREDICATE
        );

        let row = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(id)
            .bind(&scope.user_id)
            .bind(&scope.tenant_id)
            .fetch_optional(&mut *self.conn)
            .await?;

        row.map(|r| r.into_entity(entity_type)).transpose()
    }

    /// Replace an entity's payload if its stored version is `expected_version`.
    ///
    /// Returns the new version (`expected_version + 1`). Fails with
    /// `VersionConflict` on a version mismatch and `NotFound` if the entity
    /// is missing or outside the scope; in both cases nothing is written.
    pub async fn update(
        &mut self,
        scope: &Scope,
        id: &str,
        payload: &EntityPayload,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let entity_type = payload.entity_type();
        let raw = serde_json::to_string(payload)?;

        let sql = format!(
            r#"
            UPDATE {}
            SET title = ?, payload = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ? AND {}
            "#,
            entity_type.table(),
            SCOPE_PREDICATE
        );

        let result = sqlx::query(&sql)
            .bind(payload.title())
            .bind(&raw)
            .bind(format_timestamp(&now))
            .bind(id)
            .bind(expected_version)
            .bind(&scope.user_id)
            .bind(&scope.tenant_id)
            .execute(&mut *self.conn)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(expected_version + 1);
        }

        Err(self.miss(scope, entity_type, id, expected_version).await)
    }

    /// Hard-delete an entity if its stored version is `expected_version`.
    ///
    /// Returns `false` when there was nothing visible to delete.
    pub async fn delete(
        &mut self,
        scope: &Scope,
        entity_type: EntityType,
        id: &str,
        expected_version: i64,
    ) -> Result<bool> {
        let sql = format!(
            "DELETE FROM {} WHERE id = ? AND version = ? AND {}",
            entity_type.table(),
            SCOPE_PREDICATE
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(expected_version)
            .bind(&scope.user_id)
            .bind(&scope.tenant_id)
            .execute(&mut *self.conn)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        match self.miss(scope, entity_type, id, expected_version).await {
            AppError::NotFound(_) => Ok(false),
            other => Err(other),
        }
    }

    /// Visible entities after `since` (all if `since` is `None`), in
    /// `(updated_at, id)` order, at most `limit`
    pub async fn modified_since(
        &mut self,
        scope: &Scope,
        entity_type: EntityType,
        since: Option<&SyncCursor>,
        limit: u32,
    ) -> Result<Vec<SyncEntity>> {
        let (at, after_id) = cursor_binds(since);
        let sql = format!(
            r#"
            SELECT id, owner_user_id, tenant_id, payload, version, created_at, updated_at
            FROM {}
            WHERE {} AND {}
            ORDER BY updated_at ASC, id ASC
            LIMIT ?
            "#,
            entity_type.table(),
            SCOPE_PREDICATE,
            AFTER_CURSOR
        );

        let rows = sqlx::query_as::<_, EntityRow>(&sql)
            .bind(&scope.user_id)
            .bind(&scope.tenant_id)
            .bind(&at)
            .bind(&at)
            .bind(&at)
            .bind(&after_id)
            .bind(i64::from(limit))
            .fetch_all(&mut *self.conn)
            .await?;

        rows.into_iter()
            .map(|r| r.into_entity(entity_type))
            .collect()
    }

    /// Unlimited count for the same predicate as [`Self::modified_since`]
    pub async fn count_modified_since(
        &mut self,
        scope: &Scope,
        entity_type: EntityType,
        since: Option<&SyncCursor>,
    ) -> Result<i64> {
        let (at, after_id) = cursor_binds(since);
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} AND {}",
            entity_type.table(),
            SCOPE_PREDICATE,
            AFTER_CURSOR
        );

        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(&scope.user_id)
            .bind(&scope.tenant_id)
            .bind(&at)
            .bind(&at)
            .bind(&at)
            .bind(&after_id)
            .fetch_one(&mut *self.conn)
            .await?;

        Ok(count)
    }

    /// Explain why a compare-and-set touched no row
    async fn miss(
        &mut self,
        scope: &Scope,
        entity_type: EntityType,
        id: &str,
        expected_version: i64,
    ) -> AppError {
        match self.find(scope, entity_type, id).await {
            Ok(Some(current)) => AppError::VersionConflict {
                entity_id: id.to_string(),
                expected: expected_version,
                actual: current.version,
            },
            Ok(None) => AppError::not_found(format!("{} {}", entity_type, id)),
            Err(e) => e,
        }
    }
}

fn cursor_binds(since: Option<&SyncCursor>) -> (Option<String>, Option<String>) {
    match since {
        Some(cursor) => (Some(format_timestamp(&cursor.at)), cursor.after_id.clone()),
        None => (None, None),
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: String,
    owner_user_id: String,
    tenant_id: Option<String>,
    payload: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl EntityRow {
    fn into_entity(self, entity_type: EntityType) -> Result<SyncEntity> {
        Ok(SyncEntity {
            payload: EntityPayload::from_stored(entity_type, &self.payload)?,
            server_id: self.id,
            entity_type,
            owner_user_id: self.owner_user_id,
            tenant_id: self.tenant_id,
            version: self.version,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}
