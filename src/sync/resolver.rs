//! Conflict resolution
//!
//! Conflicted entities are never merged automatically. A queued conflict is
//! settled only by an explicit strategy chosen by the client.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;

use super::payload::EntityPayload;
use super::queue::ConflictQueue;
use super::types::{OperationKind, RecordStatus, ResolutionStrategy, ResolveResponse};
use crate::auth::Scope;
use crate::db::EntityStore;
use crate::error::{AppError, Result};

/// Applies a resolution strategy to a queued conflict
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Settle conflict `conflict_id` with `strategy`.
    ///
    /// Only records in `conflict` state qualify; the record then moves to
    /// `resolved` with the strategy and final payload. Run inside a
    /// transaction so the entity write and the transition commit together.
    pub async fn resolve(
        &self,
        conn: &mut SqliteConnection,
        scope: &Scope,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        merged_data: Option<&Value>,
        now: DateTime<Utc>,
    ) -> Result<ResolveResponse> {
        let record = ConflictQueue::new(&mut *conn)
            .get(&scope.user_id, conflict_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Conflict {}", conflict_id)))?;

        match record.status {
            RecordStatus::Conflict => {}
            RecordStatus::Completed => {
                return Err(AppError::invalid_state(format!(
                    "Record {} completed without a conflict",
                    conflict_id
                )))
            }
            RecordStatus::Resolved => {
                return Err(AppError::invalid_state(format!(
                    "Conflict {} is already resolved",
                    conflict_id
                )))
            }
        }

        let entity_type = record.entity_type;
        let entity_id = record.entity_id.as_str();
        let mut store = EntityStore::new(&mut *conn);
        let current = store.find(scope, entity_type, entity_id).await?;

        let (final_data, version) = match strategy {
            ResolutionStrategy::ServerWins => match &current {
                Some(entity) => (Some(entity.payload.to_value()?), Some(entity.version)),
                None => (None, None),
            },
            ResolutionStrategy::ClientWins => match (record.operation, &current) {
                (OperationKind::Delete, Some(entity)) => {
                    store
                        .delete(scope, entity_type, entity_id, entity.version)
                        .await?;
                    (None, None)
                }
                (OperationKind::Delete, None) => (None, None),
                (_, None) => {
                    return Err(AppError::invalid_state(format!(
                        "{} {} no longer exists; push it again as a create",
                        entity_type, entity_id
                    )))
                }
                (_, Some(entity)) => {
                    let client_data = record.data.client_data.as_ref().ok_or_else(|| {
                        AppError::Internal(format!("Conflict {} has no client data", conflict_id))
                    })?;
                    let payload = EntityPayload::parse(entity_type, client_data)?;
                    let version = store
                        .update(scope, entity_id, &payload, entity.version, now)
                        .await?;
                    (Some(payload.to_value()?), Some(version))
                }
            },
            ResolutionStrategy::Merge => {
                let merged = merged_data
                    .ok_or_else(|| AppError::validation("merged_data is required for merge"))?;
                let entity = current.as_ref().ok_or_else(|| {
                    AppError::invalid_state(format!(
                        "{} {} no longer exists; nothing to merge into",
                        entity_type, entity_id
                    ))
                })?;
                let payload = EntityPayload::parse(entity_type, merged)?;
                let version = store
                    .update(scope, entity_id, &payload, entity.version, now)
                    .await?;
                (Some(payload.to_value()?), Some(version))
            }
        };

        let transitioned = ConflictQueue::new(&mut *conn)
            .mark_resolved(conflict_id, strategy, final_data.as_ref(), now)
            .await?;
        if !transitioned {
            return Err(AppError::invalid_state(format!(
                "Conflict {} is already resolved",
                conflict_id
            )));
        }

        tracing::info!(
            conflict_id = %conflict_id,
            entity_type = %entity_type,
            entity_id = %entity_id,
            resolution = strategy.as_str(),
            "Conflict resolved"
        );

        Ok(ResolveResponse {
            resolved: true,
            final_data,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use crate::sync::{ConflictData, ConflictRecord, EntityType, SyncEntity};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use sqlx::SqlitePool;

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 8, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn task(title: &str) -> EntityPayload {
        EntityPayload::parse(EntityType::Task, &json!({ "titolo": title })).unwrap()
    }

    /// Store a task at version 2 and queue a stale version-1 edit against it
    async fn seeded(
        pool: &SqlitePool,
        operation: OperationKind,
        status: RecordStatus,
    ) -> (Scope, SyncEntity, String) {
        let scope = Scope::new("alice", Some("acme".to_string()));
        let mut conn = pool.acquire().await.unwrap();

        let mut store = EntityStore::new(&mut conn);
        let created = store.create(&scope, &task("server v1"), t(0)).await.unwrap();
        store
            .update(&scope, &created.server_id, &task("server v2"), 1, t(1))
            .await
            .unwrap();
        let entity = store
            .find(&scope, EntityType::Task, &created.server_id)
            .await
            .unwrap()
            .unwrap();

        let client_data =
            (operation != OperationKind::Delete).then(|| json!({ "titolo": "client edit" }));
        let record = ConflictRecord {
            id: "conflict-1".to_string(),
            user_id: "alice".to_string(),
            device_id: "tablet".to_string(),
            entity_type: EntityType::Task,
            entity_id: entity.server_id.clone(),
            client_id: "c1".to_string(),
            operation,
            client_version: 1,
            server_version: 2,
            data: ConflictData {
                client_data,
                server_data: Some(json!({ "titolo": "server v2" })),
            },
            status,
            conflict_resolution: None,
            resolved_data: None,
            batch_id: None,
            created_at: t(2),
            synced_at: t(2),
            resolved_at: None,
        };
        ConflictQueue::new(&mut conn).append(&record).await.unwrap();

        (scope, entity, record.id)
    }

    async fn stored(pool: &SqlitePool, scope: &Scope, id: &str) -> Option<SyncEntity> {
        let mut conn = pool.acquire().await.unwrap();
        EntityStore::new(&mut conn)
            .find(scope, EntityType::Task, id)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_wins_overwrites_and_bumps_version() {
        let pool = create_memory_pool().await.unwrap();
        let (scope, entity, conflict_id) =
            seeded(&pool, OperationKind::Update, RecordStatus::Conflict).await;

        let mut conn = pool.acquire().await.unwrap();
        let response = ConflictResolver::new()
            .resolve(&mut conn, &scope, &conflict_id, ResolutionStrategy::ClientWins, None, t(5))
            .await
            .unwrap();
        drop(conn);

        assert!(response.resolved);
        assert_eq!(response.version, Some(3));
        assert_eq!(response.final_data.unwrap()["titolo"], "client edit");

        let after = stored(&pool, &scope, &entity.server_id).await.unwrap();
        assert_eq!(after.version, 3);
        assert_eq!(after.payload.title(), "client edit");
    }

    #[tokio::test]
    async fn test_server_wins_leaves_entity_alone() {
        let pool = create_memory_pool().await.unwrap();
        let (scope, entity, conflict_id) =
            seeded(&pool, OperationKind::Update, RecordStatus::Conflict).await;

        let mut conn = pool.acquire().await.unwrap();
        let response = ConflictResolver::new()
            .resolve(&mut conn, &scope, &conflict_id, ResolutionStrategy::ServerWins, None, t(5))
            .await
            .unwrap();
        let record = ConflictQueue::new(&mut conn)
            .get("alice", &conflict_id)
            .await
            .unwrap()
            .unwrap();
        drop(conn);

        assert_eq!(response.version, Some(2));
        assert_eq!(response.final_data.unwrap()["titolo"], "server v2");
        assert_eq!(record.status, RecordStatus::Resolved);
        assert_eq!(record.conflict_resolution, Some(ResolutionStrategy::ServerWins));
        assert_eq!(record.resolved_at, Some(t(5)));

        let after = stored(&pool, &scope, &entity.server_id).await.unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.updated_at, entity.updated_at);
    }

    #[tokio::test]
    async fn test_merge_requires_data() {
        let pool = create_memory_pool().await.unwrap();
        let (scope, entity, conflict_id) =
            seeded(&pool, OperationKind::Update, RecordStatus::Conflict).await;
        let resolver = ConflictResolver::new();
        let mut conn = pool.acquire().await.unwrap();

        let missing = resolver
            .resolve(&mut conn, &scope, &conflict_id, ResolutionStrategy::Merge, None, t(5))
            .await;
        assert!(matches!(missing, Err(AppError::Validation(_))));

        let merged = json!({ "titolo": "merged", "priorita": "alta" });
        let response = resolver
            .resolve(&mut conn, &scope, &conflict_id, ResolutionStrategy::Merge, Some(&merged), t(6))
            .await
            .unwrap();
        drop(conn);

        assert_eq!(response.version, Some(3));
        let after = stored(&pool, &scope, &entity.server_id).await.unwrap();
        assert_eq!(after.payload.title(), "merged");
    }

    #[tokio::test]
    async fn test_client_wins_delete_removes_entity() {
        let pool = create_memory_pool().await.unwrap();
        let (scope, entity, conflict_id) =
            seeded(&pool, OperationKind::Delete, RecordStatus::Conflict).await;

        let mut conn = pool.acquire().await.unwrap();
        let response = ConflictResolver::new()
            .resolve(&mut conn, &scope, &conflict_id, ResolutionStrategy::ClientWins, None, t(5))
            .await
            .unwrap();
        drop(conn);

        assert_eq!(response.version, None);
        assert!(stored(&pool, &scope, &entity.server_id).await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_twice_is_invalid_state() {
        let pool = create_memory_pool().await.unwrap();
        let (scope, _, conflict_id) =
            seeded(&pool, OperationKind::Update, RecordStatus::Conflict).await;
        let resolver = ConflictResolver::new();
        let mut conn = pool.acquire().await.unwrap();

        resolver
            .resolve(&mut conn, &scope, &conflict_id, ResolutionStrategy::ServerWins, None, t(5))
            .await
            .unwrap();
        let again = resolver
            .resolve(&mut conn, &scope, &conflict_id, ResolutionStrategy::ClientWins, None, t(6))
            .await;

        assert!(matches!(again, Err(AppError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_completed_record_is_not_resolvable() {
        let pool = create_memory_pool().await.unwrap();
        let (scope, _, conflict_id) =
            seeded(&pool, OperationKind::Update, RecordStatus::Completed).await;
        let mut conn = pool.acquire().await.unwrap();

        let result = ConflictResolver::new()
            .resolve(&mut conn, &scope, &conflict_id, ResolutionStrategy::ServerWins, None, t(5))
            .await;

        assert!(matches!(result, Err(AppError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_unknown_or_foreign_conflict_is_not_found() {
        let pool = create_memory_pool().await.unwrap();
        let (_, _, conflict_id) =
            seeded(&pool, OperationKind::Update, RecordStatus::Conflict).await;
        let resolver = ConflictResolver::new();
        let mut conn = pool.acquire().await.unwrap();
        let bob = Scope::new("bob", Some("acme".to_string()));

        let unknown = resolver
            .resolve(&mut conn, &bob, "nope", ResolutionStrategy::ServerWins, None, t(5))
            .await;
        assert!(matches!(unknown, Err(AppError::NotFound(_))));

        let foreign = resolver
            .resolve(&mut conn, &bob, &conflict_id, ResolutionStrategy::ServerWins, None, t(5))
            .await;
        assert!(matches!(foreign, Err(AppError::NotFound(_))));
    }
}
