//! Sync coordinator
//!
//! Orchestrates push, pull, full sync, status, resolve, and chunked batch
//! transfers on top of the entity store, the conflict detector, and the
//! conflict queue. Each public call runs in at most one database
//! transaction; a database failure rolls back the whole call, while version
//! conflicts are recorded per entity and never abort sibling operations.
//!
//! Writes and pulls run under the SQLite write lock (`BEGIN IMMEDIATE`), so
//! concurrent calls queue instead of failing with `SQLITE_BUSY`, and a pull's
//! cursor is read at a point no in-flight write can land behind.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::batch::BatchTracker;
use super::detector::{ConflictDetector, Detection};
use super::queue::ConflictQueue;
use super::resolver::ConflictResolver;
use super::types::{
    parse_sync_cursor, BatchRequest, BatchResponse, BatchSession, BatchStatus, ConflictData,
    ConflictEntry, ConflictRecord, EntityType, FullSyncPull, FullSyncRequest, FullSyncResponse,
    OperationKind, PullData, PullQuery, PullResponse, PushEntity, PushResponse, PushResult,
    RecordStatus, ResolveRequest, ResolveResponse, SyncCursor, SyncEntity, SyncOperation,
    SyncStatus,
};
use crate::auth::{Scope, TenantResolver};
use crate::clock::Clock;
use crate::config::SyncSettings;
use crate::db::{EntityStore, WriteTransaction};
use crate::error::{AppError, Result};

/// Entry point of the sync engine
pub struct SyncCoordinator {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    tenants: Arc<dyn TenantResolver>,
    settings: SyncSettings,
    detector: ConflictDetector,
    resolver: ConflictResolver,
}

impl SyncCoordinator {
    pub fn new(
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        tenants: Arc<dyn TenantResolver>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            pool,
            clock,
            tenants,
            settings,
            detector: ConflictDetector::new(),
            resolver: ConflictResolver::new(),
        }
    }

    // ========================================================================
    // Push
    // ========================================================================

    /// Apply a client's changes in submission order, in one transaction
    pub async fn push(
        &self,
        user_id: &str,
        device_id: &str,
        entities: Vec<PushEntity>,
    ) -> Result<PushResponse> {
        let operations = SyncOperation::from_wire_batch(device_id, entities)?;
        let scope = self.tenants.resolve(user_id).await?;

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let applied = self
            .apply_operations(&mut tx, &scope, &operations, None)
            .await;
        let outcome = tx.finish(applied).await?;

        tracing::info!(
            user_id = %user_id,
            device_id = %device_id,
            accepted = outcome.results.len(),
            conflicts = outcome.conflicts.len(),
            "Push applied"
        );

        Ok(outcome)
    }

    async fn apply_operations(
        &self,
        conn: &mut SqliteConnection,
        scope: &Scope,
        operations: &[SyncOperation],
        batch_id: Option<&str>,
    ) -> Result<PushResponse> {
        let mut outcome = PushResponse::default();
        for operation in operations {
            self.apply_one(conn, scope, operation, batch_id, &mut outcome)
                .await?;
        }
        Ok(outcome)
    }

    /// Apply one operation and append exactly one queue record for it
    async fn apply_one(
        &self,
        conn: &mut SqliteConnection,
        scope: &Scope,
        op: &SyncOperation,
        batch_id: Option<&str>,
        outcome: &mut PushResponse,
    ) -> Result<()> {
        let now = self.clock.now();
        let client_data = op.payload.as_ref().map(|p| p.to_value()).transpose()?;

        let server_id = match (op.kind, op.server_id.as_deref()) {
            (OperationKind::Create, _) => {
                let payload = op.payload.as_ref().ok_or_else(|| {
                    AppError::validation(format!("create {} has no data", op.client_id))
                })?;
                let entity = EntityStore::new(&mut *conn)
                    .create(scope, payload, now)
                    .await?;
                return self
                    .record_success(conn, scope, op, &entity.server_id, 1, client_data, batch_id, now, outcome)
                    .await;
            }
            (_, Some(server_id)) => server_id,
            (_, None) => {
                return Err(AppError::validation(format!(
                    "{} {} requires server_id",
                    op.kind.as_str(),
                    op.client_id
                )))
            }
        };

        let mut store = EntityStore::new(&mut *conn);
        let current = store.find(scope, op.entity_type, server_id).await?;

        let applied = match self.detector.detect(op, current.as_ref()) {
            Detection::Conflict { .. } => Err(current),
            Detection::Missing if op.kind == OperationKind::Delete => {
                // Already gone: a retried delete is a no-op
                Ok(op.client_version)
            }
            Detection::Missing => Err(None),
            Detection::NoConflict => {
                let written = match (op.kind, op.payload.as_ref()) {
                    (OperationKind::Delete, _) => store
                        .delete(scope, op.entity_type, server_id, op.client_version)
                        .await
                        .map(|_| op.client_version),
                    (_, Some(payload)) => {
                        store
                            .update(scope, server_id, payload, op.client_version, now)
                            .await
                    }
                    (_, None) => Err(AppError::validation(format!(
                        "update {} has no data",
                        op.client_id
                    ))),
                };

                match written {
                    Ok(version) => Ok(version),
                    Err(AppError::VersionConflict { .. }) | Err(AppError::NotFound(_)) => {
                        Err(store.find(scope, op.entity_type, server_id).await?)
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match applied {
            Ok(version) => {
                self.record_success(conn, scope, op, server_id, version, client_data, batch_id, now, outcome)
                    .await
            }
            Err(server_state) => {
                self.record_conflict(conn, scope, op, server_id, server_state, client_data, batch_id, now, outcome)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_success(
        &self,
        conn: &mut SqliteConnection,
        scope: &Scope,
        op: &SyncOperation,
        server_id: &str,
        version: i64,
        client_data: Option<Value>,
        batch_id: Option<&str>,
        now: DateTime<Utc>,
        outcome: &mut PushResponse,
    ) -> Result<()> {
        let record = audit_record(
            scope,
            op,
            server_id,
            version,
            RecordStatus::Completed,
            ConflictData {
                client_data,
                server_data: None,
            },
            batch_id,
            now,
        );
        ConflictQueue::new(conn).append(&record).await?;

        outcome.results.push(PushResult {
            status: "success",
            client_id: op.client_id.clone(),
            server_id: server_id.to_string(),
            operation: op.kind,
            version,
        });

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_conflict(
        &self,
        conn: &mut SqliteConnection,
        scope: &Scope,
        op: &SyncOperation,
        server_id: &str,
        server_state: Option<SyncEntity>,
        client_data: Option<Value>,
        batch_id: Option<&str>,
        now: DateTime<Utc>,
        outcome: &mut PushResponse,
    ) -> Result<()> {
        let server_version = server_state.as_ref().map_or(0, |e| e.version);
        let server_data = server_state
            .as_ref()
            .map(|e| e.payload.to_value())
            .transpose()?;

        let record = audit_record(
            scope,
            op,
            server_id,
            server_version,
            RecordStatus::Conflict,
            ConflictData {
                client_data,
                server_data: server_data.clone(),
            },
            batch_id,
            now,
        );
        ConflictQueue::new(conn).append(&record).await?;

        tracing::debug!(
            conflict_id = %record.id,
            entity_type = %op.entity_type,
            server_id = %server_id,
            client_version = op.client_version,
            server_version = server_version,
            "Version conflict queued"
        );

        outcome.conflicts.push(ConflictEntry {
            status: "conflict",
            conflict_id: record.id,
            client_id: op.client_id.clone(),
            server_id: server_id.to_string(),
            client_version: op.client_version,
            server_version,
            entity_type: op.entity_type,
            server_data,
        });

        Ok(())
    }

    // ========================================================================
    // Pull
    // ========================================================================

    /// Entities changed after the client's cursor. Reads only.
    ///
    /// The returned `timestamp` is the next `last_sync`: the request time when
    /// everything was delivered, otherwise the position of the page's end.
    pub async fn pull(&self, user_id: &str, query: &PullQuery) -> Result<PullResponse> {
        let since = parse_sync_cursor(query.last_sync.as_deref())?;
        let types = parse_types(query.types.as_deref())?;
        let limit = self.settings.effective_limit(query.limit);
        let scope = self.tenants.resolve(user_id).await?;

        // Under the lock every committed row is stamped before `requested_at`
        // and every later one after it
        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let requested_at = self.clock.now();
        let page = collect_changes(&mut tx, &scope, since.as_ref(), &types, limit).await;
        let (data, resume) = tx.finish(page).await?;

        let has_more = resume.is_some();
        let timestamp = resume.unwrap_or_else(|| SyncCursor::at(requested_at));

        tracing::debug!(
            user_id = %user_id,
            device_id = query.device_id.as_deref().unwrap_or("-"),
            entities = data.len(),
            has_more = has_more,
            "Pull served"
        );

        Ok(PullResponse {
            data,
            has_more,
            timestamp,
        })
    }

    // ========================================================================
    // Full sync
    // ========================================================================

    /// Push then pull, in one transaction.
    ///
    /// The client's own just-applied changes show up in the pull half; the
    /// client drops them by `client_id`.
    pub async fn full_sync(&self, user_id: &str, request: FullSyncRequest) -> Result<FullSyncResponse> {
        let operations = SyncOperation::from_wire_batch(&request.device_id, request.data)?;
        let since = parse_sync_cursor(request.last_sync.as_deref())?;
        let limit = self.settings.effective_limit(None);
        let scope = self.tenants.resolve(user_id).await?;

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let requested_at = self.clock.now();
        let synced = match self
            .apply_operations(&mut tx, &scope, &operations, None)
            .await
        {
            Ok(pushed) => collect_changes(&mut tx, &scope, since.as_ref(), &EntityType::ALL, limit)
                .await
                .map(|page| (pushed, page)),
            Err(e) => Err(e),
        };
        let (pushed, (data, resume)) = tx.finish(synced).await?;

        let has_more = resume.is_some();
        let timestamp = resume.unwrap_or_else(|| SyncCursor::at(requested_at));

        tracing::info!(
            user_id = %user_id,
            device_id = %request.device_id,
            acknowledged = pushed.results.len(),
            conflicts = pushed.conflicts.len(),
            pulled = data.len(),
            "Full sync completed"
        );

        Ok(FullSyncResponse {
            pull: FullSyncPull { data, has_more },
            conflicts: pushed.conflicts,
            acknowledged: pushed.results,
            timestamp,
        })
    }

    // ========================================================================
    // Status
    // ========================================================================

    /// Aggregate view of a device's queue records. Reads only.
    pub async fn status(&self, user_id: &str, device_id: &str) -> Result<SyncStatus> {
        if device_id.trim().is_empty() {
            return Err(AppError::validation("device_id is required"));
        }

        let now = self.clock.now();
        let mut conn = self.pool.acquire().await?;
        let mut queue = ConflictQueue::new(&mut conn);

        let last_sync = queue.last_sync(user_id, device_id).await?;
        let pending_items = queue.count_conflicts(user_id, Some(device_id)).await?;
        let conflict_items = queue.count_conflicts(user_id, None).await?;
        let stats_by_type = queue.stats_by_type(user_id, device_id).await?;

        let window = Duration::seconds(self.settings.online_window_secs);
        let is_online = last_sync.map_or(false, |last| now - last <= window);

        Ok(SyncStatus {
            last_sync,
            pending_items,
            conflict_items,
            stats_by_type,
            is_online,
        })
    }

    /// Unresolved conflicts of the user, optionally for one device
    pub async fn conflicts(
        &self,
        user_id: &str,
        device_id: Option<&str>,
    ) -> Result<Vec<ConflictRecord>> {
        let mut conn = self.pool.acquire().await?;
        ConflictQueue::new(&mut conn)
            .list_conflicts(user_id, device_id)
            .await
    }

    // ========================================================================
    // Resolve
    // ========================================================================

    /// Settle a queued conflict
    pub async fn resolve(&self, user_id: &str, request: ResolveRequest) -> Result<ResolveResponse> {
        let scope = self.tenants.resolve(user_id).await?;
        let now = self.clock.now();

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let resolved = self
            .resolver
            .resolve(
                &mut tx,
                &scope,
                &request.conflict_id,
                request.resolution,
                request.merged_data.as_ref(),
                now,
            )
            .await;

        tx.finish(resolved).await
    }

    // ========================================================================
    // Batches
    // ========================================================================

    /// Apply one chunk of a multi-request transfer.
    ///
    /// Chunks are independent: an accepted chunk stays applied even if later
    /// ones never arrive. A chunk number already accepted for this batch is
    /// acknowledged again without re-applying its operations.
    pub async fn accept_batch(&self, user_id: &str, mut request: BatchRequest) -> Result<BatchResponse> {
        request.batch_id = request.batch_id.trim().to_string();
        if request.batch_id.is_empty() {
            return Err(AppError::validation("batch_id is required"));
        }
        if request.total_batches < 1 {
            return Err(AppError::validation("total_batches must be at least 1"));
        }
        if request.batch_number < 1 || request.batch_number > request.total_batches {
            return Err(AppError::validation(format!(
                "batch_number must be between 1 and {}",
                request.total_batches
            )));
        }

        let entities = std::mem::take(&mut request.entities);
        let operations = SyncOperation::from_wire_batch(&request.device_id, entities)?;
        let scope = self.tenants.resolve(user_id).await?;
        let now = self.clock.now();

        let mut tx = WriteTransaction::begin(&self.pool).await?;
        let accepted = self
            .apply_chunk(&mut tx, &scope, &request, &operations, now)
            .await;
        let response = tx.finish(accepted).await?;

        if response.replayed {
            tracing::info!(
                batch_id = %response.batch_id,
                batch_number = response.batch_number,
                "Batch chunk re-delivered, not re-applied"
            );
        } else {
            tracing::info!(
                user_id = %user_id,
                device_id = %request.device_id,
                batch_id = %response.batch_id,
                batch_number = response.batch_number,
                total_batches = response.total_batches,
                processed = response.processed,
                "Batch chunk applied"
            );
        }

        Ok(response)
    }

    /// Dedup check, operations and session update of one chunk
    async fn apply_chunk(
        &self,
        conn: &mut SqliteConnection,
        scope: &Scope,
        request: &BatchRequest,
        operations: &[SyncOperation],
        now: DateTime<Utc>,
    ) -> Result<BatchResponse> {
        let user_id = scope.user_id.as_str();
        let batch_id = request.batch_id.as_str();

        let mut tracker = BatchTracker::new(&mut *conn);
        if let Some(processed) = tracker
            .find_part(user_id, batch_id, request.batch_number)
            .await?
        {
            let session = tracker.get_session(user_id, batch_id).await?;
            return Ok(BatchResponse {
                batch_id: batch_id.to_string(),
                batch_number: request.batch_number,
                total_batches: request.total_batches,
                processed,
                is_complete: session.map_or(false, |s| s.status == BatchStatus::Completed),
                replayed: true,
                results: Vec::new(),
                conflicts: Vec::new(),
            });
        }

        if let Some(existing) = tracker.get_session(user_id, batch_id).await? {
            if existing.total_batches != request.total_batches {
                return Err(AppError::validation(format!(
                    "batch {} was opened with total_batches {}, got {}",
                    batch_id, existing.total_batches, request.total_batches
                )));
            }
        }

        let outcome = self
            .apply_operations(conn, scope, operations, Some(batch_id))
            .await?;
        let processed = operations.len() as i64;

        let session = BatchTracker::new(conn)
            .record_part(
                user_id,
                batch_id,
                request.batch_number,
                request.total_batches,
                processed,
                now,
            )
            .await?;

        Ok(BatchResponse {
            batch_id: batch_id.to_string(),
            batch_number: request.batch_number,
            total_batches: request.total_batches,
            processed,
            is_complete: session.status == BatchStatus::Completed,
            replayed: false,
            results: outcome.results,
            conflicts: outcome.conflicts,
        })
    }

    /// Stored session for a batch id
    pub async fn batch_session(&self, user_id: &str, batch_id: &str) -> Result<BatchSession> {
        let mut conn = self.pool.acquire().await?;
        BatchTracker::new(&mut conn)
            .get_session(user_id, batch_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("Batch {}", batch_id)))
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Drop completed/resolved queue records older than `retention_days`
    pub async fn purge_settled(&self, retention_days: i64) -> Result<u64> {
        let cutoff = self.clock.now() - Duration::days(retention_days);
        let mut conn = self.pool.acquire().await?;
        let purged = ConflictQueue::new(&mut conn).purge_settled(cutoff).await?;

        tracing::info!(purged = purged, cutoff = %cutoff, "Purged settled sync records");
        Ok(purged)
    }
}

#[allow(clippy::too_many_arguments)]
fn audit_record(
    scope: &Scope,
    op: &SyncOperation,
    entity_id: &str,
    server_version: i64,
    status: RecordStatus,
    data: ConflictData,
    batch_id: Option<&str>,
    now: DateTime<Utc>,
) -> ConflictRecord {
    ConflictRecord {
        id: Uuid::new_v4().to_string(),
        user_id: scope.user_id.clone(),
        device_id: op.device_id.clone(),
        entity_type: op.entity_type,
        entity_id: entity_id.to_string(),
        client_id: op.client_id.clone(),
        operation: op.kind,
        client_version: op.client_version,
        server_version,
        data,
        status,
        conflict_resolution: None,
        resolved_data: None,
        batch_id: batch_id.map(str::to_string),
        created_at: now,
        synced_at: now,
        resolved_at: None,
    }
}

/// Read each requested type's changes after `since`.
///
/// When any type is cut at `limit`, also returns where to resume: the
/// earliest last-delivered position among the cut types. Rows of other types
/// past that point come back again on the next page.
async fn collect_changes(
    conn: &mut SqliteConnection,
    scope: &Scope,
    since: Option<&SyncCursor>,
    types: &[EntityType],
    limit: u32,
) -> Result<(PullData, Option<SyncCursor>)> {
    let mut store = EntityStore::new(conn);
    let mut data = PullData::default();
    let mut resume: Option<SyncCursor> = None;

    for entity_type in types {
        let entities = store
            .modified_since(scope, *entity_type, since, limit)
            .await?;
        let total = store
            .count_modified_since(scope, *entity_type, since)
            .await?;

        if total > i64::from(limit) {
            if let Some(last) = entities.last() {
                let position = SyncCursor::after(last.updated_at, last.server_id.clone());
                resume = Some(match resume.take() {
                    Some(earlier) => earlier.min(position),
                    None => position,
                });
            }
        }
        *data.group_mut(*entity_type) = entities;
    }

    Ok((data, resume))
}

/// Parse a comma-separated type filter; empty means every type
fn parse_types(raw: Option<&str>) -> Result<Vec<EntityType>> {
    let mut types = Vec::new();
    for part in raw.unwrap_or_default().split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let entity_type: EntityType = part.parse()?;
        if !types.contains(&entity_type) {
            types.push(entity_type);
        }
    }

    if types.is_empty() {
        types.extend(EntityType::ALL);
    }
    Ok(types)
}
