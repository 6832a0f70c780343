//! Sync data types
//!
//! Defines types for offline-client synchronization including:
//! - Versioned entities and the operations clients submit against them
//! - Conflict queue records and resolution strategies
//! - Batch sessions for chunked transfers
//! - Request/response bodies of the sync endpoints

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::payload::EntityPayload;
use crate::error::{AppError, Result};

/// Types of entities that can be synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    #[serde(alias = "events", alias = "eventi")]
    Event,
    #[serde(alias = "tasks")]
    Task,
    #[serde(alias = "documents", alias = "documenti")]
    Document,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Event, EntityType::Task, EntityType::Document];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Event => "event",
            EntityType::Task => "task",
            EntityType::Document => "document",
        }
    }

    /// Backing table of the business entity
    pub(crate) fn table(&self) -> &'static str {
        match self {
            EntityType::Event => "events",
            EntityType::Task => "tasks",
            EntityType::Document => "documents",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" | "events" | "eventi" => Ok(EntityType::Event),
            "task" | "tasks" => Ok(EntityType::Task),
            "document" | "documents" | "documenti" => Ok(EntityType::Document),
            other => Err(AppError::validation(format!("Unknown entity type: {}", other))),
        }
    }
}

/// Types of sync operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl FromStr for OperationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(AppError::validation(format!("Unknown operation: {}", other))),
        }
    }
}

/// One entity change as sent by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEntity {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub operation: OperationKind,
    #[serde(default)]
    pub data: Option<Value>,
    /// Version the client last saw; ignored for creates
    #[serde(default)]
    pub version: Option<i64>,
    pub client_id: String,
    #[serde(default)]
    pub server_id: Option<String>,
}

/// A validated change, ready to be applied
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOperation {
    pub entity_type: EntityType,
    pub kind: OperationKind,
    /// Client-local correlation key, echoed back in results
    pub client_id: String,
    /// Present for updates and deletes
    pub server_id: Option<String>,
    /// Typed payload; absent only for deletes
    pub payload: Option<EntityPayload>,
    /// Version the client based this change on (0 for creates)
    pub client_version: i64,
    pub device_id: String,
}

impl SyncOperation {
    /// Validate a wire entity at the boundary
    pub fn from_wire(device_id: &str, entity: PushEntity) -> Result<Self> {
        let client_id = entity.client_id.trim().to_string();
        if client_id.is_empty() {
            return Err(AppError::validation("client_id is required"));
        }

        let server_id = entity
            .server_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        let payload = match (entity.operation, entity.data.as_ref()) {
            (OperationKind::Delete, _) => None,
            (_, Some(data)) => Some(EntityPayload::parse(entity.entity_type, data)?),
            (_, None) => {
                return Err(AppError::validation(format!(
                    "{} {} for client_id {} has no data",
                    entity.operation.as_str(),
                    entity.entity_type,
                    client_id
                )))
            }
        };

        let (server_id, client_version) = match entity.operation {
            // Creates never reference a server row or a prior version
            OperationKind::Create => (None, 0),
            OperationKind::Update | OperationKind::Delete => {
                let server_id = server_id.ok_or_else(|| {
                    AppError::validation(format!(
                        "{} for client_id {} requires server_id",
                        entity.operation.as_str(),
                        client_id
                    ))
                })?;
                let version = entity.version.ok_or_else(|| {
                    AppError::validation(format!(
                        "{} for client_id {} requires version",
                        entity.operation.as_str(),
                        client_id
                    ))
                })?;
                if version < 1 {
                    return Err(AppError::validation(format!(
                        "version must be positive, got {}",
                        version
                    )));
                }
                (Some(server_id), version)
            }
        };

        Ok(SyncOperation {
            entity_type: entity.entity_type,
            kind: entity.operation,
            client_id,
            server_id,
            payload,
            client_version,
            device_id: device_id.to_string(),
        })
    }

    /// Validate a whole request up front so nothing is applied if any entry is malformed
    pub fn from_wire_batch(device_id: &str, entities: Vec<PushEntity>) -> Result<Vec<Self>> {
        if device_id.trim().is_empty() {
            return Err(AppError::validation("device_id is required"));
        }
        entities
            .into_iter()
            .map(|entity| SyncOperation::from_wire(device_id, entity))
            .collect()
    }
}

/// A stored, versioned business entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEntity {
    pub server_id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub owner_user_id: String,
    pub tenant_id: Option<String>,
    /// Starts at 1, +1 per accepted update
    pub version: i64,
    #[serde(flatten)]
    pub payload: EntityPayload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of a conflict queue record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Completed,
    Conflict,
    Resolved,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Completed => "completed",
            RecordStatus::Conflict => "conflict",
            RecordStatus::Resolved => "resolved",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(RecordStatus::Completed),
            "conflict" => Ok(RecordStatus::Conflict),
            "resolved" => Ok(RecordStatus::Resolved),
            other => Err(AppError::Internal(format!("Unknown record status: {}", other))),
        }
    }
}

/// How to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Re-apply the client's submitted data on top of the current version
    #[serde(alias = "client", alias = "local")]
    ClientWins,
    /// Keep the server state as it is
    #[serde(alias = "server", alias = "remote")]
    ServerWins,
    /// Apply caller-supplied merged data
    Merge,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::ClientWins => "client_wins",
            ResolutionStrategy::ServerWins => "server_wins",
            ResolutionStrategy::Merge => "merge",
        }
    }
}

impl FromStr for ResolutionStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client_wins" | "client" | "local" => Ok(ResolutionStrategy::ClientWins),
            "server_wins" | "server" | "remote" => Ok(ResolutionStrategy::ServerWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            other => Err(AppError::validation(format!("Unknown resolution: {}", other))),
        }
    }
}

/// Both sides of an operation, as kept in the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictData {
    pub client_data: Option<Value>,
    #[serde(default)]
    pub server_data: Option<Value>,
}

/// One processed sync operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    pub id: String,
    pub user_id: String,
    pub device_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub client_id: String,
    pub operation: OperationKind,
    pub client_version: i64,
    /// Version after the operation (completed) or the version that blocked it (conflict)
    pub server_version: i64,
    pub data: ConflictData,
    pub status: RecordStatus,
    pub conflict_resolution: Option<ResolutionStrategy>,
    pub resolved_data: Option<Value>,
    pub batch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Progress of a chunked transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Processing,
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
        }
    }
}

impl FromStr for BatchStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            other => Err(AppError::Internal(format!("Unknown batch status: {}", other))),
        }
    }
}

/// A chunked transfer tracked under one batch id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSession {
    pub batch_id: String,
    pub user_id: String,
    /// Last batch number seen
    pub batch_number: i64,
    pub total_batches: i64,
    /// Entities accepted across all distinct batch numbers
    pub entities_count: i64,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Separates the timestamp from the tie-breaking id in a resumable cursor
const CURSOR_ID_SEPARATOR: char = '~';

/// Position in the change feed, in `(updated_at, id)` order.
///
/// Everything at or before the cursor has been delivered. Without
/// `after_id` that covers every row stamped `at`; with it, only the rows
/// stamped `at` whose id sorts at or before `after_id`. The id part lets a
/// client resume a truncated page without skipping rows that share the
/// boundary timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SyncCursor {
    pub at: DateTime<Utc>,
    pub after_id: Option<String>,
}

impl SyncCursor {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self { at, after_id: None }
    }

    pub fn after(at: DateTime<Utc>, id: impl Into<String>) -> Self {
        Self {
            at,
            after_id: Some(id.into()),
        }
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.at.to_rfc3339_opts(SecondsFormat::Micros, true))?;
        if let Some(id) = &self.after_id {
            write!(f, "{}{}", CURSOR_ID_SEPARATOR, id)?;
        }
        Ok(())
    }
}

impl Serialize for SyncCursor {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Parse a client-held sync cursor.
///
/// Accepts RFC3339 or `YYYY-MM-DD HH:MM:SS` (taken as UTC), optionally
/// followed by `~<id>` as handed out for truncated pulls. Empty and `null`
/// mean "from the beginning".
pub fn parse_sync_cursor(raw: Option<&str>) -> Result<Option<SyncCursor>> {
    let raw = match raw.map(str::trim) {
        None | Some("") | Some("null") => return Ok(None),
        Some(raw) => raw,
    };

    let (stamp, after_id) = match raw.split_once(CURSOR_ID_SEPARATOR) {
        Some((_, "")) => {
            return Err(AppError::validation(format!("Invalid last_sync cursor: {}", raw)))
        }
        Some((stamp, id)) => (stamp, Some(id.to_string())),
        None => (raw, None),
    };

    let at = match DateTime::parse_from_rfc3339(stamp) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S")
            .map(|naive| naive.and_utc())
            .map_err(|_| AppError::validation(format!("Invalid last_sync timestamp: {}", raw)))?,
    };

    Ok(Some(SyncCursor { at, after_id }))
}

// ============================================================================
// Wire types
// ============================================================================

/// Request to push changes to server
#[derive(Debug, Clone, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    #[serde(default)]
    pub entities: Vec<PushEntity>,
}

/// An accepted operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushResult {
    pub status: &'static str,
    pub client_id: String,
    pub server_id: String,
    pub operation: OperationKind,
    pub version: i64,
}

/// A withheld operation, queued for resolution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictEntry {
    pub status: &'static str,
    pub conflict_id: String,
    pub client_id: String,
    pub server_id: String,
    pub client_version: i64,
    pub server_version: i64,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub server_data: Option<Value>,
}

/// Response from push operation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PushResponse {
    pub results: Vec<PushResult>,
    pub conflicts: Vec<ConflictEntry>,
}

/// Query for pulling changes
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullQuery {
    #[serde(default)]
    pub last_sync: Option<String>,
    /// Comma-separated entity types
    #[serde(default)]
    pub types: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Changed entities grouped by type
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullData {
    pub eventi: Vec<SyncEntity>,
    pub tasks: Vec<SyncEntity>,
    pub documenti: Vec<SyncEntity>,
}

impl PullData {
    pub fn group_mut(&mut self, entity_type: EntityType) -> &mut Vec<SyncEntity> {
        match entity_type {
            EntityType::Event => &mut self.eventi,
            EntityType::Task => &mut self.tasks,
            EntityType::Document => &mut self.documenti,
        }
    }

    pub fn len(&self) -> usize {
        self.eventi.len() + self.tasks.len() + self.documenti.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Response from pull operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullResponse {
    pub data: PullData,
    pub has_more: bool,
    /// Cursor to send as `last_sync` next time: the request time when the
    /// page is complete, the last delivered position when `has_more`
    pub timestamp: SyncCursor,
}

/// Request for a combined push-then-pull
#[derive(Debug, Clone, Deserialize)]
pub struct FullSyncRequest {
    pub device_id: String,
    #[serde(default)]
    pub last_sync: Option<String>,
    #[serde(default)]
    pub data: Vec<PushEntity>,
}

/// Pull half of a full sync
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullSyncPull {
    pub data: PullData,
    pub has_more: bool,
}

/// Response from full sync
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullSyncResponse {
    pub pull: FullSyncPull,
    pub conflicts: Vec<ConflictEntry>,
    pub acknowledged: Vec<PushResult>,
    pub timestamp: SyncCursor,
}

/// Query for device status
#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    pub device_id: String,
}

/// Per-type counters in the status report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub completed: i64,
    pub conflict: i64,
    pub resolved: i64,
}

/// Sync status for a device
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub last_sync: Option<DateTime<Utc>>,
    /// This device's conflicts awaiting resolution
    pub pending_items: i64,
    /// All unresolved conflicts of the user
    pub conflict_items: i64,
    pub stats_by_type: BTreeMap<EntityType, TypeStats>,
    pub is_online: bool,
}

/// Request to resolve a queued conflict
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub conflict_id: String,
    pub resolution: ResolutionStrategy,
    #[serde(default)]
    pub merged_data: Option<Value>,
}

/// Response from resolve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveResponse {
    pub resolved: bool,
    pub final_data: Option<Value>,
    /// Entity version after resolution; `None` when the entity no longer exists
    pub version: Option<i64>,
}

/// One chunk of a multi-request transfer
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub batch_id: String,
    pub batch_number: i64,
    pub total_batches: i64,
    #[serde(default)]
    pub entities: Vec<PushEntity>,
    pub device_id: String,
}

/// Acknowledgement of one chunk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResponse {
    pub batch_id: String,
    pub batch_number: i64,
    pub total_batches: i64,
    pub processed: i64,
    pub is_complete: bool,
    /// True when this chunk had already been accepted and nothing was re-applied
    pub replayed: bool,
    pub results: Vec<PushResult>,
    pub conflicts: Vec<ConflictEntry>,
}

/// Query for a stored batch session
#[derive(Debug, Clone, Deserialize)]
pub struct BatchQuery {
    pub batch_id: String,
}

/// Query for listing conflicts
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConflictsQuery {
    #[serde(default)]
    pub device_id: Option<String>,
}
