//! Bidirectional sync between offline clients and the server
//!
//! # Protocol
//!
//! 1. Client pushes local creates/updates/deletes, each carrying the version
//!    it last saw
//! 2. Server applies every operation whose version is current and queues a
//!    conflict record for every stale one
//! 3. Client pulls entities changed since its last cursor
//! 4. Client settles queued conflicts with an explicit strategy
//!    (`client_wins`, `server_wins`, `merge`)
//!
//! Every processed operation leaves a row in the sync queue, which doubles
//! as the audit trail behind the status report.

mod batch;
mod coordinator;
mod detector;
mod payload;
mod queue;
mod resolver;
mod types;

pub use batch::BatchTracker;
pub use coordinator::SyncCoordinator;
pub use detector::{ConflictDetector, Detection};
pub use payload::{
    DocumentPayload, DocumentStatus, EntityPayload, EventPayload, TaskPayload, TaskPriority,
    TaskStatus,
};
pub use queue::ConflictQueue;
pub use resolver::ConflictResolver;
pub use types::{
    parse_sync_cursor, BatchQuery, BatchRequest, BatchResponse, BatchSession, BatchStatus,
    ConflictData, ConflictEntry, ConflictRecord, ConflictsQuery, EntityType, FullSyncPull,
    FullSyncRequest, FullSyncResponse, OperationKind, PullData, PullQuery, PullResponse,
    PushEntity, PushRequest, PushResponse, PushResult, RecordStatus, ResolutionStrategy,
    ResolveRequest, ResolveResponse, StatusQuery, SyncCursor, SyncEntity, SyncOperation,
    SyncStatus, TypeStats,
};
