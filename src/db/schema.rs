//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the database schema
pub async fn initialize_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- User to company membership (tenant scope)
CREATE TABLE IF NOT EXISTS user_tenants (
    user_id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_user_tenants_tenant ON user_tenants(tenant_id);

-- Calendar events
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    owner_user_id TEXT NOT NULL,
    tenant_id TEXT,
    title TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_owner ON events(owner_user_id);
CREATE INDEX IF NOT EXISTS idx_events_tenant ON events(tenant_id);
CREATE INDEX IF NOT EXISTS idx_events_updated ON events(updated_at);

-- Tasks
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    owner_user_id TEXT NOT NULL,
    tenant_id TEXT,
    title TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_owner ON tasks(owner_user_id);
CREATE INDEX IF NOT EXISTS idx_tasks_tenant ON tasks(tenant_id);
CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated_at);

-- Documents (metadata only; file content is stored elsewhere)
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    owner_user_id TEXT NOT NULL,
    tenant_id TEXT,
    title TEXT NOT NULL,
    payload TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_user_id);
CREATE INDEX IF NOT EXISTS idx_documents_tenant ON documents(tenant_id);
CREATE INDEX IF NOT EXISTS idx_documents_updated ON documents(updated_at);

-- Conflict queue: one row per processed sync operation
CREATE TABLE IF NOT EXISTS sync_queue (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    device_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    client_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    client_version INTEGER NOT NULL,
    server_version INTEGER NOT NULL,
    data TEXT NOT NULL,
    status TEXT NOT NULL,
    conflict_resolution TEXT,
    resolved_data TEXT,
    batch_id TEXT,
    created_at TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    resolved_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_user_device ON sync_queue(user_id, device_id);
CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
CREATE INDEX IF NOT EXISTS idx_sync_queue_entity ON sync_queue(entity_type, entity_id);

-- Chunked transfer sessions
CREATE TABLE IF NOT EXISTS sync_batches (
    user_id TEXT NOT NULL,
    batch_id TEXT NOT NULL,
    batch_number INTEGER NOT NULL,
    total_batches INTEGER NOT NULL,
    entities_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'processing',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    PRIMARY KEY (user_id, batch_id)
);

-- Batch numbers already accepted, for idempotent re-delivery
CREATE TABLE IF NOT EXISTS sync_batch_parts (
    user_id TEXT NOT NULL,
    batch_id TEXT NOT NULL,
    batch_number INTEGER NOT NULL,
    entities_count INTEGER NOT NULL,
    processed_at TEXT NOT NULL,

    PRIMARY KEY (user_id, batch_id, batch_number)
);
"#;
