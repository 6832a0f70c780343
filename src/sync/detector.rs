//! Conflict detection
//!
//! The server is the single arbiter of an entity's current version: every
//! write goes through it, so comparing the client's base version to the
//! stored one is enough to spot concurrent edits.

use super::types::{OperationKind, SyncEntity, SyncOperation};

/// Outcome of checking one operation against the stored entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    NoConflict,
    Conflict {
        client_version: i64,
        server_version: i64,
    },
    /// The referenced entity does not exist (or is not visible)
    Missing,
}

/// Compares an operation's claimed version against the stored version
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        Self
    }

    /// Check `operation` against `current`, the stored entity it references.
    ///
    /// Creates never conflict. Otherwise a stored version newer than the
    /// client's base version is a conflict.
    pub fn detect(&self, operation: &SyncOperation, current: Option<&SyncEntity>) -> Detection {
        if operation.kind == OperationKind::Create || operation.server_id.is_none() {
            return Detection::NoConflict;
        }

        match current {
            None => Detection::Missing,
            Some(entity) if entity.version > operation.client_version => Detection::Conflict {
                client_version: operation.client_version,
                server_version: entity.version,
            },
            Some(_) => Detection::NoConflict,
        }
    }
}
