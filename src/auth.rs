//! Caller identity and tenant scoping
//!
//! Authentication happens upstream: the gateway that terminates sessions
//! forwards the authenticated user id in `X-User-Id`. The sync engine only
//! maps that user to the company (tenant) whose data they may see.

use std::collections::HashMap;

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use sqlx::SqlitePool;

use crate::error::{AppError, Result};

/// Header carrying the authenticated user id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id header".to_string()))?
            .to_str()
            .map_err(|_| AppError::Unauthorized("X-User-Id is not valid UTF-8".to_string()))?
            .trim();

        if user_id.is_empty() {
            return Err(AppError::Unauthorized("X-User-Id is empty".to_string()));
        }

        Ok(Identity {
            user_id: user_id.to_string(),
        })
    }
}

/// Visibility boundary for one request.
///
/// A row is visible when the caller owns it, or when it belongs to the
/// caller's company.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub user_id: String,
    pub tenant_id: Option<String>,
}

impl Scope {
    pub fn new(user_id: impl Into<String>, tenant_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id,
        }
    }

    pub fn personal(user_id: impl Into<String>) -> Self {
        Self::new(user_id, None)
    }
}

/// Maps an authenticated user to their tenant scope
#[async_trait]
pub trait TenantResolver: Send + Sync {
    async fn resolve(&self, user_id: &str) -> Result<Scope>;
}

/// Resolves tenants from the `user_tenants` table
#[derive(Clone)]
pub struct DbTenantResolver {
    pool: SqlitePool,
}

impl DbTenantResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Attach a user to a tenant (replaces any previous membership)
    pub async fn assign(&self, user_id: &str, tenant_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_tenants (user_id, tenant_id)
            VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET tenant_id = excluded.tenant_id
            "#,
        )
        .bind(user_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TenantResolver for DbTenantResolver {
    async fn resolve(&self, user_id: &str) -> Result<Scope> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT tenant_id FROM user_tenants WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(Scope::new(user_id, row.map(|(tenant,)| tenant)))
    }
}

/// Fixed user → tenant table, for tests and single-tenant deployments
#[derive(Debug, Clone, Default)]
pub struct StaticTenantResolver {
    tenants: HashMap<String, String>,
}

impl StaticTenantResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(mut self, user_id: &str, tenant_id: &str) -> Self {
        self.tenants
            .insert(user_id.to_string(), tenant_id.to_string());
        self
    }
}

#[async_trait]
impl TenantResolver for StaticTenantResolver {
    async fn resolve(&self, user_id: &str) -> Result<Scope> {
        Ok(Scope::new(user_id, self.tenants.get(user_id).cloned()))
    }
}
