//! Write transactions that hold the SQLite write lock from the start
//!
//! A deferred transaction that reads before it writes has to upgrade its
//! snapshot to a write lock later. Under WAL that upgrade fails with
//! `SQLITE_BUSY` as soon as another connection has committed in between,
//! and the busy handler does not retry it. `BEGIN IMMEDIATE` takes the lock
//! up front, so concurrent writers queue on `busy_timeout` instead.

use std::ops::{Deref, DerefMut};

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};

use crate::error::Result;

/// A pooled connection inside `BEGIN IMMEDIATE ... COMMIT`
pub struct WriteTransaction {
    conn: Option<PoolConnection<Sqlite>>,
    open: bool,
}

impl WriteTransaction {
    /// Acquire a connection and take the write lock
    pub async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        Ok(Self {
            conn: Some(conn),
            open: true,
        })
    }

    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT").execute(&mut *self).await?;
        self.open = false;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK").execute(&mut *self).await?;
        self.open = false;
        Ok(())
    }

    /// Commit on `Ok`, roll back on `Err`, and pass the result through
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback().await {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                Err(e)
            }
        }
    }
}

impl Deref for WriteTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        self.conn
            .as_deref()
            .unwrap_or_else(|| unreachable!("connection is only taken on drop"))
    }
}

impl DerefMut for WriteTransaction {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        self.conn
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("connection is only taken on drop"))
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        // Dropped mid-transaction (cancelled request or failed COMMIT): close
        // the connection instead of returning it to the pool with the write
        // lock held. Closing rolls the transaction back.
        if self.open {
            if let Some(conn) = self.conn.take() {
                tracing::warn!("Write transaction dropped while open; closing its connection");
                drop(conn.detach());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;

    async fn file_pool(dir: &tempfile::TempDir) -> SqlitePool {
        let url = format!("sqlite://{}", dir.path().join("tx.db").display());
        create_pool(&url, 4).await.unwrap()
    }

    async fn count_tenants(pool: &SqlitePool) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM user_tenants")
            .fetch_one(pool)
            .await
            .unwrap();
        count
    }

    #[tokio::test]
    async fn test_finish_commits_ok_and_rolls_back_err() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir).await;

        let mut tx = WriteTransaction::begin(&pool).await.unwrap();
        let written: Result<()> =
            sqlx::query("INSERT INTO user_tenants (user_id, tenant_id) VALUES ('alice', 'acme')")
                .execute(&mut *tx)
                .await
                .map(|_| ())
                .map_err(Into::into);
        tx.finish(written).await.unwrap();
        assert_eq!(count_tenants(&pool).await, 1);

        let mut tx = WriteTransaction::begin(&pool).await.unwrap();
        sqlx::query("INSERT INTO user_tenants (user_id, tenant_id) VALUES ('bob', 'acme')")
            .execute(&mut *tx)
            .await
            .unwrap();
        let failed: Result<()> = Err(crate::error::AppError::validation("rejected"));
        assert!(tx.finish(failed).await.is_err());
        assert_eq!(count_tenants(&pool).await, 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_does_not_leak_lock() {
        let dir = tempfile::tempdir().unwrap();
        let pool = file_pool(&dir).await;

        {
            let mut tx = WriteTransaction::begin(&pool).await.unwrap();
            sqlx::query("INSERT INTO user_tenants (user_id, tenant_id) VALUES ('alice', 'acme')")
                .execute(&mut *tx)
                .await
                .unwrap();
        }

        // A fresh writer can still take the lock and the dropped write is gone
        let tx = WriteTransaction::begin(&pool).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(count_tenants(&pool).await, 0);
    }
}
