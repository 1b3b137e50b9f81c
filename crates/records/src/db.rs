//! In-memory database and snapshot plumbing.

use exn::{OptionExt, ResultExt};
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Connection, SqliteConnection};
use std::path::Path;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// The live record database.
///
/// It only ever exists in memory: durability comes from serializing the
/// whole database to a snapshot file ([`vacuum_into()`](Self::vacuum_into))
/// and loading it back on startup ([`restore_from()`](Self::restore_from)).
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open a fresh, empty in-memory database with the schema applied.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true)
            // There is no file to journal to.
            .journal_mode(SqliteJournalMode::Memory);
        let pool = SqlitePoolOptions::new()
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            // An in-memory database lives exactly as long as its connection:
            // one connection, never reaped, or the records vanish.
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[instrument("performing database migrations", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn sqlx_hates_paths(path: &Path) -> Result<&str> {
        path.to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))
    }

    /// Serialize the whole database into a new file at `path`.
    ///
    /// SQLite refuses to overwrite: `path` must not exist.
    pub async fn vacuum_into(&self, path: &Path) -> Result<()> {
        sqlx::query("VACUUM INTO ?")
            .bind(Self::sqlx_hates_paths(path)?)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::SnapshotIo(path.to_path_buf()))?;
        Ok(())
    }

    /// Copy every owner and asset out of the snapshot file at `path`.
    ///
    /// The copy is a single transaction: on error nothing was loaded. Returns
    /// the number of assets restored.
    #[instrument("restoring snapshot", skip(self, path), fields(path = %path.display()))]
    pub async fn restore_from(&self, path: &Path) -> Result<u64> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query("ATTACH DATABASE ? AS snapshot")
            .bind(Self::sqlx_hates_paths(path)?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Restore(path.to_path_buf()))?;
        let copied = Self::copy_snapshot(&mut conn).await;
        // Detach even when the copy failed; the connection is reused forever.
        let detached = sqlx::query("DETACH DATABASE snapshot").execute(&mut *conn).await;
        let copied = copied.or_raise(|| ErrorKind::Restore(path.to_path_buf()))?;
        detached.or_raise(|| ErrorKind::Database)?;
        Ok(copied)
    }

    async fn copy_snapshot(conn: &mut SqliteConnection) -> Result<u64> {
        let mut tx = conn.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/restore_snapshot.sql"))
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let (assets,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM assets").fetch_one(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        u64::try_from(assets).or_raise(|| ErrorKind::InvalidData("asset count"))
    }

    /// Close the database connection pool. The in-memory data is gone after this.
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}
