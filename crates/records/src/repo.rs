//! Queries against the asset and owner tables.
//!
//! Assets optionally belong to an owner. Linking an asset to an owner
//! upserts the owner row first (foreign key); deleting an owner detaches
//! whatever still references it.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{AssetRecord, AssetRow, OwnerId, OwnerUsage, UsageRow};
use exn::ResultExt;
use sqlx::{SqliteConnection, SqlitePool};
use time::UtcDateTime;

fn to_i64(value: u64, what: &'static str) -> Result<i64> {
    i64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

fn to_u64(value: i64, what: &'static str) -> Result<u64> {
    u64::try_from(value).or_raise(|| ErrorKind::InvalidData(what))
}

#[derive(Debug, Clone)]
pub(crate) struct Repository {
    pool: SqlitePool,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone() }
    }
}
impl Repository {
    async fn upsert_owner(conn: &mut SqliteConnection, owner: &OwnerId, seen_at: UtcDateTime) -> Result<()> {
        sqlx::query(include_str!("../queries/upsert_owner.sql"))
            .bind(owner.to_string())
            .bind(owner.collection())
            .bind(owner.item())
            .bind(seen_at.unix_timestamp())
            .execute(conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Insert/Update
    // =========================================================================

    /// Insert or replace the record for `record.url`.
    ///
    /// A record without an owner keeps whatever owner is already linked.
    pub(crate) async fn upsert(&self, record: &AssetRecord) -> Result<()> {
        let row = AssetRow::try_from(record)?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        if let Some(owner) = &record.owner {
            Self::upsert_owner(&mut tx, owner, record.cached_at).await?;
        }
        sqlx::query(include_str!("../queries/upsert_asset.sql"))
            .bind(row.url)
            .bind(row.content_hash)
            .bind(row.owner_id)
            .bind(row.size_bytes)
            .bind(row.cached_at)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Refresh `cached_at`. Returns `false` if there is no such record.
    pub(crate) async fn touch(&self, url: &str, at: UtcDateTime) -> Result<bool> {
        let result = sqlx::query("UPDATE assets SET cached_at = ? WHERE url = ?")
            .bind(at.unix_timestamp())
            .bind(url)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Point an existing record at `owner`. Returns `false` (and changes
    /// nothing) if there is no such record or it is already linked.
    pub(crate) async fn link_owner(&self, url: &str, owner: &OwnerId, at: UtcDateTime) -> Result<bool> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Self::upsert_owner(&mut tx, owner, at).await?;
        let result = sqlx::query("UPDATE assets SET owner_id = ?1 WHERE url = ?2 AND owner_id IS NOT ?1")
            .bind(owner.to_string())
            .bind(url)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            // Dropping the transaction rolls back the owner upsert.
            return Ok(false);
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(true)
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    pub(crate) async fn get(&self, url: &str) -> Result<Option<AssetRecord>> {
        let row: Option<AssetRow> = sqlx::query_as("SELECT * FROM assets WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(AssetRecord::try_from).transpose()
    }

    pub(crate) async fn list_owner(&self, owner: &OwnerId) -> Result<Vec<AssetRecord>> {
        let rows: Vec<AssetRow> = sqlx::query_as("SELECT * FROM assets WHERE owner_id = ? ORDER BY cached_at, rowid")
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(AssetRecord::try_from).collect()
    }

    /// Least recently cached first; ties keep insertion order.
    pub(crate) async fn oldest(&self, limit: u64) -> Result<Vec<AssetRecord>> {
        let rows: Vec<AssetRow> = sqlx::query_as("SELECT * FROM assets ORDER BY cached_at ASC, rowid ASC LIMIT ?")
            .bind(to_i64(limit, "limit")?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(AssetRecord::try_from).collect()
    }

    pub(crate) async fn sum_size(&self) -> Result<u64> {
        let (total,): (i64,) = sqlx::query_as("SELECT COALESCE(SUM(size_bytes), 0) FROM assets")
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        to_u64(total, "size")
    }

    pub(crate) async fn count(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM assets").fetch_one(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        to_u64(count, "asset count")
    }

    /// Usage per known owner, largest first.
    pub(crate) async fn owner_usage(&self) -> Result<Vec<OwnerUsage>> {
        let rows: Vec<UsageRow> = sqlx::query_as(include_str!("../queries/owner_usage.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(OwnerUsage::try_from).collect()
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Returns `false` if there was no such record.
    pub(crate) async fn delete(&self, url: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assets WHERE url = ?")
            .bind(url)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every asset record linked to `owner`, then the owner itself.
    /// Returns the number of asset records deleted.
    pub(crate) async fn delete_owner(&self, owner: &OwnerId) -> Result<u64> {
        let owner = owner.to_string();
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let assets = sqlx::query("DELETE FROM assets WHERE owner_id = ?")
            .bind(&owner)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?
            .rows_affected();
        sqlx::query("DELETE FROM owners WHERE owner_id = ?")
            .bind(&owner)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(assets)
    }

    /// Delete everything. Returns the number of asset records deleted.
    pub(crate) async fn clear(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let assets =
            sqlx::query("DELETE FROM assets").execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?.rows_affected();
        sqlx::query("DELETE FROM owners").execute(&mut *tx).await.or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(assets)
    }
}
