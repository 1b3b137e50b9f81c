use crate::error::{Error, ErrorKind};
use crate::models::OwnerId;
use exn::ResultExt;
use time::UtcDateTime;

/// One cached full-quality image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    /// Source URL, the record's key
    pub url: String,
    /// Hex SHA-256 of the URL, used as the file name
    pub content_hash: String,
    pub owner: Option<OwnerId>,
    /// Size of the file on disk
    pub size_bytes: u64,
    /// Last write or cache hit; eviction removes the oldest first
    pub cached_at: UtcDateTime,
}

impl AssetRecord {
    /// A record stamped with the current time and no owner.
    pub fn new(url: impl Into<String>, content_hash: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            url: url.into(),
            content_hash: content_hash.into(),
            owner: None,
            size_bytes,
            cached_at: UtcDateTime::now(),
        }
    }

    pub fn with_owner(mut self, owner: Option<OwnerId>) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_cached_at(mut self, cached_at: UtcDateTime) -> Self {
        self.cached_at = cached_at;
        self
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct AssetRow {
    pub(crate) url: String,
    pub(crate) content_hash: String,
    pub(crate) owner_id: Option<String>,
    pub(crate) size_bytes: i64,
    pub(crate) cached_at: i64,
}
impl TryFrom<&AssetRecord> for AssetRow {
    type Error = Error;
    fn try_from(record: &AssetRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            url: record.url.clone(),
            content_hash: record.content_hash.clone(),
            owner_id: record.owner.as_ref().map(ToString::to_string),
            size_bytes: i64::try_from(record.size_bytes).or_raise(|| ErrorKind::InvalidData("size"))?,
            cached_at: record.cached_at.unix_timestamp(),
        })
    }
}
impl TryFrom<AssetRow> for AssetRecord {
    type Error = Error;
    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        Ok(Self {
            url: row.url,
            content_hash: row.content_hash,
            owner: row
                .owner_id
                .map(|owner| owner.parse::<OwnerId>())
                .transpose()
                .or_raise(|| ErrorKind::InvalidData("owner id"))?,
            size_bytes: u64::try_from(row.size_bytes).or_raise(|| ErrorKind::InvalidData("size"))?,
            cached_at: UtcDateTime::from_unix_timestamp(row.cached_at)
                .or_raise(|| ErrorKind::InvalidData("cache date"))?,
        })
    }
}
