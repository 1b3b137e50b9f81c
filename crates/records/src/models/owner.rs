use crate::error::{Error, ErrorKind};
use exn::ResultExt;
use std::fmt;
use std::str::FromStr;
use time::UtcDateTime;

/// Composite key grouping cached assets, written as `collection:item`
/// (for example `"manga-42:chapter-7"`).
///
/// The string is split on the first `:`, so the item half may itself contain
/// colons. Both halves must be non-empty.
///
/// ```
/// use kura_records::OwnerId;
///
/// let owner: OwnerId = "manga-42:chapter:7".parse().unwrap();
/// assert_eq!(owner.collection(), "manga-42");
/// assert_eq!(owner.item(), "chapter:7");
/// assert_eq!(owner.to_string(), "manga-42:chapter:7");
/// assert!("no-separator".parse::<OwnerId>().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId {
    collection: String,
    item: String,
}

impl OwnerId {
    pub fn new(collection: impl Into<String>, item: impl Into<String>) -> Result<Self, Error> {
        let (collection, item) = (collection.into(), item.into());
        if collection.is_empty() || item.is_empty() || collection.contains(':') {
            exn::bail!(ErrorKind::InvalidOwner(format!("{collection}:{item}")));
        }
        Ok(Self { collection, item })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn item(&self) -> &str {
        &self.item
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.item)
    }
}

impl FromStr for OwnerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((collection, item)) => Self::new(collection, item),
            None => exn::bail!(ErrorKind::InvalidOwner(s.to_string())),
        }
    }
}

/// Aggregate disk usage of one owner's assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerUsage {
    pub owner: OwnerId,
    pub assets: u64,
    pub size_bytes: u64,
    pub last_seen_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
pub(crate) struct UsageRow {
    owner_id: String,
    assets: i64,
    size_bytes: i64,
    last_seen_at: i64,
}
impl TryFrom<UsageRow> for OwnerUsage {
    type Error = Error;
    fn try_from(row: UsageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            owner: row.owner_id.parse::<OwnerId>().or_raise(|| ErrorKind::InvalidData("owner id"))?,
            assets: u64::try_from(row.assets).or_raise(|| ErrorKind::InvalidData("asset count"))?,
            size_bytes: u64::try_from(row.size_bytes).or_raise(|| ErrorKind::InvalidData("size"))?,
            last_seen_at: UtcDateTime::from_unix_timestamp(row.last_seen_at)
                .or_raise(|| ErrorKind::InvalidData("last seen date"))?,
        })
    }
}
