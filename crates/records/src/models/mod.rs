mod asset;
mod owner;

pub(crate) use self::asset::AssetRow;
pub use self::asset::AssetRecord;
pub(crate) use self::owner::UsageRow;
pub use self::owner::{OwnerId, OwnerUsage};
