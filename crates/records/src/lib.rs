//! Durable record store for the asset cache.
//!
//! Records live in an in-memory SQLite database; durability comes from
//! periodically serializing the whole database to a single snapshot file.
//! The snapshot is the only thing on disk and is never trusted blindly:
//!
//! - **Flush**: `VACUUM INTO` a temporary sibling, read it back, check the
//!   SQLite header magic and that the file length matches the length its
//!   header declares, `fsync`, then rename over the canonical file.
//! - **Startup**: discard a leftover temporary file, validate the canonical
//!   file the same way, quarantine it (`.corrupt.<unix seconds>`) if it fails,
//!   otherwise back it up (`.backup`) and load it.
//!
//! Flushes are debounced after every mutation and coordinated by a
//! single-flight state machine, so they never overlap and a request made
//! while one is running is never dropped.

mod db;
pub mod error;
mod models;
mod repo;
mod snapshot;
mod store;

pub(crate) use crate::db::Database;
pub use crate::models::{AssetRecord, OwnerId, OwnerUsage};
pub use crate::store::{DEFAULT_FLUSH_DEBOUNCE, RecordStore, StoreHandle, StoreOptions};
