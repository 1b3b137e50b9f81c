//! Storage for kura's cache directories.
//!
//! Both caches keep a flat directory of content-addressed entries
//! (`<sha256>`, `<sha256>.jpg`, `<sha256>.meta`). This crate owns every
//! filesystem operation on those directories: validated entry names, atomic
//! writes, tolerant deletes and size walks, and purging.

pub mod backend;
pub mod error;
mod models;
mod path;

pub use crate::backend::{LocalBackend, StorageBackend};
pub use crate::models::FileInfo;
pub use crate::path::validate as validate_entry;
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
