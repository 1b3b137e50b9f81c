//! Entry name validation.
//!
//! Cache directories are flat: every entry is a single file name directly
//! under the root. Names starting with a dot are reserved for in-progress
//! writes.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a cache entry name.
///
/// Accepts exactly one plain file name (a leading `./` is tolerated and
/// stripped). Rejects anything that would leave the cache root or create
/// subdirectories, hidden names, and null bytes.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use kura_storage::validate_entry;
/// assert_eq!(validate_entry("3a7bd3e2.jpg").unwrap(), Path::new("3a7bd3e2.jpg"));
/// assert_eq!(validate_entry("./3a7bd3e2").unwrap(), Path::new("3a7bd3e2"));
/// assert!(validate_entry("../etc/passwd").is_err());
/// assert!(validate_entry("nested/entry").is_err());
/// assert!(validate_entry(".3a7bd3e2.part").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let invalid = || ErrorKind::InvalidEntry(original.to_path_buf());
    let mut name = None;
    for component in original.components() {
        match component {
            Component::CurDir => {},
            Component::Normal(s) if name.is_none() => {
                let bytes = s.as_encoded_bytes();
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if bytes.contains(&0) || bytes.starts_with(b".") {
                    exn::bail!(invalid());
                }
                name = Some(s);
            },
            _ => exn::bail!(invalid()),
        }
    }
    match name {
        Some(name) => Ok(PathBuf::from(name)),
        None => exn::bail!(invalid()),
    }
}
