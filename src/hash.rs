use sha2::{Digest, Sha256};

/// File name of a cached resource: the lowercase hex SHA-256 of its URL.
///
/// ```
/// assert_eq!(
///     kura::content_hash("abc"),
///     "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
/// );
/// ```
pub fn content_hash(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}
