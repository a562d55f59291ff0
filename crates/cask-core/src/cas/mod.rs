//! Content-addressable storage: one copy of each unique file content,
//! shared across every package version ever fetched into the store.

mod integrity;
mod store;

pub use integrity::{compute_integrity, verify_integrity, HashAlgorithm, IntegrityHash};
pub use store::{content_hash, ContentStore};
