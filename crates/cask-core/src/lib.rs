//! Core library for Cask: content-addressable package store, integrity
//! index, fetcher, store controller, and the HTTP server/client pair.
//! Used by the CLI binary; can be embedded by other tools.

pub mod cas;
pub mod client;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod fetcher;
pub mod index;
pub mod resolve;
pub mod server;
pub mod store;
pub mod upload;
pub mod util;

// Re-export main API for CLI
pub use cas::{compute_integrity, content_hash, verify_integrity, ContentStore};
pub use client::{connect_store_controller, RemoteStore};
pub use config::{default_store_dir, load_config, RetryPolicy, ServerSettings, StoreConfig};
pub use error::StoreError;
pub use fetcher::{FetchedPackage, Fetcher, ResolvedFrom};
pub use index::{FileIndexEntry, PackageIndex, SideEffectsEntry};
pub use resolve::{RegistryResolver, Resolution, ResolvedPackage, Resolver, WantedPackage};
pub use server::{create_server, ServerState, StoreServer};
pub use store::{
    create_package_store, BundledManifest, FetchPackageParams, FetchResult, ManifestRequest,
    PackageStore, PkgDescriptor, PruneReport, RequestOptions, StoreController,
};
pub use upload::{upload_side_effects, UploadOptions};
pub use util::{log, log_error};
