//! SQLite-backed point-cloud storage with composable filtered views.
//!
//! A `PointCloudStore` owns one connection. Filters on views are materialized into
//! temporary tables that the store caches by query text, so repeated and nested views
//! reuse each other's work.

pub mod cache;
pub mod composer;
pub mod config;
pub mod datastore;
pub mod decode;
pub mod diagnostics;
pub mod filter;
pub mod hasher;
pub mod migration;
pub mod schema;
pub mod spatial;
pub mod store;
pub mod view;

pub use pointcloud_core::*;

pub use cache::{CacheHit, CachePin, TemporaryResultCache};
pub use composer::{QueryComposer, Selection, attribute_cache_key, query_cache_key};
pub use config::{
    CacheConfig, DatabaseConfig, DiagnosticsConfig, IngestConfig, StoreConfig, StoreSettings,
};
pub use datastore::{default_sqlite_path, load_or_init_config, open_store};
pub use decode::{Decoded, Decoder};
pub use diagnostics::{DiagnosticsContext, DiagnosticsSnapshot, StatementRecord};
pub use filter::FilterMode;
pub use hasher::{ContentHash, hash_bytes, hash_query_result};
pub use migration::Migrator;
pub use schema::SchemaVersion;
pub use store::{PointCloudStore, TransactionGuard};
pub use view::{FilterView, ValueCombination, ViewArena, ViewId, ViewState};
