//! Durable per-area metadata for the Courier scheduler.
//!
//! Tables are partitioned by area: the normalized area name suffixes each
//! carfile/cache/block/download table. The store is the source of truth;
//! everything the scheduler keeps in memory is a cache of these rows.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::{BlockRepo, CacheRepo, CarfileRepo, DownloadRepo, NodeRepo, QuitNodeOutcome};
pub use store::{MetadataStore, SqliteStore, area_suffix};
