//! # maelstrom-storage
//!
//! Storage layer for maelstrom.
//!
//! This crate provides:
//! - The spec catalog over the registry directory
//! - Atomic instance files
//! - The instance lifecycle manager (create, deliver, describe, delete)

pub mod catalog;
pub mod error;
pub mod manager;
pub mod store;

pub use catalog::{version_from_filename, Catalog, CatalogListing, EntryKind};
pub use error::StorageError;
pub use manager::{Created, InstanceManager, InstanceStatus};
pub use store::InstanceStore;
