//! Object storage backends and signed read URLs

pub mod backend;
pub mod config;
pub mod local;
pub mod memory;
pub mod signing;

pub use backend::{content_type_for_key, extension_for, validate_key, ObjectStore};
pub use config::{StorageConfig, StorageType};
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use signing::UrlSigner;
