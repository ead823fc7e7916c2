//! Beanstore
//!
//! In-memory document collections with named scalar and IVF vector indexes,
//! a similarity search executor and an administrative command surface.
//! Index definitions are kept in a durable catalog.

pub mod admin;
pub mod api;
pub mod catalog;
pub mod collection;
pub mod config;
pub mod database;
pub mod indexer;
pub mod ingest;
pub mod ivf;
pub mod metadata_filter;
pub mod metrics;
#[cfg(feature = "s3")]
pub mod minio;
pub mod model;
pub mod query;
pub mod scalar;

pub use config::Config;
pub use database::Database;
pub use errors::{Result, StoreError};
pub use model::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    pub const DEFAULT_TOP_K: usize = 5;
    pub const DEFAULT_BIND: &str = "0.0.0.0:8081";
    pub const DEFAULT_DATA_DIR: &str = "./data";
    pub const DEFAULT_BUCKET: &str = "vectors";
    /// Minimum vectors per IVF list before an index is trained.
    pub const MIN_POINTS_PER_LIST: usize = 39;
    pub const MAX_KMEANS_ITERATIONS: usize = 20;
}

/// Error types for the store
pub mod errors {
    pub type Result<T> = std::result::Result<T, StoreError>;

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("Validation error: {0}")]
        Validation(String),

        #[error("Index {name} already exists with a different definition")]
        Conflict { name: String },

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("No vector index on field {field} in collection {collection}")]
        IndexNotFound { collection: String, field: String },

        #[error("Dimension mismatch: expected {expected}, got {actual}")]
        DimensionMismatch { expected: usize, actual: usize },

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Serialization error: {0}")]
        Serialization(#[from] serde_json::Error),
    }

    impl StoreError {
        pub fn validation(msg: impl Into<String>) -> Self {
            StoreError::Validation(msg.into())
        }

        pub fn not_found(what: impl Into<String>) -> Self {
            StoreError::NotFound(what.into())
        }
    }
}
