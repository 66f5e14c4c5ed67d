//! Storage backends for delivery persistence
//!
//! This module provides a trait-based abstraction for the records the
//! delivery components share: delivery records, SLA samples, the fallback
//! pool and raised alerts.
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database with WAL mode
//! - **In-Memory**: No persistence, for testing and dry runs
//!
//! ## Usage
//!
//! ```no_run
//! use daily_dispatch::storage::{DeliveryStore, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./dispatch.db").await?;
//!     println!("{}", backend.get_stats().await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

pub use backend::{DeliveryStore, HealthStatus};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::{
    Alert, AlertKind, CandidateQuery, DeliveryRecord, FallbackContentEntry, FallbackUsage,
    Severity, SlaMetricRecord,
};

use crate::config::StorageConfig;

/// Open the backend selected by `config`.
pub async fn open(config: &StorageConfig) -> StorageResult<Arc<dyn DeliveryStore>> {
    match config {
        StorageConfig::None => {
            info!("using in-memory storage, nothing will be persisted");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite { path } => Ok(Arc::new(sqlite::SqliteBackend::new(path).await?)),
        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StorageError::InvalidConfig(
            "built without the storage-sqlite feature".to_string(),
        )),
    }
}
