//! Client implementations for state storage

pub mod local;
pub mod memory;
mod s3;

pub use local::{LocalLockTable, LocalObjectStore};
pub use memory::{MemoryLockTable, MemoryObjectStore};
pub use s3::{S3LockTable, S3ObjectStore};

use std::sync::Arc;

use crate::backend::{BackendConfig, BackendError, BackendResult};
use crate::remote::Backend;
use crate::store::{LockTable, ObjectStore};

/// Create a backend from configuration
///
/// This function builds the object store and, when the configuration names
/// one, the lock table for the configured backend type.
pub async fn create_backend(config: BackendConfig) -> BackendResult<Backend> {
    let config = config.validate()?;
    let locking = config.lock_table_configured();

    let (store, lock_table): (Arc<dyn ObjectStore>, Option<Arc<dyn LockTable>>) =
        match config.backend_type.as_str() {
            "s3" => {
                let store = S3ObjectStore::from_config(&config).await;
                let lock_table = if locking {
                    Some(Arc::new(S3LockTable::from_config(&config).await) as Arc<dyn LockTable>)
                } else {
                    None
                };
                (Arc::new(store), lock_table)
            }
            "local" => {
                let store = LocalObjectStore::from_config(&config);
                let bucket_dir = store.root().join(&config.bucket);
                std::fs::create_dir_all(&bucket_dir).map_err(|e| {
                    BackendError::configuration(format!(
                        "Failed to create bucket directory {}: {}",
                        bucket_dir.display(),
                        e
                    ))
                })?;
                let lock_table = if locking {
                    Some(Arc::new(LocalLockTable::from_config(&config)?) as Arc<dyn LockTable>)
                } else {
                    None
                };
                (Arc::new(store), lock_table)
            }
            "memory" => {
                let lock_table = if locking {
                    Some(Arc::new(MemoryLockTable::new(&config.lock_table)) as Arc<dyn LockTable>)
                } else {
                    None
                };
                (
                    Arc::new(MemoryObjectStore::with_bucket(&config.bucket)),
                    lock_table,
                )
            }
            other => return Err(BackendError::unsupported_backend(other)),
        };

    Backend::new(config, store, lock_table)
}
