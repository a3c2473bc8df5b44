//! Per-workspace remote handle

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use crate::backend::{BackendError, BackendResult, LockError};
use crate::lock::{LockInfo, Locker};
use crate::store::{LockTable, ObjectStore, PutOptions};

/// Remote access to one workspace's state and lock.
///
/// Built by [`crate::Backend::remote_client`] for a single workspace and never
/// shared between workspaces.
#[derive(Clone)]
pub struct RemoteClient {
    store: Arc<dyn ObjectStore>,
    lock_table: Option<Arc<dyn LockTable>>,
    bucket: String,
    state_file: String,
    lock_file: String,
    put_options: PutOptions,
}

impl RemoteClient {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        lock_table: Option<Arc<dyn LockTable>>,
        bucket: String,
        state_file: String,
        lock_file: String,
        put_options: PutOptions,
    ) -> Self {
        Self {
            store,
            lock_table,
            bucket,
            state_file,
            lock_file,
            put_options,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn state_file(&self) -> &str {
        &self.state_file
    }

    pub fn lock_file(&self) -> &str {
        &self.lock_file
    }

    pub fn put_options(&self) -> &PutOptions {
        &self.put_options
    }

    /// Whether locks go through a lock table
    pub fn locking_enabled(&self) -> bool {
        self.lock_table.is_some()
    }

    /// Read the raw state object
    pub async fn get(&self) -> BackendResult<Option<Vec<u8>>> {
        self.store
            .get_object(&self.bucket, &self.state_file)
            .await
            .map_err(|e| BackendError::remote("get", &self.state_file, e))
    }

    /// Overwrite the raw state object
    pub async fn put(&self, body: Vec<u8>) -> BackendResult<()> {
        self.store
            .put_object(&self.bucket, &self.state_file, body, &self.put_options)
            .await
            .map_err(|e| BackendError::remote("put", &self.state_file, e))
    }

    /// Delete the state object and the lock object stored beside it
    pub async fn delete(&self) -> BackendResult<()> {
        self.store
            .delete_object(&self.bucket, &self.state_file)
            .await
            .map_err(|e| BackendError::remote("delete", &self.state_file, e))?;
        self.store
            .delete_object(&self.bucket, &self.lock_file)
            .await
            .map_err(|e| BackendError::remote("delete", &self.lock_file, e))
    }

    /// Current holder of this workspace's lock
    pub async fn lock_info(&self) -> BackendResult<Option<LockInfo>> {
        let Some(table) = &self.lock_table else {
            return Ok(None);
        };
        table
            .lock_info(&self.lock_file)
            .await
            .map_err(|source| BackendError::LockTable {
                path: self.lock_file.clone(),
                source,
            })
    }
}

#[async_trait]
impl Locker for RemoteClient {
    fn lock_path(&self) -> &str {
        &self.lock_file
    }

    async fn lock(&self, info: &LockInfo) -> Result<String, LockError> {
        let Some(table) = &self.lock_table else {
            warn!(
                "no lock table configured, {} proceeds without a lock on {}",
                info.operation, self.lock_file
            );
            return Ok(info.id.clone());
        };
        let info = info.clone().with_path(&self.lock_file);
        debug!("locking {} in {}", self.lock_file, table.table_name());
        table.lock(&self.lock_file, &info).await
    }

    async fn unlock(&self, lock_id: &str) -> Result<(), LockError> {
        match &self.lock_table {
            Some(table) => table.unlock(&self.lock_file, lock_id).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("bucket", &self.bucket)
            .field("state_file", &self.state_file)
            .field("lock_file", &self.lock_file)
            .field("put_options", &self.put_options)
            .field(
                "lock_table",
                &self.lock_table.as_ref().map(|t| t.table_name().to_string()),
            )
            .finish()
    }
}
