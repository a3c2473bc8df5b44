//! Fault-injecting wrappers around the in-memory clients

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::backend::{ClientError, LockError};
use crate::backends::memory::{MemoryLockTable, MemoryObjectStore};
use crate::lock::LockInfo;
use crate::store::{ListRequest, LockTable, ObjectListing, ObjectStore, PutOptions};

/// Object store that can be told to fail or to serve stale listings
#[derive(Debug, Default)]
pub(crate) struct FaultyStore {
    pub(crate) inner: MemoryObjectStore,
    /// Number of listing pages served before listing fails
    list_budget: AtomicUsize,
    limit_lists: AtomicBool,
    hide_listing: AtomicBool,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl FaultyStore {
    pub(crate) const PUT_FAILURE: &'static str = "injected put failure";

    pub(crate) fn new(inner: MemoryObjectStore) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub(crate) fn fail_list_after(&self, pages: usize) {
        self.list_budget.store(pages, Ordering::SeqCst);
        self.limit_lists.store(true, Ordering::SeqCst);
    }

    pub(crate) fn hide_listing(&self) {
        self.hide_listing.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_puts(&self) {
        self.fail_puts.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn list_objects(
        &self,
        bucket: &str,
        request: &ListRequest,
    ) -> Result<ObjectListing, ClientError> {
        if self.limit_lists.load(Ordering::SeqCst) {
            let remaining = self.list_budget.load(Ordering::SeqCst);
            if remaining == 0 {
                return Err(ClientError::new("injected list failure"));
            }
            self.list_budget.store(remaining - 1, Ordering::SeqCst);
        }
        if self.hide_listing.load(Ordering::SeqCst) {
            return Ok(ObjectListing::default());
        }
        self.inner.list_objects(bucket, request).await
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        self.inner.get_object(bucket, key).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<(), ClientError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ClientError::new(Self::PUT_FAILURE));
        }
        self.inner.put_object(bucket, key, body, options).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ClientError::new("injected delete failure"));
        }
        self.inner.delete_object(bucket, key).await
    }
}

/// Lock table that counts calls and can be told to fail
#[derive(Debug)]
pub(crate) struct FaultyLockTable {
    pub(crate) inner: MemoryLockTable,
    describe_fails: AtomicBool,
    unlock_fails: AtomicBool,
    describes: AtomicUsize,
    locks: AtomicUsize,
    unlocks: AtomicUsize,
}

impl FaultyLockTable {
    pub(crate) const UNLOCK_FAILURE: &'static str = "injected unlock failure";

    pub(crate) fn new(inner: MemoryLockTable) -> Self {
        Self {
            inner,
            describe_fails: AtomicBool::new(false),
            unlock_fails: AtomicBool::new(false),
            describes: AtomicUsize::new(0),
            locks: AtomicUsize::new(0),
            unlocks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_describe(&self) {
        self.describe_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_unlock(&self) {
        self.unlock_fails.store(true, Ordering::SeqCst);
    }

    pub(crate) fn restore_unlock(&self) {
        self.unlock_fails.store(false, Ordering::SeqCst);
    }

    pub(crate) fn describe_calls(&self) -> usize {
        self.describes.load(Ordering::SeqCst)
    }

    pub(crate) fn lock_calls(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    pub(crate) fn unlock_calls(&self) -> usize {
        self.unlocks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockTable for FaultyLockTable {
    fn table_name(&self) -> &str {
        self.inner.table_name()
    }

    async fn describe_table(&self) -> Result<(), ClientError> {
        self.describes.fetch_add(1, Ordering::SeqCst);
        if self.describe_fails.load(Ordering::SeqCst) {
            return Err(ClientError::new("injected describe failure"));
        }
        self.inner.describe_table().await
    }

    async fn lock(&self, key: &str, info: &LockInfo) -> Result<String, LockError> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        self.inner.lock(key, info).await
    }

    async fn unlock(&self, key: &str, lock_id: &str) -> Result<(), LockError> {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        if self.unlock_fails.load(Ordering::SeqCst) {
            return Err(ClientError::new(Self::UNLOCK_FAILURE).into());
        }
        self.inner.unlock(key, lock_id).await
    }

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        self.inner.lock_info(key).await
    }
}
