//! In-memory object store and lock table
//!
//! Nothing survives the process. Useful for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::backend::{ClientError, LockError};
use crate::lock::LockInfo;
use crate::store::{ListRequest, LockTable, ObjectListing, ObjectStore, PutOptions};

type Buckets = HashMap<String, BTreeMap<String, Vec<u8>>>;

/// Object store holding every bucket in a map
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<Buckets>,
    lists: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with one empty bucket
    pub fn with_bucket(bucket: &str) -> Self {
        let store = Self::new();
        store.create_bucket(bucket);
        store
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.buckets().entry(bucket.to_string()).or_default();
    }

    fn buckets(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keys currently stored in `bucket`, in order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.buckets()
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.buckets()
            .get(bucket)
            .is_some_and(|objects| objects.contains_key(key))
    }

    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Total number of calls served
    pub fn call_count(&self) -> usize {
        self.list_count() + self.get_count() + self.put_count() + self.delete_count()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        request: &ListRequest,
    ) -> Result<ObjectListing, ClientError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let buckets = self.buckets();
        let Some(objects) = buckets.get(bucket) else {
            return Err(ClientError::new(format!("bucket not found: {}", bucket)));
        };

        let mut matching = objects
            .keys()
            .filter(|key| key.starts_with(&request.prefix))
            .filter(|key| {
                request
                    .marker
                    .as_deref()
                    .is_none_or(|marker| key.as_str() > marker)
            });

        let keys: Vec<String> = matching.by_ref().take(request.max_keys).cloned().collect();
        let is_truncated = matching.next().is_some();
        Ok(ObjectListing { keys, is_truncated })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .buckets()
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _options: &PutOptions,
    ) -> Result<(), ClientError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.buckets()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), body);
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if let Some(objects) = self.buckets().get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }
}

/// Lock table holding one entry per lock key
#[derive(Debug)]
pub struct MemoryLockTable {
    name: String,
    locks: Mutex<HashMap<String, LockInfo>>,
}

impl MemoryLockTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, LockInfo>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn held_count(&self) -> usize {
        self.locks().len()
    }
}

#[async_trait]
impl LockTable for MemoryLockTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn describe_table(&self) -> Result<(), ClientError> {
        Ok(())
    }

    async fn lock(&self, key: &str, info: &LockInfo) -> Result<String, LockError> {
        let mut locks = self.locks();
        if let Some(existing) = locks.get(key)
            && !existing.is_expired()
        {
            return Err(LockError::Held(existing.clone()));
        }
        locks.insert(key.to_string(), info.clone());
        Ok(info.id.clone())
    }

    async fn unlock(&self, key: &str, lock_id: &str) -> Result<(), LockError> {
        let mut locks = self.locks();
        match locks.get(key) {
            None => Err(LockError::NotFound(lock_id.to_string())),
            Some(existing) if existing.id != lock_id => Err(LockError::Mismatch {
                expected: lock_id.to_string(),
                actual: existing.id.clone(),
            }),
            Some(_) => {
                locks.remove(key);
                Ok(())
            }
        }
    }

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        Ok(self.locks().get(key).cloned())
    }
}
