//! Client traits for the object store and the lock table
//!
//! The backend never talks to a cloud SDK directly. Everything it needs from
//! the outside world goes through these two traits, which the implementations
//! in [`crate::backends`] provide.

use async_trait::async_trait;

use crate::backend::{ClientError, LockError};
use crate::lock::LockInfo;

/// Maximum number of keys requested per listing page
pub const LIST_PAGE_SIZE: usize = 1000;

/// One request for a page of object keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: String,
    pub max_keys: usize,
    /// Return only keys sorting after this one
    pub marker: Option<String>,
}

impl ListRequest {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            max_keys: LIST_PAGE_SIZE,
            marker: None,
        }
    }

    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }
}

/// A page of object keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectListing {
    pub keys: Vec<String>,
    /// More keys exist after the last one in this page
    pub is_truncated: bool,
}

/// Per-write settings applied by the object store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutOptions {
    /// Server-side encryption algorithm ("AES256", "aws:kms")
    pub server_side_encryption: Option<String>,
    pub kms_key_id: Option<String>,
    /// Canned ACL ("private", "bucket-owner-full-control", ...)
    pub acl: Option<String>,
    pub content_type: Option<String>,
}

/// Flat key/value object storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List keys under `request.prefix` in lexicographic order
    async fn list_objects(
        &self,
        bucket: &str,
        request: &ListRequest,
    ) -> Result<ObjectListing, ClientError>;

    /// Read an object; `None` when the key does not exist
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ClientError>;

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<(), ClientError>;

    /// Delete an object; deleting a missing key succeeds
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError>;
}

/// Strongly-consistent lock storage with one lock per key
#[async_trait]
pub trait LockTable: Send + Sync {
    /// Identifier of the table, used in error messages
    fn table_name(&self) -> &str;

    /// Readiness probe; must succeed before any lock is attempted
    async fn describe_table(&self) -> Result<(), ClientError>;

    /// Take the lock for `key`, returning the lock ID
    async fn lock(&self, key: &str, info: &LockInfo) -> Result<String, LockError>;

    /// Release the lock for `key` if it is held under `lock_id`
    async fn unlock(&self, key: &str, lock_id: &str) -> Result<(), LockError>;

    /// Current holder of the lock for `key`
    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>, LockError>;
}
