//! Local filesystem object store and lock table
//!
//! Buckets are directories under a root; object keys are relative paths
//! inside them. The lock table is a directory of JSON lock files created
//! exclusively, so two processes on the same machine cannot both hold a lock.
//! Lock files are only created or removed under an advisory lock on the
//! table's guard file.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::FileExt;
use log::debug;
use tempfile::NamedTempFile;

use crate::backend::{BackendConfig, BackendError, BackendResult, ClientError, LockError};
use crate::lock::LockInfo;
use crate::store::{ListRequest, LockTable, ObjectListing, ObjectStore, PutOptions};

/// Map a key onto a path below `root`, refusing anything that would escape it
fn key_path(root: &Path, key: &str) -> Result<PathBuf, ClientError> {
    let mut path = root.to_path_buf();
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(ClientError::new(format!("invalid object key: {}", key)));
        }
        path.push(segment);
    }
    Ok(path)
}

/// Object store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Default root directory
    pub const DEFAULT_ROOT: &'static str = ".cairn";

    /// Directory below the root holding writes in progress; never a bucket
    pub const STAGING_DIR: &'static str = ".staging";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a LocalObjectStore from configuration
    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_ROOT)),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, ClientError> {
        if bucket == Self::STAGING_DIR {
            return Err(ClientError::new(format!("reserved bucket name: {}", bucket)));
        }
        key_path(&self.root, bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ClientError> {
        key_path(&self.bucket_dir(bucket)?, key)
    }
}

/// Collect every file below `dir` as a '/'-separated key relative to `base`
fn collect_keys(base: &Path, dir: &Path, keys: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_keys(base, &path, keys)?;
        } else if let Ok(relative) = path.strip_prefix(base) {
            let segments: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            keys.push(segments.join("/"));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        request: &ListRequest,
    ) -> Result<ObjectListing, ClientError> {
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Err(ClientError::new(format!("bucket not found: {}", bucket)));
        }

        let mut keys = Vec::new();
        collect_keys(&dir, &dir, &mut keys).map_err(|e| {
            ClientError::new(format!("Failed to list {}: {}", dir.display(), e)).with_cause(e)
        })?;
        keys.sort();

        let mut matching = keys.into_iter().filter(|key| {
            key.starts_with(&request.prefix)
                && request
                    .marker
                    .as_deref()
                    .is_none_or(|marker| key.as_str() > marker)
        });
        let page: Vec<String> = matching.by_ref().take(request.max_keys).collect();
        let is_truncated = matching.next().is_some();

        Ok(ObjectListing {
            keys: page,
            is_truncated,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ClientError::new(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))
            .with_cause(e)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _options: &PutOptions,
    ) -> Result<(), ClientError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // staged outside every bucket, so an interrupted write is never listed
        let staging_dir = self.root.join(Self::STAGING_DIR);
        fs::create_dir_all(&staging_dir)?;
        let mut staged = NamedTempFile::new_in(&staging_dir)?;
        staged.write_all(&body).map_err(|e| {
            ClientError::new(format!("Failed to write {}: {}", path.display(), e)).with_cause(e)
        })?;
        staged.persist(&path).map_err(|e| {
            ClientError::new(format!("Failed to write {}: {}", path.display(), e.error))
                .with_cause(e.error)
        })?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::new(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))
            .with_cause(e)),
        }
    }
}

/// Lock table stored as files in a local directory
#[derive(Debug, Clone)]
pub struct LocalLockTable {
    name: String,
    dir: PathBuf,
}

impl LocalLockTable {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
        }
    }

    /// Lock table directory `<root>/<lock_table>` for a local configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let root = config
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(LocalObjectStore::DEFAULT_ROOT));
        let dir = key_path(&root, &config.lock_table).map_err(|e| {
            BackendError::configuration(format!("invalid lock_table: {}", e))
        })?;
        Ok(Self::new(&config.lock_table, dir))
    }

    /// File every contender locks before touching lock files
    pub const GUARD_FILE: &'static str = ".guard";

    fn lock_path(&self, key: &str) -> Result<PathBuf, ClientError> {
        key_path(&self.dir, key)
    }

    /// Take the table-wide advisory lock; released when the file is dropped
    fn guard(&self) -> Result<File, ClientError> {
        let path = self.dir.join(Self::GUARD_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                ClientError::new(format!("Failed to open {}: {}", path.display(), e)).with_cause(e)
            })?;
        file.lock_exclusive().map_err(|e| {
            ClientError::new(format!("Failed to lock {}: {}", path.display(), e)).with_cause(e)
        })?;
        Ok(file)
    }

    fn read_lock(&self, path: &Path) -> Result<Option<LockInfo>, ClientError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ClientError::new(format!("Failed to read lock file: {}", e))
                    .with_cause(e));
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ClientError::new(format!("Failed to parse lock file: {}", e)).with_cause(e))
    }

    /// Create the lock file, failing if it already exists
    fn create_lock(&self, path: &Path, info: &LockInfo) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(info)?;
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(&content)?;
        file.sync_all()
    }
}

#[async_trait]
impl LockTable for LocalLockTable {
    fn table_name(&self) -> &str {
        &self.name
    }

    async fn describe_table(&self) -> Result<(), ClientError> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(ClientError::new(format!(
                "lock table directory not found: {}",
                self.dir.display()
            )))
        }
    }

    async fn lock(&self, key: &str, info: &LockInfo) -> Result<String, LockError> {
        let path = self.lock_path(key)?;
        let _guard = self.guard()?;

        match self.create_lock(&path, info) {
            Ok(()) => return Ok(info.id.clone()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(lock_write_error(e)),
        }

        // nobody else can replace the file while the guard is held
        if let Some(existing) = self.read_lock(&path)? {
            if !existing.is_expired() {
                return Err(LockError::Held(existing));
            }
            debug!("clearing expired lock {} on {}", existing.id, key);
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ClientError::from(e).into()),
        }
        self.create_lock(&path, info).map_err(lock_write_error)?;
        Ok(info.id.clone())
    }

    async fn unlock(&self, key: &str, lock_id: &str) -> Result<(), LockError> {
        let path = self.lock_path(key)?;
        let _guard = self.guard()?;
        let Some(existing) = self.read_lock(&path)? else {
            return Err(LockError::NotFound(lock_id.to_string()));
        };
        if existing.id != lock_id {
            return Err(LockError::Mismatch {
                expected: lock_id.to_string(),
                actual: existing.id,
            });
        }
        fs::remove_file(&path).map_err(|e| {
            ClientError::new(format!("Failed to remove lock file: {}", e)).with_cause(e)
        })?;
        Ok(())
    }

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        let path = self.lock_path(key)?;
        Ok(self.read_lock(&path)?)
    }
}

fn lock_write_error(e: std::io::Error) -> LockError {
    ClientError::new(format!("Failed to write lock file: {}", e))
        .with_cause(e)
        .into()
}
