//! Backend error types and configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lock::LockInfo;

/// Error reported by an object store or lock table client
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ClientError {
    pub message: String,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string()).with_cause(err)
    }
}

/// Errors from lock table operations
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock is held by someone else
    #[error("state is locked by {} (lock ID: {}, operation: {})", .0.who, .0.id, .0.operation)]
    Held(LockInfo),

    /// The lock exists but belongs to a different holder
    #[error("lock ID mismatch: expected {expected}, got {actual}")]
    Mismatch { expected: String, actual: String },

    /// No lock exists for the key
    #[error("lock not found: {0}")]
    NotFound(String),

    /// The lock table could not be reached or returned an error
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The caller passed an unusable workspace name
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The configured lock table failed its readiness probe
    #[error("error describing lock table {table}: {source}")]
    LockTableUnavailable {
        table: String,
        #[source]
        source: ClientError,
    },

    /// The initialization lock could not be taken
    #[error("failed to lock state at {path} (lock ID: {lock_id}): {source}")]
    LockAcquisitionFailed {
        path: String,
        /// ID of the lock that was being requested
        lock_id: String,
        #[source]
        source: LockError,
    },

    /// A lock table call other than acquire/release failed
    #[error("lock table request for {path} failed: {source}")]
    LockTable {
        path: String,
        #[source]
        source: LockError,
    },

    /// An object store call failed
    #[error("{operation} {key} failed: {source}")]
    RemoteIo {
        operation: &'static str,
        key: String,
        #[source]
        source: ClientError,
    },

    /// The lock could not be released after a successful operation
    #[error(
        "Error unlocking state (lock ID: {lock_id}): {source}. \
         You may have to force-unlock this state in order to use it again."
    )]
    Unlock {
        lock_id: String,
        #[source]
        source: LockError,
    },

    /// The operation failed and releasing its lock failed too
    #[error(
        "Error unlocking state (lock ID: {lock_id}): {source}. \
         The lock was being released after an earlier error: {cause}. \
         You may have to force-unlock this state in order to use it again."
    )]
    UnlockAfterError {
        lock_id: String,
        cause: Box<BackendError>,
        #[source]
        source: LockError,
    },

    /// The default workspace is structurally required and cannot be removed
    #[error("can't delete default state")]
    CannotDeleteDefault,

    /// State file is corrupted or invalid
    #[error("Invalid state file {key}: {message}")]
    InvalidState { key: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wrap an object store failure with the operation and key it concerned
    pub fn remote(operation: &'static str, key: impl Into<String>, source: ClientError) -> Self {
        Self::RemoteIo {
            operation,
            key: key.into(),
            source,
        }
    }

    /// Lock ID a lock failure concerns.
    ///
    /// For a held lock this is the holder's ID, the one force-unlock needs.
    pub fn lock_id(&self) -> Option<&str> {
        match self {
            Self::Unlock { lock_id, .. } | Self::UnlockAfterError { lock_id, .. } => Some(lock_id),
            Self::LockAcquisitionFailed {
                source: LockError::Held(info),
                ..
            } => Some(&info.id),
            Self::LockAcquisitionFailed { lock_id, .. } => Some(lock_id),
            _ => None,
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

fn default_backend_type() -> String {
    "s3".to_string()
}

fn default_prefix() -> String {
    BackendConfig::DEFAULT_PREFIX.to_string()
}

fn default_key() -> String {
    BackendConfig::DEFAULT_KEY.to_string()
}

/// Configuration for a state backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type ("s3", "local", "memory")
    #[serde(rename = "type", default = "default_backend_type")]
    pub backend_type: String,
    /// Bucket holding the state objects
    pub bucket: String,
    /// Key prefix under which every workspace lives
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// File name of each workspace's state object
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Custom object store endpoint (S3-compatible services)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Whether to request server-side encryption on writes
    #[serde(default)]
    pub encrypt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
    /// Canned ACL applied to written objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<String>,
    /// Lock table identifier; locking is disabled when empty
    #[serde(default)]
    pub lock_table: String,
    /// Lock table endpoint; locking is disabled when empty
    #[serde(default)]
    pub lock_table_endpoint: String,
    /// Root directory for the local backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl BackendConfig {
    pub const DEFAULT_PREFIX: &'static str = "env:";
    pub const DEFAULT_KEY: &'static str = "terraform.tfstate";

    /// Create a configuration with defaults for everything but the bucket
    pub fn new(backend_type: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            bucket: bucket.into(),
            prefix: default_prefix(),
            key: default_key(),
            region: None,
            endpoint: None,
            encrypt: false,
            kms_key_id: None,
            acl: None,
            lock_table: String::new(),
            lock_table_endpoint: String::new(),
            path: None,
        }
    }

    /// Parse a configuration from JSON and validate it
    pub fn from_json(content: &str) -> BackendResult<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| BackendError::configuration(format!("invalid backend config: {}", e)))?;
        config.validate()
    }

    /// Normalize the prefix and reject layouts that would break workspace discovery
    pub fn validate(mut self) -> BackendResult<Self> {
        if self.bucket.is_empty() {
            return Err(BackendError::configuration("Missing required attribute: bucket"));
        }
        if self.prefix.starts_with("./") {
            return Err(BackendError::configuration(
                "prefix must not start with './'",
            ));
        }
        self.prefix = self.prefix.trim_matches('/').to_string();
        if self.prefix.is_empty() {
            return Err(BackendError::configuration("prefix must not be empty"));
        }
        if self.key.is_empty() {
            return Err(BackendError::configuration("Missing required attribute: key"));
        }
        if self.key.contains('/') {
            return Err(BackendError::configuration(format!(
                "key must be a file name without '/': {}",
                self.key
            )));
        }
        Ok(self)
    }

    /// Whether both lock table coordinates are set
    pub fn lock_table_configured(&self) -> bool {
        !self.lock_table.is_empty() && !self.lock_table_endpoint.is_empty()
    }

    /// Server-side encryption algorithm to request on writes, if any
    pub fn server_side_encryption(&self) -> Option<String> {
        if !self.encrypt {
            return None;
        }
        match self.kms_key_id {
            Some(_) => Some("aws:kms".to_string()),
            None => Some("AES256".to_string()),
        }
    }
}
