//! S3 object store and S3-bucket lock table

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, ServerSideEncryption};
use log::debug;

use crate::backend::{BackendConfig, ClientError, LockError};
use crate::lock::LockInfo;
use crate::store::{ListRequest, LockTable, ObjectListing, ObjectStore, PutOptions};

/// Build an S3 client for a region and optional custom endpoint
async fn build_client(region: Option<&str>, endpoint: Option<&str>) -> Client {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_sdk_s3::config::Region::new(convert_region_value(
            region,
        )));
    }
    let aws_config = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(endpoint) = endpoint {
        builder = builder.endpoint_url(endpoint).force_path_style(true);
    }
    Client::from_conf(builder.build())
}

fn sdk_error<E, R>(err: SdkError<E, R>) -> ClientError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    ClientError::new(DisplayErrorContext(&err).to_string())
}

struct StoredObject {
    body: Vec<u8>,
    etag: Option<String>,
}

/// S3-based object store
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create an S3ObjectStore from configuration
    pub async fn from_config(config: &BackendConfig) -> Self {
        Self::new(build_client(config.region.as_deref(), config.endpoint.as_deref()).await)
    }

    /// Read an object together with its ETag
    async fn read(&self, bucket: &str, key: &str) -> Result<Option<StoredObject>, ClientError> {
        let result = self.client.get_object().bucket(bucket).key(key).send().await;

        match result {
            Ok(output) => {
                let etag = output.e_tag().map(str::to_string);
                let body = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| ClientError::new(e.to_string()))?;
                Ok(Some(StoredObject {
                    body: body.into_bytes().to_vec(),
                    etag,
                }))
            }
            Err(err) => {
                if is_not_found_error(&err) {
                    Ok(None)
                } else {
                    Err(sdk_error(err))
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        request: &ListRequest,
    ) -> Result<ObjectListing, ClientError> {
        let output = self
            .client
            .list_objects()
            .bucket(bucket)
            .prefix(&request.prefix)
            .max_keys(i32::try_from(request.max_keys).unwrap_or(i32::MAX))
            .set_marker(request.marker.clone())
            .send()
            .await
            .map_err(sdk_error)?;

        let keys = output
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect();

        Ok(ObjectListing {
            keys,
            is_truncated: output.is_truncated().unwrap_or(false),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        Ok(self.read(bucket, key).await?.map(|object| object.body))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<(), ClientError> {
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body));

        if let Some(content_type) = &options.content_type {
            request = request.content_type(content_type);
        }
        if let Some(algorithm) = &options.server_side_encryption {
            request = request.server_side_encryption(ServerSideEncryption::from(algorithm.as_str()));
        }
        if let Some(kms_key_id) = &options.kms_key_id {
            request = request.ssekms_key_id(kms_key_id);
        }
        if let Some(acl) = &options.acl {
            request = request.acl(ObjectCannedAcl::from(acl.as_str()));
        }

        request.send().await.map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), ClientError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

/// Lock table kept as JSON lock objects in a dedicated S3 bucket
#[derive(Debug, Clone)]
pub struct S3LockTable {
    store: S3ObjectStore,
    bucket: String,
}

impl S3LockTable {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            store: S3ObjectStore::new(client),
            bucket: bucket.into(),
        }
    }

    /// Create an S3LockTable from configuration.
    ///
    /// `lock_table_endpoint` is either an endpoint URL or a region name.
    pub async fn from_config(config: &BackendConfig) -> Self {
        let (region, endpoint) = split_lock_endpoint(config);
        let client = build_client(region.as_deref(), endpoint.as_deref()).await;
        Self::new(client, &config.lock_table)
    }

    async fn read_lock(&self, key: &str) -> Result<Option<StoredLock>, ClientError> {
        let Some(object) = self.store.read(&self.bucket, key).await? else {
            return Ok(None);
        };
        let info = serde_json::from_slice(&object.body)
            .map_err(|e| ClientError::new(format!("invalid lock object {}: {}", key, e)))?;
        Ok(Some(StoredLock {
            info,
            etag: object.etag,
        }))
    }

    /// Write the lock object if `condition` still holds.
    ///
    /// Returns `false` when S3 rejected the write because the object changed.
    async fn write_lock(
        &self,
        key: &str,
        lock: &LockInfo,
        condition: WriteCondition,
    ) -> Result<bool, ClientError> {
        let body = serde_json::to_vec_pretty(lock)
            .map_err(|e| ClientError::new(e.to_string()).with_cause(e))?;
        let request = self
            .store
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body));
        let request = match condition {
            WriteCondition::Absent => request.if_none_match("*"),
            WriteCondition::Unchanged(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) if is_precondition_failed(&err) => Ok(false),
            Err(err) => Err(sdk_error(err)),
        }
    }

    /// Delete the lock object only if it still carries `etag`
    async fn delete_lock(&self, key: &str, etag: &str) -> Result<bool, ClientError> {
        let result = self
            .store
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .if_match(etag)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_precondition_failed(&err) => Ok(false),
            Err(err) => Err(sdk_error(err)),
        }
    }
}

/// A lock object and the ETag it was read with
#[derive(Debug)]
struct StoredLock {
    info: LockInfo,
    etag: Option<String>,
}

/// Precondition attached to a lock write
#[derive(Debug, Clone, PartialEq, Eq)]
enum WriteCondition {
    /// No lock object exists
    Absent,
    /// The expired lock object with this ETag is still the current one
    Unchanged(String),
}

/// Decide how a new lock may be written over whatever is stored
fn takeover_condition(existing: Option<StoredLock>, key: &str) -> Result<WriteCondition, LockError> {
    let Some(existing) = existing else {
        return Ok(WriteCondition::Absent);
    };
    if !existing.info.is_expired() {
        return Err(LockError::Held(existing.info));
    }
    match existing.etag {
        Some(etag) => {
            debug!("replacing expired lock {} on {}", existing.info.id, key);
            Ok(WriteCondition::Unchanged(etag))
        }
        None => Err(ClientError::new(format!("lock object {} has no ETag", key)).into()),
    }
}

/// Check that the stored lock is the one being released
fn verify_holder(existing: Option<StoredLock>, lock_id: &str) -> Result<StoredLock, LockError> {
    let Some(existing) = existing else {
        return Err(LockError::NotFound(lock_id.to_string()));
    };
    if existing.info.id != lock_id {
        return Err(LockError::Mismatch {
            expected: lock_id.to_string(),
            actual: existing.info.id,
        });
    }
    Ok(existing)
}

#[async_trait]
impl LockTable for S3LockTable {
    fn table_name(&self) -> &str {
        &self.bucket
    }

    async fn describe_table(&self) -> Result<(), ClientError> {
        self.store
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn lock(&self, key: &str, info: &LockInfo) -> Result<String, LockError> {
        let condition = takeover_condition(self.read_lock(key).await?, key)?;
        if self.write_lock(key, info, condition).await? {
            return Ok(info.id.clone());
        }

        // another writer got there first
        match self.read_lock(key).await? {
            Some(holder) => Err(LockError::Held(holder.info)),
            None => Err(ClientError::new(format!("lock on {} is contended", key)).into()),
        }
    }

    async fn unlock(&self, key: &str, lock_id: &str) -> Result<(), LockError> {
        let existing = verify_holder(self.read_lock(key).await?, lock_id)?;
        let Some(etag) = existing.etag else {
            return Err(ClientError::new(format!("lock object {} has no ETag", key)).into());
        };
        if self.delete_lock(key, &etag).await? {
            return Ok(());
        }

        // replaced between the read and the delete
        verify_holder(self.read_lock(key).await?, lock_id)?;
        Err(ClientError::new(format!("lock on {} changed while unlocking", key)).into())
    }

    async fn lock_info(&self, key: &str) -> Result<Option<LockInfo>, LockError> {
        Ok(self.read_lock(key).await?.map(|stored| stored.info))
    }
}

/// Interpret the lock table endpoint as (region, endpoint URL)
fn split_lock_endpoint(config: &BackendConfig) -> (Option<String>, Option<String>) {
    let endpoint = config.lock_table_endpoint.as_str();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        (config.region.clone(), Some(endpoint.to_string()))
    } else {
        (Some(endpoint.to_string()), None)
    }
}

/// Convert region value from DSL format to AWS format
/// e.g., "aws.Region.ap_northeast_1" -> "ap-northeast-1"
fn convert_region_value(value: &str) -> String {
    match value.strip_prefix("aws.Region.") {
        Some(region) => region.replace('_', "-"),
        None => value.to_string(),
    }
}

/// HTTP status of the raw response behind an S3 error, if there was one
fn response_status<E>(err: &SdkError<E>) -> Option<u16> {
    err.raw_response().map(|raw| raw.status().as_u16())
}

/// Check if an S3 error is a "not found" error
fn is_not_found_error<E>(err: &SdkError<E>) -> bool {
    response_status(err) == Some(404)
}

/// Check if a conditional request lost to a concurrent change
fn is_precondition_failed<E>(err: &SdkError<E>) -> bool {
    response_status(err).is_some_and(is_conflict_status)
}

/// 412 for a failed precondition, 409 for a conflicting concurrent write
fn is_conflict_status(status: u16) -> bool {
    matches!(status, 409 | 412)
}
