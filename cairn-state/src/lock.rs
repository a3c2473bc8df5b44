//! Lock information and the lock-guarded critical section

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult, LockError};

/// Default lock timeout in seconds (15 minutes)
pub const DEFAULT_LOCK_TIMEOUT_SECS: i64 = 900;

/// Operation label recorded on the lock taken while creating a workspace
pub const INIT_OPERATION: &str = "init";

/// Information about a state lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// The operation being performed (e.g., "init", "apply")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// Lock key the lock was taken on
    #[serde(default)]
    pub path: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// When the lock expires
    pub expires: DateTime<Utc>,
}

impl LockInfo {
    /// Create a new lock for an operation
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_timeout(operation, DEFAULT_LOCK_TIMEOUT_SECS)
    }

    /// Create a new lock with a custom timeout
    pub fn with_timeout(operation: impl Into<String>, timeout_secs: i64) -> Self {
        let now = Utc::now();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            who: get_lock_owner(),
            path: String::new(),
            created: now,
            expires: now + Duration::seconds(timeout_secs),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Get the remaining time until expiration
    pub fn time_remaining(&self) -> Duration {
        self.expires - Utc::now()
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

/// Something that can take and release one lock
#[async_trait]
pub trait Locker: Send + Sync {
    /// Key the lock is taken on, for error reporting
    fn lock_path(&self) -> &str;

    async fn lock(&self, info: &LockInfo) -> Result<String, LockError>;

    async fn unlock(&self, lock_id: &str) -> Result<(), LockError>;
}

/// Run `body` while holding the lock described by `info`.
///
/// `body` is not polled unless the lock was acquired. Once acquired, the lock
/// is released exactly once after `body` completes, whatever its outcome. A
/// release failure is never swallowed: it is reported alone when `body`
/// succeeded and combined with `body`'s error otherwise.
///
/// If the returned future is dropped while the lock is held, the release is
/// handed to the current tokio runtime.
pub async fn with_lock<L, Fut, T>(locker: &L, info: LockInfo, body: Fut) -> BackendResult<T>
where
    L: Locker + Clone + 'static,
    Fut: Future<Output = BackendResult<T>>,
{
    let lock_id =
        locker
            .lock(&info)
            .await
            .map_err(|source| BackendError::LockAcquisitionFailed {
                path: locker.lock_path().to_string(),
                lock_id: info.id.clone(),
                source,
            })?;
    debug!(
        "acquired {} lock {} on {}",
        info.operation,
        lock_id,
        locker.lock_path()
    );

    let mut guard = ReleaseGuard::new(locker.clone(), lock_id.clone());
    let result = body.await;

    // the single release attempt starts here, so the drop guard must not repeat it
    guard.disarm();
    let pending = PendingRelease::new(&lock_id, locker.lock_path());
    let released = locker.unlock(&lock_id).await;
    pending.finish();

    match (result, released) {
        (Ok(value), Ok(())) => {
            debug!("released lock {} on {}", lock_id, locker.lock_path());
            Ok(value)
        }
        (Err(cause), Ok(())) => Err(cause),
        (Ok(_), Err(source)) => Err(BackendError::Unlock { lock_id, source }),
        (Err(cause), Err(source)) => Err(BackendError::UnlockAfterError {
            lock_id,
            cause: Box::new(cause),
            source,
        }),
    }
}

/// Reports a release that was cancelled after it was sent
struct PendingRelease<'a> {
    lock_id: &'a str,
    path: &'a str,
    finished: bool,
}

impl<'a> PendingRelease<'a> {
    fn new(lock_id: &'a str, path: &'a str) -> Self {
        Self {
            lock_id,
            path,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for PendingRelease<'_> {
    fn drop(&mut self) {
        if !self.finished {
            error!(
                "release of lock {} on {} was interrupted; force-unlock may be required",
                self.lock_id, self.path
            );
        }
    }
}

/// Releases a held lock from `Drop` when the critical section is abandoned
struct ReleaseGuard<L: Locker + 'static> {
    armed: Option<(L, String)>,
}

impl<L: Locker + 'static> ReleaseGuard<L> {
    fn new(locker: L, lock_id: String) -> Self {
        Self {
            armed: Some((locker, lock_id)),
        }
    }

    fn disarm(&mut self) {
        self.armed = None;
    }
}

impl<L: Locker + 'static> Drop for ReleaseGuard<L> {
    fn drop(&mut self) {
        let Some((locker, lock_id)) = self.armed.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "operation cancelled while holding lock {} on {}, releasing",
                    lock_id,
                    locker.lock_path()
                );
                handle.spawn(async move {
                    if let Err(e) = locker.unlock(&lock_id).await {
                        error!(
                            "failed to release lock {} on {}: {}; force-unlock may be required",
                            lock_id,
                            locker.lock_path(),
                            e
                        );
                    }
                });
            }
            Err(_) => {
                error!(
                    "lock {} on {} abandoned outside a runtime; force-unlock may be required",
                    lock_id,
                    locker.lock_path()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ClientError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        locks: usize,
        unlocks: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct RecordingLocker {
        calls: Arc<Mutex<Calls>>,
        fail_lock: bool,
        fail_unlock: bool,
        hang_unlock: bool,
    }

    #[async_trait]
    impl Locker for RecordingLocker {
        fn lock_path(&self) -> &str {
            "env:/dev/terraform.tfstate.tflock"
        }

        async fn lock(&self, info: &LockInfo) -> Result<String, LockError> {
            self.calls.lock().unwrap().locks += 1;
            if self.fail_lock {
                return Err(LockError::Held(LockInfo::new("apply")));
            }
            Ok(info.id.clone())
        }

        async fn unlock(&self, lock_id: &str) -> Result<(), LockError> {
            self.calls.lock().unwrap().unlocks.push(lock_id.to_string());
            if self.hang_unlock {
                std::future::pending::<()>().await;
            }
            if self.fail_unlock {
                return Err(LockError::Client(ClientError::new("lock table offline")));
            }
            Ok(())
        }
    }

    fn body_error() -> BackendError {
        BackendError::remote("put", "env:/dev/terraform.tfstate", ClientError::new("disk full"))
    }

    #[test]
    fn test_lock_info_new() {
        let lock = LockInfo::new("init");
        assert_eq!(lock.operation, "init");
        assert!(!lock.id.is_empty());
        assert!(!lock.who.is_empty());
        assert!(lock.path.is_empty());
        assert!(lock.expires > lock.created);
        assert!(!lock.is_expired());
    }

    #[test]
    fn test_lock_info_with_timeout() {
        let lock = LockInfo::with_timeout("init", 60);
        let remaining = lock.time_remaining();
        assert!(remaining.num_seconds() > 55);
        assert!(remaining.num_seconds() <= 60);

        let expired = LockInfo::with_timeout("init", -1);
        assert!(expired.is_expired());
    }

    #[test]
    fn test_lock_info_json_without_path() {
        let lock = LockInfo::new("init").with_path("env:/dev/terraform.tfstate.tflock");
        let mut json = serde_json::to_value(&lock).unwrap();
        json.as_object_mut().unwrap().remove("path");

        let deserialized: LockInfo = serde_json::from_value(json).unwrap();
        assert_eq!(deserialized.id, lock.id);
        assert!(deserialized.path.is_empty());
    }

    #[test]
    fn test_lock_owner_format() {
        assert!(get_lock_owner().contains('@'));
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_success() {
        let locker = RecordingLocker::default();
        let info = LockInfo::new(INIT_OPERATION);
        let id = info.id.clone();

        let value = with_lock(&locker, info, async { Ok(42) }).await.unwrap();

        assert_eq!(value, 42);
        let calls = locker.calls.lock().unwrap();
        assert_eq!(calls.locks, 1);
        assert_eq!(calls.unlocks, vec![id]);
    }

    #[tokio::test]
    async fn test_with_lock_skips_body_when_lock_fails() {
        let locker = RecordingLocker {
            fail_lock: true,
            ..Default::default()
        };
        let ran = AtomicBool::new(false);

        let result = with_lock(&locker, LockInfo::new(INIT_OPERATION), async {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(BackendError::LockAcquisitionFailed {
                source: LockError::Held(_),
                ..
            })
        ));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(locker.calls.lock().unwrap().unlocks.is_empty());
    }

    #[tokio::test]
    async fn test_with_lock_returns_body_error_after_release() {
        let locker = RecordingLocker::default();

        let result: BackendResult<()> =
            with_lock(&locker, LockInfo::new(INIT_OPERATION), async { Err(body_error()) }).await;

        assert!(matches!(result, Err(BackendError::RemoteIo { .. })));
        assert_eq!(locker.calls.lock().unwrap().unlocks.len(), 1);
    }

    #[tokio::test]
    async fn test_with_lock_reports_unlock_failure_after_success() {
        let locker = RecordingLocker {
            fail_unlock: true,
            ..Default::default()
        };
        let info = LockInfo::new(INIT_OPERATION);
        let id = info.id.clone();

        let err = with_lock(&locker, info, async { Ok(()) }).await.unwrap_err();

        match &err {
            BackendError::Unlock { lock_id, .. } => assert_eq!(lock_id, &id),
            other => panic!("expected Unlock error, got {other:?}"),
        }
        assert!(err.to_string().contains(&id));
        assert!(err.to_string().contains("lock table offline"));
    }

    #[tokio::test]
    async fn test_with_lock_combines_body_and_unlock_errors() {
        let locker = RecordingLocker {
            fail_unlock: true,
            ..Default::default()
        };
        let info = LockInfo::new(INIT_OPERATION);
        let id = info.id.clone();

        let err = with_lock(&locker, info, async { Err::<(), _>(body_error()) })
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::UnlockAfterError { .. }));
        let message = err.to_string();
        assert!(message.contains(&id));
        assert!(message.contains("disk full"));
        assert!(message.contains("lock table offline"));
        assert_eq!(err.lock_id(), Some(id.as_str()));
        assert_eq!(locker.calls.lock().unwrap().unlocks.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_critical_section_still_releases() {
        let locker = RecordingLocker::default();
        let info = LockInfo::new(INIT_OPERATION);
        let id = info.id.clone();

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            with_lock(&locker, info, std::future::pending::<BackendResult<()>>()),
        )
        .await;
        assert!(cancelled.is_err());

        for _ in 0..10 {
            if !locker.calls.lock().unwrap().unlocks.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(locker.calls.lock().unwrap().unlocks, vec![id]);
    }

    #[tokio::test]
    async fn test_cancelled_release_is_not_repeated() {
        let locker = RecordingLocker {
            hang_unlock: true,
            ..Default::default()
        };
        let info = LockInfo::new(INIT_OPERATION);
        let id = info.id.clone();

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            with_lock(&locker, info, async { Ok(()) }),
        )
        .await;
        assert!(cancelled.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(locker.calls.lock().unwrap().unlocks, vec![id]);
    }

    #[tokio::test]
    async fn test_acquire_failure_names_requested_lock() {
        #[derive(Clone)]
        struct OfflineLocker;

        #[async_trait]
        impl Locker for OfflineLocker {
            fn lock_path(&self) -> &str {
                "env:/dev/terraform.tfstate.tflock"
            }

            async fn lock(&self, _info: &LockInfo) -> Result<String, LockError> {
                Err(LockError::Client(ClientError::new("lock table offline")))
            }

            async fn unlock(&self, _lock_id: &str) -> Result<(), LockError> {
                Ok(())
            }
        }

        let info = LockInfo::new(INIT_OPERATION);
        let id = info.id.clone();

        let err = with_lock(&OfflineLocker, info, async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(err.lock_id(), Some(id.as_str()));
        assert!(err.to_string().contains(&id));
        assert!(err.to_string().contains("lock table offline"));
    }
}
