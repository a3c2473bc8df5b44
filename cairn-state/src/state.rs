//! State snapshots and the state manager bound to a remote workspace

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, BackendResult, LockError};
use crate::client::RemoteClient;
use crate::lock::{LockInfo, Locker};

/// The state snapshot stored for each workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage
    pub lineage: String,
    /// Version of the tool that last wrote this state
    pub tool_version: String,
    /// Managed resources; their shape belongs to whoever writes them
    #[serde(default)]
    pub resources: Vec<serde_json::Value>,
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 4;

    /// Create a new empty state file
    pub fn new() -> Self {
        Self::with_lineage(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_lineage(lineage: String) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads, caches and persists a workspace's state
#[async_trait]
pub trait StateManager: Send {
    /// Replace the cached snapshot with the remote one
    async fn refresh_state(&mut self) -> BackendResult<()>;

    /// The cached snapshot; `None` when the workspace has never been written
    fn state(&self) -> Option<&StateFile>;

    /// Replace the cached snapshot without touching the remote
    fn write_state(&mut self, state: StateFile);

    /// Upload the cached snapshot
    async fn persist_state(&mut self) -> BackendResult<()>;
}

/// State manager backed by a [`RemoteClient`]
#[derive(Debug)]
pub struct RemoteState {
    client: RemoteClient,
    state: Option<StateFile>,
    /// Last snapshot read from or written to the remote
    persisted: Option<StateFile>,
}

impl RemoteState {
    pub fn new(client: RemoteClient) -> Self {
        Self {
            client,
            state: None,
            persisted: None,
        }
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    /// Lock the workspace, returning the lock ID
    pub async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        self.client
            .lock(info)
            .await
            .map_err(|source| BackendError::LockAcquisitionFailed {
                path: self.client.lock_file().to_string(),
                lock_id: info.id.clone(),
                source,
            })
    }

    pub async fn unlock(&self, lock_id: &str) -> BackendResult<()> {
        self.client
            .unlock(lock_id)
            .await
            .map_err(|source: LockError| BackendError::Unlock {
                lock_id: lock_id.to_string(),
                source,
            })
    }
}

#[async_trait]
impl StateManager for RemoteState {
    async fn refresh_state(&mut self) -> BackendResult<()> {
        let payload = self.client.get().await?;
        let state = match payload {
            Some(bytes) if !bytes.is_empty() => {
                let state: StateFile =
                    serde_json::from_slice(&bytes).map_err(|e| BackendError::InvalidState {
                        key: self.client.state_file().to_string(),
                        message: e.to_string(),
                    })?;
                Some(state)
            }
            _ => None,
        };
        self.persisted = state.clone();
        self.state = state;
        Ok(())
    }

    fn state(&self) -> Option<&StateFile> {
        self.state.as_ref()
    }

    fn write_state(&mut self, state: StateFile) {
        self.state = Some(state);
    }

    async fn persist_state(&mut self) -> BackendResult<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        if let Some(previous) = &self.persisted {
            if previous == state {
                return Ok(());
            }
            if previous.lineage == state.lineage && state.serial <= previous.serial {
                state.serial = previous.serial + 1;
            }
        }

        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        self.client.put(body).await?;
        self.persisted = Some(state.clone());
        Ok(())
    }
}
