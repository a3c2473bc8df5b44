//! Workspace lifecycle on top of an object store and a lock table

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::backend::{BackendConfig, BackendError, BackendResult, ClientError};
use crate::client::RemoteClient;
use crate::lock::{INIT_OPERATION, LockInfo, with_lock};
use crate::paths::{DEFAULT_WORKSPACE, StateLayout};
use crate::state::{RemoteState, StateFile, StateManager};
use crate::store::{LIST_PAGE_SIZE, ListRequest, LockTable, ObjectStore, PutOptions};

/// A state backend storing one state object per workspace
pub struct Backend {
    store: Arc<dyn ObjectStore>,
    lock_table: Option<Arc<dyn LockTable>>,
    bucket: String,
    layout: StateLayout,
    put_options: PutOptions,
    page_size: usize,
}

impl Backend {
    /// Create a backend over already-built clients.
    ///
    /// Pass `lock_table` only when the configuration names one; without it
    /// workspaces are initialized without mutual exclusion.
    pub fn new(
        config: BackendConfig,
        store: Arc<dyn ObjectStore>,
        lock_table: Option<Arc<dyn LockTable>>,
    ) -> BackendResult<Self> {
        let config = config.validate()?;
        let put_options = PutOptions {
            server_side_encryption: config.server_side_encryption(),
            kms_key_id: config.kms_key_id.clone(),
            acl: config.acl.clone(),
            content_type: Some("application/json".to_string()),
        };

        Ok(Self {
            store,
            lock_table,
            bucket: config.bucket,
            layout: StateLayout::new(config.prefix, config.key),
            put_options,
            page_size: LIST_PAGE_SIZE,
        })
    }

    /// Override the number of keys requested per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Build the remote handle for one workspace.
    ///
    /// When a lock table is configured it is probed first, so that an
    /// unreachable table fails here rather than halfway through initialization.
    pub async fn remote_client(&self, name: &str) -> BackendResult<RemoteClient> {
        if name.is_empty() {
            return Err(BackendError::InvalidArgument("missing state name".to_string()));
        }
        if name.contains('/') {
            return Err(BackendError::InvalidArgument(format!(
                "workspace name must not contain '/': {}",
                name
            )));
        }

        if let Some(table) = &self.lock_table {
            table
                .describe_table()
                .await
                .map_err(|source| BackendError::LockTableUnavailable {
                    table: table.table_name().to_string(),
                    source,
                })?;
        }

        Ok(RemoteClient::new(
            self.store.clone(),
            self.lock_table.clone(),
            self.bucket.clone(),
            self.layout.state_file(name),
            self.layout.lock_file(name),
            self.put_options.clone(),
        ))
    }

    /// All workspace names, the default workspace first and the rest sorted
    pub async fn workspaces(&self) -> BackendResult<Vec<String>> {
        let prefix = self.layout.list_prefix();
        let mut request = ListRequest::new(&prefix).with_max_keys(self.page_size);
        let mut names = BTreeSet::new();

        loop {
            let page = self
                .store
                .list_objects(&self.bucket, &request)
                .await
                .map_err(|e| BackendError::remote("list", &prefix, e))?;

            for key in &page.keys {
                if let Some(name) = self.layout.workspace_of(key)
                    && name != DEFAULT_WORKSPACE
                {
                    names.insert(name.to_string());
                }
            }

            if !page.is_truncated {
                break;
            }
            let Some(last) = page.keys.last() else {
                return Err(BackendError::remote(
                    "list",
                    &prefix,
                    ClientError::new("truncated listing returned no keys"),
                ));
            };
            request.marker = Some(last.clone());
        }

        let mut result = Vec::with_capacity(names.len() + 1);
        result.push(DEFAULT_WORKSPACE.to_string());
        result.extend(names);
        Ok(result)
    }

    /// State manager for a workspace, creating its state object on first use
    pub async fn state_mgr(&self, name: &str) -> BackendResult<RemoteState> {
        let client = self.remote_client(name).await?;
        let mut state_mgr = RemoteState::new(client.clone());

        let existing = self.workspaces().await?;
        debug!(
            "current workspace name: {}, all workspaces: {:?}",
            name, existing
        );
        if existing.iter().any(|workspace| workspace == name) {
            return Ok(state_mgr);
        }

        // The object has to exist for the workspace to be listed
        let lock = LockInfo::new(INIT_OPERATION);
        let created = with_lock(&client, lock, initialize_if_empty(&mut state_mgr)).await?;
        if created {
            info!("created workspace {} at {}", name, client.state_file());
        }

        Ok(state_mgr)
    }

    /// Delete a workspace's state; the default workspace cannot be deleted
    pub async fn delete_workspace(&self, name: &str) -> BackendResult<()> {
        if name == DEFAULT_WORKSPACE || name.is_empty() {
            return Err(BackendError::CannotDeleteDefault);
        }

        let client = self.remote_client(name).await?;
        client.delete().await
    }

    /// Current holder of a workspace's lock
    pub async fn lock_info(&self, name: &str) -> BackendResult<Option<LockInfo>> {
        self.remote_client(name).await?.lock_info().await
    }

    /// Release a lock left behind by a failed or interrupted operation
    pub async fn force_unlock(&self, name: &str, lock_id: &str) -> BackendResult<()> {
        let state_mgr = RemoteState::new(self.remote_client(name).await?);
        state_mgr.unlock(lock_id).await?;
        info!("released lock {} on workspace {}", lock_id, name);
        Ok(())
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("bucket", &self.bucket)
            .field("layout", &self.layout)
            .field("put_options", &self.put_options)
            .field(
                "lock_table",
                &self.lock_table.as_ref().map(|t| t.table_name().to_string()),
            )
            .finish()
    }
}

/// Read the state and create an empty one if nothing is stored yet.
///
/// Returns whether a state was written.
async fn initialize_if_empty<M>(state_mgr: &mut M) -> BackendResult<bool>
where
    M: StateManager + ?Sized,
{
    state_mgr.refresh_state().await?;
    if state_mgr.state().is_some() {
        return Ok(false);
    }

    state_mgr.write_state(StateFile::new());
    state_mgr.persist_state().await?;
    Ok(true)
}
