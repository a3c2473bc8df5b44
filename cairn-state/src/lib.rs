//! Cairn State Management
//!
//! This crate stores state snapshots in named workspaces on an object store,
//! using a separate lock table to make the first write of each workspace safe
//! against concurrent initializers.
//!
//! # Overview
//!
//! The state management system consists of:
//!
//! - **Backend**: discovers workspaces, builds per-workspace clients, and
//!   initializes new workspaces under a lock
//! - **ObjectStore** / **LockTable**: the client traits a backend runs on
//!   (S3, local filesystem, in-memory)
//! - **RemoteState**: the state manager handed out for one workspace
//! - **LockInfo**: information about the lock held while a workspace is
//!   initialized
//!
//! # Example
//!
//! ```ignore
//! use cairn_state::{create_backend, BackendConfig, StateManager};
//!
//! let config = BackendConfig::from_json(r#"{
//!     "bucket": "my-state-bucket",
//!     "region": "ap-northeast-1",
//!     "lock_table": "my-state-locks",
//!     "lock_table_endpoint": "ap-northeast-1"
//! }"#)?;
//!
//! let backend = create_backend(config).await?;
//!
//! // Creates env:/staging/terraform.tfstate on first use
//! let mut state = backend.state_mgr("staging").await?;
//! state.refresh_state().await?;
//!
//! for workspace in backend.workspaces().await? {
//!     println!("{}", workspace);
//! }
//! ```

pub mod backend;
pub mod backends;
pub mod client;
pub mod lock;
pub mod paths;
pub mod remote;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendResult, ClientError, LockError};
pub use backends::create_backend;
pub use client::RemoteClient;
pub use lock::{INIT_OPERATION, LockInfo, Locker, with_lock};
pub use paths::{DEFAULT_WORKSPACE, LOCK_FILE_SUFFIX, StateLayout};
pub use remote::Backend;
pub use state::{RemoteState, StateFile, StateManager};
pub use store::{ListRequest, LockTable, ObjectListing, ObjectStore, PutOptions};
