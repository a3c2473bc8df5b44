//! Object key layout for workspaces
//!
//! The default workspace keeps its state directly under the prefix:
//!
//! ```text
//! <prefix>/<key>                  default workspace
//! <prefix>/<workspace>/<key>      any other workspace
//! <state key>.tflock              lock key of either
//! ```

/// Name of the workspace that always exists
pub const DEFAULT_WORKSPACE: &str = "default";

/// Suffix appended to a state key to form its lock key
pub const LOCK_FILE_SUFFIX: &str = ".tflock";

/// Maps workspace names to state and lock keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    prefix: String,
    key: String,
}

impl StateLayout {
    /// `prefix` must already be stripped of surrounding slashes
    /// (see [`crate::BackendConfig::validate`]).
    pub fn new(prefix: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            key: key.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Listing prefix covering every workspace
    pub fn list_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    pub fn state_file(&self, name: &str) -> String {
        if name == DEFAULT_WORKSPACE {
            format!("{}/{}", self.prefix, self.key)
        } else {
            format!("{}/{}/{}", self.prefix, name, self.key)
        }
    }

    pub fn lock_file(&self, name: &str) -> String {
        self.state_file(name) + LOCK_FILE_SUFFIX
    }

    /// Workspace owning an object key, if the key names one.
    ///
    /// The default workspace's own state and lock objects are excluded; it
    /// is reported through the sentinel instead.
    pub fn workspace_of<'a>(&self, object_key: &'a str) -> Option<&'a str> {
        if object_key == self.state_file(DEFAULT_WORKSPACE)
            || object_key == self.lock_file(DEFAULT_WORKSPACE)
        {
            return None;
        }
        let rest = object_key
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))?;
        let first = rest.split('/').next()?;
        if first.is_empty() { None } else { Some(first) }
    }
}
