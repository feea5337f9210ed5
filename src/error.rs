//! Error types reported by the read path of a group.
use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors which are reported by [Group::get](crate::group::Group::get).
///
/// Errors are **Clone** as a single failed load is reported to every caller which waited for it.
/// Therefore the cause of a failed load is kept behind an **Arc**.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// An empty key was given. Such requests are rejected before any lookup happens.
    #[error("key is required")]
    EmptyKey,

    /// The loader of the group failed to provide a value (e.g. as the key doesn't exist in the
    /// underlying data source).
    #[error("failed to load '{key}': {cause:#}")]
    LoadFailed {
        /// The key which was requested.
        key: String,
        /// The error reported by the loader.
        cause: Arc<anyhow::Error>,
    },

    /// A peer requested a group which isn't known to this node.
    #[error("no such group: {0}")]
    UnknownGroup(String),
}

impl Error {
    /// Wraps the error of a loader for the given key.
    pub fn load_failed(key: &str, cause: anyhow::Error) -> Self {
        Error::LoadFailed {
            key: key.to_owned(),
            cause: Arc::new(cause),
        }
    }
}
