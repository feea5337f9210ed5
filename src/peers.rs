//! Defines how a group talks to the other peers of the fleet.
//!
//! A [Group](crate::group::Group) only depends on these two narrow traits. The default
//! implementation talks HTTP (see [HttpPool](crate::http::HttpPool)), but tests or embedding
//! applications may provide their own.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

/// Locates the peer which owns a given key.
pub trait PeerPicker: Send + Sync {
    /// Returns the peer owning the given key.
    ///
    /// Returns **None** if the key is owned by the local process (or if no peers are known at
    /// all). In this case the value is loaded locally.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Fetches values from a remote peer.
#[async_trait]
pub trait PeerGetter: Send + Sync {
    /// Fetches the value for the given key of the given group from the remote peer.
    async fn get(&self, group: &str, key: &str) -> anyhow::Result<Bytes>;
}
