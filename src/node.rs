//! Represents a running cache node.
//!
//! A node ties together everything a process needs to take part in a fleet: the [Groups]
//! registry, the [Config] and the [HttpPool] which both locates the owners of keys and serves the
//! requests of other peers. Also this keeps the central **is_running** flag which is toggled to
//! *false* once [Node::terminate](Node::terminate) is invoked.
//!
//! Note that once a node is terminated, all of its groups are dropped.
//!
//! # Examples
//!
//! ```
//! # use jwcache::config::Config;
//! # use jwcache::group::LoaderFn;
//! # use jwcache::node::Node;
//! # use std::sync::Arc;
//! let node = Node::new(Arc::new(Config::new("settings.yml")));
//!
//! // Groups created via the node are connected to its peers...
//! let _ = node.new_group("scores", 2048, LoaderFn(|_key: &str| Ok(b"630".to_vec())));
//! assert_eq!(node.groups().get_group("scores").is_some(), true);
//!
//! // By default the node is running...
//! assert_eq!(node.is_running(), true);
//!
//! // Once terminated...
//! node.terminate();
//! // all groups are released...
//! assert_eq!(node.groups().get_group("scores").is_none(), true);
//!
//! // and the node is no longer considered active...
//! assert_eq!(node.is_running(), false);
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::fmt::format_duration;
use crate::group::{Group, Groups, Loader};
use crate::http::HttpPool;

/// Keeps all central components of a cache node in a single place.
pub struct Node {
    groups: Groups,
    config: Arc<Config>,
    pool: Arc<HttpPool>,
    is_running: AtomicBool,
    started: Instant,
}

impl Node {
    /// Creates a new node for the given config.
    ///
    /// The peer pool is initialized with whatever the config currently contains. Use
    /// [http::install](crate::http::install) (which is called by the
    /// [Builder](crate::builder::Builder)) to keep it up to date when the config changes.
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let pool = Arc::new(HttpPool::from_config(&config.current()));

        Arc::new(Node {
            groups: Groups::new(),
            config,
            pool,
            is_running: AtomicBool::new(true),
            started: Instant::now(),
        })
    }

    /// Creates and registers a new group which uses the peers of this node.
    ///
    /// See [Groups::new_group](Groups::new_group) for details.
    pub fn new_group<L>(&self, name: &str, max_memory: usize, loader: L) -> Arc<Group>
    where
        L: Loader + 'static,
    {
        let group = self.groups.new_group(name, max_memory, loader);
        group.register_peers(self.pool.clone());

        group
    }

    /// Provides access to the registry of all groups hosted by this node.
    pub fn groups(&self) -> &Groups {
        &self.groups
    }

    /// Provides access to the node configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Provides access to the peer pool.
    pub fn pool(&self) -> &Arc<HttpPool> {
        &self.pool
    }

    /// Determines how long this node has been running.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Determines if the node is still active or if [Node::terminate](Node::terminate) has
    /// already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the node.
    ///
    /// This flips the running flag, which makes all background loops (most notably the
    /// [server](crate::server::Server)) exit, and drops all registered groups.
    pub fn terminate(&self) {
        log::info!(
            "Terminating node after an uptime of {}...",
            format_duration(self.uptime())
        );
        self.is_running.store(false, Ordering::Release);
        self.groups.clear();
    }
}
