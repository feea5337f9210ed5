//! Contains the node configuration.
//!
//! The configuration is loaded from **config/settings.yml**. The file is observed and re-loaded
//! once its modification date changes, so that peers can be added or removed without restarting
//! a node. Components which depend on the config therefore subscribe to
//! [Config::notifier](Config::notifier) and re-process it once a change message is received.
//!
//! Note that a [Handle] obtained via [Config::current](Config::current) represents a snapshot of
//! the config and is not updated, therefore it shouldn't be kept around.
//!
//! # Examples
//!
//! ```
//! # use jwcache::config::Config;
//! let config = Config::new("config/settings.yml");
//! config.load_from_string("
//! server:
//!     port: 8002
//! peers:
//!     nodes:
//!         - http://localhost:8001
//!         - http://localhost:8002
//! ", None).unwrap();
//!
//! let handle = config.current();
//! assert_eq!(handle.query("server.port").as_i64(), Some(8002));
//! assert_eq!(handle.query("peers.nodes").as_vec().map(|nodes| nodes.len()), Some(2));
//! assert_eq!(handle.query("peers.self").is_badvalue(), true);
//! ```
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use tokio::sync::broadcast::error::RecvError;
use yaml_rust::{Yaml, YamlLoader};

use crate::node::Node;

/// Contains the name of the config file loaded by [install].
pub const SETTINGS_FILE: &str = "config/settings.yml";

#[cfg(not(test))]
const CHANGE_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Provides access to the node configuration.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Receives a message each time the config has been (re-)loaded.
///
/// The message itself carries no information. Receivers are expected to re-read the parts of the
/// config they care about.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a snapshot of the currently loaded configuration.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new and empty config which will read the given file once loaded.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            tx,
            config: ArcSwap::new(Arc::new((Yaml::Hash(Default::default()), None))),
        }
    }

    /// Returns the name of the underlying file.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Subscribes to config changes.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a snapshot of the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines when the config file was last modified.
    ///
    /// Returns **None** if the file doesn't exist. A directory (e.g. an unmounted docker volume)
    /// is treated as absent.
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|metadata| metadata.is_file())
            .and_then(|metadata| metadata.modified().ok())
    }

    /// Reads the underlying file.
    ///
    /// A missing file is not an error, the node then simply runs with its defaults.
    pub async fn load(&self) -> anyhow::Result<()> {
        let last_modified = match self.last_modified().await {
            Some(last_modified) => last_modified,
            None => {
                log::info!(
                    "Config file {} doesn't exist. Using the default settings...",
                    &self.filename
                );
                return Ok(());
            }
        };

        log::info!("Loading config file {}...", &self.filename);
        let data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        self.load_from_string(&data, Some(last_modified))
    }

    /// Loads the configuration from the given string instead of a file.
    ///
    /// A config which cannot be parsed is rejected and the previous config remains active.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data)
            .with_context(|| format!("Cannot parse config file {}", &self.filename))?;

        let doc = match docs.drain(..).next() {
            Some(doc @ Yaml::Hash(_)) => doc,
            Some(Yaml::Null) | None => Yaml::Hash(Default::default()),
            Some(_) => {
                return Err(anyhow::anyhow!(
                    "Cannot use config file {}: Expected a map as root element.",
                    &self.filename
                ))
            }
        };

        self.config.store(Arc::new((doc, last_modified)));

        // There might be no listeners at all...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the root of the configuration.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Walks along the given dot separated path (e.g. "server.port").
    ///
    /// Returns [Yaml::BadValue] if any part of the path doesn't exist.
    pub fn query(&self, path: impl AsRef<str>) -> &Yaml {
        path.as_ref()
            .split('.')
            .fold(&self.config.0, |node, key| &node[key])
    }
}

/// Loads the config of the given node and starts observing the underlying file.
///
/// Note that this is called by the [Builder](crate::builder::Builder) unless the config is
/// disabled.
pub async fn install(node: Arc<Node>) {
    let directory = std::path::Path::new(node.config().filename())
        .parent()
        .map(|parent| parent.to_path_buf());
    if let Some(directory) = directory.filter(|dir| !dir.as_os_str().is_empty()) {
        if let Err(error) = tokio::fs::create_dir_all(&directory).await {
            log::warn!(
                "Failed to create config directory {}: {}",
                directory.to_string_lossy(),
                error
            );
        }
    }

    if let Err(error) = node.config().load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(node);
}

/// Invokes the given callback each time the config of the node has been (re-)loaded.
///
/// The listener stops (and releases the node) once the node is terminated.
pub fn on_change<F>(node: Arc<Node>, callback: F)
where
    F: Fn(&Node) + Send + 'static,
{
    let mut notifier = node.config().notifier();
    crate::spawn!(async move {
        while node.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(SHUTDOWN_CHECK_INTERVAL) => {}
                message = notifier.recv() => {
                    match message {
                        Ok(_) | Err(RecvError::Lagged(_)) => callback(node.as_ref()),
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        }
    });
}

#[cfg(test)]
fn run_config_change_monitor(_node: Arc<Node>) {
    // Tests feed their config via load_from_string...
}

#[cfg(not(test))]
fn run_config_change_monitor(node: Arc<Node>) {
    crate::spawn!(async move {
        while node.is_running() {
            tokio::time::sleep(CHANGE_MONITOR_INTERVAL).await;

            let config = node.config();
            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;

            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("Node configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load the node configuration: {:#}", error),
                }
            }
        }
    });
}
