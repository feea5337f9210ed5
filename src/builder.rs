//! Provides a builder which sets up a cache node.
//!
//! A [Node] can be assembled manually, but most probably a process uses the builder to also set
//! up logging, load the config and install signal handlers. All of these parts can be enabled
//! or disabled selectively.
//!
//! # Example
//! Setting up a node with all features enabled:
//! ```no_run
//! # use jwcache::builder::Builder;
//! # use jwcache::group::LoaderFn;
//! # use jwcache::server::Server;
//! #[tokio::main]
//! async fn main() {
//!     let node = Builder::new().enable_all().build().await;
//!
//!     // Register the groups of this node...
//!     let _ = node.new_group("scores", 2048, LoaderFn(|key: &str| Ok(key.as_bytes().to_vec())));
//!
//!     // Serve peers and clients until the node is terminated...
//!     Server::new(&node).event_loop().await;
//! }
//! ```
use std::sync::Arc;

use log::LevelFilter;

use crate::config::{Config, Handle, SETTINGS_FILE};
use crate::node::Node;
use crate::{init_logging, JWCACHE_REVISION, JWCACHE_VERSION};

/// Initializes a node by creating and wiring all of its components.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    config_file: Option<String>,
}

impl Builder {
    /// Creates a new builder with all features disabled.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all features.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;

        self
    }

    /// Sets up **simplelog** so that the node logs to stdout.
    ///
    /// If the config is enabled as well, **log.level** (one of *error*, *warn*, *info*,
    /// *debug*) determines the verbosity and is re-applied once the config changes.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the logging setup after [enable_all()](Builder::enable_all) has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Terminates the node once **CTRL-C** or **SIGHUP** is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables the signal handler after [enable_all()](Builder::enable_all) has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Loads **config/settings.yml**, keeps observing it and applies its **peers** section to
    /// the [HttpPool](crate::http::HttpPool) of the node.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables loading the config after [enable_all()](Builder::enable_all) has been used.
    ///
    /// The node then runs with an empty config (and therefore with all defaults) unless one is
    /// provided via [Config::load_from_string](Config::load_from_string).
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Reads the given file instead of **config/settings.yml**.
    pub fn with_config_file(mut self, file: &str) -> Self {
        self.config_file = Some(file.to_owned());
        self
    }

    /// Builds the [Node] with all enabled components being set up.
    pub async fn build(self) -> Arc<Node> {
        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. JWCACHE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            JWCACHE_VERSION,
            JWCACHE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        let config = Config::new(self.config_file.as_deref().unwrap_or(SETTINGS_FILE));
        let node = Node::new(Arc::new(config));

        if self.enable_signals {
            crate::signals::install(node.clone());
        }

        if self.setup_config {
            crate::config::install(node.clone()).await;
            crate::http::install(node.clone());

            if self.setup_logging {
                apply_log_level(&node);
                crate::config::on_change(node.clone(), apply_log_level);
            }
        }

        node
    }
}

/// Reads **log.level** from the given config.
///
/// Returns **None** if no level is configured or if the given one is invalid.
fn log_level(config: &Handle) -> Option<LevelFilter> {
    let level = config.query("log.level").as_str()?;
    match level.trim().parse::<LevelFilter>() {
        Ok(level) => Some(level),
        Err(_) => {
            log::warn!(
                "Ignoring invalid log.level: {}. Use one of: error, warn, info, debug.",
                level
            );
            None
        }
    }
}

fn apply_log_level(node: &Node) {
    if let Some(level) = log_level(&node.config().current()) {
        if level != log::max_level() {
            log::info!("Switching log level to {}...", level);
            log::set_max_level(level);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::{log_level, Builder};
    use crate::config::Config;
    use log::LevelFilter;

    fn level_of(settings: &str) -> Option<LevelFilter> {
        let config = Config::new("settings.yml");
        config.load_from_string(settings, None).unwrap();

        log_level(&config.current())
    }

    #[test]
    fn log_levels_are_read_from_the_config() {
        assert_eq!(level_of("log:\n  level: debug"), Some(LevelFilter::Debug));
        assert_eq!(level_of("log:\n  level: info"), Some(LevelFilter::Info));
        assert_eq!(level_of("log:\n  level: WARN"), Some(LevelFilter::Warn));
        assert_eq!(level_of("log:\n  level: error"), Some(LevelFilter::Error));

        // Missing or invalid levels leave the current one in place...
        assert_eq!(level_of("server:\n  port: 8001"), None);
        assert_eq!(level_of("log:\n  level: loud"), None);
        assert_eq!(level_of("log:\n  level: 3"), None);
    }

    #[test]
    fn nodes_start_with_defaults() {
        crate::testing::test_async(async {
            let node = Builder::new()
                .enable_all()
                .disable_signals()
                .with_config_file("target/does-not-exist/settings.yml")
                .build()
                .await;

            assert!(node.is_running());
            assert_eq!(node.pool().settings().self_url, "http://localhost:8001");
            assert!(node.pool().peers().is_empty());
            assert!(node.groups().names().is_empty());

            node.terminate();
        });
    }

    #[test]
    fn config_changes_reach_the_pool() {
        crate::testing::test_async(async {
            let node = Builder::new().build().await;
            crate::http::install(node.clone());

            node.config()
                .load_from_string(
                    "
peers:
    self: http://localhost:8001
    nodes:
        - http://localhost:8001
        - http://localhost:8002
",
                    None,
                )
                .unwrap();

            // The change is applied by a background task...
            for _ in 0..100 {
                if node.pool().peers().len() == 2 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            assert_eq!(node.pool().peers().len(), 2);

            node.terminate();
        });
    }
}
