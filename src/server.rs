//! Contains the HTTP server of a cache node.
//!
//! Opens a server socket on the configured port (**server.port** in the config or 8001 as
//! fallback) and binds it to the selected IP (**server.host** in the config or 0.0.0.0 as
//! fallback). All requests are answered by [HttpPool::handle](crate::http::HttpPool::handle).
//!
//! If the address cannot be bound, the server retries every 500ms. Therefore a new instance of a
//! node can be started while the old one is still shutting down and the port is handed over with
//! minimal downtime. Also the server listens for config changes and relocates to another host or
//! port if required.
//!
//! # Example
//!
//! ```no_run
//! use jwcache::builder::Builder;
//! use jwcache::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     let node = Builder::new().enable_all().build().await;
//!
//!     // Use a different port than a production instance...
//!     node.config().load_from_string("
//!         server:
//!             port: 1503
//!     ", None).unwrap();
//!
//!     Server::new(&node).event_loop().await;
//! }
//! ```
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use hyper::service::{make_service_fn, service_fn};

use crate::node::Node;
use crate::spawn;

const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const BIND_ERROR_REPORT_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(500);

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: i64 = 8001;

/// Serves the peer protocol and the client API of a node.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    node: Arc<Node>,
}

impl Server {
    /// Creates a new server for the given node.
    ///
    /// Note that the server has to be started via [event_loop](Server::event_loop) or
    /// [fork](Server::fork).
    pub fn new(node: &Arc<Node>) -> Arc<Self> {
        Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            node: node.clone(),
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the address the server socket is currently bound to.
    pub fn current_address(&self) -> Option<String> {
        self.current_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_current_address(&self, address: Option<String>) {
        *self
            .current_address
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = address;
    }

    fn address(&self) -> String {
        let handle = self.node.config().current();
        format!(
            "{}:{}",
            handle
                .query("server.host")
                .as_str()
                .unwrap_or(DEFAULT_HOST),
            handle
                .query("server.port")
                .as_i64()
                .filter(|port| *port > 0 && *port <= u16::MAX as i64)
                .unwrap_or(DEFAULT_PORT)
        )
    }

    /// Starts the event loop in a separate task.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate task and waits until the server socket is bound.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.current_address().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Binds the server socket and serves requests until the node is terminated.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported: Option<Instant> = None;

        while self.node.is_running() {
            // Started for the first time or relocated due to a config change...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            match self.bind(&address).await {
                Ok(server) => {
                    log::info!("Opened server socket on {}...", &address);
                    self.set_current_address(Some(address.clone()));

                    if let Err(error) = server.await {
                        log::error!("Server on {} failed: {}", &address, error);
                    }

                    self.set_current_address(None);
                    log::info!("Closing server socket on {}.", &address);
                }
                Err(error) => {
                    // We retry every 500ms, so only report every once in a while...
                    if last_bind_error_reported
                        .map(|reported| reported.elapsed() > BIND_ERROR_REPORT_INTERVAL)
                        .unwrap_or(true)
                    {
                        log::error!(
                            "Cannot open server address {}: {:#}. Retrying every 500ms...",
                            &address,
                            error
                        );
                        last_bind_error_reported = Some(Instant::now());
                    }
                    tokio::time::sleep(BIND_RETRY_INTERVAL).await;
                }
            }
        }
    }

    async fn bind(
        &self,
        address: &str,
    ) -> anyhow::Result<impl std::future::Future<Output = hyper::Result<()>> + '_> {
        let listener = tokio::net::TcpListener::bind(address)
            .await
            .context("Failed to bind socket")?;
        let builder = hyper::Server::from_tcp(listener.into_std()?)
            .context("Failed to set up server")?;

        let node = self.node.clone();
        let make_service = make_service_fn(move |_connection| {
            let node = node.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| {
                    let node = node.clone();
                    async move {
                        Ok::<_, Infallible>(node.pool().handle(node.groups(), request).await)
                    }
                }))
            }
        });

        Ok(builder
            .serve(make_service)
            .with_graceful_shutdown(self.await_shutdown()))
    }

    /// Completes once the node is terminated or the server has to relocate.
    async fn await_shutdown(&self) {
        let mut config_changed = self.node.config().notifier();

        while self.node.is_running() {
            tokio::select! {
                _ = tokio::time::sleep(SHUTDOWN_CHECK_INTERVAL) => {}
                _ = config_changed.recv() => {
                    let relocated = self
                        .current_address()
                        .map(|current| current != self.address())
                        .unwrap_or(false);
                    if relocated {
                        log::info!("Server address has changed. Restarting server socket...");

                        // Force the event loop to re-evaluate the address...
                        self.running.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::group::{Loader, LoaderFn};
    use crate::http::{HttpGetter, DEFAULT_TIMEOUT};
    use crate::node::Node;
    use crate::peers::PeerGetter;
    use crate::server::Server;
    use crate::testing::{test_async, SHARED_TEST_RESOURCES};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn node(port: u16, peers: &[u16]) -> Arc<Node> {
        let mut settings = format!(
            "
server:
    host: 127.0.0.1
    port: {}
peers:
    self: http://127.0.0.1:{}
    nodes:
",
            port, port
        );
        for peer in peers {
            settings += format!("        - http://127.0.0.1:{}\n", peer).as_str();
        }

        let config = Arc::new(Config::new("settings.yml"));
        config.load_from_string(&settings, None).unwrap();

        Node::new(config)
    }

    async fn stop(server: &Arc<Server>, node: &Arc<Node>) {
        node.terminate();
        while server.current_address().is_some() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Serves "<key>@<port>" and counts its invocations.
    struct CountingLoader {
        port: u16,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Loader for CountingLoader {
        async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
            let _ = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}@{}", key, self.port).into_bytes())
        }
    }

    #[test]
    fn values_are_served_via_http() {
        let _guard = SHARED_TEST_RESOURCES
            .lock()
            .unwrap_or_else(|error| error.into_inner());

        test_async(async {
            let node = node(17901, &[17901]);
            let _ = node.new_group(
                "scores",
                0,
                LoaderFn(|key: &str| match key {
                    "Tom" => Ok(b"630".to_vec()),
                    _ => Err(anyhow::anyhow!("{} not exist", key)),
                }),
            );

            let server = Server::new(&node);
            Server::fork_and_await(&server).await;
            assert_eq!(server.current_address(), Some("127.0.0.1:17901".to_owned()));

            let getter = HttpGetter::new("http://127.0.0.1:17901/_jwcache/", DEFAULT_TIMEOUT);
            assert_eq!(&getter.get("scores", "Tom").await.unwrap()[..], b"630");

            let error = getter.get("scores", "Jerry").await.unwrap_err();
            assert!(format!("{:#}", error).contains("500"));

            let error = getter.get("unknown", "Tom").await.unwrap_err();
            assert!(format!("{:#}", error).contains("404"));

            stop(&server, &node).await;
        });
    }

    #[test]
    fn keys_are_loaded_by_their_owner() {
        let _guard = SHARED_TEST_RESOURCES
            .lock()
            .unwrap_or_else(|error| error.into_inner());

        test_async(async {
            let ports = [17911, 17912];
            let first = node(ports[0], &ports);
            let second = node(ports[1], &ports);

            let first_calls = Arc::new(AtomicUsize::new(0));
            let second_calls = Arc::new(AtomicUsize::new(0));
            let first_group = first.new_group(
                "scores",
                0,
                CountingLoader {
                    port: ports[0],
                    calls: first_calls.clone(),
                },
            );
            let _ = second.new_group(
                "scores",
                0,
                CountingLoader {
                    port: ports[1],
                    calls: second_calls.clone(),
                },
            );

            let first_server = Server::new(&first);
            let second_server = Server::new(&second);
            Server::fork_and_await(&first_server).await;
            Server::fork_and_await(&second_server).await;

            for i in 0..20 {
                let key = format!("key-{}", i);
                let value = first_group.get(&key).await.unwrap().to_string();
                assert!(value == format!("{}@17911", key) || value == format!("{}@17912", key));
            }

            // Both nodes own a share of the keys...
            let local = first_calls.load(Ordering::SeqCst);
            let remote = second_calls.load(Ordering::SeqCst);
            assert_eq!(local + remote, 20);
            assert!(local > 0);
            assert!(remote > 0);

            let stats = first_group.stats();
            assert_eq!(stats.peer_loads as usize, remote);
            assert_eq!(stats.local_loads as usize, local);

            stop(&first_server, &first).await;
            stop(&second_server, &second).await;
        });
    }

    #[test]
    fn unreachable_peers_fall_back_to_the_loader() {
        let _guard = SHARED_TEST_RESOURCES
            .lock()
            .unwrap_or_else(|error| error.into_inner());

        test_async(async {
            // The second peer is never started...
            let ports = [17921, 17922];
            let node = node(ports[0], &ports);
            let calls = Arc::new(AtomicUsize::new(0));
            let group = node.new_group(
                "scores",
                0,
                CountingLoader {
                    port: ports[0],
                    calls: calls.clone(),
                },
            );

            for i in 0..20 {
                let key = format!("key-{}", i);
                assert_eq!(
                    group.get(&key).await.unwrap().to_string(),
                    format!("{}@17921", key)
                );
            }

            assert_eq!(calls.load(Ordering::SeqCst), 20);
            assert!(group.stats().peer_errors > 0);
        });
    }
}
