//! Connects the nodes of a fleet via HTTP.
//!
//! Each node runs an [HttpPool] which serves two purposes:
//! * As [PeerPicker] it knows all peers of the fleet and uses a [HashRing] to determine which
//!   one owns a given key. For each remote peer an [HttpGetter] is kept which fetches values via
//!   `GET <peer><base path><group>/<key>` (group and key being url encoded).
//! * Via [HttpPool::handle] it answers these requests for the groups hosted by the local node.
//!   Additionally it provides `GET /api?group=<group>&key=<key>` for clients outside the fleet
//!   and `GET /stats` which reports the metrics of all groups as text.
//!
//! The set of peers can be replaced at any time (e.g. once the config changed, see [install]).
//! This builds a new ring and swaps it atomically, so that concurrent lookups either see the
//! old or the new topology but never a mixture.
//!
//! # Examples
//!
//! ```
//! # use jwcache::http::{HttpPool, PoolSettings};
//! # use jwcache::peers::PeerPicker;
//! # #[tokio::main]
//! # async fn main() {
//! let pool = HttpPool::new(PoolSettings::new("http://node-1:8001"));
//! pool.set(["http://node-1:8001", "http://node-2:8001", "http://node-3:8001"]);
//!
//! // Keys owned by the node itself are never handed to a remote peer...
//! let remote_keys = (0..100)
//!     .filter(|i| pool.pick_peer(&format!("key-{}", i)).is_some())
//!     .count();
//! assert!(remote_keys > 0 && remote_keys < 100);
//! # }
//! ```
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Client, Method, Request, Response, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use itertools::Itertools;

use crate::config::Handle;
use crate::fmt::parse_duration;
use crate::group::Groups;
use crate::node::Node;
use crate::peers::{PeerGetter, PeerPicker};
use crate::ring::{HashRing, DEFAULT_REPLICAS};
use crate::Error;

/// Contains the path prefix under which peers serve each other.
pub const DEFAULT_BASE_PATH: &str = "/_jwcache/";

/// Contains the default timeout applied when fetching a value from a peer.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_PORT: i64 = 8001;

const OCTET_STREAM: &str = "application/octet-stream";
const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

type HttpClient = Client<HttpsConnector<HttpConnector>>;

fn new_client() -> HttpClient {
    Client::builder().build::<_, Body>(HttpsConnector::new())
}

/// Describes how a node reaches and is reached by its peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSettings {
    /// The URL under which this node is known to its peers (e.g. "http://localhost:8001").
    pub self_url: String,
    /// The path prefix of all peer requests. Always starts and ends with a "/".
    pub base_path: String,
    /// The number of virtual nodes per peer on the hash ring.
    pub replicas: usize,
    /// The timeout applied when fetching a value from a peer.
    pub timeout: Duration,
}

impl PoolSettings {
    /// Creates the default settings for a node known as **self_url**.
    pub fn new(self_url: &str) -> Self {
        PoolSettings {
            self_url: normalize_url(self_url),
            base_path: DEFAULT_BASE_PATH.to_owned(),
            replicas: DEFAULT_REPLICAS,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Reads the **peers** section of the given config.
    ///
    /// If **peers.self** is missing, it is derived from **server.host** and **server.port**.
    /// Invalid values are reported and replaced by their defaults.
    pub fn from_config(config: &Handle) -> Self {
        let self_url = match config.query("peers.self").as_str() {
            Some(url) => url.to_owned(),
            None => {
                let host = match config.query("server.host").as_str() {
                    None | Some("0.0.0.0") => "localhost",
                    Some(host) => host,
                };
                let port = config
                    .query("server.port")
                    .as_i64()
                    .filter(|port| *port > 0 && *port <= u16::MAX as i64)
                    .unwrap_or(DEFAULT_PORT);

                format!("http://{}:{}", host, port)
            }
        };

        let mut settings = PoolSettings::new(&self_url);

        if let Some(base_path) = config.query("peers.base_path").as_str() {
            settings.base_path = normalize_base_path(base_path);
        }

        match config.query("peers.replicas").as_i64() {
            Some(replicas) if replicas > 0 => settings.replicas = replicas as usize,
            Some(replicas) => log::warn!(
                "Ignoring invalid peers.replicas: {}. Using {}.",
                replicas,
                DEFAULT_REPLICAS
            ),
            None => {}
        }

        let timeout = config.query("peers.timeout");
        if let Some(timeout) = timeout.as_str() {
            match parse_duration(timeout) {
                Ok(timeout) => settings.timeout = timeout,
                Err(error) => log::warn!("Ignoring invalid peers.timeout: {}", error),
            }
        } else if let Some(millis) = timeout.as_i64().filter(|millis| *millis > 0) {
            settings.timeout = Duration::from_millis(millis as u64);
        }

        settings
    }
}

/// Reads the list of peers (**peers.nodes**) from the given config.
fn peers_from_config(config: &Handle) -> Vec<String> {
    config
        .query("peers.nodes")
        .as_vec()
        .map(|nodes| {
            nodes
                .iter()
                .filter_map(|node| node.as_str())
                .map(normalize_url)
                .collect()
        })
        .unwrap_or_default()
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_owned()
}

fn normalize_base_path(path: &str) -> String {
    let path = path.trim().trim_matches('/');
    if path.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}/", path)
    }
}

/// Represents the topology as seen by a node at a given point in time.
struct PeerSet {
    settings: PoolSettings,
    peers: Vec<String>,
    ring: HashRing,
    getters: HashMap<String, Arc<HttpGetter>>,
}

impl PeerSet {
    fn new(settings: PoolSettings, peers: Vec<String>, client: &HttpClient) -> Self {
        let peers: Vec<String> = peers.into_iter().unique().collect();

        let mut ring = HashRing::new(settings.replicas);
        ring.add(&peers);

        let getters = peers
            .iter()
            .map(|peer| {
                let getter = HttpGetter::with_client(
                    &format!("{}{}", peer, settings.base_path),
                    settings.timeout,
                    client.clone(),
                );
                (peer.clone(), Arc::new(getter))
            })
            .collect();

        PeerSet {
            settings,
            peers,
            ring,
            getters,
        }
    }
}

/// Locates the owners of keys and answers the requests of other peers.
pub struct HttpPool {
    client: HttpClient,
    peers: ArcSwap<PeerSet>,
}

impl HttpPool {
    /// Creates a pool which doesn't know any peers yet.
    ///
    /// Until [set](HttpPool::set) is called, all keys are loaded locally.
    pub fn new(settings: PoolSettings) -> Self {
        let client = new_client();
        let peers = PeerSet::new(settings, Vec::new(), &client);

        HttpPool {
            client,
            peers: ArcSwap::new(Arc::new(peers)),
        }
    }

    /// Creates a pool using the settings and peers of the given config.
    pub fn from_config(config: &Handle) -> Self {
        let pool = HttpPool::new(PoolSettings::from_config(config));
        pool.set(peers_from_config(config));

        pool
    }

    /// Replaces the set of peers.
    ///
    /// The list should contain the node itself (as given in **self_url**), so that it also owns
    /// a share of the keys.
    pub fn set<I, S>(&self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers = peers
            .into_iter()
            .map(|peer| normalize_url(peer.as_ref()))
            .collect();
        self.install(self.settings(), peers);
    }

    /// Applies the **peers** section of the given config.
    ///
    /// Nothing happens if neither the settings nor the list of peers changed.
    pub fn update_from_config(&self, config: &Handle) {
        let settings = PoolSettings::from_config(config);
        let peers: Vec<String> = peers_from_config(config).into_iter().unique().collect();

        let current = self.peers.load();
        if current.settings == settings && current.peers == peers {
            return;
        }

        self.install(settings, peers);
    }

    fn install(&self, settings: PoolSettings, peers: Vec<String>) {
        let peer_set = PeerSet::new(settings, peers, &self.client);
        log::info!(
            "[Server {}] Using {} peer(s): {}",
            &peer_set.settings.self_url,
            peer_set.peers.len(),
            peer_set.peers.join(", ")
        );

        self.peers.store(Arc::new(peer_set));
    }

    /// Returns the settings currently in use.
    pub fn settings(&self) -> PoolSettings {
        self.peers.load().settings.clone()
    }

    /// Lists all known peers (including the node itself).
    pub fn peers(&self) -> Vec<String> {
        self.peers.load().peers.clone()
    }

    /// Answers an HTTP request.
    ///
    /// Serves the following routes (the fixed ones are matched first, so that they remain
    /// reachable even if the base path is "/"):
    /// * `GET <base path><group>/<key>`: used by other peers to fetch a value. Responds with
    ///   **400** for a malformed path, **404** for an unknown group, **500** if the value cannot
    ///   be loaded and **200** with the raw bytes of the value otherwise.
    /// * `GET /api?group=<group>&key=<key>`: the same for clients outside the fleet.
    /// * `GET /stats`: the metrics of all groups as plain text.
    pub async fn handle(&self, groups: &Groups, request: Request<Body>) -> Response<Body> {
        let peers = self.peers.load_full();
        let path = request.uri().path().to_owned();
        log::debug!(
            "[Server {}] {} {}",
            &peers.settings.self_url,
            request.method(),
            &path
        );

        if request.method() != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        // The fixed routes take precedence, as the base path might be "/"...
        if path == "/api" {
            let query = request.uri().query().unwrap_or("").to_owned();
            match (query_parameter(&query, "group"), query_parameter(&query, "key")) {
                (Some(group), Some(key)) => fetch(groups, &group, &key).await,
                (None, _) => text(StatusCode::BAD_REQUEST, "missing parameter: group"),
                (_, None) => text(StatusCode::BAD_REQUEST, "missing parameter: key"),
            }
        } else if path == "/stats" {
            text(StatusCode::OK, render_stats(groups))
        } else if let Some(group_and_key) = path.strip_prefix(peers.settings.base_path.as_str()) {
            match parse_group_and_key(group_and_key) {
                Some((group, key)) => fetch(groups, &group, &key).await,
                None => text(StatusCode::BAD_REQUEST, "bad request"),
            }
        } else {
            text(StatusCode::NOT_FOUND, "not found")
        }
    }
}

impl PeerPicker for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let peers = self.peers.load();
        let owner = peers.ring.get(key)?;
        if owner == peers.settings.self_url {
            return None;
        }

        log::debug!(
            "[Server {}] Pick peer {} for '{}'",
            &peers.settings.self_url,
            owner,
            key
        );
        let getter: Arc<dyn PeerGetter> = peers.getters.get(owner)?.clone();

        Some(getter)
    }
}

/// Splits and decodes "<group>/<key>".
fn parse_group_and_key(path: &str) -> Option<(String, String)> {
    let (group, key) = path.split_once('/')?;
    let group = urlencoding::decode(group).ok()?;
    let key = urlencoding::decode(key).ok()?;

    Some((group.into_owned(), key.into_owned()))
}

/// Extracts and decodes the first value of the given parameter from a query string.
fn query_parameter(query: &str, name: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| {
            urlencoding::decode(&value.replace('+', " "))
                .map(|value| value.into_owned())
                .ok()
        })
}

async fn fetch(groups: &Groups, group_name: &str, key: &str) -> Response<Body> {
    let group = match groups.get_group(group_name) {
        Some(group) => group,
        None => {
            return text(
                StatusCode::NOT_FOUND,
                Error::UnknownGroup(group_name.to_owned()).to_string(),
            )
        }
    };

    match group.get(key).await {
        Ok(value) => respond(StatusCode::OK, OCTET_STREAM, Body::from(value.to_bytes())),
        Err(error @ Error::EmptyKey) => text(StatusCode::BAD_REQUEST, error.to_string()),
        Err(error) => text(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

fn render_stats(groups: &Groups) -> String {
    let mut result = String::new();
    for group in groups.all() {
        result += format!("Group: {}\n", group.name()).as_str();
        result += format!("{:-<51}\n", "").as_str();
        result += group.stats().to_string().as_str();
        result += "\n";
    }

    result
}

fn text(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    respond(status, PLAIN_TEXT, Body::from(message.into()))
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let _ = response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    response
}

/// Fetches values from a remote peer via HTTP.
pub struct HttpGetter {
    base_url: String,
    timeout: Duration,
    client: HttpClient,
}

impl HttpGetter {
    /// Creates a getter for the given URL which is the URL of the peer followed by its base path
    /// (e.g. "http://localhost:8001/_jwcache/").
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        HttpGetter::with_client(base_url, timeout, new_client())
    }

    fn with_client(base_url: &str, timeout: Duration, client: HttpClient) -> Self {
        HttpGetter {
            base_url: base_url.to_owned(),
            timeout,
            client,
        }
    }

    /// Returns the URL prefix of all requests sent by this getter.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, uri: Uri) -> anyhow::Result<Bytes> {
        let response = self
            .client
            .get(uri)
            .await
            .context("Failed to send request")?;

        if response.status() != StatusCode::OK {
            return Err(anyhow::anyhow!("server returned: {}", response.status()));
        }

        hyper::body::to_bytes(response.into_body())
            .await
            .context("Failed to read response body")
    }
}

#[async_trait]
impl PeerGetter for HttpGetter {
    async fn get(&self, group: &str, key: &str) -> anyhow::Result<Bytes> {
        let url = format!(
            "{}{}/{}",
            self.base_url,
            urlencoding::encode(group),
            urlencoding::encode(key)
        );
        let uri = url
            .parse::<Uri>()
            .with_context(|| format!("Invalid peer url: {}", url))?;

        tokio::time::timeout(self.timeout, self.fetch(uri))
            .await
            .map_err(|_| anyhow::anyhow!("Request to {} timed out after {:?}", url, self.timeout))?
            .with_context(|| format!("Failed to fetch {}", url))
    }
}

/// Applies the current config to the pool of the given node and keeps it up to date.
///
/// Note that this is called by the [Builder](crate::builder::Builder) unless the config is
/// disabled.
pub fn install(node: Arc<Node>) {
    node.pool().update_from_config(&node.config().current());

    crate::config::on_change(node, |node| {
        node.pool().update_from_config(&node.config().current())
    });
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::group::{Groups, LoaderFn};
    use crate::http::{query_parameter, HttpPool, PoolSettings, DEFAULT_BASE_PATH};
    use crate::peers::PeerPicker;
    use crate::testing::test_async;
    use hyper::{Body, Method, Request, Response, StatusCode};
    use std::time::Duration;

    fn scores() -> Groups {
        let groups = Groups::new();
        let _ = groups.new_group(
            "scores",
            0,
            LoaderFn(|key: &str| match key {
                "Tom" => Ok(b"630".to_vec()),
                "Jack/Jill" => Ok(b"589".to_vec()),
                _ => Err(anyhow::anyhow!("{} not exist", key)),
            }),
        );

        groups
    }

    async fn call(pool: &HttpPool, groups: &Groups, method: Method, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();

        pool.handle(groups, request).await
    }

    async fn body(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn peer_requests_are_answered() {
        test_async(async {
            let pool = HttpPool::new(PoolSettings::new("http://localhost:8001"));
            let groups = scores();

            let response = call(&pool, &groups, Method::GET, "/_jwcache/scores/Tom").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()["content-type"],
                "application/octet-stream"
            );
            assert_eq!(body(response).await, "630");

            // Group and key are url encoded...
            let response = call(&pool, &groups, Method::GET, "/_jwcache/scores/Jack%2FJill").await;
            assert_eq!(body(response).await, "589");
        });
    }

    #[test]
    fn failures_are_mapped_to_status_codes() {
        test_async(async {
            let pool = HttpPool::new(PoolSettings::new("http://localhost:8001"));
            let groups = scores();

            let response = call(&pool, &groups, Method::GET, "/_jwcache/scores").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let response = call(&pool, &groups, Method::GET, "/_jwcache/scores/").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let response = call(&pool, &groups, Method::GET, "/_jwcache/unknown/Tom").await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(body(response).await, "no such group: unknown");

            let response = call(&pool, &groups, Method::GET, "/_jwcache/scores/Jerry").await;
            assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
            assert!(body(response).await.contains("Jerry not exist"));

            let response = call(&pool, &groups, Method::POST, "/_jwcache/scores/Tom").await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

            let response = call(&pool, &groups, Method::GET, "/unknown").await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        });
    }

    #[test]
    fn api_and_stats_are_served() {
        test_async(async {
            let pool = HttpPool::new(PoolSettings::new("http://localhost:8001"));
            let groups = scores();

            let response = call(&pool, &groups, Method::GET, "/api?group=scores&key=Tom").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body(response).await, "630");

            let response = call(&pool, &groups, Method::GET, "/api?key=Tom").await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);

            let response = call(&pool, &groups, Method::GET, "/stats").await;
            assert_eq!(response.status(), StatusCode::OK);
            let stats = body(response).await;
            assert!(stats.contains("Group: scores"));
            assert!(stats.contains("Local Loads"));
        });
    }

    #[test]
    fn api_and_stats_remain_reachable_with_a_root_base_path() {
        test_async(async {
            let mut settings = PoolSettings::new("http://localhost:8001");
            settings.base_path = "/".to_owned();
            let pool = HttpPool::new(settings);
            let groups = scores();

            let response = call(&pool, &groups, Method::GET, "/api?group=scores&key=Tom").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body(response).await, "630");

            let response = call(&pool, &groups, Method::GET, "/stats").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(body(response).await.contains("Group: scores"));

            // Peer requests are still served below the root...
            let response = call(&pool, &groups, Method::GET, "/scores/Tom").await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body(response).await, "630");
        });
    }

    #[test]
    fn query_parameters_are_decoded() {
        assert_eq!(
            query_parameter("group=scores&key=Jack+Jill", "key"),
            Some("Jack Jill".to_owned())
        );
        assert_eq!(
            query_parameter("group=scores&key=a%26b", "key"),
            Some("a&b".to_owned())
        );
        assert_eq!(query_parameter("group=scores", "key"), None);
    }

    #[test]
    fn pool_never_picks_itself() {
        test_async(async {
            let pool = HttpPool::new(PoolSettings::new("http://localhost:8001"));

            // Without any peers, everything is local...
            assert!(pool.pick_peer("Tom").is_none());

            pool.set(["http://localhost:8001/", "http://localhost:8002"]);
            assert_eq!(
                pool.peers(),
                vec![
                    "http://localhost:8001".to_owned(),
                    "http://localhost:8002".to_owned()
                ]
            );

            let mut local = 0;
            let mut remote = 0;
            for i in 0..200 {
                match pool.pick_peer(&format!("key-{}", i)) {
                    Some(_) => remote += 1,
                    None => local += 1,
                }
            }
            assert!(local > 0);
            assert!(remote > 0);

            // Only knowing the node itself means that everything is local again...
            pool.set(["http://localhost:8001"]);
            assert!((0..200).all(|i| pool.pick_peer(&format!("key-{}", i)).is_none()));
        });
    }

    #[test]
    fn settings_are_read_from_the_config() {
        test_async(async {
            let config = Config::new("settings.yml");
            config
                .load_from_string(
                    "
server:
    port: 8002
peers:
    base_path: cache
    replicas: 10
    timeout: 250ms
    nodes:
        - http://localhost:8001
        - http://localhost:8002
        - http://localhost:8002
",
                    None,
                )
                .unwrap();

            let pool = HttpPool::from_config(&config.current());
            let settings = pool.settings();
            assert_eq!(settings.self_url, "http://localhost:8002");
            assert_eq!(settings.base_path, "/cache/");
            assert_eq!(settings.replicas, 10);
            assert_eq!(settings.timeout, Duration::from_millis(250));
            assert_eq!(pool.peers().len(), 2);

            // Changing the config replaces the peers...
            config
                .load_from_string(
                    "
peers:
    self: http://localhost:8002
    nodes:
        - http://localhost:8002
",
                    None,
                )
                .unwrap();
            pool.update_from_config(&config.current());
            assert_eq!(pool.peers(), vec!["http://localhost:8002".to_owned()]);
            assert_eq!(pool.settings().base_path, DEFAULT_BASE_PATH);
        });
    }
}
