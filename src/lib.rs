//! jwcache is a distributed read-through cache.
//!
//! # Introduction
//! Each process hosts a set of named caches, called **groups**. A group wraps a slow data source
//! (a database, a remote API, an expensive computation) which is represented by a
//! [Loader](group::Loader). Values are kept in a size constrained LRU cache. On a miss, the group
//! asks its [PeerPicker](peers::PeerPicker) which process of the fleet owns the key. If this is
//! another process, the value is fetched from there, otherwise the loader is invoked and the
//! result is stored locally.
//!
//! Ownership is determined by a [consistent hash ring](ring::HashRing) so that each key has
//! exactly one owner and adding a peer only relocates a small share of all keys. Concurrent misses
//! for the same key are collapsed into a single load by [singleflight](singleflight), therefore
//! a cold cache never stampedes the underlying data source.
//!
//! # Modules
//! * **lru**: the byte budgeted LRU cache which backs each group.
//! * **ring**: the consistent hash ring which maps keys to peers.
//! * **singleflight**: suppresses duplicate concurrent loads of the same key.
//! * **group**: the read path tying all of the above together plus the group registry.
//! * **http**: talks to other peers via HTTP and serves their requests.
//! * **node**, **builder**, **config**, **server**, **signals**: everything needed to run a
//!   cache node as a standalone process (see the `jwcache-node` binary).
//!
//! # Example
//! ```
//! # use jwcache::group::{Groups, LoaderFn};
//! # #[tokio::main]
//! # async fn main() {
//! let groups = Groups::new();
//! let scores = groups.new_group(
//!     "scores",
//!     2 << 10,
//!     LoaderFn(|key: &str| match key {
//!         "Tom" => Ok(b"630".to_vec()),
//!         _ => Err(anyhow::anyhow!("{} not exist", key)),
//!     }),
//! );
//!
//! assert_eq!(scores.get("Tom").await.unwrap().to_string(), "630");
//! assert!(scores.get("Jerry").await.is_err());
//! # }
//! ```
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
#![warn(missing_docs, unused_results)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod config;
pub mod error;
pub mod fmt;
pub mod group;
pub mod http;
pub mod lru;
pub mod node;
pub mod peers;
pub mod ring;
pub mod server;
pub mod signals;
pub mod singleflight;
pub mod view;

pub use error::{Error, Result};

/// Contains the version of the jwcache library.
pub const JWCACHE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the jwcache build being used.
pub const JWCACHE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up a
/// node, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests and embedding applications may call this several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// The join handle is dropped right away, so the task runs detached.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate jwcache;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use std::sync::Mutex;

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test binds a TCP port. This way
        /// all other tests still run in parallel and only the ones fighting over a port block.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }
}
