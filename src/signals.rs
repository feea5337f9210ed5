//! Terminates a node on CTRL+C or SIGHUP.
//!
//! Forks an async task which waits for either **CTRL+C** or **SIGHUP** and then invokes
//! [Node::terminate](crate::node::Node::terminate) on the given node. This makes the
//! [server](crate::server::Server) close its socket so that the event loop returns.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::node::Node;
use crate::spawn;

/// Installs a signal handler for the given node.
///
/// Note that this is automatically called by the [Builder](crate::builder::Builder) unless it is
/// disabled.
pub fn install(node: Arc<Node>) {
    spawn!(async move {
        let mut sig_hup = match tokio::signal::unix::signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(error) => {
                log::error!("Failed to install a handler for SIGHUP: {}", error);
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received CTRL-C. Shutting down...");
            },
            _ = sig_hup.recv() => {
                log::info!("Received SIGHUP. Shutting down...");
            }
        }

        node.terminate();
    });
}
