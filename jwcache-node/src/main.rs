//! Runs a standalone cache node.
//!
//! All groups are declared in the **groups** section of **config/settings.yml**. Each group is
//! backed by the static table given as its **source**, which stands in for a slow database:
//!
//! ```yaml
//! groups:
//!     scores:
//!         max_memory: 2k
//!         source:
//!             Tom: 630
//!             Jack: 589
//!             Sam: 567
//! ```
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use jwcache::builder::Builder;
use jwcache::fmt::parse_size;
use jwcache::group::Loader;
use jwcache::node::Node;
use jwcache::server::Server;
use yaml_rust::Yaml;

const DEFAULT_MAX_MEMORY: usize = 2 << 10;

/// Serves the values of a static table and logs each access.
struct TableLoader {
    group: String,
    table: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl Loader for TableLoader {
    async fn load(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        log::info!("[SlowDB] Searching '{}' in {}...", key, &self.group);
        self.table
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} not exist", key))
    }
}

fn scalar(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(value) => Some(value.clone()),
        Yaml::Integer(value) => Some(value.to_string()),
        Yaml::Real(value) => Some(value.clone()),
        Yaml::Boolean(value) => Some(value.to_string()),
        _ => None,
    }
}

fn max_memory(settings: &Yaml) -> anyhow::Result<usize> {
    match &settings["max_memory"] {
        Yaml::String(size) => parse_size(size),
        Yaml::Integer(size) => usize::try_from(*size).context("max_memory must not be negative"),
        _ => Ok(DEFAULT_MAX_MEMORY),
    }
}

fn table(name: &str, settings: &Yaml) -> HashMap<String, Vec<u8>> {
    let mut table = HashMap::new();
    if let Some(source) = settings["source"].as_hash() {
        for (key, value) in source {
            match (scalar(key), scalar(value)) {
                (Some(key), Some(value)) => {
                    let _ = table.insert(key, value.into_bytes());
                }
                _ => log::warn!("Skipping a non-scalar entry in the source of {}.", name),
            }
        }
    }

    table
}

/// Creates all groups declared in the config of the given node.
fn setup_groups(node: &Arc<Node>) -> anyhow::Result<()> {
    let config = node.config().current();
    let groups = match config.query("groups").as_hash() {
        Some(groups) => groups,
        None => {
            log::warn!("No groups have been configured.");
            return Ok(());
        }
    };

    for (name, settings) in groups {
        let name = name.as_str().context("Group names have to be strings.")?;
        let max_memory =
            max_memory(settings).with_context(|| format!("Invalid max_memory for {}", name))?;

        let _ = node.new_group(
            name,
            max_memory,
            TableLoader {
                group: name.to_owned(),
                table: table(name, settings),
            },
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let node = Builder::new().enable_all().build().await;

    if let Err(error) = setup_groups(&node) {
        log::error!("Failed to set up groups: {:#}", error);
    }

    Server::new(&node).event_loop().await;
}

#[cfg(test)]
mod tests {
    use crate::setup_groups;
    use jwcache::config::Config;
    use jwcache::node::Node;
    use std::sync::Arc;

    fn node(settings: &str) -> Arc<Node> {
        let config = Arc::new(Config::new("settings.yml"));
        config.load_from_string(settings, None).unwrap();

        Node::new(config)
    }

    #[test]
    fn groups_are_created_from_the_config() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let node = node(
                "
groups:
    scores:
        max_memory: 1k
        source:
            Tom: 630
            Jack: '589'
    empty:
        max_memory: 64
",
            );
            setup_groups(&node).unwrap();

            let scores = node.groups().get_group("scores").unwrap();
            assert_eq!(scores.get("Tom").await.unwrap().to_string(), "630");
            assert_eq!(scores.get("Jack").await.unwrap().to_string(), "589");
            assert!(scores.get("Sam").await.is_err());
            assert_eq!(scores.stats().max_memory, 1024);

            let empty = node.groups().get_group("empty").unwrap();
            assert!(empty.get("Tom").await.is_err());
            assert_eq!(empty.stats().max_memory, 64);
        });
    }

    #[test]
    fn invalid_sizes_are_reported() {
        let node = node(
            "
groups:
    scores:
        max_memory: lots
",
        );
        assert!(setup_groups(&node).is_err());
    }
}
