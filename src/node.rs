//! Host lifecycle wiring
//!
//! A [`Node`] owns the advertiser and the membership watcher of one process
//! and drives them from the host's application-started and
//! application-stopped hooks.

use beacon_config::ConfigManager;
use beacon_discovery::{Advertiser, Connector, DiscoveryError, MembershipWatcher, ServerIdentity};
use std::sync::Arc;
use tracing::info;

/// Discovery components of one server process.
pub struct Node {
    advertiser: Option<Advertiser>,
    watcher: Option<MembershipWatcher>,
}

impl Node {
    /// Node that advertises `identity` and watches the cluster
    pub fn new<C>(connector: C, config: ConfigManager, identity: ServerIdentity) -> Self
    where
        C: Connector + Clone + 'static,
    {
        Self::builder(connector, config)
            .advertise(identity)
            .watch()
            .build()
    }

    pub fn builder<C>(connector: C, config: ConfigManager) -> NodeBuilder<C>
    where
        C: Connector + Clone + 'static,
    {
        NodeBuilder {
            connector,
            config,
            identity: None,
            watch: false,
        }
    }

    /// Application-started hook: register, then start watching.
    ///
    /// If the watcher cannot start the registration is withdrawn again.
    pub async fn started(&self) -> Result<(), DiscoveryError> {
        if let Some(advertiser) = &self.advertiser {
            advertiser.start().await?;
        }

        if let Some(watcher) = &self.watcher {
            if let Err(e) = watcher.start().await {
                if let Some(advertiser) = &self.advertiser {
                    advertiser.stop().await;
                }
                return Err(e);
            }
        }

        info!(
            advertising = self.advertiser.is_some(),
            watching = self.watcher.is_some(),
            "Discovery started"
        );
        Ok(())
    }

    /// Application-stopped hook: stop watching, then deregister.
    pub async fn stopped(&self) {
        if let Some(watcher) = &self.watcher {
            watcher.stop().await;
        }
        if let Some(advertiser) = &self.advertiser {
            advertiser.stop().await;
        }
        info!("Discovery stopped");
    }

    /// Current server URLs; empty when not watching
    pub fn urls(&self) -> Arc<Vec<String>> {
        self.watcher
            .as_ref()
            .map(|w| w.urls())
            .unwrap_or_default()
    }

    pub fn advertiser(&self) -> Option<&Advertiser> {
        self.advertiser.as_ref()
    }

    pub fn watcher(&self) -> Option<&MembershipWatcher> {
        self.watcher.as_ref()
    }
}

/// Builder for [`Node`]
pub struct NodeBuilder<C> {
    connector: C,
    config: ConfigManager,
    identity: Option<ServerIdentity>,
    watch: bool,
}

impl<C> NodeBuilder<C>
where
    C: Connector + Clone + 'static,
{
    /// Register this process under `identity`
    pub fn advertise(mut self, identity: ServerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Maintain a membership list
    pub fn watch(mut self) -> Self {
        self.watch = true;
        self
    }

    pub fn build(self) -> Node {
        let advertiser = self
            .identity
            .map(|identity| Advertiser::new(self.connector.clone(), self.config.clone(), identity));
        let watcher = self
            .watch
            .then(|| MembershipWatcher::new(self.connector, self.config));

        Node {
            advertiser,
            watcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_discovery::{InMemoryNamespace, ROOT_PATH};

    fn config() -> ConfigManager {
        ConfigManager::from_pairs([("beacon.connection", "memory"), ("beacon.retry_interval", "1")])
    }

    #[tokio::test]
    async fn test_node_sees_itself() {
        let namespace = InMemoryNamespace::new();
        let node = Node::new(namespace.clone(), config(), "host1:8080".into());

        node.started().await.unwrap();
        assert_eq!(*node.urls(), vec!["http://host1:8080/remoting"]);

        node.stopped().await;
        assert!(node.urls().is_empty());
        assert!(namespace.records(ROOT_PATH).is_empty());
    }

    #[tokio::test]
    async fn test_watch_only_node() {
        let namespace = InMemoryNamespace::new();
        let node = Node::builder(namespace.clone(), config()).watch().build();

        node.started().await.unwrap();
        assert!(node.advertiser().is_none());
        assert!(namespace.records(ROOT_PATH).is_empty());
        node.stopped().await;
    }

    #[tokio::test]
    async fn test_advertise_only_node_has_no_urls() {
        let namespace = InMemoryNamespace::new();
        let node = Node::builder(namespace.clone(), config())
            .advertise("host1:8080".into())
            .build();

        node.started().await.unwrap();
        assert!(node.urls().is_empty());
        assert_eq!(namespace.records(ROOT_PATH).len(), 1);
        node.stopped().await;
    }
}
