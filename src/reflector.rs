//! Named-link registry and bundle fan-out.
//!
//! The [`Reflector`] is the distributor the relay pairs with its listener:
//! it registers each admitted reverse link under its site name, refuses
//! duplicate names, and reflects every bundle received on one link out all
//! the others. A periodic reaper removes transient links that have reached
//! Down (peer goodbye, silence), releasing their site names for re-join.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::link::{BundleSink, Link, LinkState};
use crate::relay::Distributor;

/// Cadence of the terminal-link reaper.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Registry of live links keyed by site name.
pub struct Reflector {
    links: RwLock<HashMap<String, Link>>,
}

impl Default for Reflector {
    fn default() -> Self {
        Self::new()
    }
}

impl Reflector {
    /// An empty registry.
    pub fn new() -> Self {
        Self { links: RwLock::new(HashMap::new()) }
    }

    /// Look up a link by site name.
    pub async fn link(&self, name: &str) -> Option<Link> {
        self.links.read().await.get(name).cloned()
    }

    /// Registered site names.
    pub async fn names(&self) -> Vec<String> {
        self.links.read().await.keys().cloned().collect()
    }

    /// Number of registered links.
    pub async fn len(&self) -> usize {
        self.links.read().await.len()
    }

    /// True when no links are registered.
    pub async fn is_empty(&self) -> bool {
        self.links.read().await.is_empty()
    }

    /// Unregister and tear down one link.
    pub async fn remove(&self, name: &str) -> bool {
        let removed = self.links.write().await.remove(name);
        match removed {
            Some(link) => {
                link.down().await;
                info!(site = name, "removed link");
                true
            }
            None => false,
        }
    }

    /// Tear down and unregister every link.
    pub async fn down_all(&self) {
        let drained: Vec<(String, Link)> =
            self.links.write().await.drain().collect();
        for (name, link) in drained {
            debug!(site = %name, "taking link down");
            link.down().await;
        }
    }

    /// Remove transient links that have reached Down, releasing their site
    /// names. Returns how many were reaped.
    pub async fn reap_terminal(&self) -> usize {
        let terminal: Vec<String> = {
            let links = self.links.read().await;
            links
                .iter()
                .filter(|(_, link)| link.is_transient() && link.state() == LinkState::Down)
                .map(|(name, _)| name.clone())
                .collect()
        };

        if terminal.is_empty() {
            return 0;
        }

        let mut links = self.links.write().await;
        let mut reaped = 0;
        for name in terminal {
            // Re-check under the write lock; a re-join may have replaced
            // the entry.
            let still_terminal = links
                .get(&name)
                .map(|link| link.is_transient() && link.state() == LinkState::Down)
                .unwrap_or(false);
            if still_terminal {
                links.remove(&name);
                info!(site = %name, "reaped terminal link, site name released");
                reaped += 1;
            }
        }
        reaped
    }

    /// Start the periodic terminal-link reaper. The task exits once the
    /// reflector is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let reflector: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REAP_INTERVAL);
            loop {
                interval.tick().await;
                let Some(reflector) = reflector.upgrade() else { break };
                let reaped = reflector.reap_terminal().await;
                if reaped > 0 {
                    debug!(reaped, "reaper pass complete");
                }
            }
        })
    }
}

#[async_trait]
impl Distributor for Reflector {
    async fn contains_link_with_name(&self, name: &str) -> bool {
        self.links.read().await.contains_key(name)
    }

    async fn add_and_bring_up(&self, link: Link) -> bool {
        let name = link.name().to_string();
        if link.up().await.is_err() {
            return false;
        }

        let mut links = self.links.write().await;
        if links.contains_key(&name) {
            drop(links);
            warn!(site = %name, "duplicate registration lost the race, taking new link down");
            link.down().await;
            return false;
        }
        links.insert(name, link);
        true
    }

    async fn remove_and_take_down(&self, name: &str) -> bool {
        self.remove(name).await
    }
}

#[async_trait]
impl BundleSink for Reflector {
    /// Reflect a payload received on `source_link` out every other link.
    async fn forward(&self, source_link: &str, payload: Vec<u8>) {
        let targets: Vec<Link> = {
            let links = self.links.read().await;
            links
                .iter()
                .filter(|(name, _)| name.as_str() != source_link)
                .map(|(_, link)| link.clone())
                .collect()
        };

        for link in targets {
            link.reflect(payload.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::link::NullSink;

    fn idle_link(name: &str) -> Link {
        // Target is never contacted; the link stays Down.
        Link::new(LinkConfig::new(name, name, "127.0.0.1", 9), Arc::new(NullSink))
    }

    #[tokio::test]
    async fn registry_lookup_and_names() {
        let reflector = Reflector::new();
        assert!(reflector.is_empty().await);
        assert!(!reflector.contains_link_with_name("alpha").await);

        reflector.links.write().await.insert("alpha".to_string(), idle_link("alpha"));

        assert!(reflector.contains_link_with_name("alpha").await);
        assert_eq!(reflector.len().await, 1);
        assert_eq!(reflector.link("alpha").await.unwrap().name(), "alpha");
        assert!(reflector.link("beta").await.is_none());
    }

    #[tokio::test]
    async fn remove_unregisters() {
        let reflector = Reflector::new();
        reflector.links.write().await.insert("alpha".to_string(), idle_link("alpha"));

        assert!(reflector.remove("alpha").await);
        assert!(!reflector.remove("alpha").await);
        assert!(reflector.is_empty().await);
    }

    #[tokio::test]
    async fn reap_skips_durable_links() {
        let reflector = Reflector::new();
        // A Down but non-transient link must survive the reaper.
        reflector.links.write().await.insert("alpha".to_string(), idle_link("alpha"));

        assert_eq!(reflector.reap_terminal().await, 0);
        assert!(reflector.contains_link_with_name("alpha").await);
    }

    #[tokio::test]
    async fn reap_removes_terminal_transient_links() {
        let reflector = Reflector::new();
        let advert = crate::config::LinkAdvert::default();
        let config =
            LinkConfig::reverse_for(&advert, "alpha", "127.0.0.1:5000".parse().unwrap());
        let link = Link::reverse(config, Arc::new(NullSink));
        reflector.links.write().await.insert("alpha".to_string(), link);

        assert_eq!(reflector.reap_terminal().await, 1);
        assert!(!reflector.contains_link_with_name("alpha").await);
    }
}
