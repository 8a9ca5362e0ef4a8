use std::collections::HashMap;
use std::sync::Arc;

use crate::link::PeerLink;
use crate::protocol::LinkKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub kind: LinkKind,
    pub remote: String,
}

impl PoolKey {
    pub fn new(kind: LinkKind, remote: impl Into<String>) -> Self {
        Self {
            kind,
            remote: remote.into(),
        }
    }
}

/// Live peer links indexed by (link kind, remote id) and then link id.
#[derive(Default)]
pub struct LinkPool {
    links: HashMap<PoolKey, HashMap<String, Arc<dyn PeerLink>>>,
}

impl LinkPool {
    pub fn insert(&mut self, key: PoolKey, link: Arc<dyn PeerLink>) {
        self.links
            .entry(key)
            .or_default()
            .insert(link.id().to_string(), link);
    }

    pub fn get(&self, key: &PoolKey, link_id: &str) -> Option<Arc<dyn PeerLink>> {
        self.links.get(key)?.get(link_id).cloned()
    }

    pub fn remove(&mut self, key: &PoolKey, link_id: &str) -> Option<Arc<dyn PeerLink>> {
        let links = self.links.get_mut(key)?;
        let removed = links.remove(link_id);
        if links.is_empty() {
            self.links.remove(key);
        }
        removed
    }

    pub fn len(&self, key: &PoolKey) -> usize {
        self.links.get(key).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkFactory;
    use crate::link::mock::MockLinkFactory;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn keys_separate_kind_and_remote() {
        let factory = MockLinkFactory::legacy();
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = factory.create("pc_a", tx).await.expect("link");

        let mut pool = LinkPool::default();
        let data = PoolKey::new(LinkKind::Data, "bob");
        pool.insert(data.clone(), link);

        assert!(pool.get(&data, "pc_a").is_some());
        assert!(pool.get(&PoolKey::new(LinkKind::Media, "bob"), "pc_a").is_none());
        assert!(pool.get(&PoolKey::new(LinkKind::Data, "carol"), "pc_a").is_none());
        assert_eq!(pool.len(&data), 1);

        assert!(pool.remove(&data, "pc_a").is_some());
        assert!(pool.remove(&data, "pc_a").is_none());
        assert!(pool.is_empty());
    }
}
