//! Namespace network IDs, and whether a namespace is on the global (unisolated) network.

use eyre::{Result, format_err};
use log::debug;
use std::collections::BTreeMap as Map;

use crate::api::{GLOBAL_VNID, NetNamespace};

#[derive(Debug, Default)]
pub struct NetIds {
    ids: Map<String, u32>,
}
impl NetIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a NetNamespace. Returns true if the namespace's ID changed.
    pub fn apply(&mut self, netns: &NetNamespace) -> bool {
        let name = if netns.netname.is_empty() {
            let Some(name) = netns.metadata.name.clone() else {
                return false;
            };
            name
        } else {
            netns.netname.clone()
        };

        debug!("namespace {name:?} has network ID {}", netns.netid);
        self.ids.insert(name, netns.netid) != Some(netns.netid)
    }

    /// Forget a NetNamespace. Returns true if it was known.
    pub fn delete(&mut self, netns: &NetNamespace) -> bool {
        let name = if netns.netname.is_empty() {
            netns.metadata.name.as_deref().unwrap_or_default()
        } else {
            netns.netname.as_str()
        };
        self.ids.remove(name).is_some()
    }

    pub fn get(&self, namespace: &str) -> Option<u32> {
        self.ids.get(namespace).copied()
    }

    /// Whether the namespace is in the global network. Unknown namespaces are an error.
    pub fn is_global(&self, namespace: &str) -> Result<bool> {
        match self.ids.get(namespace) {
            Some(id) => Ok(*id == GLOBAL_VNID),
            None => Err(format_err!("no network ID for namespace {namespace:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn netns(name: &str, netid: u32) -> NetNamespace {
        serde_json::from_value(json!({
            "metadata": {"name": name},
            "netname": name,
            "netid": netid,
        }))
        .unwrap()
    }

    #[test]
    fn test_classify() {
        let mut ids = NetIds::new();

        assert!(ids.apply(&netns("default", GLOBAL_VNID)));
        assert!(ids.apply(&netns("ns1", 42)));
        assert!(!ids.apply(&netns("ns1", 42)));

        assert!(ids.is_global("default").unwrap());
        assert!(!ids.is_global("ns1").unwrap());
        assert!(ids.is_global("ns2").is_err());

        // joined to the global network
        assert!(ids.apply(&netns("ns1", GLOBAL_VNID)));
        assert!(ids.is_global("ns1").unwrap());

        assert!(ids.delete(&netns("ns1", GLOBAL_VNID)));
        assert!(!ids.delete(&netns("ns1", GLOBAL_VNID)));
        assert_eq!(ids.get("ns1"), None);
    }
}
